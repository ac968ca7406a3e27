//! Off-thread hostname resolution for SOCKS `CONNECT` targets.
//!
//! Resolution must never block the reactor thread, but `getaddrinfo`-equivalent lookups in Rust's
//! standard library (`ToSocketAddrs`) are themselves blocking. We spawn a one-shot thread per
//! lookup and hand the result back over an `mpsc` channel, waking the reactor with a
//! [`mio::Waker`] registered under [`crate::reactor::WAKER_TOKEN`] so the result is never stranded
//! until the next unrelated readiness event.
//!
//! A literal IP address is resolved synchronously and inline — no thread is spawned — since
//! parsing an IP literal cannot block.

use crate::conn::ConnId;
use crate::reactor::{Reactor, WAKER_TOKEN};
use std::io;
use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;

/// The outcome of one resolution request, tagged with the connection that asked for it.
pub struct ResolverEvent {
    pub conn_id: ConnId,
    pub result: io::Result<SocketAddr>,
}

pub struct Resolver {
    sender: mpsc::Sender<ResolverEvent>,
    receiver: mpsc::Receiver<ResolverEvent>,
    waker: Arc<mio::Waker>,
}

impl Resolver {
    pub fn new(reactor: &Reactor) -> crate::error::Result<Self> {
        let waker = mio::Waker::new(reactor.registry(), WAKER_TOKEN)
            .map_err(|e| crate::error::Error::reactor(format!("waker creation failed: {e}")))?;
        let (sender, receiver) = mpsc::channel();
        Ok(Self { sender, receiver, waker: Arc::new(waker) })
    }

    /// Resolve `host:port` for `conn_id`. Literal IPv4/IPv6 addresses complete before this
    /// function returns (the event is already queued); hostnames complete later on a background
    /// thread.
    pub fn resolve(&self, conn_id: ConnId, host: &str, port: u16) {
        if let Ok(ip) = host.parse::<IpAddr>() {
            self.deliver(ResolverEvent { conn_id, result: Ok(SocketAddr::new(ip, port)) });
            return;
        }
        let sender = self.sender.clone();
        let waker = Arc::clone(&self.waker);
        let host = host.to_string();
        thread::spawn(move || {
            let result = (host.as_str(), port)
                .to_socket_addrs()
                .and_then(|mut addrs| {
                    addrs
                        .next()
                        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no addresses returned"))
                });
            let _ = sender.send(ResolverEvent { conn_id, result });
            let _ = waker.wake();
        });
    }

    fn deliver(&self, event: ResolverEvent) {
        // Same-thread send to an unbounded channel cannot fail unless the receiver was dropped,
        // which only happens when the whole Resolver (and thus this Sender) is being torn down.
        let _ = self.sender.send(event);
        let _ = self.waker.wake();
    }

    /// Drain every resolution that has completed since the last drain. Called by the reactor loop
    /// after observing the shared waker fire.
    pub fn drain(&self) -> Vec<ResolverEvent> {
        self.receiver.try_iter().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reactor::Reactor;

    #[test]
    fn literal_ip_resolves_without_a_thread() {
        let reactor = Reactor::new().unwrap();
        let resolver = Resolver::new(&reactor).unwrap();
        resolver.resolve(ConnId::from_raw(1), "127.0.0.1", 9001);
        let events = resolver.drain();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].conn_id, ConnId::from_raw(1));
        assert_eq!(events[0].result.as_ref().unwrap(), &"127.0.0.1:9001".parse::<SocketAddr>().unwrap());
    }

    #[test]
    fn hostname_resolves_on_background_thread() {
        let reactor = Reactor::new().unwrap();
        let resolver = Resolver::new(&reactor).unwrap();
        resolver.resolve(ConnId::from_raw(7), "localhost", 9001);
        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(2);
        let mut events = Vec::new();
        while events.is_empty() && std::time::Instant::now() < deadline {
            events = resolver.drain();
            if events.is_empty() {
                std::thread::sleep(std::time::Duration::from_millis(10));
            }
        }
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].conn_id, ConnId::from_raw(7));
        assert!(events[0].result.is_ok());
    }
}
