//! Listener lifecycle: bind a local address, accept connections, and construct a fresh `Conn`
//! wired for whichever of the three acceptance flows the listener was configured with.

use crate::config::{ListenerConfig, ProxyMode};
use crate::conn::Conn;
use crate::error::{Error, Result};
use crate::protocol::ProtocolKind;
use crate::reactor::Reactor;
use mio::{Interest, Token};
use socket2::{Domain, Socket, Type};
use std::net::SocketAddr;

/// Opaque identifier for a live listener, analogous to `ConnId`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ListenerId(u64);

impl ListenerId {
    pub(crate) fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

pub struct Listener {
    acceptor: mio::net::TcpListener,
    token: Token,
    mode: ProxyMode,
    target_addr: Option<SocketAddr>,
    kind: ProtocolKind,
}

impl Listener {
    /// Bind `config.listen_addr` with `SO_REUSEADDR` set (matching the source's
    /// address-reusable/close-on-exec listener socket options; Rust's standard socket handling
    /// already gives close-on-exec and close-on-drop for free).
    pub fn bind(reactor: &mut Reactor, config: &ListenerConfig) -> Result<Self> {
        let domain = match config.listen_addr {
            SocketAddr::V4(_) => Domain::IPV4,
            SocketAddr::V6(_) => Domain::IPV6,
        };
        let socket = Socket::new(domain, Type::STREAM, None)
            .map_err(|e| Error::network(format!("socket() failed: {e}")))?;
        socket.set_reuse_address(true).map_err(|e| Error::network(format!("SO_REUSEADDR failed: {e}")))?;
        socket
            .bind(&config.listen_addr.into())
            .map_err(|e| Error::network(format!("bind({}) failed: {e}", config.listen_addr)))?;
        socket.listen(1024).map_err(|e| Error::network(format!("listen() failed: {e}")))?;
        socket.set_nonblocking(true).map_err(|e| Error::network(format!("set_nonblocking failed: {e}")))?;

        let mut acceptor = mio::net::TcpListener::from_std(socket.into());
        let token = reactor.next_token();
        reactor
            .register(&mut acceptor, token, Interest::READABLE)
            .map_err(|e| Error::network(format!("failed to register listener: {e}")))?;

        Ok(Self {
            acceptor,
            token,
            mode: config.mode,
            target_addr: config.target_addr,
            kind: config.protocol.to_kind(),
        })
    }

    pub fn token(&self) -> Token {
        self.token
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Stop accepting on this listener. Called when the runtime frees all listeners at shutdown.
    pub(crate) fn deregister(&mut self, reactor: &mut Reactor) -> Result<()> {
        reactor.deregister(&mut self.acceptor)
    }

    /// Accept every connection currently pending and construct a `Conn` for each, per this
    /// listener's mode. Stops at the first `WouldBlock`. A per-connection construction failure
    /// (e.g. the eager outbound connect failing immediately) is logged and skipped — it must
    /// never abort the accept loop for siblings still pending.
    pub fn accept_all(&mut self, reactor: &mut Reactor) -> Vec<Conn> {
        let mut accepted = Vec::new();
        loop {
            match self.acceptor.accept() {
                Ok((stream, peer)) => match self.build_conn(reactor, stream) {
                    Ok(conn) => accepted.push(conn),
                    Err(e) => tracing::warn!(error = %e, peer = %peer, "failed to construct connection for accepted socket"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => break,
                Err(e) => {
                    tracing::warn!(error = %e, "accept() failed");
                    break;
                }
            }
        }
        accepted
    }

    fn build_conn(&self, reactor: &mut Reactor, stream: std::net::TcpStream) -> Result<Conn> {
        match self.mode {
            ProxyMode::SimpleClient => {
                let target = self.target_addr.expect("validated at config load");
                Conn::new_simple_client(reactor, stream, target, &self.kind)
            }
            ProxyMode::SimpleServer => {
                let target = self.target_addr.expect("validated at config load");
                Conn::new_simple_server(reactor, stream, target, &self.kind)
            }
            ProxyMode::SocksClient => Conn::new_socks_client(reactor, stream, &self.kind),
        }
    }
}
