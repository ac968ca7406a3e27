//! Process-wide registry of live listeners and connections, plus shutdown orchestration.
//!
//! This is the `Runtime` the design notes call for in place of the source's two module-scoped,
//! lazily-created sets (`listeners`, `connections`) and a bare `shutting_down` boolean: a single
//! struct, owned by the hosting binary, that the reactor loop drives one readiness batch at a
//! time.

use crate::config::ListenerConfig;
use crate::conn::{Conn, ConnId, ConnOutcome, Side};
use crate::error::Result;
use crate::listener::{Listener, ListenerId};
use crate::reactor::{Reactor, WAKER_TOKEN};
use crate::resolver::Resolver;
use crate::socks::SocksAddress;
use mio::Token;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Shared with the signal-handling thread the hosting binary spawns. `requested` is cleared by
/// the reactor thread once observed; `barbaric` is read alongside it and left as-is (the next
/// request fully overwrites it).
#[derive(Default)]
pub struct ShutdownRequest {
    requested: AtomicBool,
    barbaric: AtomicBool,
}

impl ShutdownRequest {
    pub fn request(&self, barbaric: bool) {
        self.barbaric.store(barbaric, Ordering::SeqCst);
        self.requested.store(true, Ordering::SeqCst);
    }

    fn take(&self) -> Option<bool> {
        if self.requested.swap(false, Ordering::SeqCst) {
            Some(self.barbaric.load(Ordering::SeqCst))
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    Listener(ListenerId),
    Conn(ConnId, Side),
}

pub struct Runtime {
    listeners: HashMap<ListenerId, Listener>,
    connections: HashMap<ConnId, Conn>,
    token_routes: HashMap<Token, Route>,
    resolver: Resolver,
    shutdown_request: Arc<ShutdownRequest>,
    shutting_down: bool,
    next_listener_id: u64,
    next_conn_id: u64,
}

impl Runtime {
    pub fn new(reactor: &Reactor) -> Result<Self> {
        Ok(Self {
            listeners: HashMap::new(),
            connections: HashMap::new(),
            token_routes: HashMap::new(),
            resolver: Resolver::new(reactor)?,
            shutdown_request: Arc::new(ShutdownRequest::default()),
            shutting_down: false,
            next_listener_id: 0,
            next_conn_id: 0,
        })
    }

    /// A shared handle a signal-handling thread can use to request shutdown and wake the reactor,
    /// without needing direct (unsynchronized) access to `Runtime` itself.
    pub fn shutdown_request(&self) -> Arc<ShutdownRequest> {
        Arc::clone(&self.shutdown_request)
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }

    pub fn listener_count(&self) -> usize {
        self.listeners.len()
    }

    /// The address a listener actually bound to — useful when `listen_addr` used port `0`.
    pub fn listener_local_addr(&self, id: ListenerId) -> Option<SocketAddr> {
        self.listeners.get(&id).and_then(|l| l.local_addr().ok())
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down
    }

    pub fn listener_new(&mut self, reactor: &mut Reactor, config: &ListenerConfig) -> Result<ListenerId> {
        let listener = Listener::bind(reactor, config)?;
        let id = ListenerId::from_raw(self.next_listener_id);
        self.next_listener_id += 1;
        self.token_routes.insert(listener.token(), Route::Listener(id));
        info!(addr = %config.listen_addr, mode = ?config.mode, "listener bound");
        self.listeners.insert(id, listener);
        Ok(id)
    }

    pub fn free_all_listeners(&mut self, reactor: &mut Reactor) {
        for (_, mut listener) in self.listeners.drain() {
            self.token_routes.remove(&listener.token());
            if let Err(e) = listener.deregister(reactor) {
                warn!(error = %e, "failed to deregister listener during shutdown");
            }
        }
        info!("all listeners freed; no longer accepting new connections");
    }

    /// Route one readiness notification from `reactor.poll_once`.
    pub fn dispatch(&mut self, reactor: &mut Reactor, readiness: crate::reactor::Readiness) {
        if readiness.token == WAKER_TOKEN {
            self.drain_resolver(reactor);
            self.service_shutdown_request(reactor);
            return;
        }
        match self.token_routes.get(&readiness.token).copied() {
            Some(Route::Listener(id)) => self.accept_on_listener(reactor, id),
            Some(Route::Conn(id, side)) => self.dispatch_conn_event(reactor, id, side, &readiness),
            None => debug!(token = ?readiness.token, "readiness event for an unknown token"),
        }
    }

    fn accept_on_listener(&mut self, reactor: &mut Reactor, id: ListenerId) {
        let Some(listener) = self.listeners.get_mut(&id) else { return };
        for conn in listener.accept_all(reactor) {
            self.insert_conn(conn);
        }
    }

    fn insert_conn(&mut self, conn: Conn) -> ConnId {
        let id = ConnId::from_raw(self.next_conn_id);
        self.next_conn_id += 1;
        self.token_routes.insert(conn.input_token(), Route::Conn(id, Side::Input));
        if let Some(token) = conn.output_token() {
            self.token_routes.insert(token, Route::Conn(id, Side::Output));
        }
        self.connections.insert(id, conn);
        debug!(connections = self.connections.len(), "connection accepted");
        id
    }

    fn dispatch_conn_event(&mut self, reactor: &mut Reactor, id: ConnId, side: Side, readiness: &crate::reactor::Readiness) {
        let Some(conn) = self.connections.get_mut(&id) else { return };
        let outcome = conn.on_event(reactor, side, readiness);
        self.handle_outcome(reactor, id, outcome);
    }

    fn handle_outcome(&mut self, reactor: &mut Reactor, id: ConnId, outcome: ConnOutcome) {
        match outcome {
            ConnOutcome::Continue => {}
            ConnOutcome::Close => self.close_conn(reactor, id),
            ConnOutcome::AttachOutbound { address, port } => self.begin_attach_outbound(reactor, id, address, port),
        }
    }

    fn begin_attach_outbound(&mut self, reactor: &mut Reactor, id: ConnId, address: SocksAddress, port: u16) {
        match address {
            SocksAddress::Ip(ip) => self.finish_attach_outbound(reactor, id, Ok(SocketAddr::new(ip, port))),
            SocksAddress::Domain(host) => self.resolver.resolve(id, &host, port),
        }
    }

    fn drain_resolver(&mut self, reactor: &mut Reactor) {
        for event in self.resolver.drain() {
            self.finish_attach_outbound(reactor, event.conn_id, event.result);
        }
    }

    fn finish_attach_outbound(&mut self, reactor: &mut Reactor, id: ConnId, result: std::io::Result<SocketAddr>) {
        let Some(conn) = self.connections.get_mut(&id) else { return };
        let outcome = match result {
            Ok(addr) => conn.begin_socks_outbound_connect(reactor, addr),
            Err(e) => {
                warn!(error = %e, "SOCKS target resolution failed");
                conn.fail_socks_resolution(reactor)
            }
        };
        if let Some(token) = conn.output_token() {
            self.token_routes.insert(token, Route::Conn(id, Side::Output));
        }
        self.handle_outcome(reactor, id, outcome);
    }

    /// Remove `id` from the registry, deregistering its streams from the poll registry before
    /// dropping it, and route its token(s) out of the side-table.
    pub fn close_conn(&mut self, reactor: &mut Reactor, id: ConnId) {
        if let Some(mut conn) = self.connections.remove(&id) {
            self.token_routes.remove(&conn.input_token());
            if let Some(token) = conn.output_token() {
                self.token_routes.remove(&token);
            }
            conn.close(reactor);
            debug!(connections = self.connections.len(), "connection closed");
        }
    }

    /// Tear down every live connection directly, bypassing `close_conn` (no per-connection removal
    /// from a map being walked).
    fn close_all_connections(&mut self, reactor: &mut Reactor) {
        for conn in self.connections.values_mut() {
            self.token_routes.remove(&conn.input_token());
            if let Some(token) = conn.output_token() {
                self.token_routes.remove(&token);
            }
            conn.close(reactor);
        }
        let count = self.connections.len();
        self.connections.clear();
        if count > 0 {
            info!(count, "barbaric shutdown closed all live connections");
        }
    }

    /// Latch shutdown; on `barbaric`, tear every connection down immediately. Idempotent with
    /// respect to the latch itself, but a later barbaric request still forces teardown even if a
    /// graceful shutdown was already in progress (this is how the hosting binary escalates after
    /// a drain timeout).
    pub fn start_shutdown(&mut self, reactor: &mut Reactor, barbaric: bool) {
        if !self.shutting_down {
            info!(barbaric, "shutdown requested");
            self.shutting_down = true;
        }
        if barbaric {
            self.close_all_connections(reactor);
        }
    }

    fn service_shutdown_request(&mut self, reactor: &mut Reactor) {
        if let Some(barbaric) = self.shutdown_request.take() {
            self.start_shutdown(reactor, barbaric);
            self.free_all_listeners(reactor);
        }
    }

    /// Drive the reactor until shutdown has been requested and every connection has drained (or
    /// been torn down). There is no separate `finish_shutdown` callback to invoke: returning from
    /// this function *is* that hook, since the hosting binary already blocks here and can do
    /// whatever cleanup it needs immediately afterward.
    pub fn run(&mut self, reactor: &mut Reactor) -> Result<()> {
        loop {
            let events = reactor.poll_once()?;
            for readiness in events {
                self.dispatch(reactor, readiness);
            }
            if self.shutting_down && self.connections.is_empty() {
                info!("shutdown complete");
                return Ok(());
            }
        }
    }
}
