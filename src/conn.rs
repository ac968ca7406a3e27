//! The per-connection forwarding state machine.
//!
//! This is the heart of the proxy: one `Conn` per accepted socket, owning a pair of
//! [`BufferedStream`]s (`input`, `output`), a [`Protocol`] instance, and — while a SOCKS
//! handshake is in flight — a [`SocksState`]. Where the source this crate is modeled on swaps
//! bufferevent callback function pointers to encode state, `Conn` carries an explicit `Role` per
//! side and dispatches on it from [`Conn::on_event`]/[`Conn::on_readable`].

use crate::config::ProxyMode;
use crate::error::Error;
use crate::protocol::{Protocol, ProtocolKind, RecvOutcome};
use crate::reactor::{Reactor, Readiness};
use crate::socks::{self, SocksAddress, SocksOutcome, SocksState, SocksStatus};
use crate::stream::{BufferedStream, ReadOutcome};
use mio::Token;
use std::net::SocketAddr;
use tracing::{debug, warn};

/// Opaque, stable identifier for a live connection. `Runtime` hands these out; they are never
/// reused while the slot they named is still considered "recently freed" in debug builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnId(u64);

impl ConnId {
    pub fn from_raw(raw: u64) -> Self {
        Self(raw)
    }
}

/// Which physical stream of a `Conn` an event or read-readiness notification applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Input,
    Output,
}

impl Side {
    fn other(self) -> Side {
        match self {
            Side::Input => Side::Output,
            Side::Output => Side::Input,
        }
    }
}

/// What a `Conn`'s read/event handling currently does with a given side, replacing the source's
/// callback-pointer swapping with an explicit, matched-on state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Role {
    /// Plaintext arrives here; forward it through `Protocol::send` (obfuscate) into the peer.
    Upstream,
    /// Obfuscated bytes arrive here; forward them through `Protocol::recv` (deobfuscate) into the
    /// peer.
    Downstream,
    /// `input` only, while a SOCKS handshake is still being negotiated.
    SocksInput,
    /// `output` only, from the moment the outbound connect is initiated until it resolves.
    SocksOutput,
    /// Draining a final write before `close_conn`; reads are never expected in this role.
    RepliedAndDraining,
}

/// What `Runtime` should do after a `Conn` method returns.
#[derive(Debug)]
pub enum ConnOutcome {
    /// Nothing further needed right now.
    Continue,
    /// Tear the connection down immediately (`Runtime::close_conn`).
    Close,
    /// A SOCKS `CONNECT` target was parsed; `Runtime` must resolve `(address, port)` (possibly
    /// asynchronously) and then call [`Conn::begin_socks_outbound_connect`].
    AttachOutbound { address: SocksAddress, port: u16 },
}

pub struct Conn {
    mode: ProxyMode,
    proto: Box<dyn Protocol + Send>,
    socks_state: Option<SocksState>,
    input: BufferedStream,
    output: Option<BufferedStream>,
    is_open: bool,
    flushing: bool,
    role_input: Role,
    role_output: Role,
}

impl Conn {
    /// SimpleClient: local plaintext app -> proxy -> obfuscated wire at `target_addr`.
    pub fn new_simple_client(
        reactor: &mut Reactor,
        accepted: std::net::TcpStream,
        target_addr: SocketAddr,
        kind: &ProtocolKind,
    ) -> crate::error::Result<Self> {
        let input = BufferedStream::from_accepted(reactor, accepted)?;
        let mut output = BufferedStream::connect(reactor, target_addr)?;
        let mut proto = kind.create();
        proto.handshake(&mut output.write_buf)?;
        output.set_interest(reactor, true, true)?;
        Ok(Self {
            mode: ProxyMode::SimpleClient,
            proto,
            socks_state: None,
            input,
            output: Some(output),
            is_open: false,
            flushing: false,
            role_input: Role::Upstream,
            role_output: Role::Downstream,
        })
    }

    /// SimpleServer: obfuscated wire -> proxy -> local plaintext app at `target_addr`. Structurally
    /// identical to `SimpleClient`, with the forwarding roles swapped and the handshake queued
    /// into `input`'s write buffer instead of `output`'s (it must be emitted back on the inbound
    /// obfuscated channel, not the plaintext outbound one — preserved verbatim from the source).
    pub fn new_simple_server(
        reactor: &mut Reactor,
        accepted: std::net::TcpStream,
        target_addr: SocketAddr,
        kind: &ProtocolKind,
    ) -> crate::error::Result<Self> {
        let mut input = BufferedStream::from_accepted(reactor, accepted)?;
        let mut output = BufferedStream::connect(reactor, target_addr)?;
        let mut proto = kind.create();
        proto.handshake(&mut input.write_buf)?;
        output.set_interest(reactor, true, true)?;
        Ok(Self {
            mode: ProxyMode::SimpleServer,
            proto,
            socks_state: None,
            input,
            output: Some(output),
            is_open: false,
            flushing: false,
            role_input: Role::Downstream,
            role_output: Role::Upstream,
        })
    }

    /// SocksClient: local SOCKS client -> proxy -> obfuscated wire to a dynamically chosen peer.
    /// `output` is not created yet; the target is unknown until the SOCKS handshake yields one.
    pub fn new_socks_client(
        reactor: &mut Reactor,
        accepted: std::net::TcpStream,
        kind: &ProtocolKind,
    ) -> crate::error::Result<Self> {
        let mut input = BufferedStream::from_accepted(reactor, accepted)?;
        input.set_interest(reactor, true, false)?;
        Ok(Self {
            mode: ProxyMode::SocksClient,
            proto: kind.create(),
            socks_state: Some(SocksState::new()),
            input,
            output: None,
            is_open: false,
            flushing: false,
            role_input: Role::SocksInput,
            role_output: Role::RepliedAndDraining, // unused until output exists
        })
    }

    pub fn mode(&self) -> ProxyMode {
        self.mode
    }

    pub fn input_token(&self) -> Token {
        self.input.token()
    }

    pub fn output_token(&self) -> Option<Token> {
        self.output.as_ref().map(|o| o.token())
    }

    /// Deregister both streams from the poll registry. Must be called by the runtime before a
    /// connection is dropped from its registry — see `BufferedStream::close`.
    pub fn close(&mut self, reactor: &mut Reactor) {
        self.input.close(reactor);
        if let Some(output) = self.output.as_mut() {
            output.close(reactor);
        }
    }

    fn stream(&self, side: Side) -> &BufferedStream {
        match side {
            Side::Input => &self.input,
            Side::Output => self.output.as_ref().expect("output stream accessed before creation"),
        }
    }

    fn stream_mut(&mut self, side: Side) -> &mut BufferedStream {
        match side {
            Side::Input => &mut self.input,
            Side::Output => self.output.as_mut().expect("output stream accessed before creation"),
        }
    }

    fn role(&self, side: Side) -> Role {
        match side {
            Side::Input => self.role_input,
            Side::Output => self.role_output,
        }
    }

    fn set_role(&mut self, side: Side, role: Role) {
        match side {
            Side::Input => self.role_input = role,
            Side::Output => self.role_output = role,
        }
    }

    fn set_interest(&mut self, reactor: &mut Reactor, side: Side, read: bool, write: bool) -> crate::error::Result<()> {
        self.stream_mut(side).set_interest(reactor, read, write)
    }

    /// Dispatch one `mio` readiness notification for `side`. Mirrors the source's
    /// `input_event`/`output_event`/`socks_event` trio, folded into a single function that
    /// switches on `Role` instead of a swapped function pointer.
    pub fn on_event(&mut self, reactor: &mut Reactor, side: Side, readiness: &Readiness) -> ConnOutcome {
        if readiness.error || readiness.hangup {
            return self.handle_error_or_hangup(reactor, side);
        }
        if readiness.writable {
            match self.on_writable(reactor, side) {
                ConnOutcome::Continue => {}
                other => return other,
            }
        }
        if readiness.readable {
            return self.on_readable(reactor, side);
        }
        ConnOutcome::Continue
    }

    fn handle_error_or_hangup(&mut self, reactor: &mut Reactor, side: Side) -> ConnOutcome {
        if let Some(outcome) = self.try_confirm_connect(reactor, side) {
            return outcome;
        }
        self.error_or_eof(reactor, side)
    }

    /// If `side` is `Output` and still mid-connect, resolve it now and return the follow-up
    /// outcome. Returns `None` when there was nothing to confirm, so the caller falls through to
    /// its own normal handling.
    fn try_confirm_connect(&mut self, reactor: &mut Reactor, side: Side) -> Option<ConnOutcome> {
        if side != Side::Output || !self.output.as_ref().is_some_and(|o| o.is_connecting()) {
            return None;
        }
        Some(match self.output.as_mut().expect("just checked").confirm_connect() {
            Ok(()) => self.on_connect_succeeded(reactor),
            Err(e) => self.on_connect_failed(reactor, e),
        })
    }

    fn on_writable(&mut self, reactor: &mut Reactor, side: Side) -> ConnOutcome {
        if let Some(outcome) = self.try_confirm_connect(reactor, side) {
            return outcome;
        }
        let _ = self.stream_mut(side).pump_write();
        if self.role(side) == Role::RepliedAndDraining && !self.stream(side).has_pending_write() {
            return ConnOutcome::Close;
        }
        ConnOutcome::Continue
    }

    fn on_readable(&mut self, reactor: &mut Reactor, side: Side) -> ConnOutcome {
        match self.role(side) {
            Role::Upstream => self.forward_send(reactor, side),
            Role::Downstream => self.forward_recv(reactor, side),
            Role::SocksInput => self.socks_read(reactor),
            Role::SocksOutput => ConnOutcome::Continue, // no reads expected before Connected
            Role::RepliedAndDraining => ConnOutcome::Continue,
        }
    }

    /// Pull bytes off `side` and pump them through `Protocol::send` into the peer's write buffer
    /// (obfuscation on the way to the wire). Covers the source's `upstream_read`.
    fn forward_send(&mut self, reactor: &mut Reactor, side: Side) -> ConnOutcome {
        match self.stream_mut(side).pump_read() {
            Ok(ReadOutcome::Progress) => {}
            Ok(ReadOutcome::WouldBlock) => return ConnOutcome::Continue,
            Ok(ReadOutcome::Eof) => return self.error_or_eof(reactor, side),
            Err(e) => {
                warn!(error = %e, "read error on forwarding side");
                return self.error_or_eof(reactor, side);
            }
        }
        let result = match side {
            Side::Input => {
                let output = self.output.as_mut().expect("upstream role implies output exists");
                self.proto.send(&mut self.input.read_buf, &mut output.write_buf)
            }
            Side::Output => {
                let output = self.output.as_mut().expect("upstream role implies output exists");
                self.proto.send(&mut output.read_buf, &mut self.input.write_buf)
            }
        };
        if let Err(e) = result {
            let err = Error::protocol(format!("send transform failed: {e}"));
            warn!(error = %err, "closing connection after protocol error");
            return ConnOutcome::Close;
        }
        let _ = self.stream_mut(side.other()).pump_write();
        ConnOutcome::Continue
    }

    /// Pull bytes off `side` and pump them through `Protocol::recv` into the peer's write buffer
    /// (de-obfuscation on the way in from the wire). Covers the source's `downstream_read`.
    fn forward_recv(&mut self, reactor: &mut Reactor, side: Side) -> ConnOutcome {
        match self.stream_mut(side).pump_read() {
            Ok(ReadOutcome::Progress) => {}
            Ok(ReadOutcome::WouldBlock) => return ConnOutcome::Continue,
            Ok(ReadOutcome::Eof) => return self.error_or_eof(reactor, side),
            Err(e) => {
                warn!(error = %e, "read error on forwarding side");
                return self.error_or_eof(reactor, side);
            }
        }
        let recv_result = match side {
            Side::Input => {
                let output = self.output.as_mut().expect("downstream role implies output exists");
                self.proto.recv(&mut self.input.read_buf, &mut output.write_buf)
            }
            Side::Output => {
                let output = self.output.as_mut().expect("downstream role implies output exists");
                self.proto.recv(&mut output.read_buf, &mut self.input.write_buf)
            }
        };
        match recv_result {
            Ok(RecvOutcome::Ok) => {}
            Ok(RecvOutcome::SendPending) => {
                let output = self.output.as_mut().expect("downstream role implies output exists");
                let _ = self.proto.send(&mut self.input.read_buf, &mut output.write_buf);
            }
            Err(e) => {
                let err = Error::protocol(format!("recv transform failed: {e}"));
                warn!(error = %err, "closing connection after protocol error");
                return ConnOutcome::Close;
            }
        }
        let _ = self.stream_mut(side.other()).pump_write();
        ConnOutcome::Continue
    }

    /// Drive the SOCKS parser to completion for whatever is currently buffered. Panics if
    /// re-entered after the reply has already been sent (invariant violation per the design).
    fn socks_read(&mut self, reactor: &mut Reactor) -> ConnOutcome {
        loop {
            let state = self.socks_state.as_mut().expect("SocksInput role implies socks_state is present");
            assert_ne!(state.status(), SocksStatus::SentReply, "socks_read re-entered after reply sent");

            match socks::handle_socks(&mut self.input.read_buf, &mut self.input.write_buf, state) {
                SocksOutcome::Good => {
                    if state.status() == SocksStatus::HaveAddr {
                        let (address, port) = state.address().expect("HaveAddr implies an address");
                        let address = address.clone();
                        if let Err(e) = self.set_interest(reactor, Side::Input, false, false) {
                            warn!(error = %e, "failed to disable input interest before outbound connect");
                        }
                        return ConnOutcome::AttachOutbound { address, port };
                    }
                    continue;
                }
                SocksOutcome::Incomplete => return ConnOutcome::Continue,
                SocksOutcome::Broken => {
                    let err = Error::socks("malformed SOCKS request");
                    debug!(error = %err, "closing without a reply");
                    return ConnOutcome::Close;
                }
                SocksOutcome::CmdNotConnect => {
                    if let Err(e) = self.set_interest(reactor, Side::Input, false, true) {
                        warn!(error = %e, "failed to switch input to write-only for SOCKS reply");
                    }
                    let state = self.socks_state.as_mut().expect("present");
                    socks::socks5_send_reply(&mut self.input.write_buf, state, socks::SOCKS5_REP_COMMAND_NOT_SUPPORTED);
                    self.role_input = Role::RepliedAndDraining;
                    let _ = self.input.pump_write();
                    return ConnOutcome::Continue;
                }
            }
        }
    }

    /// Called by `Runtime` once a SOCKS `CONNECT` target has resolved to a concrete address
    /// (synchronously for literals, asynchronously via the resolver for hostnames).
    pub fn begin_socks_outbound_connect(&mut self, reactor: &mut Reactor, target: SocketAddr) -> ConnOutcome {
        let mut output = match BufferedStream::connect(reactor, target) {
            Ok(output) => output,
            Err(e) => {
                warn!(error = %e, "outbound connect failed immediately");
                return self.fail_socks_connect(reactor, None);
            }
        };
        if let Err(e) = self.proto.handshake(&mut output.write_buf) {
            let err = Error::protocol(format!("handshake failed: {e}"));
            warn!(error = %err, "protocol handshake failed while attaching outbound socket");
            return self.fail_socks_connect(reactor, None);
        }
        if let Err(e) = output.set_interest(reactor, true, true) {
            warn!(error = %e, "failed to enable interest on freshly connected outbound socket");
            return self.fail_socks_connect(reactor, None);
        }
        self.output = Some(output);
        self.role_output = Role::SocksOutput;
        ConnOutcome::Continue
    }

    /// Resolution itself failed (DNS lookup error) before a connect was ever attempted.
    pub fn fail_socks_resolution(&mut self, reactor: &mut Reactor) -> ConnOutcome {
        self.fail_socks_connect(reactor, None)
    }

    fn fail_socks_connect(&mut self, reactor: &mut Reactor, _source: Option<std::io::Error>) -> ConnOutcome {
        if let Err(e) = self.set_interest(reactor, Side::Input, false, true) {
            warn!(error = %e, "failed to switch input to write-only after outbound connect failure");
        }
        if let Some(state) = self.socks_state.as_mut() {
            socks::send_reply(&mut self.input.write_buf, state, false);
        }
        self.socks_state = None;
        self.role_input = Role::RepliedAndDraining;
        let _ = self.input.pump_write();
        ConnOutcome::Continue
    }

    fn on_connect_succeeded(&mut self, reactor: &mut Reactor) -> ConnOutcome {
        if self.role_output == Role::SocksOutput {
            let local_addr = match self.output.as_ref().expect("SocksOutput implies output exists").local_addr() {
                Ok(addr) => addr,
                Err(e) => {
                    warn!(error = %e, "failed to read local address of connected outbound socket");
                    return self.fail_socks_connect(reactor, Some(e));
                }
            };
            if let Some(state) = self.socks_state.as_mut() {
                state.set_bound_addr(local_addr);
                socks::send_reply(&mut self.input.write_buf, state, true);
            }
            self.socks_state = None;
            self.role_input = Role::Upstream;
            self.role_output = Role::Downstream;

            if !self.input.read_buf.is_empty() {
                if let ConnOutcome::Close = self.forward_recv(reactor, Side::Input) {
                    return ConnOutcome::Close;
                }
            }
        }

        self.is_open = true;
        if let Err(e) = self.set_interest(reactor, Side::Input, true, true) {
            warn!(error = %e, "failed to enable interest on input after outbound connect");
        }
        let _ = self.output.as_mut().expect("connect succeeded implies output exists").pump_write();
        let _ = self.input.pump_write();
        ConnOutcome::Continue
    }

    fn on_connect_failed(&mut self, reactor: &mut Reactor, error: std::io::Error) -> ConnOutcome {
        warn!(error = %error, "outbound connect failed");
        if self.role_output == Role::SocksOutput {
            return self.fail_socks_connect(reactor, Some(error));
        }
        ConnOutcome::Close
    }

    /// The unified half-close primitive: `errored` has seen EOF/error, so drain whatever
    /// `flush_side` still has queued before closing, unless there is nothing to flush or the
    /// connection never fully opened.
    fn error_or_eof(&mut self, reactor: &mut Reactor, errored: Side) -> ConnOutcome {
        if self.flushing || !self.is_open {
            return ConnOutcome::Close;
        }
        let flush_side = errored.other();
        if !self.stream(flush_side).has_pending_write() {
            return ConnOutcome::Close;
        }
        self.flushing = true;
        if let Err(e) = self.set_interest(reactor, errored, false, false) {
            warn!(error = %e, "failed to disable interest on errored side");
        }
        if let Err(e) = self.set_interest(reactor, flush_side, false, true) {
            warn!(error = %e, "failed to switch surviving side to write-only for flush");
        }
        self.set_role(flush_side, Role::RepliedAndDraining);
        ConnOutcome::Continue
    }
}
