//! A minimal SOCKS4(a)/SOCKS5 wire parser and reply builder.
//!
//! There is no upstream SOCKS implementation in this codebase's lineage to adapt, so this module
//! is written directly against the SOCKS4/4a convention and RFC 1928/1929 (SOCKS5), scoped to
//! exactly what a `CONNECT`-only proxy needs: parse a client's target address, and on completion
//! (success or failure) write back the matching reply. Everything else — PASSWORD auth, BIND,
//! UDP ASSOCIATE — is recognized only far enough to reject it cleanly.

use crate::buffer::Buffer;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};

/// Result of one `handle_socks` call. The caller loops on `Good` and stops on anything else.
#[derive(Debug, PartialEq, Eq)]
pub enum SocksOutcome {
    /// Made progress; call again (another unit may already be buffered, or the status may have
    /// advanced to `HaveAddr`).
    Good,
    /// Not enough bytes buffered yet to parse the current unit.
    Incomplete,
    /// Malformed input; the connection cannot be salvaged.
    Broken,
    /// A well-formed request for a command other than CONNECT.
    CmdNotConnect,
}

/// Where a `SocksState` is in its negotiation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SocksStatus {
    Init,
    HaveAddr,
    SentReply,
}

/// Address family of a parsed target, as the caller will need it for `getaddrinfo`-style
/// resolution.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocksAddress {
    Ip(IpAddr),
    Domain(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Version {
    V4,
    V5,
}

/// Internal parse stage. Not exposed; callers only ever observe `SocksStatus`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    AwaitVersion,
    V5AwaitGreeting,
    V5AwaitRequest,
    V4AwaitRequest,
    Done,
}

/// Per-connection SOCKS negotiation state, owned by a `Conn` only until it reaches
/// `SocksStatus::SentReply`.
#[derive(Debug)]
pub struct SocksState {
    stage: Stage,
    version: Option<Version>,
    status: SocksStatus,
    command: Option<u8>,
    address: Option<SocksAddress>,
    port: u16,
    /// The locally observed address of the outbound socket, supplied by the caller once the
    /// forwarding connection is established, so the reply can echo it back (`BND.ADDR`).
    bound_addr: Option<SocketAddr>,
}

const SOCKS5_VERSION: u8 = 0x05;
const SOCKS4_VERSION: u8 = 0x04;
const CMD_CONNECT: u8 = 0x01;

const SOCKS5_ATYP_IPV4: u8 = 0x01;
const SOCKS5_ATYP_DOMAIN: u8 = 0x03;
const SOCKS5_ATYP_IPV6: u8 = 0x04;

pub const SOCKS5_REP_SUCCEEDED: u8 = 0x00;
pub const SOCKS5_REP_GENERAL_FAILURE: u8 = 0x01;
pub const SOCKS5_REP_COMMAND_NOT_SUPPORTED: u8 = 0x07;

const SOCKS4_REP_GRANTED: u8 = 0x5A;
const SOCKS4_REP_REJECTED: u8 = 0x5B;

impl SocksState {
    pub fn new() -> Self {
        Self {
            stage: Stage::AwaitVersion,
            version: None,
            status: SocksStatus::Init,
            command: None,
            address: None,
            port: 0,
            bound_addr: None,
        }
    }

    pub fn status(&self) -> SocksStatus {
        self.status
    }

    /// The parsed target, valid once `status() == HaveAddr` (or later).
    pub fn address(&self) -> Option<(&SocksAddress, u16)> {
        self.address.as_ref().map(|a| (a, self.port))
    }

    /// Record the locally observed address of the outbound socket, for the positive reply's
    /// `BND.ADDR`/`BND.PORT`. Matches the conventional SOCKS proxy behavior of echoing the
    /// address it used to reach the target, i.e. the outbound socket's own local address.
    pub fn set_bound_addr(&mut self, addr: SocketAddr) {
        self.bound_addr = Some(addr);
    }

    fn version(&self) -> Version {
        self.version.unwrap_or(Version::V5)
    }
}

impl Default for SocksState {
    fn default() -> Self {
        Self::new()
    }
}

/// Drive the parser forward by as much as `in_buf` currently allows. Does not write a reply;
/// callers emit one explicitly via [`send_reply`] or [`socks5_send_reply`] once negotiation
/// reaches a terminal outcome. `out_buf` is accepted for symmetry with the capability set in the
/// design notes but is currently unused by the parser itself (method-selection replies are
/// written here since RFC 1928 requires them before the request can be read).
pub fn handle_socks(in_buf: &mut Buffer, out_buf: &mut Buffer, state: &mut SocksState) -> SocksOutcome {
    // The version byte is the first byte of whatever comes next (the SOCKS5 greeting or the
    // SOCKS4 request), so recognizing it costs no bytes and falls straight through to parsing
    // the real unit in the same call.
    if state.stage == Stage::AwaitVersion {
        let data = in_buf.readable();
        if data.is_empty() {
            return SocksOutcome::Incomplete;
        }
        match data[0] {
            SOCKS4_VERSION => {
                state.version = Some(Version::V4);
                state.stage = Stage::V4AwaitRequest;
            }
            SOCKS5_VERSION => {
                state.version = Some(Version::V5);
                state.stage = Stage::V5AwaitGreeting;
            }
            _ => return SocksOutcome::Broken,
        }
    }

    match state.stage {
        Stage::AwaitVersion => unreachable!("resolved above"),
        Stage::V5AwaitGreeting => parse_v5_greeting(in_buf, out_buf, state),
        Stage::V5AwaitRequest => parse_v5_request(in_buf, state),
        Stage::V4AwaitRequest => parse_v4_request(in_buf, state),
        Stage::Done => SocksOutcome::Broken,
    }
}

fn parse_v5_greeting(in_buf: &mut Buffer, out_buf: &mut Buffer, state: &mut SocksState) -> SocksOutcome {
    let data = in_buf.readable();
    if data.len() < 2 {
        return SocksOutcome::Incomplete;
    }
    let nmethods = data[1] as usize;
    if data.len() < 2 + nmethods {
        return SocksOutcome::Incomplete;
    }
    in_buf.advance_read(2 + nmethods);
    // We only ever offer "no authentication required"; a client that demands auth is simply
    // handed a method-selection reply it will reject on its own.
    out_buf.extend(&[SOCKS5_VERSION, 0x00]);
    state.stage = Stage::V5AwaitRequest;
    SocksOutcome::Good
}

fn parse_v5_request(in_buf: &mut Buffer, state: &mut SocksState) -> SocksOutcome {
    let data = in_buf.readable();
    if data.len() < 4 {
        return SocksOutcome::Incomplete;
    }
    if data[0] != SOCKS5_VERSION {
        return SocksOutcome::Broken;
    }
    let cmd = data[1];
    let atyp = data[3];

    let (address, port, total_len) = match atyp {
        SOCKS5_ATYP_IPV4 => {
            if data.len() < 4 + 4 + 2 {
                return SocksOutcome::Incomplete;
            }
            let ip = Ipv4Addr::new(data[4], data[5], data[6], data[7]);
            let port = u16::from_be_bytes([data[8], data[9]]);
            (SocksAddress::Ip(IpAddr::V4(ip)), port, 4 + 4 + 2)
        }
        SOCKS5_ATYP_DOMAIN => {
            if data.len() < 5 {
                return SocksOutcome::Incomplete;
            }
            let domain_len = data[4] as usize;
            let total = 5 + domain_len + 2;
            if data.len() < total {
                return SocksOutcome::Incomplete;
            }
            let domain = match std::str::from_utf8(&data[5..5 + domain_len]) {
                Ok(s) => s.to_string(),
                Err(_) => return SocksOutcome::Broken,
            };
            let port = u16::from_be_bytes([data[5 + domain_len], data[6 + domain_len]]);
            (SocksAddress::Domain(domain), port, total)
        }
        SOCKS5_ATYP_IPV6 => {
            if data.len() < 4 + 16 + 2 {
                return SocksOutcome::Incomplete;
            }
            let mut octets = [0u8; 16];
            octets.copy_from_slice(&data[4..20]);
            let port = u16::from_be_bytes([data[20], data[21]]);
            (SocksAddress::Ip(IpAddr::V6(Ipv6Addr::from(octets))), port, 4 + 16 + 2)
        }
        _ => return SocksOutcome::Broken,
    };

    in_buf.advance_read(total_len);
    state.command = Some(cmd);
    state.address = Some(address);
    state.port = port;
    state.stage = Stage::Done;
    if cmd == CMD_CONNECT {
        state.status = SocksStatus::HaveAddr;
        SocksOutcome::Good
    } else {
        SocksOutcome::CmdNotConnect
    }
}

fn parse_v4_request(in_buf: &mut Buffer, state: &mut SocksState) -> SocksOutcome {
    let data = in_buf.readable();
    // VER(1) CMD(1) PORT(2) IP(4) USERID\0 [ DOMAIN\0 ]
    if data.len() < 8 {
        return SocksOutcome::Incomplete;
    }
    let cmd = data[1];
    let port = u16::from_be_bytes([data[2], data[3]]);
    let ip_bytes = [data[4], data[5], data[6], data[7]];
    let is_socks4a = ip_bytes[0] == 0 && ip_bytes[1] == 0 && ip_bytes[2] == 0 && ip_bytes[3] != 0;

    let Some(userid_end) = data[8..].iter().position(|&b| b == 0) else {
        return SocksOutcome::Incomplete;
    };
    let userid_end = 8 + userid_end;

    let (address, total_len) = if is_socks4a {
        let domain_start = userid_end + 1;
        let Some(domain_rel_end) = data[domain_start..].iter().position(|&b| b == 0) else {
            return SocksOutcome::Incomplete;
        };
        let domain_end = domain_start + domain_rel_end;
        let domain = match std::str::from_utf8(&data[domain_start..domain_end]) {
            Ok(s) => s.to_string(),
            Err(_) => return SocksOutcome::Broken,
        };
        (SocksAddress::Domain(domain), domain_end + 1)
    } else {
        (SocksAddress::Ip(IpAddr::V4(Ipv4Addr::from(ip_bytes))), userid_end + 1)
    };

    in_buf.advance_read(total_len);
    state.command = Some(cmd);
    state.address = Some(address);
    state.port = port;
    state.stage = Stage::Done;
    if cmd == CMD_CONNECT {
        state.status = SocksStatus::HaveAddr;
        SocksOutcome::Good
    } else {
        SocksOutcome::CmdNotConnect
    }
}

/// Write a version-appropriate positive-or-negative reply. `succeeded = false` always maps to a
/// generic failure code (the caller does not currently have a finer-grained errno to report).
pub fn send_reply(out_buf: &mut Buffer, state: &mut SocksState, succeeded: bool) {
    match state.version() {
        Version::V5 => {
            let code = if succeeded { SOCKS5_REP_SUCCEEDED } else { SOCKS5_REP_GENERAL_FAILURE };
            socks5_send_reply(out_buf, state, code);
        }
        Version::V4 => {
            let code = if succeeded { SOCKS4_REP_GRANTED } else { SOCKS4_REP_REJECTED };
            socks4_send_reply(out_buf, state, code);
        }
    }
    state.status = SocksStatus::SentReply;
}

/// Write an explicit SOCKS5 reply with `code` (e.g. `SOCKS5_REP_COMMAND_NOT_SUPPORTED`).
pub fn socks5_send_reply(out_buf: &mut Buffer, state: &mut SocksState, code: u8) {
    let (atyp, addr_bytes, port): (u8, Vec<u8>, u16) = match state.bound_addr {
        Some(SocketAddr::V4(a)) => (SOCKS5_ATYP_IPV4, a.ip().octets().to_vec(), a.port()),
        Some(SocketAddr::V6(a)) => (SOCKS5_ATYP_IPV6, a.ip().octets().to_vec(), a.port()),
        None => (SOCKS5_ATYP_IPV4, vec![0, 0, 0, 0], 0),
    };
    let mut reply = vec![SOCKS5_VERSION, code, 0x00, atyp];
    reply.extend_from_slice(&addr_bytes);
    reply.extend_from_slice(&port.to_be_bytes());
    out_buf.extend(&reply);
    state.status = SocksStatus::SentReply;
}

fn socks4_send_reply(out_buf: &mut Buffer, state: &SocksState, code: u8) {
    let (ip_bytes, port) = match state.bound_addr {
        Some(SocketAddr::V4(a)) => (a.ip().octets(), a.port()),
        _ => ([0, 0, 0, 0], 0),
    };
    let mut reply = vec![0x00, code];
    reply.extend_from_slice(&port.to_be_bytes());
    reply.extend_from_slice(&ip_bytes);
    out_buf.extend(&reply);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn socks5_connect_ipv4_round_trip() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        in_buf.extend(&[0x05, 0x01, 0x00]); // greeting: 1 method, no-auth
        let mut state = SocksState::new();
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Good);
        assert_eq!(out_buf.readable(), &[0x05, 0x00]);
        out_buf.advance_read(2);

        // request: CONNECT 93.184.216.34:80
        in_buf.extend(&[0x05, 0x01, 0x00, 0x01, 93, 184, 216, 34, 0, 80]);
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Good);
        assert_eq!(state.status(), SocksStatus::HaveAddr);
        let (addr, port) = state.address().unwrap();
        assert_eq!(*addr, SocksAddress::Ip(IpAddr::V4(Ipv4Addr::new(93, 184, 216, 34))));
        assert_eq!(port, 80);

        state.set_bound_addr("127.0.0.1:4000".parse().unwrap());
        send_reply(&mut out_buf, &mut state, true);
        assert_eq!(state.status(), SocksStatus::SentReply);
        assert_eq!(out_buf.readable()[0], 0x05);
        assert_eq!(out_buf.readable()[1], SOCKS5_REP_SUCCEEDED);
    }

    #[test]
    fn socks5_domain_request_incomplete_then_complete() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        let mut state = SocksState::new();
        in_buf.extend(&[0x05, 0x01, 0x00]);
        handle_socks(&mut in_buf, &mut out_buf, &mut state);
        out_buf.clear();

        in_buf.extend(&[0x05, 0x01, 0x00, 0x03, 11]); // domain len=11, but no bytes yet
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Incomplete);

        in_buf.extend(b"example.tes"); // 11 bytes
        in_buf.extend(&[0x00, 0x50]); // port 80
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Good);
        let (addr, port) = state.address().unwrap();
        assert_eq!(*addr, SocksAddress::Domain("example.tes".to_string()));
        assert_eq!(port, 80);
    }

    #[test]
    fn socks5_bind_command_is_rejected() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        let mut state = SocksState::new();
        in_buf.extend(&[0x05, 0x01, 0x00]);
        handle_socks(&mut in_buf, &mut out_buf, &mut state);
        out_buf.clear();

        in_buf.extend(&[0x05, 0x02, 0x00, 0x01, 1, 2, 3, 4, 0, 80]); // cmd=BIND
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::CmdNotConnect);

        socks5_send_reply(&mut out_buf, &mut state, SOCKS5_REP_COMMAND_NOT_SUPPORTED);
        assert_eq!(out_buf.readable()[1], 0x07);
        assert_eq!(state.status(), SocksStatus::SentReply);
    }

    #[test]
    fn garbage_first_byte_is_broken() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        let mut state = SocksState::new();
        in_buf.extend(&[0xFF]);
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Broken);
    }

    #[test]
    fn socks4_connect_by_ip() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        let mut state = SocksState::new();
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 127, 0, 0, 1];
        req.extend_from_slice(b"user\0");
        in_buf.extend(&req);
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Good);
        assert_eq!(state.status(), SocksStatus::HaveAddr);
        let (addr, port) = state.address().unwrap();
        assert_eq!(*addr, SocksAddress::Ip(IpAddr::V4(Ipv4Addr::new(127, 0, 0, 1))));
        assert_eq!(port, 80);
    }

    #[test]
    fn socks4a_connect_by_domain() {
        let mut in_buf = Buffer::new();
        let mut out_buf = Buffer::new();
        let mut state = SocksState::new();
        let mut req = vec![0x04, 0x01, 0x00, 0x50, 0, 0, 0, 1];
        req.extend_from_slice(b"user\0");
        req.extend_from_slice(b"example.test\0");
        in_buf.extend(&req);
        assert_eq!(handle_socks(&mut in_buf, &mut out_buf, &mut state), SocksOutcome::Good);
        let (addr, _) = state.address().unwrap();
        assert_eq!(*addr, SocksAddress::Domain("example.test".to_string()));
    }
}
