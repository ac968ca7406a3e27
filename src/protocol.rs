//! The `Protocol` capability set and two reference implementations.
//!
//! The original design treats concrete obfuscation protocols as an external collaborator: the
//! core only needs a uniform `handshake`/`send`/`recv` surface. This module supplies that trait
//! plus two real implementations so the crate is runnable end-to-end: `IdentityProtocol` (a
//! passthrough, for the S1 echo scenario) and `XorProtocol` (a minimal stream obfuscator that
//! stands in for a real pluggable-transport cipher and is enough to validate, per scenario S2,
//! that wire bytes are not the plaintext literal).

use crate::buffer::Buffer;
use std::io;

/// Outcome of a `Protocol::recv` call.
#[derive(Debug, PartialEq, Eq)]
pub enum RecvOutcome {
    /// Nothing further is needed right now.
    Ok,
    /// The protocol produced bytes that must be sent out before further `recv` progress is
    /// meaningful (e.g. a handshake reply). The caller must immediately follow up with a
    /// `send` call draining the input side's read buffer into the output side's write buffer.
    SendPending,
}

/// A per-connection, stateful stream transform applied in each direction.
///
/// One instance is created per `Conn`; instances are never shared across connections. `send`
/// obfuscates outbound (upstream → wire) bytes, `recv` de-obfuscates inbound (wire → upstream)
/// bytes. Either direction may consume less than the full input buffer (e.g. a block cipher
/// waiting for a complete block) and is expected to leave the remainder for the next call.
pub trait Protocol {
    /// Queue any protocol-specific bytes that must be sent before ordinary traffic (e.g. a
    /// fixed handshake token). The default implementation sends nothing.
    fn handshake(&mut self, _out_buf: &mut Buffer) -> io::Result<()> {
        Ok(())
    }

    /// Consume some prefix of `in_buf`, appending the transformed bytes to `out_buf`.
    fn send(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<()>;

    /// Consume some prefix of `in_buf`, appending the transformed bytes to `out_buf`. May signal
    /// that a reply must be flushed outward before more `recv` progress makes sense.
    fn recv(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<RecvOutcome>;
}

/// Selects which `Protocol` a listener instantiates per accepted connection.
#[derive(Debug, Clone)]
pub enum ProtocolKind {
    Identity,
    Xor { key: Vec<u8> },
}

impl ProtocolKind {
    pub fn create(&self) -> Box<dyn Protocol + Send> {
        match self {
            ProtocolKind::Identity => Box::new(IdentityProtocol::new()),
            ProtocolKind::Xor { key } => Box::new(XorProtocol::new(key.clone())),
        }
    }
}

/// A no-op transform: bytes pass through unchanged. Used by `SimpleClient`/`SimpleServer` test
/// fixtures where the point under test is the forwarding state machine, not obfuscation.
#[derive(Debug, Default)]
pub struct IdentityProtocol;

impl IdentityProtocol {
    pub fn new() -> Self {
        Self
    }
}

impl Protocol for IdentityProtocol {
    fn send(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<()> {
        out_buf.extend(in_buf.readable());
        let len = in_buf.len();
        in_buf.advance_read(len);
        Ok(())
    }

    fn recv(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<RecvOutcome> {
        out_buf.extend(in_buf.readable());
        let len = in_buf.len();
        in_buf.advance_read(len);
        Ok(RecvOutcome::Ok)
    }
}

/// A minimal stream cipher: XORs each byte against a repeating key. Not cryptographically
/// meaningful; it exists to give the forwarding engine a non-identity transform to validate
/// against (wire bytes must differ from the plaintext) without pulling in a real cipher crate
/// the core doesn't otherwise need.
#[derive(Debug)]
pub struct XorProtocol {
    key: Vec<u8>,
    send_pos: usize,
    recv_pos: usize,
    handshake_sent: bool,
    /// Whether the peer's raw handshake marker has been stripped from the front of the incoming
    /// stream yet. The marker itself is never run through the keystream (see `handshake`/`recv`
    /// below), so this is tracked independently of `recv_pos`.
    handshake_received: bool,
}

/// Fixed 4-byte marker sent once per connection before any obfuscated traffic, so a peer running
/// the same protocol can confirm it is talking to another instance (stands in for a real
/// pluggable-transport handshake token). Sent and recognized raw, outside the keystream, so that
/// `send_pos`/`recv_pos` on the two ends of a connection stay in lock-step from the first payload
/// byte onward.
const HANDSHAKE_MAGIC: &[u8] = b"XOR1";

impl XorProtocol {
    pub fn new(key: Vec<u8>) -> Self {
        let key = if key.is_empty() { vec![0xAA] } else { key };
        Self { key, send_pos: 0, recv_pos: 0, handshake_sent: false, handshake_received: false }
    }

    fn xor_into(data: &[u8], key: &[u8], pos: &mut usize, out: &mut Vec<u8>) {
        out.reserve(data.len());
        for &byte in data {
            out.push(byte ^ key[*pos % key.len()]);
            *pos += 1;
        }
    }
}

impl Protocol for XorProtocol {
    fn handshake(&mut self, out_buf: &mut Buffer) -> io::Result<()> {
        if !self.handshake_sent {
            out_buf.extend(HANDSHAKE_MAGIC);
            self.handshake_sent = true;
        }
        Ok(())
    }

    fn send(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<()> {
        let mut transformed = Vec::new();
        Self::xor_into(in_buf.readable(), &self.key, &mut self.send_pos, &mut transformed);
        out_buf.extend(&transformed);
        let len = in_buf.len();
        in_buf.advance_read(len);
        Ok(())
    }

    fn recv(&mut self, in_buf: &mut Buffer, out_buf: &mut Buffer) -> io::Result<RecvOutcome> {
        if !self.handshake_received {
            let data = in_buf.readable();
            if data.len() < HANDSHAKE_MAGIC.len() {
                // Not enough bytes buffered yet to confirm the marker; wait for more.
                return Ok(RecvOutcome::Ok);
            }
            if &data[..HANDSHAKE_MAGIC.len()] != HANDSHAKE_MAGIC {
                return Err(io::Error::new(io::ErrorKind::InvalidData, "missing XOR handshake marker"));
            }
            in_buf.advance_read(HANDSHAKE_MAGIC.len());
            self.handshake_received = true;
        }

        let mut transformed = Vec::new();
        Self::xor_into(in_buf.readable(), &self.key, &mut self.recv_pos, &mut transformed);
        out_buf.extend(&transformed);
        let len = in_buf.len();
        in_buf.advance_read(len);
        Ok(RecvOutcome::Ok)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_passes_bytes_through_unchanged() {
        let mut proto = IdentityProtocol::new();
        let mut input = Buffer::new();
        let mut output = Buffer::new();
        input.extend(b"hello world");
        proto.send(&mut input, &mut output).unwrap();
        assert_eq!(output.readable(), b"hello world");
    }

    #[test]
    fn xor_round_trips_through_independent_instances() {
        let key = b"k3y".to_vec();
        let mut sender = XorProtocol::new(key.clone());
        let mut receiver = XorProtocol::new(key);

        let mut wire = Buffer::new();
        sender.handshake(&mut wire).unwrap();
        let mut plaintext = Buffer::new();
        plaintext.extend(b"hello world");
        sender.send(&mut plaintext, &mut wire).unwrap();
        assert!(!wire.readable().ends_with(b"hello world"));

        let mut plaintext_out = Buffer::new();
        receiver.recv(&mut wire, &mut plaintext_out).unwrap();
        assert_eq!(plaintext_out.readable(), b"hello world");
    }

    #[test]
    fn xor_key_position_advances_across_calls() {
        let key = b"ab".to_vec();
        let mut sender = XorProtocol::new(key.clone());
        let mut receiver = XorProtocol::new(key);

        let mut wire = Buffer::new();
        sender.handshake(&mut wire).unwrap();
        for chunk in [&b"a"[..], &b"bc"[..], &b"def"[..]] {
            let mut input = Buffer::new();
            input.extend(chunk);
            sender.send(&mut input, &mut wire).unwrap();
        }
        let mut out = Buffer::new();
        receiver.recv(&mut wire, &mut out).unwrap();
        assert_eq!(out.readable(), b"abcdef");
    }

    /// The exact call sequence `Conn` uses: the sender's handshake marker is queued before any
    /// payload, but the receiver is never told to "skip a handshake" explicitly — `recv` must
    /// recognize and strip the raw marker on its own so both sides' keystream positions land in
    /// lock-step. This is the sequence that exposed the original desync bug (the marker's 4 bytes
    /// were silently fed through the receiver's keystream instead of being stripped raw).
    #[test]
    fn recv_strips_the_peers_handshake_marker_without_desyncing_the_keystream() {
        let key = b"k3y".to_vec();
        let mut sender = XorProtocol::new(key.clone());
        let mut receiver = XorProtocol::new(key);

        let mut wire = Buffer::new();
        sender.handshake(&mut wire).unwrap();
        assert_eq!(wire.readable(), HANDSHAKE_MAGIC);

        let mut plaintext = Buffer::new();
        plaintext.extend(b"first message");
        sender.send(&mut plaintext, &mut wire).unwrap();

        let mut decoded = Buffer::new();
        receiver.recv(&mut wire, &mut decoded).unwrap();
        assert_eq!(decoded.readable(), b"first message");

        // A second round trip on the same pair of instances must still be in lock-step: if the
        // marker had been run through the keystream, recv_pos would now be permanently offset
        // from send_pos by HANDSHAKE_MAGIC.len() bytes and this would come out corrupted.
        let mut plaintext2 = Buffer::new();
        plaintext2.extend(b"second message");
        let mut wire2 = Buffer::new();
        sender.send(&mut plaintext2, &mut wire2).unwrap();
        let mut decoded2 = Buffer::new();
        receiver.recv(&mut wire2, &mut decoded2).unwrap();
        assert_eq!(decoded2.readable(), b"second message");
    }
}
