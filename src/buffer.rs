//! A duplex byte buffer: a readable prefix and a writable suffix over one growable `Vec<u8>`.
//!
//! This is the buffer half of a buffered stream (see `stream.rs`). Each `Conn` side owns two of
//! these: a read buffer (bytes arrived from the socket, not yet consumed by a `Protocol`) and a
//! write buffer (bytes produced by a `Protocol`, not yet flushed to the socket).

use std::io::{self, Read, Write};

/// Default capacity reserved up front; grows past this as needed.
const DEFAULT_CAPACITY: usize = 16 * 1024;

/// A growable byte buffer with separate read/write cursors.
///
/// `data[..read_pos]` has already been consumed and is logically gone. `data[read_pos..write_pos]`
/// is the readable region. `data[write_pos..]` (after a `reserve`) is available to write into.
#[derive(Debug, Default)]
pub struct Buffer {
    data: Vec<u8>,
    read_pos: usize,
    write_pos: usize,
}

impl Buffer {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity],
            read_pos: 0,
            write_pos: 0,
        }
    }

    /// The bytes available to read, in order.
    pub fn readable(&self) -> &[u8] {
        &self.data[self.read_pos..self.write_pos]
    }

    /// Drop `count` bytes from the front of the readable region.
    pub fn advance_read(&mut self, count: usize) {
        self.read_pos = (self.read_pos + count).min(self.write_pos);
        if self.read_pos == self.write_pos {
            // Nothing left to read: reset so future writes don't grow unboundedly.
            self.read_pos = 0;
            self.write_pos = 0;
        }
    }

    /// Number of unread bytes.
    pub fn len(&self) -> usize {
        self.write_pos - self.read_pos
    }

    pub fn is_empty(&self) -> bool {
        self.read_pos == self.write_pos
    }

    /// Append `data` to the end of the buffer, growing it if necessary.
    pub fn extend(&mut self, data: &[u8]) {
        self.reserve(data.len());
        self.data[self.write_pos..self.write_pos + data.len()].copy_from_slice(data);
        self.write_pos += data.len();
    }

    /// Ensure at least `additional` bytes are writable past the current write cursor, compacting
    /// already-consumed bytes out of the way first.
    pub fn reserve(&mut self, additional: usize) {
        if self.data.len() - self.write_pos >= additional {
            return;
        }
        // Compact: drop the already-read prefix before considering growth.
        if self.read_pos > 0 {
            self.data.copy_within(self.read_pos..self.write_pos, 0);
            self.write_pos -= self.read_pos;
            self.read_pos = 0;
        }
        if self.data.len() - self.write_pos < additional {
            let new_len = (self.write_pos + additional).max(self.data.len() * 2);
            self.data.resize(new_len, 0);
        }
    }

    /// Read as much as possible from `source` (a non-blocking socket) into the writable tail.
    ///
    /// Returns `Ok(n)` for `n` bytes read, including `Ok(0)` for a genuine EOF (the underlying
    /// `Read` contract). `WouldBlock` is propagated as `Err` rather than folded into `Ok(0)`, so
    /// callers can tell "no data right now" apart from "peer closed" by matching on
    /// `ErrorKind::WouldBlock` — see `stream::BufferedStream::pump_read`.
    pub fn fill_from<R: Read>(&mut self, source: &mut R) -> io::Result<usize> {
        self.reserve(DEFAULT_CAPACITY);
        let n = source.read(&mut self.data[self.write_pos..])?;
        self.write_pos += n;
        Ok(n)
    }

    /// Write as much of the readable region as possible to `sink`, advancing the read cursor by
    /// what was accepted. Returns the number of bytes written.
    pub fn drain_into<W: Write>(&mut self, sink: &mut W) -> io::Result<usize> {
        if self.is_empty() {
            return Ok(0);
        }
        match sink.write(self.readable()) {
            Ok(n) => {
                self.advance_read(n);
                Ok(n)
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => Ok(0),
            Err(e) => Err(e),
        }
    }

    /// Take and drop all buffered bytes.
    pub fn clear(&mut self) {
        self.read_pos = 0;
        self.write_pos = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extend_and_advance_round_trip() {
        let mut buf = Buffer::new();
        buf.extend(b"hello");
        assert_eq!(buf.readable(), b"hello");
        buf.advance_read(3);
        assert_eq!(buf.readable(), b"lo");
        buf.advance_read(2);
        assert!(buf.is_empty());
    }

    #[test]
    fn compaction_keeps_unread_bytes_in_order() {
        let mut buf = Buffer::with_capacity(8);
        buf.extend(b"abcd");
        buf.advance_read(2);
        buf.extend(b"efghij"); // forces compaction + growth
        assert_eq!(buf.readable(), b"cdefghij");
    }

    #[test]
    fn empty_buffer_resets_cursors() {
        let mut buf = Buffer::new();
        buf.extend(b"xy");
        buf.advance_read(2);
        assert_eq!(buf.len(), 0);
        buf.extend(b"z");
        assert_eq!(buf.readable(), b"z");
    }

    proptest::proptest! {
        #[test]
        fn fifo_order_preserved(chunks in proptest::collection::vec(proptest::collection::vec(0u8..=255, 0..32), 0..16)) {
            let mut buf = Buffer::new();
            let mut expected = Vec::new();
            for chunk in &chunks {
                buf.extend(chunk);
                expected.extend_from_slice(chunk);
            }
            proptest::prop_assert_eq!(buf.readable(), expected.as_slice());
        }
    }
}
