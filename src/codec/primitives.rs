//! Typed field readers and writers shared by all three codecs.
//!
//! Soulseek's wire format has no nested TLV structure beyond the outer
//! frame: messages are just a flat sequence of these primitives in a
//! fixed, message-specific order. [`Reader`] walks a byte slice
//! left-to-right and never panics on short input — every method returns
//! `None` (surfaced by callers as a decode error) rather than indexing out
//! of bounds.

use bytes::{Buf, BufMut, BytesMut};

/// A cursor over a byte slice that reads the little-endian primitives the
/// protocol uses, failing softly (returning `None`) on truncated input
/// instead of panicking.
pub struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    /// Number of bytes consumed so far.
    pub fn consumed(&self) -> usize {
        self.pos
    }

    /// Number of bytes remaining.
    pub fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if self.remaining() < n {
            return None;
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Some(slice)
    }

    pub fn read_u8(&mut self) -> Option<u8> {
        self.take(1).map(|s| s[0])
    }

    pub fn read_bool(&mut self) -> Option<bool> {
        self.read_u8().map(|b| b != 0)
    }

    pub fn read_u16(&mut self) -> Option<u16> {
        self.take(2)
            .map(|s| u16::from_le_bytes([s[0], s[1]]))
    }

    pub fn read_u32(&mut self) -> Option<u32> {
        self.take(4)
            .map(|s| u32::from_le_bytes([s[0], s[1], s[2], s[3]]))
    }

    pub fn read_i32(&mut self) -> Option<i32> {
        self.read_u32().map(|v| v as i32)
    }

    pub fn read_u64(&mut self) -> Option<u64> {
        self.take(8).map(|s| {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(s);
            u64::from_le_bytes(arr)
        })
    }

    /// Reads a length-prefixed (u32 byte count) UTF-8 string. Invalid
    /// UTF-8 is tolerated via lossy conversion rather than failing the
    /// whole frame, since usernames and filenames from the wild have been
    /// observed with stray non-UTF-8 bytes.
    pub fn read_string(&mut self) -> Option<String> {
        let len = self.read_u32()? as usize;
        let bytes = self.take(len)?;
        Some(String::from_utf8_lossy(bytes).into_owned())
    }

    /// Reads a fixed-size raw byte array, for the ipv4 octets in
    /// `PeerAddress`/`ConnectToPeer`.
    pub fn read_ipv4(&mut self) -> Option<std::net::Ipv4Addr> {
        let raw = self.read_u32()?;
        Some(std::net::Ipv4Addr::from(raw.to_le_bytes()))
    }

    /// Returns the unconsumed remainder of the buffer, useful for the
    /// obfuscated-channel passthrough and for `Unknown` payload capture.
    pub fn rest(&self) -> &'a [u8] {
        &self.buf[self.pos..]
    }
}

/// Appends the little-endian primitives to an outgoing message buffer.
/// There's no corresponding `Writer` struct because `BytesMut` via
/// `bytes::BufMut` already provides everything we need; these are just
/// named helpers so call sites read the same as the `Reader` side.
pub trait Writer {
    fn write_u8(&mut self, v: u8);
    fn write_bool(&mut self, v: bool);
    fn write_u16(&mut self, v: u16);
    fn write_u32(&mut self, v: u32);
    fn write_u64(&mut self, v: u64);
    fn write_string(&mut self, v: &str);
    fn write_ipv4(&mut self, v: std::net::Ipv4Addr);
}

impl Writer for BytesMut {
    fn write_u8(&mut self, v: u8) {
        self.put_u8(v);
    }

    fn write_bool(&mut self, v: bool) {
        self.put_u8(v as u8);
    }

    fn write_u16(&mut self, v: u16) {
        self.put_u16_le(v);
    }

    fn write_u32(&mut self, v: u32) {
        self.put_u32_le(v);
    }

    fn write_u64(&mut self, v: u64) {
        self.put_u64_le(v);
    }

    fn write_string(&mut self, v: &str) {
        self.put_u32_le(v.len() as u32);
        self.put_slice(v.as_bytes());
    }

    fn write_ipv4(&mut self, v: std::net::Ipv4Addr) {
        self.put_slice(&v.octets());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_round_trip() {
        let mut buf = BytesMut::new();
        buf.write_u8(7);
        buf.write_bool(true);
        buf.write_u16(1000);
        buf.write_u32(123_456);
        buf.write_u64(9_999_999_999);
        buf.write_string("hello");
        buf.write_ipv4(std::net::Ipv4Addr::new(203, 0, 113, 9));

        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8(), Some(7));
        assert_eq!(r.read_bool(), Some(true));
        assert_eq!(r.read_u16(), Some(1000));
        assert_eq!(r.read_u32(), Some(123_456));
        assert_eq!(r.read_u64(), Some(9_999_999_999));
        assert_eq!(r.read_string(), Some("hello".to_owned()));
        assert_eq!(
            r.read_ipv4(),
            Some(std::net::Ipv4Addr::new(203, 0, 113, 9))
        );
        assert_eq!(r.remaining(), 0);
    }

    #[test]
    fn read_string_truncated_is_none() {
        let mut buf = BytesMut::new();
        buf.write_u32(10);
        buf.put_slice(b"short");
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_string(), None);
    }

    #[test]
    fn read_past_end_is_none() {
        let buf = BytesMut::new();
        let mut r = Reader::new(&buf);
        assert_eq!(r.read_u8(), None);
        assert_eq!(r.read_u32(), None);
    }
}
