//! The framed binary protocol codec.
//!
//! This module is pure byte <-> message translation: it knows nothing
//! about sockets, state machines or dispatch. Every control message on the
//! wire is `u32 length || code || payload`, where `length` counts the code
//! bytes plus payload (but not the length field itself). Server messages
//! use a 4-byte little-endian code; peer and distributed messages use a
//! single code byte.
//!
//! Three codecs are exposed, one per message family:
//! [`server::ServerCodec`], [`peer::PeerCodec`] (plus
//! [`peer::HandshakeCodec`] for the two handshake-only messages that
//! precede it), and [`distributed::DistributedCodec`]. Each implements
//! `tokio_util::codec::{Decoder, Encoder}` so it can be driven with
//! `tokio_util::codec::Framed` exactly the way the teacher drove
//! `HandshakeCodec`/`PeerCodec` for BitTorrent.

pub mod distributed;
pub mod peer;
pub mod primitives;
pub mod server;

pub use distributed::{DistributedCodec, DistributedMessage};
pub use peer::{HandshakeCodec, Handshake, PeerCodec, PeerMessage};
pub use server::{ServerCodec, ServerMessage};

/// Frames larger than this are rejected with [`crate::error::Error::FrameTooLarge`]
/// without attempting to allocate a buffer proportional to the declared
/// length. 16 MiB comfortably covers the largest legitimate messages
/// (e.g. a big `SharedFileList` or `FileSearchResponse`) while bounding
/// what a malicious or buggy peer can make us allocate.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// The outcome of attempting to decode a single frame from a buffer.
///
/// This is the pure-function shape the specification asks for
/// (`decode(bytes) -> (msg, consumed) | need_more | error`); the
/// `Decoder` impls in each submodule are thin adapters over this that also
/// know how to turn an unrecognized but well-formed frame into an
/// `Unknown` message rather than an error, so the session can log and
/// ignore it instead of dying.
#[derive(Debug, PartialEq)]
pub enum Decoded<T> {
    /// A complete frame was decoded; `usize` is the number of bytes
    /// consumed from the front of the buffer.
    Message(T, usize),
    /// The buffer doesn't yet contain a complete frame.
    NeedMore,
}

/// A message whose code wasn't recognized. The payload is handed back
/// unparsed so that callers can log-and-ignore per the specification's
/// tolerance requirement, rather than treating an unknown code as fatal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Unknown {
    pub code: u32,
    pub payload: Vec<u8>,
}

#[cfg(test)]
pub(crate) mod test_support {
    use bytes::{BufMut, BytesMut};

    /// Builds a raw u32-length-prefixed frame with a u32 code, for tests
    /// that exercise the server codec's framing directly.
    pub(crate) fn build_u32_code_frame(code: u32, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let len = 4 + payload.len() as u32;
        buf.put_u32_le(len);
        buf.put_u32_le(code);
        buf.put_slice(payload);
        buf
    }

    /// Builds a raw u32-length-prefixed frame with a u8 code, for tests
    /// that exercise the peer/distributed codecs' framing directly.
    pub(crate) fn build_u8_code_frame(code: u8, payload: &[u8]) -> BytesMut {
        let mut buf = BytesMut::new();
        let len = 1 + payload.len() as u32;
        buf.put_u32_le(len);
        buf.put_u8(code);
        buf.put_slice(payload);
        buf
    }
}
