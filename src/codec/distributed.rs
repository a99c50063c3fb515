//! Distributed ("D") connection message family, used between parent and
//! children in the distributed search tree to fan search requests out
//! without routing every one of them through the central server.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::primitives::{Reader, Writer};
use super::{Decoded, Unknown, MAX_FRAME_LEN};
use crate::error::Error;
use crate::Token;

mod code {
    pub const SEARCH_REQUEST: u8 = 3;
    pub const BRANCH_LEVEL: u8 = 4;
    pub const BRANCH_ROOT: u8 = 5;
    pub const CHILD_DEPTH: u8 = 7;
}

/// A distributed tree message, exchanged with a parent or child in the
/// search tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DistributedMessage {
    /// A search request propagated down from a parent (or the server, for
    /// a root node) to be forwarded to all of our children in turn.
    SearchRequest {
        username: String,
        ticket: Token,
        query: String,
    },
    /// Informs a child of our level in the tree (root = 0), so it can
    /// report `level + 1` to its own children.
    BranchLevel { level: u32 },
    /// Informs a child of the username at the root of our branch.
    BranchRoot { username: String },
    /// Informs a parent how many children we have accepted, so it can
    /// make informed fan-out decisions.
    ChildDepth { depth: u32 },
    /// A message whose code we didn't recognize.
    Unknown(Unknown),
}

impl DistributedMessage {
    fn code(&self) -> u8 {
        match self {
            Self::SearchRequest { .. } => code::SEARCH_REQUEST,
            Self::BranchLevel { .. } => code::BRANCH_LEVEL,
            Self::BranchRoot { .. } => code::BRANCH_ROOT,
            Self::ChildDepth { .. } => code::CHILD_DEPTH,
            Self::Unknown(u) => u.code as u8,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::SearchRequest {
                username,
                ticket,
                query,
            } => {
                buf.write_string(username);
                buf.write_u32(*ticket);
                buf.write_string(query);
            }
            Self::BranchLevel { level } => buf.write_u32(*level),
            Self::BranchRoot { username } => buf.write_string(username),
            Self::ChildDepth { depth } => buf.write_u32(*depth),
            Self::Unknown(u) => buf.put_slice(&u.payload),
        }
    }

    fn decode_payload(code: u8, payload: &[u8]) -> Option<Self> {
        use self::code::*;
        let mut r = Reader::new(payload);
        Some(match code {
            SEARCH_REQUEST => Self::SearchRequest {
                username: r.read_string()?,
                ticket: r.read_u32()?,
                query: r.read_string()?,
            },
            BRANCH_LEVEL => Self::BranchLevel {
                level: r.read_u32()?,
            },
            BRANCH_ROOT => Self::BranchRoot {
                username: r.read_string()?,
            },
            CHILD_DEPTH => Self::ChildDepth {
                depth: r.read_u32()?,
            },
            _ => return None,
        })
    }
}

/// Encodes a single distributed message into a fresh, self-contained
/// frame.
pub fn encode_distributed(msg: &DistributedMessage) -> BytesMut {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.write_u32(1 + payload.len() as u32);
    buf.write_u8(msg.code());
    buf.put_slice(&payload);
    buf
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode_distributed(buf: &[u8]) -> Result<Decoded<DistributedMessage>, Error> {
    if buf.len() < 4 {
        return Ok(Decoded::NeedMore);
    }
    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
    if len > MAX_FRAME_LEN {
        return Err(Error::FrameTooLarge(len));
    }
    let total = 4 + len as usize;
    if buf.len() < total {
        return Ok(Decoded::NeedMore);
    }
    if len < 1 {
        return Err(Error::Decode {
            code: 0,
            reason: "distributed frame shorter than a code field".to_owned(),
        });
    }
    let code = buf[4];
    let payload = &buf[5..total];
    let msg = DistributedMessage::decode_payload(code, payload).unwrap_or_else(|| {
        DistributedMessage::Unknown(Unknown {
            code: code as u32,
            payload: payload.to_vec(),
        })
    });
    Ok(Decoded::Message(msg, total))
}

/// `tokio_util::codec` adapter over
/// [`encode_distributed`]/[`decode_distributed`].
#[derive(Debug, Default)]
pub struct DistributedCodec;

impl Decoder for DistributedCodec {
    type Item = DistributedMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_distributed(src)? {
            Decoded::Message(msg, consumed) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<DistributedMessage> for DistributedCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: DistributedMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.put_slice(&encode_distributed(&item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::build_u8_code_frame;

    fn round_trip(msg: DistributedMessage) {
        let encoded = encode_distributed(&msg);
        match decode_distributed(&encoded).unwrap() {
            Decoded::Message(decoded, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn round_trip_search_request() {
        round_trip(DistributedMessage::SearchRequest {
            username: "alice".to_owned(),
            ticket: 55,
            query: "no copyright music".to_owned(),
        });
    }

    #[test]
    fn round_trip_branch_level_and_root() {
        round_trip(DistributedMessage::BranchLevel { level: 2 });
        round_trip(DistributedMessage::BranchRoot {
            username: "root_node".to_owned(),
        });
    }

    #[test]
    fn round_trip_child_depth() {
        round_trip(DistributedMessage::ChildDepth { depth: 4 });
    }

    #[test]
    fn unknown_code_decodes_to_unknown_variant() {
        let frame = build_u8_code_frame(222, b"abc");
        match decode_distributed(&frame).unwrap() {
            Decoded::Message(DistributedMessage::Unknown(u), consumed) => {
                assert_eq!(u.code, 222);
                assert_eq!(u.payload, b"abc");
                assert_eq!(consumed, frame.len());
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
