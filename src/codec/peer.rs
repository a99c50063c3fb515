//! Peer ("P") connection message family, plus the handshake messages that
//! precede it.
//!
//! A freshly dialed or accepted peer connection speaks exactly one
//! handshake message before anything else: an outbound dialer sends
//! `PeerInit`, while the inbound side of an indirect (server-relayed)
//! connection sends `PierceFirewall`. Once that single message is read,
//! the connection is reframed from [`HandshakeCodec`] to [`PeerCodec`] via
//! `Framed::into_parts`/`FramedParts::new`, mirroring how the handshake
//! bytes on a BitTorrent wire are peeled off before the regular message
//! codec takes over.

use bytes::{Buf, BufMut, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::primitives::{Reader, Writer};
use super::{Decoded, Unknown, MAX_FRAME_LEN};
use crate::error::Error;
use crate::{ConnType, Token};

mod code {
    pub const PIERCE_FIREWALL: u8 = 0;
    pub const PEER_INIT: u8 = 1;
    pub const GET_SHARED_FILE_LIST: u8 = 4;
    pub const SHARED_FILE_LIST: u8 = 5;
    pub const FOLDER_CONTENTS_REQUEST: u8 = 36;
    pub const FOLDER_CONTENTS_RESPONSE: u8 = 37;
    pub const TRANSFER_REQUEST: u8 = 40;
    pub const TRANSFER_RESPONSE: u8 = 41;
    pub const QUEUE_UPLOAD: u8 = 43;
    pub const PLACE_IN_QUEUE_REQUEST: u8 = 51;
    pub const PLACE_IN_QUEUE_RESPONSE: u8 = 44;
    pub const UPLOAD_FAILED: u8 = 46;
    pub const UPLOAD_DENIED: u8 = 50;
    pub const QUEUE_FAILED: u8 = 50;
}

/// The one-shot handshake message exchanged before a connection switches
/// to [`PeerMessage`] framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Handshake {
    /// Sent by the dialer of a direct connection, identifying itself and
    /// which of the three connection types (`P`/`F`/`D`) this socket is
    /// for, plus the token the recipient should use to correlate it with
    /// any `ConnectToPeer` it requested.
    PeerInit {
        username: String,
        conn_type: ConnType,
        token: Token,
    },
    /// Sent on the accepting side of an indirect connection, echoing the
    /// token from the `ConnectToPeer` message that caused us to dial out.
    PierceFirewall { token: Token },
}

impl Handshake {
    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::PierceFirewall { token } => buf.write_u32(*token),
            Self::PeerInit {
                username,
                conn_type,
                token,
            } => {
                buf.write_string(username);
                buf.write_string(conn_type.as_tag());
                buf.write_u32(*token);
            }
        }
    }

    fn code(&self) -> u8 {
        match self {
            Self::PierceFirewall { .. } => code::PIERCE_FIREWALL,
            Self::PeerInit { .. } => code::PEER_INIT,
        }
    }

    fn decode_payload(code: u8, payload: &[u8]) -> Option<Self> {
        let mut r = Reader::new(payload);
        Some(match code {
            code::PIERCE_FIREWALL => Self::PierceFirewall {
                token: r.read_u32()?,
            },
            code::PEER_INIT => {
                let username = r.read_string()?;
                let tag = r.read_string()?;
                let conn_type = ConnType::from_tag(&tag)?;
                let token = r.read_u32()?;
                Self::PeerInit {
                    username,
                    conn_type,
                    token,
                }
            }
            _ => return None,
        })
    }
}

/// Encodes a handshake message into a self-contained frame (`u32 length ||
/// u8 code || payload`).
pub fn encode_handshake(msg: &Handshake) -> BytesMut {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.write_u32(1 + payload.len() as u32);
    buf.write_u8(msg.code());
    buf.put_slice(&payload);
    buf
}

/// Decodes one handshake frame. Unlike the steady-state message codecs,
/// an unrecognized handshake code is always an error: there is no
/// `Unknown` fallback to fall back to, since we don't yet know which
/// connection type we're speaking.
pub fn decode_handshake(buf: &[u8]) -> Result<Decoded<Handshake>, Error> {
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
            reason: "handshake frame shorter than a code field".to_owned(),
        });
    }
    let code = buf[4];
    let payload = &buf[5..total];
    let msg = Handshake::decode_payload(code, payload).ok_or_else(|| Error::Decode {
        code: code as u32,
        reason: "unrecognized handshake message".to_owned(),
    })?;
    Ok(Decoded::Message(msg, total))
}

/// `tokio_util::codec` adapter for the one-shot handshake stage of a peer
/// connection. Used to build a `Framed<TcpStream, HandshakeCodec>` that is
/// later dismantled with `into_parts` and reassembled as
/// `Framed<TcpStream, PeerCodec>` once the handshake message has been
/// read or written.
#[derive(Debug, Default)]
pub struct HandshakeCodec;

impl Decoder for HandshakeCodec {
    type Item = Handshake;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_handshake(src)? {
            Decoded::Message(msg, consumed) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<Handshake> for HandshakeCodec {
    type Error = Error;

    fn encode(&mut self, item: Handshake, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&encode_handshake(&item));
        Ok(())
    }
}

/// A steady-state peer ("P") message, exchanged after the handshake.
#[derive(Debug, Clone, PartialEq)]
pub enum PeerMessage {
    /// Request the other side's full share listing.
    GetSharedFileList,
    /// Reply to `GetSharedFileList`. The listing itself is kept opaque
    /// (raw zlib-compressed bytes) since browsing another user's share is
    /// outside what this crate interprets; consumers that need to parse
    /// it can do so from the bytes handed back in the emitted event.
    SharedFileList { compressed: Vec<u8> },
    /// Request the contents of one folder, for folder-level browsing.
    FolderContentsRequest { token: Token, folder: String },
    /// Reply to `FolderContentsRequest`.
    FolderContentsResponse {
        token: Token,
        folder: String,
        compressed: Vec<u8>,
    },
    /// Outbound: ask to begin (`direction = download`, i.e. we ask to
    /// receive) or offer (`direction = upload`) a file transfer.
    TransferRequest {
        direction: u32,
        token: Token,
        filename: String,
        file_size: u64,
    },
    /// Reply to `TransferRequest`.
    TransferResponse {
        token: Token,
        allowed: bool,
        file_size: Option<u64>,
        reason: Option<String>,
    },
    /// Ask to be queued for an upload of `filename`.
    QueueUpload { filename: String },
    /// The queued upload request was rejected outright.
    UploadDenied { filename: String, reason: String },
    /// A previously accepted upload failed partway through.
    UploadFailed { filename: String },
    /// A queued-upload request could not even be queued (share gone,
    /// queue full, etc).
    QueueFailed { filename: String, reason: String },
    /// Request our current place in the other side's upload queue.
    PlaceInQueueRequest { filename: String },
    /// Reply to `PlaceInQueueRequest`.
    PlaceInQueueResponse { filename: String, place: u32 },
    /// A message whose code we didn't recognize.
    Unknown(Unknown),
}

impl PeerMessage {
    fn code(&self) -> u8 {
        use code::*;
        match self {
            Self::GetSharedFileList => GET_SHARED_FILE_LIST,
            Self::SharedFileList { .. } => SHARED_FILE_LIST,
            Self::FolderContentsRequest { .. } => FOLDER_CONTENTS_REQUEST,
            Self::FolderContentsResponse { .. } => FOLDER_CONTENTS_RESPONSE,
            Self::TransferRequest { .. } => TRANSFER_REQUEST,
            Self::TransferResponse { .. } => TRANSFER_RESPONSE,
            Self::QueueUpload { .. } => QUEUE_UPLOAD,
            Self::UploadDenied { .. } => UPLOAD_DENIED,
            Self::UploadFailed { .. } => UPLOAD_FAILED,
            Self::QueueFailed { .. } => QUEUE_FAILED,
            Self::PlaceInQueueRequest { .. } => PLACE_IN_QUEUE_REQUEST,
            Self::PlaceInQueueResponse { .. } => PLACE_IN_QUEUE_RESPONSE,
            Self::Unknown(u) => u.code as u8,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::GetSharedFileList => {}
            Self::SharedFileList { compressed } => buf.put_slice(compressed),
            Self::FolderContentsRequest { token, folder } => {
                buf.write_u32(*token);
                buf.write_string(folder);
            }
            Self::FolderContentsResponse {
                token,
                folder,
                compressed,
            } => {
                buf.write_u32(*token);
                buf.write_string(folder);
                buf.put_slice(compressed);
            }
            Self::TransferRequest {
                direction,
                token,
                filename,
                file_size,
            } => {
                buf.write_u32(*direction);
                buf.write_u32(*token);
                buf.write_string(filename);
                buf.write_u64(*file_size);
            }
            Self::TransferResponse {
                token,
                allowed,
                file_size,
                reason,
            } => {
                buf.write_u32(*token);
                buf.write_bool(*allowed);
                if let Some(size) = file_size {
                    buf.write_u64(*size);
                } else if let Some(reason) = reason {
                    buf.write_string(reason);
                }
            }
            Self::QueueUpload { filename } => buf.write_string(filename),
            Self::UploadDenied { filename, reason } => {
                buf.write_string(filename);
                buf.write_string(reason);
            }
            Self::UploadFailed { filename } => buf.write_string(filename),
            Self::QueueFailed { filename, reason } => {
                buf.write_string(filename);
                buf.write_string(reason);
            }
            Self::PlaceInQueueRequest { filename } => buf.write_string(filename),
            Self::PlaceInQueueResponse { filename, place } => {
                buf.write_string(filename);
                buf.write_u32(*place);
            }
            Self::Unknown(u) => buf.put_slice(&u.payload),
        }
    }

    fn decode_payload(code: u8, payload: &[u8]) -> Option<Self> {
        use code::*;
        let mut r = Reader::new(payload);
        Some(match code {
            GET_SHARED_FILE_LIST => Self::GetSharedFileList,
            SHARED_FILE_LIST => Self::SharedFileList {
                compressed: r.rest().to_vec(),
            },
            FOLDER_CONTENTS_REQUEST => Self::FolderContentsRequest {
                token: r.read_u32()?,
                folder: r.read_string()?,
            },
            FOLDER_CONTENTS_RESPONSE => {
                let token = r.read_u32()?;
                let folder = r.read_string()?;
                Self::FolderContentsResponse {
                    token,
                    folder,
                    compressed: r.rest().to_vec(),
                }
            }
            TRANSFER_REQUEST => Self::TransferRequest {
                direction: r.read_u32()?,
                token: r.read_u32()?,
                filename: r.read_string()?,
                file_size: r.read_u64()?,
            },
            TRANSFER_RESPONSE => {
                let token = r.read_u32()?;
                let allowed = r.read_bool()?;
                let (file_size, reason) = if allowed {
                    (r.read_u64(), None)
                } else {
                    (None, r.read_string())
                };
                Self::TransferResponse {
                    token,
                    allowed,
                    file_size,
                    reason,
                }
            }
            QUEUE_UPLOAD => Self::QueueUpload {
                filename: r.read_string()?,
            },
            // UPLOAD_DENIED and QUEUE_FAILED share a wire code (50) in the
            // reference protocol; the reason string alone disambiguates
            // nothing, so we treat every occurrence as `UploadDenied` and
            // let the upload manager interpret it from context (whether a
            // matching queued request exists).
            UPLOAD_DENIED => Self::UploadDenied {
                filename: r.read_string()?,
                reason: r.read_string().unwrap_or_default(),
            },
            UPLOAD_FAILED => Self::UploadFailed {
                filename: r.read_string()?,
            },
            PLACE_IN_QUEUE_REQUEST => Self::PlaceInQueueRequest {
                filename: r.read_string()?,
            },
            PLACE_IN_QUEUE_RESPONSE => Self::PlaceInQueueResponse {
                filename: r.read_string()?,
                place: r.read_u32()?,
            },
            _ => return None,
        })
    }
}

/// Encodes a single peer message into a fresh, self-contained frame.
pub fn encode_peer(msg: &PeerMessage) -> BytesMut {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    let mut buf = BytesMut::with_capacity(5 + payload.len());
    buf.write_u32(1 + payload.len() as u32);
    buf.write_u8(msg.code());
    buf.put_slice(&payload);
    buf
}

/// Attempts to decode one frame from the front of `buf`.
pub fn decode_peer(buf: &[u8]) -> Result<Decoded<PeerMessage>, Error> {
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
            reason: "peer frame shorter than a code field".to_owned(),
        });
    }
    let code = buf[4];
    let payload = &buf[5..total];
    let msg = PeerMessage::decode_payload(code, payload).unwrap_or_else(|| {
        PeerMessage::Unknown(Unknown {
            code: code as u32,
            payload: payload.to_vec(),
        })
    });
    Ok(Decoded::Message(msg, total))
}

/// `tokio_util::codec` adapter over [`encode_peer`]/[`decode_peer`], for
/// driving a peer connection's socket with `Framed` once the handshake
/// stage has completed.
#[derive(Debug, Default)]
pub struct PeerCodec;

impl Decoder for PeerCodec {
    type Item = PeerMessage;
    type Error = Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match decode_peer(src)? {
            Decoded::Message(msg, consumed) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<PeerMessage> for PeerCodec {
    type Error = Error;

    fn encode(&mut self, item: PeerMessage, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.put_slice(&encode_peer(&item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::build_u8_code_frame;

    #[test]
    fn round_trip_peer_init() {
        let msg = Handshake::PeerInit {
            username: "alice".to_owned(),
            conn_type: ConnType::File,
            token: 7,
        };
        let encoded = encode_handshake(&msg);
        match decode_handshake(&encoded).unwrap() {
            Decoded::Message(decoded, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn round_trip_pierce_firewall() {
        let msg = Handshake::PierceFirewall { token: 99 };
        let encoded = encode_handshake(&msg);
        assert_eq!(
            decode_handshake(&encoded).unwrap(),
            Decoded::Message(msg, encoded.len())
        );
    }

    #[test]
    fn unrecognized_handshake_code_is_an_error() {
        let frame = build_u8_code_frame(200, b"");
        assert!(decode_handshake(&frame).is_err());
    }

    fn round_trip(msg: PeerMessage) {
        let encoded = encode_peer(&msg);
        match decode_peer(&encoded).unwrap() {
            Decoded::Message(decoded, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn round_trip_transfer_request() {
        round_trip(PeerMessage::TransferRequest {
            direction: 1,
            token: 3,
            filename: "song.mp3".to_owned(),
            file_size: 123_456,
        });
    }

    #[test]
    fn round_trip_transfer_response_allowed() {
        round_trip(PeerMessage::TransferResponse {
            token: 3,
            allowed: true,
            file_size: Some(123_456),
            reason: None,
        });
    }

    #[test]
    fn round_trip_transfer_response_denied() {
        round_trip(PeerMessage::TransferResponse {
            token: 3,
            allowed: false,
            file_size: None,
            reason: Some("Queued".to_owned()),
        });
    }

    #[test]
    fn round_trip_queue_upload() {
        round_trip(PeerMessage::QueueUpload {
            filename: "album/track.flac".to_owned(),
        });
    }

    #[test]
    fn unknown_code_decodes_to_unknown_variant() {
        let frame = build_u8_code_frame(250, b"xyz");
        match decode_peer(&frame).unwrap() {
            Decoded::Message(PeerMessage::Unknown(u), consumed) => {
                assert_eq!(u.code, 250);
                assert_eq!(u.payload, b"xyz");
                assert_eq!(consumed, frame.len());
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }

    #[test]
    fn every_prefix_shorter_than_full_frame_needs_more() {
        let encoded = encode_peer(&PeerMessage::GetSharedFileList);
        for prefix_len in 0..encoded.len() {
            assert_eq!(
                decode_peer(&encoded[..prefix_len]).unwrap(),
                Decoded::NeedMore
            );
        }
    }
}
