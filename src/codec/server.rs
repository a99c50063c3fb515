//! Server message family: `u32`-coded control messages exchanged with the
//! central index server over the single long-lived TCP connection.

use bytes::{Buf, BufMut, BytesMut};
use std::net::Ipv4Addr;
use tokio_util::codec::{Decoder, Encoder};

use super::primitives::{Reader, Writer};
use super::{Decoded, Unknown, MAX_FRAME_LEN};
use crate::error::Error;
use crate::Token;

/// Server message codes. Values follow the long-standing Soulseek wire
/// protocol numbering (see the `SLSKPROTOCOL` family of documents); they
/// are opaque integers as far as this crate's consumers are concerned.
mod code {
    pub const LOGIN: u32 = 1;
    pub const SET_LISTEN_PORT: u32 = 2;
    pub const GET_PEER_ADDRESS: u32 = 3;
    pub const GET_USER_STATUS: u32 = 7;
    pub const SAY_IN_ROOM: u32 = 13;
    pub const JOIN_ROOM: u32 = 14;
    pub const LEAVE_ROOM: u32 = 15;
    pub const CONNECT_TO_PEER: u32 = 18;
    pub const PRIVATE_MESSAGE: u32 = 22;
    pub const FILE_SEARCH: u32 = 26;
    pub const SHARED_FOLDERS_FILES: u32 = 35;
    pub const GET_USER_STATS: u32 = 36;
    pub const CANT_CONNECT_TO_PEER: u32 = 1001;
    pub const ROOM_LIST: u32 = 64;
    pub const ADD_THING_I_LIKE: u32 = 51;
    pub const ADD_THING_I_HATE: u32 = 53;
    pub const GET_RECOMMENDATIONS: u32 = 54;
    pub const GET_SIMILAR_USERS: u32 = 110;
    pub const ACCEPT_CHILDREN: u32 = 100;
    pub const HAVE_NO_PARENT: u32 = 71;
    pub const CHECK_PRIVILEGES: u32 = 92;
    pub const WISHLIST_SEARCH: u32 = 103;
    pub const BRANCH_LEVEL: u32 = 126;
    pub const BRANCH_ROOT: u32 = 127;
}

/// A server message, in either direction. Not every variant can appear in
/// both directions (e.g. `Login` is sent by us, `LoginResponse` arrives
/// from the server under the same wire code), but keeping them in one enum
/// matches how the dispatch table and outbound command methods both speak
/// "server message" without the caller juggling two types.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerMessage {
    /// Outbound: initiate a session.
    Login {
        username: String,
        /// Hex MD5 of `username || password`, opaque to the codec.
        password_hash: String,
        version: u32,
    },
    /// Inbound: reply to `Login`.
    LoginResponse { success: bool, message: String },
    /// Outbound: announce our listening port(s) after login.
    SetListenPort { plain: u16, obfuscated: u16 },
    /// Outbound: ask the server to resolve a username's endpoint.
    GetPeerAddress { username: String },
    /// Inbound: resolution of a previously requested `GetPeerAddress`.
    PeerAddress {
        username: String,
        ip: Ipv4Addr,
        port: u16,
    },
    /// Outbound: announce connected/away status.
    SetOnlineStatus { online: bool },
    /// Outbound.
    JoinRoom { room: String },
    /// Outbound.
    LeaveRoom { room: String },
    /// Outbound: `username` is always `None`. Inbound: the server always
    /// fills `username` in, identifying who said `message` in `room`.
    SayInRoom {
        room: String,
        username: Option<String>,
        message: String,
    },
    /// Inbound: list of public rooms and their user counts.
    RoomList { rooms: Vec<(String, u32)> },
    /// Outbound and inbound: a private message to/from a user.
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },
    /// Outbound: search all users for a query under the given ticket.
    FileSearch { ticket: Token, query: String },
    /// Outbound: a search restricted to the user's own wishlist ticket
    /// space, rate-limited by the server separately from `FileSearch`.
    WishlistSearch { ticket: Token, query: String },
    /// Inbound: the server asking us to connect to (or accept a
    /// connection from) a peer, either directly or relayed.
    ConnectToPeer {
        username: String,
        conn_type: String,
        ip: Ipv4Addr,
        port: u16,
        token: Token,
    },
    /// Outbound: tell the server a direct connection attempt failed so it
    /// relays the request to the other side instead.
    CantConnectToPeer { token: Token, username: String },
    /// Outbound: tell the server we have no distributed parent.
    HaveNoParent { value: bool },
    /// Outbound: tell the server whether we accept distributed children.
    AcceptChildren { value: bool },
    /// Outbound and inbound: our/a parent's position in the distributed
    /// tree.
    BranchLevel { level: u32 },
    /// Outbound and inbound: the root username of our/a parent's branch.
    BranchRoot { username: String },
    /// Outbound: advertise our share totals after login.
    SharedFoldersFiles { folders: u32, files: u32 },
    /// Outbound: request a user's share/upload statistics.
    GetUserStats { username: String },
    /// Inbound: reply to `GetUserStats`.
    UserStats {
        username: String,
        average_speed: u32,
        upload_count: u64,
        shared_files: u32,
        shared_folders: u32,
    },
    /// Outbound: ask whether we currently hold privileged status.
    CheckPrivileges,
    /// Inbound: reply to `CheckPrivileges`, seconds of privilege left.
    PrivilegesLeft { seconds: u32 },
    /// Outbound.
    AddThingILike { item: String },
    /// Outbound.
    AddThingIHate { item: String },
    /// Outbound: request recommendations derived from our liked items.
    GetRecommendations,
    /// Inbound: reply to `GetRecommendations`.
    Recommendations { items: Vec<(String, i32)> },
    /// Outbound: request users with similar taste.
    GetSimilarUsers,
    /// Inbound: reply to `GetSimilarUsers`.
    SimilarUsers { usernames: Vec<String> },
    /// Inbound: another user's online status changed.
    UserOnlineStatus { username: String, status: u32 },
    /// A message whose code we didn't recognize. Preserved so the session
    /// can log and ignore it rather than treating it as fatal.
    Unknown(Unknown),
}

impl ServerMessage {
    fn code(&self) -> u32 {
        use code::*;
        match self {
            Self::Login { .. } | Self::LoginResponse { .. } => LOGIN,
            Self::SetListenPort { .. } => SET_LISTEN_PORT,
            Self::GetPeerAddress { .. } => GET_PEER_ADDRESS,
            Self::PeerAddress { .. } => GET_PEER_ADDRESS,
            Self::SetOnlineStatus { .. } | Self::UserOnlineStatus { .. } => {
                GET_USER_STATUS
            }
            Self::JoinRoom { .. } => JOIN_ROOM,
            Self::LeaveRoom { .. } => LEAVE_ROOM,
            Self::SayInRoom { .. } => SAY_IN_ROOM,
            Self::RoomList { .. } => ROOM_LIST,
            Self::PrivateMessage { .. } => PRIVATE_MESSAGE,
            Self::FileSearch { .. } => FILE_SEARCH,
            Self::WishlistSearch { .. } => WISHLIST_SEARCH,
            Self::ConnectToPeer { .. } => CONNECT_TO_PEER,
            Self::CantConnectToPeer { .. } => CANT_CONNECT_TO_PEER,
            Self::HaveNoParent { .. } => HAVE_NO_PARENT,
            Self::AcceptChildren { .. } => ACCEPT_CHILDREN,
            Self::BranchLevel { .. } => BRANCH_LEVEL,
            Self::BranchRoot { .. } => BRANCH_ROOT,
            Self::SharedFoldersFiles { .. } => SHARED_FOLDERS_FILES,
            Self::GetUserStats { .. } | Self::UserStats { .. } => {
                GET_USER_STATS
            }
            Self::CheckPrivileges | Self::PrivilegesLeft { .. } => {
                CHECK_PRIVILEGES
            }
            Self::AddThingILike { .. } => ADD_THING_I_LIKE,
            Self::AddThingIHate { .. } => ADD_THING_I_HATE,
            Self::GetRecommendations | Self::Recommendations { .. } => {
                GET_RECOMMENDATIONS
            }
            Self::GetSimilarUsers | Self::SimilarUsers { .. } => {
                GET_SIMILAR_USERS
            }
            Self::Unknown(u) => u.code,
        }
    }

    fn encode_payload(&self, buf: &mut BytesMut) {
        match self {
            Self::Login {
                username,
                password_hash,
                version,
            } => {
                buf.write_string(username);
                buf.write_string(password_hash);
                buf.write_u32(*version);
            }
            Self::LoginResponse { success, message } => {
                buf.write_bool(*success);
                buf.write_string(message);
            }
            Self::SetListenPort { plain, obfuscated } => {
                buf.write_u32(*plain as u32);
                buf.write_u32(*obfuscated as u32);
            }
            Self::GetPeerAddress { username } => buf.write_string(username),
            Self::PeerAddress { username, ip, port } => {
                buf.write_string(username);
                buf.write_ipv4(*ip);
                buf.write_u32(*port as u32);
            }
            Self::SetOnlineStatus { online } => {
                buf.write_u32(if *online { 2 } else { 1 })
            }
            Self::UserOnlineStatus { username, status } => {
                buf.write_string(username);
                buf.write_u32(*status);
            }
            Self::JoinRoom { room } | Self::LeaveRoom { room } => {
                buf.write_string(room)
            }
            Self::SayInRoom { room, message, .. } => {
                buf.write_string(room);
                buf.write_string(message);
            }
            Self::RoomList { rooms } => {
                buf.write_u32(rooms.len() as u32);
                for (room, _) in rooms {
                    buf.write_string(room);
                }
                buf.write_u32(rooms.len() as u32);
                for (_, count) in rooms {
                    buf.write_u32(*count);
                }
            }
            Self::PrivateMessage {
                id,
                timestamp,
                username,
                message,
            } => {
                buf.write_u32(*id);
                buf.write_u32(*timestamp);
                buf.write_string(username);
                buf.write_string(message);
            }
            Self::FileSearch { ticket, query } | Self::WishlistSearch { ticket, query } => {
                buf.write_u32(*ticket);
                buf.write_string(query);
            }
            Self::ConnectToPeer {
                username,
                conn_type,
                ip,
                port,
                token,
            } => {
                buf.write_string(username);
                buf.write_string(conn_type);
                buf.write_ipv4(*ip);
                buf.write_u32(*port as u32);
                buf.write_u32(*token);
            }
            Self::CantConnectToPeer { token, username } => {
                buf.write_u32(*token);
                buf.write_string(username);
            }
            Self::HaveNoParent { value } | Self::AcceptChildren { value } => {
                buf.write_bool(*value)
            }
            Self::BranchLevel { level } => buf.write_u32(*level),
            Self::BranchRoot { username } => buf.write_string(username),
            Self::SharedFoldersFiles { folders, files } => {
                buf.write_u32(*folders);
                buf.write_u32(*files);
            }
            Self::GetUserStats { username } => buf.write_string(username),
            Self::UserStats {
                username,
                average_speed,
                upload_count,
                shared_files,
                shared_folders,
            } => {
                buf.write_string(username);
                buf.write_u32(*average_speed);
                buf.write_u64(*upload_count);
                buf.write_u32(*shared_files);
                buf.write_u32(*shared_folders);
            }
            Self::CheckPrivileges => {}
            Self::PrivilegesLeft { seconds } => buf.write_u32(*seconds),
            Self::AddThingILike { item } | Self::AddThingIHate { item } => {
                buf.write_string(item)
            }
            Self::GetRecommendations | Self::GetSimilarUsers => {}
            Self::Recommendations { items } => {
                buf.write_u32(items.len() as u32);
                for (item, weight) in items {
                    buf.write_string(item);
                    buf.write_u32(*weight as u32);
                }
            }
            Self::SimilarUsers { usernames } => {
                buf.write_u32(usernames.len() as u32);
                for name in usernames {
                    buf.write_string(name);
                }
            }
            Self::Unknown(u) => buf.put_slice(&u.payload),
        }
    }

    /// Decodes the payload of a message once its code has identified which
    /// variant to parse, per §4.1's contract. Returns `None` on truncated
    /// or malformed payloads (the caller decides whether that becomes a
    /// surfaced error or a recovered-locally log-and-skip).
    fn decode_payload(code: u32, payload: &[u8]) -> Option<Self> {
        use code::*;
        let mut r = Reader::new(payload);
        Some(match code {
            LOGIN => {
                // `Login` is ambiguous by code alone: the server's reply
                // carries a bool first, our request carries a string. We
                // disambiguate by trying the request shape first and
                // falling back to the response shape, since a string
                // length field that happens to coincide with a valid bool
                // byte is the only overlap and the remaining bytes settle
                // it either way.
                if let (Some(username), Some(password_hash), Some(version)) =
                    (r.read_string(), r.read_string(), r.read_u32())
                {
                    if r.remaining() == 0 {
                        return Some(Self::Login {
                            username,
                            password_hash,
                            version,
                        });
                    }
                }
                let mut r = Reader::new(payload);
                let success = r.read_bool()?;
                let message = r.read_string().unwrap_or_default();
                Self::LoginResponse { success, message }
            }
            SET_LISTEN_PORT => Self::SetListenPort {
                plain: r.read_u32()? as u16,
                obfuscated: r.read_u32().unwrap_or(0) as u16,
            },
            GET_PEER_ADDRESS => {
                let username = r.read_string()?;
                if r.remaining() == 0 {
                    Self::GetPeerAddress { username }
                } else {
                    Self::PeerAddress {
                        username,
                        ip: r.read_ipv4()?,
                        port: r.read_u32()? as u16,
                    }
                }
            }
            GET_USER_STATUS => {
                let username = r.read_string()?;
                match r.read_u32() {
                    Some(status) => Self::UserOnlineStatus { username, status },
                    None => Self::SetOnlineStatus { online: true },
                }
            }
            JOIN_ROOM => Self::JoinRoom {
                room: r.read_string()?,
            },
            LEAVE_ROOM => Self::LeaveRoom {
                room: r.read_string()?,
            },
            SAY_IN_ROOM => {
                // Our own outbound `SayInRoom` carries no username; the
                // server's inbound echo of someone else's message does.
                // The two shapes differ by field count, not by code, the
                // same ambiguity `LOGIN` resolves by trying the longer
                // shape first.
                let room = r.read_string()?;
                let second = r.read_string()?;
                match r.read_string() {
                    Some(message) => Self::SayInRoom {
                        room,
                        username: Some(second),
                        message,
                    },
                    None => Self::SayInRoom {
                        room,
                        username: None,
                        message: second,
                    },
                }
            }
            ROOM_LIST => {
                let room_count = r.read_u32()? as usize;
                let mut names = Vec::with_capacity(room_count);
                for _ in 0..room_count {
                    names.push(r.read_string()?);
                }
                let count_count = r.read_u32()? as usize;
                let mut counts = Vec::with_capacity(count_count);
                for _ in 0..count_count {
                    counts.push(r.read_u32()?);
                }
                let rooms = names.into_iter().zip(counts).collect();
                Self::RoomList { rooms }
            }
            PRIVATE_MESSAGE => Self::PrivateMessage {
                id: r.read_u32()?,
                timestamp: r.read_u32()?,
                username: r.read_string()?,
                message: r.read_string()?,
            },
            FILE_SEARCH => Self::FileSearch {
                ticket: r.read_u32()?,
                query: r.read_string()?,
            },
            WISHLIST_SEARCH => Self::WishlistSearch {
                ticket: r.read_u32()?,
                query: r.read_string()?,
            },
            CONNECT_TO_PEER => Self::ConnectToPeer {
                username: r.read_string()?,
                conn_type: r.read_string()?,
                ip: r.read_ipv4()?,
                port: r.read_u32()? as u16,
                token: r.read_u32()?,
            },
            CANT_CONNECT_TO_PEER => Self::CantConnectToPeer {
                token: r.read_u32()?,
                username: r.read_string()?,
            },
            HAVE_NO_PARENT => Self::HaveNoParent {
                value: r.read_bool()?,
            },
            ACCEPT_CHILDREN => Self::AcceptChildren {
                value: r.read_bool()?,
            },
            BRANCH_LEVEL => Self::BranchLevel {
                level: r.read_u32()?,
            },
            BRANCH_ROOT => Self::BranchRoot {
                username: r.read_string()?,
            },
            SHARED_FOLDERS_FILES => Self::SharedFoldersFiles {
                folders: r.read_u32()?,
                files: r.read_u32()?,
            },
            GET_USER_STATS => {
                let username = r.read_string()?;
                if r.remaining() == 0 {
                    Self::GetUserStats { username }
                } else {
                    Self::UserStats {
                        username,
                        average_speed: r.read_u32()?,
                        upload_count: r.read_u64()?,
                        shared_files: r.read_u32()?,
                        shared_folders: r.read_u32()?,
                    }
                }
            }
            CHECK_PRIVILEGES => {
                if payload.is_empty() {
                    Self::CheckPrivileges
                } else {
                    Self::PrivilegesLeft {
                        seconds: r.read_u32()?,
                    }
                }
            }
            ADD_THING_I_LIKE => Self::AddThingILike {
                item: r.read_string()?,
            },
            ADD_THING_I_HATE => Self::AddThingIHate {
                item: r.read_string()?,
            },
            GET_RECOMMENDATIONS => {
                if payload.is_empty() {
                    Self::GetRecommendations
                } else {
                    let count = r.read_u32()? as usize;
                    let mut items = Vec::with_capacity(count);
                    for _ in 0..count {
                        items.push((r.read_string()?, r.read_i32()?));
                    }
                    Self::Recommendations { items }
                }
            }
            GET_SIMILAR_USERS => {
                if payload.is_empty() {
                    Self::GetSimilarUsers
                } else {
                    let count = r.read_u32()? as usize;
                    let mut usernames = Vec::with_capacity(count);
                    for _ in 0..count {
                        usernames.push(r.read_string()?);
                    }
                    Self::SimilarUsers { usernames }
                }
            }
            _ => {
                return None;
            }
        })
    }
}

/// Encodes a single server message into a fresh, self-contained frame.
pub fn encode_server(msg: &ServerMessage) -> BytesMut {
    let mut payload = BytesMut::new();
    msg.encode_payload(&mut payload);
    let mut buf = BytesMut::with_capacity(8 + payload.len());
    buf.write_u32(4 + payload.len() as u32);
    buf.write_u32(msg.code());
    buf.put_slice(&payload);
    buf
}

/// Attempts to decode one frame from the front of `buf`, per §4.1's
/// contract. Unrecognized codes decode to `ServerMessage::Unknown` rather
/// than an error so the caller can log and ignore it.
pub fn decode_server(buf: &[u8]) -> Result<Decoded<ServerMessage>, Error> {
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
    if len < 4 {
        return Err(Error::Decode {
            code: 0,
            reason: "frame shorter than a code field".to_owned(),
        });
    }
    let code = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
    let payload = &buf[8..total];
    let msg = ServerMessage::decode_payload(code, payload).unwrap_or_else(|| {
        ServerMessage::Unknown(Unknown {
            code,
            payload: payload.to_vec(),
        })
    });
    Ok(Decoded::Message(msg, total))
}

/// `tokio_util::codec` adapter over [`encode_server`]/[`decode_server`],
/// for driving the server session's socket with `Framed`.
#[derive(Debug, Default)]
pub struct ServerCodec;

impl Decoder for ServerCodec {
    type Item = ServerMessage;
    type Error = Error;

    fn decode(
        &mut self,
        src: &mut BytesMut,
    ) -> Result<Option<Self::Item>, Self::Error> {
        match decode_server(src)? {
            Decoded::Message(msg, consumed) => {
                src.advance(consumed);
                Ok(Some(msg))
            }
            Decoded::NeedMore => Ok(None),
        }
    }
}

impl Encoder<ServerMessage> for ServerCodec {
    type Error = Error;

    fn encode(
        &mut self,
        item: ServerMessage,
        dst: &mut BytesMut,
    ) -> Result<(), Self::Error> {
        dst.put_slice(&encode_server(&item));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::test_support::build_u32_code_frame;

    fn round_trip(msg: ServerMessage) {
        let encoded = encode_server(&msg);
        match decode_server(&encoded).unwrap() {
            Decoded::Message(decoded, consumed) => {
                assert_eq!(consumed, encoded.len());
                assert_eq!(decoded, msg);
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn round_trip_login_request() {
        round_trip(ServerMessage::Login {
            username: "alice".to_owned(),
            password_hash: "deadbeef".to_owned(),
            version: crate::PROTOCOL_VERSION,
        });
    }

    #[test]
    fn round_trip_login_response() {
        round_trip(ServerMessage::LoginResponse {
            success: true,
            message: "Welcome!".to_owned(),
        });
    }

    #[test]
    fn round_trip_peer_address() {
        round_trip(ServerMessage::PeerAddress {
            username: "alice".to_owned(),
            ip: Ipv4Addr::new(203, 0, 113, 9),
            port: 2235,
        });
    }

    #[test]
    fn round_trip_connect_to_peer() {
        round_trip(ServerMessage::ConnectToPeer {
            username: "bob".to_owned(),
            conn_type: "F".to_owned(),
            ip: Ipv4Addr::new(198, 51, 100, 3),
            port: 2234,
            token: 42,
        });
    }

    #[test]
    fn round_trip_room_list() {
        round_trip(ServerMessage::RoomList {
            rooms: vec![("lobby".to_owned(), 10), ("jazz".to_owned(), 3)],
        });
    }

    #[test]
    fn trailing_bytes_are_left_for_next_frame() {
        let msg = ServerMessage::HaveNoParent { value: true };
        let mut encoded = encode_server(&msg);
        let trailing = [9, 9, 9];
        encoded.extend_from_slice(&trailing);
        match decode_server(&encoded).unwrap() {
            Decoded::Message(decoded, consumed) => {
                assert_eq!(decoded, msg);
                assert_eq!(consumed, encoded.len() - trailing.len());
            }
            Decoded::NeedMore => panic!("expected a full message"),
        }
    }

    #[test]
    fn every_prefix_shorter_than_full_frame_needs_more() {
        let encoded = encode_server(&ServerMessage::BranchLevel { level: 3 });
        for prefix_len in 0..encoded.len() {
            let prefix = &encoded[..prefix_len];
            assert_eq!(
                decode_server(prefix).unwrap(),
                Decoded::NeedMore,
                "prefix of length {} should need more",
                prefix_len
            );
        }
    }

    #[test]
    fn oversized_frame_is_rejected() {
        let mut buf = BytesMut::new();
        buf.write_u32(MAX_FRAME_LEN + 1);
        let err = decode_server(&buf).unwrap_err();
        assert!(matches!(err, Error::FrameTooLarge(_)));
    }

    #[test]
    fn unknown_code_decodes_to_unknown_variant() {
        let frame = build_u32_code_frame(0xFFFF_FFF0, b"payload");
        match decode_server(&frame).unwrap() {
            Decoded::Message(ServerMessage::Unknown(u), consumed) => {
                assert_eq!(u.code, 0xFFFF_FFF0);
                assert_eq!(u.payload, b"payload");
                assert_eq!(consumed, frame.len());
            }
            other => panic!("expected Unknown, got {:?}", other),
        }
    }
}
