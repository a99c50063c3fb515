//! Core networking substrate for a Soulseek peer-to-peer client.
//!
//! This crate owns the four tightly coupled subsystems that make up the
//! hard engineering of a Soulseek client: the framed wire codec
//! ([`codec`]), the long-lived server session ([`server`]), the peer
//! connection pool with its direct/indirect negotiation state machine
//! ([`peer`]), and the download manager ([`download`]). NAT traversal
//! ([`nat`]) and the dual-listener service ([`listener`]) round out the
//! pieces needed to actually get bytes flowing between peers.
//!
//! User interfaces, settings persistence, share indexing and metadata
//! tagging are explicitly out of scope; this crate consumes small trait
//! interfaces for those concerns (see [`interfaces`]) and produces a
//! stream of [`event::Event`]s for whatever UI or service wraps it.

// needed by the `select!` macro reaching the default recursion limit
#![recursion_limit = "256"]

#[macro_use]
extern crate log;

pub mod callbacks;
pub mod codec;
mod conf;
mod disk;
pub mod download;
pub mod error;
pub mod event;
pub mod interfaces;
pub mod listener;
pub mod nat;
pub mod peer;
pub mod server;
pub mod transfer;
pub mod upload;

pub use conf::{Conf, DownloadConf, ListenerConf, NatConf, PeerConf, ServerConf, UploadConf};
pub use transfer::{Direction, TransferId, TransferStatus};

/// Soulseek's protocol version constant, sent as part of the `Login`
/// message. The server hasn't changed this in practice in many years.
pub const PROTOCOL_VERSION: u32 = 160;

/// A 32-bit token used throughout the protocol to correlate requests,
/// responses, and connection openings across subsystems (search tickets,
/// connect-request tokens, transfer tokens).
pub type Token = u32;

/// The three purposes a peer connection can be opened for, declared by
/// whichever side initiates it as part of the handshake.
///
/// "P" connections carry peer control chatter (searches, browse, queueing);
/// "F" connections are unframed file-transfer streams; "D" connections
/// carry the distributed search tree.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// Peer control: searches, browse, queue management.
    Peer,
    /// File transfer: raw bytes after a minimal handshake.
    File,
    /// Distributed search tree gossip.
    Distributed,
}

impl ConnType {
    /// Returns the single-letter wire tag for this connection type, as used
    /// in `PeerInit` and throughout logging.
    pub fn as_tag(self) -> &'static str {
        match self {
            Self::Peer => "P",
            Self::File => "F",
            Self::Distributed => "D",
        }
    }

    /// Parses the single-letter wire tag. Unknown tags are the caller's
    /// problem to reject; we don't guess.
    pub fn from_tag(tag: &str) -> Option<Self> {
        match tag {
            "P" => Some(Self::Peer),
            "F" => Some(Self::File),
            "D" => Some(Self::Distributed),
            _ => None,
        }
    }
}

impl std::fmt::Display for ConnType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_tag())
    }
}

/// Which side of a connection we are.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Side {
    /// We dialed out to the peer.
    Outbound,
    /// The peer connected to us.
    Inbound,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn conn_type_tag_round_trip() {
        for ty in [ConnType::Peer, ConnType::File, ConnType::Distributed] {
            assert_eq!(ConnType::from_tag(ty.as_tag()), Some(ty));
        }
    }

    #[test]
    fn conn_type_unknown_tag() {
        assert_eq!(ConnType::from_tag("X"), None);
    }
}
