//! The typed event stream this crate emits towards whatever consumes it.
//!
//! Per the composition notes in the specification (§9 "Main-actor UI
//! binding"), no component reaches into a UI thread or a shared mutable
//! view-model. Instead every subsystem that has something to report pushes
//! an [`Event`] onto a bounded `tokio::sync::mpsc` channel, and the caller
//! (a UI, a headless bot, a test harness) drains it however it likes.

use crate::transfer::{Direction, TransferId, TransferStatus};
use crate::Token;

/// One item of a search response, as reported by [`crate::interfaces::ShareIndex`].
#[derive(Clone, Debug, PartialEq)]
pub struct SearchResultFile {
    pub path: String,
    pub size: u64,
}

/// Everything this crate can tell the outside world about.
#[derive(Clone, Debug, PartialEq)]
pub enum Event {
    /// The server session began dialing.
    Connecting,
    /// The server session completed login successfully.
    Connected,
    /// The server session ended, with an error description if it wasn't a
    /// caller-initiated `disconnect()`.
    Disconnected { error: Option<String> },

    /// Search results gathered for a query we originated (ticket matches a
    /// `FileSearch`/`WishlistSearch` we sent).
    SearchResult {
        ticket: Token,
        username: String,
        results: Vec<SearchResultFile>,
    },

    /// The list of public rooms and their user counts.
    RoomList { rooms: Vec<(String, u32)> },
    /// A message said in a room we're a member of.
    RoomMessage {
        room: String,
        username: String,
        message: String,
    },
    /// A private message, in either direction.
    PrivateMessage {
        id: u32,
        timestamp: u32,
        username: String,
        message: String,
    },

    /// A peer's address resolved (or failed to resolve) in response to a
    /// `get_peer_address` request.
    PeerAddressResolved {
        username: String,
        addr: Option<std::net::SocketAddr>,
    },
    /// A queued upload of ours was turned down outright.
    UploadDenied { username: String, filename: String, reason: String },
    /// A previously accepted upload of ours failed partway through.
    UploadFailed { username: String, filename: String },
    /// A peer answered our `FolderContentsRequest`.
    FolderContentsResponse {
        username: String,
        token: Token,
        folder: String,
        compressed: Vec<u8>,
    },

    /// A transfer (download or upload) changed state.
    TransferUpdate {
        id: TransferId,
        direction: Direction,
        status: TransferStatus,
        bytes_transferred: u64,
        speed: f64,
        error: Option<String>,
        local_path: Option<std::path::PathBuf>,
    },
}
