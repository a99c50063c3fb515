//! Event channels the peer connection pool uses to hand inbound traffic to
//! whichever subsystem owns that purpose.
//!
//! The source this crate is modeled on wires subsystems together with
//! closures captured at construction time, producing a cycle between the
//! pool, the download manager and the server session (§9 "Pending-request
//! reconciliation"). Here that cycle is flattened: the pool publishes three
//! broadcast streams — "P" messages, "D" messages, and freshly
//! established "F" sockets — and each interested subsystem subscribes to
//! the ones it cares about and ignores the rest. A `broadcast` channel
//! (rather than three separate `mpsc`s) is used because more than one
//! subscriber legitimately wants the same "P" message (e.g. both the
//! Download Manager and the Upload Manager inspect transfer-queue traffic
//! on the same connection, since one user can simultaneously be uploading
//! to us and downloading from us).

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::codec::distributed::DistributedMessage;
use crate::codec::peer::PeerMessage;
use crate::peer::connection::PeerConnection;
use crate::peer::file_socket::FileSocket;

/// Depth of each broadcast channel. Generous enough that a subscriber that
/// is momentarily busy (e.g. blocked on a disk write) doesn't cause the
/// pool's dispatch loop to apply backpressure to unrelated connections;
/// subscribers that fall behind this far receive `RecvError::Lagged` and
/// resynchronize rather than stall the pool.
const CHANNEL_CAPACITY: usize = 1024;

/// A steady-state "P" message arriving on any connection the pool holds.
#[derive(Clone, Debug)]
pub struct PeerMessageEvent {
    pub username: String,
    pub message: PeerMessage,
}

/// A "D" message arriving from our distributed parent or one of our
/// children.
#[derive(Clone, Debug)]
pub struct DistributedMessageEvent {
    pub username: String,
    pub message: DistributedMessage,
}

/// A freshly accepted or dialed "F" socket, handed off raw: file-transfer
/// bytes are unframed past the handshake, so there is no codec to drive.
pub struct FileConnectionEvent {
    pub username: String,
    pub stream: FileSocket,
    pub obfuscated: bool,
}

/// A "P" or "D" connection that just became ready -- freshly dialed,
/// accepted, or promoted from a pending indirect negotiation. The server
/// session subscribes to these to maintain its distributed-children set
/// (§3) without the pool needing a compile-time dependency on
/// `crate::server`, the same way `ServerLink` keeps the dependency pointed
/// the other way.
#[derive(Clone)]
pub struct ReadyConnectionEvent {
    pub conn: Arc<PeerConnection>,
}

/// The broadcasting halves the pool holds; constructed once alongside the
/// pool and cloned into every `PeerConnection` read loop.
#[derive(Clone)]
pub struct PoolSinks {
    peer_messages: broadcast::Sender<PeerMessageEvent>,
    distributed_messages: broadcast::Sender<DistributedMessageEvent>,
    file_connections: broadcast::Sender<std::sync::Arc<std::sync::Mutex<Option<FileConnectionEvent>>>>,
    ready_connections: broadcast::Sender<ReadyConnectionEvent>,
}

impl PoolSinks {
    pub fn new() -> Self {
        let (peer_messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (distributed_messages, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (file_connections, _) = broadcast::channel(CHANNEL_CAPACITY);
        let (ready_connections, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            peer_messages,
            distributed_messages,
            file_connections,
            ready_connections,
        }
    }

    pub fn publish_peer_message(&self, event: PeerMessageEvent) {
        // No subscribers is a normal state (e.g. in tests); a send error
        // here just means nobody's listening right now.
        let _ = self.peer_messages.send(event);
    }

    pub fn publish_distributed_message(&self, event: DistributedMessageEvent) {
        let _ = self.distributed_messages.send(event);
    }

    /// `TcpStream` isn't `Clone`, but `broadcast::Sender` requires its
    /// payload to be so every subscriber can receive its own copy. Since at
    /// most one subscriber can meaningfully claim a given "F" socket, we
    /// wrap it in a `Mutex<Option<_>>` and let the first subscriber to match
    /// it `take()` the stream; everyone else sees `None` and moves on.
    pub fn publish_file_connection(&self, event: FileConnectionEvent) {
        let _ = self
            .file_connections
            .send(std::sync::Arc::new(std::sync::Mutex::new(Some(event))));
    }

    pub fn subscribe_peer_messages(&self) -> broadcast::Receiver<PeerMessageEvent> {
        self.peer_messages.subscribe()
    }

    pub fn subscribe_distributed_messages(&self) -> broadcast::Receiver<DistributedMessageEvent> {
        self.distributed_messages.subscribe()
    }

    pub fn subscribe_file_connections(
        &self,
    ) -> broadcast::Receiver<std::sync::Arc<std::sync::Mutex<Option<FileConnectionEvent>>>> {
        self.file_connections.subscribe()
    }

    pub fn publish_ready_connection(&self, event: ReadyConnectionEvent) {
        let _ = self.ready_connections.send(event);
    }

    pub fn subscribe_ready_connections(&self) -> broadcast::Receiver<ReadyConnectionEvent> {
        self.ready_connections.subscribe()
    }
}

impl Default for PoolSinks {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::peer::PeerMessage;

    #[tokio::test]
    async fn peer_message_fans_out_to_every_subscriber() {
        let sinks = PoolSinks::new();
        let mut a = sinks.subscribe_peer_messages();
        let mut b = sinks.subscribe_peer_messages();

        sinks.publish_peer_message(PeerMessageEvent {
            username: "alice".to_owned(),
            message: PeerMessage::GetSharedFileList,
        });

        assert_eq!(a.recv().await.unwrap().username, "alice");
        assert_eq!(b.recv().await.unwrap().username, "alice");
    }

    #[tokio::test]
    async fn file_connection_is_claimed_by_first_taker() {
        use tokio::net::{TcpListener, TcpStream};

        let sinks = PoolSinks::new();
        let mut a = sinks.subscribe_file_connections();
        let mut b = sinks.subscribe_file_connections();

        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stream, _) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let stream = stream.unwrap();

        sinks.publish_file_connection(FileConnectionEvent {
            username: "bob".to_owned(),
            stream: FileSocket::new(stream, Vec::new()),
            obfuscated: false,
        });

        let slot_a = a.recv().await.unwrap();
        let slot_b = b.recv().await.unwrap();
        let taken_by_a = slot_a.lock().unwrap().take();
        let taken_by_b = slot_b.lock().unwrap().take();
        assert!(taken_by_a.is_some() ^ taken_by_b.is_some());
    }
}
