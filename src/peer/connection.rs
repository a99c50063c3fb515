//! A single live "P" or "D" connection, owned exclusively by the
//! [`crate::peer::pool::PeerPool`].
//!
//! "F" connections are not represented here: once their handshake
//! completes the raw socket is handed off via
//! [`crate::callbacks::FileConnectionEvent`] and this type never wraps one.

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use futures::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::codec::Framed;

use crate::callbacks::{DistributedMessageEvent, PeerMessageEvent, PoolSinks};
use crate::codec::distributed::{DistributedCodec, DistributedMessage};
use crate::codec::peer::{PeerCodec, PeerMessage};
use crate::error::Error;
use crate::{ConnType, Side};

/// The outbound send queue for a connection, typed per its declared purpose.
/// A "P" connection only ever accepts [`PeerMessage`]s, a "D" connection
/// only [`DistributedMessage`]s.
enum Outbound {
    Peer(mpsc::UnboundedSender<PeerMessage>),
    Distributed(mpsc::UnboundedSender<DistributedMessage>),
}

/// A live, handshaken "P" or "D" connection. Consumers are handed a cheap
/// `Arc` clone and enqueue outbound traffic through it; they never see the
/// socket itself.
pub struct PeerConnection {
    pub username: String,
    pub addr: SocketAddr,
    pub conn_type: ConnType,
    pub side: Side,
    pub created_at: Instant,
    last_activity: Mutex<Instant>,
    outbound: Outbound,
}

impl PeerConnection {
    pub fn touch(&self) {
        *self.last_activity.lock().unwrap() = Instant::now();
    }

    pub fn idle_for(&self) -> Duration {
        self.last_activity.lock().unwrap().elapsed()
    }

    /// Enqueues a "P" message. Fails if this isn't a "P" connection or the
    /// write task has already torn down.
    pub fn send_peer(&self, msg: PeerMessage) -> Result<(), Error> {
        match &self.outbound {
            Outbound::Peer(tx) => {
                self.touch();
                tx.send(msg).map_err(|_| Error::ConnectionClosed)
            }
            Outbound::Distributed(_) => Err(Error::InvalidResponse(
                "connection is not a \"P\" connection".to_owned(),
            )),
        }
    }

    /// Enqueues a "D" message.
    pub fn send_distributed(&self, msg: DistributedMessage) -> Result<(), Error> {
        match &self.outbound {
            Outbound::Distributed(tx) => {
                self.touch();
                tx.send(msg).map_err(|_| Error::ConnectionClosed)
            }
            Outbound::Peer(_) => Err(Error::InvalidResponse(
                "connection is not a \"D\" connection".to_owned(),
            )),
        }
    }
}

/// Spawns the read and write halves of a "P" connection from an already
/// handshaken [`Framed`] and returns the handle used to enqueue sends.
pub fn spawn_peer_connection(
    framed: Framed<TcpStream, PeerCodec>,
    addr: SocketAddr,
    username: String,
    side: Side,
    sinks: PoolSinks,
) -> Arc<PeerConnection> {
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<PeerMessage>();

    let conn = Arc::new(PeerConnection {
        username: username.clone(),
        addr,
        conn_type: ConnType::Peer,
        side,
        created_at: Instant::now(),
        last_activity: Mutex::new(Instant::now()),
        outbound: Outbound::Peer(tx),
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let read_username = username;
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(message) => sinks.publish_peer_message(PeerMessageEvent {
                    username: read_username.clone(),
                    message,
                }),
                Err(e) => {
                    log::warn!("\"P\" connection to {} errored: {}", read_username, e);
                    break;
                }
            }
        }
        log::info!("\"P\" connection to {} closed", read_username);
    });

    conn
}

/// Same as [`spawn_peer_connection`] but for a "D" (distributed) connection.
pub fn spawn_distributed_connection(
    framed: Framed<TcpStream, DistributedCodec>,
    addr: SocketAddr,
    username: String,
    side: Side,
    sinks: PoolSinks,
) -> Arc<PeerConnection> {
    let (mut sink, mut stream) = framed.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<DistributedMessage>();

    let conn = Arc::new(PeerConnection {
        username: username.clone(),
        addr,
        conn_type: ConnType::Distributed,
        side,
        created_at: Instant::now(),
        last_activity: Mutex::new(Instant::now()),
        outbound: Outbound::Distributed(tx),
    });

    tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if sink.send(msg).await.is_err() {
                break;
            }
        }
    });

    let read_username = username;
    tokio::spawn(async move {
        while let Some(frame) = stream.next().await {
            match frame {
                Ok(message) => sinks.publish_distributed_message(DistributedMessageEvent {
                    username: read_username.clone(),
                    message,
                }),
                Err(e) => {
                    log::warn!("\"D\" connection to {} errored: {}", read_username, e);
                    break;
                }
            }
        }
        log::info!("\"D\" connection to {} closed", read_username);
    });

    conn
}
