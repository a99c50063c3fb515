//! The peer connection pool: accepts inbound sockets, dials outbound ones,
//! and runs the direct/indirect negotiation state machine that every "P"
//! and "D" connection goes through before it is reusable.
//!
//! "F" connections don't live in the pool's reuse table at all — they are
//! one-shot, handed to whichever manager recognizes the username via
//! [`crate::callbacks::PoolSinks::publish_file_connection`]. See
//! [`PeerPool::dial_file_connection`] and the `ConnType::File` branches of
//! [`PeerPool::accept_inbound`] and [`PeerPool::handle_connect_to_peer`].

use std::collections::HashMap;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use lru::LruCache;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::oneshot;
use tokio_util::codec::{Framed, FramedParts};

use crate::callbacks::{FileConnectionEvent, PoolSinks, ReadyConnectionEvent};
use crate::codec::distributed::DistributedCodec;
use crate::codec::peer::{encode_handshake, Handshake, HandshakeCodec, PeerCodec};
use crate::conf::PeerConf;
use crate::error::{Error, Result};
use crate::peer::connection::{spawn_distributed_connection, spawn_peer_connection, PeerConnection};
use crate::peer::file_socket::FileSocket;
use crate::{ConnType, Side, Token};

/// The future type a [`ServerLink`] implementation returns. Hand-rolled
/// rather than pulling in `async-trait`, which isn't part of this crate's
/// dependency stack.
pub type LinkFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// The slice of `ServerSession` capability the pool needs to complete the
/// direct/indirect negotiation: resolving a username to an endpoint, and
/// asking the server to relay a connection request after a direct dial
/// fails. Kept as a trait so the pool has no compile-time dependency on
/// `crate::server`, breaking what would otherwise be a cycle between the
/// two modules (see the design note in `crate::callbacks`).
pub trait ServerLink: Send + Sync {
    fn resolve_address<'a>(&'a self, username: &'a str) -> LinkFuture<'a, Result<(Ipv4Addr, u16)>>;
    fn cant_connect_to_peer<'a>(&'a self, token: Token, username: &'a str) -> LinkFuture<'a, ()>;
}

/// Connection purposes the pool keeps alive and reuses. "F" is deliberately
/// not a variant here: it never enters the reuse table, so there is no
/// state in which a stale "F" entry could linger.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PersistentPurpose {
    Peer,
    Distributed,
}

impl PersistentPurpose {
    fn as_conn_type(self) -> ConnType {
        match self {
            Self::Peer => ConnType::Peer,
            Self::Distributed => ConnType::Distributed,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct ConnKey {
    username_lower: String,
    purpose: PersistentPurpose,
}

/// What an in-flight [`PeerPool::request_connection`] call is waiting for,
/// so an inbound `PierceFirewall` (keyed by token) or a racing inbound
/// `PeerInit` (keyed by username) can complete it in place.
struct PendingRequest {
    username: String,
    purpose: PersistentPurpose,
    responder: oneshot::Sender<Result<Arc<PeerConnection>>>,
}

pub struct PeerPool {
    conf: PeerConf,
    our_username: String,
    sinks: PoolSinks,
    connections: Mutex<LruCache<ConnKey, Arc<PeerConnection>>>,
    pending: Mutex<HashMap<Token, PendingRequest>>,
    // One lock per (username, purpose) so concurrent callers asking for the
    // same connection share a single dial attempt instead of racing two.
    // Entries are never removed; the map stays small in practice (one per
    // distinct peer we've ever dialed) and the alternative -- reference
    // counting the locks out -- isn't worth the complexity here.
    dial_locks: Mutex<HashMap<ConnKey, Arc<tokio::sync::Mutex<()>>>>,
    next_token: AtomicU32,
}

impl PeerPool {
    pub fn new(conf: PeerConf, our_username: impl Into<String>, sinks: PoolSinks) -> Arc<Self> {
        Arc::new(Self {
            conf,
            our_username: our_username.into(),
            sinks,
            // Unbounded: the cap in `conf.max_connections` is enforced by
            // `evict_if_at_capacity`, not by the cache itself, because the
            // cache's own LRU eviction would happily close a connection
            // that's mid-transfer just because it was least recently
            // touched. §4.3 requires eviction to pick the oldest *idle* "P"
            // connection with no pending request, never one in active use.
            connections: Mutex::new(LruCache::unbounded()),
            pending: Mutex::new(HashMap::new()),
            dial_locks: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
        })
    }

    fn next_token(&self) -> Token {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

    /// Reuses an existing "P"/"D" connection to `username`, or runs the
    /// direct/indirect negotiation state machine (§4.3) to establish one.
    pub async fn request_connection(
        self: &Arc<Self>,
        username: &str,
        purpose: PersistentPurpose,
        server: &dyn ServerLink,
    ) -> Result<Arc<PeerConnection>> {
        let key = ConnKey {
            username_lower: username.to_lowercase(),
            purpose,
        };

        let dial_lock = {
            let mut locks = self.dial_locks.lock().unwrap();
            locks
                .entry(key.clone())
                .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
                .clone()
        };
        let _guard = dial_lock.lock().await;

        if let Some(conn) = self.connections.lock().unwrap().get(&key).cloned() {
            return Ok(conn);
        }

        // RESOLVE
        let token = self.next_token();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().insert(
            token,
            PendingRequest {
                username: username.to_owned(),
                purpose,
                responder: tx,
            },
        );

        let (ip, port) = match server.resolve_address(username).await {
            Ok(addr) => addr,
            Err(e) => {
                self.pending.lock().unwrap().remove(&token);
                return Err(e);
            }
        };

        // DIRECT_DIAL
        let dial = tokio::time::timeout(
            self.conf.direct_dial_timeout,
            TcpStream::connect((ip, port)),
        )
        .await;

        match dial {
            Ok(Ok(socket)) => {
                if self.pending.lock().unwrap().remove(&token).is_none() {
                    // A racing inbound PeerInit already promoted this
                    // request to READY; our own dial lost the race.
                    drop(socket);
                    return rx.await.unwrap_or(Err(Error::ConnectionClosed));
                }
                let addr = SocketAddr::new(ip.into(), port);
                let conn = self
                    .finish_direct_dial(socket, addr, username, purpose, token)
                    .await?;
                self.insert_ready(key, conn.clone());
                Ok(conn)
            }
            _ => {
                // INDIRECT
                log::info!(
                    "direct dial to {} for a \"{}\" connection failed, asking the server to relay",
                    username,
                    purpose.as_conn_type()
                );
                server.cant_connect_to_peer(token, username).await;

                // AWAIT_PIERCE
                match tokio::time::timeout(self.conf.pierce_wait_timeout, rx).await {
                    Ok(Ok(result)) => result,
                    Ok(Err(_)) => Err(Error::ConnectionClosed),
                    Err(_) => {
                        self.pending.lock().unwrap().remove(&token);
                        Err(Error::Timeout)
                    }
                }
            }
        }
    }

    async fn finish_direct_dial(
        &self,
        socket: TcpStream,
        addr: SocketAddr,
        username: &str,
        purpose: PersistentPurpose,
        token: Token,
    ) -> Result<Arc<PeerConnection>> {
        let handshake = Handshake::PeerInit {
            username: self.our_username.clone(),
            conn_type: purpose.as_conn_type(),
            token,
        };
        let mut framed = Framed::new(socket, HandshakeCodec);
        framed
            .send(handshake)
            .await
            .map_err(|_| Error::ConnectionClosed)?;
        Ok(self.reframe_and_spawn(framed, addr, username.to_owned(), purpose, Side::Outbound))
    }

    /// Called by the server session when an inbound `ConnectToPeer` asks us
    /// to dial a peer that failed to reach us directly. We are the dialer
    /// here but the *indirect* side of the handshake, so we send
    /// `PierceFirewall` rather than `PeerInit`.
    pub async fn handle_connect_to_peer(
        &self,
        username: String,
        conn_type: ConnType,
        ip: Ipv4Addr,
        port: u16,
        token: Token,
    ) {
        let addr = SocketAddr::new(ip.into(), port);
        let socket =
            match tokio::time::timeout(self.conf.direct_dial_timeout, TcpStream::connect((ip, port)))
                .await
            {
                Ok(Ok(s)) => s,
                _ => {
                    log::info!(
                        "could not dial {} at {} for a server-relayed connection",
                        username,
                        addr
                    );
                    return;
                }
            };

        let mut framed = Framed::new(socket, HandshakeCodec);
        if let Err(e) = framed.send(Handshake::PierceFirewall { token }).await {
            log::warn!("failed to send PierceFirewall to {}: {}", username, e);
            return;
        }

        match conn_type {
            ConnType::Peer => {
                let key = ConnKey {
                    username_lower: username.to_lowercase(),
                    purpose: PersistentPurpose::Peer,
                };
                let conn =
                    self.reframe_and_spawn(framed, addr, username, PersistentPurpose::Peer, Side::Outbound);
                self.insert_ready(key, conn);
            }
            ConnType::Distributed => {
                let key = ConnKey {
                    username_lower: username.to_lowercase(),
                    purpose: PersistentPurpose::Distributed,
                };
                let conn = self.reframe_and_spawn(
                    framed,
                    addr,
                    username,
                    PersistentPurpose::Distributed,
                    Side::Outbound,
                );
                self.insert_ready(key, conn);
            }
            ConnType::File => {
                let parts = framed.into_parts();
                let leftover = parts.read_buf.to_vec();
                self.sinks.publish_file_connection(FileConnectionEvent {
                    username,
                    stream: FileSocket::new(parts.io, leftover),
                    obfuscated: false,
                });
            }
        }
    }

    /// Dials a peer directly for a one-shot "F" connection, per the
    /// Download Manager's `OUTBOUND_F_DIAL` step. There is no indirect
    /// fallback for this leg: by the time a download reaches here it
    /// already has a live "P" connection to the same peer, so a failure is
    /// just a failed transfer attempt rather than cause to ask the server
    /// to relay.
    pub async fn dial_file_connection(&self, ip: Ipv4Addr, port: u16) -> Result<FileSocket> {
        let socket = tokio::time::timeout(
            self.conf.direct_dial_timeout,
            TcpStream::connect((ip, port)),
        )
        .await
        .map_err(|_| Error::Timeout)?
        .map_err(Error::Io)?;

        let mut socket = socket;
        let handshake = encode_handshake(&Handshake::PeerInit {
            username: self.our_username.clone(),
            conn_type: ConnType::File,
            token: 0,
        });
        socket.write_all(&handshake).await.map_err(Error::Io)?;
        Ok(FileSocket::new(socket, Vec::new()))
    }

    /// Decodes the handshake on a freshly accepted socket and routes it:
    /// "P"/"D" connections are reframed and registered as reusable, "F"
    /// connections are handed off raw.
    pub async fn accept_inbound(self: &Arc<Self>, socket: TcpStream, obfuscated: bool) {
        let addr = match socket.peer_addr() {
            Ok(a) => a,
            Err(_) => return,
        };
        let mut framed = Framed::new(socket, HandshakeCodec);
        let handshake = match framed.next().await {
            Some(Ok(h)) => h,
            Some(Err(e)) => {
                log::warn!("inbound handshake from {} failed to decode: {}", addr, e);
                return;
            }
            None => {
                log::debug!("inbound connection from {} closed before a handshake arrived", addr);
                return;
            }
        };

        match handshake {
            Handshake::PeerInit {
                username,
                conn_type,
                token: _,
            } => match conn_type {
                ConnType::Peer => {
                    let conn = self.reframe_and_spawn(
                        framed,
                        addr,
                        username.clone(),
                        PersistentPurpose::Peer,
                        Side::Inbound,
                    );
                    self.insert_ready(
                        ConnKey {
                            username_lower: username.to_lowercase(),
                            purpose: PersistentPurpose::Peer,
                        },
                        conn.clone(),
                    );
                    self.resolve_pending(&username, PersistentPurpose::Peer, conn);
                }
                ConnType::Distributed => {
                    let conn = self.reframe_and_spawn(
                        framed,
                        addr,
                        username.clone(),
                        PersistentPurpose::Distributed,
                        Side::Inbound,
                    );
                    self.insert_ready(
                        ConnKey {
                            username_lower: username.to_lowercase(),
                            purpose: PersistentPurpose::Distributed,
                        },
                        conn.clone(),
                    );
                    self.resolve_pending(&username, PersistentPurpose::Distributed, conn);
                }
                ConnType::File => {
                    let parts = framed.into_parts();
                    let leftover = parts.read_buf.to_vec();
                    self.sinks.publish_file_connection(FileConnectionEvent {
                        username,
                        stream: FileSocket::new(parts.io, leftover),
                        obfuscated,
                    });
                }
            },
            Handshake::PierceFirewall { token } => {
                let pending = self.pending.lock().unwrap().remove(&token);
                match pending {
                    Some(p) => {
                        let conn = self.reframe_and_spawn(
                            framed,
                            addr,
                            p.username.clone(),
                            p.purpose,
                            Side::Inbound,
                        );
                        self.insert_ready(
                            ConnKey {
                                username_lower: p.username.to_lowercase(),
                                purpose: p.purpose,
                            },
                            conn.clone(),
                        );
                        let _ = p.responder.send(Ok(conn));
                    }
                    None => {
                        log::debug!(
                            "PierceFirewall from {} matched no pending request (token {})",
                            addr,
                            token
                        );
                    }
                }
            }
        }
    }

    /// An inbound `PeerInit` naming a user for whom we have a pending
    /// `RESOLVE`/`DIRECT_DIAL`/`AWAIT_PIERCE` completes that request in
    /// place instead of leaving it to time out next to a connection we
    /// already have.
    fn resolve_pending(&self, username: &str, purpose: PersistentPurpose, conn: Arc<PeerConnection>) {
        let mut pending = self.pending.lock().unwrap();
        let token = pending
            .iter()
            .find(|(_, p)| p.purpose == purpose && p.username.eq_ignore_ascii_case(username))
            .map(|(t, _)| *t);
        if let Some(token) = token {
            if let Some(p) = pending.remove(&token) {
                let _ = p.responder.send(Ok(conn));
            }
        }
    }

    fn reframe_and_spawn(
        &self,
        framed: Framed<TcpStream, HandshakeCodec>,
        addr: SocketAddr,
        username: String,
        purpose: PersistentPurpose,
        side: Side,
    ) -> Arc<PeerConnection> {
        let parts = framed.into_parts();
        match purpose {
            PersistentPurpose::Peer => {
                let mut new_parts = FramedParts::new(parts.io, PeerCodec);
                new_parts.read_buf = parts.read_buf;
                spawn_peer_connection(Framed::from_parts(new_parts), addr, username, side, self.sinks.clone())
            }
            PersistentPurpose::Distributed => {
                let mut new_parts = FramedParts::new(parts.io, DistributedCodec);
                new_parts.read_buf = parts.read_buf;
                spawn_distributed_connection(
                    Framed::from_parts(new_parts),
                    addr,
                    username,
                    side,
                    self.sinks.clone(),
                )
            }
        }
    }

    fn insert_ready(&self, key: ConnKey, conn: Arc<PeerConnection>) {
        self.evict_if_at_capacity();
        self.connections.lock().unwrap().put(key, conn.clone());
        self.sinks.publish_ready_connection(ReadyConnectionEvent { conn });
    }

    /// Enforces `conf.max_connections` by closing the oldest idle "P"/"D"
    /// connection -- one that has seen no activity for at least
    /// `conf.idle_timeout` and has no request pending against it -- per
    /// §4.3's "Caps and eviction". If no connection currently qualifies as
    /// idle (every held connection has been touched recently, e.g. because
    /// it is mid-transfer), nothing is evicted and the pool temporarily
    /// grows past the cap rather than closing a connection still in use.
    /// "F" connections are never candidates here: they never enter this
    /// table in the first place (see the module docs), so the "RECEIVING
    /// is never evicted" invariant holds unconditionally.
    fn evict_if_at_capacity(&self) {
        let mut connections = self.connections.lock().unwrap();
        if connections.len() < self.conf.max_connections {
            return;
        }

        let pending = self.pending.lock().unwrap();
        let has_pending = |username: &str, purpose: PersistentPurpose| {
            pending
                .values()
                .any(|p| p.purpose == purpose && p.username.eq_ignore_ascii_case(username))
        };

        // `iter()` walks most-recently-used first; the last idle-enough
        // match found is therefore the least recently used one.
        let victim = connections
            .iter()
            .filter(|(key, conn)| {
                conn.idle_for() >= self.conf.idle_timeout
                    && !has_pending(&key.username_lower, key.purpose)
            })
            .last()
            .map(|(key, _)| key.clone());
        drop(pending);

        if let Some(key) = victim {
            log::info!(
                "evicting idle {} connection to {} to stay within the connection cap",
                key.purpose.as_conn_type(),
                key.username_lower
            );
            connections.pop(&key);
        }
    }

    /// Number of "P"/"D" connections currently held, for diagnostics and
    /// tests.
    pub fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::peer::decode_handshake;
    use crate::codec::Decoded;
    use crate::conf::PeerConf;
    use std::net::SocketAddrV4;
    use std::time::Duration;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    struct StubServerLink {
        addr: SocketAddrV4,
    }

    impl ServerLink for StubServerLink {
        fn resolve_address<'a>(&'a self, _username: &'a str) -> LinkFuture<'a, Result<(Ipv4Addr, u16)>> {
            let addr = self.addr;
            Box::pin(async move { Ok((*addr.ip(), addr.port())) })
        }

        fn cant_connect_to_peer<'a>(&'a self, _token: Token, _username: &'a str) -> LinkFuture<'a, ()> {
            Box::pin(async move {})
        }
    }

    fn fast_conf() -> PeerConf {
        PeerConf {
            max_connections: 8,
            direct_dial_timeout: Duration::from_millis(200),
            pierce_wait_timeout: Duration::from_millis(200),
            idle_timeout: Duration::from_secs(60),
            peer_address_timeout: Duration::from_millis(200),
        }
    }

    #[tokio::test]
    async fn direct_dial_establishes_a_reusable_peer_connection() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };

        let pool = PeerPool::new(fast_conf(), "us", PoolSinks::new());
        let link = StubServerLink { addr };

        let (accepted, result) = tokio::join!(listener.accept(), async {
            pool.request_connection("alice", PersistentPurpose::Peer, &link)
                .await
        });
        let (mut socket, _) = accepted.unwrap();
        let conn = result.unwrap();
        assert_eq!(conn.username, "alice");
        assert_eq!(conn.side, Side::Outbound);

        let mut buf = vec![0u8; 64];
        let n = socket.read(&mut buf).await.unwrap();
        match decode_handshake(&buf[..n]).unwrap() {
            Decoded::Message(Handshake::PeerInit { username, conn_type, .. }, _) => {
                assert_eq!(username, "us");
                assert_eq!(conn_type, ConnType::Peer);
            }
            other => panic!("unexpected handshake: {:?}", other),
        }

        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn reused_connection_skips_a_second_dial() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = match listener.local_addr().unwrap() {
            SocketAddr::V4(a) => a,
            _ => unreachable!(),
        };
        let pool = PeerPool::new(fast_conf(), "us", PoolSinks::new());
        let link = StubServerLink { addr };

        let (accepted, result) = tokio::join!(listener.accept(), async {
            pool.request_connection("alice", PersistentPurpose::Peer, &link)
                .await
        });
        let _socket = accepted.unwrap();
        let first = result.unwrap();

        let second = pool
            .request_connection("ALICE", PersistentPurpose::Peer, &link)
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn accept_inbound_registers_a_peer_init_connection() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let pool = PeerPool::new(fast_conf(), "us", PoolSinks::new());

        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let (server_socket, _) = accepted.unwrap();

        let handshake_bytes = encode_handshake(&Handshake::PeerInit {
            username: "bob".to_owned(),
            conn_type: ConnType::Peer,
            token: 7,
        });
        client.write_all(&handshake_bytes).await.unwrap();

        pool.accept_inbound(server_socket, false).await;

        assert_eq!(pool.connection_count(), 1);
    }

    /// Connects a fresh loopback pair, sends a `PeerInit` for `username` on
    /// it, and hands the accepted side to `pool.accept_inbound`. Returns the
    /// client half so the caller can keep it alive (dropping it would close
    /// the connection pool just registered).
    async fn register_inbound_peer(
        pool: &Arc<PeerPool>,
        listener: &mut TcpListener,
        username: &str,
    ) -> TcpStream {
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let mut client = client.unwrap();
        let (server_socket, _) = accepted.unwrap();
        client
            .write_all(&encode_handshake(&Handshake::PeerInit {
                username: username.to_owned(),
                conn_type: ConnType::Peer,
                token: 1,
            }))
            .await
            .unwrap();
        pool.accept_inbound(server_socket, false).await;
        client
    }

    #[tokio::test]
    async fn capacity_pressure_evicts_the_oldest_idle_connection() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut conf = fast_conf();
        conf.max_connections = 1;
        conf.idle_timeout = Duration::from_millis(20);
        let pool = PeerPool::new(conf, "us", PoolSinks::new());

        let _alice = register_inbound_peer(&pool, &mut listener, "alice").await;
        assert_eq!(pool.connection_count(), 1);

        // let alice's connection go idle past the configured threshold
        tokio::time::sleep(Duration::from_millis(40)).await;

        let _bob = register_inbound_peer(&pool, &mut listener, "bob").await;

        // the idle "alice" connection was evicted to make room for "bob"
        assert_eq!(pool.connection_count(), 1);
    }

    #[tokio::test]
    async fn capacity_pressure_does_not_evict_a_busy_connection() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let mut conf = fast_conf();
        conf.max_connections = 1;
        conf.idle_timeout = Duration::from_secs(3600);
        let pool = PeerPool::new(conf, "us", PoolSinks::new());

        let _alice = register_inbound_peer(&pool, &mut listener, "alice").await;
        let _bob = register_inbound_peer(&pool, &mut listener, "bob").await;

        // neither connection was idle long enough to be evicted, so the
        // pool temporarily holds both despite the cap of 1.
        assert_eq!(pool.connection_count(), 2);
    }
}
