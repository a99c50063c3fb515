//! The server session: the single long-lived TCP connection to the central
//! index server (§4.2).
//!
//! Mirrors the shape of [`crate::peer::connection`]'s split read/write
//! tasks: a writer task drains an outbound queue so every command is sent
//! in submission order, and a reader task dispatches inbound frames in
//! wire order to in-memory state updates or typed [`Event`]s. Dispatch
//! never blocks on socket I/O -- a `ConnectToPeer` handoff to the pool is
//! spawned onto its own task rather than awaited inline, since a single
//! slow dial must not stall the delivery of the next inbound frame.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use md5::{Digest, Md5};
use tokio::net::TcpStream;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::codec::Framed;

use crate::callbacks::PoolSinks;
use crate::codec::server::ServerCodec;
use crate::codec::{DistributedMessage, ServerMessage};
use crate::conf::ServerConf;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::interfaces::{Credentials, Settings, ShareIndex};
use crate::peer::connection::PeerConnection;
use crate::peer::pool::{LinkFuture, PeerPool, ServerLink};
use crate::{ConnType, Token};

/// Coalesces concurrent `get_peer_address` callers for the same username
/// (§4.3 "Peer-address request coalescing") into the single in-flight
/// request's outcome.
type PendingAddresses = Mutex<HashMap<String, Vec<oneshot::Sender<Result<(Ipv4Addr, u16)>>>>>;

/// The server session. Constructed via [`ServerSession::connect`]; every
/// other method enqueues an outbound command or reads a piece of session
/// state.
pub struct ServerSession {
    conf: ServerConf,
    our_username: String,
    outbound: mpsc::UnboundedSender<ServerMessage>,
    pool: Arc<PeerPool>,
    sinks: PoolSinks,
    share_index: Arc<dyn ShareIndex>,
    events: mpsc::Sender<Event>,
    pending_addresses: PendingAddresses,
    /// Distributed tree children, keyed by lowercased username (§3
    /// "Distributed Tree State"). Owned solely by the server session, per
    /// the invariant in §3.
    children: Mutex<HashMap<String, Arc<PeerConnection>>>,
    branch_level: AtomicU32,
    branch_root: Mutex<String>,
    next_ticket: AtomicU32,
    shutdown: broadcast::Sender<()>,
}

impl ServerSession {
    /// Performs the TCP connect, sends `Login`, starts the receive loop,
    /// and returns once a `LoginResponse` has arrived or
    /// `conf.login_grace_period` has elapsed, per §4.2's contract. The
    /// login itself may still complete after the grace period elapses;
    /// this only bounds how long the caller blocks here.
    pub async fn connect(
        conf: ServerConf,
        credentials: Credentials,
        settings: &Settings,
        pool: Arc<PeerPool>,
        sinks: PoolSinks,
        share_index: Arc<dyn ShareIndex>,
        events: mpsc::Sender<Event>,
    ) -> Result<Arc<Self>> {
        let _ = events.send(Event::Connecting).await;
        log::info!("connecting to server {}:{}", conf.host, conf.port);

        let socket = TcpStream::connect((conf.host.as_str(), conf.port))
            .await
            .map_err(|e| Error::ConnectionFailed(e.to_string()))?;
        let framed = Framed::new(socket, ServerCodec);
        let (mut sink, mut stream) = framed.split();

        let (outbound_tx, mut outbound_rx) = mpsc::unbounded_channel::<ServerMessage>();
        let (shutdown, _) = broadcast::channel(1);

        let password_hash = hex::encode(Md5::digest(
            format!("{}{}", credentials.username, credentials.password).as_bytes(),
        ));
        outbound_tx
            .send(ServerMessage::Login {
                username: credentials.username.clone(),
                password_hash,
                version: crate::PROTOCOL_VERSION,
            })
            .map_err(|_| Error::ConnectionClosed)?;

        let mut writer_shutdown = shutdown.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    msg = outbound_rx.recv() => match msg {
                        Some(msg) => {
                            if sink.send(msg).await.is_err() {
                                log::error!("server write failed, closing outbound queue");
                                break;
                            }
                        }
                        None => break,
                    },
                    _ = writer_shutdown.recv() => {
                        log::info!("server writer shutting down");
                        break;
                    }
                }
            }
        });

        let session = Arc::new(Self {
            conf: conf.clone(),
            our_username: credentials.username,
            outbound: outbound_tx,
            pool,
            sinks,
            share_index,
            events,
            pending_addresses: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            branch_level: AtomicU32::new(0),
            branch_root: Mutex::new(String::new()),
            next_ticket: AtomicU32::new(1),
            shutdown,
        });

        // §4.3 "Distributed tree": register every freshly ready "D"
        // connection the pool reports as a child, and fan out inbound
        // SearchRequests to the current child set. Spawned here rather
        // than awaited inline for the same reason the reader/writer tasks
        // are spawned: neither must stall on the other's progress.
        session
            .clone()
            .spawn_ready_connection_dispatch(session.shutdown.subscribe());
        session
            .clone()
            .spawn_distributed_message_dispatch(session.shutdown.subscribe());

        let (login_tx, login_rx) = oneshot::channel();
        let dispatch_session = session.clone();
        let listen_port = settings.listen_port;
        let obfuscated_port = settings.listen_port + 1;
        let accept_children = settings.accept_distributed_children;
        let (folders, files) = dispatch_session.share_index.totals();
        let mut reader_shutdown = dispatch_session.shutdown.subscribe();
        tokio::spawn(async move {
            dispatch_session
                .run(
                    &mut stream,
                    login_tx,
                    listen_port,
                    obfuscated_port,
                    accept_children,
                    folders,
                    files,
                    &mut reader_shutdown,
                )
                .await;
        });

        match tokio::time::timeout(conf.login_grace_period, login_rx).await {
            Ok(Ok(())) => log::info!("login completed within grace period"),
            Ok(Err(_)) => log::warn!("server connection closed before login response"),
            Err(_) => log::info!(
                "login grace period ({:?}) elapsed before a response arrived; continuing in background",
                conf.login_grace_period
            ),
        }

        Ok(session)
    }

    /// Cancels the receive task, drops the connection, and notifies
    /// listeners, per §4.2's `disconnect()` contract.
    pub fn disconnect(&self) {
        log::info!("disconnecting from server");
        let _ = self.shutdown.send(());
    }

    fn send(&self, msg: ServerMessage) -> Result<()> {
        self.outbound.send(msg).map_err(|_| Error::ConnectionClosed)
    }

    fn next_ticket(&self) -> Token {
        self.next_ticket.fetch_add(1, Ordering::Relaxed)
    }

    #[allow(clippy::too_many_arguments)]
    async fn run(
        self: Arc<Self>,
        stream: &mut (impl futures::Stream<Item = std::result::Result<ServerMessage, Error>> + Unpin),
        mut login_tx: oneshot::Sender<()>,
        listen_port: u16,
        obfuscated_port: u16,
        accept_children: bool,
        shared_folders: u32,
        shared_files: u32,
        shutdown: &mut broadcast::Receiver<()>,
    ) {
        loop {
            let frame = tokio::select! {
                frame = stream.next() => frame,
                _ = shutdown.recv() => {
                    log::info!("server reader shutting down");
                    let _ = self.events.send(Event::Disconnected { error: None }).await;
                    return;
                }
            };

            match frame {
                Some(Ok(msg)) => {
                    self.dispatch(
                        msg,
                        &mut login_tx,
                        listen_port,
                        obfuscated_port,
                        accept_children,
                        shared_folders,
                        shared_files,
                    )
                    .await;
                }
                Some(Err(e)) => {
                    log::warn!("failed to decode a server frame: {}", e);
                }
                None => {
                    log::error!("server connection closed");
                    let _ = self
                        .events
                        .send(Event::Disconnected {
                            error: Some("connection closed".to_owned()),
                        })
                        .await;
                    return;
                }
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    async fn dispatch(
        &self,
        msg: ServerMessage,
        login_tx: &mut oneshot::Sender<()>,
        listen_port: u16,
        obfuscated_port: u16,
        accept_children: bool,
        shared_folders: u32,
        shared_files: u32,
    ) {
        match msg {
            ServerMessage::LoginResponse { success, message } => {
                log::info!("login response: success={} message={:?}", success, message);
                // a second LoginResponse would be unusual; ignore the send
                // failure from an already-consumed oneshot.
                let tx = std::mem::replace(login_tx, oneshot::channel().0);
                let _ = tx.send(());
                if success {
                    let _ = self.events.send(Event::Connected).await;
                    let _ = self.send(ServerMessage::SetListenPort {
                        plain: listen_port,
                        obfuscated: obfuscated_port,
                    });
                    let _ = self.send(ServerMessage::SetOnlineStatus { online: true });
                    let _ = self.send(ServerMessage::SharedFoldersFiles {
                        folders: shared_folders,
                        files: shared_files,
                    });
                    let _ = self.send(ServerMessage::HaveNoParent { value: true });
                    let _ = self.send(ServerMessage::AcceptChildren { value: accept_children });
                    let _ = self.send(ServerMessage::BranchLevel { level: 0 });
                } else {
                    let _ = self
                        .events
                        .send(Event::Disconnected {
                            error: Some(message),
                        })
                        .await;
                }
            }
            ServerMessage::PeerAddress { username, ip, port } => {
                self.resolve_peer_address(&username, Ok((ip, port)));
                let _ = self
                    .events
                    .send(Event::PeerAddressResolved {
                        username,
                        addr: Some(std::net::SocketAddr::new(ip.into(), port)),
                    })
                    .await;
            }
            ServerMessage::ConnectToPeer {
                username,
                conn_type,
                ip,
                port,
                token,
            } => {
                let conn_type = match ConnType::from_tag(&conn_type) {
                    Some(t) => t,
                    None => {
                        log::warn!("ConnectToPeer named an unrecognized connection type {:?}", conn_type);
                        return;
                    }
                };
                let pool = self.pool.clone();
                tokio::spawn(async move {
                    pool.handle_connect_to_peer(username, conn_type, ip, port, token)
                        .await;
                });
            }
            ServerMessage::RoomList { rooms } => {
                let _ = self.events.send(Event::RoomList { rooms }).await;
            }
            ServerMessage::SayInRoom {
                room,
                username,
                message,
            } => {
                let _ = self
                    .events
                    .send(Event::RoomMessage {
                        room,
                        username: username.unwrap_or_default(),
                        message,
                    })
                    .await;
            }
            ServerMessage::PrivateMessage {
                id,
                timestamp,
                username,
                message,
            } => {
                let _ = self
                    .events
                    .send(Event::PrivateMessage {
                        id,
                        timestamp,
                        username,
                        message,
                    })
                    .await;
            }
            ServerMessage::BranchLevel { level } => {
                log::debug!("parent reports branch level {}", level);
            }
            ServerMessage::BranchRoot { username } => {
                *self.branch_root.lock().unwrap() = username;
            }
            ServerMessage::Unknown(u) => {
                log::debug!("ignoring unrecognized server message (code {})", u.code);
            }
            other => {
                log::trace!("unhandled server message: {:?}", other);
            }
        }
    }

    fn resolve_peer_address(&self, username: &str, result: Result<(Ipv4Addr, u16)>) {
        let waiters = self
            .pending_addresses
            .lock()
            .unwrap()
            .remove(username)
            .unwrap_or_default();
        for waiter in waiters {
            let _ = waiter.send(match &result {
                Ok(addr) => Ok(*addr),
                Err(_) => Err(Error::NoPeerConnection(username.to_owned())),
            });
        }
    }

    /// Requests a user's endpoint from the server, coalescing concurrent
    /// callers for the same username into a single in-flight request
    /// (§4.3).
    pub async fn get_peer_address(&self, username: &str) -> Result<(Ipv4Addr, u16)> {
        let (tx, rx) = oneshot::channel();
        let is_first = {
            let mut pending = self.pending_addresses.lock().unwrap();
            let waiters = pending.entry(username.to_owned()).or_insert_with(Vec::new);
            waiters.push(tx);
            waiters.len() == 1
        };
        if is_first {
            self.send(ServerMessage::GetPeerAddress {
                username: username.to_owned(),
            })
            .ok();
        }
        tokio::time::timeout(self.conf_peer_address_timeout(), rx)
            .await
            .map_err(|_| Error::Timeout)?
            .map_err(|_| Error::ConnectionClosed)?
    }

    /// `ServerConf` doesn't carry the peer-address timeout (that lives in
    /// `PeerConf`, since it bounds the pool's callers); defaulting to the
    /// specification's reference value keeps `get_peer_address` usable
    /// standalone.
    fn conf_peer_address_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(10)
    }

    // -- room / chat / wishlist / recommendation commands --------------
    // §4.1 names these messages with no dispatching home; added per
    // SPEC_FULL.md's supplemented command surface.

    pub fn join_room(&self, room: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::JoinRoom { room: room.into() })
    }

    pub fn leave_room(&self, room: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::LeaveRoom { room: room.into() })
    }

    pub fn say_in_room(&self, room: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::SayInRoom {
            room: room.into(),
            username: None,
            message: message.into(),
        })
    }

    pub fn send_private_message(&self, username: impl Into<String>, message: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::PrivateMessage {
            id: 0,
            timestamp: 0,
            username: username.into(),
            message: message.into(),
        })
    }

    /// Submits a search under a fresh ticket and returns it so the caller
    /// can correlate later `SearchResult` events.
    pub fn file_search(&self, query: impl Into<String>) -> Result<Token> {
        let ticket = self.next_ticket();
        self.send(ServerMessage::FileSearch {
            ticket,
            query: query.into(),
        })?;
        Ok(ticket)
    }

    pub fn wishlist_search(&self, query: impl Into<String>) -> Result<Token> {
        let ticket = self.next_ticket();
        self.send(ServerMessage::WishlistSearch {
            ticket,
            query: query.into(),
        })?;
        Ok(ticket)
    }

    pub fn add_thing_i_like(&self, item: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::AddThingILike { item: item.into() })
    }

    pub fn add_thing_i_hate(&self, item: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::AddThingIHate { item: item.into() })
    }

    pub fn get_recommendations(&self) -> Result<()> {
        self.send(ServerMessage::GetRecommendations)
    }

    pub fn get_similar_users(&self) -> Result<()> {
        self.send(ServerMessage::GetSimilarUsers)
    }

    pub fn get_user_stats(&self, username: impl Into<String>) -> Result<()> {
        self.send(ServerMessage::GetUserStats {
            username: username.into(),
        })
    }

    pub fn check_privileges(&self) -> Result<()> {
        self.send(ServerMessage::CheckPrivileges)
    }

    // -- distributed tree ------------------------------------------------

    /// Registers a connection reported ready by the pool as a distributed
    /// child, if it is a "D" connection. Intended to be driven by a task
    /// subscribed to [`crate::callbacks::PoolSinks::subscribe_ready_connections`].
    pub fn register_child_if_distributed(&self, conn: &Arc<PeerConnection>) {
        if conn.conn_type != ConnType::Distributed {
            return;
        }
        let username_lower = conn.username.to_lowercase();
        self.children.lock().unwrap().insert(username_lower, conn.clone());
        let _ = conn.send_distributed(DistributedMessage::BranchLevel {
            level: self.branch_level.load(Ordering::Relaxed) + 1,
        });
        let root = self.branch_root.lock().unwrap().clone();
        if !root.is_empty() {
            let _ = conn.send_distributed(DistributedMessage::BranchRoot { username: root });
        }
    }

    /// Fans an inbound distributed search out to every current child
    /// unchanged, and separately matches it against the local share index
    /// (§4.3 "Distributed tree", §8 scenario 4).
    pub fn forward_search_request(&self, username: &str, ticket: Token, query: &str) {
        let children: Vec<Arc<PeerConnection>> = self.children.lock().unwrap().values().cloned().collect();
        for child in &children {
            let _ = child.send_distributed(DistributedMessage::SearchRequest {
                username: username.to_owned(),
                ticket,
                query: query.to_owned(),
            });
        }

        let matches = self.share_index.matches(query);
        if !matches.is_empty() {
            let events = self.events.clone();
            let username = username.to_owned();
            tokio::spawn(async move {
                let _ = events
                    .send(Event::SearchResult {
                        ticket,
                        username,
                        results: matches,
                    })
                    .await;
            });
        }
    }

    pub fn distributed_children_count(&self) -> usize {
        self.children.lock().unwrap().len()
    }

    /// Drains [`PoolSinks::subscribe_ready_connections`] and registers every
    /// "D" connection the pool reports as a distributed child (§3, §4.3).
    fn spawn_ready_connection_dispatch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut rx = self.sinks.subscribe_ready_connections();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = rx.recv() => match result {
                        Ok(event) => self.register_child_if_distributed(&event.conn),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("server session's ready-connection dispatch lagged by {}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Drains [`PoolSinks::subscribe_distributed_messages`] and forwards
    /// every inbound `SearchRequest` to the current child set (§4.3
    /// "Distributed tree", §8 scenario 4).
    fn spawn_distributed_message_dispatch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut rx = self.sinks.subscribe_distributed_messages();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = rx.recv() => match result {
                        Ok(event) => {
                            if let DistributedMessage::SearchRequest { username, ticket, query } = event.message {
                                self.forward_search_request(&username, ticket, &query);
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("server session's distributed-message dispatch lagged by {}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    /// Shares this session's shutdown broadcast so other subsystems
    /// (download/upload managers) terminate together with it.
    pub fn shutdown_receiver(&self) -> broadcast::Receiver<()> {
        self.shutdown.subscribe()
    }
}

impl ServerLink for ServerSession {
    fn resolve_address<'a>(&'a self, username: &'a str) -> LinkFuture<'a, Result<(Ipv4Addr, u16)>> {
        Box::pin(async move { self.get_peer_address(username).await })
    }

    fn cant_connect_to_peer<'a>(&'a self, token: Token, username: &'a str) -> LinkFuture<'a, ()> {
        Box::pin(async move {
            let _ = self.send(ServerMessage::CantConnectToPeer {
                token,
                username: username.to_owned(),
            });
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::callbacks::PoolSinks;
    use crate::conf::PeerConf;
    use crate::interfaces::EmptyShareIndex;
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn fast_conf(host: String, port: u16) -> ServerConf {
        ServerConf {
            host,
            port,
            login_grace_period: Duration::from_millis(200),
            accept_distributed_children: true,
        }
    }

    fn test_settings() -> Settings {
        Settings {
            listen_port: 2234,
            enable_upnp: false,
            download_root: "/tmp".into(),
            max_download_slots: 2,
            max_upload_slots: 2,
            min_shared_files: 0,
            min_shared_folders: 0,
            respond_to_searches: true,
            accept_distributed_children: true,
        }
    }

    #[tokio::test]
    async fn connect_sends_login_and_completes_on_response() {
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server_task = tokio::spawn(async move {
            let (socket, _) = listener.accept().await.unwrap();
            let mut framed = Framed::new(socket, ServerCodec);
            let login = framed.next().await.unwrap().unwrap();
            assert!(matches!(login, ServerMessage::Login { .. }));
            framed
                .send(ServerMessage::LoginResponse {
                    success: true,
                    message: "Welcome".to_owned(),
                })
                .await
                .unwrap();
            // drain the post-login startup sequence without asserting its
            // exact shape here; that's covered implicitly by not panicking.
            for _ in 0..6 {
                let _ = framed.next().await;
            }
        });

        let conf = fast_conf(addr.ip().to_string(), addr.port());
        let pool = PeerPool::new(PeerConf::default(), "us", PoolSinks::new());
        let share_index: Arc<dyn ShareIndex> = Arc::new(EmptyShareIndex);
        let (events_tx, mut events_rx) = mpsc::channel(16);

        let session = ServerSession::connect(
            conf,
            Credentials::new("us", "pw"),
            &test_settings(),
            pool,
            PoolSinks::new(),
            share_index,
            events_tx,
        )
        .await
        .unwrap();

        assert_eq!(events_rx.recv().await.unwrap(), Event::Connecting);
        assert_eq!(events_rx.recv().await.unwrap(), Event::Connected);
        session.disconnect();
        server_task.await.unwrap();
    }

    #[tokio::test]
    async fn distributed_children_receive_forwarded_search() {
        let pool = PeerPool::new(PeerConf::default(), "us", PoolSinks::new());
        let share_index: Arc<dyn ShareIndex> = Arc::new(EmptyShareIndex);
        let (events_tx, _events_rx) = mpsc::channel(16);

        // Build a session without going through connect() by using a loopback
        // listener purely to get a live TcpStream pair for the child conn.
        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_socket, _) = accepted.unwrap();
        drop(client);

        let sinks = PoolSinks::new();
        let conn = crate::peer::connection::spawn_distributed_connection(
            Framed::new(server_socket, crate::codec::distributed::DistributedCodec),
            addr,
            "child1".to_owned(),
            crate::Side::Inbound,
            sinks.clone(),
        );

        let (shutdown, _) = broadcast::channel(1);
        let session = Arc::new(ServerSession {
            conf: fast_conf("localhost".to_owned(), 0),
            our_username: "us".to_owned(),
            outbound: mpsc::unbounded_channel().0,
            pool,
            sinks: sinks.clone(),
            share_index,
            events: events_tx,
            pending_addresses: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            branch_level: AtomicU32::new(0),
            branch_root: Mutex::new(String::new()),
            next_ticket: AtomicU32::new(1),
            shutdown,
        });

        session.register_child_if_distributed(&conn);
        assert_eq!(session.distributed_children_count(), 1);

        session.forward_search_request("bob", 1, "test query");
    }

    #[tokio::test]
    async fn ready_and_distributed_events_are_wired_through_pool_sinks() {
        let pool = PeerPool::new(PeerConf::default(), "us", PoolSinks::new());
        let share_index: Arc<dyn ShareIndex> = Arc::new(EmptyShareIndex);
        let (events_tx, _events_rx) = mpsc::channel(16);

        let mut listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (client, accepted) = tokio::join!(TcpStream::connect(addr), listener.accept());
        let (server_socket, _) = accepted.unwrap();
        // Kept alive (not dropped) and framed as the "child"'s own end of the
        // connection, so the forwarded SearchRequest can be read back off it.
        let mut child_framed = Framed::new(
            client.unwrap(),
            crate::codec::distributed::DistributedCodec,
        );

        let sinks = PoolSinks::new();
        let conn = crate::peer::connection::spawn_distributed_connection(
            Framed::new(server_socket, crate::codec::distributed::DistributedCodec),
            addr,
            "child1".to_owned(),
            crate::Side::Inbound,
            sinks.clone(),
        );

        let (shutdown, _) = broadcast::channel(1);
        let session = Arc::new(ServerSession {
            conf: fast_conf("localhost".to_owned(), 0),
            our_username: "us".to_owned(),
            outbound: mpsc::unbounded_channel().0,
            pool,
            sinks: sinks.clone(),
            share_index,
            events: events_tx,
            pending_addresses: Mutex::new(HashMap::new()),
            children: Mutex::new(HashMap::new()),
            branch_level: AtomicU32::new(0),
            branch_root: Mutex::new(String::new()),
            next_ticket: AtomicU32::new(1),
            shutdown: shutdown.clone(),
        });

        session
            .clone()
            .spawn_ready_connection_dispatch(shutdown.subscribe());
        session
            .clone()
            .spawn_distributed_message_dispatch(shutdown.subscribe());

        // The pool reports the child connection ready; the session should
        // register it as a distributed child without any direct call.
        sinks.publish_ready_connection(crate::callbacks::ReadyConnectionEvent { conn: conn.clone() });
        for _ in 0..50 {
            if session.distributed_children_count() == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(session.distributed_children_count(), 1);

        // An inbound SearchRequest published on the distributed-message sink
        // should be fanned out to the registered child unchanged, with no
        // direct call into `forward_search_request`.
        sinks.publish_distributed_message(crate::callbacks::DistributedMessageEvent {
            username: "child1".to_owned(),
            message: crate::codec::DistributedMessage::SearchRequest {
                username: "bob".to_owned(),
                ticket: 42,
                query: "test query".to_owned(),
            },
        });

        loop {
            let frame = tokio::time::timeout(Duration::from_millis(500), child_framed.next())
                .await
                .expect("timed out waiting for the forwarded SearchRequest")
                .expect("connection closed before forwarding")
                .expect("decode error");
            if let crate::codec::DistributedMessage::SearchRequest { username, ticket, query } = frame {
                assert_eq!(username, "bob");
                assert_eq!(ticket, 42);
                assert_eq!(query, "test query");
                break;
            }
        }
    }
}
