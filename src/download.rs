//! The download manager: drives each queued download through §4.4's state
//! machine across the server session and the peer connection pool,
//! without further caller intervention once [`DownloadManager::queue`] has
//! been called.
//!
//! Mirrors the teacher's [`crate::disk::io::Disk`] actor composition: one
//! task per download (the analogue of a `PeerSession`), a single shared
//! disk actor for the writes, and a pair of small dispatch tasks that
//! route events keyed by id/username back to whichever download is
//! waiting on them, the same way `Torrent` fanned out `Command`s to the
//! right `PeerSession` rather than letting every task poll a shared queue.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};

use crate::callbacks::{FileConnectionEvent, PoolSinks};
use crate::codec::peer::PeerMessage;
use crate::conf::DownloadConf;
use crate::disk::io::{AlertReceiver as DiskAlertReceiver, CommandSender as DiskCommandSender};
use crate::disk::{compute_destination, Disk, DiskAlert, DiskCommand};
use crate::error::{Error, Result};
use crate::event::Event;
use crate::peer::file_socket::FileSocket;
use crate::peer::pool::{PeerPool, PersistentPurpose};
use crate::server::ServerSession;
use crate::transfer::{Direction, TransferId, TransferRecord, TransferStatus, TransferTable};
use crate::Token;

/// A pending "F" connection, keyed by username in [`DownloadManager`]'s
/// table (§3 "Pending File Transfer Table"). Removed the moment an
/// arriving "F" socket is matched against it, or once its deadline passes.
struct PendingFileEntry {
    transfer_id: TransferId,
    username: String,
    filename: String,
    expected_size: u64,
    token: Token,
    destination: PathBuf,
    deadline: Instant,
    responder: oneshot::Sender<FileSocket>,
}

/// Why a single download's drive loop stopped short of completion.
/// Kept distinct from [`Error`] so cancellation (never logged as a
/// failure, per §7) doesn't get folded into the same bucket as a real
/// error.
enum DriveError {
    Cancelled,
    Failed(Error),
}

impl From<Error> for DriveError {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

/// Drives every queued download to completion or failure. One instance is
/// shared for the whole session; each call to [`DownloadManager::queue`]
/// spawns its own task but all of them share this manager's disk actor,
/// pending-file table and transfer records.
pub struct DownloadManager {
    conf: DownloadConf,
    pool: Arc<PeerPool>,
    server: Arc<ServerSession>,
    sinks: PoolSinks,
    transfers: Arc<TransferTable>,
    pending_file: Mutex<HashMap<String, PendingFileEntry>>,
    disk_cmd: DiskCommandSender,
    disk_waiters: Mutex<HashMap<TransferId, mpsc::UnboundedSender<DiskAlert>>>,
    events: mpsc::Sender<Event>,
    cancels: Mutex<HashMap<TransferId, oneshot::Sender<()>>>,
}

impl DownloadManager {
    /// `shutdown` is the process-wide shutdown broadcast (see
    /// [`crate::server::ServerSession::shutdown_receiver`]); every background
    /// task this manager spawns subscribes to it and exits its loop once it
    /// fires, instead of lingering after the caller has torn everything else
    /// down.
    pub fn new(
        conf: DownloadConf,
        pool: Arc<PeerPool>,
        server: Arc<ServerSession>,
        sinks: PoolSinks,
        events: mpsc::Sender<Event>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        let (disk, disk_cmd, disk_alerts) = Disk::new();
        tokio::spawn(disk.run());

        let manager = Arc::new(Self {
            conf,
            pool,
            server,
            sinks,
            transfers: Arc::new(TransferTable::new()),
            pending_file: Mutex::new(HashMap::new()),
            disk_cmd,
            disk_waiters: Mutex::new(HashMap::new()),
            events,
            cancels: Mutex::new(HashMap::new()),
        });

        manager.clone().spawn_file_dispatch(shutdown.subscribe());
        manager
            .clone()
            .spawn_disk_alert_dispatch(disk_alerts, shutdown.subscribe());
        manager
            .clone()
            .spawn_pending_file_reaper(shutdown.subscribe());
        manager
    }

    /// Queues a download and returns its id immediately; the transfer is
    /// driven to completion in the background (§4.4's contract).
    pub fn queue(
        self: &Arc<Self>,
        username: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
    ) -> TransferId {
        let username = username.into();
        let filename = filename.into();
        let id = self
            .transfers
            .insert(username.clone(), filename.clone(), size, Direction::Download);
        let manager = self.clone();
        tokio::spawn(async move {
            manager.run(id, username, filename, size).await;
        });
        id
    }

    /// Cancels an in-progress download: drops its pending entries, closes
    /// any "F" connection it holds, and marks the record cancelled (§5
    /// "Cancellation").
    pub fn cancel(&self, id: TransferId) {
        if let Some(tx) = self.cancels.lock().unwrap().remove(&id) {
            let _ = tx.send(());
        }
    }

    pub fn transfer(&self, id: TransferId) -> Option<TransferRecord> {
        self.transfers.get(id)
    }

    pub fn transfers(&self) -> Vec<TransferRecord> {
        self.transfers.all()
    }

    async fn run(self: Arc<Self>, id: TransferId, username: String, filename: String, size: u64) {
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().unwrap().insert(id, cancel_tx);

        let outcome = self.drive(id, username.clone(), filename.clone(), size, cancel_rx).await;

        self.cancels.lock().unwrap().remove(&id);
        self.pending_file.lock().unwrap().remove(&username.to_lowercase());
        self.disk_waiters.lock().unwrap().remove(&id);

        match outcome {
            Ok(path) => {
                log::info!("download {} ({} from {}) completed", id, filename, username);
                self.transfers.mutate(id, |r| r.mark_completed(path));
            }
            Err(DriveError::Cancelled) => {
                log::info!("download {} ({} from {}) cancelled", id, filename, username);
                self.transfers.mutate(id, |r| r.mark_cancelled());
            }
            Err(DriveError::Failed(e)) => {
                log::warn!("download {} ({} from {}) failed: {}", id, filename, username, e);
                self.transfers.mutate(id, |r| r.mark_failed(e.to_string()));
            }
        }
        self.emit(id).await;
    }

    async fn drive(
        self: &Arc<Self>,
        id: TransferId,
        username: String,
        filename: String,
        _size: u64,
        mut cancel: oneshot::Receiver<()>,
    ) -> std::result::Result<PathBuf, DriveError> {
        // CONNECTING: resolve the peer's address through the server,
        // coalesced with any other caller asking about the same user.
        self.transfers.mutate(id, |r| r.status = TransferStatus::Connecting);
        self.emit(id).await;

        let (ip, port) = tokio::select! {
            _ = &mut cancel => return Err(DriveError::Cancelled),
            result = self.server.get_peer_address(&username) => result?,
        };

        // CONNECTED: reuse or dial a "P" connection.
        let conn = tokio::select! {
            _ = &mut cancel => return Err(DriveError::Cancelled),
            result = self.pool.request_connection(&username, PersistentPurpose::Peer, self.server.as_ref()) => result?,
        };

        // Subscribe *before* sending QueueUpload -- the callback-ordering
        // invariant in §4.4: a fast-responding peer's TransferRequest must
        // never arrive before we're listening for it.
        let mut peer_rx = self.sinks.subscribe_peer_messages();
        conn.send_peer(PeerMessage::QueueUpload {
            filename: filename.clone(),
        })?;

        let (token, file_size) = self
            .await_transfer_request(id, &username, &filename, &mut peer_rx, &mut cancel)
            .await?;

        // ACCEPTED.
        conn.send_peer(PeerMessage::TransferResponse {
            token,
            allowed: true,
            file_size: Some(file_size),
            reason: None,
        })?;

        let destination = compute_destination(&self.conf.download_dir, &username, &filename);
        let (file_tx, mut file_rx) = oneshot::channel();
        {
            let mut pending = self.pending_file.lock().unwrap();
            let old = pending.insert(
                username.to_lowercase(),
                PendingFileEntry {
                    transfer_id: id,
                    username: username.clone(),
                    filename: filename.clone(),
                    expected_size: file_size,
                    token,
                    destination: destination.clone(),
                    deadline: Instant::now() + self.conf.total_timeout,
                    responder: file_tx,
                },
            );
            if let Some(old) = old {
                log::warn!(
                    "pending \"F\" entry for {} ({}) replaced before it was claimed (§3 collision rule)",
                    old.username,
                    old.filename
                );
            }
        }

        // AWAIT_F_CONN, falling back to OUTBOUND_F_DIAL after the inbound
        // grace period.
        let mut file_socket = tokio::select! {
            _ = &mut cancel => {
                self.pending_file.lock().unwrap().remove(&username.to_lowercase());
                return Err(DriveError::Cancelled);
            }
            result = &mut file_rx => result.map_err(|_| DriveError::Failed(Error::ConnectionClosed))?,
            _ = tokio::time::sleep(self.conf.inbound_file_conn_wait) => {
                self.pending_file.lock().unwrap().remove(&username.to_lowercase());
                log::info!(
                    "no inbound \"F\" connection from {} within {:?}, dialing out",
                    username,
                    self.conf.inbound_file_conn_wait
                );
                tokio::time::timeout(self.conf.total_timeout, self.pool.dial_file_connection(ip, port))
                    .await
                    .map_err(|_| DriveError::Failed(Error::Timeout))??
            }
        };

        // We are the downloader: send the real transfer token and a zero
        // file offset (resuming partial downloads isn't modeled) before
        // any raw bytes are read.
        let mut prefix = [0u8; 12];
        prefix[..4].copy_from_slice(&token.to_le_bytes());
        prefix[4..].copy_from_slice(&0u64.to_le_bytes());
        file_socket
            .write_all(&prefix)
            .await
            .map_err(|e| DriveError::Failed(Error::Io(e)))?;

        self.receive_file(id, &mut file_socket, &mut cancel, &destination, file_size)
            .await?;

        Ok(destination)
    }

    /// AWAIT_TRANSFER_REQ: waits for the peer's `TransferRequest` (or a
    /// refusal). A soft timeout flips the record to `Waiting` without
    /// failing the transfer -- the peer may just have a long upload queue
    /// -- and the wait resumes.
    async fn await_transfer_request(
        &self,
        id: TransferId,
        username: &str,
        filename: &str,
        peer_rx: &mut broadcast::Receiver<crate::callbacks::PeerMessageEvent>,
        cancel: &mut oneshot::Receiver<()>,
    ) -> std::result::Result<(Token, u64), DriveError> {
        loop {
            tokio::select! {
                _ = &mut *cancel => return Err(DriveError::Cancelled),
                _ = tokio::time::sleep(self.conf.total_timeout) => {
                    log::info!(
                        "still waiting for {} to respond to QueueUpload({}) after {:?}",
                        username, filename, self.conf.total_timeout
                    );
                    self.transfers.mutate(id, |r| r.status = TransferStatus::Waiting);
                    self.emit(id).await;
                }
                msg = peer_rx.recv() => {
                    match msg {
                        Ok(event) if event.username.eq_ignore_ascii_case(username) => {
                            match event.message {
                                PeerMessage::TransferRequest { token, filename: fname, file_size, .. }
                                    if fname == filename =>
                                {
                                    return Ok((token, file_size));
                                }
                                PeerMessage::UploadDenied { filename: fname, reason } if fname == filename => {
                                    return Err(DriveError::Failed(Error::InvalidResponse(reason)));
                                }
                                PeerMessage::UploadFailed { filename: fname } if fname == filename => {
                                    return Err(DriveError::Failed(Error::ConnectionFailed(
                                        "peer reported the upload failed".to_owned(),
                                    )));
                                }
                                PeerMessage::QueueFailed { filename: fname, reason } if fname == filename => {
                                    return Err(DriveError::Failed(Error::InvalidResponse(reason)));
                                }
                                _ => continue,
                            }
                        }
                        Ok(_) => continue,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::debug!("download manager's peer-message subscription lagged by {}", n);
                            continue;
                        }
                        Err(broadcast::error::RecvError::Closed) => {
                            return Err(DriveError::Failed(Error::ConnectionClosed));
                        }
                    }
                }
            }
        }
    }

    /// RECEIVING: reads raw bytes off the "F" socket until either the
    /// expected size is met or the peer closes the connection, writing
    /// each chunk through the shared disk actor and reporting progress as
    /// it goes (§4.4 "Reception").
    async fn receive_file(
        &self,
        id: TransferId,
        socket: &mut FileSocket,
        cancel: &mut oneshot::Receiver<()>,
        destination: &Path,
        expected_size: u64,
    ) -> std::result::Result<(), DriveError> {
        self.transfers.mutate(id, |r| r.status = TransferStatus::Transferring);
        self.emit(id).await;

        let (alert_tx, mut alert_rx) = mpsc::unbounded_channel();
        self.disk_waiters.lock().unwrap().insert(id, alert_tx);

        self.disk_cmd
            .send(DiskCommand::Open {
                id,
                path: destination.to_path_buf(),
            })
            .map_err(|_| DriveError::Failed(Error::ConnectionClosed))?;
        match alert_rx.recv().await {
            Some(DiskAlert::Opened { .. }) => {}
            Some(DiskAlert::OpenFailed { error, .. }) => {
                return Err(DriveError::Failed(Error::CannotCreateFile(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    error,
                ))));
            }
            _ => return Err(DriveError::Failed(Error::ConnectionClosed)),
        }

        let mut buf = vec![0u8; 64 * 1024];
        let mut total: u64 = 0;
        loop {
            tokio::select! {
                _ = &mut *cancel => {
                    self.disk_cmd.send(DiskCommand::Abort { id }).ok();
                    return Err(DriveError::Cancelled);
                }
                result = socket.read(&mut buf) => {
                    let n = result.map_err(|e| DriveError::Failed(Error::Io(e)))?;
                    if n == 0 {
                        // the peer closed the connection: our "complete" signal.
                        break;
                    }
                    self.disk_cmd
                        .send(DiskCommand::Write { id, data: buf[..n].to_vec() })
                        .map_err(|_| DriveError::Failed(Error::ConnectionClosed))?;
                    match alert_rx.recv().await {
                        Some(DiskAlert::Written { total_bytes, .. }) => {
                            total = total_bytes;
                            self.transfers.mutate(id, |r| r.report_progress(total));
                            self.emit(id).await;
                        }
                        _ => return Err(DriveError::Failed(Error::ConnectionClosed)),
                    }
                    if expected_size > 0 && total >= expected_size {
                        break;
                    }
                }
            }
        }

        self.disk_cmd
            .send(DiskCommand::Finalize { id, expected_size })
            .map_err(|_| DriveError::Failed(Error::ConnectionClosed))?;
        let outcome = match alert_rx.recv().await {
            Some(DiskAlert::Finalized { result, .. }) => result.map_err(DriveError::Failed),
            _ => Err(DriveError::Failed(Error::ConnectionClosed)),
        };
        self.disk_waiters.lock().unwrap().remove(&id);
        outcome.map(|_| ())
    }

    async fn emit(&self, id: TransferId) {
        if let Some(record) = self.transfers.get(id) {
            let _ = self
                .events
                .send(Event::TransferUpdate {
                    id: record.id,
                    direction: record.direction,
                    status: record.status,
                    bytes_transferred: record.bytes_transferred,
                    speed: record.speed,
                    error: record.error.clone(),
                    local_path: record.local_path.clone(),
                })
                .await;
        }
    }

    /// Subscribes to every freshly established "F" socket the pool hands
    /// out and claims the ones that match a pending download (§4.4
    /// "F-connection matching").
    fn spawn_file_dispatch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut rx = self.sinks.subscribe_file_connections();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = rx.recv() => match result {
                        Ok(slot) => self.try_match_file_connection(slot),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("download manager's \"F\" connection dispatch lagged by {}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    fn try_match_file_connection(&self, slot: Arc<Mutex<Option<FileConnectionEvent>>>) {
        let username = match slot.lock().unwrap().as_ref().map(|e| e.username.clone()) {
            Some(u) => u,
            None => return,
        };

        let mut pending = self.pending_file.lock().unwrap();
        let key = find_pending_match(&pending, &username, self.conf.strict_username_matching);
        let entry = match key.and_then(|k| pending.remove(&k)) {
            Some(e) => e,
            None => return,
        };
        drop(pending);

        log::debug!(
            "matched an inbound \"F\" connection from {} to transfer {} ({}, token {}, expected {} bytes, -> {:?})",
            username, entry.transfer_id, entry.filename, entry.token, entry.expected_size, entry.destination
        );

        if let Some(event) = slot.lock().unwrap().take() {
            let _ = entry.responder.send(event.stream);
        }
    }

    /// Routes disk actor alerts back to whichever download registered
    /// itself as waiting for that transfer id's next alert.
    fn spawn_disk_alert_dispatch(
        self: Arc<Self>,
        mut alerts: DiskAlertReceiver,
        mut shutdown: broadcast::Receiver<()>,
    ) {
        tokio::spawn(async move {
            loop {
                let alert = tokio::select! {
                    _ = shutdown.recv() => break,
                    alert = alerts.recv() => match alert {
                        Some(alert) => alert,
                        None => break,
                    },
                };
                let id = match &alert {
                    DiskAlert::Opened { id }
                    | DiskAlert::OpenFailed { id, .. }
                    | DiskAlert::Written { id, .. }
                    | DiskAlert::WriteFailed { id, .. }
                    | DiskAlert::Finalized { id, .. } => *id,
                };
                if let Some(tx) = self.disk_waiters.lock().unwrap().get(&id) {
                    let _ = tx.send(alert);
                }
            }
        });
    }

    /// Sweeps pending "F" entries whose deadline has elapsed. A download
    /// that times out waiting for its own entry already removes it on its
    /// own way out; this catches the pathological case where the drive
    /// task itself got stuck or was aborted without running its cleanup.
    fn spawn_pending_file_reaper(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(Duration::from_secs(5));
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    _ = interval.tick() => {}
                }
                let now = Instant::now();
                let mut pending = self.pending_file.lock().unwrap();
                pending.retain(|_, entry| {
                    let alive = entry.deadline > now;
                    if !alive {
                        log::debug!(
                            "expiring stale pending \"F\" entry for {} ({})",
                            entry.username,
                            entry.filename
                        );
                    }
                    alive
                });
            }
        });
    }
}

/// Finds the pending entry an inbound "F" connection reporting `username`
/// should be matched against: exact match first, then case-insensitive,
/// then -- in lenient (non-strict) mode -- the sole remaining entry
/// regardless of its reported username (§4.4, §9 open question).
fn find_pending_match(
    pending: &HashMap<String, PendingFileEntry>,
    username: &str,
    strict: bool,
) -> Option<String> {
    if let Some((key, _)) = pending.iter().find(|(_, e)| e.username == username) {
        return Some(key.clone());
    }
    let lower = username.to_lowercase();
    if pending.contains_key(&lower) {
        return Some(lower);
    }
    if !strict && pending.len() == 1 {
        return pending.keys().next().cloned();
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(username: &str, filename: &str) -> PendingFileEntry {
        let (tx, _rx) = oneshot::channel();
        PendingFileEntry {
            transfer_id: 1,
            username: username.to_owned(),
            filename: filename.to_owned(),
            expected_size: 4096,
            token: 7,
            destination: PathBuf::from("/tmp/x"),
            deadline: Instant::now() + Duration::from_secs(60),
            responder: tx,
        }
    }

    #[test]
    fn exact_username_match_wins_over_sole_fallback() {
        let mut pending = HashMap::new();
        pending.insert("alice".to_owned(), entry("alice", "song.mp3"));
        assert_eq!(
            find_pending_match(&pending, "alice", false),
            Some("alice".to_owned())
        );
    }

    #[test]
    fn case_insensitive_match_when_no_exact_match_exists() {
        let mut pending = HashMap::new();
        pending.insert("alice".to_owned(), entry("Alice", "song.mp3"));
        assert_eq!(
            find_pending_match(&pending, "ALICE", false),
            Some("alice".to_owned())
        );
    }

    #[test]
    fn sole_pending_entry_matches_regardless_of_username_in_lenient_mode() {
        let mut pending = HashMap::new();
        pending.insert("alice".to_owned(), entry("alice", "song.mp3"));
        assert_eq!(
            find_pending_match(&pending, "someone_else", false),
            Some("alice".to_owned())
        );
    }

    #[test]
    fn strict_mode_rejects_a_mismatched_sole_entry() {
        let mut pending = HashMap::new();
        pending.insert("alice".to_owned(), entry("alice", "song.mp3"));
        assert_eq!(find_pending_match(&pending, "someone_else", true), None);
    }

    #[test]
    fn no_match_when_multiple_entries_and_none_match() {
        let mut pending = HashMap::new();
        pending.insert("alice".to_owned(), entry("alice", "song.mp3"));
        pending.insert("bob".to_owned(), entry("bob", "track.flac"));
        assert_eq!(find_pending_match(&pending, "carol", false), None);
    }
}
