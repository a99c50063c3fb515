//! The upload manager: the counterpart to [`crate::download::DownloadManager`]
//! that SPEC_FULL.md adds to round out the crate as a full Soulseek client
//! rather than a download-only leech (see `SPEC_FULL.md`'s "Upload Manager
//! companion" entry).
//!
//! Mirrors the download side's shape almost exactly, with the roles
//! reversed: instead of sending `QueueUpload` and waiting for a
//! `TransferRequest`, we *receive* `QueueUpload`, consult a caller-supplied
//! [`crate::interfaces::UploadPolicy`], and -- if admitted -- send the
//! `TransferRequest` ourselves. The "F" connection race (inbound wait, then
//! dial out) is the same race the download side runs, just with the dial
//! direction flipped: in the reference client it is normally the *uploader*
//! that ends up opening the raw file socket (see `spec.md` §8 scenario 1,
//! where `alice`, the uploader, is the one whose "F" connection arrives).

use std::collections::HashMap;
use std::fs::File;
use std::io::Read;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task;

use crate::callbacks::{FileConnectionEvent, PoolSinks};
use crate::codec::peer::PeerMessage;
use crate::conf::UploadConf;
use crate::error::{Error, Result};
use crate::event::Event;
use crate::interfaces::{ShareIndex, UploadPolicy};
use crate::peer::file_socket::FileSocket;
use crate::peer::pool::{PeerPool, PersistentPurpose};
use crate::server::ServerSession;
use crate::transfer::{Direction, TransferId, TransferRecord, TransferStatus, TransferTable};
use crate::Token;

/// A pending "F" connection we are expecting to dial or accept for an
/// upload already accepted by the downloader, keyed by username exactly
/// like [`crate::download::DownloadManager`]'s pending-file table (§3).
struct PendingFileEntry {
    transfer_id: TransferId,
    username: String,
    token: Token,
    responder: oneshot::Sender<FileSocket>,
}

enum DriveError {
    Cancelled,
    Failed(Error),
}

impl From<Error> for DriveError {
    fn from(e: Error) -> Self {
        Self::Failed(e)
    }
}

/// Drives every inbound `QueueUpload` to a completed, failed, or denied
/// outcome. One instance is shared for the whole session.
pub struct UploadManager {
    conf: UploadConf,
    pool: Arc<PeerPool>,
    server: Arc<ServerSession>,
    sinks: PoolSinks,
    share_index: Arc<dyn ShareIndex>,
    policy: Arc<dyn UploadPolicy>,
    transfers: Arc<TransferTable>,
    pending_file: Mutex<HashMap<String, PendingFileEntry>>,
    events: mpsc::Sender<Event>,
    cancels: Mutex<HashMap<TransferId, oneshot::Sender<()>>>,
    next_token: AtomicU32,
}

impl UploadManager {
    /// `shutdown` mirrors [`crate::download::DownloadManager::new`]'s
    /// parameter of the same name: every background task this manager spawns
    /// subscribes to it and exits once it fires.
    pub fn new(
        conf: UploadConf,
        pool: Arc<PeerPool>,
        server: Arc<ServerSession>,
        sinks: PoolSinks,
        share_index: Arc<dyn ShareIndex>,
        policy: Arc<dyn UploadPolicy>,
        events: mpsc::Sender<Event>,
        shutdown: &broadcast::Sender<()>,
    ) -> Arc<Self> {
        let manager = Arc::new(Self {
            conf,
            pool,
            server,
            sinks,
            share_index,
            policy,
            transfers: Arc::new(TransferTable::new()),
            pending_file: Mutex::new(HashMap::new()),
            events,
            cancels: Mutex::new(HashMap::new()),
            next_token: AtomicU32::new(1),
        });

        manager.clone().spawn_queue_dispatch(shutdown.subscribe());
        manager.clone().spawn_file_dispatch(shutdown.subscribe());
        manager
    }

    fn next_token(&self) -> Token {
        self.next_token.fetch_add(1, Ordering::Relaxed)
    }

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

    /// Subscribes to every "P" message and spawns a drive task the moment a
    /// `QueueUpload` arrives, the mirror image of how the download side
    /// reacts to `TransferRequest`.
    fn spawn_queue_dispatch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut rx = self.sinks.subscribe_peer_messages();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = rx.recv() => match result {
                        Ok(event) => {
                            if let PeerMessage::QueueUpload { filename } = event.message {
                                let manager = self.clone();
                                tokio::spawn(async move {
                                    manager.run(event.username, filename).await;
                                });
                            }
                        }
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("upload manager's queue dispatch lagged by {}", n);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });
    }

    async fn run(self: Arc<Self>, username: String, filename: String) {
        let found = self
            .share_index
            .lookup(&filename)
            .into_iter()
            .find(|f| f.path == filename);

        let (local_path, size) = match found {
            Some(f) => (PathBuf::from(f.path), f.size),
            None => {
                log::info!("{} requested {} which we don't share, denying", username, filename);
                self.deny(&username, &filename, "File not shared.").await;
                return;
            }
        };

        if let Err(reason) = self.policy.admit(&username, &filename, size) {
            log::info!("upload policy denied {} for {}: {}", filename, username, reason);
            self.deny(&username, &filename, &reason).await;
            return;
        }

        let id = self
            .transfers
            .insert(username.clone(), filename.clone(), size, Direction::Upload);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        self.cancels.lock().unwrap().insert(id, cancel_tx);

        let outcome = self
            .drive(id, username.clone(), filename.clone(), local_path, size, cancel_rx)
            .await;

        self.cancels.lock().unwrap().remove(&id);
        self.pending_file.lock().unwrap().remove(&username.to_lowercase());

        match outcome {
            Ok(()) => {
                log::info!("upload {} ({} to {}) completed", id, filename, username);
                self.transfers.mutate(id, |r| r.status = TransferStatus::Completed);
            }
            Err(DriveError::Cancelled) => {
                log::info!("upload {} ({} to {}) cancelled", id, filename, username);
                self.transfers.mutate(id, |r| r.mark_cancelled());
            }
            Err(DriveError::Failed(e)) => {
                log::warn!("upload {} ({} to {}) failed: {}", id, filename, username, e);
                self.transfers.mutate(id, |r| r.mark_failed(e.to_string()));
            }
        }
        self.emit(id).await;
    }

    async fn deny(&self, username: &str, filename: &str, reason: &str) {
        if let Ok(conn) = self
            .pool
            .request_connection(username, PersistentPurpose::Peer, self.server.as_ref())
            .await
        {
            let _ = conn.send_peer(PeerMessage::UploadDenied {
                filename: filename.to_owned(),
                reason: reason.to_owned(),
            });
        }
    }

    async fn drive(
        self: &Arc<Self>,
        id: TransferId,
        username: String,
        filename: String,
        local_path: PathBuf,
        size: u64,
        mut cancel: oneshot::Receiver<()>,
    ) -> std::result::Result<(), DriveError> {
        self.transfers.mutate(id, |r| r.status = TransferStatus::Connecting);
        self.emit(id).await;

        let conn = tokio::select! {
            _ = &mut cancel => return Err(DriveError::Cancelled),
            result = self.pool.request_connection(&username, PersistentPurpose::Peer, self.server.as_ref()) => result?,
        };
        let addr = conn.addr;

        let token = self.next_token();
        let mut peer_rx = self.sinks.subscribe_peer_messages();
        conn.send_peer(PeerMessage::TransferRequest {
            direction: 1,
            token,
            filename: filename.clone(),
            file_size: size,
        })?;

        tokio::select! {
            _ = &mut cancel => return Err(DriveError::Cancelled),
            result = self.await_transfer_response(&username, &filename, token, &mut peer_rx) => result?,
        };

        let (file_tx, mut file_rx) = oneshot::channel();
        {
            let mut pending = self.pending_file.lock().unwrap();
            let old = pending.insert(
                username.to_lowercase(),
                PendingFileEntry {
                    transfer_id: id,
                    username: username.clone(),
                    token,
                    responder: file_tx,
                },
            );
            if let Some(old) = old {
                log::warn!(
                    "pending upload \"F\" entry for {} replaced before it was claimed",
                    old.username
                );
            }
        }

        let ip = match ipv4_of(addr) {
            Some(ip) => ip,
            None => {
                self.pending_file.lock().unwrap().remove(&username.to_lowercase());
                return Err(DriveError::Failed(Error::InvalidResponse(
                    "IPv6 peer address, cannot dial an \"F\" connection".to_owned(),
                )));
            }
        };
        let port = addr.port();

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

        // We are the uploader: the downloader writes the real transfer
        // token and a file offset before any raw bytes flow. Resuming
        // partial uploads isn't modeled (mirrors the download side), so the
        // offset is read but otherwise ignored.
        let mut prefix = [0u8; 12];
        file_socket
            .read_exact(&mut prefix)
            .await
            .map_err(|e| DriveError::Failed(Error::Io(e)))?;
        let their_token = u32::from_le_bytes([prefix[0], prefix[1], prefix[2], prefix[3]]);
        if their_token != token {
            log::warn!(
                "downloader {} sent token {} on the \"F\" connection, expected {}; proceeding anyway",
                username, their_token, token
            );
        }

        self.send_file(id, &mut file_socket, &mut cancel, local_path, size).await
    }

    /// AWAIT_TRANSFER_RESPONSE: waits for the downloader's `TransferResponse`
    /// to our offer.
    async fn await_transfer_response(
        &self,
        username: &str,
        filename: &str,
        token: Token,
        peer_rx: &mut broadcast::Receiver<crate::callbacks::PeerMessageEvent>,
    ) -> std::result::Result<(), DriveError> {
        let deadline = tokio::time::sleep(self.conf.transfer_response_timeout);
        tokio::pin!(deadline);
        loop {
            tokio::select! {
                _ = &mut deadline => {
                    return Err(DriveError::Failed(Error::Timeout));
                }
                msg = peer_rx.recv() => {
                    match msg {
                        Ok(event) if event.username.eq_ignore_ascii_case(username) => {
                            match event.message {
                                PeerMessage::TransferResponse { token: t, allowed: true, .. } if t == token => {
                                    return Ok(());
                                }
                                PeerMessage::TransferResponse { token: t, allowed: false, reason, .. } if t == token => {
                                    return Err(DriveError::Failed(Error::InvalidResponse(
                                        reason.unwrap_or_else(|| "upload declined".to_owned()),
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
                            log::debug!("upload manager's peer-message subscription lagged by {}", n);
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

    /// Streams `local_path` over `socket` from the start, reporting progress
    /// the same way [`crate::download::DownloadManager::receive_file`] does.
    async fn send_file(
        &self,
        id: TransferId,
        socket: &mut FileSocket,
        cancel: &mut oneshot::Receiver<()>,
        local_path: PathBuf,
        size: u64,
    ) -> std::result::Result<(), DriveError> {
        self.transfers.mutate(id, |r| r.status = TransferStatus::Transferring);
        self.emit(id).await;

        let file = UploadFile::open(local_path)
            .await
            .map_err(|e| DriveError::Failed(Error::CannotCreateFile(e)))?;

        let mut total: u64 = 0;
        loop {
            let chunk = tokio::select! {
                _ = &mut *cancel => return Err(DriveError::Cancelled),
                result = file.read_chunk(64 * 1024) => result.map_err(|e| DriveError::Failed(Error::Io(e)))?,
            };
            if chunk.is_empty() {
                break;
            }
            socket
                .write_all(&chunk)
                .await
                .map_err(|e| DriveError::Failed(Error::Io(e)))?;
            total += chunk.len() as u64;
            self.transfers.mutate(id, |r| r.report_progress(total));
            self.emit(id).await;
        }

        // Closing the socket is the "complete" signal the downloader's
        // reader is watching for (§4.4 "Reception").
        let _ = socket.shutdown().await;

        if total < size {
            log::warn!(
                "upload {} sent {} of {} expected bytes before reaching end of file",
                id, total, size
            );
        }
        Ok(())
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

    fn spawn_file_dispatch(self: Arc<Self>, mut shutdown: broadcast::Receiver<()>) {
        tokio::spawn(async move {
            let mut rx = self.sinks.subscribe_file_connections();
            loop {
                tokio::select! {
                    _ = shutdown.recv() => break,
                    result = rx.recv() => match result {
                        Ok(slot) => self.try_match_file_connection(slot),
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            log::warn!("upload manager's \"F\" connection dispatch lagged by {}", n);
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
        let entry = match pending.remove(&username.to_lowercase()) {
            Some(e) => e,
            None => return,
        };
        drop(pending);

        log::debug!(
            "matched an inbound \"F\" connection from {} to upload {} (token {})",
            username, entry.transfer_id, entry.token
        );

        if let Some(event) = slot.lock().unwrap().take() {
            let _ = entry.responder.send(event.stream);
        }
    }
}

/// A small blocking-pool-backed file reader, the read-side analogue of
/// [`crate::disk::io::Disk`]'s write-side actor. Reads from independent
/// uploads never contend with each other, so a shared `Mutex` per handle
/// (rather than a shared actor task) is enough to keep the handle off the
/// async executor without needing to thread ownership through every call.
struct UploadFile(Arc<Mutex<File>>);

impl UploadFile {
    async fn open(path: PathBuf) -> std::io::Result<Self> {
        task::spawn_blocking(move || File::open(&path))
            .await
            .expect("upload file-open blocking task panicked")
            .map(|f| Self(Arc::new(Mutex::new(f))))
    }

    /// Reads up to `max_len` bytes, returning an empty vector at EOF.
    async fn read_chunk(&self, max_len: usize) -> std::io::Result<Vec<u8>> {
        let file = self.0.clone();
        task::spawn_blocking(move || -> std::io::Result<Vec<u8>> {
            let mut file = file.lock().unwrap();
            let mut buf = vec![0u8; max_len];
            let n = file.read(&mut buf)?;
            buf.truncate(n);
            Ok(buf)
        })
        .await
        .expect("upload file-read blocking task panicked")
    }
}

/// Extracts the IPv4 address an outbound "F" dial can use. "P" connections
/// this crate establishes are always IPv4 (§4.6, listener IPv6 is
/// disabled), so a "P" connection's recorded address is always this case in
/// practice; the `None` arm exists for completeness against the type.
fn ipv4_of(addr: std::net::SocketAddr) -> Option<Ipv4Addr> {
    match addr.ip() {
        std::net::IpAddr::V4(ip) => Some(ip),
        std::net::IpAddr::V6(_) => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn upload_file_reads_in_chunks_then_reports_eof() {
        let mut path = std::env::temp_dir();
        path.push(format!("soulseek-core-upload-test-{}", std::process::id()));
        std::fs::write(&path, b"hello world").unwrap();

        let file = UploadFile::open(path.clone()).await.unwrap();
        assert_eq!(file.read_chunk(5).await.unwrap(), b"hello");
        assert_eq!(file.read_chunk(64).await.unwrap(), b" world");
        assert!(file.read_chunk(64).await.unwrap().is_empty());

        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn ipv4_of_extracts_v4_and_rejects_v6() {
        let v4: std::net::SocketAddr = "127.0.0.1:2234".parse().unwrap();
        assert!(ipv4_of(v4).is_some());
        let v6: std::net::SocketAddr = "[::1]:2234".parse().unwrap();
        assert!(ipv4_of(v6).is_none());
    }
}
