//! The user-visible transfer record and the table that owns it.
//!
//! A [`TransferRecord`] is created the moment a download is queued (or an
//! upload is accepted into the queue) and is never deleted afterwards; it is
//! only ever mutated in place by whichever manager owns it, until it reaches
//! a terminal status. [`TransferTable`] is that ownership boundary: the
//! Download Manager holds one, the Upload Manager holds another, and
//! neither ever reaches into the other's table.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Instant;

/// Opaque identifier for a single transfer, stable for its whole lifetime.
pub type TransferId = u64;

/// Which way the bytes flow relative to us.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Direction {
    /// We are receiving a file from a peer.
    Download,
    /// We are sending a file to a peer.
    Upload,
}

/// Where a transfer currently stands, per §3's lifecycle.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TransferStatus {
    Queued,
    Connecting,
    Waiting,
    Transferring,
    Completed,
    Failed,
    Cancelled,
}

/// A single download or upload, as a consumer of this crate sees it.
#[derive(Clone, Debug)]
pub struct TransferRecord {
    pub id: TransferId,
    pub username: String,
    pub filename: String,
    pub size: u64,
    pub direction: Direction,
    pub status: TransferStatus,
    pub bytes_transferred: u64,
    /// Bytes per second, computed over the window since the last progress
    /// report; zero until the first report lands.
    pub speed: f64,
    pub error: Option<String>,
    pub local_path: Option<PathBuf>,
    created_at: Instant,
    last_progress_at: Instant,
    last_progress_bytes: u64,
}

impl TransferRecord {
    fn new(
        id: TransferId,
        username: String,
        filename: String,
        size: u64,
        direction: Direction,
    ) -> Self {
        let now = Instant::now();
        Self {
            id,
            username,
            filename,
            size,
            direction,
            status: TransferStatus::Queued,
            bytes_transferred: 0,
            speed: 0.0,
            error: None,
            local_path: None,
            created_at: now,
            last_progress_at: now,
            last_progress_bytes: 0,
        }
    }

    /// Records a progress tick, updating the rolling speed estimate. Callers
    /// report progress periodically rather than per-chunk, so the window
    /// between calls is what `speed` is computed over.
    pub fn report_progress(&mut self, bytes_transferred: u64) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_progress_at).as_secs_f64();
        if elapsed > 0.0 {
            let delta = bytes_transferred.saturating_sub(self.last_progress_bytes);
            self.speed = delta as f64 / elapsed;
        }
        self.bytes_transferred = bytes_transferred;
        self.last_progress_at = now;
        self.last_progress_bytes = bytes_transferred;
        self.status = TransferStatus::Transferring;
    }

    pub fn mark_completed(&mut self, local_path: PathBuf) {
        self.status = TransferStatus::Completed;
        self.local_path = Some(local_path);
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) {
        self.status = TransferStatus::Failed;
        self.error = Some(error.into());
    }

    pub fn mark_cancelled(&mut self) {
        self.status = TransferStatus::Cancelled;
    }

    pub fn elapsed(&self) -> std::time::Duration {
        self.created_at.elapsed()
    }
}

/// The single owner of a set of transfer records. Shared only by reference
/// within the manager that owns it (Download Manager or Upload Manager);
/// other subsystems never get direct access, only the events the owner
/// chooses to emit.
#[derive(Default)]
pub struct TransferTable {
    records: Mutex<HashMap<TransferId, TransferRecord>>,
    next_id: AtomicU64,
}

impl TransferTable {
    pub fn new() -> Self {
        Self {
            records: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        }
    }

    /// Creates a new queued record and returns its id.
    pub fn insert(
        &self,
        username: impl Into<String>,
        filename: impl Into<String>,
        size: u64,
        direction: Direction,
    ) -> TransferId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let record = TransferRecord::new(id, username.into(), filename.into(), size, direction);
        self.records.lock().unwrap().insert(id, record);
        id
    }

    /// Applies `f` to the record for `id`, if it still exists. Returns the
    /// record's status after mutation so callers can decide whether to emit
    /// an event without holding the lock themselves.
    pub fn mutate<R>(&self, id: TransferId, f: impl FnOnce(&mut TransferRecord) -> R) -> Option<R> {
        let mut records = self.records.lock().unwrap();
        records.get_mut(&id).map(f)
    }

    pub fn get(&self, id: TransferId) -> Option<TransferRecord> {
        self.records.lock().unwrap().get(&id).cloned()
    }

    pub fn all(&self) -> Vec<TransferRecord> {
        self.records.lock().unwrap().values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insert_then_mutate_roundtrip() {
        let table = TransferTable::new();
        let id = table.insert("alice", "song.mp3", 4096, Direction::Download);
        assert_eq!(table.get(id).unwrap().status, TransferStatus::Queued);

        table.mutate(id, |r| r.report_progress(2048));
        let record = table.get(id).unwrap();
        assert_eq!(record.status, TransferStatus::Transferring);
        assert_eq!(record.bytes_transferred, 2048);

        table.mutate(id, |r| r.mark_completed(PathBuf::from("/tmp/song.mp3")));
        let record = table.get(id).unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert_eq!(record.local_path, Some(PathBuf::from("/tmp/song.mp3")));
    }

    #[test]
    fn mutate_missing_id_is_none() {
        let table = TransferTable::new();
        assert!(table.mutate(999, |r| r.mark_cancelled()).is_none());
    }

    #[test]
    fn ids_are_unique() {
        let table = TransferTable::new();
        let a = table.insert("alice", "a.mp3", 1, Direction::Download);
        let b = table.insert("alice", "b.mp3", 1, Direction::Download);
        assert_ne!(a, b);
    }
}
