//! The disk IO actor: a single task that owns every in-progress download's
//! destination file handle and serializes writes to it through the
//! blocking pool, the way the teacher's `Disk` actor serialized torrent
//! block writes behind a `Command`/`Alert` channel pair rather than
//! letting every caller touch `std::fs` directly from an async context.
//!
//! Unlike the teacher's torrent storage, Soulseek transfers are a single
//! sequential stream per file (no piece-level random access), so there is
//! no block map or scatter/gather write here -- just one handle per
//! transfer, appended to in arrival order and fsynced once before the
//! transfer is declared complete (§4.4).

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Seek, SeekFrom, Write};
use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio::task;

use crate::error::Error;
use crate::transfer::TransferId;

/// A request queued to the disk actor for one transfer.
pub enum Command {
    /// Creates (truncating any previous partial content) the destination
    /// file, making parent directories as needed.
    Open { id: TransferId, path: PathBuf },
    /// Appends `data` to the file previously opened for `id`.
    Write { id: TransferId, data: Vec<u8> },
    /// Fsyncs the file and reports whether its on-disk size satisfies
    /// §4.4's completeness criteria against `expected_size`.
    Finalize { id: TransferId, expected_size: u64 },
    /// Drops whatever open handle we hold for `id` without deleting the
    /// partial file, mirroring the teacher's choice to leave partial
    /// torrent data on disk for the caller to clean up rather than
    /// silently discarding it.
    Abort { id: TransferId },
}

/// What the disk actor reports back for a given transfer.
#[derive(Debug)]
pub enum Alert {
    Opened { id: TransferId },
    OpenFailed { id: TransferId, error: String },
    Written { id: TransferId, total_bytes: u64 },
    WriteFailed { id: TransferId, error: String },
    /// `Ok(actual_bytes)` if the transfer met §4.4's completeness
    /// criteria, `Err` otherwise.
    Finalized {
        id: TransferId,
        result: Result<u64, Error>,
    },
}

pub type AlertSender = mpsc::UnboundedSender<Alert>;
pub type AlertReceiver = mpsc::UnboundedReceiver<Alert>;
pub type CommandSender = mpsc::UnboundedSender<Command>;
pub type CommandReceiver = mpsc::UnboundedReceiver<Command>;

struct OpenFile {
    handle: File,
    written: u64,
}

/// Owns every open download file handle; driven entirely through
/// [`Command`]s so callers never block an executor thread on `std::fs`.
pub struct Disk {
    files: HashMap<TransferId, OpenFile>,
    cmd_port: CommandReceiver,
    alert_chan: AlertSender,
}

impl Disk {
    /// Creates a new disk actor and the channel halves used to drive it.
    /// The caller is expected to `tokio::spawn(disk.run())` once and share
    /// the returned [`CommandSender`] across every in-flight download.
    pub fn new() -> (Self, CommandSender, AlertReceiver) {
        let (cmd_chan, cmd_port) = mpsc::unbounded_channel();
        let (alert_chan, alert_port) = mpsc::unbounded_channel();
        (
            Self {
                files: HashMap::new(),
                cmd_port,
                alert_chan,
            },
            cmd_chan,
            alert_port,
        )
    }

    /// Runs the actor loop until every `CommandSender` clone has been
    /// dropped.
    pub async fn run(mut self) {
        log::info!("starting disk IO actor");
        while let Some(cmd) = self.cmd_port.recv().await {
            match cmd {
                Command::Open { id, path } => self.open(id, path).await,
                Command::Write { id, data } => self.write(id, data).await,
                Command::Finalize { id, expected_size } => {
                    self.finalize(id, expected_size).await
                }
                Command::Abort { id } => {
                    self.files.remove(&id);
                }
            }
        }
        log::info!("disk IO actor shutting down");
    }

    async fn open(&mut self, id: TransferId, path: PathBuf) {
        let result = task::spawn_blocking({
            let path = path.clone();
            move || -> std::io::Result<File> {
                if let Some(parent) = path.parent() {
                    std::fs::create_dir_all(parent)?;
                }
                OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&path)
            }
        })
        .await
        .expect("disk blocking task panicked");

        match result {
            Ok(handle) => {
                self.files.insert(id, OpenFile { handle, written: 0 });
                let _ = self.alert_chan.send(Alert::Opened { id });
            }
            Err(e) => {
                log::warn!("failed to open destination file {:?} for transfer {}: {}", path, id, e);
                let _ = self.alert_chan.send(Alert::OpenFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn write(&mut self, id: TransferId, data: Vec<u8>) {
        let open_file = match self.files.remove(&id) {
            Some(f) => f,
            None => {
                let _ = self.alert_chan.send(Alert::WriteFailed {
                    id,
                    error: "write on a transfer with no open file".to_owned(),
                });
                return;
            }
        };

        let result = task::spawn_blocking(move || -> std::io::Result<OpenFile> {
            let OpenFile { mut handle, written } = open_file;
            handle.write_all(&data)?;
            Ok(OpenFile {
                handle,
                written: written + data.len() as u64,
            })
        })
        .await
        .expect("disk blocking task panicked");

        match result {
            Ok(open_file) => {
                let total = open_file.written;
                self.files.insert(id, open_file);
                let _ = self.alert_chan.send(Alert::Written { id, total_bytes: total });
            }
            Err(e) => {
                let _ = self.alert_chan.send(Alert::WriteFailed {
                    id,
                    error: e.to_string(),
                });
            }
        }
    }

    async fn finalize(&mut self, id: TransferId, expected_size: u64) {
        let open_file = match self.files.remove(&id) {
            Some(f) => f,
            None => {
                let _ = self.alert_chan.send(Alert::Finalized {
                    id,
                    result: Err(Error::ConnectionClosed),
                });
                return;
            }
        };

        let sync_result = task::spawn_blocking(move || -> std::io::Result<u64> {
            let OpenFile { mut handle, .. } = open_file;
            handle.sync_all()?;
            handle.seek(SeekFrom::End(0))
        })
        .await
        .expect("disk blocking task panicked");

        let result = match sync_result {
            Ok(actual) if expected_size == 0 && actual > 0 => {
                log::warn!(
                    "transfer {} completed with expected size 0 (actual {} bytes); treating as upstream protocol quirk, not a failure",
                    id,
                    actual
                );
                Ok(actual)
            }
            Ok(actual) if expected_size > 0 && actual >= expected_size => Ok(actual),
            Ok(actual) => Err(Error::IncompleteTransfer {
                expected: expected_size,
                actual,
            }),
            Err(e) => Err(Error::Io(e)),
        };
        let _ = self.alert_chan.send(Alert::Finalized { id, result });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn open_write_finalize_round_trip_reports_completion() {
        let dir = tempdir();
        let path = dir.join("alice/song.mp3");

        let (disk, cmd, mut alerts) = Disk::new();
        tokio::spawn(disk.run());

        cmd.send(Command::Open { id: 1, path: path.clone() }).unwrap();
        assert!(matches!(alerts.recv().await.unwrap(), Alert::Opened { id: 1 }));

        cmd.send(Command::Write { id: 1, data: vec![1, 2, 3, 4] }).unwrap();
        match alerts.recv().await.unwrap() {
            Alert::Written { id: 1, total_bytes: 4 } => {}
            other => panic!("unexpected alert: {:?}", other),
        }

        cmd.send(Command::Finalize { id: 1, expected_size: 4 }).unwrap();
        match alerts.recv().await.unwrap() {
            Alert::Finalized { id: 1, result: Ok(4) } => {}
            other => panic!("unexpected alert: {:?}", other),
        }

        assert_eq!(std::fs::read(&path).unwrap(), vec![1, 2, 3, 4]);
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn short_write_finalizes_as_incomplete() {
        let dir = tempdir();
        let path = dir.join("bob/song.mp3");

        let (disk, cmd, mut alerts) = Disk::new();
        tokio::spawn(disk.run());

        cmd.send(Command::Open { id: 2, path: path.clone() }).unwrap();
        alerts.recv().await.unwrap();
        cmd.send(Command::Write { id: 2, data: vec![9; 2] }).unwrap();
        alerts.recv().await.unwrap();
        cmd.send(Command::Finalize { id: 2, expected_size: 100 }).unwrap();
        match alerts.recv().await.unwrap() {
            Alert::Finalized {
                id: 2,
                result: Err(Error::IncompleteTransfer { expected: 100, actual: 2 }),
            } => {}
            other => panic!("unexpected alert: {:?}", other),
        }
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn zero_expected_size_with_bytes_is_a_warned_completion() {
        let dir = tempdir();
        let path = dir.join("carol/song.mp3");

        let (disk, cmd, mut alerts) = Disk::new();
        tokio::spawn(disk.run());

        cmd.send(Command::Open { id: 3, path: path.clone() }).unwrap();
        alerts.recv().await.unwrap();
        cmd.send(Command::Write { id: 3, data: vec![1] }).unwrap();
        alerts.recv().await.unwrap();
        cmd.send(Command::Finalize { id: 3, expected_size: 0 }).unwrap();
        match alerts.recv().await.unwrap() {
            Alert::Finalized { id: 3, result: Ok(1) } => {}
            other => panic!("unexpected alert: {:?}", other),
        }
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    #[tokio::test]
    async fn zero_expected_size_with_no_bytes_is_incomplete() {
        let dir = tempdir();
        let path = dir.join("dave/song.mp3");

        let (disk, cmd, mut alerts) = Disk::new();
        tokio::spawn(disk.run());

        cmd.send(Command::Open { id: 4, path: path.clone() }).unwrap();
        alerts.recv().await.unwrap();
        cmd.send(Command::Finalize { id: 4, expected_size: 0 }).unwrap();
        match alerts.recv().await.unwrap() {
            Alert::Finalized {
                id: 4,
                result: Err(Error::IncompleteTransfer { expected: 0, actual: 0 }),
            } => {}
            other => panic!("unexpected alert: {:?}", other),
        }
        std::fs::remove_dir_all(dir.parent().unwrap()).ok();
    }

    fn tempdir() -> PathBuf {
        let mut dir = std::env::temp_dir();
        dir.push(format!(
            "soulseek-core-disk-test-{}-{}",
            std::process::id(),
            std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .unwrap_or(Duration::from_secs(0))
                .as_nanos()
        ));
        dir
    }
}
