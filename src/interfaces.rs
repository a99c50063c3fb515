//! Small trait interfaces this crate consumes from its excluded
//! collaborators (§6): the share index, credentials, and the settings that
//! feed [`crate::Conf`].
//!
//! None of these are implemented here; a caller wires in its own share
//! scanner, credential store and settings UI by implementing [`ShareIndex`]
//! and constructing [`Credentials`]/[`Settings`] from whatever it already
//! persists them as.

use crate::event::SearchResultFile;

/// A username/password pair, handed to [`crate::server::ServerSession::connect`].
/// Credentials vaulting is out of scope; this is a plain carrier.
#[derive(Clone, Debug)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl Credentials {
    pub fn new(username: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
        }
    }
}

/// The caller-supplied policy knobs this crate reads; a thin mirror of
/// whatever settings storage the caller already has. The core never reads a
/// config file itself, per the specification's exclusion of "persistent
/// settings storage" (§1).
#[derive(Clone, Debug)]
pub struct Settings {
    pub listen_port: u16,
    pub enable_upnp: bool,
    pub download_root: std::path::PathBuf,
    pub max_download_slots: usize,
    pub max_upload_slots: usize,
    pub min_shared_files: u32,
    pub min_shared_folders: u32,
    pub respond_to_searches: bool,
    pub accept_distributed_children: bool,
}

/// The local share index: what we have, and how to answer requests against
/// it. Share-directory scanning and file-indexing are explicitly out of
/// scope (§1); this is the seam the core calls into for the three things it
/// needs from that subsystem.
pub trait ShareIndex: Send + Sync {
    /// Resolves a Soulseek-style (backslash-separated) virtual path to the
    /// local files it names, for `FolderContentsRequest`/browsing.
    fn lookup(&self, soulseek_path: &str) -> Vec<SearchResultFile>;

    /// Returns `(folder_count, file_count)` for `SharedFoldersFiles`.
    fn totals(&self) -> (u32, u32);

    /// Matches a free-text query against the index, for both direct
    /// `FileSearch` replies and distributed `SearchRequest` fan-out.
    fn matches(&self, query: &str) -> Vec<SearchResultFile>;
}

/// A [`ShareIndex`] that shares nothing, for callers that don't want to
/// answer browse/search traffic (a download-only client).
#[derive(Default)]
pub struct EmptyShareIndex;

impl ShareIndex for EmptyShareIndex {
    fn lookup(&self, _soulseek_path: &str) -> Vec<SearchResultFile> {
        Vec::new()
    }

    fn totals(&self) -> (u32, u32) {
        (0, 0)
    }

    fn matches(&self, _query: &str) -> Vec<SearchResultFile> {
        Vec::new()
    }
}

/// The upload-slot policy the Upload Manager consults on every inbound
/// `QueueUpload`. Leech policy (`min_shared_files`/`folders`) and slot
/// accounting live with the caller, since they depend on state (who else is
/// uploading, what the requester shares) this crate doesn't track.
pub trait UploadPolicy: Send + Sync {
    /// Returns `Ok(())` to accept the request into the upload queue, or
    /// `Err(reason)` to send back as `UploadDenied`.
    fn admit(&self, username: &str, filename: &str, file_size: u64) -> Result<(), String>;
}

/// An [`UploadPolicy`] that accepts everything, for callers that don't want
/// to upload at all (a download-only client should instead deny
/// unconditionally; see [`DenyAllUploads`]).
#[derive(Default)]
pub struct AcceptAllUploads;

impl UploadPolicy for AcceptAllUploads {
    fn admit(&self, _username: &str, _filename: &str, _file_size: u64) -> Result<(), String> {
        Ok(())
    }
}

/// An [`UploadPolicy`] that refuses every request, for a download-only
/// client.
#[derive(Default)]
pub struct DenyAllUploads;

impl UploadPolicy for DenyAllUploads {
    fn admit(&self, _username: &str, _filename: &str, _file_size: u64) -> Result<(), String> {
        Err("uploads are disabled".to_owned())
    }
}
