//! This module defines types used to configure the core and its parts.

use std::time::Duration;

/// The global configuration for the core and all its parts.
#[derive(Clone, Debug)]
pub struct Conf {
    pub server: ServerConf,
    pub peer: PeerConf,
    pub download: DownloadConf,
    pub upload: UploadConf,
    pub nat: NatConf,
    pub listener: ListenerConf,
}

impl Conf {
    /// Returns a configuration with reasonable defaults, except for the
    /// download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            server: ServerConf::default(),
            peer: PeerConf::default(),
            download: DownloadConf::new(download_dir),
            upload: UploadConf::default(),
            nat: NatConf::default(),
            listener: ListenerConf::default(),
        }
    }
}

/// Configuration related to the server session.
#[derive(Clone, Debug)]
pub struct ServerConf {
    /// Host of the index server to connect to.
    pub host: String,
    /// Port of the index server to connect to.
    pub port: u16,
    /// How long to wait for a `LoginResponse` before giving up and
    /// returning from `connect()` with whatever we have. The login itself
    /// may still complete after this grace period elapses; this only
    /// bounds how long the caller blocks.
    pub login_grace_period: Duration,
    /// Whether to accept distributed children from the server's branch
    /// assignment.
    pub accept_distributed_children: bool,
}

impl Default for ServerConf {
    fn default() -> Self {
        Self {
            host: "server.slsknet.org".to_owned(),
            port: 2242,
            // the reference client waits half a second for the login
            // response before considering the connection attempt settled
            login_grace_period: Duration::from_millis(500),
            accept_distributed_children: true,
        }
    }
}

/// Configuration related to the peer connection pool.
#[derive(Clone, Debug)]
pub struct PeerConf {
    /// The maximum number of simultaneous peer connections the pool will
    /// hold open. Past this, the oldest idle "P" connection is evicted to
    /// make room (connections in the RECEIVING state are never evicted).
    pub max_connections: usize,
    /// How long a direct TCP dial is given before we fall back to asking
    /// the server to relay a connection request (an indirect connection).
    pub direct_dial_timeout: Duration,
    /// How long we wait for an inbound `PierceFirewall` after asking the
    /// server for an indirect connection.
    pub pierce_wait_timeout: Duration,
    /// After how long of no activity and no pending request an idle "P"
    /// connection becomes eligible for eviction.
    pub idle_timeout: Duration,
    /// Default timeout for a `get_peer_address` request to the server.
    pub peer_address_timeout: Duration,
}

impl Default for PeerConf {
    fn default() -> Self {
        Self {
            // chosen to comfortably cover a handful of concurrent browse
            // and download sessions without exhausting file descriptors
            // on a typical desktop
            max_connections: 200,
            direct_dial_timeout: Duration::from_secs(10),
            pierce_wait_timeout: Duration::from_secs(15),
            idle_timeout: Duration::from_secs(60),
            peer_address_timeout: Duration::from_secs(10),
        }
    }
}

/// Configuration related to the download manager.
#[derive(Clone, Debug)]
pub struct DownloadConf {
    /// The directory under which `${download_dir}/${username}/...` files
    /// are written.
    pub download_dir: std::path::PathBuf,
    /// How long an inbound "F" connection is awaited, after sending
    /// `TransferResponse(allowed = true)`, before we dial out ourselves.
    pub inbound_file_conn_wait: Duration,
    /// The total wall-clock budget for a single download, from queueing to
    /// completion, after which it is marked failed regardless of which
    /// state it is stuck in.
    pub total_timeout: Duration,
    /// If set, a pending "F" connection whose reported username doesn't
    /// match any pending transfer is rejected outright, rather than being
    /// matched leniently against the sole pending transfer (see
    /// `DESIGN.md` for the rationale preserved from the source client).
    pub strict_username_matching: bool,
}

impl DownloadConf {
    /// Returns download configuration with reasonable defaults, except for
    /// the download directory, as it is not sensible to guess that for the
    /// user.
    pub fn new(download_dir: impl Into<std::path::PathBuf>) -> Self {
        Self {
            download_dir: download_dir.into(),
            inbound_file_conn_wait: Duration::from_secs(5),
            total_timeout: Duration::from_secs(60),
            // the lenient behavior matches the observed source client and
            // is the default; strict mode is opt-in
            strict_username_matching: false,
        }
    }
}

/// Configuration related to the Upload Manager, the counterpart to
/// [`DownloadConf`] described in `SPEC_FULL.md`'s supplemented features:
/// the same inbound-wait/outbound-dial race the download side runs for its
/// "F" connection, mirrored for the side that is offering the file.
#[derive(Clone, Debug)]
pub struct UploadConf {
    /// How long we give the downloader to dial an inbound "F" connection
    /// before we dial out ourselves, mirroring `DownloadConf::inbound_file_conn_wait`.
    pub inbound_file_conn_wait: Duration,
    /// How long we wait for the downloader's `TransferResponse` before
    /// giving up on a queued upload.
    pub transfer_response_timeout: Duration,
    /// The total wall-clock budget for a single upload, from acceptance
    /// into the queue to completion.
    pub total_timeout: Duration,
}

impl Default for UploadConf {
    fn default() -> Self {
        Self {
            inbound_file_conn_wait: Duration::from_secs(5),
            transfer_response_timeout: Duration::from_secs(60),
            total_timeout: Duration::from_secs(60),
        }
    }
}

/// Configuration related to NAT traversal.
#[derive(Clone, Debug)]
pub struct NatConf {
    /// Whether to attempt UPnP IGD port mapping at all.
    pub enable_upnp: bool,
    /// Whether to attempt NAT-PMP port mapping when UPnP fails or is
    /// disabled.
    pub enable_nat_pmp: bool,
    /// Minimum spacing enforced between successive SSDP probes and
    /// HTTP-based external-IP lookups, to stay polite to multicast
    /// listeners and free ip-echo services.
    pub probe_spacing: Duration,
    /// Requested lease duration for NAT-PMP mappings. UPnP mappings are
    /// always requested as permanent (lease 0) per the specification.
    pub nat_pmp_lease: Duration,
    /// A human-readable tag included in UPnP `AddPortMapping` requests so
    /// the mapping is identifiable in the router's admin UI.
    pub mapping_description: String,
}

impl Default for NatConf {
    fn default() -> Self {
        Self {
            enable_upnp: true,
            enable_nat_pmp: true,
            probe_spacing: Duration::from_millis(500),
            nat_pmp_lease: Duration::from_secs(7200),
            mapping_description: "SeeleSeek".to_owned(),
        }
    }
}

/// Configuration related to the dual TCP listener service.
#[derive(Clone, Debug)]
pub struct ListenerConf {
    /// The inclusive range of ports to try for the plain listener. The
    /// obfuscated listener always binds `plain_port + 1`.
    pub port_range: std::ops::RangeInclusive<u16>,
}

impl Default for ListenerConf {
    fn default() -> Self {
        Self {
            port_range: 2234..=2240,
        }
    }
}
