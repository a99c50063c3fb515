//! The crate-wide error type.
//!
//! Every public API in this crate returns [`Result`], whose error variant is
//! the single [`Error`] enum defined here. Components don't define their own
//! error types; this keeps propagation via `?` working uniformly across
//! codec, server, peer pool, and download manager boundaries.

use std::fmt;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// All error conditions this crate can report.
///
/// See the propagation policy in the specification: decode errors on a
/// single inbound message are recovered locally (logged and dropped, never
/// reach here); transport errors on the server socket are surfaced and
/// terminate the session; per-transfer failures are contained to the
/// transfer record; NAT errors are never fatal.
#[derive(Debug)]
pub enum Error {
    /// An operation was attempted before the server session was connected.
    NotConnected,
    /// A TCP connection attempt failed.
    ConnectionFailed(String),
    /// A suspend point (connect, read, write) exceeded its deadline.
    Timeout,
    /// The server or peer sent something we didn't expect in the current
    /// state (e.g. anything but a bitfield-equivalent during handshake).
    InvalidResponse(String),
    /// A frame's declared length exceeded the implementation cap.
    FrameTooLarge(u32),
    /// A message failed to decode past its header.
    Decode { code: u32, reason: String },
    /// An operation needed a live peer connection and none was found.
    NoPeerConnection(String),
    /// A configured port was outside the valid range.
    InvalidPort(u16),
    /// A pending operation was explicitly cancelled.
    Cancelled,
    /// The underlying connection was closed, gracefully or otherwise.
    ConnectionClosed,
    /// The destination file could not be created or opened.
    CannotCreateFile(std::io::Error),
    /// A file transfer ended with fewer bytes than expected.
    IncompleteTransfer { expected: u64, actual: u64 },
    /// A downloaded piece failed to verify (reserved for future use; the
    /// Soulseek protocol itself has no block-level checksum).
    VerificationFailed,
    /// No UPnP Internet Gateway Device responded to SSDP discovery.
    NoGatewayFound,
    /// No usable local (LAN) IP address could be determined.
    NoLocalIp,
    /// A NAT port mapping request failed.
    MappingFailed(String),
    /// A discovery operation (SSDP, STUN) timed out without a useful
    /// response.
    DiscoveryTimeout,
    /// Wraps an I/O error that doesn't fit a more specific variant.
    Io(std::io::Error),
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::NotConnected => write!(f, "not connected to server"),
            Self::ConnectionFailed(reason) => {
                write!(f, "connection failed: {}", reason)
            }
            Self::Timeout => write!(f, "operation timed out"),
            Self::InvalidResponse(reason) => {
                write!(f, "invalid response: {}", reason)
            }
            Self::FrameTooLarge(len) => {
                write!(f, "frame length {} exceeds cap", len)
            }
            Self::Decode { code, reason } => {
                write!(f, "failed to decode message {}: {}", code, reason)
            }
            Self::NoPeerConnection(user) => {
                write!(f, "no peer connection to {}", user)
            }
            Self::InvalidPort(port) => write!(f, "invalid port {}", port),
            Self::Cancelled => write!(f, "operation cancelled"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::CannotCreateFile(e) => {
                write!(f, "cannot create destination file: {}", e)
            }
            Self::IncompleteTransfer { expected, actual } => write!(
                f,
                "incomplete transfer: expected {} bytes, got {}",
                expected, actual
            ),
            Self::VerificationFailed => write!(f, "verification failed"),
            Self::NoGatewayFound => write!(f, "no upnp gateway found"),
            Self::NoLocalIp => write!(f, "no local ip address found"),
            Self::MappingFailed(reason) => {
                write!(f, "nat port mapping failed: {}", reason)
            }
            Self::DiscoveryTimeout => write!(f, "discovery timed out"),
            Self::Io(e) => write!(f, "io error: {}", e),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::CannotCreateFile(e) | Self::Io(e) => Some(e),
            _ => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}

impl From<tokio::time::Elapsed> for Error {
    fn from(_: tokio::time::Elapsed) -> Self {
        Self::Timeout
    }
}

impl<T> From<tokio::sync::mpsc::error::SendError<T>> for Error {
    fn from(_: tokio::sync::mpsc::error::SendError<T>) -> Self {
        // the receiving task has gone away, which for our purposes is
        // indistinguishable from the connection/session having closed
        Self::ConnectionClosed
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn display_includes_context() {
        let e = Error::IncompleteTransfer {
            expected: 100,
            actual: 42,
        };
        assert!(e.to_string().contains("100"));
        assert!(e.to_string().contains("42"));
    }
}
