//! A single peer connection and the pool that owns every one of them.
//!
//! [`connection`] wraps one live "P" or "D" socket once its handshake has
//! completed; [`file_socket`] is the raw, unframed stream handed off for
//! "F" connections; [`pool`] accepts inbound sockets, dials outbound ones,
//! and runs the direct/indirect negotiation state machine (§4.3) that
//! reconciles the two.

pub mod connection;
pub mod file_socket;
pub mod pool;

pub use connection::PeerConnection;
pub use pool::{PeerPool, PersistentPurpose, ServerLink};
