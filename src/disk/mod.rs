//! Everything related to getting downloaded bytes onto the local
//! filesystem: where a file ends up ([`destination`]) and the actor that
//! writes it there ([`io`]).

pub mod destination;
pub mod io;

pub use destination::compute_destination;
pub use io::{Alert as DiskAlert, Command as DiskCommand, Disk};
