//! coved — the Cove peer-to-peer folder synchronization daemon.
//!
//! Library surface so the daemon's controller and protocol machinery can
//! be driven in-process by integration tests; the `coved` binary is a thin
//! wrapper over these modules.

pub mod controller;
pub mod discovery;
pub mod scheduler;
pub mod session;
pub mod transport;

pub use controller::{FolderController, FolderShared};
pub use discovery::{Candidate, Discovery};
pub use session::CloseReason;
