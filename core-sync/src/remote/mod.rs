//! # Remote Replica
//!
//! - [`RemoteWatcher`] replicates and then tails the remote change feed
//! - [`RemoteWriter`] applies changes recorded by the local side
//! - [`Backoff`] spaces out retries of a failing feed
//!
//! Remote paths are absolute (`/` is the root); document paths are the same
//! paths without the leading slash.

pub mod backoff;
pub mod watcher;
pub mod writer;

pub use backoff::Backoff;
pub use watcher::{from_remote, RemoteWatcher};
pub use writer::RemoteWriter;
