//! # Host Bridge Traits
//!
//! Capabilities the sync core needs from its host, expressed as traits.
//!
//! ## Overview
//!
//! The core never touches the disk or the network directly. Each collaborator
//! it relies on is injected behind one of these traits, so the same engine runs
//! against the real platform (`bridge-desktop`) or against the in-memory doubles
//! in [`testing`].
//!
//! ## Traits
//!
//! ### Replicas
//! - [`LocalFileSystem`](storage::LocalFileSystem) - Writes applied to the local tree
//! - [`RemoteCloud`](remote::RemoteCloud) - Change feed and revision-checked CRUD on the remote
//!
//! ### Utilities
//! - [`Clock`](time::Clock) - Time source for deterministic testing
//! - [`LoggerSink`](time::LoggerSink) - Forward structured logs to host logging
//!
//! The raw filesystem watcher is not a trait: the host feeds
//! [`WatcherEvent`](watcher::WatcherEvent)s into a channel owned by the core.
//!
//! ## Fail-Fast Strategy
//!
//! The core fails fast with descriptive errors when a required capability is
//! missing:
//!
//! ```ignore
//! use core_runtime::error::Error;
//!
//! let remote = builder.remote
//!     .ok_or_else(|| Error::CapabilityMissing {
//!         capability: "RemoteCloud".to_string(),
//!         message: "No remote implementation provided.".to_string(),
//!     })?;
//! ```
//!
//! ## Error Handling
//!
//! All bridge traits use [`BridgeError`](error::BridgeError). Implementations
//! convert platform errors into it, keeping `std::io::Error` intact so the
//! core can recognise a full disk.
//!
//! ## Thread Safety
//!
//! All bridge traits require `Send + Sync` bounds to support safe concurrent usage
//! across async tasks.

pub mod error;
pub mod remote;
pub mod storage;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
pub mod time;
pub mod watcher;

pub use error::BridgeError;

// Re-export commonly used types
pub use remote::{
    ChangesPage, RemoteChange, RemoteCloud, RemoteDoc, RemoteDocType, RemotePatch, UploadOptions,
    ROOT_DIR_ID,
};
pub use storage::{DynAsyncRead, FileStat, LocalFileSystem};
pub use time::{Clock, ConsoleLogger, LogEntry, LogLevel, LoggerSink, SystemClock};
pub use watcher::WatcherEvent;
