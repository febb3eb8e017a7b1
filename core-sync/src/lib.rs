//! # Sync Module
//!
//! Two-replica synchronization between a local directory and a cloud store.
//!
//! ## Overview
//!
//! Changes flow one way through the pipeline:
//! - detectors ([`local::LocalWatcher`], [`remote::RemoteWatcher`]) turn raw
//!   events into intents
//! - the [`prep::Prep`]arer validates them and computes identities
//! - [`merge::Merge`] reconciles them with the metadata store, renaming
//!   colliding copies
//! - the [`engine::SyncEngine`] tails the store and applies each change to
//!   the replica that is behind through a [`side::Side`]
//!
//! ## Components
//!
//! - **Ignore rules** (`ignore`): gitignore-style exclusions
//! - **Conflict naming** (`conflict`): `-conflict-<timestamp>` suffixes
//! - **Sync state** (`state`): observable up to date / syncing / error
//! - **Coordinator** (`coordinator`): wires everything from a `SyncConfig`

pub mod conflict;
pub mod coordinator;
pub mod engine;
pub mod error;
pub mod ignore;
pub mod local;
pub mod merge;
pub mod prep;
pub mod remote;
pub mod side;
pub mod state;

pub use coordinator::SyncCoordinator;
pub use engine::{SyncEngine, MAX_SYNC_ERRORS};
pub use error::{Result, SyncError};
pub use ignore::IgnoreRules;
pub use merge::{ConflictRenamer, Merge};
pub use prep::Prep;
pub use side::Side;
pub use state::{SyncState, SyncStateTracker};
