//! Workspace facade crate.
//!
//! Exposes the sync engine crates behind a single dependency. Host
//! applications can depend on `cloudsync-workspace` and enable the documented
//! features without wiring each crate individually.

#[cfg(feature = "desktop-shims")]
pub use core_metadata as metadata;
#[cfg(feature = "desktop-shims")]
pub use core_runtime as runtime;
#[cfg(feature = "desktop-shims")]
pub use core_sync as sync;
