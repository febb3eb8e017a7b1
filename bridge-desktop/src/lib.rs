//! # Desktop Bridge Implementations
//!
//! Default implementations of bridge traits for desktop platforms
//! (macOS, Windows, Linux).
//!
//! ## Overview
//!
//! - `LocalFileSystem` using `tokio::fs`, trashing into the user trash directory
//! - An initial tree scan producing the watcher's startup events
//!
//! The remote side has no desktop default: hosts inject their own
//! `RemoteCloud` client.
//!
//! ## Usage
//!
//! ```ignore
//! use bridge_desktop::{scan_tree, TokioLocalFileSystem};
//!
//! #[tokio::main]
//! async fn main() {
//!     let fs = TokioLocalFileSystem::new();
//!     let events = scan_tree(Path::new("/home/me/Cloud"), &[]).await?;
//!
//!     // Use in core configuration
//! }
//! ```

mod filesystem;
mod scan;

pub use filesystem::TokioLocalFileSystem;
pub use scan::scan_tree;
