//! Local Filesystem Abstractions
//!
//! The operations the sync engine performs on the local tree. Paths handed to
//! a [`LocalFileSystem`] are absolute; the engine joins its relative document
//! paths onto the configured sync root before calling in.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::Path;
use tokio::io::AsyncRead;

use crate::error::Result;

/// Owned, sendable byte stream used for file contents in both directions.
pub type DynAsyncRead = dyn AsyncRead + Send + Unpin;

/// Stat information for a file or directory
///
/// This is both what the filesystem watcher reports with each event and what
/// [`LocalFileSystem::stat`] returns.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileStat {
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    /// Birth time, when the platform records one
    pub created: Option<DateTime<Utc>>,
    pub is_directory: bool,
    /// Owner-execute bit (`0o100`)
    pub executable: bool,
}

impl FileStat {
    /// Stat for a regular file
    pub fn file(size: u64) -> Self {
        Self {
            size,
            ..Self::default()
        }
    }

    /// Stat for a directory
    pub fn directory() -> Self {
        Self {
            is_directory: true,
            ..Self::default()
        }
    }

    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.modified = Some(modified);
        self
    }

    pub fn with_created(mut self, created: DateTime<Utc>) -> Self {
        self.created = Some(created);
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }
}

/// Local filesystem applier
///
/// Abstracts every write the engine applies to the local replica, plus the
/// reads needed to hash and upload file contents.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::storage::LocalFileSystem;
///
/// async fn replace(fs: &dyn LocalFileSystem, tmp: &Path, target: &Path) -> Result<()> {
///     fs.rename(tmp, target).await?;
///     fs.set_executable(target, true).await
/// }
/// ```
#[async_trait]
pub trait LocalFileSystem: Send + Sync {
    /// Check if a file or directory exists
    async fn exists(&self, path: &Path) -> Result<bool>;

    /// Get stat information for a file or directory
    async fn stat(&self, path: &Path) -> Result<FileStat>;

    /// Create a directory and all missing ancestors
    async fn create_dir_all(&self, path: &Path) -> Result<()>;

    /// Open a file for streaming reads
    async fn open_read_stream(&self, path: &Path) -> Result<Box<DynAsyncRead>>;

    /// Write a stream to a file, creating or truncating it
    ///
    /// Returns the number of bytes written. The parent directory must exist.
    async fn write_stream(&self, path: &Path, content: Box<DynAsyncRead>) -> Result<u64>;

    /// Copy a file's contents to another path
    async fn copy_file(&self, from: &Path, to: &Path) -> Result<u64> {
        let reader = self.open_read_stream(from).await?;
        self.write_stream(to, reader).await
    }

    /// Set the modification time
    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()>;

    /// Set or clear the executable permission
    async fn set_executable(&self, path: &Path, executable: bool) -> Result<()>;

    /// Rename a file or directory
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    /// Remove an empty directory
    async fn remove_dir(&self, path: &Path) -> Result<()>;

    /// Remove a file or a directory tree. Succeeds when the path is already gone.
    async fn remove_all(&self, path: &Path) -> Result<()>;

    /// Move a file or directory tree to the platform trash
    async fn trash(&self, path: &Path) -> Result<()>;
}
