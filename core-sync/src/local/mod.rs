//! # Local Replica
//!
//! Everything touching the local tree.
//!
//! ## Overview
//!
//! - [`LocalWatcher`] turns raw watcher events into intents, inferring moves
//!   from checksums and debouncing deletions
//! - [`LocalWriter`] applies changes recorded by the remote side
//! - [`LocalRenamer`] renames the local copy of a document that lost a
//!   collision, and tells the watcher to ignore the unlink it causes
//!
//! Document paths are relative to the sync root and `/`-separated; they are
//! joined onto the root with [`local_path`] before reaching the filesystem.

pub mod checksum;
pub mod pending;
pub mod watcher;
pub mod writer;

use async_trait::async_trait;
use bridge_traits::LocalFileSystem;
use core_metadata::Metadata;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info};

use crate::error::Result;
use crate::merge::ConflictRenamer;

pub use checksum::Checksumer;
pub use pending::PendingMap;
pub use watcher::LocalWatcher;
pub use writer::LocalWriter;

/// Absolute location of a document path under `root`
pub fn local_path(root: &Path, path: &str) -> PathBuf {
    path.split('/')
        .filter(|part| !part.is_empty())
        .fold(root.to_path_buf(), |acc, part| acc.join(part))
}

pub struct LocalRenamer {
    fs: Arc<dyn LocalFileSystem>,
    sync_path: PathBuf,
    suppressed: Mutex<HashSet<String>>,
}

impl LocalRenamer {
    pub fn new(fs: Arc<dyn LocalFileSystem>, sync_path: impl Into<PathBuf>) -> Self {
        Self {
            fs,
            sync_path: sync_path.into(),
            suppressed: Mutex::new(HashSet::new()),
        }
    }

    /// Whether the unlink of `path` was caused by a conflict rename.
    /// Consumes the mark.
    pub fn take_suppressed(&self, path: &str) -> bool {
        self.suppressed
            .lock()
            .map(|mut set| set.remove(path))
            .unwrap_or(false)
    }

    fn suppress(&self, path: &str, on: bool) {
        if let Ok(mut set) = self.suppressed.lock() {
            if on {
                set.insert(path.to_string());
            } else {
                set.remove(path);
            }
        }
    }
}

#[async_trait]
impl ConflictRenamer for LocalRenamer {
    async fn rename_conflicting(&self, doc: &mut Metadata, new_path: &str) -> Result<()> {
        let from = local_path(&self.sync_path, &doc.path);
        if !self.fs.exists(&from).await? {
            debug!(path = %doc.path, "Nothing on disk to rename");
            return Ok(());
        }
        let to = local_path(&self.sync_path, new_path);
        self.suppress(&doc.path, true);
        if let Err(err) = self.fs.rename(&from, &to).await {
            self.suppress(&doc.path, false);
            return Err(err.into());
        }
        info!(path = %doc.path, renamed = %new_path, "Renamed local conflicting copy");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bridge_traits::testing::MemoryFileSystem;

    #[test]
    fn test_local_path() {
        assert_eq!(
            local_path(Path::new("/sync"), "a/b.txt"),
            PathBuf::from("/sync/a/b.txt")
        );
        assert_eq!(local_path(Path::new("/sync"), "x"), PathBuf::from("/sync/x"));
    }

    #[tokio::test]
    async fn test_rename_marks_unlink_as_suppressed() {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.seed_file("/sync/a.txt", b"mine");
        let renamer = LocalRenamer::new(fs.clone(), "/sync");

        let mut doc = Metadata::file("a.txt");
        renamer
            .rename_conflicting(&mut doc, "a-conflict-2018-03-14T15_09_26.000Z.txt")
            .await
            .unwrap();

        assert_eq!(
            fs.relative_paths("/sync"),
            vec!["a-conflict-2018-03-14T15_09_26.000Z.txt"]
        );
        assert!(renamer.take_suppressed("a.txt"));
        assert!(!renamer.take_suppressed("a.txt"));
    }

    #[tokio::test]
    async fn test_missing_file_is_not_renamed() {
        let fs = Arc::new(MemoryFileSystem::new());
        let renamer = LocalRenamer::new(fs.clone(), "/sync");
        let mut doc = Metadata::file("gone.txt");
        renamer.rename_conflicting(&mut doc, "other.txt").await.unwrap();
        assert!(!renamer.take_suppressed("gone.txt"));
        assert!(fs.ops().is_empty());
    }
}
