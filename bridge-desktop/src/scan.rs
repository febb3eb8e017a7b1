//! Initial tree scan
//!
//! Walks the sync root and produces the `Add`/`AddDir` events a platform
//! watcher reports on startup, parents before children, followed by `Ready`.

use bridge_traits::{
    error::{BridgeError, Result},
    storage::FileStat,
    watcher::WatcherEvent,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

fn stat_of(metadata: &std::fs::Metadata) -> FileStat {
    #[cfg(unix)]
    let executable = {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o100 != 0
    };
    #[cfg(not(unix))]
    let executable = false;

    FileStat {
        size: if metadata.is_dir() { 0 } else { metadata.len() },
        modified: metadata.modified().ok().map(DateTime::<Utc>::from),
        created: metadata.created().ok().map(DateTime::<Utc>::from),
        is_directory: metadata.is_dir(),
        executable: !metadata.is_dir() && executable,
    }
}

fn relative(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let parts: Vec<String> = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    Some(parts.join("/"))
}

/// Scan `root` and return the startup events, ending with [`WatcherEvent::Ready`]
///
/// Symlinks are skipped. Entries whose names are listed in `skip` (such as
/// the engine's temporary directory) are skipped along with their contents.
pub async fn scan_tree(root: &Path, skip: &[&str]) -> Result<Vec<WatcherEvent>> {
    let mut events = Vec::new();
    let mut stack: Vec<PathBuf> = vec![root.to_path_buf()];

    while let Some(dir) = stack.pop() {
        let mut read_dir = fs::read_dir(&dir).await.map_err(BridgeError::Io)?;
        let mut entries = Vec::new();
        while let Some(entry) = read_dir.next_entry().await.map_err(BridgeError::Io)? {
            entries.push(entry.path());
        }
        entries.sort();

        let mut subdirs = Vec::new();
        for path in entries {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            if skip.contains(&name.as_str()) {
                continue;
            }
            let metadata = match fs::symlink_metadata(&path).await {
                Ok(metadata) => metadata,
                Err(e) => {
                    warn!(path = ?path, error = %e, "Skipping unreadable entry");
                    continue;
                }
            };
            if metadata.file_type().is_symlink() {
                continue;
            }
            let Some(rel) = relative(root, &path) else {
                continue;
            };
            let stat = stat_of(&metadata);
            if metadata.is_dir() {
                events.push(WatcherEvent::AddDir { path: rel, stat });
                subdirs.push(path);
            } else {
                events.push(WatcherEvent::Add { path: rel, stat });
            }
        }
        // Reverse so the stack pops subdirectories in sorted order
        stack.extend(subdirs.into_iter().rev());
    }

    debug!(root = ?root, count = events.len(), "Scanned sync root");
    events.push(WatcherEvent::Ready);
    Ok(events)
}
