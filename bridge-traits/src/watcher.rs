//! Filesystem Watcher Events
//!
//! Raw events delivered by the platform watcher collaborator. Paths are
//! relative to the sync root and use `/` as the separator.

use crate::storage::FileStat;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatcherEvent {
    Add { path: String, stat: FileStat },
    AddDir { path: String, stat: FileStat },
    Change { path: String, stat: FileStat },
    Unlink { path: String },
    UnlinkDir { path: String },
    /// The initial scan is complete
    Ready,
    Error { message: String },
}

impl WatcherEvent {
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::Add { path, .. }
            | Self::AddDir { path, .. }
            | Self::Change { path, .. }
            | Self::Unlink { path }
            | Self::UnlinkDir { path } => Some(path),
            Self::Ready | Self::Error { .. } => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Add { .. } => "add",
            Self::AddDir { .. } => "addDir",
            Self::Change { .. } => "change",
            Self::Unlink { .. } => "unlink",
            Self::UnlinkDir { .. } => "unlinkDir",
            Self::Ready => "ready",
            Self::Error { .. } => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_path_and_kind() {
        let add = WatcherEvent::Add {
            path: "docs/a.txt".to_string(),
            stat: FileStat::file(3),
        };
        assert_eq!(add.path(), Some("docs/a.txt"));
        assert_eq!(add.kind(), "add");
        assert_eq!(WatcherEvent::Ready.path(), None);
        assert_eq!(
            WatcherEvent::UnlinkDir {
                path: "docs".to_string()
            }
            .kind(),
            "unlinkDir"
        );
    }
}
