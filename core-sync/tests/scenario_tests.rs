//! Integration tests for the sync pipeline
//!
//! Each test wires a [`SyncCoordinator`] over an in-memory filesystem, an
//! in-memory cloud and an in-memory database, then drives the detectors and
//! the engine step by step:
//! - local changes reaching the remote, moves included
//! - remote changes reaching the local tree
//! - case-insensitive identity clashes
//! - repeated failures being abandoned without blocking the queue
//! - deletions of whole folders

use bridge_traits::testing::{ManualClock, MemoryCloud, MemoryFileSystem};
use bridge_traits::{BridgeError, FileStat, LocalFileSystem, WatcherEvent};
use chrono::{TimeZone, Utc};
use core_metadata::{checksum_of, MetadataStore};
use core_runtime::config::{CaseSensitivity, SyncConfig, SyncTimings};
use core_runtime::events::{CoreEvent, SyncEvent};
use core_sync::{SyncCoordinator, MAX_SYNC_ERRORS};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

// ============================================================================
// Harness
// ============================================================================

struct Harness {
    sync: SyncCoordinator,
    fs: Arc<MemoryFileSystem>,
    cloud: Arc<MemoryCloud>,
}

async fn harness(case_sensitivity: CaseSensitivity) -> Harness {
    let fs = Arc::new(MemoryFileSystem::new());
    fs.seed_dir("/sync");
    let cloud = Arc::new(MemoryCloud::new());
    let clock = Arc::new(ManualClock::new(
        Utc.with_ymd_and_hms(2018, 3, 14, 15, 9, 26).unwrap(),
    ));

    let config = SyncConfig::builder()
        .sync_path("/sync")
        .in_memory_database()
        .local_fs(fs.clone())
        .remote(cloud.clone())
        .clock(clock)
        .case_sensitivity(case_sensitivity)
        .timings(SyncTimings::fast())
        .build()
        .unwrap();
    let sync = SyncCoordinator::new(config).await.unwrap();

    Harness { sync, fs, cloud }
}

impl Harness {
    /// Write a file locally and report it to the local watcher
    async fn local_add(&self, path: &str, content: &[u8]) {
        self.fs.seed_file(format!("/sync/{path}"), content);
        self.sync
            .local_watcher()
            .handle(WatcherEvent::Add {
                path: path.to_string(),
                stat: FileStat::file(content.len() as u64),
            })
            .await
            .unwrap();
    }

    async fn local_add_dir(&self, path: &str) {
        self.fs.seed_dir(format!("/sync/{path}"));
        self.sync
            .local_watcher()
            .handle(WatcherEvent::AddDir {
                path: path.to_string(),
                stat: FileStat::directory(),
            })
            .await
            .unwrap();
    }

    /// Rename a file locally and report it the way watchers do: unlink, then add
    async fn local_move(&self, from: &str, to: &str, content: &[u8]) {
        self.fs
            .rename(
                Path::new(&format!("/sync/{from}")),
                Path::new(&format!("/sync/{to}")),
            )
            .await
            .unwrap();
        let watcher = self.sync.local_watcher();
        watcher
            .handle(WatcherEvent::Unlink {
                path: from.to_string(),
            })
            .await
            .unwrap();
        watcher
            .handle(WatcherEvent::Add {
                path: to.to_string(),
                stat: FileStat::file(content.len() as u64),
            })
            .await
            .unwrap();
    }

    async fn sync_pending(&self) -> usize {
        self.sync.engine().sync_pending().await.unwrap()
    }

    fn cloud_ops_since(&self, start: usize) -> Vec<String> {
        self.cloud.ops()[start..].to_vec()
    }
}

// ============================================================================
// Local to remote
// ============================================================================

#[tokio::test]
async fn test_local_add_is_uploaded_and_converges() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("report.txt", b"A").await;

    let recorded = h.sync.store().get("report.txt").await.unwrap().unwrap();
    assert_eq!(recorded.sides.local, Some(1));
    assert_eq!(recorded.sides.remote, None);
    assert_eq!(recorded.checksum.as_deref(), Some(checksum_of(b"A").as_str()));

    h.sync_pending().await;

    let uploaded = h.cloud.by_path("/report.txt").unwrap();
    assert_eq!(h.cloud.content(&uploaded.id).unwrap(), b"A".to_vec());
    let synced = h.sync.store().get("report.txt").await.unwrap().unwrap();
    assert_eq!(synced.sides.local, synced.sides.remote);
    assert_eq!(synced.sides.local, synced.rev);
    assert_eq!(synced.remote.unwrap().id, uploaded.id);
}

#[tokio::test]
async fn test_nested_add_creates_remote_folders_first() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add_dir("docs").await;
    h.local_add("docs/a.txt", b"a").await;

    h.sync_pending().await;

    assert_eq!(h.cloud.paths(), vec!["/docs", "/docs/a.txt"]);
    let ops = h.cloud.ops();
    let mkdir = ops.iter().position(|op| op == "create_directory /docs").unwrap();
    let upload = ops.iter().position(|op| op == "upload_file /docs/a.txt").unwrap();
    assert!(mkdir < upload);
}

#[tokio::test]
async fn test_move_chain_reaches_remote_as_one_move() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("a", b"content").await;
    h.sync_pending().await;
    let remote_id = h.cloud.by_path("/a").unwrap().id;
    let start = h.cloud.ops().len();

    h.local_move("a", "b", b"content").await;
    h.local_move("b", "c", b"content").await;
    h.sync_pending().await;

    assert_eq!(
        h.cloud_ops_since(start),
        vec![format!("update_attributes {remote_id} /c")]
    );
    assert_eq!(h.cloud.paths(), vec!["/c"]);
    assert!(h.sync.store().get("a").await.unwrap().is_none());
    assert!(h.sync.store().get("b").await.unwrap().is_none());
    let moved = h.sync.store().get("c").await.unwrap().unwrap();
    assert_eq!(moved.sides.local, moved.sides.remote);
}

#[tokio::test]
async fn test_unlink_then_add_with_same_content_is_a_move() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("x", b"payload").await;
    h.sync_pending().await;
    let remote_id = h.cloud.by_path("/x").unwrap().id;
    let start = h.cloud.ops().len();

    h.local_move("x", "y", b"payload").await;
    h.sync_pending().await;

    assert_eq!(
        h.cloud_ops_since(start),
        vec![format!("update_attributes {remote_id} /y")]
    );
    assert!(!h.cloud.is_trashed(&remote_id));
}

#[tokio::test]
async fn test_add_then_delete_before_sync_never_reaches_remote() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("draft.txt", b"draft").await;
    let doc = h.sync.store().get("draft.txt").await.unwrap().unwrap();
    h.sync
        .prep()
        .delete_file(core_metadata::SideName::Local, doc)
        .await
        .unwrap();

    h.sync_pending().await;

    assert!(h.cloud.ops().is_empty());
}

#[tokio::test]
async fn test_deleting_twice_trashes_once() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("old.txt", b"old").await;
    h.sync_pending().await;
    let remote_id = h.cloud.by_path("/old.txt").unwrap().id;

    let doc = h.sync.store().get("old.txt").await.unwrap().unwrap();
    let prep = h.sync.prep();
    prep.delete_file(core_metadata::SideName::Local, doc.clone())
        .await
        .unwrap();
    prep.delete_file(core_metadata::SideName::Local, doc)
        .await
        .unwrap();
    h.sync_pending().await;

    assert!(h.cloud.is_trashed(&remote_id));
    let trashes = h
        .cloud
        .ops()
        .into_iter()
        .filter(|op| op.starts_with("trash"))
        .count();
    assert_eq!(trashes, 1);
}

#[tokio::test]
async fn test_folder_delete_removes_children_before_parent() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add_dir("d").await;
    h.local_add("d/f.txt", b"f").await;
    h.sync_pending().await;
    let start = h.cloud.ops().len();

    h.fs.remove_all(Path::new("/sync/d")).await.unwrap();
    let watcher = h.sync.local_watcher();
    watcher
        .handle(WatcherEvent::Unlink {
            path: "d/f.txt".to_string(),
        })
        .await
        .unwrap();
    watcher
        .handle(WatcherEvent::UnlinkDir {
            path: "d".to_string(),
        })
        .await
        .unwrap();
    // Let both deletion timers fire
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(watcher.pending().is_empty());

    h.sync_pending().await;

    let ops = h.cloud_ops_since(start);
    let child = ops.iter().position(|op| op == "trash /d/f.txt");
    let parent = ops.iter().position(|op| op == "trash /d").unwrap();
    if let Some(child) = child {
        assert!(child < parent);
    }
    assert!(h.cloud.paths().is_empty());
}

#[tokio::test]
async fn test_ignored_files_stay_local() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("notes.tmp", b"scratch").await;
    h.local_add(".hidden", b"secret").await;

    assert!(h.sync.store().get("notes.tmp").await.unwrap().is_none());
    h.sync_pending().await;
    assert!(h.cloud.ops().is_empty());
}

// ============================================================================
// Remote to local
// ============================================================================

#[tokio::test]
async fn test_remote_tree_is_downloaded() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.cloud
        .seed_file("/photos/cat.jpg", b"meow", &checksum_of(b"meow"));
    h.cloud.seed_file("/todo.md", b"- [ ]", &checksum_of(b"- [ ]"));

    h.sync.remote_watcher().start().await.unwrap();
    h.sync_pending().await;

    assert!(h.fs.is_dir("/sync/photos"));
    assert_eq!(h.fs.read("/sync/photos/cat.jpg").unwrap(), b"meow".to_vec());
    assert_eq!(h.fs.read("/sync/todo.md").unwrap(), b"- [ ]".to_vec());
    // Nothing goes back up
    assert!(h
        .cloud
        .ops()
        .iter()
        .all(|op| !op.starts_with("upload_file") && !op.starts_with("overwrite_file")));
}

#[tokio::test]
async fn test_uploaded_change_echoed_by_the_feed_is_not_reapplied() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.sync.remote_watcher().start().await.unwrap();
    h.local_add("report.txt", b"A").await;
    h.sync_pending().await;
    let cloud_start = h.cloud.ops().len();
    let writes_before = h
        .fs
        .ops()
        .into_iter()
        .filter(|op| op.starts_with("write"))
        .count();

    h.sync.remote_watcher().watch().await.unwrap();
    h.sync_pending().await;

    assert!(h.cloud_ops_since(cloud_start).is_empty());
    let writes_after = h
        .fs
        .ops()
        .into_iter()
        .filter(|op| op.starts_with("write"))
        .count();
    assert_eq!(writes_before, writes_after);
}

#[tokio::test]
async fn test_case_only_clash_renames_the_local_copy() {
    let h = harness(CaseSensitivity::Insensitive).await;
    h.cloud.seed_file("/Foo.txt", b"upper", &checksum_of(b"upper"));
    h.cloud.seed_file("/foo.txt", b"lower", &checksum_of(b"lower"));
    let mut events = h.sync.events().subscribe();

    h.sync.remote_watcher().start().await.unwrap();
    h.sync_pending().await;

    let renamed = "foo-conflict-2018-03-14T15_09_26.000Z.txt";
    assert_eq!(h.fs.read("/sync/Foo.txt").unwrap(), b"upper".to_vec());
    assert_eq!(
        h.fs.read(format!("/sync/{renamed}")).unwrap(),
        b"lower".to_vec()
    );
    assert!(!h.fs.contains("/sync/foo.txt"));
    // The clash only exists locally; the remote keeps both names
    assert_eq!(h.cloud.paths(), vec!["/Foo.txt", "/foo.txt"]);

    let mut resolved = false;
    while let Ok(event) = events.try_recv() {
        if event
            == CoreEvent::Sync(SyncEvent::ConflictResolved {
                original: "foo.txt".to_string(),
                renamed: renamed.to_string(),
            })
        {
            resolved = true;
        }
    }
    assert!(resolved);
}

// ============================================================================
// Failures
// ============================================================================

#[tokio::test]
async fn test_repeated_failures_are_abandoned_without_blocking_the_queue() {
    let h = harness(CaseSensitivity::Sensitive).await;
    let mut events = h.sync.events().subscribe();
    for _ in 0..MAX_SYNC_ERRORS {
        h.cloud
            .fail_next(BridgeError::OperationFailed("server error".to_string()));
    }
    h.local_add("bad.txt", b"bad").await;
    h.sync_pending().await;

    assert!(h.cloud.by_path("/bad.txt").is_none());
    let stuck = h.sync.store().get("bad.txt").await.unwrap().unwrap();
    assert_eq!(stuck.errors, MAX_SYNC_ERRORS - 1);
    let mut abandoned = false;
    while let Ok(event) = events.try_recv() {
        if event
            == CoreEvent::Sync(SyncEvent::Abandoned {
                path: "bad.txt".to_string(),
                errors: MAX_SYNC_ERRORS,
            })
        {
            abandoned = true;
        }
    }
    assert!(abandoned);

    h.local_add("good.txt", b"good").await;
    h.sync_pending().await;

    assert!(h.cloud.by_path("/good.txt").is_some());
    assert!(h.cloud.by_path("/bad.txt").is_none());
}

#[tokio::test]
async fn test_offline_remote_is_retried_once_back() {
    let h = harness(CaseSensitivity::Sensitive).await;
    h.local_add("later.txt", b"later").await;
    h.cloud.set_online(false);

    let cloud = h.cloud.clone();
    let reconnect = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        cloud.set_online(true);
    });
    h.sync_pending().await;
    reconnect.await.unwrap();

    assert!(h.cloud.by_path("/later.txt").is_some());
    let synced = h.sync.store().get("later.txt").await.unwrap().unwrap();
    assert_eq!(synced.errors, 0);
}
