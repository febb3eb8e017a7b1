//! # Sync Engine
//!
//! Applies recorded changes to the replica that is behind.
//!
//! ## Overview
//!
//! The engine tails the store's change feed from its persisted cursor. For
//! each document it compares the two side markers: the side with the lower
//! marker has not seen the latest revision and becomes the target. The
//! matching [`Side`] operation is dispatched, then both markers converge on
//! the new revision and the cursor advances.
//!
//! ## Moves
//!
//! A move is recorded as a tombstone carrying `move_to`, immediately followed
//! by the destination carrying `move_from`. The engine holds the tombstone
//! until the next change arrives. When it is the announced destination the
//! pair is applied as one move; otherwise the source is deleted, the
//! destination later added, and an invalid move is logged. A pair that fails
//! holds its source again, so the requeued destination pairs with it.
//!
//! ## Failures
//!
//! A failed change has its error counter persisted, which queues it again at
//! the end of the feed. After [`MAX_SYNC_ERRORS`] failures it is abandoned.
//! Fatal errors stop the loop; an unreachable remote pauses it until a ping
//! succeeds; anything else pauses for `retry_delay`.

use bridge_traits::RemoteCloud;
use core_metadata::{
    is_descendant, same_binary, Change, Metadata, MetadataError, MetadataStore, SideName, Sides,
};
use core_runtime::config::SyncTimings;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::ignore::IgnoreRules;
use crate::side::Side;
use crate::state::SyncStateTracker;

/// Failures after which a change is given up on
pub const MAX_SYNC_ERRORS: u32 = 10;

#[derive(Debug, Default)]
enum MoveState {
    #[default]
    Idle,
    /// A move source waiting for its destination
    PendingSource(Change),
}

/// Folder move applied last, as paths
#[derive(Debug, Clone)]
struct FolderMove {
    from: String,
    to: String,
}

#[derive(Debug, Default)]
struct Cursor {
    /// Last sequence read off the feed, loaded on first use
    seq: Option<i64>,
    moving: MoveState,
    folder_move: Option<FolderMove>,
    busy: bool,
}

enum Action {
    Apply(Metadata),
    Move { src: Change, dst: Metadata },
}

impl Action {
    fn doc(&self) -> &Metadata {
        match self {
            Action::Apply(doc) => doc,
            Action::Move { dst, .. } => dst,
        }
    }
}

pub struct SyncEngine {
    store: Arc<dyn MetadataStore>,
    ignore: Arc<IgnoreRules>,
    local: Arc<dyn Side>,
    remote: Arc<dyn Side>,
    cloud: Arc<dyn RemoteCloud>,
    events: EventBus,
    state: SyncStateTracker,
    timings: SyncTimings,
    cursor: Mutex<Cursor>,
    stopping: CancellationToken,
}

impl SyncEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn MetadataStore>,
        ignore: Arc<IgnoreRules>,
        local: Arc<dyn Side>,
        remote: Arc<dyn Side>,
        cloud: Arc<dyn RemoteCloud>,
        events: EventBus,
        state: SyncStateTracker,
        timings: SyncTimings,
    ) -> Self {
        Self {
            store,
            ignore,
            local,
            remote,
            cloud,
            events,
            state,
            timings,
            cursor: Mutex::new(Cursor::default()),
            stopping: CancellationToken::new(),
        }
    }

    pub fn state(&self) -> &SyncStateTracker {
        &self.state
    }

    /// Apply changes until the feed is drained or [`stop`](Self::stop) is
    /// called, then wait for new ones
    pub async fn run(&self) -> Result<()> {
        let mut committed = self.store.subscribe();
        loop {
            let _ = committed.borrow_and_update();
            match self.sync_pending().await {
                Ok(_) => {}
                Err(SyncError::Cancelled) => return Ok(()),
                Err(err) => return Err(err),
            }
            tokio::select! {
                _ = self.stopping.cancelled() => return Ok(()),
                changed = committed.changed() => {
                    if changed.is_err() {
                        return Ok(());
                    }
                    self.state.refresh();
                }
            }
        }
    }

    pub fn stop(&self) {
        self.stopping.cancel();
    }

    /// Apply every change currently in the feed. Returns how many were read.
    pub async fn sync_pending(&self) -> Result<usize> {
        let mut cursor = self.cursor.lock().await;
        let mut seq = match cursor.seq {
            Some(seq) => seq,
            None => {
                let seq = self.store.local_seq().await?;
                self.state.follow_feed(self.store.subscribe(), seq);
                seq
            }
        };
        cursor.seq = Some(seq);

        let mut read = 0;
        while let Some(change) = self.store.next_change(seq).await? {
            if self.stopping.is_cancelled() {
                return Err(SyncError::Cancelled);
            }
            if !cursor.busy {
                cursor.busy = true;
                let latest = *self.store.subscribe().borrow();
                let pending = (latest - seq).max(1) as u64;
                let _ = self
                    .events
                    .emit(CoreEvent::Sync(SyncEvent::Syncing { pending }));
            }
            seq = change.seq;
            cursor.seq = Some(seq);
            self.step(&mut cursor, change).await?;
            self.state.feed_read(seq);
            read += 1;
        }

        // The destination never came
        if let MoveState::PendingSource(src) = std::mem::take(&mut cursor.moving) {
            self.abandon_move(&mut cursor, src).await?;
        }

        if cursor.busy {
            cursor.busy = false;
            info!("Replicas up to date");
            let _ = self.events.emit(CoreEvent::Sync(SyncEvent::UpToDate));
        }
        Ok(read)
    }

    async fn step(&self, cursor: &mut Cursor, change: Change) -> Result<()> {
        let Change { seq, doc } = change;

        if let MoveState::PendingSource(src) = std::mem::take(&mut cursor.moving) {
            let pairs = !doc.deleted
                && doc.move_from.is_some()
                && src.doc.move_to.as_deref() == Some(doc.id.as_str());
            if pairs {
                return self
                    .attempt(cursor, seq, Action::Move { src, dst: doc })
                    .await;
            }
            self.abandon_move(cursor, src).await?;
        }

        if doc.deleted && doc.move_to.is_some() && !doc.child_move {
            debug!(path = %doc.path, "Move source, waiting for its destination");
            cursor.moving = MoveState::PendingSource(Change { seq, doc });
            return Ok(());
        }
        self.attempt(cursor, seq, Action::Apply(doc)).await
    }

    /// Delete a held move source on its own
    async fn abandon_move(&self, cursor: &mut Cursor, src: Change) -> Result<()> {
        let Change { seq, mut doc } = src;
        let err = SyncError::InvalidMove {
            from: doc.path.clone(),
            to: doc.move_to.clone().unwrap_or_default(),
        };
        error!(error = %err, "Move destination did not follow, deleting the source");
        doc.move_to = None;
        self.attempt(cursor, seq, Action::Apply(doc)).await
    }

    /// Apply one change and acknowledge it. Only fatal errors are returned.
    async fn attempt(&self, cursor: &mut Cursor, seq: i64, mut action: Action) -> Result<()> {
        let _op = self.state.begin();
        let path = action.doc().path.clone();

        let result = match &mut action {
            Action::Apply(doc) => self.apply(cursor, doc).await,
            Action::Move { src, dst } => self.apply_move(cursor, &src.doc, dst).await,
        };

        match result {
            Ok(Some(side)) => {
                let _ = self.events.emit(CoreEvent::Sync(SyncEvent::Applied {
                    path,
                    side: side.as_str().to_string(),
                    seq,
                }));
            }
            Ok(None) => {}
            Err(err) => {
                let requeued = self.handle_error(action.doc(), err).await?;
                if let (true, Action::Move { src, .. }) = (requeued, action) {
                    // The destination comes back and pairs with it again
                    cursor.moving = MoveState::PendingSource(src);
                }
            }
        }
        // A held source can be older than what was read since
        let acked = cursor.seq.map_or(seq, |read| read.max(seq));
        self.store.set_local_seq(acked).await?;
        Ok(())
    }

    /// True when the change was queued again for another attempt
    async fn handle_error(&self, doc: &Metadata, err: SyncError) -> Result<bool> {
        if err.is_fatal() {
            error!(path = %doc.path, error = %err, "Sync stopped");
            self.state.set_fatal(err.to_string());
            let _ = self.events.emit(CoreEvent::Sync(SyncEvent::Fatal {
                message: err.to_string(),
            }));
            return Err(err);
        }
        if matches!(err, SyncError::Store(MetadataError::Database(_))) {
            return Err(err);
        }

        warn!(path = %doc.path, error = %err, "Failed to apply change");
        let requeued = self.record_failure(doc).await?;

        if err.is_unreachable() {
            self.wait_for_remote().await;
        } else {
            tokio::select! {
                _ = self.stopping.cancelled() => {}
                _ = tokio::time::sleep(self.timings.retry_delay) => {}
            }
        }
        Ok(requeued)
    }

    /// Count a failure on the stored document, which queues it again unless
    /// it failed too often
    async fn record_failure(&self, doc: &Metadata) -> Result<bool> {
        let Some(mut current) = self.store.get_with_tombstone(&doc.id).await? else {
            return Ok(false);
        };
        current.errors += 1;
        if current.errors >= MAX_SYNC_ERRORS {
            let poison = SyncError::Poison {
                path: current.path.clone(),
                errors: current.errors,
            };
            error!(error = %poison, "Giving up on change");
            let _ = self.events.emit(CoreEvent::Sync(SyncEvent::Abandoned {
                path: current.path,
                errors: current.errors,
            }));
            return Ok(false);
        }
        match self.store.put(&mut current).await {
            Ok(()) => Ok(true),
            Err(err) if err.is_conflict() => {
                debug!(path = %current.path, "Changed meanwhile, it will come back anyway");
                Ok(true)
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn wait_for_remote(&self) {
        while !self.cloud.ping().await {
            tokio::select! {
                _ = self.stopping.cancelled() => return,
                _ = tokio::time::sleep(self.timings.availability_poll) => {}
            }
        }
    }

    fn side(&self, name: SideName) -> &Arc<dyn Side> {
        match name {
            SideName::Local => &self.local,
            SideName::Remote => &self.remote,
        }
    }

    /// Apply a single document. Returns the side written to, if any.
    #[instrument(skip(self, cursor, doc), fields(path = %doc.path))]
    async fn apply(&self, cursor: &mut Cursor, doc: &mut Metadata) -> Result<Option<SideName>> {
        if self.ignore.is_ignored(&doc.path, doc.is_folder()) {
            debug!("Ignored");
            return Ok(None);
        }
        let Some((target, known)) = target(doc) else {
            debug!("Already on both sides");
            return Ok(None);
        };
        let side = self.side(target);

        if doc.deleted {
            if doc.child_move {
                debug!("Moved along with its folder");
            } else if known > 0 {
                if doc.is_folder() {
                    side.delete_folder(doc).await?;
                } else {
                    side.delete_file(doc).await?;
                }
                return Ok(Some(target));
            }
            return Ok(None);
        }

        if let Some(from) = doc.move_from.clone() {
            let carried = from.child_move
                && cursor.folder_move.as_ref().is_some_and(|moved| {
                    is_descendant(&doc.path, &moved.to) && is_descendant(&from.path, &moved.from)
                });
            if !carried {
                let err = SyncError::InvalidMove {
                    from: from.path.clone(),
                    to: doc.path.clone(),
                };
                error!(error = %err, "Move source was not applied, recreating instead");
                if from.sides.get(target).is_some() {
                    if from.is_folder() {
                        side.delete_folder(&from).await?;
                    } else {
                        side.delete_file(&from).await?;
                    }
                }
                self.add(side, doc).await?;
            }
            self.update_revs(doc.clone(), target).await?;
            return Ok(Some(target));
        }

        let old = match known {
            0 => None,
            rev => self.store.get_revision(&doc.id, rev).await?,
        };
        match old {
            None => self.add(side, doc).await?,
            Some(old) if old.deleted => self.add(side, doc).await?,
            Some(old) if old.path != doc.path => {
                // Same identity, new spelling
                info!(from = %old.path, side = %target, "Renaming in place");
                if doc.is_folder() {
                    side.move_folder(doc, old).await?;
                } else {
                    side.move_file(doc, old).await?;
                }
            }
            Some(old) if doc.is_folder() => side.update_folder(doc, old).await?,
            Some(old) if same_binary(&old, doc) => side.update_file_metadata(doc, old).await?,
            Some(old) => side.overwrite_file(doc, Some(old)).await?,
        }

        self.update_revs(doc.clone(), target).await?;
        Ok(Some(target))
    }

    async fn add(&self, side: &Arc<dyn Side>, doc: &mut Metadata) -> Result<()> {
        if doc.is_folder() {
            side.add_folder(doc).await
        } else {
            side.add_file(doc).await
        }
    }

    #[instrument(skip(self, cursor, src, dst), fields(path = %dst.path, from = %src.path))]
    async fn apply_move(
        &self,
        cursor: &mut Cursor,
        src: &Metadata,
        dst: &mut Metadata,
    ) -> Result<Option<SideName>> {
        let Some((target, _)) = target(dst) else {
            return Ok(None);
        };
        let side = self.side(target);
        let from = dst
            .move_from
            .as_deref()
            .cloned()
            .unwrap_or_else(|| src.clone());

        if self.ignore.is_ignored(&dst.path, dst.is_folder()) {
            debug!("Moved into an ignored path");
            return Ok(None);
        }
        if from.sides.get(target).is_none() {
            debug!(side = %target, "Source never reached this side, adding");
            self.add(side, dst).await?;
        } else if dst.is_folder() {
            side.move_folder(dst, from).await?;
            cursor.folder_move = Some(FolderMove {
                from: src.path.clone(),
                to: dst.path.clone(),
            });
        } else {
            side.move_file(dst, from).await?;
        }
        info!(side = %target, "Move applied");

        self.update_revs(dst.clone(), target).await?;
        Ok(Some(target))
    }

    /// Converge both markers on the written revision
    async fn update_revs(&self, mut doc: Metadata, target: SideName) -> Result<()> {
        let applied = doc.rev.unwrap_or(0);
        doc.sides = Sides::converged(applied + 1);
        doc.errors = 0;
        doc.move_from = None;
        match self.store.put(&mut doc).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_conflict() => {
                debug!(path = %doc.path, "Changed while applying, bumping the marker only");
            }
            Err(err) => return Err(err.into()),
        }

        for _ in 0..crate::merge::MAX_ATTEMPTS {
            let Some(mut current) = self.store.get_with_tombstone(&doc.id).await? else {
                return Ok(());
            };
            let seen = current.sides.get(target).unwrap_or(0).max(applied);
            current.sides.set(target, seen);
            if target == SideName::Remote && doc.remote.is_some() {
                current.remote = doc.remote.clone();
            }
            current.errors = 0;
            match self.store.put(&mut current).await {
                Ok(()) => return Ok(()),
                Err(err) if err.is_conflict() => continue,
                Err(err) => return Err(err.into()),
            }
        }
        Err(SyncError::Conflict(format!("revisions of {} keep changing", doc.path)))
    }
}

/// The side behind and the last revision it saw, `None` when converged
fn target(doc: &Metadata) -> Option<(SideName, u64)> {
    let local = doc.sides.get(SideName::Local).unwrap_or(0);
    let remote = doc.sides.get(SideName::Remote).unwrap_or(0);
    match local.cmp(&remote) {
        std::cmp::Ordering::Less => Some((SideName::Local, local)),
        std::cmp::Ordering::Greater => Some((SideName::Remote, remote)),
        std::cmp::Ordering::Equal => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::testing::MemoryCloud;
    use core_metadata::db::create_test_pool;
    use core_metadata::{checksum_of, RemoteInfo, SqliteMetadataStore};
    use std::sync::Mutex as StdMutex;

    /// Records calls instead of writing anywhere
    #[derive(Default)]
    struct RecordingSide {
        calls: StdMutex<Vec<String>>,
        fail_next: StdMutex<Vec<SyncError>>,
    }

    impl RecordingSide {
        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }

        fn record(&self, call: String) -> Result<()> {
            if let Some(err) = self.fail_next.lock().unwrap().pop() {
                return Err(err);
            }
            self.calls.lock().unwrap().push(call);
            Ok(())
        }
    }

    #[async_trait]
    impl Side for RecordingSide {
        fn name(&self) -> &'static str {
            "recording"
        }
        async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
            self.record(format!("add_file {}", doc.path))
        }
        async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
            self.record(format!("add_folder {}", doc.path))
        }
        async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<Metadata>) -> Result<()> {
            self.record(format!("overwrite_file {}", doc.path))
        }
        async fn update_file_metadata(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
            self.record(format!("update_file_metadata {}", doc.path))
        }
        async fn update_folder(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
            self.record(format!("update_folder {}", doc.path))
        }
        async fn move_file(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
            self.record(format!("move_file {} {}", from.path, doc.path))
        }
        async fn move_folder(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
            self.record(format!("move_folder {} {}", from.path, doc.path))
        }
        async fn delete_file(&self, doc: &Metadata) -> Result<()> {
            self.record(format!("delete_file {}", doc.path))
        }
        async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
            self.record(format!("delete_folder {}", doc.path))
        }
    }

    struct Fixture {
        engine: SyncEngine,
        store: Arc<SqliteMetadataStore>,
        local: Arc<RecordingSide>,
        remote: Arc<RecordingSide>,
        events: EventBus,
    }

    async fn fixture() -> Fixture {
        let store = Arc::new(SqliteMetadataStore::new(create_test_pool().await.unwrap()).await.unwrap());
        let local = Arc::new(RecordingSide::default());
        let remote = Arc::new(RecordingSide::default());
        let events = EventBus::new(64);
        let engine = SyncEngine::new(
            store.clone(),
            Arc::new(IgnoreRules::with_defaults(&[], true, false).unwrap()),
            local.clone(),
            remote.clone(),
            Arc::new(MemoryCloud::new()),
            events.clone(),
            SyncStateTracker::new(),
            SyncTimings::fast(),
        );
        Fixture {
            engine,
            store,
            local,
            remote,
            events,
        }
    }

    fn authored(mut doc: Metadata, side: SideName) -> Metadata {
        doc.id = doc.path.clone();
        doc.mark_side(side, None);
        doc
    }

    #[test]
    fn test_target_is_the_side_behind() {
        let mut doc = Metadata::file("a");
        assert_eq!(target(&doc), None);
        doc.sides.set(SideName::Local, 1);
        assert_eq!(target(&doc), Some((SideName::Remote, 0)));
        doc.sides.set(SideName::Remote, 3);
        assert_eq!(target(&doc), Some((SideName::Local, 1)));
    }

    #[tokio::test]
    async fn test_local_add_is_uploaded_and_converges() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt").with_checksum(checksum_of(b"a")), SideName::Local);
        f.store.put(&mut doc).await.unwrap();
        let mut events = f.events.subscribe();

        // The upload, then the convergence write it produced
        assert_eq!(f.engine.sync_pending().await.unwrap(), 2);

        assert_eq!(f.remote.calls(), vec!["add_file a.txt"]);
        assert!(f.local.calls().is_empty());
        let stored = f.store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(stored.sides, Sides::converged(2));
        assert_eq!(stored.rev, Some(2));
        assert!(matches!(events.recv().await.unwrap(), CoreEvent::Sync(SyncEvent::Syncing { .. })));
        assert_eq!(
            events.recv().await.unwrap(),
            CoreEvent::Sync(SyncEvent::Applied {
                path: "a.txt".into(),
                side: "remote".into(),
                seq: 1
            })
        );
        assert_eq!(events.recv().await.unwrap(), CoreEvent::Sync(SyncEvent::UpToDate));

        assert_eq!(f.engine.sync_pending().await.unwrap(), 0);
        assert_eq!(f.remote.calls().len(), 1);
        assert_eq!(f.store.local_seq().await.unwrap(), 2);
    }

    #[tokio::test]
    async fn test_state_counts_changes_not_read_yet() {
        let f = fixture().await;
        f.engine.sync_pending().await.unwrap();
        assert!(f.engine.state().current().is_up_to_date());

        let mut doc = authored(Metadata::folder("photos"), SideName::Remote);
        f.store.put(&mut doc).await.unwrap();
        assert_eq!(
            f.engine.state().current(),
            crate::state::SyncState::Syncing {
                in_flight: 0,
                queued: 1
            }
        );

        f.engine.sync_pending().await.unwrap();
        assert!(f.engine.state().current().is_up_to_date());
    }

    #[tokio::test]
    async fn test_remote_update_overwrites_or_updates_metadata() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt").with_checksum(checksum_of(b"v1")), SideName::Remote);
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let mut doc = f.store.get("a.txt").await.unwrap().unwrap();
        let prev = doc.clone();
        doc.executable = true;
        doc.mark_side(SideName::Remote, Some(&prev));
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let mut doc = f.store.get("a.txt").await.unwrap().unwrap();
        let prev = doc.clone();
        doc.checksum = Some(checksum_of(b"v2"));
        doc.mark_side(SideName::Remote, Some(&prev));
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        assert_eq!(
            f.local.calls(),
            vec![
                "add_file a.txt",
                "update_file_metadata a.txt",
                "overwrite_file a.txt"
            ]
        );
    }

    #[tokio::test]
    async fn test_move_pair_is_applied_once() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt").with_checksum(checksum_of(b"a")), SideName::Local);
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let was = f.store.get("a.txt").await.unwrap().unwrap();
        let mut src = was.clone();
        src.mark_side(SideName::Local, Some(&was));
        src.mark_deleted();
        src.move_to = Some("b.txt".into());
        let mut dst = Metadata::file("b.txt").with_id("b.txt").with_checksum(checksum_of(b"a"));
        dst.mark_side(SideName::Local, None);
        dst.move_from = Some(Box::new(was));
        f.store.bulk_put(&mut [src, dst]).await.unwrap();

        f.engine.sync_pending().await.unwrap();

        assert_eq!(f.remote.calls(), vec!["add_file a.txt", "move_file a.txt b.txt"]);
        let moved = f.store.get("b.txt").await.unwrap().unwrap();
        assert!(moved.move_from.is_none());
        assert_eq!(target(&moved), None);
    }

    #[tokio::test]
    async fn test_failed_move_is_retried_as_a_move() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt").with_checksum(checksum_of(b"a")), SideName::Local);
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let was = f.store.get("a.txt").await.unwrap().unwrap();
        let mut src = was.clone();
        src.mark_side(SideName::Local, Some(&was));
        src.mark_deleted();
        src.move_to = Some("b.txt".into());
        let mut dst = Metadata::file("b.txt").with_id("b.txt").with_checksum(checksum_of(b"a"));
        dst.mark_side(SideName::Local, None);
        dst.move_from = Some(Box::new(was));
        f.store.bulk_put(&mut [src, dst]).await.unwrap();
        f.remote
            .fail_next
            .lock()
            .unwrap()
            .push(SyncError::Conflict("stale".into()));

        f.engine.sync_pending().await.unwrap();

        assert_eq!(f.remote.calls(), vec!["add_file a.txt", "move_file a.txt b.txt"]);
        let moved = f.store.get("b.txt").await.unwrap().unwrap();
        assert_eq!(moved.errors, 0);
        assert!(moved.move_from.is_none());
        assert_eq!(target(&moved), None);
    }

    #[tokio::test]
    async fn test_unpaired_move_source_falls_back_to_delete() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt"), SideName::Local);
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let was = f.store.get("a.txt").await.unwrap().unwrap();
        let mut src = was.clone();
        src.mark_side(SideName::Local, Some(&was));
        src.mark_deleted();
        src.move_to = Some("b.txt".into());
        f.store.put(&mut src).await.unwrap();
        let mut other = authored(Metadata::folder("unrelated"), SideName::Local);
        f.store.put(&mut other).await.unwrap();

        f.engine.sync_pending().await.unwrap();

        assert_eq!(
            f.remote.calls(),
            vec!["add_file a.txt", "delete_file a.txt", "add_folder unrelated"]
        );
    }

    #[tokio::test]
    async fn test_case_only_rename_is_a_move() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("readme.md"), SideName::Remote);
        doc.id = "README.MD".into();
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        let mut doc = f.store.get("README.MD").await.unwrap().unwrap();
        let prev = doc.clone();
        doc.path = "README.md".into();
        doc.mark_side(SideName::Remote, Some(&prev));
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();

        assert_eq!(
            f.local.calls(),
            vec!["add_file readme.md", "move_file readme.md README.md"]
        );
    }

    #[tokio::test]
    async fn test_tombstone_unknown_to_target_is_acknowledged() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt"), SideName::Local);
        f.store.put(&mut doc).await.unwrap();
        let prev = doc.clone();
        doc.mark_side(SideName::Local, Some(&prev));
        doc.mark_deleted();
        f.store.put(&mut doc).await.unwrap();

        f.engine.sync_pending().await.unwrap();
        assert!(f.remote.calls().is_empty());
    }

    #[tokio::test]
    async fn test_ignored_change_is_acknowledged() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("notes.tmp"), SideName::Remote);
        f.store.put(&mut doc).await.unwrap();
        f.engine.sync_pending().await.unwrap();
        assert!(f.local.calls().is_empty());
        assert_eq!(f.store.local_seq().await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_failures_are_counted_then_abandoned() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt"), SideName::Local);
        doc.remote = Some(RemoteInfo::new("remote-1", "1-mem"));
        f.store.put(&mut doc).await.unwrap();
        let mut events = f.events.subscribe();
        for _ in 0..MAX_SYNC_ERRORS {
            f.remote
                .fail_next
                .lock()
                .unwrap()
                .push(SyncError::Conflict("stale".into()));
        }

        f.engine.sync_pending().await.unwrap();

        assert!(f.remote.calls().is_empty());
        let stored = f.store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(stored.errors, MAX_SYNC_ERRORS - 1);
        let mut abandoned = false;
        while let Ok(event) = events.try_recv() {
            if event
                == CoreEvent::Sync(SyncEvent::Abandoned {
                    path: "a.txt".into(),
                    errors: MAX_SYNC_ERRORS,
                })
            {
                abandoned = true;
            }
        }
        assert!(abandoned);
    }

    #[tokio::test]
    async fn test_fatal_error_stops_and_is_reported() {
        let f = fixture().await;
        let mut doc = authored(Metadata::file("a.txt"), SideName::Remote);
        f.store.put(&mut doc).await.unwrap();
        f.local
            .fail_next
            .lock()
            .unwrap()
            .push(SyncError::DiskFull("ENOSPC".into()));

        let err = f.engine.sync_pending().await.unwrap_err();
        assert!(matches!(err, SyncError::DiskFull(_)));
        assert!(matches!(
            f.engine.state().current(),
            crate::state::SyncState::Error { .. }
        ));
    }

    #[tokio::test]
    async fn test_run_applies_new_changes_until_stopped() {
        let f = fixture().await;
        let engine = Arc::new(f.engine);
        let runner = {
            let engine = engine.clone();
            tokio::spawn(async move { engine.run().await })
        };
        let mut events = f.events.subscribe();

        let mut doc = authored(Metadata::folder("photos"), SideName::Remote);
        f.store.put(&mut doc).await.unwrap();
        loop {
            if let CoreEvent::Sync(SyncEvent::Applied { path, .. }) = events.recv().await.unwrap() {
                assert_eq!(path, "photos");
                break;
            }
        }
        assert_eq!(f.local.calls(), vec!["add_folder photos"]);

        engine.stop();
        runner.await.unwrap().unwrap();
    }
}
