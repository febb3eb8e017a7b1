//! # Local Change Detector
//!
//! Converts raw watcher events into intents for the [`Prep`]aration layer.
//!
//! ## Overview
//!
//! | Event       | Intent                                                        |
//! |-------------|---------------------------------------------------------------|
//! | `add`       | move from a pending deletion with the same checksum, else add |
//! | `addDir`    | put folder                                                    |
//! | `change`    | update file                                                   |
//! | `unlink`    | deferred file deletion                                        |
//! | `unlinkDir` | deferred folder deletion, once no child is pending            |
//! | `ready`     | delete what the initial scan did not find                     |
//!
//! ## Deferred deletions
//!
//! Most platforms report a move as an unlink followed by an add. An unlink
//! therefore only registers a pending deletion. If an add with the same
//! content arrives in time the pair becomes a move; otherwise the timer
//! commits the deletion after `unlink_debounce`, waiting longer while files
//! are still being hashed. A folder deletion waits until none of its children
//! is pending, so children are resolved before their parent.

use bridge_traits::{FileStat, WatcherEvent};
use core_metadata::{Identity, Metadata, MetadataStore, SideName};
use core_runtime::config::{SyncTimings, TMP_DIR_NAME};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

use super::pending::{PendingMap, Ticket};
use super::{local_path, Checksumer, LocalRenamer};
use crate::error::Result;
use crate::prep::Prep;

pub struct LocalWatcher {
    sync_path: PathBuf,
    prep: Arc<Prep>,
    store: Arc<dyn MetadataStore>,
    checksumer: Arc<Checksumer>,
    renamer: Arc<LocalRenamer>,
    events: EventBus,
    timings: SyncTimings,
    pending: PendingMap,
    /// Adds and changes between their event and their intent
    hashing: AtomicUsize,
    /// Identities seen before `ready`, `None` afterwards
    scanned: Mutex<Option<HashSet<Identity>>>,
    stopping: CancellationToken,
    timers: TaskTracker,
}

impl LocalWatcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        sync_path: impl Into<PathBuf>,
        prep: Arc<Prep>,
        store: Arc<dyn MetadataStore>,
        checksumer: Arc<Checksumer>,
        renamer: Arc<LocalRenamer>,
        events: EventBus,
        timings: SyncTimings,
    ) -> Self {
        Self {
            sync_path: sync_path.into(),
            prep,
            store,
            checksumer,
            renamer,
            events,
            timings,
            pending: PendingMap::new(),
            hashing: AtomicUsize::new(0),
            scanned: Mutex::new(Some(HashSet::new())),
            stopping: CancellationToken::new(),
            timers: TaskTracker::new(),
        }
    }

    pub fn pending(&self) -> &PendingMap {
        &self.pending
    }

    /// Consume events until the channel closes or [`stop`](Self::stop) is
    /// called. Returns early on a fatal error.
    pub async fn run(self: Arc<Self>, mut events: mpsc::Receiver<WatcherEvent>) -> Result<()> {
        info!(path = %self.sync_path.display(), "Now watching");
        loop {
            let event = tokio::select! {
                _ = self.stopping.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };
            if let Err(err) = self.handle(event).await {
                if err.is_fatal() {
                    error!(error = %err, "Local watcher stopped");
                    return Err(err);
                }
                warn!(error = %err, "Dropped local change");
            }
        }
        debug!("Local watcher loop ended");
        Ok(())
    }

    /// Stop accepting events, commit every pending deletion and wait a
    /// bounded time for timers already committing
    pub async fn stop(&self) {
        self.stopping.cancel();
        for doc in self.pending.drain() {
            self.commit_deletion(doc).await;
        }
        self.timers.close();
        if tokio::time::timeout(self.timings.shutdown_grace, self.timers.wait())
            .await
            .is_err()
        {
            warn!("Pending local operations did not finish in time");
        }
    }

    pub async fn handle(self: &Arc<Self>, event: WatcherEvent) -> Result<()> {
        if let Some(path) = event.path() {
            if is_temporary(path) {
                return Ok(());
            }
            debug!(path, event = event.kind(), "Watcher event");
        }
        match event {
            WatcherEvent::Add { path, stat } => self.on_add(path, stat).await,
            WatcherEvent::AddDir { path, stat } => self.on_add_dir(path, stat).await,
            WatcherEvent::Change { path, stat } => self.on_change(path, stat).await,
            WatcherEvent::Unlink { path } => self.on_unlink(path, false).await,
            WatcherEvent::UnlinkDir { path } => self.on_unlink(path, true).await,
            WatcherEvent::Ready => self.on_ready().await,
            WatcherEvent::Error { message } => {
                error!(message = %message, "Filesystem watcher error");
                Ok(())
            }
        }
    }

    // ========================================================================
    // Handlers
    // ========================================================================

    async fn on_add(&self, path: String, stat: FileStat) -> Result<()> {
        self.note_scanned(&path);
        let _hashing = Hashing::start(&self.hashing);

        // Replaced in place, e.g. by an editor saving atomically
        let replaced = self.pending.take(&path).is_some();

        let Some(doc) = self.build_file(&path, &stat).await else {
            return Ok(());
        };

        if !replaced && !self.pending.is_empty() {
            if let Some(was) = self.pending_source(&doc).await? {
                info!(path = %doc.path, from = %was.path, "File moved");
                return self.prep.move_file(SideName::Local, doc, was).await;
            }
        }
        info!(path = %doc.path, "File added");
        self.prep.add_file(SideName::Local, doc).await
    }

    async fn on_add_dir(&self, path: String, stat: FileStat) -> Result<()> {
        self.note_scanned(&path);
        self.pending.take(&path);

        let mut doc = Metadata::folder(path);
        if let Some(modified) = stat.modified {
            doc = doc.with_dates(stat.created.unwrap_or(modified), modified);
        }
        info!(path = %doc.path, "Folder added");
        self.prep.put_folder(SideName::Local, doc).await
    }

    async fn on_change(&self, path: String, stat: FileStat) -> Result<()> {
        let _hashing = Hashing::start(&self.hashing);
        let Some(doc) = self.build_file(&path, &stat).await else {
            return Ok(());
        };
        info!(path = %doc.path, "File changed");
        self.prep.update_file(SideName::Local, doc).await
    }

    async fn on_unlink(self: &Arc<Self>, path: String, folder: bool) -> Result<()> {
        if self.renamer.take_suppressed(&path) {
            debug!(path = %path, "Unlink caused by a conflict rename");
            return Ok(());
        }
        let id = self.prep.normalizer().identity(&path);
        let Some(mut doc) = self.store.get(&id).await? else {
            debug!(path = %path, "Unlinked an unknown document");
            return Ok(());
        };
        // The watcher's spelling wins over the stored one for pending lookups
        doc.path = path;

        let ticket = self.pending.add(doc);
        let this = Arc::clone(self);
        if folder {
            self.timers.spawn(async move { this.folder_timer(ticket).await });
        } else {
            self.timers.spawn(async move { this.file_timer(ticket).await });
        }
        Ok(())
    }

    async fn on_ready(&self) -> Result<()> {
        let scanned = match self.scanned.lock() {
            Ok(mut scanned) => scanned.take(),
            Err(_) => None,
        };
        let Some(scanned) = scanned else {
            return Ok(());
        };

        let docs = self.store.by_recursive_path("").await?;
        // Children before their parents
        for doc in docs.into_iter().rev() {
            if scanned.contains(&doc.id) || doc.sides.local.is_none() {
                continue;
            }
            if self.pending.contains(&doc.path) {
                continue;
            }
            info!(path = %doc.path, "Deleted while the client was stopped");
            let result = if doc.is_folder() {
                self.prep.delete_folder(SideName::Local, doc).await
            } else {
                self.prep.delete_file(SideName::Local, doc).await
            };
            if let Err(err) = result {
                warn!(error = %err, "Could not record offline deletion");
            }
        }

        info!(entries = scanned.len(), "Initial local scan done");
        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::LocalScanComplete {
            entries: scanned.len() as u64,
        }));
        Ok(())
    }

    // ========================================================================
    // Deferred deletions
    // ========================================================================

    async fn file_timer(&self, ticket: Ticket) {
        if !self.sleep_unless_cancelled(&ticket, self.timings.unlink_debounce).await {
            return;
        }
        // A pairing add may still be hashing
        while self.hashing.load(Ordering::SeqCst) > 0 {
            if !self.sleep_unless_cancelled(&ticket, self.timings.checksum_poll).await {
                return;
            }
        }
        if let Some(doc) = self.pending.take_ticket(&ticket) {
            self.commit_deletion(doc).await;
        }
    }

    async fn folder_timer(&self, ticket: Ticket) {
        loop {
            if !self.sleep_unless_cancelled(&ticket, self.timings.unlink_dir_poll).await {
                return;
            }
            if !self.pending.has_pending_child(&ticket.path) {
                break;
            }
        }
        if let Some(doc) = self.pending.take_ticket(&ticket) {
            self.commit_deletion(doc).await;
        }
    }

    /// Sleep for `duration`; false when the deletion was cancelled meanwhile
    async fn sleep_unless_cancelled(&self, ticket: &Ticket, duration: std::time::Duration) -> bool {
        tokio::select! {
            _ = ticket.cancelled.cancelled() => false,
            _ = tokio::time::sleep(duration) => true,
        }
    }

    async fn commit_deletion(&self, doc: Metadata) {
        let path = doc.path.clone();
        let result = if doc.is_folder() {
            info!(path = %path, "Folder deleted");
            self.prep.delete_folder(SideName::Local, doc).await
        } else {
            info!(path = %path, "File deleted");
            self.prep.delete_file(SideName::Local, doc).await
        };
        if let Err(err) = result {
            warn!(path = %path, error = %err, "Could not record deletion");
        }
    }

    /// The pending deletion an added file was moved from
    async fn pending_source(&self, doc: &Metadata) -> Result<Option<Metadata>> {
        let Some(checksum) = &doc.checksum else {
            return Ok(None);
        };
        for candidate in self.store.by_checksum(checksum).await? {
            if candidate.is_folder() {
                continue;
            }
            if let Some(mut was) = self.pending.take(&candidate.path) {
                was.path = candidate.path;
                return Ok(Some(was));
            }
        }
        Ok(None)
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    /// File document for a watcher event, `None` when it cannot be hashed
    async fn build_file(&self, path: &str, stat: &FileStat) -> Option<Metadata> {
        let abs = local_path(&self.sync_path, path);
        let checksum = match self.checksumer.checksum(&abs).await {
            Ok(checksum) => checksum,
            Err(err) => {
                // The next event on this path will correct it
                warn!(path, error = %err, "Could not compute checksum, dropping change");
                return None;
            }
        };
        let mut doc = Metadata::file(path)
            .with_checksum(checksum)
            .with_size(stat.size)
            .with_executable(stat.executable);
        if let Some(modified) = stat.modified {
            doc = doc.with_dates(stat.created.unwrap_or(modified), modified);
        }
        Some(doc)
    }

    fn note_scanned(&self, path: &str) {
        if let Ok(mut scanned) = self.scanned.lock() {
            if let Some(scanned) = scanned.as_mut() {
                scanned.insert(self.prep.normalizer().identity(path));
            }
        }
    }
}

/// Our own temporary downloads
fn is_temporary(path: &str) -> bool {
    path == TMP_DIR_NAME || path.starts_with(&format!("{TMP_DIR_NAME}/"))
}

struct Hashing<'a>(&'a AtomicUsize);

impl<'a> Hashing<'a> {
    fn start(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for Hashing<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}
