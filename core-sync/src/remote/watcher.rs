//! # Remote Change Detector
//!
//! Pulls the remote change feed and turns each entry into an intent for the
//! [`Prep`]aration layer.
//!
//! ## Overview
//!
//! On first start (no stored cursor) the current remote tree is copied with
//! the bulk listing calls, directories before files, and the feed's
//! high-water mark read beforehand becomes the cursor. Afterwards each page
//! of the feed is resolved against the store by remote id:
//!
//! | Feed entry                                   | Intent                  |
//! |----------------------------------------------|-------------------------|
//! | deleted, unknown locally                     | none                    |
//! | deleted, known                               | delete                  |
//! | unknown                                      | add                     |
//! | same path                                    | update                  |
//! | file with the same checksum                  | move                    |
//! | folder, or revision already recorded         | delete then add         |
//! | anything else                                | detach then add         |
//!
//! Entries are merged one at a time, in feed order, so the cursor only
//! advances and "caught up" is only reported once the whole page merged.

use bridge_traits::{RemoteChange, RemoteCloud, RemoteDoc, RemoteDocType, ROOT_DIR_ID};
use core_metadata::{Metadata, MetadataStore, RemoteInfo, SideName};
use core_runtime::config::SyncTimings;
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::backoff::Backoff;
use crate::error::{Result, SyncError};
use crate::prep::Prep;

pub struct RemoteWatcher {
    remote: Arc<dyn RemoteCloud>,
    prep: Arc<Prep>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    timings: SyncTimings,
    stopping: CancellationToken,
}

impl RemoteWatcher {
    pub fn new(
        remote: Arc<dyn RemoteCloud>,
        prep: Arc<Prep>,
        store: Arc<dyn MetadataStore>,
        events: EventBus,
        timings: SyncTimings,
    ) -> Self {
        Self {
            remote,
            prep,
            store,
            events,
            timings,
            stopping: CancellationToken::new(),
        }
    }

    /// Copy the remote tree when nothing was replicated yet
    pub async fn start(&self) -> Result<()> {
        if self.store.remote_seq().await? != "0" {
            return Ok(());
        }
        info!("Starting initial replication");
        let last_seq = self.remote.last_seq().await?;

        let folders = self.remote.list_by_type(RemoteDocType::Directory).await?;
        let files = self.remote.list_by_type(RemoteDocType::File).await?;
        let total = folders.len() + files.len();
        for doc in folders.iter().chain(files.iter()) {
            if is_root(doc) {
                continue;
            }
            self.keep_going(self.add(doc).await, &doc.path)?;
        }

        self.store.set_remote_seq(&last_seq).await?;
        info!(documents = total, last_seq = %last_seq, "Initial replication done");
        self.caught_up(last_seq);
        Ok(())
    }

    /// Process one page of the change feed
    pub async fn watch(&self) -> Result<()> {
        let since = self.store.remote_seq().await?;
        let page = self.remote.changes(&since).await?;
        if page.changes.is_empty() {
            if page.last_seq != since {
                self.store.set_remote_seq(&page.last_seq).await?;
            }
            return Ok(());
        }

        debug!(since = %since, count = page.changes.len(), "Remote changes");
        for change in &page.changes {
            self.keep_going(self.on_change(change).await, &change.id)?;
        }
        self.store.set_remote_seq(&page.last_seq).await?;
        self.caught_up(page.last_seq);
        Ok(())
    }

    /// Replicate, then poll the feed until stopped, retrying failures with
    /// backoff. Returns the error that ended it.
    pub async fn run(self: Arc<Self>) -> Result<()> {
        let mut backoff = Backoff::new(self.timings.backoff_base, self.timings.backoff_cap);
        loop {
            if self.stopping.is_cancelled() {
                return Ok(());
            }
            let result = match self.start().await {
                Ok(()) => self.watch().await,
                Err(err) => Err(err),
            };

            let wait = match result {
                Ok(()) => {
                    backoff.reset();
                    self.timings.remote_poll_interval
                }
                Err(SyncError::Auth(message)) => {
                    error!(%message, "Device no longer registered");
                    return Err(SyncError::Auth(message));
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, "Remote watcher stopped");
                    return Err(err);
                }
                Err(err) => {
                    if backoff.record_failure() {
                        error!(error = %err, failures = backoff.failures(), "Giving up on the remote feed");
                        return Err(SyncError::FeedFailed(err.to_string()));
                    }
                    warn!(error = %err, failures = backoff.failures(), "Remote feed failed");
                    if err.is_unreachable() {
                        self.wait_for_remote().await;
                    }
                    backoff.delay()
                }
            };

            tokio::select! {
                _ = self.stopping.cancelled() => return Ok(()),
                _ = tokio::time::sleep(wait) => {}
            }
        }
    }

    pub fn stop(&self) {
        self.stopping.cancel();
    }

    fn keep_going(&self, result: Result<()>, what: &str) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(err @ SyncError::Store(_)) => Err(err),
            Err(err) if err.is_fatal() || err.is_unreachable() => Err(err),
            Err(err) => {
                warn!(doc = %what, error = %err, "Skipped remote change");
                Ok(())
            }
        }
    }

    async fn wait_for_remote(&self) {
        while !self.remote.ping().await {
            tokio::select! {
                _ = self.stopping.cancelled() => return,
                _ = tokio::time::sleep(self.timings.availability_poll) => {}
            }
        }
        info!("Remote reachable again");
    }

    fn caught_up(&self, last_seq: String) {
        let _ = self
            .events
            .emit(CoreEvent::Sync(SyncEvent::RemoteCaughtUp { last_seq }));
    }

    #[instrument(skip(self, change), fields(remote_id = %change.id))]
    async fn on_change(&self, change: &RemoteChange) -> Result<()> {
        if change.id == ROOT_DIR_ID {
            return Ok(());
        }
        let was = self.store.by_remote_id(&change.id).await?;

        if change.deleted {
            return match was {
                None => {
                    debug!("Deleted remotely but never synced");
                    Ok(())
                }
                Some(was) => self.delete(was).await,
            };
        }

        let Some(remote) = &change.doc else {
            warn!("Change without a document");
            return Ok(());
        };
        if is_root(remote) {
            return Ok(());
        }
        let doc = from_remote(remote);
        let Some(was) = was else {
            return self.add(remote).await;
        };

        if was.path == doc.path {
            return if doc.is_folder() {
                self.prep.put_folder(SideName::Remote, doc).await
            } else {
                self.prep.update_file(SideName::Remote, doc).await
            };
        }

        if doc.is_file() && doc.checksum.is_some() && doc.checksum == was.checksum {
            info!(path = %doc.path, from = %was.path, "File moved remotely");
            return self.prep.move_file(SideName::Remote, doc, was).await;
        }

        let recorded = was.remote.as_ref().map(|r| r.rev.as_str()) == Some(remote.rev.as_str());
        if doc.is_folder() || recorded {
            debug!(path = %doc.path, from = %was.path, "Replacing document");
            self.delete(was).await?;
            return self.add(remote).await;
        }

        // Changed remotely while possibly edited locally
        warn!(path = %doc.path, from = %was.path, "Ambiguous remote change, detaching");
        self.prep.detach_remote(&was).await?;
        self.add(remote).await
    }

    async fn add(&self, remote: &RemoteDoc) -> Result<()> {
        let doc = from_remote(remote);
        if doc.is_folder() {
            self.prep.put_folder(SideName::Remote, doc).await
        } else {
            self.prep.add_file(SideName::Remote, doc).await
        }
    }

    async fn delete(&self, was: Metadata) -> Result<()> {
        if was.is_folder() {
            self.prep.delete_folder(SideName::Remote, was).await
        } else {
            self.prep.delete_file(SideName::Remote, was).await
        }
    }
}

fn is_root(doc: &RemoteDoc) -> bool {
    doc.id == ROOT_DIR_ID || doc.path == "/"
}

/// Metadata document for a remote document, path made relative
pub fn from_remote(remote: &RemoteDoc) -> Metadata {
    let path = remote.path.trim_start_matches('/');
    let mut doc = if remote.is_directory() {
        Metadata::folder(path)
    } else {
        Metadata::file(path)
    };
    doc.checksum = remote.md5sum.clone();
    doc.size = remote.size;
    doc.executable = remote.executable;
    doc.mime = remote.mime.clone();
    doc.tags = remote.tags.clone();
    doc.remote = Some(RemoteInfo::new(remote.id.clone(), remote.rev.clone()));
    let created = remote.created_at.or(remote.updated_at);
    let modified = remote.updated_at.or(remote.created_at);
    if let (Some(created), Some(modified)) = (created, modified) {
        doc = doc.with_dates(created, modified);
    }
    doc
}
