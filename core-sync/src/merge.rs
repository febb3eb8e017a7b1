//! # Merge
//!
//! The single writer of the metadata store.
//!
//! ## Overview
//!
//! Both change detectors hand their prepared intents to [`Merge`], which reads
//! the document currently stored at the same identity, decides how the intent
//! combines with it, and writes the result. Every write marks the authoring
//! side so the engine can later tell which replica is behind.
//!
//! Collisions are never resolved by overwriting. The incoming document is
//! renamed with a conflict suffix on the side it came from (through a
//! [`ConflictRenamer`]) and stored under its new identity; the original keeps
//! its path.
//!
//! ## Concurrency
//!
//! There is no lock. Writes rely on the store's optimistic revisions: an
//! operation that loses a race re-reads the store and runs again, up to
//! [`MAX_ATTEMPTS`] times.

use async_trait::async_trait;
use bridge_traits::Clock;
use core_metadata::{
    parent_path, same_binary, same_file, same_folder, Metadata, MetadataStore, Normalizer,
    SideName, Sides,
};
use core_runtime::events::{CoreEvent, EventBus, SyncEvent};
use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::conflict::conflict_path;
use crate::error::{Result, SyncError};

/// Attempts per operation when the store reports a revision conflict
pub const MAX_ATTEMPTS: u32 = 3;

/// Renames a replica's copy of a document that lost a collision
#[async_trait]
pub trait ConflictRenamer: Send + Sync {
    /// Rename `doc` to `new_path` on the replica, updating `doc.remote` when
    /// the rename changes it. `doc.path` still holds the old path.
    async fn rename_conflicting(&self, doc: &mut Metadata, new_path: &str) -> Result<()>;
}

pub struct Merge {
    store: Arc<dyn MetadataStore>,
    normalizer: Arc<dyn Normalizer>,
    clock: Arc<dyn Clock>,
    events: EventBus,
    local_renamer: Arc<dyn ConflictRenamer>,
    remote_renamer: Arc<dyn ConflictRenamer>,
}

impl Merge {
    pub fn new(
        store: Arc<dyn MetadataStore>,
        normalizer: Arc<dyn Normalizer>,
        clock: Arc<dyn Clock>,
        events: EventBus,
        local_renamer: Arc<dyn ConflictRenamer>,
        remote_renamer: Arc<dyn ConflictRenamer>,
    ) -> Self {
        Self {
            store,
            normalizer,
            clock,
            events,
            local_renamer,
            remote_renamer,
        }
    }

    pub fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    // ========================================================================
    // Operations
    // ========================================================================

    /// Add a file, unless an identical one is already known
    #[instrument(skip(self, doc), fields(path = %doc.path, side = %side))]
    pub async fn add_file(&self, side: SideName, doc: Metadata) -> Result<()> {
        self.with_retry("add_file", &doc.path, || self.add_file_once(side, doc.clone()))
            .await
    }

    /// Update a file whose content or attributes changed
    #[instrument(skip(self, doc), fields(path = %doc.path, side = %side))]
    pub async fn update_file(&self, side: SideName, doc: Metadata) -> Result<()> {
        self.with_retry("update_file", &doc.path, || {
            self.update_file_once(side, doc.clone())
        })
        .await
    }

    /// Create or update a folder
    #[instrument(skip(self, doc), fields(path = %doc.path, side = %side))]
    pub async fn put_folder(&self, side: SideName, doc: Metadata) -> Result<()> {
        self.with_retry("put_folder", &doc.path, || {
            self.put_folder_once(side, doc.clone())
        })
        .await
    }

    /// Rename or move a file from `was` to `doc`
    #[instrument(skip(self, doc, was), fields(path = %doc.path, from = %was.path, side = %side))]
    pub async fn move_file(&self, side: SideName, doc: Metadata, was: Metadata) -> Result<()> {
        self.with_retry("move_file", &doc.path, || {
            self.move_file_once(side, doc.clone(), was.clone())
        })
        .await
    }

    /// Rename or move a folder along with everything below it
    #[instrument(skip(self, doc, was), fields(path = %doc.path, from = %was.path, side = %side))]
    pub async fn move_folder(&self, side: SideName, doc: Metadata, was: Metadata) -> Result<()> {
        self.with_retry("move_folder", &doc.path, || {
            self.move_folder_once(side, doc.clone(), was.clone())
        })
        .await
    }

    /// Delete a file. Deleting an unknown or already deleted file succeeds.
    #[instrument(skip(self, doc), fields(path = %doc.path, side = %side))]
    pub async fn delete_file(&self, side: SideName, doc: Metadata) -> Result<()> {
        self.with_retry("delete_file", &doc.path, || {
            self.delete_file_once(side, doc.id.clone())
        })
        .await
    }

    /// Delete a folder and its descendants, deepest first
    #[instrument(skip(self, doc), fields(path = %doc.path, side = %side))]
    pub async fn delete_folder(&self, side: SideName, doc: Metadata) -> Result<()> {
        self.with_retry("delete_folder", &doc.path, || {
            self.delete_folder_once(side, doc.id.clone())
        })
        .await
    }

    /// Drop the remote linkage of a document whose remote counterpart became
    /// something else
    #[instrument(skip(self, was), fields(path = %was.path))]
    pub async fn detach_remote(&self, was: &Metadata) -> Result<()> {
        self.with_retry("detach_remote", &was.path, || {
            self.detach_remote_once(was.id.clone())
        })
        .await
    }

    async fn with_retry<F, Fut>(&self, op: &'static str, path: &str, mut run: F) -> Result<()>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<()>>,
    {
        let mut attempt = 1;
        loop {
            match run().await {
                Err(SyncError::Store(err)) if err.is_conflict() && attempt < MAX_ATTEMPTS => {
                    debug!(op, path, attempt, error = %err, "Lost a write race, retrying");
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    // ========================================================================
    // Files and folders
    // ========================================================================

    async fn add_file_once(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        let prev = self.store.get_with_tombstone(&doc.id).await?;
        doc.mark_side(side, prev.as_ref());

        let file = match prev {
            Some(file) if !file.deleted => file,
            _ => {
                doc.rev = None;
                self.ensure_parent_exist(side, &doc).await?;
                self.store.put(&mut doc).await?;
                info!(path = %doc.path, side = %side, "File added");
                return Ok(());
            }
        };

        if file.is_folder() || identity_clash(side, &file, &doc) {
            return self.resolve_conflict(side, &doc, &file).await;
        }

        if same_binary(&file, &doc) {
            inherit_file_attributes(&mut doc, &file);
            doc.rev = file.rev;
            if same_file(&file, &doc) {
                debug!(path = %doc.path, "Already up to date");
                return Ok(());
            }
            self.store.put(&mut doc).await?;
            return Ok(());
        }

        if side == SideName::Local && file.sides.local.is_some() {
            return self.resolve_initial_add(side, doc, file).await;
        }
        self.resolve_conflict(side, &doc, &file).await
    }

    /// A local add for a file the local side already knew: it changed while
    /// nothing was watching, and the remote may have changed it too
    async fn resolve_initial_add(
        &self,
        side: SideName,
        mut doc: Metadata,
        file: Metadata,
    ) -> Result<()> {
        let local = file.sides.local.unwrap_or(0);
        match file.sides.remote {
            None => self.update_file_once(side, doc).await,
            Some(remote) if local >= remote => self.update_file_once(side, doc).await,
            Some(_) => {
                let seen = self.store.get_revision(&file.id, local).await?;
                if seen.is_some_and(|seen| seen.checksum == doc.checksum) {
                    debug!(path = %doc.path, "Only changed on the remote side");
                    return Ok(());
                }
                doc.remote = None;
                self.resolve_conflict(SideName::Local, &doc, &file).await
            }
        }
    }

    async fn update_file_once(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        let prev = self.store.get_with_tombstone(&doc.id).await?;
        doc.mark_side(side, prev.as_ref());

        let file = match prev {
            Some(file) if !file.deleted => file,
            _ => {
                doc.rev = None;
                if doc.creation_date.is_none() {
                    doc.creation_date = Some(self.clock.now_seconds());
                }
                self.ensure_parent_exist(side, &doc).await?;
                self.store.put(&mut doc).await?;
                return Ok(());
            }
        };

        if file.is_folder() {
            return Err(SyncError::Conflict(format!(
                "{} is a folder, cannot update it as a file",
                doc.path
            )));
        }
        if identity_clash(side, &file, &doc) {
            return self.resolve_conflict(side, &doc, &file).await;
        }

        doc.rev = file.rev;
        if doc.tags.is_empty() {
            doc.tags = file.tags.clone();
        }
        if doc.remote.is_none() {
            doc.remote = file.remote.clone();
        }
        if doc.move_from.is_none() {
            doc.move_from = file.move_from.clone();
        }
        // The filesystem may have lost it
        doc.creation_date = file.creation_date.or(doc.creation_date);

        if same_binary(&file, &doc) {
            if doc.size.is_none() {
                doc.size = file.size;
            }
            if doc.mime.is_none() {
                doc.mime = file.mime.clone();
            }
        } else if !file.is_at_least_up_to_date(side) {
            warn!(path = %doc.path, side = %side, "Content changed on both sides");
            self.resolve_conflict(side, &doc, &file).await?;
            if side == SideName::Remote {
                // The remote copy was renamed away: upload the local one anew
                let mut file = file;
                file.remote = None;
                file.sides.clear(SideName::Remote);
                self.store.put(&mut file).await?;
            }
            return Ok(());
        }

        if same_file(&file, &doc) {
            debug!(path = %doc.path, "Already up to date");
            return Ok(());
        }
        self.store.put(&mut doc).await?;
        info!(path = %doc.path, side = %side, "File updated");
        Ok(())
    }

    async fn put_folder_once(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        let prev = self.store.get_with_tombstone(&doc.id).await?;
        doc.mark_side(side, prev.as_ref());

        let folder = match prev {
            Some(folder) if !folder.deleted => folder,
            _ => {
                doc.rev = None;
                if doc.creation_date.is_none() {
                    doc.creation_date = Some(self.clock.now_seconds());
                }
                self.ensure_parent_exist(side, &doc).await?;
                self.store.put(&mut doc).await?;
                info!(path = %doc.path, side = %side, "Folder added");
                return Ok(());
            }
        };

        if folder.is_file() || identity_clash(side, &folder, &doc) {
            return self.resolve_conflict(side, &doc, &folder).await;
        }

        doc.rev = folder.rev;
        if doc.tags.is_empty() {
            doc.tags = folder.tags.clone();
        }
        if doc.creation_date.is_none() {
            doc.creation_date = folder.creation_date;
        }
        if doc.remote.is_none() {
            doc.remote = folder.remote.clone();
        }
        if same_folder(&folder, &doc) {
            debug!(path = %doc.path, "Already up to date");
            return Ok(());
        }
        self.store.put(&mut doc).await?;
        Ok(())
    }

    // ========================================================================
    // Moves
    // ========================================================================

    async fn move_file_once(&self, side: SideName, mut doc: Metadata, was: Metadata) -> Result<()> {
        let Some(was) = self.store.get(&was.id).await? else {
            warn!(path = %doc.path, from = %was.path, "Move source is unknown, adding instead");
            return self.add_file_once(side, doc).await;
        };
        // Typically the leftover of a conflict
        if was.sides.get(side).is_none() {
            debug!(path = %doc.path, from = %was.path, side = %side, "Move source unknown on this side");
            return self.add_file_once(side, doc).await;
        }

        if doc.creation_date.is_none() {
            doc.creation_date = was.creation_date;
        }
        if doc.size.is_none() {
            doc.size = was.size;
        }
        if doc.mime.is_none() {
            doc.mime = was.mime.clone();
        }
        if doc.tags.is_empty() {
            doc.tags = was.tags.clone();
        }

        if doc.id == was.id {
            // Only the spelling changed; the engine sees the path change
            doc.sides = Sides::default();
            doc.mark_side(side, Some(&was));
            doc.rev = was.rev;
            if doc.remote.is_none() {
                doc.remote = was.remote.clone();
            }
            doc.move_from = None;
            self.store.put(&mut doc).await?;
            info!(path = %doc.path, from = %was.path, "File renamed in place");
            return Ok(());
        }

        if let Some(dest) = self.store.get(&doc.id).await? {
            if same_file(&dest, &doc) {
                debug!(path = %doc.path, "Move already recorded");
                return Ok(());
            }
            doc = self.rename_move_destination(side, doc, &dest).await?;
        }

        if let Some(src) = self.chained_source(&was).await? {
            return self.collapse_move_chain(side, doc, was, src).await;
        }

        if was.sides.get(side.other()).is_none() {
            // Never propagated: the other side only needs the new document
            let mut gone = was.clone();
            gone.mark_side(side, Some(&was));
            gone.mark_deleted();
            gone.move_from = None;
            self.store.put(&mut gone).await?;
            return self.add_file_once(side, doc).await;
        }

        let (mut src, mut dst) = self.prepare_move(side, doc, was).await?;
        src.move_to = Some(dst.id.clone());
        dst.move_from = Some(Box::new(src.clone()));
        self.ensure_parent_exist(side, &dst).await?;
        info!(path = %dst.path, from = %src.path, side = %side, "File move recorded");
        self.store.bulk_put(&mut [src, dst]).await?;
        Ok(())
    }

    /// Tombstone for `was` and a fresh document at the destination identity
    async fn prepare_move(
        &self,
        side: SideName,
        mut doc: Metadata,
        was: Metadata,
    ) -> Result<(Metadata, Metadata)> {
        let base = self.store.get_with_tombstone(&doc.id).await?;
        doc.sides = Sides::default();
        doc.mark_side(side, base.as_ref());
        doc.rev = base.filter(|b| !b.deleted).and_then(|b| b.rev);
        doc.errors = 0;
        if doc.remote.is_none() {
            doc.remote = was.remote.clone();
        }

        let mut src = was.clone();
        src.mark_side(side, Some(&was));
        src.mark_deleted();
        src.move_from = None;
        src.child_move = false;
        Ok((src, doc))
    }

    /// The live source of an unpropagated move that ended at `was`
    async fn chained_source(&self, was: &Metadata) -> Result<Option<Metadata>> {
        let Some(from) = &was.move_from else {
            return Ok(None);
        };
        match self.store.get_with_tombstone(&from.id).await? {
            Some(src) if src.deleted && src.move_to.as_deref() == Some(was.id.as_str()) => {
                Ok(Some(src))
            }
            _ => Ok(None),
        }
    }

    /// `src` moved to `was`, which now moves to `doc` before the first move
    /// reached the other side: record a single move from `src` to `doc`
    async fn collapse_move_chain(
        &self,
        side: SideName,
        mut doc: Metadata,
        was: Metadata,
        mut src: Metadata,
    ) -> Result<()> {
        let mut middle = was.clone();
        middle.mark_side(side, Some(&was));
        middle.mark_deleted();
        middle.move_to = None;
        middle.move_from = None;

        if doc.id == src.id {
            let next = src.rev.unwrap_or(0) + 1;
            doc.rev = None;
            doc.remote = src.remote.clone();
            doc.move_from = None;
            doc.errors = 0;
            if doc.checksum == src.checksum {
                doc.sides = Sides::converged(next);
            } else {
                doc.sides = src.sides;
                doc.sides.set(side, next);
            }
            info!(path = %doc.path, via = %was.path, "Move reverted before reaching the other side");
            self.store.bulk_put(&mut [middle, doc]).await?;
            return Ok(());
        }

        let base = self.store.get_with_tombstone(&doc.id).await?;
        doc.sides = Sides::default();
        doc.mark_side(side, base.as_ref());
        doc.rev = base.filter(|b| !b.deleted).and_then(|b| b.rev);
        doc.errors = 0;
        if doc.remote.is_none() {
            doc.remote = src.remote.clone();
        }

        let tombstone = src.clone();
        src.mark_side(side, Some(&tombstone));
        src.move_to = Some(doc.id.clone());
        doc.move_from = Some(Box::new(src.clone()));

        self.ensure_parent_exist(side, &doc).await?;
        info!(path = %doc.path, from = %src.path, via = %was.path, "Move chain collapsed");
        self.store.bulk_put(&mut [middle, src, doc]).await?;
        Ok(())
    }

    async fn move_folder_once(
        &self,
        side: SideName,
        mut doc: Metadata,
        was: Metadata,
    ) -> Result<()> {
        let Some(was) = self.store.get(&was.id).await? else {
            warn!(path = %doc.path, from = %was.path, "Move source is unknown, adding instead");
            return self.put_folder_once(side, doc).await;
        };
        if was.sides.get(side).is_none() {
            return self.put_folder_once(side, doc).await;
        }

        if doc.creation_date.is_none() {
            doc.creation_date = was.creation_date;
        }
        if doc.tags.is_empty() {
            doc.tags = was.tags.clone();
        }

        if doc.id == was.id {
            return self.rename_folder_in_place(side, doc, was).await;
        }

        if let Some(dest) = self.store.get(&doc.id).await? {
            let reported_early =
                side == SideName::Local && dest.is_folder() && dest.sides.remote.is_none();
            if !reported_early {
                doc = self.rename_move_destination(side, doc, &dest).await?;
            }
        }

        self.ensure_parent_exist(side, &doc).await?;
        self.move_folder_recursively(side, doc, was).await
    }

    async fn move_folder_recursively(
        &self,
        side: SideName,
        doc: Metadata,
        was: Metadata,
    ) -> Result<()> {
        let descendants = self.store.by_recursive_path(&was.id).await?;
        let propagated = was.sides.get(side.other()).is_some();
        let (from_id, from_path) = (was.id.clone(), was.path.clone());
        let (to_id, to_path) = (doc.id.clone(), doc.path.clone());

        let (mut src, mut dst) = self.prepare_move(side, doc, was).await?;
        if propagated {
            src.move_to = Some(dst.id.clone());
            dst.move_from = Some(Box::new(src.clone()));
        }

        let mut bulk = Vec::with_capacity(2 + 2 * descendants.len());
        bulk.push(src);
        bulk.push(dst);

        for child in descendants {
            let id = rebase(&child.id, &from_id, &to_id);
            let base = self.store.get_with_tombstone(&id).await?;

            let mut child_src = child.clone();
            child_src.mark_side(side, Some(&child));
            child_src.mark_deleted();
            child_src.move_from = None;

            let mut child_dst = child;
            child_dst.path = rebase(&child_dst.path, &from_path, &to_path);
            child_dst.id = id;
            child_dst.sides = Sides::default();
            child_dst.mark_side(side, base.as_ref());
            child_dst.rev = base.filter(|b| !b.deleted).and_then(|b| b.rev);
            child_dst.move_from = None;
            child_dst.errors = 0;
            // The remote bumps every descendant's revision on a folder move
            if let Some(remote) = child_dst.remote.as_mut() {
                remote.rev.clear();
            }

            if child_src.sides.get(side.other()).is_some() {
                child_src.move_to = Some(child_dst.id.clone());
                child_src.child_move = true;
                child_dst.move_from = Some(Box::new(child_src.clone()));
            }
            bulk.push(child_src);
            bulk.push(child_dst);
        }

        info!(
            path = %to_path,
            from = %from_path,
            count = bulk.len() / 2,
            "Folder move recorded"
        );
        self.store.bulk_put(&mut bulk).await?;
        Ok(())
    }

    /// Case-only rename of a folder: identities stay, paths change
    async fn rename_folder_in_place(
        &self,
        side: SideName,
        mut doc: Metadata,
        was: Metadata,
    ) -> Result<()> {
        let descendants = self.store.by_recursive_path(&was.id).await?;

        doc.sides = Sides::default();
        doc.mark_side(side, Some(&was));
        doc.rev = was.rev;
        if doc.remote.is_none() {
            doc.remote = was.remote.clone();
        }
        doc.move_from = None;

        let mut bulk = Vec::with_capacity(1 + descendants.len());
        for mut child in descendants {
            child.path = rebase(&child.path, &was.path, &doc.path);
            let synced = child.is_up_to_date(SideName::Local) && child.is_up_to_date(SideName::Remote);
            if synced {
                // Carried along by the folder rename
                child.sides = Sides::converged(child.rev.unwrap_or(0) + 1);
            } else {
                let prev = child.clone();
                child.mark_side(side, Some(&prev));
            }
            bulk.push(child);
        }
        bulk.insert(0, doc);

        info!(path = %bulk[0].path, from = %was.path, "Folder renamed in place");
        self.store.bulk_put(&mut bulk).await?;
        Ok(())
    }

    /// The destination of a move is taken: move to a conflict name instead
    async fn rename_move_destination(
        &self,
        side: SideName,
        mut doc: Metadata,
        dest: &Metadata,
    ) -> Result<Metadata> {
        let new_path = conflict_path(&doc.path, self.clock.now());
        if side == SideName::Local || dest.path == doc.path {
            self.renamer(side).rename_conflicting(&mut doc, &new_path).await?;
        }
        warn!(path = %doc.path, renamed = %new_path, side = %side, "Move destination taken");
        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::ConflictResolved {
            original: doc.path.clone(),
            renamed: new_path.clone(),
        }));
        doc.id = self.normalizer.identity(&new_path);
        doc.path = new_path;
        Ok(doc)
    }

    // ========================================================================
    // Deletions
    // ========================================================================

    async fn delete_file_once(&self, side: SideName, id: String) -> Result<()> {
        let Some(mut file) = self.store.get(&id).await? else {
            debug!(id = %id, "Already deleted");
            return Ok(());
        };
        // Typically the leftover of a conflict
        if file.sides.get(side).is_none() {
            debug!(path = %file.path, side = %side, "Unknown on this side, nothing to delete");
            return Ok(());
        }

        if side == SideName::Remote && !file.is_at_least_up_to_date(SideName::Remote) {
            // Changed locally since the remote last saw it: keep the local copy
            info!(path = %file.path, "Deleted remotely but changed locally, keeping it");
            dissociate(&mut file, side);
            self.store.put(&mut file).await?;
            return Ok(());
        }

        let prev = file.clone();
        file.mark_side(side, Some(&prev));
        file.mark_deleted();
        file.move_to = None;
        self.store.put(&mut file).await?;
        info!(path = %file.path, side = %side, "File deleted");
        Ok(())
    }

    async fn delete_folder_once(&self, side: SideName, id: String) -> Result<()> {
        let Some(folder) = self.store.get(&id).await? else {
            debug!(id = %id, "Already deleted");
            return Ok(());
        };
        if folder.sides.get(side).is_none() {
            debug!(path = %folder.path, side = %side, "Unknown on this side, nothing to delete");
            return Ok(());
        }

        let mut docs = self.store.by_recursive_path(&folder.id).await?;
        // Children must leave the feed before their parents
        docs.reverse();
        docs.push(folder);

        let mut preserved: HashSet<String> = HashSet::new();
        let mut kept = 0usize;
        for doc in docs.iter_mut() {
            if !doc.is_at_least_up_to_date(side) || preserved.contains(&doc.id) {
                dissociate(doc, side);
                if let Some(parent) = parent_path(&doc.id) {
                    preserved.insert(parent.to_string());
                }
                kept += 1;
                continue;
            }
            let prev = doc.clone();
            doc.mark_side(side, Some(&prev));
            doc.mark_deleted();
            doc.move_to = None;
        }

        info!(
            path = %docs[docs.len() - 1].path,
            side = %side,
            count = docs.len(),
            kept,
            "Folder deleted"
        );
        self.store.bulk_put(&mut docs).await?;
        Ok(())
    }

    async fn detach_remote_once(&self, id: String) -> Result<()> {
        let Some(mut doc) = self.store.get(&id).await? else {
            return Ok(());
        };
        dissociate(&mut doc, SideName::Remote);
        self.store.put(&mut doc).await?;
        Ok(())
    }

    // ========================================================================
    // Helpers
    // ========================================================================

    fn renamer(&self, side: SideName) -> &Arc<dyn ConflictRenamer> {
        match side {
            SideName::Local => &self.local_renamer,
            SideName::Remote => &self.remote_renamer,
        }
    }

    /// Store the incoming `doc` under a conflict name, renaming it on `side`
    /// when it exists there under its original name
    async fn resolve_conflict(
        &self,
        side: SideName,
        doc: &Metadata,
        existing: &Metadata,
    ) -> Result<()> {
        let new_path = conflict_path(&doc.path, self.clock.now());
        let mut renamed = doc.clone();
        // An identity-only clash on the remote is not visible there
        if side == SideName::Local || existing.path == doc.path {
            self.renamer(side)
                .rename_conflicting(&mut renamed, &new_path)
                .await?;
        }

        renamed.id = self.normalizer.identity(&new_path);
        renamed.path = new_path.clone();
        let prev = self.store.get_with_tombstone(&renamed.id).await?;
        renamed.rev = None;
        renamed.sides = Sides::default();
        renamed.mark_side(side, prev.as_ref());
        renamed.move_to = None;
        renamed.move_from = None;
        renamed.deleted = false;
        renamed.errors = 0;
        if side == SideName::Local {
            renamed.remote = None;
        }

        warn!(
            path = %doc.path,
            renamed = %new_path,
            side = %side,
            "Conflict resolved by renaming"
        );
        self.ensure_parent_exist(side, &renamed).await?;
        self.store.put(&mut renamed).await?;
        let _ = self.events.emit(CoreEvent::Sync(SyncEvent::ConflictResolved {
            original: doc.path.clone(),
            renamed: new_path,
        }));
        Ok(())
    }

    /// Create the missing ancestors of `doc`, topmost first
    async fn ensure_parent_exist(&self, side: SideName, doc: &Metadata) -> Result<()> {
        let mut missing = Vec::new();
        let mut id = parent_path(&doc.id);
        let mut path = parent_path(&doc.path);

        while let (Some(parent_id), Some(parent)) = (id, path) {
            match self.store.get(parent_id).await? {
                Some(existing) if existing.is_folder() => break,
                Some(existing) => {
                    return Err(SyncError::Conflict(format!(
                        "parent {} of {} is a file",
                        existing.path, doc.path
                    )));
                }
                None => missing.push((parent_id.to_string(), parent.to_string())),
            }
            id = parent_path(parent_id);
            path = parent_path(parent);
        }

        for (parent_id, parent) in missing.into_iter().rev() {
            let now = self.clock.now_seconds();
            let mut folder = Metadata::folder(parent)
                .with_id(parent_id)
                .with_dates(now, now);
            let prev = self.store.get_with_tombstone(&folder.id).await?;
            folder.mark_side(side, prev.as_ref());
            debug!(path = %folder.path, "Creating missing parent folder");
            self.store.put(&mut folder).await?;
        }
        Ok(())
    }
}

/// Inherit what the incoming side did not report from a file with the same content
fn inherit_file_attributes(doc: &mut Metadata, file: &Metadata) {
    if doc.size.is_none() {
        doc.size = file.size;
    }
    if doc.mime.is_none() {
        doc.mime = file.mime.clone();
    }
    if doc.tags.is_empty() {
        doc.tags = file.tags.clone();
    }
    if doc.remote.is_none() {
        doc.remote = file.remote.clone();
    }
    if doc.creation_date.is_none() {
        doc.creation_date = file.creation_date;
    }
    if doc.move_from.is_none() {
        doc.move_from = file.move_from.clone();
    }
}

/// Two different remote documents sharing one identity, e.g. `Foo` and
/// `foo` on a case-insensitive local filesystem
fn identity_clash(side: SideName, existing: &Metadata, doc: &Metadata) -> bool {
    if side != SideName::Remote || existing.path == doc.path {
        return false;
    }
    let remote_id = |d: &Metadata| d.remote.as_ref().map(|r| r.id.clone());
    remote_id(existing) != remote_id(doc)
}

/// Forget what `side` knew of `doc` so the other side restores it there
fn dissociate(doc: &mut Metadata, side: SideName) {
    doc.sides.clear(side);
    if side == SideName::Remote {
        doc.remote = None;
    }
    if doc.sides.is_empty() {
        doc.mark_deleted();
    }
    doc.move_to = None;
    doc.errors = 0;
}

/// Replace the leading `from` components of `path` with `to`
fn rebase(path: &str, from: &str, to: &str) -> String {
    let depth = from.split('/').count();
    match path.splitn(depth + 1, '/').nth(depth) {
        Some(rest) => format!("{to}/{rest}"),
        None => to.to_string(),
    }
}
