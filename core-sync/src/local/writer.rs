//! Local applier
//!
//! Applies remote changes to the local tree through [`LocalFileSystem`].
//! File content is written into a temporary directory under the sync root,
//! verified against the expected checksum, then renamed into place, so a
//! partial download never shows up under its final name.

use async_trait::async_trait;
use bridge_traits::{LocalFileSystem, RemoteCloud};
use core_metadata::{compute_checksum, Metadata, MetadataStore, SideName};
use core_runtime::events::{CoreEvent, EventBus, TransferDirection, TransferEvent};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::local_path;
use crate::error::{Result, SyncError};
use crate::side::Side;

pub struct LocalWriter {
    fs: Arc<dyn LocalFileSystem>,
    remote: Arc<dyn RemoteCloud>,
    store: Arc<dyn MetadataStore>,
    events: EventBus,
    sync_path: PathBuf,
    tmp_dir: PathBuf,
    use_trash: bool,
}

impl LocalWriter {
    pub fn new(
        fs: Arc<dyn LocalFileSystem>,
        remote: Arc<dyn RemoteCloud>,
        store: Arc<dyn MetadataStore>,
        events: EventBus,
        sync_path: impl Into<PathBuf>,
        tmp_dir: impl Into<PathBuf>,
        use_trash: bool,
    ) -> Self {
        Self {
            fs,
            remote,
            store,
            events,
            sync_path: sync_path.into(),
            tmp_dir: tmp_dir.into(),
            use_trash,
        }
    }

    fn abs(&self, path: &str) -> PathBuf {
        local_path(&self.sync_path, path)
    }

    /// A local file with the same content, in sync with the store
    async fn local_copy(&self, doc: &Metadata) -> Result<Option<PathBuf>> {
        let Some(checksum) = &doc.checksum else {
            return Ok(None);
        };
        for candidate in self.store.by_checksum(checksum).await? {
            if candidate.path == doc.path || !candidate.is_up_to_date(SideName::Local) {
                continue;
            }
            let path = self.abs(&candidate.path);
            if self.fs.exists(&path).await? {
                return Ok(Some(path));
            }
        }
        Ok(None)
    }

    /// Write the content of `doc` into the temporary file `tmp`
    async fn fetch(&self, doc: &Metadata, tmp: &Path) -> Result<u64> {
        self.fs.create_dir_all(&self.tmp_dir).await?;

        let bytes = match self.local_copy(doc).await? {
            Some(source) => {
                debug!(path = %doc.path, from = %source.display(), "Copying identical local file");
                self.fs.copy_file(&source, tmp).await?
            }
            None => {
                let remote = doc.remote.as_ref().ok_or_else(|| {
                    SyncError::validation("remote", format!("{} has no remote counterpart", doc.path))
                })?;
                let _ = self.events.emit(CoreEvent::Transfer(TransferEvent::Started {
                    path: doc.path.clone(),
                    direction: TransferDirection::Download,
                }));
                let reader = self.remote.download(&remote.id).await?;
                self.fs.write_stream(tmp, reader).await?
            }
        };

        if let Some(expected) = &doc.checksum {
            let actual = compute_checksum(self.fs.open_read_stream(tmp).await?).await?;
            if &actual != expected {
                return Err(SyncError::ChecksumMismatch {
                    path: doc.path.clone(),
                    expected: expected.clone(),
                    actual,
                });
            }
        }
        Ok(bytes)
    }

    async fn ensure_parent(&self, target: &Path) -> Result<()> {
        if let Some(parent) = target.parent() {
            if !self.fs.exists(parent).await? {
                self.fs.create_dir_all(parent).await?;
            }
        }
        Ok(())
    }

    async fn write_file(&self, doc: &Metadata) -> Result<()> {
        let target = self.abs(&doc.path);
        let tmp = self.tmp_dir.join(format!("{}.tmp", Uuid::new_v4()));
        let bytes = match self.write_into_place(doc, &tmp, &target).await {
            Ok(bytes) => bytes,
            Err(err) => {
                if self.fs.exists(&tmp).await.unwrap_or(false) {
                    if let Err(cleanup) = self.fs.remove_all(&tmp).await {
                        warn!(path = %doc.path, error = %cleanup, "Could not remove temporary file");
                    }
                }
                return Err(err);
            }
        };
        let _ = self.events.emit(CoreEvent::Transfer(TransferEvent::Completed {
            path: doc.path.clone(),
            direction: TransferDirection::Download,
            bytes,
        }));
        Ok(())
    }

    async fn write_into_place(&self, doc: &Metadata, tmp: &Path, target: &Path) -> Result<u64> {
        let bytes = self.fetch(doc, tmp).await?;
        self.ensure_parent(target).await?;
        self.fs.rename(tmp, target).await?;
        self.apply_attributes(doc, target).await?;
        Ok(bytes)
    }

    async fn apply_attributes(&self, doc: &Metadata, target: &Path) -> Result<()> {
        if doc.is_file() {
            self.fs.set_executable(target, doc.executable).await?;
        }
        if let Some(modified) = doc.last_modification {
            self.fs.set_modified(target, modified).await?;
        }
        Ok(())
    }

    async fn remove(&self, doc: &Metadata) -> Result<()> {
        let target = self.abs(&doc.path);
        let removed = if self.use_trash {
            self.fs.trash(&target).await
        } else {
            self.fs.remove_all(&target).await
        };
        match removed {
            Err(err) if err.is_not_found() => {
                debug!(path = %doc.path, "Already gone");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

#[async_trait]
impl Side for LocalWriter {
    fn name(&self) -> &'static str {
        "local"
    }

    #[instrument(skip(self, doc), fields(path = %doc.path))]
    async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "Downloading file");
        self.write_file(doc).await
    }

    async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
        let target = self.abs(&doc.path);
        self.fs.create_dir_all(&target).await?;
        if let Some(modified) = doc.last_modification {
            self.fs.set_modified(&target, modified).await?;
        }
        info!(path = %doc.path, "Folder created");
        Ok(())
    }

    #[instrument(skip(self, doc, _old), fields(path = %doc.path))]
    async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<Metadata>) -> Result<()> {
        info!(path = %doc.path, "Replacing file content");
        self.write_file(doc).await
    }

    async fn update_file_metadata(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
        debug!(path = %doc.path, "Updating file attributes");
        let target = self.abs(&doc.path);
        self.apply_attributes(doc, &target).await
    }

    async fn update_folder(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
        self.add_folder(doc).await
    }

    #[instrument(skip(self, doc, from), fields(path = %doc.path, from = %from.path))]
    async fn move_file(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
        let source = self.abs(&from.path);
        let target = self.abs(&doc.path);
        if self.fs.exists(&source).await? {
            self.ensure_parent(&target).await?;
            self.fs.rename(&source, &target).await?;
            self.apply_attributes(doc, &target).await?;
            info!(path = %doc.path, from = %from.path, "File moved");
            return Ok(());
        }
        if self.fs.exists(&target).await? {
            debug!(path = %doc.path, "Already moved");
            return Ok(());
        }
        warn!(path = %doc.path, from = %from.path, "Move source is missing, downloading instead");
        self.add_file(doc).await
    }

    #[instrument(skip(self, doc, from), fields(path = %doc.path, from = %from.path))]
    async fn move_folder(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
        let source = self.abs(&from.path);
        let target = self.abs(&doc.path);
        match (
            self.fs.exists(&source).await?,
            self.fs.exists(&target).await?,
        ) {
            (true, true) => {
                // Children were moved one by one already
                self.fs.remove_dir(&source).await?;
                self.add_folder(doc).await
            }
            (true, false) => {
                self.ensure_parent(&target).await?;
                self.fs.rename(&source, &target).await?;
                info!(path = %doc.path, from = %from.path, "Folder moved");
                Ok(())
            }
            (false, true) => Ok(()),
            (false, false) => {
                warn!(path = %doc.path, from = %from.path, "Move source is missing, creating instead");
                self.add_folder(doc).await
            }
        }
    }

    async fn delete_file(&self, doc: &Metadata) -> Result<()> {
        info!(path = %doc.path, "Deleting file");
        self.remove(doc).await
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        info!(path = %doc.path, "Deleting folder");
        self.remove(doc).await
    }
}
