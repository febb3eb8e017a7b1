//! Remote applier
//!
//! Applies local changes to the cloud through [`RemoteCloud`]. Every call that
//! creates or changes a remote document records the returned `{id, rev}` on
//! the metadata document, which the engine then persists. Stale revisions come
//! back as conflicts and are retried by the engine after the remote watcher
//! caught up.

use async_trait::async_trait;
use bridge_traits::{LocalFileSystem, RemoteCloud, RemoteDoc, RemotePatch, UploadOptions, ROOT_DIR_ID};
use core_metadata::{basename, parent_path, Metadata, RemoteInfo};
use core_runtime::events::{CoreEvent, EventBus, TransferDirection, TransferEvent};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

use crate::error::{Result, SyncError};
use crate::local::local_path;
use crate::merge::ConflictRenamer;
use crate::side::Side;

pub struct RemoteWriter {
    remote: Arc<dyn RemoteCloud>,
    fs: Arc<dyn LocalFileSystem>,
    events: EventBus,
    sync_path: PathBuf,
}

impl RemoteWriter {
    pub fn new(
        remote: Arc<dyn RemoteCloud>,
        fs: Arc<dyn LocalFileSystem>,
        events: EventBus,
        sync_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            remote,
            fs,
            events,
            sync_path: sync_path.into(),
        }
    }

    async fn parent_dir_id(&self, path: &str) -> Result<String> {
        match parent_path(path) {
            None => Ok(ROOT_DIR_ID.to_string()),
            Some(parent) => Ok(self
                .remote
                .find_directory_by_path(&remote_path(parent))
                .await?
                .id),
        }
    }

    fn upload_options(doc: &Metadata) -> UploadOptions {
        UploadOptions {
            checksum: doc.checksum.clone(),
            executable: doc.executable,
            mime: doc.mime.clone(),
            last_modified: doc.last_modification,
        }
    }

    async fn upload(&self, doc: &mut Metadata, existing: Option<RemoteInfo>) -> Result<()> {
        let content = self
            .fs
            .open_read_stream(&local_path(&self.sync_path, &doc.path))
            .await?;
        let _ = self.events.emit(CoreEvent::Transfer(TransferEvent::Started {
            path: doc.path.clone(),
            direction: TransferDirection::Upload,
        }));

        let options = Self::upload_options(doc);
        let uploaded = match existing {
            Some(remote) => {
                self.remote
                    .overwrite_file(&remote.id, &remote.rev, content, options)
                    .await?
            }
            None => {
                let dir_id = self.parent_dir_id(&doc.path).await?;
                self.remote
                    .upload_file(&dir_id, doc.name(), content, options)
                    .await?
            }
        };

        let _ = self.events.emit(CoreEvent::Transfer(TransferEvent::Completed {
            path: doc.path.clone(),
            direction: TransferDirection::Upload,
            bytes: uploaded.size.unwrap_or(0),
        }));
        link(doc, &uploaded);
        Ok(())
    }

    async fn rename(&self, doc: &mut Metadata, remote: &RemoteInfo) -> Result<()> {
        let patch = RemotePatch {
            name: Some(doc.name().to_string()),
            dir_id: Some(self.parent_dir_id(&doc.path).await?),
            updated_at: doc.last_modification,
            ..RemotePatch::default()
        };
        let moved = self
            .remote
            .update_attributes(&remote.id, &remote.rev, patch)
            .await?;
        link(doc, &moved);
        Ok(())
    }

    async fn trash(&self, doc: &Metadata) -> Result<()> {
        let Some(remote) = &doc.remote else {
            debug!(path = %doc.path, "Never uploaded, nothing to trash");
            return Ok(());
        };
        match self.remote.trash(&remote.id, &remote.rev).await {
            Err(err) if err.is_not_found() => {
                debug!(path = %doc.path, "Already gone from the remote");
                Ok(())
            }
            other => Ok(other?),
        }
    }
}

fn remote_path(path: &str) -> String {
    format!("/{path}")
}

fn link(doc: &mut Metadata, remote: &RemoteDoc) {
    doc.remote = Some(RemoteInfo::new(remote.id.clone(), remote.rev.clone()));
}

fn linkage(doc: &Metadata) -> Result<RemoteInfo> {
    doc.remote.clone().ok_or_else(|| {
        SyncError::validation("remote", format!("{} is not linked to a remote document", doc.path))
    })
}

#[async_trait]
impl Side for RemoteWriter {
    fn name(&self) -> &'static str {
        "remote"
    }

    #[instrument(skip(self, doc), fields(path = %doc.path))]
    async fn add_file(&self, doc: &mut Metadata) -> Result<()> {
        info!(path = %doc.path, "Uploading new file");
        self.upload(doc, None).await
    }

    #[instrument(skip(self, doc), fields(path = %doc.path))]
    async fn add_folder(&self, doc: &mut Metadata) -> Result<()> {
        let dir_id = self.parent_dir_id(&doc.path).await?;
        let created = match self
            .remote
            .create_directory(&dir_id, doc.name(), doc.last_modification)
            .await
        {
            Ok(created) => created,
            Err(bridge_traits::BridgeError::Conflict(_)) => {
                // Created meanwhile by another client
                debug!(path = %doc.path, "Folder already exists remotely");
                self.remote
                    .find_directory_by_path(&remote_path(&doc.path))
                    .await?
            }
            Err(err) => return Err(err.into()),
        };
        info!(path = %doc.path, "Folder created remotely");
        link(doc, &created);
        Ok(())
    }

    #[instrument(skip(self, doc, _old), fields(path = %doc.path))]
    async fn overwrite_file(&self, doc: &mut Metadata, _old: Option<Metadata>) -> Result<()> {
        info!(path = %doc.path, "Uploading new file version");
        let remote = linkage(doc)?;
        self.upload(doc, Some(remote)).await
    }

    async fn update_file_metadata(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
        let remote = linkage(doc)?;
        let patch = RemotePatch {
            executable: Some(doc.executable),
            updated_at: doc.last_modification,
            ..RemotePatch::default()
        };
        let updated = self
            .remote
            .update_attributes(&remote.id, &remote.rev, patch)
            .await?;
        debug!(path = %doc.path, "Updated remote file attributes");
        link(doc, &updated);
        Ok(())
    }

    async fn update_folder(&self, doc: &mut Metadata, _old: Metadata) -> Result<()> {
        let Some(remote) = doc.remote.clone() else {
            return self.add_folder(doc).await;
        };
        let patch = RemotePatch {
            updated_at: doc.last_modification,
            ..RemotePatch::default()
        };
        let updated = self
            .remote
            .update_attributes(&remote.id, &remote.rev, patch)
            .await?;
        link(doc, &updated);
        Ok(())
    }

    #[instrument(skip(self, doc, from), fields(path = %doc.path, from = %from.path))]
    async fn move_file(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
        let remote = match from.remote.or_else(|| doc.remote.clone()) {
            Some(remote) => remote,
            None => {
                warn!(path = %doc.path, "Move source was never uploaded, uploading instead");
                return self.add_file(doc).await;
            }
        };
        info!(path = %doc.path, from = %from.path, "Moving remote file");
        self.rename(doc, &remote).await
    }

    #[instrument(skip(self, doc, from), fields(path = %doc.path, from = %from.path))]
    async fn move_folder(&self, doc: &mut Metadata, from: Metadata) -> Result<()> {
        let remote = match from.remote.or_else(|| doc.remote.clone()) {
            Some(remote) => remote,
            None => return self.add_folder(doc).await,
        };
        info!(path = %doc.path, from = %from.path, "Moving remote folder");
        self.rename(doc, &remote).await
    }

    async fn delete_file(&self, doc: &Metadata) -> Result<()> {
        info!(path = %doc.path, "Trashing remote file");
        self.trash(doc).await
    }

    async fn delete_folder(&self, doc: &Metadata) -> Result<()> {
        info!(path = %doc.path, "Trashing remote folder");
        self.trash(doc).await
    }
}

#[async_trait]
impl ConflictRenamer for RemoteWriter {
    async fn rename_conflicting(&self, doc: &mut Metadata, new_path: &str) -> Result<()> {
        let Some(remote) = doc.remote.clone() else {
            return Ok(());
        };
        let patch = RemotePatch {
            name: Some(basename(new_path).to_string()),
            ..RemotePatch::default()
        };
        let renamed = self
            .remote
            .update_attributes(&remote.id, &remote.rev, patch)
            .await?;
        info!(path = %doc.path, renamed = %new_path, "Renamed remote conflicting copy");
        link(doc, &renamed);
        Ok(())
    }
}
