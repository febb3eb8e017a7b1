//! Local Filesystem Implementation using Tokio

use async_trait::async_trait;
use bridge_traits::{
    error::{BridgeError, Result},
    storage::{DynAsyncRead, FileStat, LocalFileSystem},
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};

/// Tokio-based local filesystem
///
/// Deleted entries go to a trash directory (the XDG user trash by default)
/// instead of being removed.
pub struct TokioLocalFileSystem {
    trash_dir: PathBuf,
}

impl TokioLocalFileSystem {
    /// Create a filesystem using the platform trash directory
    pub fn new() -> Self {
        let trash_dir = dirs::data_local_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("Trash")
            .join("files");
        Self { trash_dir }
    }

    /// Create a filesystem moving trashed entries into `trash_dir`
    pub fn with_trash_dir(trash_dir: PathBuf) -> Self {
        Self { trash_dir }
    }

    pub fn trash_dir(&self) -> &Path {
        &self.trash_dir
    }

    /// Convert std::io::Error to BridgeError
    fn map_io_error(e: std::io::Error) -> BridgeError {
        BridgeError::Io(e)
    }

    fn to_utc(time: std::io::Result<SystemTime>) -> Option<DateTime<Utc>> {
        time.ok().map(DateTime::<Utc>::from)
    }

    #[cfg(unix)]
    fn is_executable(metadata: &std::fs::Metadata) -> bool {
        use std::os::unix::fs::PermissionsExt;
        metadata.permissions().mode() & 0o100 != 0
    }

    #[cfg(not(unix))]
    fn is_executable(_metadata: &std::fs::Metadata) -> bool {
        false
    }

    /// Free name for `path` inside the trash directory
    async fn trash_target(&self, path: &Path) -> Result<PathBuf> {
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "unnamed".to_string());
        let mut target = self.trash_dir.join(&name);
        let mut n = 1;
        while fs::try_exists(&target).await.map_err(Self::map_io_error)? {
            target = self.trash_dir.join(format!("{name}.{n}"));
            n += 1;
        }
        Ok(target)
    }
}

impl Default for TokioLocalFileSystem {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LocalFileSystem for TokioLocalFileSystem {
    async fn exists(&self, path: &Path) -> Result<bool> {
        fs::try_exists(path).await.map_err(Self::map_io_error)
    }

    async fn stat(&self, path: &Path) -> Result<FileStat> {
        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;

        Ok(FileStat {
            size: if metadata.is_dir() { 0 } else { metadata.len() },
            modified: Self::to_utc(metadata.modified()),
            created: Self::to_utc(metadata.created()),
            is_directory: metadata.is_dir(),
            executable: !metadata.is_dir() && Self::is_executable(&metadata),
        })
    }

    async fn create_dir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path)
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, "Created directory");
        Ok(())
    }

    async fn open_read_stream(&self, path: &Path) -> Result<Box<DynAsyncRead>> {
        let file = fs::File::open(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Opened file for reading");
        Ok(Box::new(file))
    }

    async fn write_stream(&self, path: &Path, mut content: Box<DynAsyncRead>) -> Result<u64> {
        let mut file = fs::File::create(path).await.map_err(Self::map_io_error)?;
        let size = tokio::io::copy(&mut content, &mut file)
            .await
            .map_err(Self::map_io_error)?;
        file.flush().await.map_err(Self::map_io_error)?;
        file.sync_all().await.map_err(Self::map_io_error)?;
        debug!(path = ?path, size, "Wrote file");
        Ok(size)
    }

    async fn set_modified(&self, path: &Path, modified: DateTime<Utc>) -> Result<()> {
        let path = path.to_path_buf();
        let time = SystemTime::from(modified);
        tokio::task::spawn_blocking(move || {
            let file = std::fs::File::open(&path)?;
            file.set_modified(time)
        })
        .await
        .map_err(|e| BridgeError::OperationFailed(format!("set_modified task failed: {e}")))?
        .map_err(Self::map_io_error)
    }

    #[cfg(unix)]
    async fn set_executable(&self, path: &Path, executable: bool) -> Result<()> {
        use std::os::unix::fs::PermissionsExt;

        let metadata = fs::metadata(path).await.map_err(Self::map_io_error)?;
        if metadata.is_dir() {
            return Ok(());
        }
        let mode = if executable { 0o755 } else { 0o644 };
        fs::set_permissions(path, std::fs::Permissions::from_mode(mode))
            .await
            .map_err(Self::map_io_error)?;
        debug!(path = ?path, executable, "Updated permissions");
        Ok(())
    }

    #[cfg(not(unix))]
    async fn set_executable(&self, _path: &Path, _executable: bool) -> Result<()> {
        Ok(())
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        fs::rename(from, to).await.map_err(Self::map_io_error)?;
        debug!(from = ?from, to = ?to, "Renamed");
        Ok(())
    }

    async fn remove_dir(&self, path: &Path) -> Result<()> {
        fs::remove_dir(path).await.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Removed empty directory");
        Ok(())
    }

    async fn remove_all(&self, path: &Path) -> Result<()> {
        let metadata = match fs::symlink_metadata(path).await {
            Ok(metadata) => metadata,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(Self::map_io_error(e)),
        };
        let removed = if metadata.is_dir() {
            fs::remove_dir_all(path).await
        } else {
            fs::remove_file(path).await
        };
        removed.map_err(Self::map_io_error)?;
        debug!(path = ?path, "Removed");
        Ok(())
    }

    async fn trash(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(&self.trash_dir)
            .await
            .map_err(Self::map_io_error)?;
        let target = self.trash_target(path).await?;
        if let Err(e) = fs::rename(path, &target).await {
            warn!(path = ?path, trash = ?self.trash_dir, error = %e, "Failed to move to trash");
            return Err(Self::map_io_error(e));
        }
        debug!(path = ?path, target = ?target, "Moved to trash");
        Ok(())
    }
}
