//! Serial checksum queue
//!
//! Files are hashed one at a time, in request order. Concurrent reads of
//! several large files thrash a spinning disk; on flash the cost of queueing
//! is negligible. Callers wait on their turn.

use bridge_traits::LocalFileSystem;
use core_metadata::compute_checksum;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

use crate::error::Result;

pub struct Checksumer {
    fs: Arc<dyn LocalFileSystem>,
    // tokio's mutex is fair: waiters are served first come, first served
    turn: Mutex<()>,
}

impl Checksumer {
    pub fn new(fs: Arc<dyn LocalFileSystem>) -> Self {
        Self {
            fs,
            turn: Mutex::new(()),
        }
    }

    /// Checksum of the file at `path`, once every earlier request is done
    pub async fn checksum(&self, path: &Path) -> Result<String> {
        let _turn = self.turn.lock().await;
        debug!(path = %path.display(), "Computing checksum");
        let reader = self.fs.open_read_stream(path).await?;
        Ok(compute_checksum(reader).await?)
    }
}
