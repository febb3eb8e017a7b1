//! Replica writers
//!
//! The engine applies a recorded change to the replica that is behind through
//! this trait. [`LocalWriter`](crate::local::LocalWriter) writes to the local
//! tree, [`RemoteWriter`](crate::remote::RemoteWriter) to the cloud.
//!
//! Writers may update `doc.remote` with the linkage returned by the cloud;
//! the engine persists the document after a successful call.

use async_trait::async_trait;
use core_metadata::Metadata;

use crate::error::Result;

#[async_trait]
pub trait Side: Send + Sync {
    /// Short name used in logs
    fn name(&self) -> &'static str;

    async fn add_file(&self, doc: &mut Metadata) -> Result<()>;

    async fn add_folder(&self, doc: &mut Metadata) -> Result<()>;

    /// Replace the content of a file. `old` is the previously applied
    /// revision, when still recorded.
    async fn overwrite_file(&self, doc: &mut Metadata, old: Option<Metadata>) -> Result<()>;

    /// Same content, changed attributes (executable bit, dates, tags)
    async fn update_file_metadata(&self, doc: &mut Metadata, old: Metadata) -> Result<()>;

    async fn update_folder(&self, doc: &mut Metadata, old: Metadata) -> Result<()>;

    async fn move_file(&self, doc: &mut Metadata, from: Metadata) -> Result<()>;

    /// Move a folder and, with it, everything below
    async fn move_folder(&self, doc: &mut Metadata, from: Metadata) -> Result<()>;

    async fn delete_file(&self, doc: &Metadata) -> Result<()>;

    async fn delete_folder(&self, doc: &Metadata) -> Result<()>;
}
