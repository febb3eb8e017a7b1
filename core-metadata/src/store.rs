//! Metadata store interface

use async_trait::async_trait;
use tokio::sync::watch;

use crate::document::Metadata;
use crate::error::Result;

/// An entry of the store's change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Change {
    pub seq: i64,
    pub doc: Metadata,
}

/// Document store with optimistic revisions and a tailing change feed
///
/// Every successful write assigns `doc.rev` (previous revision + 1) and moves
/// the document to the end of the change feed. The feed holds at most one
/// entry per identity.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Live document by identity
    async fn get(&self, id: &str) -> Result<Option<Metadata>>;

    /// Document by identity, tombstones included
    async fn get_with_tombstone(&self, id: &str) -> Result<Option<Metadata>>;

    /// Write one document
    ///
    /// # Errors
    /// `MetadataError::Conflict` when `doc.rev` is not the stored revision
    /// (or is set while nothing live is stored).
    async fn put(&self, doc: &mut Metadata) -> Result<()>;

    /// Write several documents in one transaction, all or nothing
    async fn bulk_put(&self, docs: &mut [Metadata]) -> Result<()>;

    /// Live files with this checksum
    async fn by_checksum(&self, checksum: &str) -> Result<Vec<Metadata>>;

    /// Live descendants of the folder identity, ordered by identity
    ///
    /// The empty identity lists every live document.
    async fn by_recursive_path(&self, folder_id: &str) -> Result<Vec<Metadata>>;

    /// Live document linked to this remote id
    async fn by_remote_id(&self, remote_id: &str) -> Result<Option<Metadata>>;

    async fn all_docs(&self) -> Result<Vec<Metadata>>;

    /// Body of a past revision, if still recorded
    async fn get_revision(&self, id: &str, rev: u64) -> Result<Option<Metadata>>;

    /// Last change sequence the engine applied
    async fn local_seq(&self) -> Result<i64>;

    async fn set_local_seq(&self, seq: i64) -> Result<()>;

    /// Remote feed cursor, `"0"` until the first replication
    async fn remote_seq(&self) -> Result<String>;

    async fn set_remote_seq(&self, seq: &str) -> Result<()>;

    /// First change after `since`, or `None` when the feed is drained
    async fn next_change(&self, since: i64) -> Result<Option<Change>>;

    /// Receiver of the last committed sequence
    fn subscribe(&self) -> watch::Receiver<i64>;
}
