//! Remote Cloud Abstraction
//!
//! The capability surface of the remote file store: a sequence-cursored change
//! feed, bulk listing, a health check, and revision-checked CRUD with binary
//! upload and download. The wire protocol behind it is the implementor's
//! concern.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::storage::DynAsyncRead;

/// Identifier of the remote root directory
pub const ROOT_DIR_ID: &str = "io.cozy.files.root-dir";

/// Remote document type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum RemoteDocType {
    File,
    Directory,
}

impl RemoteDocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::File => "file",
            Self::Directory => "directory",
        }
    }
}

/// A file or directory as the remote store describes it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteDoc {
    pub id: String,
    pub rev: String,
    pub doc_type: RemoteDocType,
    /// Absolute remote path, `/` being the root
    pub path: String,
    pub dir_id: Option<String>,
    /// Base64-encoded MD5 of the content (files only)
    pub md5sum: Option<String>,
    pub size: Option<u64>,
    pub executable: bool,
    pub mime: Option<String>,
    pub tags: Vec<String>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl RemoteDoc {
    pub fn is_directory(&self) -> bool {
        self.doc_type == RemoteDocType::Directory
    }

    /// Name component of the remote path
    pub fn name(&self) -> &str {
        self.path.rsplit('/').next().unwrap_or(&self.path)
    }
}

/// One entry of the remote change feed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteChange {
    pub id: String,
    pub seq: String,
    pub deleted: bool,
    /// Current document, absent for deletions
    pub doc: Option<RemoteDoc>,
}

/// A page of the change feed plus the feed's high-water mark
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ChangesPage {
    pub changes: Vec<RemoteChange>,
    pub last_seq: String,
}

/// Options sent along with file content
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UploadOptions {
    /// Expected checksum; the remote rejects the upload on mismatch
    pub checksum: Option<String>,
    pub executable: bool,
    pub mime: Option<String>,
    pub last_modified: Option<DateTime<Utc>>,
}

/// Attribute changes for [`RemoteCloud::update_attributes`]
///
/// Setting `name` and/or `dir_id` renames or moves the document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RemotePatch {
    pub name: Option<String>,
    pub dir_id: Option<String>,
    pub executable: Option<bool>,
    pub tags: Option<Vec<String>>,
    pub updated_at: Option<DateTime<Utc>>,
}

/// Remote file store trait
///
/// Every mutating call taking a `rev` fails with
/// [`BridgeError::Conflict`](crate::BridgeError::Conflict) when the revision
/// is stale. Authentication failures surface as
/// [`BridgeError::Unauthorized`](crate::BridgeError::Unauthorized), transport
/// failures as [`BridgeError::Unreachable`](crate::BridgeError::Unreachable).
#[async_trait]
pub trait RemoteCloud: Send + Sync {
    /// Read the change feed after `since` (`"0"` reads from the beginning)
    async fn changes(&self, since: &str) -> Result<ChangesPage>;

    /// Current high-water mark of the change feed
    async fn last_seq(&self) -> Result<String>;

    /// List every live document of a type
    async fn list_by_type(&self, doc_type: RemoteDocType) -> Result<Vec<RemoteDoc>>;

    /// Whether the remote is reachable
    async fn ping(&self) -> bool;

    /// Resolve a directory by its absolute path
    async fn find_directory_by_path(&self, path: &str) -> Result<RemoteDoc>;

    async fn create_directory(
        &self,
        dir_id: &str,
        name: &str,
        last_modified: Option<DateTime<Utc>>,
    ) -> Result<RemoteDoc>;

    async fn upload_file(
        &self,
        dir_id: &str,
        name: &str,
        content: Box<DynAsyncRead>,
        options: UploadOptions,
    ) -> Result<RemoteDoc>;

    async fn overwrite_file(
        &self,
        id: &str,
        rev: &str,
        content: Box<DynAsyncRead>,
        options: UploadOptions,
    ) -> Result<RemoteDoc>;

    async fn update_attributes(&self, id: &str, rev: &str, patch: RemotePatch)
        -> Result<RemoteDoc>;

    /// Move a document (and a directory's descendants) to the remote trash
    async fn trash(&self, id: &str, rev: &str) -> Result<()>;

    /// Stream a file's content
    async fn download(&self, id: &str) -> Result<Box<DynAsyncRead>>;
}
