//! # Preparer
//!
//! Gatekeeper between the change detectors and [`Merge`].
//!
//! ## Overview
//!
//! Every intent is validated before it reaches the store:
//! - the path is normalized to a relative `/`-separated form and must stay
//!   inside the sync root
//! - a checksum, when present, must be the base64 encoding of 16 bytes
//! - a move needs two distinct valid paths and a stored source
//!
//! Locally originated intents are also checked against the ignore rules; the
//! remote is authoritative for what exists there, so remote intents are not.
//! The document identity is computed here, once, by the injected normalizer.
//!
//! A rejected intent is logged and returned as [`SyncError::Validation`]; the
//! detectors drop it without retrying.

use core_metadata::checksum::is_valid_checksum;
use core_metadata::{Metadata, Normalizer, SideName};
use std::sync::Arc;
use tracing::{debug, error};

use crate::error::{Result, SyncError};
use crate::ignore::IgnoreRules;
use crate::merge::Merge;

pub struct Prep {
    merge: Arc<Merge>,
    ignore: Arc<IgnoreRules>,
    normalizer: Arc<dyn Normalizer>,
}

impl Prep {
    pub fn new(merge: Arc<Merge>, ignore: Arc<IgnoreRules>, normalizer: Arc<dyn Normalizer>) -> Self {
        Self {
            merge,
            ignore,
            normalizer,
        }
    }

    pub fn merge(&self) -> &Arc<Merge> {
        &self.merge
    }

    pub fn normalizer(&self) -> &Arc<dyn Normalizer> {
        &self.normalizer
    }

    pub fn is_ignored(&self, side: SideName, doc: &Metadata) -> bool {
        side == SideName::Local && self.ignore.is_ignored(&doc.path, doc.is_folder())
    }

    pub async fn add_file(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        self.prepare(&mut doc)?;
        if self.skip_ignored(side, &doc) {
            return Ok(());
        }
        self.merge.add_file(side, doc).await
    }

    pub async fn update_file(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        self.prepare(&mut doc)?;
        if self.skip_ignored(side, &doc) {
            return Ok(());
        }
        self.merge.update_file(side, doc).await
    }

    pub async fn put_folder(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        self.prepare(&mut doc)?;
        if self.skip_ignored(side, &doc) {
            return Ok(());
        }
        self.merge.put_folder(side, doc).await
    }

    /// Move a file. Moving into or out of an ignored path becomes a deletion
    /// or an addition.
    pub async fn move_file(&self, side: SideName, mut doc: Metadata, mut was: Metadata) -> Result<()> {
        self.prepare_move(&mut doc, &mut was)?;
        match (self.is_ignored(side, &was), self.is_ignored(side, &doc)) {
            (false, false) => self.merge.move_file(side, doc, was).await,
            (false, true) => {
                debug!(path = %doc.path, "Moved into an ignored path, deleting the source");
                self.merge.delete_file(side, was).await
            }
            (true, false) => {
                debug!(path = %doc.path, "Moved out of an ignored path");
                self.merge.add_file(side, doc).await
            }
            (true, true) => Ok(()),
        }
    }

    pub async fn move_folder(&self, side: SideName, mut doc: Metadata, mut was: Metadata) -> Result<()> {
        self.prepare_move(&mut doc, &mut was)?;
        match (self.is_ignored(side, &was), self.is_ignored(side, &doc)) {
            (false, false) => self.merge.move_folder(side, doc, was).await,
            (false, true) => self.merge.delete_folder(side, was).await,
            (true, false) => self.merge.put_folder(side, doc).await,
            (true, true) => Ok(()),
        }
    }

    pub async fn delete_file(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        self.prepare(&mut doc)?;
        if self.skip_ignored(side, &doc) {
            return Ok(());
        }
        self.merge.delete_file(side, doc).await
    }

    pub async fn delete_folder(&self, side: SideName, mut doc: Metadata) -> Result<()> {
        self.prepare(&mut doc)?;
        if self.skip_ignored(side, &doc) {
            return Ok(());
        }
        self.merge.delete_folder(side, doc).await
    }

    pub async fn detach_remote(&self, was: &Metadata) -> Result<()> {
        self.merge.detach_remote(was).await
    }

    fn skip_ignored(&self, side: SideName, doc: &Metadata) -> bool {
        let ignored = self.is_ignored(side, doc);
        if ignored {
            debug!(path = %doc.path, "Ignored");
        }
        ignored
    }

    fn prepare(&self, doc: &mut Metadata) -> Result<()> {
        let result = self.validate(doc);
        if let Err(err) = &result {
            error!(path = %doc.path, error = %err, "Invalid document, dropping it");
        }
        result
    }

    fn validate(&self, doc: &mut Metadata) -> Result<()> {
        doc.path = normalize_path(&doc.path)?;
        if let Some(checksum) = &doc.checksum {
            if !is_valid_checksum(checksum) {
                return Err(SyncError::validation(
                    "checksum",
                    format!("{checksum} is not a base64 MD5 digest"),
                ));
            }
        }
        doc.id = self.normalizer.identity(&doc.path);
        Ok(())
    }

    fn prepare_move(&self, doc: &mut Metadata, was: &mut Metadata) -> Result<()> {
        let result = self.validate_move(doc, was);
        if let Err(err) = &result {
            error!(path = %doc.path, from = %was.path, error = %err, "Invalid move, dropping it");
        }
        result
    }

    fn validate_move(&self, doc: &mut Metadata, was: &mut Metadata) -> Result<()> {
        self.validate(doc)?;
        was.path = normalize_path(&was.path)?;
        if was.path == doc.path {
            return Err(SyncError::validation("path", "source and destination are the same"));
        }
        if was.rev.is_none() {
            return Err(SyncError::validation("rev", format!("{} has no stored revision", was.path)));
        }
        Ok(())
    }
}

/// Relative `/`-separated form of `path`, rejecting anything that escapes the
/// sync root
pub fn normalize_path(path: &str) -> Result<String> {
    let mut parts = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => continue,
            ".." => {
                return Err(SyncError::validation(
                    "path",
                    format!("{path} points outside the sync root"),
                ))
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return Err(SyncError::validation("path", "empty path"));
    }
    Ok(parts.join("/"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use bridge_traits::testing::ManualClock;
    use chrono::Utc;
    use core_metadata::db::create_test_pool;
    use core_metadata::{CaseInsensitive, MetadataStore, SqliteMetadataStore};
    use core_runtime::events::EventBus;

    use crate::merge::ConflictRenamer;

    const SUM: &str = "XUFAKrxLKna5cZ2REBfFkg==";

    struct NoRename;

    #[async_trait]
    impl ConflictRenamer for NoRename {
        async fn rename_conflicting(&self, _doc: &mut Metadata, _new_path: &str) -> Result<()> {
            Ok(())
        }
    }

    async fn prep() -> (Prep, Arc<SqliteMetadataStore>) {
        let pool = create_test_pool().await.unwrap();
        let store = Arc::new(SqliteMetadataStore::new(pool).await.unwrap());
        let normalizer: Arc<dyn Normalizer> = Arc::new(CaseInsensitive);
        let merge = Arc::new(Merge::new(
            store.clone(),
            normalizer.clone(),
            Arc::new(ManualClock::new(Utc::now())),
            EventBus::new(8),
            Arc::new(NoRename),
            Arc::new(NoRename),
        ));
        let ignore = Arc::new(IgnoreRules::with_defaults(&["build/".to_string()], true, true).unwrap());
        (Prep::new(merge, ignore, normalizer), store)
    }

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path("/docs//a.txt").unwrap(), "docs/a.txt");
        assert_eq!(normalize_path("./x").unwrap(), "x");
        assert!(normalize_path("").is_err());
        assert!(normalize_path("/").is_err());
        assert!(normalize_path("docs/../../etc/passwd").is_err());
    }

    #[tokio::test]
    async fn test_identity_is_computed() {
        let (prep, store) = prep().await;
        prep.add_file(SideName::Local, Metadata::file("/Docs/Report.txt").with_checksum(SUM))
            .await
            .unwrap();

        let doc = store.get("DOCS/REPORT.TXT").await.unwrap().unwrap();
        assert_eq!(doc.path, "Docs/Report.txt");
    }

    #[tokio::test]
    async fn test_invalid_checksum_is_rejected() {
        let (prep, store) = prep().await;
        let err = prep
            .add_file(SideName::Local, Metadata::file("a.txt").with_checksum("nope"))
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "checksum"));
        assert!(store.all_docs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_ignore_applies_to_local_only() {
        let (prep, store) = prep().await;
        prep.add_file(SideName::Local, Metadata::file("build/out.o").with_checksum(SUM))
            .await
            .unwrap();
        prep.add_file(SideName::Local, Metadata::file("notes.tmp").with_checksum(SUM))
            .await
            .unwrap();
        assert!(store.all_docs().await.unwrap().is_empty());

        prep.add_file(SideName::Remote, Metadata::file("notes.tmp").with_checksum(SUM))
            .await
            .unwrap();
        assert!(store.get("NOTES.TMP").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_move_needs_distinct_paths_and_known_source() {
        let (prep, _store) = prep().await;
        let mut was = Metadata::file("a.txt").with_checksum(SUM);
        was.rev = Some(1);
        let err = prep
            .move_file(SideName::Local, Metadata::file("/a.txt").with_checksum(SUM), was)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { .. }));

        let unknown = Metadata::file("a.txt").with_checksum(SUM);
        let err = prep
            .move_file(SideName::Local, Metadata::file("b.txt").with_checksum(SUM), unknown)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Validation { ref field, .. } if field == "rev"));
    }

    #[tokio::test]
    async fn test_move_into_ignored_path_deletes_source() {
        let (prep, store) = prep().await;
        prep.add_file(SideName::Local, Metadata::file("a.c").with_checksum(SUM))
            .await
            .unwrap();
        let was = store.get("A.C").await.unwrap().unwrap();

        prep.move_file(SideName::Local, Metadata::file("build/a.c").with_checksum(SUM), was)
            .await
            .unwrap();

        assert!(store.get("A.C").await.unwrap().is_none());
        assert!(store.get("BUILD/A.C").await.unwrap().is_none());
    }
}
