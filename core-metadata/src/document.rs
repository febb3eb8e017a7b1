//! # Metadata Documents
//!
//! One document per file or folder known to either replica, keyed by the
//! path identity.
//!
//! ## Overview
//!
//! Paths are relative to the sync root and use `/` as the separator. The
//! `sides` markers record the store revision each replica last reached: a
//! side whose marker is lower than the other's (or absent) is behind and is
//! the target of the next apply.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::MetadataError;

/// Store key derived from a path by a [`Normalizer`](crate::identity::Normalizer)
pub type Identity = String;

/// One of the two replicas
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SideName {
    Local,
    Remote,
}

impl SideName {
    pub fn as_str(&self) -> &'static str {
        match self {
            SideName::Local => "local",
            SideName::Remote => "remote",
        }
    }

    pub fn other(&self) -> SideName {
        match self {
            SideName::Local => SideName::Remote,
            SideName::Remote => SideName::Local,
        }
    }
}

impl fmt::Display for SideName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DocType {
    File,
    Folder,
}

impl DocType {
    pub fn as_str(&self) -> &'static str {
        match self {
            DocType::File => "file",
            DocType::Folder => "folder",
        }
    }
}

impl FromStr for DocType {
    type Err = MetadataError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "file" => Ok(DocType::File),
            "folder" => Ok(DocType::Folder),
            _ => Err(MetadataError::InvalidDocument(format!(
                "unknown doc type: {}",
                s
            ))),
        }
    }
}

/// Linkage to the document's remote counterpart
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteInfo {
    pub id: String,
    pub rev: String,
}

impl RemoteInfo {
    pub fn new(id: impl Into<String>, rev: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            rev: rev.into(),
        }
    }
}

/// Revision markers per side
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Sides {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote: Option<u64>,
}

impl Sides {
    pub fn get(&self, side: SideName) -> Option<u64> {
        match side {
            SideName::Local => self.local,
            SideName::Remote => self.remote,
        }
    }

    pub fn set(&mut self, side: SideName, rev: u64) {
        match side {
            SideName::Local => self.local = Some(rev),
            SideName::Remote => self.remote = Some(rev),
        }
    }

    pub fn clear(&mut self, side: SideName) {
        match side {
            SideName::Local => self.local = None,
            SideName::Remote => self.remote = None,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.local.is_none() && self.remote.is_none()
    }

    /// Both sides at `rev`
    pub fn converged(rev: u64) -> Self {
        Self {
            local: Some(rev),
            remote: Some(rev),
        }
    }
}

/// A metadata document
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub id: Identity,
    /// Store revision, absent before the first write
    #[serde(default)]
    pub rev: Option<u64>,
    pub path: String,
    pub doc_type: DocType,
    /// Base64-encoded MD5 of the content (files only)
    #[serde(default)]
    pub checksum: Option<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub creation_date: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modification: Option<DateTime<Utc>>,
    #[serde(default)]
    pub executable: bool,
    #[serde(default)]
    pub tags: Vec<String>,
    #[serde(default)]
    pub mime: Option<String>,
    #[serde(default)]
    pub remote: Option<RemoteInfo>,
    #[serde(default)]
    pub sides: Sides,
    /// On a tombstone: identity of the move destination
    #[serde(default)]
    pub move_to: Option<Identity>,
    /// On a move destination: the source as it was, until the move is applied
    #[serde(default)]
    pub move_from: Option<Box<Metadata>>,
    /// On a tombstone: moved along with an ancestor folder
    #[serde(default)]
    pub child_move: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub errors: u32,
}

impl Metadata {
    fn new(doc_type: DocType, path: impl Into<String>) -> Self {
        Self {
            id: String::new(),
            rev: None,
            path: path.into(),
            doc_type,
            checksum: None,
            size: None,
            creation_date: None,
            last_modification: None,
            executable: false,
            tags: Vec::new(),
            mime: None,
            remote: None,
            sides: Sides::default(),
            move_to: None,
            move_from: None,
            child_move: false,
            deleted: false,
            errors: 0,
        }
    }

    /// Bare file document; the identity is computed by the preparer
    pub fn file(path: impl Into<String>) -> Self {
        Self::new(DocType::File, path)
    }

    pub fn folder(path: impl Into<String>) -> Self {
        Self::new(DocType::Folder, path)
    }

    pub fn with_id(mut self, id: impl Into<Identity>) -> Self {
        self.id = id.into();
        self
    }

    pub fn with_checksum(mut self, checksum: impl Into<String>) -> Self {
        self.checksum = Some(checksum.into());
        self
    }

    pub fn with_size(mut self, size: u64) -> Self {
        self.size = Some(size);
        self
    }

    pub fn with_remote(mut self, remote: RemoteInfo) -> Self {
        self.remote = Some(remote);
        self
    }

    pub fn with_executable(mut self, executable: bool) -> Self {
        self.executable = executable;
        self
    }

    pub fn with_tags(mut self, tags: Vec<String>) -> Self {
        self.tags = tags;
        self
    }

    pub fn with_mime(mut self, mime: impl Into<String>) -> Self {
        self.mime = Some(mime.into());
        self
    }

    /// Sets both dates, truncated to whole seconds
    pub fn with_dates(mut self, created: DateTime<Utc>, modified: DateTime<Utc>) -> Self {
        self.creation_date = Some(created.trunc_subsecs(0));
        self.last_modification = Some(modified.trunc_subsecs(0));
        self
    }

    pub fn is_file(&self) -> bool {
        self.doc_type == DocType::File
    }

    pub fn is_folder(&self) -> bool {
        self.doc_type == DocType::Folder
    }

    /// Name component of the path
    pub fn name(&self) -> &str {
        basename(&self.path)
    }

    /// Whether `side` has reached the current revision
    pub fn is_up_to_date(&self, side: SideName) -> bool {
        self.rev.is_some() && self.sides.get(side) == self.rev
    }

    /// Whether `side` has seen at least the current revision
    pub fn is_at_least_up_to_date(&self, side: SideName) -> bool {
        self.sides.get(side).unwrap_or(0) >= self.rev.unwrap_or(0)
    }

    /// Record that `side` authored the next revision
    ///
    /// `prev` is the stored document, live or tombstone. Its markers carry
    /// over when this document brings none, unless it is a tombstone.
    pub fn mark_side(&mut self, side: SideName, prev: Option<&Metadata>) {
        let prev_rev = prev.and_then(|p| p.rev).unwrap_or(0);
        if let Some(prev) = prev {
            if self.sides.is_empty() && !prev.deleted {
                self.sides = prev.sides;
            }
        }
        self.sides.set(side, prev_rev + 1);
    }

    /// Turn this document into a tombstone
    pub fn mark_deleted(&mut self) {
        self.deleted = true;
        self.errors = 0;
    }
}

/// Same observable file state
pub fn same_file(one: &Metadata, two: &Metadata) -> bool {
    one.path == two.path
        && one.doc_type == two.doc_type
        && one.checksum == two.checksum
        && one.remote == two.remote
        && one.tags == two.tags
        && one.size == two.size
        && one.executable == two.executable
}

pub fn same_folder(one: &Metadata, two: &Metadata) -> bool {
    one.path == two.path
        && one.doc_type == two.doc_type
        && one.remote == two.remote
        && one.tags == two.tags
}

/// Same content, by checksum or else by remote linkage
pub fn same_binary(one: &Metadata, two: &Metadata) -> bool {
    if !one.is_file() || !two.is_file() {
        return false;
    }
    if one.checksum.is_some() && one.checksum == two.checksum {
        return true;
    }
    match (&one.remote, &two.remote) {
        (Some(a), Some(b)) if one.checksum.is_none() => a.id == b.id,
        _ => false,
    }
}

/// Parent of a relative `/`-separated path, `None` at the root
pub fn parent_path(path: &str) -> Option<&str> {
    path.rsplit_once('/').map(|(parent, _)| parent)
}

pub fn basename(path: &str) -> &str {
    path.rsplit('/').next().unwrap_or(path)
}

/// Whether `path` lies strictly under `folder`
pub fn is_descendant(path: &str, folder: &str) -> bool {
    if folder.is_empty() {
        return !path.is_empty();
    }
    path.len() > folder.len() + 1
        && path.starts_with(folder)
        && path.as_bytes()[folder.len()] == b'/'
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{TimeZone, Timelike};

    #[test]
    fn test_mark_side_copies_live_sides() {
        let mut prev = Metadata::file("a.txt").with_id("a.txt");
        prev.rev = Some(3);
        prev.sides = Sides::converged(3);

        let mut doc = Metadata::file("a.txt").with_id("a.txt");
        doc.mark_side(SideName::Local, Some(&prev));

        assert_eq!(doc.sides.local, Some(4));
        assert_eq!(doc.sides.remote, Some(3));
    }

    #[test]
    fn test_mark_side_on_tombstone_keeps_numbering() {
        let mut prev = Metadata::file("a.txt").with_id("a.txt");
        prev.rev = Some(5);
        prev.sides = Sides::converged(5);
        prev.deleted = true;

        let mut doc = Metadata::file("a.txt").with_id("a.txt");
        doc.mark_side(SideName::Remote, Some(&prev));

        assert_eq!(doc.sides.remote, Some(6));
        assert_eq!(doc.sides.local, None);
    }

    #[test]
    fn test_mark_side_without_prev() {
        let mut doc = Metadata::folder("docs");
        doc.mark_side(SideName::Local, None);
        assert_eq!(doc.sides, Sides { local: Some(1), remote: None });
    }

    #[test]
    fn test_same_binary() {
        let one = Metadata::file("a").with_checksum("abc");
        let two = Metadata::file("b").with_checksum("abc");
        assert!(same_binary(&one, &two));

        let linked = Metadata::file("a").with_remote(RemoteInfo::new("r1", "1-x"));
        let other = Metadata::file("a")
            .with_checksum("zzz")
            .with_remote(RemoteInfo::new("r1", "2-y"));
        assert!(same_binary(&linked, &other));
        assert!(!same_binary(&other, &one));
        assert!(!same_binary(&Metadata::folder("a"), &Metadata::folder("a")));
    }

    #[test]
    fn test_same_file_ignores_dates() {
        let at = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap();
        let one = Metadata::file("a").with_checksum("abc").with_size(3);
        let two = one.clone().with_dates(at, at);
        assert!(same_file(&one, &two));
        assert!(!same_file(&one, &two.clone().with_executable(true)));
    }

    #[test]
    fn test_with_dates_truncates() {
        let at = Utc.with_ymd_and_hms(2017, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::milliseconds(750);
        let doc = Metadata::file("a").with_dates(at, at);
        assert_eq!(doc.last_modification.unwrap().nanosecond(), 0);
    }

    #[test]
    fn test_path_helpers() {
        assert_eq!(parent_path("a/b/c.txt"), Some("a/b"));
        assert_eq!(parent_path("c.txt"), None);
        assert_eq!(basename("a/b/c.txt"), "c.txt");
        assert!(is_descendant("a/b", "a"));
        assert!(!is_descendant("ab/c", "a"));
        assert!(!is_descendant("a", "a"));
    }

    #[test]
    fn test_serde_roundtrip_keeps_move_from() {
        let mut src = Metadata::file("a").with_id("a");
        src.rev = Some(2);
        let mut doc = Metadata::file("b").with_id("b");
        doc.move_from = Some(Box::new(src));

        let json = serde_json::to_string(&doc).unwrap();
        let back: Metadata = serde_json::from_str(&json).unwrap();
        assert_eq!(back.move_from.unwrap().rev, Some(2));
    }
}
