//! # Metadata Store Module
//!
//! Durable record of every file and folder known to either replica.
//!
//! ## Overview
//!
//! This module handles:
//! - The metadata document model and its comparison helpers
//! - Path identities (case and Unicode normalization per platform)
//! - Content checksums (base64 MD5)
//! - A SQLite-backed store with optimistic revisions and a change feed
//!
//! Every write to the store appends to the change feed, which the sync
//! engine consumes in sequence order.

pub mod checksum;
pub mod db;
pub mod document;
pub mod error;
pub mod identity;
pub mod sqlite;
pub mod store;

pub use checksum::{checksum_of, compute_checksum};
pub use db::{create_pool, DatabaseConfig};
pub use document::{
    basename, is_descendant, parent_path, same_binary, same_file, same_folder, DocType, Identity,
    Metadata, RemoteInfo, SideName, Sides,
};
pub use error::{MetadataError, Result};
pub use identity::{platform_normalizer, CaseInsensitive, CaseSensitive, Normalizer, UppercaseOnly};
pub use sqlite::SqliteMetadataStore;
pub use store::{Change, MetadataStore};
