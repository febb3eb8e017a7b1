//! SQLite-backed [`MetadataStore`]
//!
//! Tables:
//! - `documents`: current state per identity, tombstones included
//! - `revisions`: bodies from the older side marker onwards, for
//!   [`MetadataStore::get_revision`]
//! - `changes`: the feed, one row per identity at its latest sequence
//! - `cursors`: the local and remote sequence cursors

use async_trait::async_trait;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::document::Metadata;
use crate::error::{MetadataError, Result};
use crate::store::{Change, MetadataStore};

const LOCAL_SEQ: &str = "local_seq";
const REMOTE_SEQ: &str = "remote_seq";

pub struct SqliteMetadataStore {
    pool: SqlitePool,
    notifier: watch::Sender<i64>,
}

impl SqliteMetadataStore {
    /// Create a store on `pool`, creating the schema if needed
    pub async fn new(pool: SqlitePool) -> Result<Self> {
        let (notifier, _) = watch::channel(0);
        let store = Self { pool, notifier };
        store.initialize().await?;
        let last = store.last_seq().await?;
        store.notifier.send_replace(last);
        Ok(store)
    }

    /// Initialize database tables if they don't exist
    pub async fn initialize(&self) -> Result<()> {
        let statements = [
            r#"
            CREATE TABLE IF NOT EXISTS documents (
                id TEXT PRIMARY KEY,
                rev INTEGER NOT NULL,
                path TEXT NOT NULL,
                doc_type TEXT NOT NULL,
                checksum TEXT,
                remote_id TEXT,
                deleted INTEGER NOT NULL DEFAULT 0,
                body TEXT NOT NULL
            )
            "#,
            "CREATE INDEX IF NOT EXISTS idx_documents_checksum ON documents(checksum)",
            "CREATE INDEX IF NOT EXISTS idx_documents_remote_id ON documents(remote_id)",
            r#"
            CREATE TABLE IF NOT EXISTS revisions (
                id TEXT NOT NULL,
                rev INTEGER NOT NULL,
                body TEXT NOT NULL,
                PRIMARY KEY (id, rev)
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS changes (
                seq INTEGER PRIMARY KEY AUTOINCREMENT,
                id TEXT NOT NULL UNIQUE,
                rev INTEGER NOT NULL
            )
            "#,
            r#"
            CREATE TABLE IF NOT EXISTS cursors (
                name TEXT PRIMARY KEY,
                value TEXT NOT NULL
            )
            "#,
        ];

        for statement in statements {
            sqlx::query(statement)
                .execute(&self.pool)
                .await
                .map_err(|e| MetadataError::Database(e.to_string()))?;
        }

        Ok(())
    }

    async fn last_seq(&self) -> Result<i64> {
        let row = sqlx::query("SELECT COALESCE(MAX(seq), 0) AS seq FROM changes")
            .fetch_one(&self.pool)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;
        Ok(row.get("seq"))
    }

    /// Write `doc` inside `tx`, returning its new feed sequence
    async fn write(tx: &mut Transaction<'_, Sqlite>, doc: &mut Metadata) -> Result<i64> {
        if doc.id.is_empty() {
            return Err(MetadataError::InvalidDocument(format!(
                "document at {:?} has no identity",
                doc.path
            )));
        }

        let stored = sqlx::query("SELECT rev, deleted FROM documents WHERE id = ?")
            .bind(&doc.id)
            .fetch_optional(&mut **tx)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?
            .map(|row| (row.get::<i64, _>("rev") as u64, row.get::<bool, _>("deleted")));

        let new_rev = match (stored, doc.rev) {
            (None, None) => 1,
            (Some((rev, true)), None) => rev + 1,
            (Some((rev, _)), Some(expected)) if rev == expected => rev + 1,
            (stored, expected) => {
                return Err(MetadataError::Conflict {
                    id: doc.id.clone(),
                    expected,
                    found: stored.map(|(rev, _)| rev),
                })
            }
        };

        doc.rev = Some(new_rev);
        let body = serde_json::to_string(&*doc)?;
        let rev = new_rev as i64;

        sqlx::query(
            r#"
            INSERT INTO documents (id, rev, path, doc_type, checksum, remote_id, deleted, body)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET
                rev = excluded.rev,
                path = excluded.path,
                doc_type = excluded.doc_type,
                checksum = excluded.checksum,
                remote_id = excluded.remote_id,
                deleted = excluded.deleted,
                body = excluded.body
            "#,
        )
        .bind(&doc.id)
        .bind(rev)
        .bind(&doc.path)
        .bind(doc.doc_type.as_str())
        .bind(&doc.checksum)
        .bind(doc.remote.as_ref().map(|r| r.id.as_str()))
        .bind(doc.deleted)
        .bind(&body)
        .execute(&mut **tx)
        .await
        .map_err(|e| MetadataError::Database(e.to_string()))?;

        sqlx::query("INSERT OR REPLACE INTO revisions (id, rev, body) VALUES (?, ?, ?)")
            .bind(&doc.id)
            .bind(rev)
            .bind(&body)
            .execute(&mut **tx)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;

        // Only revisions a side may still diff against are kept
        let oldest_needed = doc.sides.local.unwrap_or(0).min(doc.sides.remote.unwrap_or(0));
        sqlx::query("DELETE FROM revisions WHERE id = ? AND rev < ?")
            .bind(&doc.id)
            .bind(oldest_needed as i64)
            .execute(&mut **tx)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;

        sqlx::query("DELETE FROM changes WHERE id = ?")
            .bind(&doc.id)
            .execute(&mut **tx)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;

        let seq = sqlx::query("INSERT INTO changes (id, rev) VALUES (?, ?)")
            .bind(&doc.id)
            .bind(rev)
            .execute(&mut **tx)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?
            .last_insert_rowid();

        debug!(id = %doc.id, rev = new_rev, seq, deleted = doc.deleted, "Wrote document");
        Ok(seq)
    }

    fn parse(row: &SqliteRow) -> Result<Metadata> {
        let body: String = row.get("body");
        Ok(serde_json::from_str(&body)?)
    }

    async fn fetch_docs(&self, sql: &str, binds: &[&str]) -> Result<Vec<Metadata>> {
        let mut query = sqlx::query(sql);
        for value in binds {
            query = query.bind(*value);
        }
        let rows = query
            .fetch_all(&self.pool)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;
        rows.iter().map(Self::parse).collect()
    }

    async fn cursor(&self, name: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM cursors WHERE name = ?")
            .bind(name)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;
        Ok(row.map(|row| row.get("value")))
    }

    async fn set_cursor(&self, name: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO cursors (name, value) VALUES (?, ?)
            ON CONFLICT(name) DO UPDATE SET value = excluded.value
            "#,
        )
        .bind(name)
        .bind(value)
        .execute(&self.pool)
        .await
        .map_err(|e| MetadataError::Database(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl MetadataStore for SqliteMetadataStore {
    async fn get(&self, id: &str) -> Result<Option<Metadata>> {
        Ok(self
            .fetch_docs(
                "SELECT body FROM documents WHERE id = ? AND deleted = 0",
                &[id],
            )
            .await?
            .pop())
    }

    async fn get_with_tombstone(&self, id: &str) -> Result<Option<Metadata>> {
        Ok(self
            .fetch_docs("SELECT body FROM documents WHERE id = ?", &[id])
            .await?
            .pop())
    }

    async fn put(&self, doc: &mut Metadata) -> Result<()> {
        self.bulk_put(std::slice::from_mut(doc)).await
    }

    async fn bulk_put(&self, docs: &mut [Metadata]) -> Result<()> {
        if docs.is_empty() {
            return Ok(());
        }
        let previous_revs: Vec<Option<u64>> = docs.iter().map(|d| d.rev).collect();

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;

        let mut last_seq = 0;
        for i in 0..docs.len() {
            match Self::write(&mut tx, &mut docs[i]).await {
                Ok(seq) => last_seq = seq,
                Err(err) => {
                    // Dropping the transaction rolls it back
                    for (doc, rev) in docs.iter_mut().zip(&previous_revs) {
                        doc.rev = *rev;
                    }
                    if err.is_conflict() {
                        debug!(id = %docs[i].id, error = %err, "Write rejected");
                    } else {
                        warn!(id = %docs[i].id, error = %err, "Write failed");
                    }
                    return Err(err);
                }
            }
        }

        if let Err(e) = tx.commit().await {
            for (doc, rev) in docs.iter_mut().zip(&previous_revs) {
                doc.rev = *rev;
            }
            return Err(MetadataError::Database(e.to_string()));
        }

        self.notifier.send_replace(last_seq);
        Ok(())
    }

    async fn by_checksum(&self, checksum: &str) -> Result<Vec<Metadata>> {
        self.fetch_docs(
            r#"
            SELECT body FROM documents
            WHERE checksum = ? AND deleted = 0 AND doc_type = 'file'
            ORDER BY id
            "#,
            &[checksum],
        )
        .await
    }

    async fn by_recursive_path(&self, folder_id: &str) -> Result<Vec<Metadata>> {
        if folder_id.is_empty() {
            return self.all_docs().await;
        }
        // '0' sorts right after '/', bounding the identities under the prefix
        let lower = format!("{folder_id}/");
        let upper = format!("{folder_id}0");
        self.fetch_docs(
            r#"
            SELECT body FROM documents
            WHERE id > ? AND id < ? AND deleted = 0
            ORDER BY id
            "#,
            &[&lower, &upper],
        )
        .await
    }

    async fn by_remote_id(&self, remote_id: &str) -> Result<Option<Metadata>> {
        Ok(self
            .fetch_docs(
                "SELECT body FROM documents WHERE remote_id = ? AND deleted = 0 LIMIT 1",
                &[remote_id],
            )
            .await?
            .pop())
    }

    async fn all_docs(&self) -> Result<Vec<Metadata>> {
        self.fetch_docs(
            "SELECT body FROM documents WHERE deleted = 0 ORDER BY id",
            &[],
        )
        .await
    }

    async fn get_revision(&self, id: &str, rev: u64) -> Result<Option<Metadata>> {
        let row = sqlx::query("SELECT body FROM revisions WHERE id = ? AND rev = ?")
            .bind(id)
            .bind(rev as i64)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| MetadataError::Database(e.to_string()))?;
        row.as_ref().map(Self::parse).transpose()
    }

    async fn local_seq(&self) -> Result<i64> {
        match self.cursor(LOCAL_SEQ).await? {
            Some(value) => value.parse().map_err(|_| {
                MetadataError::InvalidDocument(format!("corrupt local sequence: {}", value))
            }),
            None => Ok(0),
        }
    }

    async fn set_local_seq(&self, seq: i64) -> Result<()> {
        self.set_cursor(LOCAL_SEQ, &seq.to_string()).await
    }

    async fn remote_seq(&self) -> Result<String> {
        Ok(self
            .cursor(REMOTE_SEQ)
            .await?
            .unwrap_or_else(|| "0".to_string()))
    }

    async fn set_remote_seq(&self, seq: &str) -> Result<()> {
        self.set_cursor(REMOTE_SEQ, seq).await
    }

    async fn next_change(&self, since: i64) -> Result<Option<Change>> {
        let row = sqlx::query(
            r#"
            SELECT c.seq AS seq, d.body AS body
            FROM changes c
            JOIN documents d ON d.id = c.id
            WHERE c.seq > ?
            ORDER BY c.seq
            LIMIT 1
            "#,
        )
        .bind(since)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| MetadataError::Database(e.to_string()))?;

        match row {
            Some(row) => Ok(Some(Change {
                seq: row.get("seq"),
                doc: Self::parse(&row)?,
            })),
            None => Ok(None),
        }
    }

    fn subscribe(&self) -> watch::Receiver<i64> {
        self.notifier.subscribe()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::create_test_pool;
    use crate::document::{RemoteInfo, Sides};

    async fn store() -> SqliteMetadataStore {
        SqliteMetadataStore::new(create_test_pool().await.unwrap())
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_put_assigns_revisions() {
        let store = store().await;
        let mut doc = Metadata::file("a.txt").with_id("a.txt");

        store.put(&mut doc).await.unwrap();
        assert_eq!(doc.rev, Some(1));
        store.put(&mut doc).await.unwrap();
        assert_eq!(doc.rev, Some(2));

        let stored = store.get("a.txt").await.unwrap().unwrap();
        assert_eq!(stored.rev, Some(2));
    }

    #[tokio::test]
    async fn test_stale_revision_is_a_conflict() {
        let store = store().await;
        let mut doc = Metadata::file("a.txt").with_id("a.txt");
        store.put(&mut doc).await.unwrap();

        let mut stale = doc.clone();
        store.put(&mut doc).await.unwrap();

        let err = store.put(&mut stale).await.unwrap_err();
        assert!(matches!(
            err,
            MetadataError::Conflict {
                expected: Some(1),
                found: Some(2),
                ..
            }
        ));
        assert_eq!(stale.rev, Some(1));

        let mut fresh = Metadata::file("a.txt").with_id("a.txt");
        assert!(store.put(&mut fresh).await.unwrap_err().is_conflict());
    }

    #[tokio::test]
    async fn test_tombstone_then_recreate_continues_numbering() {
        let store = store().await;
        let mut doc = Metadata::file("a.txt").with_id("a.txt");
        store.put(&mut doc).await.unwrap();
        doc.mark_deleted();
        store.put(&mut doc).await.unwrap();

        assert!(store.get("a.txt").await.unwrap().is_none());
        assert!(store.get_with_tombstone("a.txt").await.unwrap().unwrap().deleted);

        let mut again = Metadata::file("a.txt").with_id("a.txt");
        store.put(&mut again).await.unwrap();
        assert_eq!(again.rev, Some(3));
    }

    #[tokio::test]
    async fn test_bulk_put_is_atomic() {
        let store = store().await;
        let mut existing = Metadata::file("b").with_id("b");
        store.put(&mut existing).await.unwrap();

        let mut docs = vec![
            Metadata::file("a").with_id("a"),
            Metadata::file("b").with_id("b"),
        ];
        assert!(store.bulk_put(&mut docs).await.is_err());
        assert_eq!(docs[0].rev, None);
        assert!(store.get("a").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_feed_keeps_latest_entry_per_identity() {
        let store = store().await;
        let mut a = Metadata::file("a").with_id("a");
        let mut b = Metadata::file("b").with_id("b");
        store.put(&mut a).await.unwrap();
        store.put(&mut b).await.unwrap();
        store.put(&mut a).await.unwrap();

        let first = store.next_change(0).await.unwrap().unwrap();
        assert_eq!(first.doc.id, "b");
        let second = store.next_change(first.seq).await.unwrap().unwrap();
        assert_eq!(second.doc.id, "a");
        assert_eq!(second.doc.rev, Some(2));
        assert!(store.next_change(second.seq).await.unwrap().is_none());
        assert_eq!(*store.subscribe().borrow(), second.seq);
    }

    #[tokio::test]
    async fn test_queries() {
        let store = store().await;
        let mut docs = vec![
            Metadata::folder("dir").with_id("dir"),
            Metadata::file("dir/a").with_id("dir/a").with_checksum("sum"),
            Metadata::folder("dir/sub").with_id("dir/sub"),
            Metadata::file("dir/sub/b")
                .with_id("dir/sub/b")
                .with_remote(RemoteInfo::new("r-b", "1-x")),
            Metadata::file("dir2").with_id("dir2").with_checksum("sum"),
        ];
        store.bulk_put(&mut docs).await.unwrap();

        let under: Vec<String> = store
            .by_recursive_path("dir")
            .await
            .unwrap()
            .into_iter()
            .map(|d| d.id)
            .collect();
        assert_eq!(under, vec!["dir/a", "dir/sub", "dir/sub/b"]);
        assert_eq!(store.by_recursive_path("").await.unwrap().len(), 5);

        assert_eq!(store.by_checksum("sum").await.unwrap().len(), 2);
        assert_eq!(
            store.by_remote_id("r-b").await.unwrap().unwrap().path,
            "dir/sub/b"
        );
    }

    #[tokio::test]
    async fn test_get_revision() {
        let store = store().await;
        let mut doc = Metadata::file("a").with_id("a").with_checksum("one");
        doc.sides = Sides::converged(0);
        store.put(&mut doc).await.unwrap();
        doc.checksum = Some("two".to_string());
        store.put(&mut doc).await.unwrap();

        let old = store.get_revision("a", 1).await.unwrap().unwrap();
        assert_eq!(old.checksum.as_deref(), Some("one"));
        assert!(store.get_revision("a", 7).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_revisions_behind_both_sides_are_pruned() {
        let store = store().await;
        let mut doc = Metadata::file("a").with_id("a").with_checksum("one");
        store.put(&mut doc).await.unwrap();
        doc.checksum = Some("two".to_string());
        store.put(&mut doc).await.unwrap();
        // Local sits at 2, remote never synced: nothing goes yet
        doc.sides.local = Some(2);
        doc.checksum = Some("three".to_string());
        store.put(&mut doc).await.unwrap();
        assert!(store.get_revision("a", 1).await.unwrap().is_some());

        doc.sides = Sides { local: Some(3), remote: Some(2) };
        doc.checksum = Some("four".to_string());
        store.put(&mut doc).await.unwrap();

        assert!(store.get_revision("a", 1).await.unwrap().is_none());
        let kept = store.get_revision("a", 2).await.unwrap().unwrap();
        assert_eq!(kept.checksum.as_deref(), Some("two"));
        assert!(store.get_revision("a", 3).await.unwrap().is_some());
        assert!(store.get_revision("a", 4).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_cursors() {
        let store = store().await;
        assert_eq!(store.local_seq().await.unwrap(), 0);
        assert_eq!(store.remote_seq().await.unwrap(), "0");

        store.set_local_seq(12).await.unwrap();
        store.set_remote_seq("42-abc").await.unwrap();
        assert_eq!(store.local_seq().await.unwrap(), 12);
        assert_eq!(store.remote_seq().await.unwrap(), "42-abc");
    }
}
