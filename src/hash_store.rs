//! Content Hash Store: the ground truth for "has this document changed".
//!
//! Maps each document id to its history of `(content hash, version)`
//! records. The history is append-only: a new version never hides the
//! previous ones, so rollback and audit can still inspect them. A delete
//! appends a tombstoned record instead of removing anything.
//!
//! Writes are compare-and-swap on the version: [`ContentHashStore::put`]
//! only succeeds when the record's version is exactly one past the
//! latest stored version. Writers to different documents never contend.
//!
//! Two implementations are provided: [`MemoryHashStore`] for tests and
//! embedding in other processes, and [`SqliteHashStore`] for persisted
//! state.

use std::collections::HashMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use crate::error::{SyncError, SyncResult};
use crate::models::{DocumentId, DocumentRecord, SourceType};

#[async_trait]
pub trait ContentHashStore: Send + Sync {
    /// Latest record for a document, tombstoned or not.
    async fn get(&self, id: &DocumentId) -> SyncResult<Option<DocumentRecord>>;

    /// Append a record. Fails with [`SyncError::VersionConflict`] unless
    /// `record.version == latest_version + 1` (a first record has version 1).
    async fn put(&self, record: &DocumentRecord) -> SyncResult<()>;

    /// Every stored version of a document, oldest first.
    async fn history(&self, id: &DocumentId) -> SyncResult<Vec<DocumentRecord>>;

    /// Live (non-tombstoned) documents whose id starts with `prefix`.
    async fn live_ids(&self, prefix: &str) -> SyncResult<Vec<DocumentId>>;
}

/// The record that follows `prev` for new content.
pub fn next_record(
    id: &DocumentId,
    prev: Option<&DocumentRecord>,
    content_hash: &str,
    source_type: SourceType,
) -> DocumentRecord {
    DocumentRecord {
        id: id.clone(),
        content_hash: content_hash.to_string(),
        version: prev.map(|p| p.version).unwrap_or(0) + 1,
        source_type,
        last_synced_at: Utc::now(),
        tombstoned: false,
    }
}

/// The tombstone that follows `prev`.
pub fn tombstone_record(prev: &DocumentRecord) -> DocumentRecord {
    DocumentRecord {
        version: prev.version + 1,
        last_synced_at: Utc::now(),
        tombstoned: true,
        ..prev.clone()
    }
}

fn check_version(id: &DocumentId, latest: u64, record: &DocumentRecord) -> SyncResult<()> {
    if record.version != latest + 1 {
        return Err(SyncError::VersionConflict {
            document_id: id.clone(),
            expected: record.version.saturating_sub(1),
            found: latest,
        });
    }
    Ok(())
}

/// In-memory store backed by a `HashMap` behind a `RwLock`.
#[derive(Default)]
pub struct MemoryHashStore {
    records: RwLock<HashMap<DocumentId, Vec<DocumentRecord>>>,
}

impl MemoryHashStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentHashStore for MemoryHashStore {
    async fn get(&self, id: &DocumentId) -> SyncResult<Option<DocumentRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.get(id).and_then(|h| h.last().cloned()))
    }

    async fn put(&self, record: &DocumentRecord) -> SyncResult<()> {
        let mut records = self.records.write().unwrap();
        let history = records.entry(record.id.clone()).or_default();
        let latest = history.last().map(|r| r.version).unwrap_or(0);
        check_version(&record.id, latest, record)?;
        history.push(record.clone());
        Ok(())
    }

    async fn history(&self, id: &DocumentId) -> SyncResult<Vec<DocumentRecord>> {
        let records = self.records.read().unwrap();
        Ok(records.get(id).cloned().unwrap_or_default())
    }

    async fn live_ids(&self, prefix: &str) -> SyncResult<Vec<DocumentId>> {
        let records = self.records.read().unwrap();
        let mut ids: Vec<DocumentId> = records
            .iter()
            .filter(|(id, history)| {
                id.as_str().starts_with(prefix)
                    && history.last().map(|r| !r.tombstoned).unwrap_or(false)
            })
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        Ok(ids)
    }
}

/// SQLite-backed store over the `content_hashes` table.
pub struct SqliteHashStore {
    pool: SqlitePool,
}

impl SqliteHashStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> SyncResult<DocumentRecord> {
    let source_type: String = row.get("source_type");
    let synced_at: i64 = row.get("synced_at");
    let version: i64 = row.get("version");
    let tombstoned: i64 = row.get("tombstoned");
    Ok(DocumentRecord {
        id: DocumentId::new(row.get::<String, _>("document_id")),
        content_hash: row.get("content_hash"),
        version: version as u64,
        source_type: source_type.parse()?,
        last_synced_at: DateTime::from_timestamp(synced_at, 0).unwrap_or_default(),
        tombstoned: tombstoned != 0,
    })
}

#[async_trait]
impl ContentHashStore for SqliteHashStore {
    async fn get(&self, id: &DocumentId) -> SyncResult<Option<DocumentRecord>> {
        let row = sqlx::query(
            r#"
            SELECT document_id, version, content_hash, source_type, tombstoned, synced_at
            FROM content_hashes
            WHERE document_id = ?
            ORDER BY version DESC
            LIMIT 1
            "#,
        )
        .bind(id.as_str())
        .fetch_optional(&self.pool)
        .await?;

        row.as_ref().map(row_to_record).transpose()
    }

    async fn put(&self, record: &DocumentRecord) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        let latest: Option<i64> =
            sqlx::query_scalar("SELECT MAX(version) FROM content_hashes WHERE document_id = ?")
                .bind(record.id.as_str())
                .fetch_one(&mut *tx)
                .await?;
        check_version(&record.id, latest.unwrap_or(0) as u64, record)?;

        sqlx::query(
            r#"
            INSERT INTO content_hashes (document_id, version, content_hash, source_type, tombstoned, synced_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(record.id.as_str())
        .bind(record.version as i64)
        .bind(&record.content_hash)
        .bind(record.source_type.as_str())
        .bind(record.tombstoned as i64)
        .bind(record.last_synced_at.timestamp())
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn history(&self, id: &DocumentId) -> SyncResult<Vec<DocumentRecord>> {
        let rows = sqlx::query(
            r#"
            SELECT document_id, version, content_hash, source_type, tombstoned, synced_at
            FROM content_hashes
            WHERE document_id = ?
            ORDER BY version ASC
            "#,
        )
        .bind(id.as_str())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_record).collect()
    }

    async fn live_ids(&self, prefix: &str) -> SyncResult<Vec<DocumentId>> {
        let rows: Vec<String> = sqlx::query_scalar(
            r#"
            SELECT h.document_id
            FROM content_hashes h
            JOIN (
                SELECT document_id, MAX(version) AS v FROM content_hashes GROUP BY document_id
            ) latest ON latest.document_id = h.document_id AND latest.v = h.version
            WHERE h.tombstoned = 0 AND substr(h.document_id, 1, length(?)) = ?
            ORDER BY h.document_id
            "#,
        )
        .bind(prefix)
        .bind(prefix)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(DocumentId::new).collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn exercise(store: &dyn ContentHashStore) {
        let id = DocumentId::from("docs:a.md");
        assert!(store.get(&id).await.unwrap().is_none());

        let v1 = next_record(&id, None, "h1", SourceType::File);
        store.put(&v1).await.unwrap();
        let v2 = next_record(&id, Some(&v1), "h2", SourceType::File);
        store.put(&v2).await.unwrap();

        let latest = store.get(&id).await.unwrap().unwrap();
        assert_eq!(latest.version, 2);
        assert_eq!(latest.content_hash, "h2");

        // The prior version is still inspectable.
        let history = store.history(&id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].content_hash, "h1");

        // A stale writer loses the compare-and-swap.
        let stale = next_record(&id, Some(&v1), "h3", SourceType::File);
        match store.put(&stale).await {
            Err(SyncError::VersionConflict { found, .. }) => assert_eq!(found, 2),
            other => panic!("expected conflict, got {:?}", other),
        }

        assert_eq!(store.live_ids("docs:").await.unwrap(), vec![id.clone()]);
        store.put(&tombstone_record(&latest)).await.unwrap();
        assert!(store.live_ids("docs:").await.unwrap().is_empty());
        assert!(store.get(&id).await.unwrap().unwrap().tombstoned);
    }

    #[tokio::test]
    async fn memory_store_is_append_only_with_cas() {
        exercise(&MemoryHashStore::new()).await;
    }

    #[tokio::test]
    async fn sqlite_store_is_append_only_with_cas() {
        let tmp = tempfile::TempDir::new().unwrap();
        let pool = crate::db::connect_path(&tmp.path().join("kb.sqlite"))
            .await
            .unwrap();
        crate::migrate::migrate_pool(&pool).await.unwrap();
        exercise(&SqliteHashStore::new(pool)).await;
    }

    #[tokio::test]
    async fn live_ids_filters_by_prefix() {
        let store = MemoryHashStore::new();
        for id in ["docs:a", "docs:b", "wiki:c"] {
            let id = DocumentId::from(id);
            store
                .put(&next_record(&id, None, "h", SourceType::File))
                .await
                .unwrap();
        }
        let ids = store.live_ids("docs:").await.unwrap();
        assert_eq!(ids, vec![DocumentId::from("docs:a"), DocumentId::from("docs:b")]);
    }
}
