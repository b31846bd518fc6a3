//! Operator-facing persisted state: the dead-letter set, generation
//! history, the tombstone audit trail and regression alerts.

use std::collections::BTreeMap;
use std::sync::RwLock;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};
use uuid::Uuid;

use crate::error::{SyncError, SyncResult};
use crate::models::{
    Alert, DeadLetter, DocumentId, GenerationId, GenerationRecord, GenerationStatus,
    TombstoneRecord,
};

#[async_trait]
pub trait Ledger: Send + Sync {
    async fn park(&self, letter: &DeadLetter) -> SyncResult<()>;

    /// Oldest first.
    async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>>;

    /// Remove a dead letter, returning it for re-processing.
    async fn take_dead_letter(&self, id: Uuid) -> SyncResult<DeadLetter>;

    /// Record a generation. A live record supersedes its live parent.
    async fn record_generation(&self, record: &GenerationRecord) -> SyncResult<()>;

    async fn set_generation_status(
        &self,
        id: GenerationId,
        status: GenerationStatus,
    ) -> SyncResult<()>;

    /// Most recent first.
    async fn generations(&self, limit: usize) -> SyncResult<Vec<GenerationRecord>>;

    async fn record_tombstone(&self, record: &TombstoneRecord) -> SyncResult<()>;

    async fn tombstones(&self, id: Option<&DocumentId>) -> SyncResult<Vec<TombstoneRecord>>;

    async fn raise_alert(&self, alert: &Alert) -> SyncResult<()>;

    /// Most recent first.
    async fn alerts(&self) -> SyncResult<Vec<Alert>>;
}

#[derive(Default)]
struct LedgerState {
    dead_letters: Vec<DeadLetter>,
    generations: BTreeMap<GenerationId, GenerationRecord>,
    tombstones: Vec<TombstoneRecord>,
    alerts: Vec<Alert>,
}

#[derive(Default)]
pub struct MemoryLedger {
    state: RwLock<LedgerState>,
}

impl MemoryLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Ledger for MemoryLedger {
    async fn park(&self, letter: &DeadLetter) -> SyncResult<()> {
        self.state.write().unwrap().dead_letters.push(letter.clone());
        Ok(())
    }

    async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        Ok(self.state.read().unwrap().dead_letters.clone())
    }

    async fn take_dead_letter(&self, id: Uuid) -> SyncResult<DeadLetter> {
        let mut state = self.state.write().unwrap();
        let pos = state
            .dead_letters
            .iter()
            .position(|d| d.id == id)
            .ok_or_else(|| SyncError::NotFound {
                kind: "dead letter",
                id: id.to_string(),
            })?;
        Ok(state.dead_letters.remove(pos))
    }

    async fn record_generation(&self, record: &GenerationRecord) -> SyncResult<()> {
        let mut state = self.state.write().unwrap();
        if record.status == GenerationStatus::Live {
            if let Some(parent) = record.parent.and_then(|p| state.generations.get_mut(&p)) {
                if parent.status == GenerationStatus::Live {
                    parent.status = GenerationStatus::Superseded;
                }
            }
        }
        state.generations.insert(record.id, record.clone());
        Ok(())
    }

    async fn set_generation_status(
        &self,
        id: GenerationId,
        status: GenerationStatus,
    ) -> SyncResult<()> {
        let mut state = self.state.write().unwrap();
        match state.generations.get_mut(&id) {
            Some(g) => {
                g.status = status;
                Ok(())
            }
            None => Err(SyncError::NotFound {
                kind: "generation",
                id: id.to_string(),
            }),
        }
    }

    async fn generations(&self, limit: usize) -> SyncResult<Vec<GenerationRecord>> {
        let state = self.state.read().unwrap();
        Ok(state.generations.values().rev().take(limit).cloned().collect())
    }

    async fn record_tombstone(&self, record: &TombstoneRecord) -> SyncResult<()> {
        self.state.write().unwrap().tombstones.push(record.clone());
        Ok(())
    }

    async fn tombstones(&self, id: Option<&DocumentId>) -> SyncResult<Vec<TombstoneRecord>> {
        let state = self.state.read().unwrap();
        Ok(state
            .tombstones
            .iter()
            .filter(|t| id.map_or(true, |id| &t.document_id == id))
            .cloned()
            .collect())
    }

    async fn raise_alert(&self, alert: &Alert) -> SyncResult<()> {
        self.state.write().unwrap().alerts.push(alert.clone());
        Ok(())
    }

    async fn alerts(&self) -> SyncResult<Vec<Alert>> {
        let state = self.state.read().unwrap();
        Ok(state.alerts.iter().rev().cloned().collect())
    }
}

/// SQLite-backed ledger over the `dead_letters`, `generations`,
/// `tombstones` and `alerts` tables.
pub struct SqliteLedger {
    pool: SqlitePool,
}

impl SqliteLedger {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

fn ts(secs: i64) -> DateTime<Utc> {
    DateTime::from_timestamp(secs, 0).unwrap_or_default()
}

fn parse_uuid(s: &str) -> SyncResult<Uuid> {
    Uuid::parse_str(s).map_err(|e| SyncError::Other(e.into()))
}

fn to_json<T: serde::Serialize>(value: &T) -> SyncResult<String> {
    serde_json::to_string(value).map_err(|e| SyncError::Other(e.into()))
}

fn from_json<T: serde::de::DeserializeOwned>(s: &str) -> SyncResult<T> {
    serde_json::from_str(s).map_err(|e| SyncError::Other(e.into()))
}

fn row_to_dead_letter(row: &sqlx::sqlite::SqliteRow) -> SyncResult<DeadLetter> {
    let id: String = row.get("id");
    let event_json: String = row.get("event_json");
    let attempts: i64 = row.get("attempts");
    Ok(DeadLetter {
        id: parse_uuid(&id)?,
        document_id: DocumentId::new(row.get::<String, _>("document_id")),
        event: from_json(&event_json)?,
        reason: row.get("reason"),
        attempts: attempts as u32,
        failed_at: ts(row.get("failed_at")),
    })
}

fn row_to_generation(row: &sqlx::sqlite::SqliteRow) -> SyncResult<GenerationRecord> {
    let batch_id: Option<String> = row.get("batch_id");
    let documents_json: String = row.get("documents_json");
    let status: String = row.get("status");
    Ok(GenerationRecord {
        id: row.get::<i64, _>("id") as u64,
        parent: row.get::<Option<i64>, _>("parent").map(|p| p as u64),
        batch_id: batch_id.as_deref().map(parse_uuid).transpose()?,
        committed_at: ts(row.get("committed_at")),
        documents: from_json(&documents_json)?,
        upserts: row.get::<i64, _>("upserts") as usize,
        tombstones: row.get::<i64, _>("tombstones") as usize,
        status: status.parse()?,
    })
}

#[async_trait]
impl Ledger for SqliteLedger {
    async fn park(&self, letter: &DeadLetter) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO dead_letters (id, document_id, event_json, reason, attempts, failed_at)
            VALUES (?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(letter.id.to_string())
        .bind(letter.document_id.as_str())
        .bind(to_json(&letter.event)?)
        .bind(&letter.reason)
        .bind(letter.attempts as i64)
        .bind(letter.failed_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        let rows = sqlx::query(
            "SELECT id, document_id, event_json, reason, attempts, failed_at
             FROM dead_letters ORDER BY failed_at ASC, rowid ASC",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_dead_letter).collect()
    }

    async fn take_dead_letter(&self, id: Uuid) -> SyncResult<DeadLetter> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query(
            "SELECT id, document_id, event_json, reason, attempts, failed_at
             FROM dead_letters WHERE id = ?",
        )
        .bind(id.to_string())
        .fetch_optional(&mut *tx)
        .await?
        .ok_or_else(|| SyncError::NotFound {
            kind: "dead letter",
            id: id.to_string(),
        })?;
        let letter = row_to_dead_letter(&row)?;

        sqlx::query("DELETE FROM dead_letters WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;
        Ok(letter)
    }

    async fn record_generation(&self, record: &GenerationRecord) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;
        if let (Some(parent), GenerationStatus::Live) = (record.parent, record.status) {
            sqlx::query("UPDATE generations SET status = 'superseded' WHERE id = ? AND status = 'live'")
                .bind(parent as i64)
                .execute(&mut *tx)
                .await?;
        }
        sqlx::query(
            r#"
            INSERT INTO generations (id, parent, batch_id, committed_at, documents_json, upserts, tombstones, status)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(id) DO UPDATE SET status = excluded.status
            "#,
        )
        .bind(record.id as i64)
        .bind(record.parent.map(|p| p as i64))
        .bind(record.batch_id.map(|b| b.to_string()))
        .bind(record.committed_at.timestamp())
        .bind(to_json(&record.documents)?)
        .bind(record.upserts as i64)
        .bind(record.tombstones as i64)
        .bind(record.status.as_str())
        .execute(&mut *tx)
        .await?;
        tx.commit().await?;
        Ok(())
    }

    async fn set_generation_status(
        &self,
        id: GenerationId,
        status: GenerationStatus,
    ) -> SyncResult<()> {
        let result = sqlx::query("UPDATE generations SET status = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(id as i64)
            .execute(&self.pool)
            .await?;
        if result.rows_affected() == 0 {
            return Err(SyncError::NotFound {
                kind: "generation",
                id: id.to_string(),
            });
        }
        Ok(())
    }

    async fn generations(&self, limit: usize) -> SyncResult<Vec<GenerationRecord>> {
        let rows = sqlx::query(
            "SELECT id, parent, batch_id, committed_at, documents_json, upserts, tombstones, status
             FROM generations ORDER BY id DESC LIMIT ?",
        )
        .bind(limit as i64)
        .fetch_all(&self.pool)
        .await?;
        rows.iter().map(row_to_generation).collect()
    }

    async fn record_tombstone(&self, record: &TombstoneRecord) -> SyncResult<()> {
        sqlx::query(
            r#"
            INSERT INTO tombstones (document_id, version, chunk_ids_json, generation, recorded_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(document_id, version) DO NOTHING
            "#,
        )
        .bind(record.document_id.as_str())
        .bind(record.version as i64)
        .bind(to_json(&record.chunk_ids)?)
        .bind(record.generation as i64)
        .bind(record.recorded_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn tombstones(&self, id: Option<&DocumentId>) -> SyncResult<Vec<TombstoneRecord>> {
        let rows = match id {
            Some(id) => {
                sqlx::query(
                    "SELECT document_id, version, chunk_ids_json, generation, recorded_at
                     FROM tombstones WHERE document_id = ? ORDER BY version",
                )
                .bind(id.as_str())
                .fetch_all(&self.pool)
                .await?
            }
            None => {
                sqlx::query(
                    "SELECT document_id, version, chunk_ids_json, generation, recorded_at
                     FROM tombstones ORDER BY recorded_at, document_id",
                )
                .fetch_all(&self.pool)
                .await?
            }
        };

        rows.iter()
            .map(|row| {
                let chunk_ids: String = row.get("chunk_ids_json");
                Ok(TombstoneRecord {
                    document_id: DocumentId::new(row.get::<String, _>("document_id")),
                    version: row.get::<i64, _>("version") as u64,
                    chunk_ids: from_json(&chunk_ids)?,
                    generation: row.get::<i64, _>("generation") as u64,
                    recorded_at: ts(row.get("recorded_at")),
                })
            })
            .collect()
    }

    async fn raise_alert(&self, alert: &Alert) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO alerts (id, generation, restored_generation, detail, raised_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(alert.id.to_string())
        .bind(alert.generation as i64)
        .bind(alert.restored_generation as i64)
        .bind(&alert.detail)
        .bind(alert.raised_at.timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn alerts(&self) -> SyncResult<Vec<Alert>> {
        let rows = sqlx::query(
            "SELECT id, generation, restored_generation, detail, raised_at
             FROM alerts ORDER BY raised_at DESC, rowid DESC",
        )
        .fetch_all(&self.pool)
        .await?;

        rows.iter()
            .map(|row| {
                let id: String = row.get("id");
                Ok(Alert {
                    id: parse_uuid(&id)?,
                    generation: row.get::<i64, _>("generation") as u64,
                    restored_generation: row.get::<i64, _>("restored_generation") as u64,
                    detail: row.get("detail"),
                    raised_at: ts(row.get("raised_at")),
                })
            })
            .collect()
    }
}
