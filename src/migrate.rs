//! Idempotent schema creation for the persisted engine state.
//!
//! | Table | Contents |
//! |-------|----------|
//! | `content_hashes` | append-only document hash/version history |
//! | `dead_letters` | permanently failed change events |
//! | `generations` | generation history metadata |
//! | `tombstones` | delete audit trail |
//! | `alerts` | quality regression alerts |
//! | `index_chunks` | mirror of the live index generation |
//! | `index_meta` | the live generation pointer |
//! | `index_embedding` | model and dims the indexed vectors came from |
//! | `index_lineage` | parent of each retained generation |
//! | `index_undo` | chunks a generation replaced, to rebuild its parent |

use anyhow::Result;
use sqlx::SqlitePool;

use crate::config::Config;
use crate::db;

pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate_pool(&pool).await?;
    pool.close().await;
    Ok(())
}

pub async fn migrate_pool(pool: &SqlitePool) -> Result<()> {
    // Append-only: one row per (document, version)
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS content_hashes (
            document_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            content_hash TEXT NOT NULL,
            source_type TEXT NOT NULL,
            tombstoned INTEGER NOT NULL DEFAULT 0,
            synced_at INTEGER NOT NULL,
            PRIMARY KEY (document_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS dead_letters (
            id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            event_json TEXT NOT NULL,
            reason TEXT NOT NULL,
            attempts INTEGER NOT NULL,
            failed_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS generations (
            id INTEGER PRIMARY KEY,
            parent INTEGER,
            batch_id TEXT,
            committed_at INTEGER NOT NULL,
            documents_json TEXT NOT NULL DEFAULT '[]',
            upserts INTEGER NOT NULL,
            tombstones INTEGER NOT NULL,
            status TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS tombstones (
            document_id TEXT NOT NULL,
            version INTEGER NOT NULL,
            chunk_ids_json TEXT NOT NULL,
            generation INTEGER NOT NULL,
            recorded_at INTEGER NOT NULL,
            PRIMARY KEY (document_id, version)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS alerts (
            id TEXT PRIMARY KEY,
            generation INTEGER NOT NULL,
            restored_generation INTEGER NOT NULL,
            detail TEXT NOT NULL,
            raised_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_chunks (
            chunk_id TEXT PRIMARY KEY,
            document_id TEXT NOT NULL,
            chunk_index INTEGER NOT NULL,
            span_start INTEGER NOT NULL,
            span_end INTEGER NOT NULL,
            text TEXT NOT NULL,
            hash TEXT NOT NULL,
            source_type TEXT NOT NULL,
            category TEXT,
            title TEXT,
            embedding BLOB NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_meta (
            key TEXT PRIMARY KEY,
            value INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_embedding (
            id INTEGER PRIMARY KEY CHECK (id = 1),
            model TEXT NOT NULL,
            dims INTEGER NOT NULL,
            recorded_at TEXT NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_lineage (
            generation INTEGER PRIMARY KEY,
            parent INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    // present = 0: the chunk did not exist in the parent generation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS index_undo (
            generation INTEGER NOT NULL,
            chunk_id TEXT NOT NULL,
            present INTEGER NOT NULL,
            document_id TEXT,
            chunk_index INTEGER,
            span_start INTEGER,
            span_end INTEGER,
            text TEXT,
            hash TEXT,
            source_type TEXT,
            category TEXT,
            title TEXT,
            embedding BLOB,
            PRIMARY KEY (generation, chunk_id)
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_index_chunks_document ON index_chunks(document_id)")
        .execute(pool)
        .await?;
    sqlx::query("CREATE INDEX IF NOT EXISTS idx_dead_letters_document ON dead_letters(document_id)")
        .execute(pool)
        .await?;

    Ok(())
}
