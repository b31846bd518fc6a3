//! `kbsync` command implementations.
//!
//! Each command loads its own engine (or just the stores it reads) over
//! the persisted SQLite state, prints human output on stdout and exits.
//! The update queue lives in memory, so commands that enqueue work
//! drain it before returning.

use anyhow::{bail, Context, Result};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::engine::{RetryOutcome, SyncEngine};
use crate::ledger::{Ledger, SqliteLedger};
use crate::migrate;
use crate::models::{DocumentId, GenerationId, SourceType};
use crate::progress::ProgressMode;
use crate::queue::QueueDepth;
use crate::stats::{print_overview, IndexOverview, StatsSnapshot};
use crate::vector_store::{QueryFilter, SqliteVectorStore, VectorStore};

async fn open_engine(config: &Config, progress: ProgressMode) -> Result<SyncEngine> {
    SyncEngine::builder(config.clone())
        .progress(Arc::from(progress.reporter()))
        .build()
        .await
}

async fn open_ledger(config: &Config) -> Result<SqliteLedger> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    Ok(SqliteLedger::new(pool))
}

pub async fn run_init(config: &Config) -> Result<()> {
    migrate::run_migrations(config).await?;
    println!("Database initialized successfully.");
    Ok(())
}

/// `kbsync sync <source|all> [--full]`
pub async fn run_sync(config: &Config, target: &str, full: bool, progress: ProgressMode) -> Result<()> {
    // A full resync re-embeds everything, so it may switch embedding models.
    let engine = SyncEngine::builder(config.clone())
        .progress(Arc::from(progress.reporter()))
        .allow_model_change(full)
        .build()
        .await?;

    let reports = if target == "all" {
        engine.sync_all(full).await
    } else {
        vec![engine.sync(target, full).await?]
    };
    engine.run_until_idle().await?;

    for report in &reports {
        println!("sync {}{}", report.source, if full { " (full)" } else { "" });
        println!("  listed: {} items", report.listed);
        println!("  unchanged: {}", report.unchanged);
        println!("  changed: {}", report.changed);
        println!("  deleted: {}", report.deleted);
        if report.failed > 0 {
            println!("  unreadable: {}", report.failed);
        }
    }
    print_run_summary(&engine.stats(), engine.store().current_generation());

    engine.shutdown().await;
    println!("ok");
    Ok(())
}

/// `kbsync watch <source> --interval <secs>`; stops on Ctrl-C.
pub async fn run_watch(config: &Config, source: &str, interval_secs: u64, progress: ProgressMode) -> Result<()> {
    if interval_secs == 0 {
        bail!("--interval must be at least 1 second");
    }
    let engine = open_engine(config, progress).await?;
    println!("watching {} every {}s (Ctrl-C to stop)", source, interval_secs);

    let stop = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    engine
        .watch(source, Duration::from_secs(interval_secs), stop)
        .await?;

    print_run_summary(&engine.stats(), engine.store().current_generation());
    engine.shutdown().await;
    Ok(())
}

fn print_run_summary(stats: &StatsSnapshot, generation: GenerationId) {
    println!("  generations committed: {}", stats.generations);
    println!(
        "  chunks embedded: {} (reused {})",
        stats.chunks_embedded, stats.chunks_reused
    );
    if stats.rolled_back > 0 {
        println!("  rolled back: {}", stats.rolled_back);
    }
    if stats.dead_lettered > 0 {
        println!("  dead-lettered: {}", stats.dead_lettered);
    }
    println!("  live generation: {}", generation);
}

/// `kbsync query "<text>"`
pub async fn run_query(
    config: &Config,
    text: &str,
    source_type: Option<String>,
    category: Option<String>,
    limit: Option<usize>,
    generation: Option<GenerationId>,
) -> Result<()> {
    if text.trim().is_empty() {
        println!("No results.");
        return Ok(());
    }

    let filter = QueryFilter {
        source_type: source_type
            .as_deref()
            .map(str::parse::<SourceType>)
            .transpose()?,
        category,
        document_prefix: None,
    };
    let limit = limit.unwrap_or(config.quality.top_k);

    let engine = open_engine(config, ProgressMode::Off).await?;
    let result = match generation {
        Some(g) => engine.query_at(text, &filter, limit, g).await?,
        None => engine.query(text, &filter, limit).await?,
    };

    if result.hits.is_empty() {
        println!("No results.");
    }
    for (i, hit) in result.hits.iter().enumerate() {
        println!(
            "{}. [{:.2}] {}",
            i + 1,
            hit.score,
            hit.title.as_deref().unwrap_or("(untitled)")
        );
        println!("    document: {}", hit.document_id);
        println!("    excerpt: \"{}\"", excerpt(&hit.text, 160));
        println!("    chunk: {}", hit.chunk_id);
        println!();
    }
    println!("generation {}", result.generation);

    engine.shutdown().await;
    Ok(())
}

fn excerpt(text: &str, max_chars: usize) -> String {
    let flat = text.replace('\n', " ");
    let flat = flat.trim();
    match flat.char_indices().nth(max_chars) {
        Some((cut, _)) => format!("{}...", &flat[..cut]),
        None => flat.to_string(),
    }
}

/// `kbsync dead-letter list`
pub async fn run_dead_letter_list(config: &Config) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let letters = ledger.dead_letters().await?;
    if letters.is_empty() {
        println!("No dead letters.");
        return Ok(());
    }

    println!(
        "{:<36}  {:<32}  {:<7}  {:>8}  {:<16}  REASON",
        "ID", "DOCUMENT", "OP", "ATTEMPTS", "FAILED"
    );
    for letter in &letters {
        println!(
            "{:<36}  {:<32}  {:<7}  {:>8}  {:<16}  {}",
            letter.id,
            letter.document_id,
            letter.event.op,
            letter.attempts,
            letter.failed_at.format("%Y-%m-%d %H:%M"),
            letter.reason
        );
    }
    Ok(())
}

/// `kbsync dead-letter retry <id>`: re-enqueue and process it now.
pub async fn run_dead_letter_retry(config: &Config, id: &str, progress: ProgressMode) -> Result<()> {
    let id = Uuid::parse_str(id).with_context(|| format!("Invalid dead-letter id: {}", id))?;
    let engine = open_engine(config, progress).await?;

    match engine.retry_dead_letter(id).await? {
        RetryOutcome::Requeued => {
            engine.run_until_idle().await?;
            let stats = engine.stats();
            if stats.committed > 0 {
                println!("retried {}: committed", id);
            } else {
                println!("retried {}: failed again, see `kbsync dead-letter list`", id);
            }
        }
        RetryOutcome::Superseded => {
            println!("dropped {}: the document was updated since it failed", id);
        }
    }

    engine.shutdown().await;
    Ok(())
}

/// `kbsync generations`
pub async fn run_generations(config: &Config, limit: usize) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let generations = ledger.generations(limit).await?;
    if generations.is_empty() {
        println!("No generations committed yet.");
        return Ok(());
    }

    println!(
        "{:>6}  {:>6}  {:<12}  {:<16}  {:>9}  {:>7}  {:>10}",
        "GEN", "PARENT", "STATUS", "COMMITTED", "DOCUMENTS", "UPSERTS", "TOMBSTONES"
    );
    for g in &generations {
        println!(
            "{:>6}  {:>6}  {:<12}  {:<16}  {:>9}  {:>7}  {:>10}",
            g.id,
            g.parent.map(|p| p.to_string()).unwrap_or_else(|| "-".into()),
            g.status.as_str(),
            g.committed_at.format("%Y-%m-%d %H:%M"),
            g.documents.len(),
            g.upserts,
            g.tombstones
        );
    }
    Ok(())
}

/// `kbsync rollback <generation>`
pub async fn run_rollback(config: &Config, generation: GenerationId) -> Result<()> {
    let engine = open_engine(config, ProgressMode::Off).await?;
    let affected = engine.rollback_to(generation).await?;

    println!("rolled back to generation {}", generation);
    println!("  documents changed: {}", affected.len());
    for id in &affected {
        println!("    {}", id);
    }
    if !affected.is_empty() {
        println!("  the next sync re-examines these documents");
    }

    engine.shutdown().await;
    Ok(())
}

/// `kbsync alerts`
pub async fn run_alerts(config: &Config) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let alerts = ledger.alerts().await?;
    if alerts.is_empty() {
        println!("No alerts.");
        return Ok(());
    }
    for alert in &alerts {
        println!(
            "{}  generation {} rolled back to {}",
            alert.raised_at.format("%Y-%m-%d %H:%M"),
            alert.generation,
            alert.restored_generation
        );
        println!("    {}", alert.detail);
    }
    Ok(())
}

/// `kbsync tombstones [--document <id>]`
pub async fn run_tombstones(config: &Config, document: Option<String>) -> Result<()> {
    let ledger = open_ledger(config).await?;
    let document = document.map(DocumentId::from);
    let records = ledger.tombstones(document.as_ref()).await?;
    if records.is_empty() {
        println!("No tombstones.");
        return Ok(());
    }
    for t in &records {
        println!(
            "{}  {} v{}  generation {}  {} chunks",
            t.recorded_at.format("%Y-%m-%d %H:%M"),
            t.document_id,
            t.version,
            t.generation,
            t.chunk_ids.len()
        );
    }
    Ok(())
}

/// `kbsync stats`: reads persisted state only, no embedder needed.
pub async fn run_stats(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;
    migrate::migrate_pool(&pool).await?;
    let store = SqliteVectorStore::open(pool.clone(), config.quality.generation_history, None).await?;
    let ledger = SqliteLedger::new(pool.clone());

    let snapshot = store.snapshot();
    let overview = IndexOverview {
        generation: snapshot.generation,
        retained_generations: store.retained_generations(),
        documents: snapshot.documents("").len(),
        chunks: snapshot.len(),
        dead_letters: ledger.dead_letters().await?.len(),
        alerts: ledger.alerts().await?.len(),
        degraded: 0,
        last_commit: ledger.generations(1).await?.first().map(|g| g.committed_at),
        queue: QueueDepth::default(),
    };
    print_overview(&config.db.path, &overview, &StatsSnapshot::default());

    pool.close().await;
    Ok(())
}
