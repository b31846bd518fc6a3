//! Engine wiring and the operator interface.
//!
//! [`SyncEngine`] owns one instance of every component and connects them:
//!
//! ```text
//! Source ─▶ ChangeDetector ─▶ UpdateQueue ─▶ WorkerPool ─▶ SwapCoordinator ─▶ VectorStore
//!                 │                              │               │
//!                 └──── ContentHashStore ◀───────┴───────────────┤
//!                                                                └─▶ QualityGate / Ledger
//! ```
//!
//! Built with [`EngineBuilder`]: by default all state (hash store, ledger,
//! live index) is persisted in the SQLite database from `[db] path`;
//! [`EngineBuilder::in_memory`] keeps it in process for tests and dry
//! runs.

use std::cmp::max;
use std::collections::BTreeMap;
use std::future::Future;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use anyhow::{bail, Context, Result};
use serde::Serialize;
use sqlx::SqlitePool;
use tokio::time::{interval, sleep_until, Instant, MissedTickBehavior};
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::Config;
use crate::db;
use crate::detector::{ChangeDetector, DegradedDocument, ScanReport};
use crate::embedding::{create_embedder, embed_query, Embedder};
use crate::error::{SyncError, SyncResult};
use crate::hash_store::{ContentHashStore, MemoryHashStore, SqliteHashStore};
use crate::ledger::{Ledger, MemoryLedger, SqliteLedger};
use crate::migrate;
use crate::models::{
    Alert, ChangeEvent, DeadLetter, DocumentId, GenerationId, GenerationRecord, PriorityClass,
    TombstoneRecord,
};
use crate::progress::{NoProgress, SyncProgressEvent, SyncProgressReporter};
use crate::quality::{AcceptAll, CanaryGate, CanarySet, QualityGate, RollbackManager};
use crate::queue::UpdateQueue;
use crate::source::{FilesystemSource, Notification, Source};
use crate::stats::{EngineStats, IndexOverview, StatsSnapshot};
use crate::swap::SwapCoordinator;
use crate::vector_store::{
    EmbeddingStamp, MemoryVectorStore, QueryFilter, SearchHit, SqliteVectorStore, VectorStore,
};
use crate::worker::{WorkerContext, WorkerPool};

/// Configures and builds a [`SyncEngine`].
pub struct EngineBuilder {
    config: Config,
    embedder: Option<Arc<dyn Embedder>>,
    gate: Option<Arc<dyn QualityGate>>,
    progress: Arc<dyn SyncProgressReporter>,
    persistent: bool,
    allow_model_change: bool,
}

impl EngineBuilder {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            embedder: None,
            gate: None,
            progress: Arc::new(NoProgress),
            persistent: true,
            allow_model_change: false,
        }
    }

    /// Use this embedder instead of the configured provider.
    pub fn embedder(mut self, embedder: Arc<dyn Embedder>) -> Self {
        self.embedder = Some(embedder);
        self
    }

    /// Use this gate instead of canary evaluation.
    pub fn gate(mut self, gate: Arc<dyn QualityGate>) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn progress(mut self, progress: Arc<dyn SyncProgressReporter>) -> Self {
        self.progress = progress;
        self
    }

    /// Accept an embedder other than the one the persisted index was built
    /// with. Meant for full resyncs, which re-embed every document; until
    /// one finishes the index mixes both models.
    pub fn allow_model_change(mut self, allow: bool) -> Self {
        self.allow_model_change = allow;
        self
    }

    /// Keep hash store, ledger and index in memory.
    pub fn in_memory(mut self) -> Self {
        self.persistent = false;
        self
    }

    pub async fn build(self) -> Result<SyncEngine> {
        let config = self.config;
        config.validate()?;

        let embedder: Arc<dyn Embedder> = match self.embedder {
            Some(embedder) => embedder,
            None => {
                if !config.embedding.is_enabled() {
                    bail!(
                        "Embedding provider is 'disabled'. Set [embedding] provider to hash, openai or ollama."
                    );
                }
                Arc::from(create_embedder(&config.embedding)?)
            }
        };
        let dims = Some(embedder.dims());
        let history = config.quality.generation_history;
        let stamp = EmbeddingStamp {
            model: embedder.model_name().to_string(),
            dims: embedder.dims(),
        };
        let mut model_changed = false;

        let (pool, hashes, ledger, store): (
            Option<SqlitePool>,
            Arc<dyn ContentHashStore>,
            Arc<dyn Ledger>,
            Arc<dyn VectorStore>,
        ) = if self.persistent {
            let pool = db::connect(&config).await?;
            migrate::migrate_pool(&pool).await?;
            let store = SqliteVectorStore::open(pool.clone(), history, dims)
                .await
                .context("Failed to load the live index")?;
            match store.embedding_stamp().await? {
                Some(recorded) if recorded == stamp => {}
                Some(recorded) => {
                    if !self.allow_model_change {
                        bail!(
                            "Index was embedded with {} but [embedding] now uses {}. \
                             Run `kbsync sync <source> --full` to re-embed every document.",
                            recorded,
                            stamp
                        );
                    }
                    warn!(from = %recorded, to = %stamp, "embedding model changed, re-embedding");
                    model_changed = true;
                    store.record_embedding_stamp(&stamp).await?;
                }
                None => store.record_embedding_stamp(&stamp).await?,
            }
            (
                Some(pool.clone()),
                Arc::new(SqliteHashStore::new(pool.clone())),
                Arc::new(SqliteLedger::new(pool)),
                Arc::new(store),
            )
        } else {
            (
                None,
                Arc::new(MemoryHashStore::new()),
                Arc::new(MemoryLedger::new()),
                Arc::new(MemoryVectorStore::new(history, dims)),
            )
        };

        let queue = Arc::new(UpdateQueue::new(&config.scheduler));
        let stats = Arc::new(EngineStats::default());
        let canaries = Arc::new(CanarySet::from_config(&config.quality));
        // Canary results from two different vector spaces are not comparable.
        let gate: Arc<dyn QualityGate> = match self.gate {
            Some(gate) => gate,
            None if model_changed => {
                warn!("quality gate disabled while the index is re-embedded");
                Arc::new(AcceptAll)
            }
            None => Arc::new(CanaryGate::new(
                embedder.clone(),
                canaries.clone(),
                &config.quality,
            )),
        };
        let swap = Arc::new(SwapCoordinator::new(
            store.clone(),
            hashes.clone(),
            ledger.clone(),
            gate,
            queue.clone(),
        ));
        let rollbacks = Arc::new(RollbackManager::new(
            queue.clone(),
            ledger.clone(),
            config.quality.max_rollbacks_per_document,
        ));
        let detector = Arc::new(ChangeDetector::new(
            hashes.clone(),
            store.clone(),
            queue.clone(),
            stats.clone(),
            config.detector.clone(),
            config.classifier.clone(),
            config.chunking.max_tokens,
        ));
        let worker_ctx = Arc::new(WorkerContext {
            queue: queue.clone(),
            store: store.clone(),
            hashes: hashes.clone(),
            ledger: ledger.clone(),
            embedder: embedder.clone(),
            swap: swap.clone(),
            rollbacks,
            stats: stats.clone(),
            workers: config.workers.clone(),
            embedding: config.embedding.clone(),
            rules: config.classifier.clone(),
            max_tokens: config.chunking.max_tokens,
            progress: self.progress.clone(),
        });

        let mut sources: BTreeMap<String, Arc<dyn Source>> = BTreeMap::new();
        for (name, fs_config) in &config.sources.filesystem {
            let source = FilesystemSource::new(name, fs_config)
                .with_context(|| format!("Invalid filesystem source '{}'", name))?;
            sources.insert(name.clone(), Arc::new(source));
        }

        info!(
            generation = store.current_generation(),
            model = embedder.model_name(),
            sources = sources.len(),
            persistent = pool.is_some(),
            "engine ready"
        );

        Ok(SyncEngine {
            config,
            pool,
            queue,
            store,
            hashes,
            ledger,
            embedder,
            detector,
            swap,
            canaries,
            stats,
            progress: self.progress,
            worker_ctx,
            workers: tokio::sync::Mutex::new(None),
            sources: RwLock::new(sources),
        })
    }
}

/// Result of a query: the generation it was answered from and the hits.
#[derive(Debug, Clone, Serialize)]
pub struct QueryResult {
    pub generation: GenerationId,
    pub hits: Vec<SearchHit>,
}

/// What happened to a retried dead letter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryOutcome {
    /// Re-enqueued at high priority.
    Requeued,
    /// Newer work for the document already exists; the letter was dropped.
    Superseded,
}

pub struct SyncEngine {
    config: Config,
    pool: Option<SqlitePool>,
    queue: Arc<UpdateQueue>,
    store: Arc<dyn VectorStore>,
    hashes: Arc<dyn ContentHashStore>,
    ledger: Arc<dyn Ledger>,
    embedder: Arc<dyn Embedder>,
    detector: Arc<ChangeDetector>,
    swap: Arc<SwapCoordinator>,
    canaries: Arc<CanarySet>,
    stats: Arc<EngineStats>,
    progress: Arc<dyn SyncProgressReporter>,
    worker_ctx: Arc<WorkerContext>,
    workers: tokio::sync::Mutex<Option<WorkerPool>>,
    sources: RwLock<BTreeMap<String, Arc<dyn Source>>>,
}

impl SyncEngine {
    /// Persistent engine with the configured embedder and canary gate.
    pub async fn open(config: Config) -> Result<Self> {
        EngineBuilder::new(config).build().await
    }

    pub fn builder(config: Config) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &UpdateQueue {
        &self.queue
    }

    pub fn store(&self) -> &dyn VectorStore {
        self.store.as_ref()
    }

    pub fn hashes(&self) -> &dyn ContentHashStore {
        self.hashes.as_ref()
    }

    pub fn canaries(&self) -> &CanarySet {
        &self.canaries
    }

    // ── Sources ──────────────────────────────────────────────────────

    /// Register a source, replacing any source with the same name.
    pub fn add_source(&self, source: Arc<dyn Source>) {
        let name = source.name().to_string();
        if self
            .sources
            .write()
            .unwrap()
            .insert(name.clone(), source)
            .is_some()
        {
            warn!(source = %name, "replaced existing source");
        }
    }

    pub fn source_names(&self) -> Vec<String> {
        self.sources.read().unwrap().keys().cloned().collect()
    }

    fn source(&self, name: &str) -> SyncResult<Arc<dyn Source>> {
        self.sources
            .read()
            .unwrap()
            .get(name)
            .cloned()
            .ok_or_else(|| SyncError::NotFound {
                kind: "source",
                id: name.to_string(),
            })
    }

    // ── Detection ────────────────────────────────────────────────────

    /// Scan a source. Observations stay in the debounce buffer until
    /// their window closes; see [`flush_due`](Self::flush_due).
    pub async fn scan(&self, name: &str, full: bool) -> SyncResult<ScanReport> {
        let source = self.source(name)?;
        self.progress.report(SyncProgressEvent::Scanning {
            source: name.to_string(),
        });
        let report = if full {
            self.detector.resync(source.as_ref()).await?
        } else {
            self.detector.scan(source.as_ref()).await?
        };
        self.progress.report(SyncProgressEvent::Scanned {
            source: name.to_string(),
            listed: report.listed as u64,
            changed: report.changed as u64,
            deleted: report.deleted as u64,
            failed: report.failed as u64,
        });
        Ok(report)
    }

    /// Scan a source and enqueue every observation without waiting for
    /// its debounce window. Does not start the workers: under the `block`
    /// policy a scan with more changes than the queue holds waits for a
    /// worker to free space. Use [`sync`](Self::sync) unless the pending
    /// events are to be inspected first.
    pub async fn detect(&self, name: &str, full: bool) -> SyncResult<ScanReport> {
        let report = self.scan(name, full).await?;
        self.detector.flush_all().await?;
        Ok(report)
    }

    /// One-shot sync of a source: start the workers, then scan and
    /// enqueue every observation. Pair with
    /// [`run_until_idle`](Self::run_until_idle) to wait for the commits.
    pub async fn sync(&self, name: &str, full: bool) -> SyncResult<ScanReport> {
        self.start_workers().await;
        self.detect(name, full).await
    }

    /// Forced full resync: every document is re-read and re-embedded,
    /// and live documents missing from the source are deleted.
    pub async fn resync(&self, name: &str) -> SyncResult<ScanReport> {
        self.sync(name, true).await
    }

    /// Sync every registered source. A source whose listing fails is
    /// logged and skipped.
    pub async fn sync_all(&self, full: bool) -> Vec<ScanReport> {
        let mut reports = Vec::new();
        for name in self.source_names() {
            match self.sync(&name, full).await {
                Ok(report) => reports.push(report),
                Err(e) => warn!(source = %name, error = %e, "source sync failed"),
            }
        }
        reports
    }

    /// Handle a push notification from a registered source.
    pub async fn notify(&self, source: &str, note: Notification) -> SyncResult<bool> {
        let source = self.source(source)?;
        self.detector.notify(source.as_ref(), note).await
    }

    /// Enqueue observations whose debounce window has closed.
    pub async fn flush_due(&self) -> SyncResult<usize> {
        self.detector.flush_due().await
    }

    pub fn degraded(&self) -> Vec<DegradedDocument> {
        self.detector.degraded()
    }

    // ── Workers ──────────────────────────────────────────────────────

    pub async fn start_workers(&self) {
        let mut workers = self.workers.lock().await;
        if workers.is_none() {
            let size = self.config.workers.pool_size;
            info!(size, "starting workers");
            *workers = Some(WorkerPool::spawn(self.worker_ctx.clone(), size));
        }
    }

    /// Flush buffered observations and wait until the queue has no
    /// pending, in-flight or deferred work and the detector holds no
    /// event a full queue turned away. Starts the workers if needed.
    pub async fn run_until_idle(&self) -> SyncResult<()> {
        self.start_workers().await;
        loop {
            self.detector.flush_all().await?;
            self.wait_idle().await;
            let held = self.detector.held();
            if held == 0 {
                return Ok(());
            }
            info!(held, "re-admitting events turned away by a full queue");
        }
    }

    async fn wait_idle(&self) {
        let idle = self.queue.wait_idle();
        tokio::pin!(idle);
        let mut ticker = interval(Duration::from_secs(1));
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = &mut idle => return,
                _ = ticker.tick() => {
                    let depth = self.queue.depth();
                    let pending = depth.critical + depth.high + depth.medium + depth.low + depth.deferred;
                    self.progress.report(SyncProgressEvent::Draining {
                        pending: pending as u64,
                        in_flight: depth.in_flight as u64,
                    });
                }
            }
        }
    }

    /// Poll a source every `every` until `stop` resolves, enqueueing
    /// observations as their debounce windows close. Remaining work is
    /// drained before returning.
    pub async fn watch(&self, name: &str, every: Duration, stop: impl Future<Output = ()>) -> SyncResult<()> {
        self.source(name)?;
        self.start_workers().await;
        tokio::pin!(stop);
        let mut ticker = interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            let deadline = self.detector.next_deadline();
            tokio::select! {
                _ = &mut stop => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.scan(name, false).await {
                        warn!(source = %name, error = %e, "scan failed; retrying next interval");
                    }
                }
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => {}
            }
            self.detector.flush_due().await?;
        }

        info!(source = %name, "watch stopped; draining queue");
        self.run_until_idle().await
    }

    /// Close the queue and wait for the workers to finish their batches.
    pub async fn shutdown(&self) {
        self.queue.close();
        if let Some(pool) = self.workers.lock().await.take() {
            pool.join().await;
        }
        if let Some(pool) = &self.pool {
            pool.close().await;
        }
    }

    // ── Queries ──────────────────────────────────────────────────────

    /// Answer a query from the generation live when the call started.
    /// The query text joins the rolling canary sample.
    pub async fn query(&self, text: &str, filter: &QueryFilter, limit: usize) -> SyncResult<QueryResult> {
        let snapshot = self.store.snapshot();
        let vector = embed_query(self.embedder.as_ref(), text).await?;
        let hits = snapshot.search(&vector, filter, limit);
        self.canaries.record_query(text);
        Ok(QueryResult {
            generation: snapshot.generation,
            hits,
        })
    }

    /// Query a retained generation.
    pub async fn query_at(
        &self,
        text: &str,
        filter: &QueryFilter,
        limit: usize,
        generation: GenerationId,
    ) -> SyncResult<QueryResult> {
        let vector = embed_query(self.embedder.as_ref(), text).await?;
        let hits = self.store.query(&vector, filter, Some(generation), limit).await?;
        Ok(QueryResult { generation, hits })
    }

    // ── Operator interface ───────────────────────────────────────────

    pub async fn dead_letters(&self) -> SyncResult<Vec<DeadLetter>> {
        self.ledger.dead_letters().await
    }

    /// Take a dead letter out of the set and re-enqueue its event at high
    /// priority or above. Dropped instead when newer work for the
    /// document is already queued or committed.
    pub async fn retry_dead_letter(&self, id: Uuid) -> SyncResult<RetryOutcome> {
        let letter = self.ledger.take_dead_letter(id).await?;
        let doc = &letter.document_id;

        if self.queue.pending().iter().any(|e| &e.document_id == doc) {
            self.queue.raise_priority(doc, PriorityClass::High);
            info!(document_id = %doc, "dead letter superseded by queued work");
            return Ok(RetryOutcome::Superseded);
        }
        if self.queue.is_superseded(doc) {
            info!(document_id = %doc, "dead letter superseded by deferred work");
            return Ok(RetryOutcome::Superseded);
        }
        if let Some(record) = self.hashes.get(doc).await? {
            if record.last_synced_at > letter.failed_at {
                info!(document_id = %doc, version = record.version, "dead letter superseded by a later sync");
                return Ok(RetryOutcome::Superseded);
            }
        }

        let event = ChangeEvent {
            id: Uuid::new_v4(),
            sequence: self.queue.next_sequence(),
            priority: max(letter.event.priority, PriorityClass::High),
            rollbacks: 0,
            ..letter.event.clone()
        };
        if let Err(e) = self.queue.enqueue(event).await {
            self.ledger.park(&letter).await?;
            return Err(e);
        }
        info!(document_id = %doc, "dead letter re-enqueued");
        Ok(RetryOutcome::Requeued)
    }

    /// Change the class of a document's pending event.
    pub fn override_priority(&self, id: &DocumentId, class: PriorityClass) -> SyncResult<()> {
        if self.queue.override_priority(id, class) {
            info!(document_id = %id, priority = %class, "priority overridden");
            Ok(())
        } else {
            Err(SyncError::NotFound {
                kind: "pending event",
                id: id.to_string(),
            })
        }
    }

    /// Make a retained generation live again. Returns the documents whose
    /// live content changed; they are re-examined on the next scan.
    pub async fn rollback_to(&self, generation: GenerationId) -> SyncResult<Vec<DocumentId>> {
        self.swap.rollback_to(generation).await
    }

    pub async fn generations(&self, limit: usize) -> SyncResult<Vec<GenerationRecord>> {
        self.ledger.generations(limit).await
    }

    pub async fn alerts(&self) -> SyncResult<Vec<Alert>> {
        self.ledger.alerts().await
    }

    pub async fn tombstones(&self, id: Option<&DocumentId>) -> SyncResult<Vec<TombstoneRecord>> {
        self.ledger.tombstones(id).await
    }

    pub fn pending(&self) -> Vec<ChangeEvent> {
        self.queue.pending()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub async fn overview(&self) -> SyncResult<IndexOverview> {
        let snapshot = self.store.snapshot();
        Ok(IndexOverview {
            generation: snapshot.generation,
            retained_generations: self.store.retained_generations(),
            documents: snapshot.documents("").len(),
            chunks: snapshot.len(),
            dead_letters: self.ledger.dead_letters().await?.len(),
            alerts: self.ledger.alerts().await?.len(),
            degraded: self.detector.degraded().len(),
            last_commit: self
                .ledger
                .generations(1)
                .await?
                .first()
                .map(|g| g.committed_at),
            queue: self.queue.depth(),
        })
    }
}
