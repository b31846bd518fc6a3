//! End-to-end tests of the engine API over a SQLite database in a temp dir.

use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;

use kb_sync::config::{Config, FullPolicy};
use kb_sync::embedding::{Embedder, HashEmbedder, ItemEmbedding};
use kb_sync::engine::SyncEngine;
use kb_sync::error::SyncResult;
use kb_sync::hash_store::ContentHashStore;
use kb_sync::models::{DocumentId, GenerationStatus, Impact, PriorityClass, SourceItem, SourceType};
use kb_sync::quality::{AcceptAll, QualityGate, QualityReport};
use kb_sync::source::{Source, SourceListing};
use kb_sync::vector_store::{QueryFilter, Snapshot, VectorStore};

/// In-memory source whose documents the test edits directly.
#[derive(Default)]
struct MemSource {
    docs: Mutex<BTreeMap<String, String>>,
}

impl MemSource {
    fn set(&self, key: &str, body: &str) {
        self.docs
            .lock()
            .unwrap()
            .insert(key.to_string(), body.to_string());
    }

    fn remove(&self, key: &str) {
        self.docs.lock().unwrap().remove(key);
    }
}

#[async_trait]
impl Source for MemSource {
    fn name(&self) -> &str {
        "mem"
    }

    fn source_type(&self) -> SourceType {
        SourceType::File
    }

    async fn list(&self) -> anyhow::Result<Vec<SourceListing>> {
        Ok(self
            .docs
            .lock()
            .unwrap()
            .keys()
            .map(|key| SourceListing {
                document_id: DocumentId::for_source("mem", key),
                updated_at: Utc::now(),
                content_hash: None,
            })
            .collect())
    }

    async fn fetch(&self, id: &DocumentId) -> anyhow::Result<SourceItem> {
        let key = id.as_str().trim_start_matches("mem:");
        let body = self
            .docs
            .lock()
            .unwrap()
            .get(key)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("{} is gone", id))?;
        Ok(SourceItem {
            document_id: id.clone(),
            source_type: SourceType::File,
            category: None,
            title: Some(key.to_string()),
            updated_at: Utc::now(),
            body,
        })
    }
}

/// Rejects every text containing "poison".
struct Picky(HashEmbedder);

#[async_trait]
impl Embedder for Picky {
    fn model_name(&self) -> &str {
        "picky"
    }

    fn dims(&self) -> usize {
        self.0.dims()
    }

    async fn embed(&self, texts: &[String]) -> SyncResult<Vec<ItemEmbedding>> {
        Ok(texts
            .iter()
            .map(|t| {
                if t.contains("poison") {
                    Err("content policy violation".to_string())
                } else {
                    Ok(self.0.embed_one(t))
                }
            })
            .collect())
    }
}

/// Gate that regresses every commit while switched on.
#[derive(Default)]
struct Switch(AtomicBool);

#[async_trait]
impl QualityGate for Switch {
    async fn evaluate(&self, previous: &Snapshot, candidate: &Snapshot) -> SyncResult<QualityReport> {
        let regressed = self.0.load(Ordering::SeqCst);
        Ok(QualityReport {
            previous: previous.generation,
            candidate: candidate.generation,
            canaries: 1,
            mean_overlap: if regressed { 0.0 } else { 1.0 },
            mean_score_drop: if regressed { 1.0 } else { 0.0 },
            regressed,
            detail: "forced".to_string(),
        })
    }
}

fn config(tmp: &TempDir) -> Config {
    let mut config = Config::with_db_path(tmp.path().join("kb.sqlite"));
    // 32 characters per chunk: every paragraph below is its own chunk.
    config.chunking.max_tokens = 8;
    config.workers.collect_timeout_ms = 20;
    config.workers.embed_backoff_ms = 10;
    config.workers.embed_backoff_cap_ms = 20;
    config
}

async fn engine_with(
    tmp: &TempDir,
    source: Arc<MemSource>,
    embedder: Arc<dyn Embedder>,
    gate: Arc<dyn QualityGate>,
) -> SyncEngine {
    build(config(tmp), source, embedder, gate).await
}

async fn build(
    config: Config,
    source: Arc<MemSource>,
    embedder: Arc<dyn Embedder>,
    gate: Arc<dyn QualityGate>,
) -> SyncEngine {
    let engine = SyncEngine::builder(config)
        .embedder(embedder)
        .gate(gate)
        .build()
        .await
        .unwrap();
    engine.add_source(source);
    engine
}

async fn engine(tmp: &TempDir, source: Arc<MemSource>) -> SyncEngine {
    engine_with(tmp, source, Arc::new(HashEmbedder::new(64)), Arc::new(AcceptAll)).await
}

/// Five equally long paragraphs; `revised` replaces the words of the
/// paragraphs it names without moving any offsets.
fn five_sections(revised: &[usize]) -> String {
    ["alpha", "bravo", "charl", "delta", "echoo"]
        .iter()
        .enumerate()
        .map(|(i, word)| {
            if revised.contains(&i) {
                format!("{} quokkas rule {:02}", word, i)
            } else {
                format!("{} section text {:02}", word, i)
            }
        })
        .collect::<Vec<_>>()
        .join("\n\n")
}

async fn sync(engine: &SyncEngine) {
    engine.sync("mem", false).await.unwrap();
    engine.run_until_idle().await.unwrap();
}

#[tokio::test]
async fn update_reembeds_only_modified_chunks_and_becomes_visible() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", &five_sections(&[]));
    let first = engine(&tmp, source.clone()).await;
    sync(&first).await;
    let before = first.store().current_generation();
    assert_eq!(first.stats().chunks_embedded, 5);
    first.shutdown().await;

    // Fresh engine: no workers run until the pending event is inspected.
    let engine = engine(&tmp, source.clone()).await;
    source.set("d1", &five_sections(&[1, 3]));
    let report = engine.detect("mem", false).await.unwrap();
    assert_eq!(report.changed, 1);

    let pending = engine.pending();
    assert_eq!(pending.len(), 1);
    let diff = pending[0].diff.as_ref().unwrap();
    assert_eq!(diff.modified.len(), 2);
    assert_eq!(diff.unchanged.len(), 3);
    assert_eq!(diff.impact, Some(Impact::Medium));
    assert_eq!(pending[0].priority, PriorityClass::Medium);

    engine.run_until_idle().await.unwrap();
    assert_eq!(engine.stats().chunks_embedded, 2);

    let result = engine
        .query("quokkas rule", &QueryFilter::default(), 2)
        .await
        .unwrap();
    assert_eq!(result.generation, before + 1);
    assert_eq!(result.hits.len(), 2);
    for hit in &result.hits {
        assert_eq!(hit.document_id, DocumentId::from("mem:d1"));
        assert!(hit.text.contains("quokkas"));
    }
    engine.shutdown().await;
}

async fn sync_more_changes_than_the_queue_holds(policy: FullPolicy) {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    for i in 0..5 {
        source.set(&format!("d{}", i), &format!("document {} of five", i));
    }
    let mut config = config(&tmp);
    config.scheduler.capacity = 2;
    config.scheduler.full_policy = policy;
    let engine = build(
        config,
        source,
        Arc::new(HashEmbedder::new(64)),
        Arc::new(AcceptAll),
    )
    .await;

    let finished = tokio::time::timeout(Duration::from_secs(5), sync(&engine)).await;
    assert!(finished.is_ok(), "sync did not finish under {:?}", policy);
    assert_eq!(engine.store().snapshot().documents("mem:").len(), 5);
    assert_eq!(engine.hashes().live_ids("mem:").await.unwrap().len(), 5);
    engine.shutdown().await;
}

#[tokio::test]
async fn sync_larger_than_queue_capacity_finishes_under_block() {
    sync_more_changes_than_the_queue_holds(FullPolicy::Block).await;
}

#[tokio::test]
async fn sync_larger_than_queue_capacity_loses_nothing_under_reject() {
    sync_more_changes_than_the_queue_holds(FullPolicy::Reject).await;
}

#[tokio::test]
async fn deleted_document_leaves_the_index_but_not_the_audit_trail() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", "kept paragraph about onboarding");
    source.set("d2", "removed paragraph about billing");
    let engine = engine(&tmp, source.clone()).await;
    sync(&engine).await;

    source.remove("d2");
    let report = engine.sync("mem", false).await.unwrap();
    assert_eq!(report.deleted, 1);
    engine.run_until_idle().await.unwrap();

    let result = engine
        .query("billing", &QueryFilter::default(), 10)
        .await
        .unwrap();
    assert!(result
        .hits
        .iter()
        .all(|h| h.document_id != DocumentId::from("mem:d2")));

    let d2 = DocumentId::from("mem:d2");
    let tombstones = engine.tombstones(Some(&d2)).await.unwrap();
    assert_eq!(tombstones.len(), 1);
    assert_eq!(tombstones[0].chunk_ids.len(), 1);
    assert_eq!(
        tombstones[0].generation,
        engine.store().current_generation()
    );
    let record = engine.hashes().get(&d2).await.unwrap().unwrap();
    assert!(record.tombstoned);
    engine.shutdown().await;
}

#[tokio::test]
async fn unchanged_sources_produce_no_work() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", &five_sections(&[]));
    let engine = engine(&tmp, source.clone()).await;
    sync(&engine).await;
    let generation = engine.store().current_generation();

    // Whitespace-only edits normalize to the same content.
    source.set("d1", &five_sections(&[]).replace("section text", "section   text"));
    let report = engine.sync("mem", false).await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.unchanged, 1);
    engine.run_until_idle().await.unwrap();
    assert_eq!(engine.store().current_generation(), generation);
    engine.shutdown().await;
}

#[tokio::test]
async fn rejected_document_is_dead_lettered_without_blocking_the_batch() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("good-1", "shipping times for europe");
    source.set("bad", "this one contains poison");
    source.set("good-2", "shipping times for asia");
    let engine = engine_with(
        &tmp,
        source,
        Arc::new(Picky(HashEmbedder::new(64))),
        Arc::new(AcceptAll),
    )
    .await;
    sync(&engine).await;

    let parked = engine.dead_letters().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].document_id, DocumentId::from("mem:bad"));
    assert!(parked[0].reason.contains("content policy"));

    let result = engine
        .query("shipping times", &QueryFilter::default(), 5)
        .await
        .unwrap();
    let docs: BTreeSet<_> = result.hits.iter().map(|h| h.document_id.clone()).collect();
    assert!(docs.contains(&DocumentId::from("mem:good-1")));
    assert!(docs.contains(&DocumentId::from("mem:good-2")));
    assert!(engine.queue().is_empty());
    engine.shutdown().await;
}

#[tokio::test]
async fn forced_regression_restores_previous_results() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", &five_sections(&[]));
    let gate = Arc::new(Switch::default());
    let engine = engine_with(
        &tmp,
        source.clone(),
        Arc::new(HashEmbedder::new(64)),
        gate.clone(),
    )
    .await;
    sync(&engine).await;
    let live = engine.store().current_generation();
    let before = engine
        .query("section text", &QueryFilter::default(), 5)
        .await
        .unwrap();

    gate.0.store(true, Ordering::SeqCst);
    source.set("d1", &five_sections(&[0, 1, 2, 3, 4]));
    sync(&engine).await;

    let after = engine
        .query("section text", &QueryFilter::default(), 5)
        .await
        .unwrap();
    assert_eq!(after.generation, live);
    assert_eq!(after.hits, before.hits);

    // Rolled back once and re-queued, then parked on the second rollback.
    assert_eq!(engine.alerts().await.unwrap().len(), 2);
    let parked = engine.dead_letters().await.unwrap();
    assert_eq!(parked.len(), 1);
    assert_eq!(parked[0].event.rollbacks, 1);
    assert_eq!(parked[0].attempts, 2);
    let statuses: Vec<GenerationStatus> = engine
        .generations(10)
        .await
        .unwrap()
        .iter()
        .map(|g| g.status)
        .collect();
    assert_eq!(
        statuses,
        vec![
            GenerationStatus::RolledBack,
            GenerationStatus::RolledBack,
            GenerationStatus::Live
        ]
    );
    engine.shutdown().await;
}

#[tokio::test]
async fn state_survives_reopening_the_database() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", &five_sections(&[]));
    source.set("d2", "refund policy: thirty days");

    let first = engine(&tmp, source.clone()).await;
    sync(&first).await;
    let generation = first.store().current_generation();
    first.shutdown().await;

    let second = engine(&tmp, source.clone()).await;
    assert_eq!(second.store().current_generation(), generation);
    let report = second.sync("mem", false).await.unwrap();
    assert_eq!(report.changed, 0);
    assert_eq!(report.unchanged, 2);

    let result = second
        .query("refund policy", &QueryFilter::default(), 1)
        .await
        .unwrap();
    assert_eq!(result.hits[0].document_id, DocumentId::from("mem:d2"));
    second.shutdown().await;
}

#[tokio::test]
async fn changed_embedding_model_requires_a_full_resync() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", "refund policy: thirty days");
    let first = engine(&tmp, source.clone()).await;
    sync(&first).await;
    first.shutdown().await;

    let err = SyncEngine::builder(config(&tmp))
        .embedder(Arc::new(HashEmbedder::new(32)))
        .build()
        .await
        .err()
        .unwrap();
    assert!(err.to_string().contains("--full"), "{}", err);

    let migrating = SyncEngine::builder(config(&tmp))
        .embedder(Arc::new(HashEmbedder::new(32)))
        .allow_model_change(true)
        .build()
        .await
        .unwrap();
    migrating.add_source(source.clone());
    migrating.resync("mem").await.unwrap();
    migrating.run_until_idle().await.unwrap();
    let chunks = migrating
        .store()
        .live_chunks(&DocumentId::from("mem:d1"))
        .await
        .unwrap();
    assert!(!chunks.is_empty());
    assert!(chunks.iter().all(|c| c.vector.len() == 32));
    migrating.shutdown().await;

    // The new model is the recorded one from now on.
    let reopened = SyncEngine::builder(config(&tmp))
        .embedder(Arc::new(HashEmbedder::new(32)))
        .build()
        .await
        .unwrap();
    reopened.shutdown().await;
}

#[tokio::test]
async fn operator_rollback_reverts_the_index_and_resync_repairs_it() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    source.set("d1", &five_sections(&[]));
    let engine = engine(&tmp, source.clone()).await;
    sync(&engine).await;
    let g1 = engine.store().current_generation();

    source.set("d1", &five_sections(&[2]));
    sync(&engine).await;
    assert_eq!(engine.store().current_generation(), g1 + 1);

    let affected = engine.rollback_to(g1).await.unwrap();
    assert_eq!(affected, vec![DocumentId::from("mem:d1")]);
    assert_eq!(engine.store().current_generation(), g1);

    // The source still holds the newer content; the next scan sees it.
    let report = engine.sync("mem", false).await.unwrap();
    assert_eq!(report.changed, 1);
    engine.run_until_idle().await.unwrap();
    let result = engine
        .query("quokkas rule", &QueryFilter::default(), 1)
        .await
        .unwrap();
    assert!(result.hits[0].text.contains("quokkas"));
    assert!(result.generation > g1 + 1);
    engine.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn readers_never_see_a_partially_applied_batch() {
    let tmp = TempDir::new().unwrap();
    let source = Arc::new(MemSource::default());
    let body = |v: usize| {
        ["alpha", "bravo", "charl"]
            .iter()
            .map(|w| format!("marker v{:02} {}", v, w))
            .collect::<Vec<_>>()
            .join("\n\n")
    };
    source.set("d", &body(0));
    let engine = Arc::new(engine(&tmp, source.clone()).await);
    sync(&engine).await;

    let stop = Arc::new(AtomicBool::new(false));
    let reader = {
        let engine = engine.clone();
        let stop = stop.clone();
        tokio::spawn(async move {
            let mut reads = 0;
            while !stop.load(Ordering::SeqCst) {
                let result = engine
                    .query("marker", &QueryFilter::default(), 10)
                    .await
                    .unwrap();
                assert_eq!(result.hits.len(), 3);
                let versions: BTreeSet<String> = result
                    .hits
                    .iter()
                    .map(|h| h.text.split(' ').nth(1).unwrap_or_default().to_string())
                    .collect();
                assert_eq!(versions.len(), 1, "mixed generations: {:?}", versions);
                reads += 1;
                tokio::task::yield_now().await;
            }
            reads
        })
    };

    for v in 1..=10 {
        source.set("d", &body(v));
        sync(&engine).await;
    }
    stop.store(true, Ordering::SeqCst);
    let reads = reader.await.unwrap();
    assert!(reads > 0);
    engine.shutdown().await;
}
