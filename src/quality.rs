//! Quality Monitor & Rollback Manager.
//!
//! After every commit the swap coordinator asks a [`QualityGate`] to
//! compare the previous and the new generation. [`CanaryGate`] runs the
//! current canary queries against both snapshots and compares:
//!
//! - **overlap**: Jaccard overlap of the top-K chunk ids, averaged over
//!   canaries (two empty result lists count as identical);
//! - **score drop**: how much the top-K relevance scores fell rank by
//!   rank, averaged over canaries (improvements count as zero).
//!
//! The commit regresses when the mean score drop exceeds `max_score_drop`,
//! or when mean overlap falls below `min_overlap` while scores fell at all.
//!
//! Canaries come from a [`CanarySet`]: operator-pinned queries plus a
//! rolling, de-duplicated sample of recent real queries, so baselines
//! follow what users actually ask.
//!
//! [`RollbackManager`] decides what happens to the events of a rolled-back
//! batch: re-queued one class higher, or parked in the dead-letter set once
//! they have been rolled back too often.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::config::QualityConfig;
use crate::embedding::Embedder;
use crate::error::{SyncError, SyncResult};
use crate::ledger::Ledger;
use crate::models::{ChangeEvent, DeadLetter, GenerationId};
use crate::queue::UpdateQueue;
use crate::vector_store::{QueryFilter, SearchHit, Snapshot};

/// Pinned canaries plus a bounded sample of recent queries.
pub struct CanarySet {
    pinned: Vec<String>,
    recent: Mutex<VecDeque<String>>,
    capacity: usize,
}

impl CanarySet {
    pub fn new(pinned: Vec<String>, capacity: usize) -> Self {
        Self {
            pinned,
            recent: Mutex::new(VecDeque::new()),
            capacity,
        }
    }

    pub fn from_config(config: &QualityConfig) -> Self {
        Self::new(config.pinned_canaries.clone(), config.canary_sample_size)
    }

    /// Feed a real query into the rolling sample. A repeated query moves
    /// to the back instead of taking a second slot.
    pub fn record_query(&self, query: &str) {
        let query = query.trim();
        if query.is_empty() || self.capacity == 0 {
            return;
        }
        let mut recent = self.recent.lock().unwrap();
        recent.retain(|q| q != query);
        recent.push_back(query.to_string());
        while recent.len() > self.capacity {
            recent.pop_front();
        }
    }

    /// Pinned canaries first, then the sample, oldest first.
    pub fn canaries(&self) -> Vec<String> {
        let recent = self.recent.lock().unwrap();
        let mut seen = HashSet::new();
        self.pinned
            .iter()
            .chain(recent.iter())
            .filter(|q| seen.insert(q.as_str()))
            .cloned()
            .collect()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct QualityReport {
    pub previous: GenerationId,
    pub candidate: GenerationId,
    pub canaries: usize,
    pub mean_overlap: f64,
    pub mean_score_drop: f64,
    pub regressed: bool,
    pub detail: String,
}

impl QualityReport {
    fn accepted(previous: GenerationId, candidate: GenerationId, detail: &str) -> Self {
        Self {
            previous,
            candidate,
            canaries: 0,
            mean_overlap: 1.0,
            mean_score_drop: 0.0,
            regressed: false,
            detail: detail.to_string(),
        }
    }
}

#[async_trait]
pub trait QualityGate: Send + Sync {
    async fn evaluate(&self, previous: &Snapshot, candidate: &Snapshot) -> SyncResult<QualityReport>;
}

/// Gate that accepts every commit.
pub struct AcceptAll;

#[async_trait]
impl QualityGate for AcceptAll {
    async fn evaluate(&self, previous: &Snapshot, candidate: &Snapshot) -> SyncResult<QualityReport> {
        Ok(QualityReport::accepted(
            previous.generation,
            candidate.generation,
            "quality gate disabled",
        ))
    }
}

pub struct CanaryGate {
    embedder: Arc<dyn Embedder>,
    canaries: Arc<CanarySet>,
    top_k: usize,
    min_overlap: f64,
    max_score_drop: f64,
    vectors: Mutex<HashMap<String, Vec<f32>>>,
}

impl CanaryGate {
    pub fn new(embedder: Arc<dyn Embedder>, canaries: Arc<CanarySet>, config: &QualityConfig) -> Self {
        Self {
            embedder,
            canaries,
            top_k: config.top_k,
            min_overlap: config.min_overlap,
            max_score_drop: config.max_score_drop,
            vectors: Mutex::new(HashMap::new()),
        }
    }

    /// Canary vectors, embedding only the ones not seen before.
    async fn vectors(&self, canaries: &[String]) -> SyncResult<Vec<Vec<f32>>> {
        let missing: Vec<String> = {
            let cache = self.vectors.lock().unwrap();
            canaries
                .iter()
                .filter(|c| !cache.contains_key(*c))
                .cloned()
                .collect()
        };

        if !missing.is_empty() {
            let results = self.embedder.embed(&missing).await?;
            let mut cache = self.vectors.lock().unwrap();
            for (text, result) in missing.into_iter().zip(results) {
                match result {
                    Ok(v) => {
                        cache.insert(text, v);
                    }
                    Err(reason) => warn!(canary = %text, %reason, "canary embedding rejected"),
                }
            }
            // Sampled queries rotate; keep the cache from growing without bound.
            if cache.len() > canaries.len() * 4 {
                let keep: HashSet<&String> = canaries.iter().collect();
                cache.retain(|k, _| keep.contains(k));
            }
        }

        let cache = self.vectors.lock().unwrap();
        Ok(canaries.iter().filter_map(|c| cache.get(c).cloned()).collect())
    }
}

#[async_trait]
impl QualityGate for CanaryGate {
    async fn evaluate(&self, previous: &Snapshot, candidate: &Snapshot) -> SyncResult<QualityReport> {
        let canaries = self.canaries.canaries();
        if canaries.is_empty() {
            return Ok(QualityReport::accepted(
                previous.generation,
                candidate.generation,
                "no canaries",
            ));
        }

        let vectors = self.vectors(&canaries).await?;
        if vectors.is_empty() {
            return Ok(QualityReport::accepted(
                previous.generation,
                candidate.generation,
                "no canary could be embedded",
            ));
        }

        let filter = QueryFilter::default();
        let mut overlap_sum = 0.0;
        let mut drop_sum = 0.0;
        for vector in &vectors {
            let before = previous.search(vector, &filter, self.top_k);
            let after = candidate.search(vector, &filter, self.top_k);
            overlap_sum += overlap(&before, &after);
            drop_sum += score_drop(&before, &after);
        }

        let n = vectors.len() as f64;
        let mean_overlap = overlap_sum / n;
        let mean_score_drop = drop_sum / n;

        let mut reasons = Vec::new();
        // New results that score at least as well are churn, not regression.
        if mean_overlap < self.min_overlap && mean_score_drop > 0.0 {
            reasons.push(format!(
                "top-{} overlap {:.2} < {:.2}",
                self.top_k, mean_overlap, self.min_overlap
            ));
        }
        if mean_score_drop > self.max_score_drop {
            reasons.push(format!(
                "score drop {:.3} > {:.3}",
                mean_score_drop, self.max_score_drop
            ));
        }

        debug!(
            previous = previous.generation,
            candidate = candidate.generation,
            canaries = vectors.len(),
            mean_overlap,
            mean_score_drop,
            "canary evaluation"
        );

        Ok(QualityReport {
            previous: previous.generation,
            candidate: candidate.generation,
            canaries: vectors.len(),
            mean_overlap,
            mean_score_drop,
            regressed: !reasons.is_empty(),
            detail: if reasons.is_empty() {
                "ok".to_string()
            } else {
                reasons.join("; ")
            },
        })
    }
}

fn overlap(before: &[SearchHit], after: &[SearchHit]) -> f64 {
    let a: HashSet<_> = before.iter().map(|h| &h.chunk_id).collect();
    let b: HashSet<_> = after.iter().map(|h| &h.chunk_id).collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 1.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

/// Mean rank-by-rank score loss; a rank missing after the commit scores 0.
fn score_drop(before: &[SearchHit], after: &[SearchHit]) -> f64 {
    if before.is_empty() {
        return 0.0;
    }
    let lost: f64 = before
        .iter()
        .enumerate()
        .map(|(i, hit)| hit.score as f64 - after.get(i).map_or(0.0, |h| h.score as f64))
        .sum();
    (lost / before.len() as f64).max(0.0)
}

/// What became of a rolled-back batch's events.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RollbackDisposition {
    pub requeued: usize,
    pub parked: usize,
}

pub struct RollbackManager {
    queue: Arc<UpdateQueue>,
    ledger: Arc<dyn Ledger>,
    max_rollbacks: u32,
}

impl RollbackManager {
    pub fn new(queue: Arc<UpdateQueue>, ledger: Arc<dyn Ledger>, max_rollbacks: u32) -> Self {
        Self {
            queue,
            ledger,
            max_rollbacks,
        }
    }

    /// Re-queue each event one class higher, or park it once it has been
    /// rolled back more than `max_rollbacks` times. Call while the events'
    /// documents are still in flight; a newer deferred event for the same
    /// document wins over the rolled-back one and is raised to its class
    /// if that is higher.
    pub async fn dispose(&self, events: &[ChangeEvent], detail: &str) -> SyncResult<RollbackDisposition> {
        let mut out = RollbackDisposition::default();
        for event in events {
            let next = event.escalated();
            if next.rollbacks > self.max_rollbacks {
                let letter = DeadLetter {
                    id: Uuid::new_v4(),
                    document_id: event.document_id.clone(),
                    event: event.clone(),
                    reason: format!("rolled back {} times: {}", next.rollbacks, detail),
                    attempts: next.rollbacks,
                    failed_at: Utc::now(),
                };
                self.ledger.park(&letter).await?;
                warn!(document_id = %event.document_id, rollbacks = next.rollbacks, "parked after repeated rollback");
                out.parked += 1;
                continue;
            }

            if self.queue.is_superseded(&event.document_id) {
                self.queue.raise_priority(&event.document_id, next.priority);
            } else {
                match self.queue.requeue(next) {
                    Ok(_) => {}
                    Err(SyncError::QueueClosed) => {
                        warn!(document_id = %event.document_id, "queue closed, rolled-back event dropped");
                        continue;
                    }
                    Err(e) => return Err(e),
                }
            }
            out.requeued += 1;
        }
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::hash_text;
    use crate::config::SchedulerConfig;
    use crate::embedding::HashEmbedder;
    use crate::ledger::MemoryLedger;
    use crate::models::{ChangeOp, Chunk, ChunkId, DocumentId, PriorityClass, SourceType, Span};
    use crate::vector_store::{IndexedChunk, MemoryVectorStore, VectorStore};

    fn indexed(embedder: &HashEmbedder, doc: &str, text: &str) -> IndexedChunk {
        let document_id = DocumentId::from(doc);
        IndexedChunk {
            chunk: Chunk {
                id: ChunkId::new(&document_id, 0),
                document_id,
                chunk_index: 0,
                span: Span {
                    start: 0,
                    end: text.len(),
                },
                text: text.to_string(),
                hash: hash_text(text),
            },
            vector: embedder.embed_one(text),
            source_type: SourceType::File,
            category: None,
            title: None,
        }
    }

    fn event(doc: &str, rollbacks: u32) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            document_id: DocumentId::from(doc),
            op: ChangeOp::Update,
            source_type: SourceType::File,
            category: None,
            detected_at: Utc::now(),
            sequence: 1,
            priority: PriorityClass::Medium,
            body: Some("body".to_string()),
            content_hash: None,
            title: None,
            diff: None,
            rollbacks,
            full_resync: false,
        }
    }

    #[test]
    fn canary_sample_is_bounded_and_deduplicated() {
        let set = CanarySet::new(vec!["pinned".to_string()], 2);
        set.record_query("a");
        set.record_query("b");
        set.record_query("a");
        set.record_query("c");
        set.record_query("pinned");
        assert_eq!(set.canaries(), vec!["pinned".to_string(), "c".to_string()]);
    }

    #[tokio::test]
    async fn unchanged_results_pass_and_wiped_results_regress() {
        let embedder = HashEmbedder::new(256);
        let store = MemoryVectorStore::new(4, None);
        let docs = [
            ("docs:rust", "rust ownership and borrowing"),
            ("docs:sql", "sqlite write ahead logging"),
            ("docs:tokio", "tokio runtime and async tasks"),
        ];
        let upserts = docs.iter().map(|(d, t)| indexed(&embedder, d, t)).collect();
        let handle = store.stage_write(upserts, vec![]).await.unwrap();
        store.commit(handle).await.unwrap();
        let base = store.snapshot();

        let canaries = Arc::new(CanarySet::new(vec!["rust ownership".to_string()], 4));
        canaries.record_query("sqlite logging");
        let config = QualityConfig::default();
        let gate = CanaryGate::new(Arc::new(HashEmbedder::new(256)), canaries, &config);

        // Unrelated addition keeps the canaries' results.
        let handle = store
            .stage_write(vec![indexed(&embedder, "docs:misc", "gardening tips")], vec![])
            .await
            .unwrap();
        store.commit(handle).await.unwrap();
        let report = gate.evaluate(&base, &store.snapshot()).await.unwrap();
        assert!(!report.regressed, "{}", report.detail);
        assert_eq!(report.canaries, 2);

        // Removing everything the canaries hit regresses.
        let tombstones = docs
            .iter()
            .map(|(d, _)| ChunkId::new(&DocumentId::from(*d), 0))
            .collect();
        let handle = store.stage_write(vec![], tombstones).await.unwrap();
        store.commit(handle).await.unwrap();
        let report = gate.evaluate(&base, &store.snapshot()).await.unwrap();
        assert!(report.regressed);
        assert!(report.mean_overlap < config.min_overlap);
    }

    #[tokio::test]
    async fn no_canaries_accepts() {
        let gate = CanaryGate::new(
            Arc::new(HashEmbedder::new(16)),
            Arc::new(CanarySet::new(vec![], 0)),
            &QualityConfig::default(),
        );
        let report = gate
            .evaluate(&Snapshot::empty(1), &Snapshot::empty(2))
            .await
            .unwrap();
        assert!(!report.regressed);
    }

    #[tokio::test]
    async fn rolled_back_events_escalate_then_park() {
        let queue = Arc::new(UpdateQueue::new(&SchedulerConfig::default()));
        let ledger = Arc::new(MemoryLedger::new());
        let manager = RollbackManager::new(queue.clone(), ledger.clone(), 1);

        let out = manager
            .dispose(&[event("docs:a", 0), event("docs:b", 1)], "overlap 0.1 < 0.3")
            .await
            .unwrap();
        assert_eq!(out, RollbackDisposition { requeued: 1, parked: 1 });

        let pending = queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].priority, PriorityClass::High);
        assert_eq!(pending[0].rollbacks, 1);

        let parked = ledger.dead_letters().await.unwrap();
        assert_eq!(parked[0].document_id, DocumentId::from("docs:b"));
        assert!(parked[0].reason.contains("overlap"));
    }

    #[tokio::test]
    async fn deferred_successor_keeps_a_higher_class() {
        let queue = Arc::new(UpdateQueue::new(&SchedulerConfig::default()));
        let manager = RollbackManager::new(queue.clone(), Arc::new(MemoryLedger::new()), 3);

        queue.enqueue(event("docs:a", 0)).await.unwrap();
        let in_flight = queue.try_dequeue().unwrap().unwrap();
        let mut urgent = event("docs:a", 0);
        urgent.priority = PriorityClass::Critical;
        queue.enqueue(urgent).await.unwrap();

        let out = manager.dispose(&[in_flight.clone()], "forced").await.unwrap();
        assert_eq!(out.requeued, 1);
        queue.complete(&in_flight.document_id);
        let next = queue.try_dequeue().unwrap().unwrap();
        assert_eq!(next.priority, PriorityClass::Critical);
        assert_eq!(next.rollbacks, 0);
    }
}
