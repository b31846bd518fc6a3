//! Atomic Swap Coordinator: the only writer of the live generation.
//!
//! Commits are serialized by one async mutex, so batches commit in the
//! order they finish staging. Under the lock, for each staged batch:
//!
//! 1. documents whose event was superseded by a newer deferred event are
//!    dropped as stale; documents whose hash-store version moved since the
//!    worker read it are dropped as conflicts;
//! 2. what remains is committed as a new generation (a pointer swap in
//!    the vector store, never an in-place edit of live entries);
//! 3. the quality gate compares the previous and the new generation; a
//!    regression swaps the pointer back and raises an alert;
//! 4. on acceptance the content hash store records the new versions and
//!    deletes get a tombstone audit row.
//!
//! Hashes are only recorded for accepted work, so anything dropped or
//! rolled back is seen as changed again by the next detection pass.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::content_hash;
use crate::error::{SyncError, SyncResult};
use crate::hash_store::{next_record, tombstone_record, ContentHashStore};
use crate::ledger::Ledger;
use crate::models::{
    Alert, ChangeEvent, ChangeOp, ChunkId, DocumentId, DocumentRecord, GenerationId,
    GenerationRecord, GenerationStatus, TombstoneRecord,
};
use crate::quality::QualityGate;
use crate::queue::UpdateQueue;
use crate::vector_store::{Snapshot, StagingHandle, VectorStore};

/// One document's share of a staged batch.
#[derive(Debug, Clone)]
pub struct StagedDocument {
    pub event: ChangeEvent,
    /// Latest hash-store version when the worker prepared the document.
    pub expected_version: Option<u64>,
    /// Chunk ids the staged write removes from the live index.
    pub tombstones: Vec<ChunkId>,
}

#[derive(Debug)]
pub struct StagedBatch {
    pub batch_id: Uuid,
    pub handle: StagingHandle,
    pub documents: Vec<StagedDocument>,
}

#[derive(Debug, Clone)]
pub struct RolledBack {
    pub from: GenerationId,
    pub to: GenerationId,
    pub detail: String,
    pub events: Vec<ChangeEvent>,
}

#[derive(Debug, Default)]
pub struct CommitOutcome {
    /// Generation created by the commit; `None` when nothing was written.
    pub generation: Option<GenerationId>,
    pub accepted: Vec<ChangeEvent>,
    pub conflicted: Vec<ChangeEvent>,
    pub stale: Vec<ChangeEvent>,
    pub rolled_back: Option<RolledBack>,
}

pub struct SwapCoordinator {
    store: Arc<dyn VectorStore>,
    hashes: Arc<dyn ContentHashStore>,
    ledger: Arc<dyn Ledger>,
    gate: Arc<dyn QualityGate>,
    queue: Arc<UpdateQueue>,
    lock: Mutex<()>,
}

impl SwapCoordinator {
    pub fn new(
        store: Arc<dyn VectorStore>,
        hashes: Arc<dyn ContentHashStore>,
        ledger: Arc<dyn Ledger>,
        gate: Arc<dyn QualityGate>,
        queue: Arc<UpdateQueue>,
    ) -> Self {
        Self {
            store,
            hashes,
            ledger,
            gate,
            queue,
            lock: Mutex::new(()),
        }
    }

    pub async fn commit(&self, batch: StagedBatch) -> SyncResult<CommitOutcome> {
        let _swap = self.lock.lock().await;
        let StagedBatch {
            batch_id,
            mut handle,
            documents,
        } = batch;

        let mut outcome = CommitOutcome::default();
        let mut dropped: HashSet<DocumentId> = HashSet::new();
        let mut ready: Vec<(StagedDocument, Option<DocumentRecord>)> = Vec::new();

        for doc in documents {
            let id = doc.event.document_id.clone();
            if self.queue.is_superseded(&id) {
                debug!(document_id = %id, "staged work superseded, discarding");
                dropped.insert(id);
                outcome.stale.push(doc.event);
                continue;
            }
            let current = self.hashes.get(&id).await?;
            let found = current.as_ref().map(|r| r.version);
            if found != doc.expected_version {
                warn!(
                    document_id = %id,
                    expected = doc.expected_version.unwrap_or(0),
                    found = found.unwrap_or(0),
                    "version conflict, discarding staged work"
                );
                dropped.insert(id);
                outcome.conflicted.push(doc.event);
                continue;
            }
            ready.push((doc, current));
        }

        if !dropped.is_empty() {
            handle.retain_documents(|d| !dropped.contains(d));
        }
        if ready.is_empty() {
            return Ok(outcome);
        }

        let documents: Vec<DocumentId> = ready.iter().map(|(d, _)| d.event.document_id.clone()).collect();
        let previous = self.store.snapshot();
        let generation = if handle.is_empty() {
            None
        } else {
            let upserts = handle.upserts.len();
            let tombstones = handle.tombstones.len();
            let generation = self.store.commit(handle).await?;
            let candidate = self
                .store
                .snapshot_at(generation)
                .unwrap_or_else(|| self.store.snapshot());

            let regression = match self.gate.evaluate(&previous, &candidate).await {
                Ok(report) if report.regressed => Some(report.detail),
                Ok(_) => None,
                Err(e) => {
                    warn!(generation, error = %e, "quality evaluation failed, keeping generation");
                    None
                }
            };

            let mut record = GenerationRecord {
                id: generation,
                parent: Some(previous.generation),
                batch_id: Some(batch_id),
                committed_at: Utc::now(),
                documents: documents.clone(),
                upserts,
                tombstones,
                status: GenerationStatus::Live,
            };

            if let Some(detail) = regression {
                self.store.rollback(previous.generation).await?;
                record.status = GenerationStatus::RolledBack;
                self.ledger.record_generation(&record).await?;
                self.raise_alert(generation, previous.generation, &detail).await;
                outcome.rolled_back = Some(RolledBack {
                    from: generation,
                    to: previous.generation,
                    detail,
                    events: ready.into_iter().map(|(d, _)| d.event).collect(),
                });
                return Ok(outcome);
            }

            self.ledger.record_generation(&record).await?;
            info!(
                generation,
                documents = documents.len(),
                upserts,
                tombstones,
                "generation live"
            );
            Some(generation)
        };

        let audit_generation = generation.unwrap_or(previous.generation);
        for (doc, current) in ready {
            if let Err(e) = self.record_hash(&doc, current.as_ref(), audit_generation).await {
                // The index already holds the new content; the next scan
                // sees the stale hash and re-emits, which is idempotent.
                warn!(document_id = %doc.event.document_id, error = %e, "failed to record content hash");
            }
            outcome.accepted.push(doc.event);
        }
        outcome.generation = generation;
        Ok(outcome)
    }

    async fn record_hash(
        &self,
        doc: &StagedDocument,
        current: Option<&DocumentRecord>,
        generation: GenerationId,
    ) -> SyncResult<()> {
        let event = &doc.event;
        let id = &event.document_id;

        if event.op == ChangeOp::Delete {
            let record = match current {
                Some(prev) if prev.tombstoned => return Ok(()),
                Some(prev) => tombstone_record(prev),
                None => DocumentRecord {
                    tombstoned: true,
                    ..next_record(id, None, "", event.source_type)
                },
            };
            self.hashes.put(&record).await?;
            self.ledger
                .record_tombstone(&TombstoneRecord {
                    document_id: id.clone(),
                    version: record.version,
                    chunk_ids: doc.tombstones.clone(),
                    generation,
                    recorded_at: Utc::now(),
                })
                .await?;
            info!(document_id = %id, version = record.version, generation, "document tombstoned");
            return Ok(());
        }

        let hash = match (&event.content_hash, &event.body) {
            (Some(h), _) => h.clone(),
            (None, Some(body)) => content_hash(body),
            (None, None) => {
                return Err(SyncError::PermanentDocument {
                    document_id: id.clone(),
                    reason: "upsert event without content".to_string(),
                })
            }
        };
        if let Some(prev) = current {
            if !prev.tombstoned && prev.content_hash == hash {
                return Ok(());
            }
        }
        self.hashes
            .put(&next_record(id, current, &hash, event.source_type))
            .await
    }

    async fn raise_alert(&self, generation: GenerationId, restored: GenerationId, detail: &str) {
        error!(generation, restored, %detail, "quality regression, generation rolled back");
        let alert = Alert {
            id: Uuid::new_v4(),
            generation,
            restored_generation: restored,
            detail: detail.to_string(),
            raised_at: Utc::now(),
        };
        if let Err(e) = self.ledger.raise_alert(&alert).await {
            error!(error = %e, "failed to persist alert");
        }
    }

    /// Operator rollback to any retained generation.
    ///
    /// Documents whose chunks differ between the current and the restored
    /// generation get an unknown-content hash record, so the next scan
    /// re-emits them and the index converges back to the sources.
    pub async fn rollback_to(&self, target: GenerationId) -> SyncResult<Vec<DocumentId>> {
        let _swap = self.lock.lock().await;
        let current = self.store.snapshot();
        if current.generation == target {
            return Ok(Vec::new());
        }
        let restored = self.store.snapshot_at(target).ok_or_else(|| SyncError::NotFound {
            kind: "generation",
            id: target.to_string(),
        })?;

        self.store.rollback(target).await?;

        let affected = changed_documents(&current, &restored);
        for id in &affected {
            if let Some(prev) = self.hashes.get(id).await? {
                let unknown = DocumentRecord {
                    content_hash: String::new(),
                    version: prev.version + 1,
                    last_synced_at: Utc::now(),
                    tombstoned: false,
                    ..prev
                };
                self.hashes.put(&unknown).await?;
            }
        }

        for (id, status) in [
            (current.generation, GenerationStatus::RolledBack),
            (target, GenerationStatus::Live),
        ] {
            match self.ledger.set_generation_status(id, status).await {
                Ok(()) | Err(SyncError::NotFound { .. }) => {}
                Err(e) => return Err(e),
            }
        }

        warn!(
            from = current.generation,
            to = target,
            documents = affected.len(),
            "operator rollback"
        );
        Ok(affected.into_iter().collect())
    }
}

/// Documents whose chunk sets differ between two snapshots.
fn changed_documents(a: &Snapshot, b: &Snapshot) -> BTreeSet<DocumentId> {
    let chunk_hashes = |s: &Snapshot, id: &DocumentId| -> BTreeMap<ChunkId, String> {
        s.document_chunks(id)
            .into_iter()
            .map(|c| (c.chunk.id, c.chunk.hash))
            .collect()
    };
    a.documents("")
        .into_iter()
        .chain(b.documents(""))
        .filter(|id| chunk_hashes(a, id) != chunk_hashes(b, id))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{chunk_text, hash_text};
    use crate::config::SchedulerConfig;
    use crate::hash_store::MemoryHashStore;
    use crate::ledger::MemoryLedger;
    use crate::models::{PriorityClass, SourceType};
    use crate::quality::{AcceptAll, QualityReport};
    use crate::vector_store::{IndexedChunk, MemoryVectorStore};
    use async_trait::async_trait;

    struct Regress;

    #[async_trait]
    impl QualityGate for Regress {
        async fn evaluate(&self, previous: &Snapshot, candidate: &Snapshot) -> SyncResult<QualityReport> {
            Ok(QualityReport {
                previous: previous.generation,
                candidate: candidate.generation,
                canaries: 1,
                mean_overlap: 0.0,
                mean_score_drop: 1.0,
                regressed: true,
                detail: "forced".to_string(),
            })
        }
    }

    struct Fixture {
        store: Arc<MemoryVectorStore>,
        hashes: Arc<MemoryHashStore>,
        ledger: Arc<MemoryLedger>,
        queue: Arc<UpdateQueue>,
        swap: SwapCoordinator,
    }

    fn fixture(gate: Arc<dyn QualityGate>) -> Fixture {
        let store = Arc::new(MemoryVectorStore::new(4, None));
        let hashes = Arc::new(MemoryHashStore::new());
        let ledger = Arc::new(MemoryLedger::new());
        let queue = Arc::new(UpdateQueue::new(&SchedulerConfig::default()));
        let swap = SwapCoordinator::new(store.clone(), hashes.clone(), ledger.clone(), gate, queue.clone());
        Fixture {
            store,
            hashes,
            ledger,
            queue,
            swap,
        }
    }

    fn event(doc: &str, op: ChangeOp, body: &str) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            document_id: DocumentId::from(doc),
            op,
            source_type: SourceType::File,
            category: None,
            detected_at: Utc::now(),
            sequence: 1,
            priority: PriorityClass::Medium,
            body: (op != ChangeOp::Delete).then(|| body.to_string()),
            content_hash: (op != ChangeOp::Delete).then(|| hash_text(body)),
            title: None,
            diff: None,
            rollbacks: 0,
            full_resync: false,
        }
    }

    fn indexed(doc: &str, body: &str) -> Vec<IndexedChunk> {
        chunk_text(&DocumentId::from(doc), body, 100)
            .into_iter()
            .map(|chunk| IndexedChunk {
                chunk,
                vector: vec![1.0, 0.0],
                source_type: SourceType::File,
                category: None,
                title: None,
            })
            .collect()
    }

    async fn stage(
        f: &Fixture,
        upserts: Vec<IndexedChunk>,
        tombstones: Vec<ChunkId>,
        docs: Vec<StagedDocument>,
    ) -> StagedBatch {
        StagedBatch {
            batch_id: Uuid::new_v4(),
            handle: f.store.stage_write(upserts, tombstones).await.unwrap(),
            documents: docs,
        }
    }

    fn staged(event: ChangeEvent, expected_version: Option<u64>, tombstones: Vec<ChunkId>) -> StagedDocument {
        StagedDocument {
            event,
            expected_version,
            tombstones,
        }
    }

    #[tokio::test]
    async fn accepted_commit_records_hashes_and_generation() {
        let f = fixture(Arc::new(AcceptAll));
        let ev = event("docs:a", ChangeOp::Insert, "hello world");
        let batch = stage(&f, indexed("docs:a", "hello world"), vec![], vec![staged(ev, None, vec![])]).await;

        let out = f.swap.commit(batch).await.unwrap();
        assert_eq!(out.generation, Some(1));
        assert_eq!(out.accepted.len(), 1);
        assert_eq!(f.store.current_generation(), 1);

        let record = f.hashes.get(&DocumentId::from("docs:a")).await.unwrap().unwrap();
        assert_eq!(record.version, 1);
        assert_eq!(record.content_hash, hash_text("hello world"));
        let gens = f.ledger.generations(5).await.unwrap();
        assert_eq!(gens[0].status, GenerationStatus::Live);
    }

    #[tokio::test]
    async fn version_conflicts_and_stale_work_are_discarded() {
        let f = fixture(Arc::new(AcceptAll));
        // Someone else recorded docs:a since the worker read it.
        f.hashes
            .put(&next_record(&DocumentId::from("docs:a"), None, "other", SourceType::File))
            .await
            .unwrap();

        // docs:b has a newer event waiting behind the in-flight one.
        let newer = event("docs:b", ChangeOp::Update, "newest");
        f.queue.enqueue(event("docs:b", ChangeOp::Update, "older")).await.unwrap();
        f.queue.try_dequeue().unwrap();
        f.queue.enqueue(newer).await.unwrap();

        let mut upserts = indexed("docs:a", "mine");
        upserts.extend(indexed("docs:b", "older"));
        upserts.extend(indexed("docs:c", "fine"));
        let batch = stage(
            &f,
            upserts,
            vec![],
            vec![
                staged(event("docs:a", ChangeOp::Insert, "mine"), None, vec![]),
                staged(event("docs:b", ChangeOp::Update, "older"), None, vec![]),
                staged(event("docs:c", ChangeOp::Insert, "fine"), None, vec![]),
            ],
        )
        .await;

        let out = f.swap.commit(batch).await.unwrap();
        assert_eq!(out.conflicted.len(), 1);
        assert_eq!(out.stale.len(), 1);
        assert_eq!(out.accepted.len(), 1);

        let live = f.store.snapshot();
        assert_eq!(live.documents(""), vec![DocumentId::from("docs:c")]);
    }

    #[tokio::test]
    async fn regression_rolls_back_and_raises_alert() {
        let f = fixture(Arc::new(Regress));
        let ev = event("docs:a", ChangeOp::Insert, "hello");
        let batch = stage(&f, indexed("docs:a", "hello"), vec![], vec![staged(ev, None, vec![])]).await;

        let out = f.swap.commit(batch).await.unwrap();
        let rolled = out.rolled_back.expect("rolled back");
        assert_eq!((rolled.from, rolled.to), (1, 0));
        assert_eq!(rolled.events.len(), 1);
        assert!(out.accepted.is_empty());

        assert_eq!(f.store.current_generation(), 0);
        assert!(f.store.snapshot().is_empty());
        assert!(f.hashes.get(&DocumentId::from("docs:a")).await.unwrap().is_none());
        assert_eq!(f.ledger.alerts().await.unwrap().len(), 1);
        assert_eq!(
            f.ledger.generations(1).await.unwrap()[0].status,
            GenerationStatus::RolledBack
        );
    }

    #[tokio::test]
    async fn delete_writes_tombstone_audit() {
        let f = fixture(Arc::new(AcceptAll));
        let id = DocumentId::from("docs:gone");
        let ev = event("docs:gone", ChangeOp::Insert, "bye");
        let batch = stage(&f, indexed("docs:gone", "bye"), vec![], vec![staged(ev, None, vec![])]).await;
        f.swap.commit(batch).await.unwrap();

        let removed: Vec<ChunkId> = f.store.snapshot().document_chunks(&id).into_iter().map(|c| c.chunk.id).collect();
        let del = event("docs:gone", ChangeOp::Delete, "");
        let batch = stage(&f, vec![], removed.clone(), vec![staged(del, Some(1), removed.clone())]).await;
        let out = f.swap.commit(batch).await.unwrap();
        assert_eq!(out.generation, Some(2));

        assert!(f.store.snapshot().document_chunks(&id).is_empty());
        assert!(f.hashes.get(&id).await.unwrap().unwrap().tombstoned);
        let audit = f.ledger.tombstones(Some(&id)).await.unwrap();
        assert_eq!(audit.len(), 1);
        assert_eq!(audit[0].chunk_ids, removed);
        assert_eq!(audit[0].generation, 2);
    }

    #[tokio::test]
    async fn operator_rollback_invalidates_changed_documents() {
        let f = fixture(Arc::new(AcceptAll));
        let a = event("docs:a", ChangeOp::Insert, "one");
        let batch = stage(&f, indexed("docs:a", "one"), vec![], vec![staged(a, None, vec![])]).await;
        f.swap.commit(batch).await.unwrap();
        let b = event("docs:b", ChangeOp::Insert, "two");
        let batch = stage(&f, indexed("docs:b", "two"), vec![], vec![staged(b, None, vec![])]).await;
        f.swap.commit(batch).await.unwrap();

        let affected = f.swap.rollback_to(1).await.unwrap();
        assert_eq!(affected, vec![DocumentId::from("docs:b")]);
        assert_eq!(f.store.current_generation(), 1);

        let b = f.hashes.get(&DocumentId::from("docs:b")).await.unwrap().unwrap();
        assert_eq!(b.version, 2);
        assert!(b.content_hash.is_empty());
        assert!(f.swap.rollback_to(42).await.is_err());
    }
}
