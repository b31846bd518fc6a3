//! Batch Reindex Workers.
//!
//! A fixed pool of tokio tasks drains the update queue. Each worker:
//!
//! 1. collects an [`UpdateBatch`]: the first event blocks, further events
//!    are taken until `max_batch_size` or `collect_timeout` (whichever
//!    comes first);
//! 2. plans every document: re-chunks the event's content, diffs it
//!    against the document's live chunks, and carries the previous vector
//!    over for every chunk whose text did not change;
//! 3. embeds the remaining chunks of the whole batch in groups of
//!    `embedding.batch_size`, retrying failed calls with backoff;
//! 4. stages upserts and tombstones and hands them to the swap
//!    coordinator.
//!
//! Failures stay with their document: an embedding rejection, or a group
//! that keeps failing after all retries, parks just the documents involved
//! in the dead-letter set and the rest of the batch commits. Failures of
//! the stores themselves retry the whole batch up to `batch_max_retries`.
//! Every document of the batch is completed on the queue at the end, which
//! releases any event that arrived for it meanwhile.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_text, normalize_content};
use crate::config::{ClassifierConfig, EmbeddingConfig, WorkerConfig};
use crate::diff::{analyze, analyze_delete, DiffContext};
use crate::embedding::Embedder;
use crate::error::{SyncError, SyncResult};
use crate::hash_store::ContentHashStore;
use crate::ledger::Ledger;
use crate::models::{ChangeEvent, ChangeOp, Chunk, ChunkId, DeadLetter, DocumentId, UpdateBatch};
use crate::progress::{SyncProgressEvent, SyncProgressReporter};
use crate::quality::RollbackManager;
use crate::queue::UpdateQueue;
use crate::retry::Backoff;
use crate::stats::EngineStats;
use crate::swap::{CommitOutcome, StagedBatch, StagedDocument, SwapCoordinator};
use crate::vector_store::{IndexedChunk, VectorStore};

/// Everything a worker needs, shared by the pool.
pub struct WorkerContext {
    pub queue: Arc<UpdateQueue>,
    pub store: Arc<dyn VectorStore>,
    pub hashes: Arc<dyn ContentHashStore>,
    pub ledger: Arc<dyn Ledger>,
    pub embedder: Arc<dyn Embedder>,
    pub swap: Arc<SwapCoordinator>,
    pub rollbacks: Arc<RollbackManager>,
    pub stats: Arc<EngineStats>,
    pub workers: WorkerConfig,
    pub embedding: EmbeddingConfig,
    pub rules: ClassifierConfig,
    pub max_tokens: usize,
    pub progress: Arc<dyn SyncProgressReporter>,
}

impl WorkerContext {
    fn embed_backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.workers.embed_backoff_ms),
            Duration::from_millis(self.workers.embed_backoff_cap_ms),
            self.workers.embed_max_retries,
        )
    }
}

pub struct WorkerPool {
    handles: Vec<JoinHandle<()>>,
}

impl WorkerPool {
    pub fn spawn(ctx: Arc<WorkerContext>, size: usize) -> Self {
        let handles = (0..size.max(1))
            .map(|worker| {
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    debug!(worker, "worker started");
                    while let Some(batch) = collect_batch(&ctx).await {
                        process_batch(&ctx, batch).await;
                    }
                    debug!(worker, "worker stopped");
                })
            })
            .collect();
        Self { handles }
    }

    /// Wait for every worker to finish. Workers stop once the queue is
    /// closed and drained.
    pub async fn join(self) {
        for handle in self.handles {
            if let Err(e) = handle.await {
                error!(error = %e, "worker task panicked");
            }
        }
    }
}

/// Wait for one event, then gather more until the batch is full or the
/// collection window closes. `None` once the queue is closed and drained.
pub async fn collect_batch(ctx: &WorkerContext) -> Option<UpdateBatch> {
    let first = ctx.queue.dequeue().await?;
    let mut events = vec![first];
    let deadline = Instant::now() + ctx.workers.collect_timeout();
    while events.len() < ctx.workers.max_batch_size {
        match timeout_at(deadline, ctx.queue.dequeue()).await {
            Ok(Some(event)) => events.push(event),
            Ok(None) | Err(_) => break,
        }
    }
    Some(UpdateBatch::new(events))
}

/// Process a batch to completion, then release its documents.
pub async fn process_batch(ctx: &WorkerContext, mut batch: UpdateBatch) {
    ctx.stats.batches.incr();
    let documents: Vec<DocumentId> = batch.events.iter().map(|e| e.document_id.clone()).collect();
    let backoff = Backoff::new(
        Duration::from_millis(ctx.workers.embed_backoff_ms),
        Duration::from_millis(ctx.workers.embed_backoff_cap_ms),
        ctx.workers.batch_max_retries,
    );

    loop {
        match attempt(ctx, &mut batch).await {
            Ok(outcome) => {
                settle(ctx, outcome).await;
                break;
            }
            Err(e) if e.is_retryable() && batch.attempt < ctx.workers.batch_max_retries => {
                batch.attempt += 1;
                let delay = backoff.delay(batch.attempt);
                warn!(batch = %batch.id, attempt = batch.attempt, error = %e, "batch failed, retrying");
                tokio::time::sleep(delay).await;
            }
            Err(e) => {
                error!(batch = %batch.id, error = %e, "batch failed permanently");
                let reason = format!("batch failed after {} attempts: {}", batch.attempt + 1, e);
                for event in &batch.events {
                    park(ctx, event, &reason, batch.attempt + 1).await;
                }
                break;
            }
        }
    }

    for id in &documents {
        ctx.queue.complete(id);
    }
}

/// One document's planned write before embedding.
struct Plan {
    event: ChangeEvent,
    expected_version: Option<u64>,
    /// Chunks written with a carried-over vector.
    reused: Vec<IndexedChunk>,
    /// Chunks that need a fresh vector.
    to_embed: Vec<Chunk>,
    tombstones: Vec<ChunkId>,
}

/// One pass over the batch. Events that are settled without reaching the
/// swap (stale or parked) leave `batch.events`, so a retried batch does
/// not handle them twice.
async fn attempt(ctx: &WorkerContext, batch: &mut UpdateBatch) -> SyncResult<CommitOutcome> {
    let mut outcome = CommitOutcome::default();
    let mut plans = Vec::new();
    let mut settled: HashSet<Uuid> = HashSet::new();

    for event in &batch.events {
        if ctx.queue.is_superseded(&event.document_id) {
            outcome.stale.push(event.clone());
            settled.insert(event.id);
            continue;
        }
        match plan(ctx, event).await {
            Ok(p) => plans.push(p),
            Err(e) if e.is_retryable() => return Err(e),
            Err(e) => {
                park(ctx, event, &e.to_string(), 1).await;
                settled.insert(event.id);
            }
        }
    }

    let vectors = embed_plans(ctx, &plans).await;

    let mut upserts = Vec::new();
    let mut tombstones = Vec::new();
    let mut documents = Vec::new();
    for (plan, vectors) in plans.into_iter().zip(vectors) {
        let fresh = match vectors {
            Ok(v) => v,
            Err((reason, attempts)) => {
                park(ctx, &plan.event, &reason, attempts).await;
                settled.insert(plan.event.id);
                continue;
            }
        };
        ctx.stats.chunks_reused.add(plan.reused.len() as u64);
        ctx.stats.chunks_embedded.add(fresh.len() as u64);

        upserts.extend(plan.reused);
        for (chunk, vector) in plan.to_embed.into_iter().zip(fresh) {
            upserts.push(indexed(&plan.event, chunk, vector));
        }
        tombstones.extend(plan.tombstones.iter().cloned());
        documents.push(StagedDocument {
            event: plan.event,
            expected_version: plan.expected_version,
            tombstones: plan.tombstones,
        });
    }

    batch.events.retain(|e| !settled.contains(&e.id));
    if documents.is_empty() {
        return Ok(outcome);
    }

    let handle = ctx.store.stage_write(upserts, tombstones).await?;
    debug!(
        batch = %batch.id,
        staged = %handle.id,
        target_generation = handle.target_generation,
        upserts = handle.upserts.len(),
        tombstones = handle.tombstones.len(),
        "batch staged"
    );

    let mut committed = ctx
        .swap
        .commit(StagedBatch {
            batch_id: batch.id,
            handle,
            documents,
        })
        .await?;
    committed.stale.extend(outcome.stale);
    Ok(committed)
}

async fn plan(ctx: &WorkerContext, event: &ChangeEvent) -> SyncResult<Plan> {
    let id = &event.document_id;
    let expected_version = ctx.hashes.get(id).await?.map(|r| r.version);
    let live = ctx.store.live_chunks(id).await?;
    let previous: Vec<Chunk> = live.iter().map(|c| c.chunk.clone()).collect();

    if event.op == ChangeOp::Delete {
        return Ok(Plan {
            event: event.clone(),
            expected_version,
            reused: Vec::new(),
            to_embed: Vec::new(),
            tombstones: analyze_delete(&previous).removed,
        });
    }

    let body = event.body.as_deref().ok_or_else(|| SyncError::PermanentDocument {
        document_id: id.clone(),
        reason: format!("{} event without content", event.op),
    })?;
    let chunks = chunk_text(id, &normalize_content(body), ctx.max_tokens);
    let diff = analyze(
        Some(previous.as_slice()),
        &chunks,
        DiffContext {
            source_type: event.source_type,
            category: event.category.as_deref(),
        },
        &ctx.rules,
    );

    let live_by_id: HashMap<&ChunkId, &IndexedChunk> = live.iter().map(|c| (&c.chunk.id, c)).collect();
    let moved_from: HashMap<&ChunkId, &ChunkId> = diff.relocated.iter().map(|(from, to)| (to, from)).collect();
    let fresh: HashSet<&ChunkId> = if event.full_resync {
        chunks.iter().map(|c| &c.id).collect()
    } else {
        diff.needs_embedding().collect()
    };

    let mut reused = Vec::new();
    let mut to_embed = Vec::new();
    for chunk in &chunks {
        let source = moved_from.get(&chunk.id).copied().unwrap_or(&chunk.id);
        match (fresh.contains(&chunk.id), live_by_id.get(source)) {
            (false, Some(prev)) => {
                let carried = indexed(event, chunk.clone(), prev.vector.clone());
                // Identical entry already live under this id: nothing to write.
                if source != &chunk.id || !same_entry(prev, &carried) {
                    reused.push(carried);
                }
            }
            _ => to_embed.push(chunk.clone()),
        }
    }

    Ok(Plan {
        event: event.clone(),
        expected_version,
        reused,
        to_embed,
        tombstones: diff.tombstones(),
    })
}

type PlanVectors = Result<Vec<Vec<f32>>, (String, u32)>;

/// Embed every plan's chunks across the batch. Per plan: the vectors in
/// `to_embed` order, or the reason and attempt count that failed it.
async fn embed_plans(ctx: &WorkerContext, plans: &[Plan]) -> Vec<PlanVectors> {
    let mut owners: Vec<(usize, usize)> = Vec::new();
    let mut texts: Vec<String> = Vec::new();
    for (p, plan) in plans.iter().enumerate() {
        for (c, chunk) in plan.to_embed.iter().enumerate() {
            owners.push((p, c));
            texts.push(chunk.text.clone());
        }
    }

    let mut slots: Vec<Vec<Option<Vec<f32>>>> = plans.iter().map(|p| vec![None; p.to_embed.len()]).collect();
    let mut failed: HashMap<usize, (String, u32)> = HashMap::new();
    let backoff = ctx.embed_backoff();
    let group_size = ctx.embedding.batch_size.max(1);
    let dims = ctx.embedder.dims();

    for (g, group) in texts.chunks(group_size).enumerate() {
        let offset = g * group_size;
        let group_owners = &owners[offset..offset + group.len()];
        // Skip groups whose every owner already failed.
        if group_owners.iter().all(|(p, _)| failed.contains_key(p)) {
            continue;
        }

        let attempts = AtomicU32::new(0);
        let result = backoff
            .retry_if(
                "embed",
                |_| {
                    attempts.fetch_add(1, Ordering::Relaxed);
                    ctx.embedder.embed(group)
                },
                |e: &SyncError| e.is_retryable(),
            )
            .await;
        let attempts = attempts.into_inner();

        match result {
            Ok(results) if results.len() == group.len() => {
                for ((p, c), result) in group_owners.iter().zip(results) {
                    match result {
                        Ok(vector) if vector.len() != dims => {
                            failed.entry(*p).or_insert_with(|| {
                                (format!("embedding has {} dims, expected {}", vector.len(), dims), attempts)
                            });
                        }
                        Ok(vector) => slots[*p][*c] = Some(vector),
                        Err(reason) => {
                            failed
                                .entry(*p)
                                .or_insert_with(|| (format!("embedding rejected: {}", reason), attempts));
                        }
                    }
                }
            }
            Ok(results) => {
                let reason = format!(
                    "embedding returned {} vectors for {} texts",
                    results.len(),
                    group.len()
                );
                for (p, _) in group_owners {
                    failed.entry(*p).or_insert_with(|| (reason.clone(), attempts));
                }
            }
            Err(e) => {
                let reason = format!("embedding failed after {} attempts: {}", attempts, e);
                for (p, _) in group_owners {
                    failed.entry(*p).or_insert_with(|| (reason.clone(), attempts));
                }
            }
        }
    }

    slots
        .into_iter()
        .enumerate()
        .map(|(p, vectors)| match failed.remove(&p) {
            Some(failure) => Err(failure),
            None => Ok(vectors.into_iter().flatten().collect()),
        })
        .collect()
}

fn indexed(event: &ChangeEvent, chunk: Chunk, vector: Vec<f32>) -> IndexedChunk {
    IndexedChunk {
        chunk,
        vector,
        source_type: event.source_type,
        category: event.category.clone(),
        title: event.title.clone(),
    }
}

fn same_entry(a: &IndexedChunk, b: &IndexedChunk) -> bool {
    a.chunk == b.chunk && a.source_type == b.source_type && a.category == b.category && a.title == b.title
}

async fn park(ctx: &WorkerContext, event: &ChangeEvent, reason: &str, attempts: u32) {
    warn!(document_id = %event.document_id, %reason, "parking change event in dead-letter set");
    let letter = DeadLetter {
        id: Uuid::new_v4(),
        document_id: event.document_id.clone(),
        event: event.clone(),
        reason: reason.to_string(),
        attempts,
        failed_at: Utc::now(),
    };
    match ctx.ledger.park(&letter).await {
        Ok(()) => ctx.stats.dead_lettered.incr(),
        Err(e) => error!(document_id = %event.document_id, error = %e, "failed to park change event"),
    }
}

/// Apply a commit outcome: count it, re-queue conflicts, and hand
/// rolled-back work to the rollback manager. Runs before the batch's
/// documents are completed, so re-queued events wait their turn.
async fn settle(ctx: &WorkerContext, outcome: CommitOutcome) {
    if let Some(generation) = outcome.generation {
        ctx.stats.generations.incr();
        info!(generation, documents = outcome.accepted.len(), "batch committed");
        ctx.progress.report(SyncProgressEvent::Committed {
            generation,
            documents: outcome.accepted.len() as u64,
        });
    }
    ctx.stats.committed.add(outcome.accepted.len() as u64);
    ctx.stats.discarded_stale.add(outcome.stale.len() as u64);

    for event in outcome.conflicted {
        ctx.stats.version_conflicts.incr();
        if ctx.queue.is_superseded(&event.document_id) {
            continue;
        }
        if let Err(e) = ctx.queue.requeue(event.clone()) {
            warn!(document_id = %event.document_id, error = %e, "could not re-queue conflicted event");
        }
    }

    if let Some(rolled) = outcome.rolled_back {
        ctx.stats.rolled_back.add(rolled.events.len() as u64);
        ctx.progress.report(SyncProgressEvent::RolledBack {
            from: rolled.from,
            to: rolled.to,
        });
        match ctx.rollbacks.dispose(&rolled.events, &rolled.detail).await {
            Ok(disposition) => {
                ctx.stats.dead_lettered.add(disposition.parked as u64);
                info!(
                    from = rolled.from,
                    to = rolled.to,
                    requeued = disposition.requeued,
                    parked = disposition.parked,
                    "rolled-back events disposed"
                );
            }
            Err(e) => error!(error = %e, "failed to dispose rolled-back events"),
        }
    }
}
