//! Generational vector store.
//!
//! Every committed generation is an immutable [`Snapshot`]; the live
//! index is an `Arc<Snapshot>` pointer. A commit builds the next snapshot
//! from the current one plus a staged delta and then swaps the pointer,
//! so a reader that resolved the pointer keeps a consistent view for as
//! long as it holds the `Arc`. Rollback swaps the pointer back to a
//! retained snapshot; nothing is restored.
//!
//! Staged writes are per-document deltas (upserts plus tombstones). They
//! are rebased onto whatever generation is current at commit time, which
//! is sound because the update queue never lets two batches touch the
//! same document at once.
//!
//! [`SqliteVectorStore`] keeps the same in-memory snapshots and mirrors
//! the live generation into the `index_chunks` table so the index
//! survives restarts, together with undo records that rebuild the
//! retained generations on reopen.

use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use serde::Serialize;
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, SqlitePool};
use tracing::debug;
use uuid::Uuid;

use crate::embedding::{blob_to_vec, cosine_similarity, vec_to_blob};
use crate::error::{SyncError, SyncResult};
use crate::models::{Chunk, ChunkId, DocumentId, GenerationId, SourceType, Span};

/// A chunk with its vector and the metadata queries can filter on.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IndexedChunk {
    pub chunk: Chunk,
    #[serde(skip)]
    pub vector: Vec<f32>,
    pub source_type: SourceType,
    pub category: Option<String>,
    pub title: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct QueryFilter {
    pub source_type: Option<SourceType>,
    pub category: Option<String>,
    /// Only documents whose id starts with this prefix.
    pub document_prefix: Option<String>,
}

impl QueryFilter {
    pub fn matches(&self, c: &IndexedChunk) -> bool {
        if let Some(t) = self.source_type {
            if c.source_type != t {
                return false;
            }
        }
        if let Some(cat) = &self.category {
            if c.category.as_deref() != Some(cat.as_str()) {
                return false;
            }
        }
        if let Some(prefix) = &self.document_prefix {
            if !c.chunk.document_id.as_str().starts_with(prefix.as_str()) {
                return false;
            }
        }
        true
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub chunk_id: ChunkId,
    pub document_id: DocumentId,
    pub score: f32,
    pub title: Option<String>,
    pub text: String,
}

/// One immutable generation of the index.
///
/// Chunks are shared between generations through `Arc`, so a commit
/// copies the two maps (one pointer per chunk) but never a vector or a
/// chunk's text. Commit cost therefore grows with the index size; a
/// persistent map would make it proportional to the delta.
#[derive(Debug, Default)]
pub struct Snapshot {
    pub generation: GenerationId,
    chunks: BTreeMap<ChunkId, Arc<IndexedChunk>>,
    by_document: HashMap<DocumentId, BTreeSet<ChunkId>>,
}

impl Snapshot {
    pub fn empty(generation: GenerationId) -> Self {
        Self {
            generation,
            ..Default::default()
        }
    }

    fn from_chunks(generation: GenerationId, chunks: Vec<IndexedChunk>) -> Self {
        let mut snapshot = Self::empty(generation);
        for c in chunks {
            snapshot.put(Arc::new(c));
        }
        snapshot
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn get(&self, id: &ChunkId) -> Option<&Arc<IndexedChunk>> {
        self.chunks.get(id)
    }

    pub fn chunks(&self) -> impl Iterator<Item = &Arc<IndexedChunk>> {
        self.chunks.values()
    }

    /// A document's live chunks in chunk order.
    pub fn document_chunks(&self, id: &DocumentId) -> Vec<IndexedChunk> {
        let mut out: Vec<IndexedChunk> = self
            .by_document
            .get(id)
            .into_iter()
            .flatten()
            .filter_map(|cid| self.chunks.get(cid))
            .map(|c| IndexedChunk::clone(c))
            .collect();
        out.sort_by_key(|c| c.chunk.chunk_index);
        out
    }

    pub fn documents(&self, prefix: &str) -> Vec<DocumentId> {
        let mut ids: Vec<DocumentId> = self
            .by_document
            .keys()
            .filter(|d| d.as_str().starts_with(prefix))
            .cloned()
            .collect();
        ids.sort();
        ids
    }

    /// Rank chunks by cosine similarity; ties break on chunk id.
    pub fn search(&self, vector: &[f32], filter: &QueryFilter, top_k: usize) -> Vec<SearchHit> {
        let mut scored: Vec<(f32, &Arc<IndexedChunk>)> = self
            .chunks
            .values()
            .filter(|c| filter.matches(c))
            .map(|c| (cosine_similarity(vector, &c.vector), c))
            .collect();
        scored.sort_by(|a, b| {
            b.0.partial_cmp(&a.0)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.1.chunk.id.cmp(&b.1.chunk.id))
        });
        scored.truncate(top_k);
        scored
            .into_iter()
            .map(|(score, c)| SearchHit {
                chunk_id: c.chunk.id.clone(),
                document_id: c.chunk.document_id.clone(),
                score,
                title: c.title.clone(),
                text: c.chunk.text.clone(),
            })
            .collect()
    }

    fn put(&mut self, c: Arc<IndexedChunk>) {
        self.by_document
            .entry(c.chunk.document_id.clone())
            .or_default()
            .insert(c.chunk.id.clone());
        self.chunks.insert(c.chunk.id.clone(), c);
    }

    fn remove(&mut self, id: &ChunkId) {
        if let Some(c) = self.chunks.remove(id) {
            if let Some(set) = self.by_document.get_mut(&c.chunk.document_id) {
                set.remove(id);
                if set.is_empty() {
                    self.by_document.remove(&c.chunk.document_id);
                }
            }
        }
    }

    /// The parent generation: this one with each chunk put back to its
    /// prior state (`None` where the chunk did not exist).
    fn revert(&self, parent: GenerationId, prior: Vec<(ChunkId, Option<IndexedChunk>)>) -> Snapshot {
        let mut out = Snapshot {
            generation: parent,
            chunks: self.chunks.clone(),
            by_document: self.by_document.clone(),
        };
        for (id, chunk) in prior {
            out.remove(&id);
            if let Some(c) = chunk {
                out.put(Arc::new(c));
            }
        }
        out
    }

    /// The next generation: this one with `staged` applied.
    fn apply(&self, generation: GenerationId, staged: &StagingHandle) -> Snapshot {
        let mut next = Snapshot {
            generation,
            chunks: self.chunks.clone(),
            by_document: self.by_document.clone(),
        };
        for id in &staged.tombstones {
            next.remove(id);
        }
        for c in &staged.upserts {
            next.put(Arc::new(c.clone()));
        }
        next
    }
}

/// A staged delta awaiting commit.
#[derive(Debug, Clone)]
pub struct StagingHandle {
    pub id: Uuid,
    /// Generation current when the delta was staged.
    pub base_generation: GenerationId,
    /// Generation the delta was staged for; the commit may assign a later one.
    pub target_generation: GenerationId,
    pub upserts: Vec<IndexedChunk>,
    pub tombstones: Vec<ChunkId>,
}

impl StagingHandle {
    /// Documents touched by the delta.
    pub fn documents(&self) -> BTreeSet<DocumentId> {
        self.upserts
            .iter()
            .map(|c| c.chunk.document_id.clone())
            .chain(self.tombstones.iter().map(|id| id.document_id()))
            .collect()
    }

    /// Drop every write for documents where `keep` is false.
    pub fn retain_documents(&mut self, keep: impl Fn(&DocumentId) -> bool) {
        self.upserts.retain(|c| keep(&c.chunk.document_id));
        self.tombstones.retain(|id| keep(&id.document_id()));
    }

    pub fn is_empty(&self) -> bool {
        self.upserts.is_empty() && self.tombstones.is_empty()
    }
}

#[async_trait]
pub trait VectorStore: Send + Sync {
    /// The live snapshot. Resolve once per query for consistent reads.
    fn snapshot(&self) -> Arc<Snapshot>;

    /// A retained snapshot by generation.
    fn snapshot_at(&self, generation: GenerationId) -> Option<Arc<Snapshot>>;

    /// Retained generations, oldest first.
    fn retained_generations(&self) -> Vec<GenerationId>;

    async fn stage_write(
        &self,
        upserts: Vec<IndexedChunk>,
        tombstones: Vec<ChunkId>,
    ) -> SyncResult<StagingHandle>;

    /// Apply a staged delta as a new generation and make it live.
    async fn commit(&self, handle: StagingHandle) -> SyncResult<GenerationId>;

    /// Make a retained generation live again.
    async fn rollback(&self, to: GenerationId) -> SyncResult<()>;

    fn current_generation(&self) -> GenerationId {
        self.snapshot().generation
    }

    async fn query(
        &self,
        vector: &[f32],
        filter: &QueryFilter,
        generation: Option<GenerationId>,
        top_k: usize,
    ) -> SyncResult<Vec<SearchHit>> {
        let snapshot = match generation {
            None => self.snapshot(),
            Some(g) => self.snapshot_at(g).ok_or_else(|| SyncError::NotFound {
                kind: "generation",
                id: g.to_string(),
            })?,
        };
        Ok(snapshot.search(vector, filter, top_k))
    }

    async fn live_chunks(&self, id: &DocumentId) -> SyncResult<Vec<IndexedChunk>> {
        Ok(self.snapshot().document_chunks(id))
    }
}

/// In-memory store keeping the last `history` generations.
pub struct MemoryVectorStore {
    current: RwLock<Arc<Snapshot>>,
    history: Mutex<VecDeque<Arc<Snapshot>>>,
    history_len: usize,
    next_generation: AtomicU64,
    dims: Option<usize>,
    writer: tokio::sync::Mutex<()>,
}

impl MemoryVectorStore {
    pub fn new(history_len: usize, dims: Option<usize>) -> Self {
        Self::with_history(vec![Arc::new(Snapshot::empty(0))], 1, history_len, dims)
    }

    /// `history` is oldest first and must not be empty; its last entry is live.
    fn with_history(
        history: Vec<Arc<Snapshot>>,
        next_generation: GenerationId,
        history_len: usize,
        dims: Option<usize>,
    ) -> Self {
        let current = history
            .last()
            .cloned()
            .unwrap_or_else(|| Arc::new(Snapshot::empty(0)));
        let history: VecDeque<Arc<Snapshot>> = history.into_iter().collect();
        Self {
            current: RwLock::new(current),
            history: Mutex::new(history),
            history_len: history_len.max(1),
            next_generation: AtomicU64::new(next_generation),
            dims,
            writer: tokio::sync::Mutex::new(()),
        }
    }

    fn validate(&self, upserts: &[IndexedChunk]) -> SyncResult<()> {
        let expected = self.dims.or_else(|| upserts.first().map(|c| c.vector.len()));
        for c in upserts {
            if c.vector.is_empty() || Some(c.vector.len()) != expected {
                return Err(SyncError::PermanentDocument {
                    document_id: c.chunk.document_id.clone(),
                    reason: format!(
                        "chunk {} has {} dims, expected {}",
                        c.chunk.id,
                        c.vector.len(),
                        expected.unwrap_or(0)
                    ),
                });
            }
        }
        Ok(())
    }

    fn build(&self, handle: &StagingHandle) -> Snapshot {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst);
        self.snapshot().apply(generation, handle)
    }

    fn install(&self, snapshot: Arc<Snapshot>) {
        {
            let mut history = self.history.lock().unwrap();
            if !history.iter().any(|s| s.generation == snapshot.generation) {
                history.push_back(snapshot.clone());
            }
            while history.len() > self.history_len {
                history.pop_front();
            }
        }
        *self.current.write().unwrap() = snapshot;
    }

    fn next_generation(&self) -> GenerationId {
        self.next_generation.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl VectorStore for MemoryVectorStore {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.current.read().unwrap().clone()
    }

    fn snapshot_at(&self, generation: GenerationId) -> Option<Arc<Snapshot>> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .find(|s| s.generation == generation)
            .cloned()
    }

    fn retained_generations(&self) -> Vec<GenerationId> {
        self.history
            .lock()
            .unwrap()
            .iter()
            .map(|s| s.generation)
            .collect()
    }

    async fn stage_write(
        &self,
        upserts: Vec<IndexedChunk>,
        tombstones: Vec<ChunkId>,
    ) -> SyncResult<StagingHandle> {
        self.validate(&upserts)?;
        Ok(StagingHandle {
            id: Uuid::new_v4(),
            base_generation: self.current_generation(),
            target_generation: self.next_generation(),
            upserts,
            tombstones,
        })
    }

    async fn commit(&self, handle: StagingHandle) -> SyncResult<GenerationId> {
        let _writer = self.writer.lock().await;
        let next = Arc::new(self.build(&handle));
        let generation = next.generation;
        self.install(next);
        debug!(generation, staged = %handle.id, "generation committed");
        Ok(generation)
    }

    async fn rollback(&self, to: GenerationId) -> SyncResult<()> {
        let _writer = self.writer.lock().await;
        let target = self.snapshot_at(to).ok_or_else(|| SyncError::NotFound {
            kind: "generation",
            id: to.to_string(),
        })?;
        *self.current.write().unwrap() = target;
        Ok(())
    }
}

/// Embedding model a persisted index was built with.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingStamp {
    pub model: String,
    pub dims: usize,
}

impl std::fmt::Display for EmbeddingStamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({} dims)", self.model, self.dims)
    }
}

/// [`MemoryVectorStore`] whose live generation is mirrored into SQLite.
///
/// Each commit also records which chunks it replaced (`index_undo`) and
/// its parent (`index_lineage`), so reopening the store rebuilds the
/// ancestors of the live generation up to `history_len` and they remain
/// available for rollback across restarts.
pub struct SqliteVectorStore {
    inner: MemoryVectorStore,
    pool: SqlitePool,
}

const CHUNK_COLUMNS: &str = "chunk_id, document_id, chunk_index, span_start, span_end, text, hash, \
                             source_type, category, title, embedding";

fn chunk_from_row(row: &SqliteRow) -> SyncResult<IndexedChunk> {
    let source_type: String = row.try_get("source_type")?;
    let blob: Vec<u8> = row.try_get("embedding")?;
    Ok(IndexedChunk {
        chunk: Chunk {
            id: ChunkId::from(row.try_get::<String, _>("chunk_id")?.as_str()),
            document_id: DocumentId::new(row.try_get::<String, _>("document_id")?),
            chunk_index: row.try_get("chunk_index")?,
            span: Span {
                start: row.try_get::<i64, _>("span_start")? as usize,
                end: row.try_get::<i64, _>("span_end")? as usize,
            },
            text: row.try_get("text")?,
            hash: row.try_get("hash")?,
        },
        vector: blob_to_vec(&blob),
        source_type: source_type.parse()?,
        category: row.try_get("category")?,
        title: row.try_get("title")?,
    })
}

impl SqliteVectorStore {
    /// Load the mirrored live generation and its recorded ancestors.
    pub async fn open(pool: SqlitePool, history_len: usize, dims: Option<usize>) -> SyncResult<Self> {
        let current = read_meta(&pool, "current_generation").await?.unwrap_or(0);
        let next = read_meta(&pool, "next_generation")
            .await?
            .unwrap_or(current + 1);

        let rows = sqlx::query(&format!("SELECT {} FROM index_chunks", CHUNK_COLUMNS))
            .fetch_all(&pool)
            .await?;
        let chunks = rows.iter().map(chunk_from_row).collect::<SyncResult<Vec<_>>>()?;
        let mut chain = vec![Arc::new(Snapshot::from_chunks(current, chunks))];

        while chain.len() < history_len.max(1) {
            let child = chain[chain.len() - 1].clone();
            let parent: Option<i64> =
                sqlx::query_scalar("SELECT parent FROM index_lineage WHERE generation = ?")
                    .bind(child.generation as i64)
                    .fetch_optional(&pool)
                    .await?;
            let Some(parent) = parent else { break };

            let rows = sqlx::query(&format!(
                "SELECT present, {} FROM index_undo WHERE generation = ?",
                CHUNK_COLUMNS
            ))
            .bind(child.generation as i64)
            .fetch_all(&pool)
            .await?;
            let mut prior = Vec::with_capacity(rows.len());
            for row in &rows {
                let id = ChunkId::from(row.try_get::<String, _>("chunk_id")?.as_str());
                let present: i64 = row.try_get("present")?;
                let chunk = if present != 0 { Some(chunk_from_row(row)?) } else { None };
                prior.push((id, chunk));
            }
            chain.push(Arc::new(child.revert(parent as u64, prior)));
        }
        chain.reverse();

        debug!(
            generation = current,
            chunks = chain[chain.len() - 1].len(),
            retained = chain.len(),
            "index loaded from sqlite"
        );
        Ok(Self {
            inner: MemoryVectorStore::with_history(chain, next, history_len, dims),
            pool,
        })
    }

    /// The recorded embedding model, if any.
    pub async fn embedding_stamp(&self) -> SyncResult<Option<EmbeddingStamp>> {
        let row = sqlx::query("SELECT model, dims FROM index_embedding WHERE id = 1")
            .fetch_optional(&self.pool)
            .await?;
        row.map(|row| -> SyncResult<EmbeddingStamp> {
            Ok(EmbeddingStamp {
                model: row.try_get("model")?,
                dims: row.try_get::<i64, _>("dims")? as usize,
            })
        })
        .transpose()
    }

    pub async fn record_embedding_stamp(&self, stamp: &EmbeddingStamp) -> SyncResult<()> {
        sqlx::query(
            "INSERT INTO index_embedding (id, model, dims, recorded_at) VALUES (1, ?, ?, ?)
             ON CONFLICT(id) DO UPDATE SET
                model = excluded.model,
                dims = excluded.dims,
                recorded_at = excluded.recorded_at",
        )
        .bind(&stamp.model)
        .bind(stamp.dims as i64)
        .bind(chrono::Utc::now().to_rfc3339())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    /// Rewrite the mirror from `from` to `to` in one transaction. A commit
    /// (`lineage`) also records how to get from `to` back to `from`.
    async fn mirror(&self, from: &Snapshot, to: &Snapshot, lineage: bool) -> SyncResult<()> {
        let mut tx = self.pool.begin().await?;

        let removed: Vec<&ChunkId> = from
            .chunks
            .keys()
            .filter(|id| !to.chunks.contains_key(*id))
            .collect();
        let written: Vec<(&ChunkId, &Arc<IndexedChunk>)> = to
            .chunks
            .iter()
            .filter(|(id, c)| !from.chunks.get(*id).is_some_and(|old| Arc::ptr_eq(old, c)))
            .collect();

        for id in &removed {
            sqlx::query("DELETE FROM index_chunks WHERE chunk_id = ?")
                .bind(id.as_str())
                .execute(&mut *tx)
                .await?;
        }

        for (id, c) in &written {
            sqlx::query(&format!(
                "INSERT INTO index_chunks ({}) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
                 ON CONFLICT(chunk_id) DO UPDATE SET
                    document_id = excluded.document_id,
                    chunk_index = excluded.chunk_index,
                    span_start = excluded.span_start,
                    span_end = excluded.span_end,
                    text = excluded.text,
                    hash = excluded.hash,
                    source_type = excluded.source_type,
                    category = excluded.category,
                    title = excluded.title,
                    embedding = excluded.embedding",
                CHUNK_COLUMNS
            ))
            .bind(id.as_str())
            .bind(c.chunk.document_id.as_str())
            .bind(c.chunk.chunk_index)
            .bind(c.chunk.span.start as i64)
            .bind(c.chunk.span.end as i64)
            .bind(&c.chunk.text)
            .bind(&c.chunk.hash)
            .bind(c.source_type.as_str())
            .bind(&c.category)
            .bind(&c.title)
            .bind(vec_to_blob(&c.vector))
            .execute(&mut *tx)
            .await?;
        }

        if lineage {
            sqlx::query(
                "INSERT INTO index_lineage (generation, parent) VALUES (?, ?)
                 ON CONFLICT(generation) DO UPDATE SET parent = excluded.parent",
            )
            .bind(to.generation as i64)
            .bind(from.generation as i64)
            .execute(&mut *tx)
            .await?;

            let touched = removed.iter().copied().chain(written.iter().map(|(id, _)| *id));
            for id in touched {
                let prior = from.chunks.get(id);
                sqlx::query(&format!(
                    "INSERT OR REPLACE INTO index_undo (generation, present, {})
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                    CHUNK_COLUMNS
                ))
                .bind(to.generation as i64)
                .bind(prior.is_some() as i64)
                .bind(id.as_str())
                .bind(prior.map(|c| c.chunk.document_id.as_str().to_string()))
                .bind(prior.map(|c| c.chunk.chunk_index))
                .bind(prior.map(|c| c.chunk.span.start as i64))
                .bind(prior.map(|c| c.chunk.span.end as i64))
                .bind(prior.map(|c| c.chunk.text.clone()))
                .bind(prior.map(|c| c.chunk.hash.clone()))
                .bind(prior.map(|c| c.source_type.as_str()))
                .bind(prior.and_then(|c| c.category.clone()))
                .bind(prior.and_then(|c| c.title.clone()))
                .bind(prior.map(|c| vec_to_blob(&c.vector)))
                .execute(&mut *tx)
                .await?;
            }

            // Keep undo records only for retained generations.
            let oldest = self
                .inner
                .retained_generations()
                .first()
                .copied()
                .unwrap_or(from.generation)
                .min(from.generation);
            for table in ["index_undo", "index_lineage"] {
                sqlx::query(&format!("DELETE FROM {} WHERE generation < ?", table))
                    .bind(oldest as i64)
                    .execute(&mut *tx)
                    .await?;
            }
        }

        for (key, value) in [
            ("current_generation", to.generation),
            ("next_generation", self.inner.next_generation()),
        ] {
            sqlx::query(
                "INSERT INTO index_meta (key, value) VALUES (?, ?)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
            )
            .bind(key)
            .bind(value as i64)
            .execute(&mut *tx)
            .await?;
        }

        tx.commit().await?;
        Ok(())
    }
}

async fn read_meta(pool: &SqlitePool, key: &str) -> SyncResult<Option<u64>> {
    let value: Option<i64> = sqlx::query_scalar("SELECT value FROM index_meta WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await?;
    Ok(value.map(|v| v as u64))
}

#[async_trait]
impl VectorStore for SqliteVectorStore {
    fn snapshot(&self) -> Arc<Snapshot> {
        self.inner.snapshot()
    }

    fn snapshot_at(&self, generation: GenerationId) -> Option<Arc<Snapshot>> {
        self.inner.snapshot_at(generation)
    }

    fn retained_generations(&self) -> Vec<GenerationId> {
        self.inner.retained_generations()
    }

    async fn stage_write(
        &self,
        upserts: Vec<IndexedChunk>,
        tombstones: Vec<ChunkId>,
    ) -> SyncResult<StagingHandle> {
        self.inner.stage_write(upserts, tombstones).await
    }

    async fn commit(&self, handle: StagingHandle) -> SyncResult<GenerationId> {
        let _writer = self.inner.writer.lock().await;
        let current = self.inner.snapshot();
        let next = Arc::new(self.inner.build(&handle));
        self.mirror(&current, &next, true).await?;
        let generation = next.generation;
        self.inner.install(next);
        Ok(generation)
    }

    async fn rollback(&self, to: GenerationId) -> SyncResult<()> {
        let _writer = self.inner.writer.lock().await;
        let target = self.inner.snapshot_at(to).ok_or_else(|| SyncError::NotFound {
            kind: "generation",
            id: to.to_string(),
        })?;
        let current = self.inner.snapshot();
        self.mirror(&current, &target, false).await?;
        *self.inner.current.write().unwrap() = target;
        Ok(())
    }
}
