//! Change Detector: turns source observations into change events.
//!
//! Observations come from full scans of a [`Source`] listing or from push
//! [`Notification`]s. For each observed document the normalized content
//! hash is compared with the content hash store:
//!
//! - no record, or a tombstoned one: insert;
//! - different hash: update;
//! - a previously known id missing from a successful full scan: delete.
//!
//! Observations are not emitted right away. They sit in a debounce
//! buffer keyed by document id for the quiet period of their provisional
//! priority class; a newer observation of the same document replaces the
//! buffered one and restarts the window (bounded to four windows after
//! the first sighting), so an editor writing a file several times per save
//! produces one event carrying the final state. [`ChangeDetector::flush_due`]
//! emits what has been quiet long enough.
//!
//! Source reads are retried with exponential backoff. A document whose
//! reads exhaust the retries is recorded as degraded and skipped; the
//! rest of the scan continues. If the hash store cannot be read, the
//! document is treated as unknown and emitted anyway.
//!
//! An event the queue turns away (rejected when full, or displaced by
//! higher-priority work) is held by the detector and offered again at the
//! start of the next flush, ahead of fresh observations.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::chunk::{chunk_text, content_hash, normalize_content};
use crate::classify::{classify, provisional};
use crate::config::{ClassifierConfig, DetectorConfig};
use crate::diff::{analyze, analyze_delete, DiffContext};
use crate::error::{SyncError, SyncResult};
use crate::hash_store::ContentHashStore;
use crate::models::{ChangeEvent, ChangeOp, Chunk, DocumentId, PriorityClass, SourceItem, SourceType};
use crate::queue::{EnqueueOutcome, UpdateQueue};
use crate::retry::Backoff;
use crate::source::{Notification, Source};
use crate::stats::EngineStats;
use crate::vector_store::VectorStore;

/// Debounce windows stretch at most this many times past the first sighting.
const MAX_WINDOWS: u32 = 4;

/// A document whose source reads keep failing.
#[derive(Debug, Clone, Serialize)]
pub struct DegradedDocument {
    pub document_id: DocumentId,
    pub source: String,
    pub reason: String,
    pub attempts: u32,
    pub since: DateTime<Utc>,
}

/// Summary of one scan.
#[derive(Debug, Clone, Default, Serialize)]
pub struct ScanReport {
    pub source: String,
    pub listed: usize,
    pub unchanged: usize,
    pub changed: usize,
    pub deleted: usize,
    pub failed: usize,
}

struct Observation {
    op: ChangeOp,
    source_type: SourceType,
    item: Option<SourceItem>,
    hash: Option<String>,
    sequence: u64,
    detected_at: DateTime<Utc>,
    first_seen: Instant,
    deadline: Instant,
    full_resync: bool,
}

pub struct ChangeDetector {
    hashes: Arc<dyn ContentHashStore>,
    store: Arc<dyn VectorStore>,
    queue: Arc<UpdateQueue>,
    stats: Arc<EngineStats>,
    config: DetectorConfig,
    rules: ClassifierConfig,
    max_tokens: usize,
    buffer: Mutex<HashMap<DocumentId, Observation>>,
    /// Events turned away by a full queue, re-offered on the next flush.
    held: Mutex<Vec<ChangeEvent>>,
    degraded: Mutex<BTreeMap<DocumentId, DegradedDocument>>,
}

impl ChangeDetector {
    pub fn new(
        hashes: Arc<dyn ContentHashStore>,
        store: Arc<dyn VectorStore>,
        queue: Arc<UpdateQueue>,
        stats: Arc<EngineStats>,
        config: DetectorConfig,
        rules: ClassifierConfig,
        max_tokens: usize,
    ) -> Self {
        Self {
            hashes,
            store,
            queue,
            stats,
            config,
            rules,
            max_tokens,
            buffer: Mutex::new(HashMap::new()),
            held: Mutex::new(Vec::new()),
            degraded: Mutex::new(BTreeMap::new()),
        }
    }

    fn backoff(&self) -> Backoff {
        Backoff::new(
            Duration::from_millis(self.config.read_backoff_ms),
            Duration::from_millis(self.config.read_backoff_cap_ms),
            self.config.read_max_retries,
        )
    }

    /// Scan a source: observe changed items and every known id that
    /// disappeared. A failed listing observes nothing, so no deletes are
    /// inferred from a partial view.
    pub async fn scan(&self, source: &dyn Source) -> SyncResult<ScanReport> {
        self.scan_with(source, false).await
    }

    /// Full resync: every listed item is observed regardless of its
    /// recorded hash and re-embedded in full, and indexed documents the
    /// source no longer has are deleted even if the hash store forgot them.
    pub async fn resync(&self, source: &dyn Source) -> SyncResult<ScanReport> {
        self.scan_with(source, true).await
    }

    async fn scan_with(&self, source: &dyn Source, force: bool) -> SyncResult<ScanReport> {
        let mut report = ScanReport {
            source: source.name().to_string(),
            ..Default::default()
        };

        let what = format!("list {}", source.name());
        let listing = self
            .backoff()
            .retry(&what, |_| source.list())
            .await
            .map_err(|e| SyncError::transient("source", format!("{}: {:#}", source.name(), e)))?;
        report.listed = listing.len();

        let mut seen: BTreeSet<DocumentId> = BTreeSet::new();
        for entry in listing {
            seen.insert(entry.document_id.clone());

            // Sources that list hashes spare the fetch for unchanged items.
            if let (false, Some(listed)) = (force, &entry.content_hash) {
                if let Ok(Some(record)) = self.hashes.get(&entry.document_id).await {
                    if !record.tombstoned && &record.content_hash == listed {
                        self.discard(&entry.document_id);
                        report.unchanged += 1;
                        continue;
                    }
                }
            }

            match self.read(source, &entry.document_id).await {
                Some(item) => {
                    if self.observe_item(item, force).await? {
                        report.changed += 1;
                    } else {
                        report.unchanged += 1;
                    }
                }
                None => report.failed += 1,
            }
        }

        let prefix = source.id_prefix();
        let mut known: BTreeSet<DocumentId> = match self.hashes.live_ids(&prefix).await {
            Ok(ids) => ids.into_iter().collect(),
            Err(e) => {
                warn!(source = %source.name(), error = %e, "hash store unavailable, skipping delete detection");
                BTreeSet::new()
            }
        };
        if force {
            known.extend(self.store.snapshot().documents(&prefix));
        }
        for id in known.difference(&seen) {
            if self.observe_delete(id, source.source_type(), force).await? {
                report.deleted += 1;
            }
        }

        info!(
            source = %report.source,
            listed = report.listed,
            changed = report.changed,
            deleted = report.deleted,
            failed = report.failed,
            "scan complete"
        );
        Ok(report)
    }

    /// Handle a push notification. Upserts without a payload are fetched
    /// from `source`.
    pub async fn notify(&self, source: &dyn Source, note: Notification) -> SyncResult<bool> {
        match (note.op, note.item) {
            (ChangeOp::Delete, _) => {
                self.observe_delete(&note.document_id, source.source_type(), false)
                    .await
            }
            (_, Some(item)) => self.observe_item(item, false).await,
            (_, None) => match self.read(source, &note.document_id).await {
                Some(item) => self.observe_item(item, false).await,
                None => Ok(false),
            },
        }
    }

    /// Fetch with retries; on exhaustion mark the document degraded.
    async fn read(&self, source: &dyn Source, id: &DocumentId) -> Option<SourceItem> {
        let backoff = self.backoff();
        let what = format!("read {}", id);
        match backoff.retry(&what, |_| source.fetch(id)).await {
            Ok(item) => {
                if self.degraded.lock().unwrap().remove(id).is_some() {
                    info!(document_id = %id, "degraded document readable again");
                }
                Some(item)
            }
            Err(e) => {
                warn!(document_id = %id, error = %format!("{:#}", e), "source read failed, marking degraded");
                self.stats.read_failures.incr();
                let mut degraded = self.degraded.lock().unwrap();
                let entry = degraded.entry(id.clone()).or_insert_with(|| DegradedDocument {
                    document_id: id.clone(),
                    source: source.name().to_string(),
                    reason: String::new(),
                    attempts: 0,
                    since: Utc::now(),
                });
                entry.reason = format!("{:#}", e);
                entry.attempts += backoff.max_retries + 1;
                None
            }
        }
    }

    /// Buffer an observed item. Returns whether it differs from the
    /// recorded state.
    pub async fn observe_item(&self, item: SourceItem, force: bool) -> SyncResult<bool> {
        let hash = content_hash(&item.body);
        let op = match self.hashes.get(&item.document_id).await {
            Ok(Some(record)) if !record.tombstoned => {
                if record.content_hash == hash && !force {
                    self.discard(&item.document_id);
                    return Ok(false);
                }
                ChangeOp::Update
            }
            Ok(_) => ChangeOp::Insert,
            Err(e) => {
                warn!(document_id = %item.document_id, error = %e, "hash store unavailable, treating document as changed");
                if self.store.snapshot().document_chunks(&item.document_id).is_empty() {
                    ChangeOp::Insert
                } else {
                    ChangeOp::Update
                }
            }
        };

        let class = provisional(op, item.source_type, item.category.as_deref(), &self.rules);
        let id = item.document_id.clone();
        self.buffer_observation(id, op, item.source_type, Some(item), Some(hash), class, force);
        Ok(true)
    }

    /// Buffer a delete for a document the engine knows about. Unknown or
    /// already tombstoned documents with nothing indexed are ignored.
    pub async fn observe_delete(&self, id: &DocumentId, source_type: SourceType, force: bool) -> SyncResult<bool> {
        let recorded = match self.hashes.get(id).await {
            Ok(Some(record)) => !record.tombstoned,
            Ok(None) => false,
            Err(e) => {
                warn!(document_id = %id, error = %e, "hash store unavailable, checking index instead");
                false
            }
        };
        let indexed = !self.store.snapshot().document_chunks(id).is_empty();
        if !recorded && !indexed {
            self.discard(id);
            return Ok(false);
        }

        let class = provisional(ChangeOp::Delete, source_type, None, &self.rules);
        self.buffer_observation(id.clone(), ChangeOp::Delete, source_type, None, None, class, force);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn buffer_observation(
        &self,
        id: DocumentId,
        op: ChangeOp,
        source_type: SourceType,
        item: Option<SourceItem>,
        hash: Option<String>,
        class: PriorityClass,
        force: bool,
    ) {
        let now = Instant::now();
        let window = self.config.debounce(class);
        let mut buffer = self.buffer.lock().unwrap();
        match buffer.get_mut(&id) {
            Some(obs) => {
                let latest = obs.first_seen + window * MAX_WINDOWS;
                obs.op = match (obs.op, op) {
                    (ChangeOp::Insert, ChangeOp::Update) => ChangeOp::Insert,
                    (_, op) => op,
                };
                obs.source_type = source_type;
                obs.item = item;
                obs.hash = hash;
                obs.deadline = (now + window).min(latest.max(obs.deadline));
                obs.full_resync |= force;
                debug!(document_id = %id, "observation debounced");
            }
            None => {
                buffer.insert(
                    id,
                    Observation {
                        op,
                        source_type,
                        item,
                        hash,
                        sequence: self.queue.next_sequence(),
                        detected_at: Utc::now(),
                        first_seen: now,
                        deadline: now + window,
                        full_resync: force,
                    },
                );
            }
        }
    }

    fn discard(&self, id: &DocumentId) {
        if self.buffer.lock().unwrap().remove(id).is_some() {
            debug!(document_id = %id, "content reverted to recorded state, observation dropped");
        }
    }

    /// Emit every observation whose debounce window has passed.
    pub async fn flush_due(&self) -> SyncResult<usize> {
        let now = Instant::now();
        self.flush(|obs| obs.deadline <= now).await
    }

    /// Emit every buffered observation now.
    pub async fn flush_all(&self) -> SyncResult<usize> {
        self.flush(|_| true).await
    }

    async fn flush(&self, due: impl Fn(&Observation) -> bool) -> SyncResult<usize> {
        let mut held = std::mem::take(&mut *self.held.lock().unwrap());
        if !held.is_empty() {
            debug!(held = held.len(), "re-offering held change events");
            held.sort_by_key(|e| e.sequence);
            for event in held {
                self.emit(event).await?;
            }
        }

        let mut ready: Vec<(DocumentId, Observation)> = {
            let mut buffer = self.buffer.lock().unwrap();
            let ids: Vec<DocumentId> = buffer
                .iter()
                .filter(|(_, obs)| due(obs))
                .map(|(id, _)| id.clone())
                .collect();
            ids.into_iter()
                .filter_map(|id| buffer.remove(&id).map(|obs| (id, obs)))
                .collect()
        };
        ready.sort_by_key(|(_, obs)| obs.sequence);

        let mut emitted = 0;
        let mut ready = ready.into_iter();
        while let Some((id, obs)) = ready.next() {
            let event = match self.build_event(id.clone(), &obs).await {
                Ok(event) => event,
                Err(e) => {
                    // Newer observations buffered meanwhile win.
                    let mut buffer = self.buffer.lock().unwrap();
                    for (id, obs) in std::iter::once((id, obs)).chain(ready) {
                        buffer.entry(id).or_insert(obs);
                    }
                    return Err(e);
                }
            };
            self.stats.detected.incr();
            self.emit(event).await?;
            emitted += 1;
        }
        Ok(emitted)
    }

    /// Number of buffered observations.
    pub fn buffered(&self) -> usize {
        self.buffer.lock().unwrap().len()
    }

    /// Number of events held back by a full queue.
    pub fn held(&self) -> usize {
        self.held.lock().unwrap().len()
    }

    /// Earliest debounce deadline, for callers that sleep until work is due.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.buffer.lock().unwrap().values().map(|o| o.deadline).min()
    }

    pub fn degraded(&self) -> Vec<DegradedDocument> {
        self.degraded.lock().unwrap().values().cloned().collect()
    }

    async fn build_event(&self, id: DocumentId, obs: &Observation) -> SyncResult<ChangeEvent> {
        let live = self.store.live_chunks(&id).await?;
        let category = obs
            .item
            .as_ref()
            .and_then(|i| i.category.clone())
            .or_else(|| live.iter().find_map(|c| c.category.clone()));
        let previous: Vec<Chunk> = live.into_iter().map(|c| c.chunk).collect();

        let (body, title, diff) = match &obs.item {
            Some(item) => {
                let body = normalize_content(&item.body);
                let chunks = chunk_text(&id, &body, self.max_tokens);
                let ctx = DiffContext {
                    source_type: obs.source_type,
                    category: category.as_deref(),
                };
                let diff = analyze(Some(&previous), &chunks, ctx, &self.rules);
                (Some(body), item.title.clone(), diff)
            }
            None => (None, None, analyze_delete(&previous)),
        };

        let mut event = ChangeEvent {
            id: Uuid::new_v4(),
            document_id: id,
            op: obs.op,
            source_type: obs.source_type,
            category,
            detected_at: obs.detected_at,
            sequence: obs.sequence,
            priority: PriorityClass::Low,
            body,
            content_hash: obs.hash.clone(),
            title,
            diff: Some(diff),
            rollbacks: 0,
            full_resync: obs.full_resync,
        };
        event.priority = classify(&event, &self.rules);
        Ok(event)
    }

    async fn emit(&self, event: ChangeEvent) -> SyncResult<()> {
        let id = event.document_id.clone();
        let priority = event.priority;
        let op = event.op;

        match self.queue.enqueue(event.clone()).await {
            Ok(EnqueueOutcome::Queued) => {
                self.stats.enqueued.incr();
                debug!(document_id = %id, %op, %priority, "change event queued");
            }
            Ok(EnqueueOutcome::Coalesced) => {
                self.stats.coalesced.incr();
                debug!(document_id = %id, %op, %priority, "change event coalesced");
            }
            Ok(EnqueueOutcome::Deferred) => {
                self.stats.deferred.incr();
                debug!(document_id = %id, %op, %priority, "document in flight, change event deferred");
            }
            Ok(EnqueueOutcome::Displaced(victim)) => {
                self.stats.enqueued.incr();
                self.stats.displaced.incr();
                warn!(
                    document_id = %victim.document_id,
                    priority = %victim.priority,
                    "queue full, lower-priority event held for the next flush"
                );
                self.held.lock().unwrap().push(*victim);
            }
            Err(SyncError::QueueFull { capacity }) => {
                self.stats.rejected.incr();
                warn!(document_id = %id, capacity, "queue full, change event held for the next flush");
                self.held.lock().unwrap().push(event);
            }
            Err(e) => return Err(e),
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{FullPolicy, PerClass, SchedulerConfig};
    use crate::hash_store::{next_record, MemoryHashStore};
    use crate::models::{ChunkId, GenerationId};
    use crate::source::SourceListing;
    use crate::vector_store::{IndexedChunk, MemoryVectorStore, Snapshot, StagingHandle};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// In-memory source whose fetches can be made to fail.
    struct FakeSource {
        items: Mutex<BTreeMap<String, String>>,
        failing: Mutex<BTreeSet<String>>,
        fetches: AtomicU32,
    }

    impl FakeSource {
        fn new(items: &[(&str, &str)]) -> Self {
            Self {
                items: Mutex::new(items.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()),
                failing: Mutex::new(BTreeSet::new()),
                fetches: AtomicU32::new(0),
            }
        }

        fn set(&self, key: &str, body: &str) {
            self.items.lock().unwrap().insert(key.to_string(), body.to_string());
        }
    }

    #[async_trait]
    impl Source for FakeSource {
        fn name(&self) -> &str {
            "fake"
        }

        fn source_type(&self) -> SourceType {
            SourceType::ApiFeed
        }

        async fn list(&self) -> anyhow::Result<Vec<SourceListing>> {
            Ok(self
                .items
                .lock()
                .unwrap()
                .keys()
                .map(|k| SourceListing {
                    document_id: DocumentId::for_source("fake", k),
                    updated_at: Utc::now(),
                    content_hash: None,
                })
                .collect())
        }

        async fn fetch(&self, id: &DocumentId) -> anyhow::Result<SourceItem> {
            self.fetches.fetch_add(1, Ordering::SeqCst);
            let key = id.as_str().trim_start_matches("fake:");
            if self.failing.lock().unwrap().contains(key) {
                anyhow::bail!("connection reset");
            }
            let body = self
                .items
                .lock()
                .unwrap()
                .get(key)
                .cloned()
                .ok_or_else(|| anyhow::anyhow!("gone"))?;
            Ok(SourceItem {
                document_id: id.clone(),
                source_type: SourceType::ApiFeed,
                category: None,
                title: None,
                updated_at: Utc::now(),
                body,
            })
        }
    }

    /// Store whose `live_chunks` fails for the listed documents.
    struct FlakyStore {
        inner: MemoryVectorStore,
        failing: Mutex<BTreeSet<DocumentId>>,
    }

    impl FlakyStore {
        fn new() -> Self {
            Self {
                inner: MemoryVectorStore::new(4, None),
                failing: Mutex::new(BTreeSet::new()),
            }
        }
    }

    #[async_trait]
    impl VectorStore for FlakyStore {
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
            self.inner.commit(handle).await
        }

        async fn rollback(&self, to: GenerationId) -> SyncResult<()> {
            self.inner.rollback(to).await
        }

        async fn live_chunks(&self, id: &DocumentId) -> SyncResult<Vec<IndexedChunk>> {
            if self.failing.lock().unwrap().contains(id) {
                return Err(SyncError::transient("vector store", "connection refused"));
            }
            self.inner.live_chunks(id).await
        }
    }

    struct Fixture {
        hashes: Arc<MemoryHashStore>,
        queue: Arc<UpdateQueue>,
        detector: ChangeDetector,
    }

    fn fixture(debounce_ms: u64) -> Fixture {
        fixture_with(
            debounce_ms,
            Arc::new(MemoryVectorStore::new(4, None)),
            SchedulerConfig::default(),
        )
    }

    fn fixture_with(debounce_ms: u64, store: Arc<dyn VectorStore>, scheduler: SchedulerConfig) -> Fixture {
        let hashes = Arc::new(MemoryHashStore::new());
        let queue = Arc::new(UpdateQueue::new(&scheduler));
        let config = DetectorConfig {
            debounce_ms: PerClass {
                critical: 0,
                high: debounce_ms,
                medium: debounce_ms,
                low: debounce_ms,
            },
            read_max_retries: 2,
            read_backoff_ms: 10,
            read_backoff_cap_ms: 40,
        };
        let detector = ChangeDetector::new(
            hashes.clone(),
            store,
            queue.clone(),
            Arc::new(EngineStats::default()),
            config,
            ClassifierConfig::default(),
            100,
        );
        Fixture {
            hashes,
            queue,
            detector,
        }
    }

    async fn record(f: &Fixture, key: &str, body: &str) {
        let id = DocumentId::for_source("fake", key);
        let prev = f.hashes.get(&id).await.unwrap();
        f.hashes
            .put(&next_record(&id, prev.as_ref(), &content_hash(body), SourceType::ApiFeed))
            .await
            .unwrap();
    }

    fn ops(q: &UpdateQueue) -> Vec<(String, ChangeOp)> {
        q.pending()
            .into_iter()
            .map(|e| (e.document_id.to_string(), e.op))
            .collect()
    }

    #[tokio::test(start_paused = true)]
    async fn scan_emits_inserts_updates_and_deletes() {
        let f = fixture(0);
        let source = FakeSource::new(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]);
        record(&f, "b", "beta").await;
        record(&f, "c", "old gamma").await;
        record(&f, "gone", "was here").await;

        let report = f.detector.scan(&source).await.unwrap();
        assert_eq!((report.changed, report.unchanged, report.deleted), (2, 1, 1));
        f.detector.flush_all().await.unwrap();

        let mut emitted = ops(&f.queue);
        emitted.sort();
        assert_eq!(
            emitted,
            vec![
                ("fake:a".to_string(), ChangeOp::Insert),
                ("fake:c".to_string(), ChangeOp::Update),
                ("fake:gone".to_string(), ChangeOp::Delete),
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn whitespace_only_edits_are_not_changes() {
        let f = fixture(0);
        record(&f, "a", "one two\n\nthree").await;
        let source = FakeSource::new(&[("a", "one   two  \r\n\r\n\r\nthree\n")]);
        let report = f.detector.scan(&source).await.unwrap();
        assert_eq!(report.unchanged, 1);
        assert_eq!(f.detector.flush_all().await.unwrap(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn rapid_writes_collapse_into_one_event_with_final_state() {
        let f = fixture(5_000);
        let source = FakeSource::new(&[("a", "draft 1")]);
        f.detector.scan(&source).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        source.set("a", "draft 2");
        f.detector.scan(&source).await.unwrap();
        tokio::time::advance(Duration::from_millis(1_000)).await;
        source.set("a", "final");
        f.detector.scan(&source).await.unwrap();

        assert_eq!(f.detector.flush_due().await.unwrap(), 0);
        tokio::time::advance(Duration::from_millis(5_001)).await;
        assert_eq!(f.detector.flush_due().await.unwrap(), 1);

        let pending = f.queue.pending();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].body.as_deref(), Some("final"));
        assert_eq!(pending[0].op, ChangeOp::Insert);
    }

    #[tokio::test(start_paused = true)]
    async fn revert_within_window_drops_the_observation() {
        let f = fixture(5_000);
        record(&f, "a", "stable").await;
        let source = FakeSource::new(&[("a", "edited")]);
        f.detector.scan(&source).await.unwrap();
        assert_eq!(f.detector.buffered(), 1);
        source.set("a", "stable");
        f.detector.scan(&source).await.unwrap();
        assert_eq!(f.detector.buffered(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn failing_reads_degrade_without_stopping_the_scan() {
        let f = fixture(0);
        let source = FakeSource::new(&[("a", "ok"), ("b", "broken"), ("c", "ok too")]);
        source.failing.lock().unwrap().insert("b".to_string());
        record(&f, "b", "previous").await;

        let report = f.detector.scan(&source).await.unwrap();
        assert_eq!((report.changed, report.failed, report.deleted), (2, 1, 0));
        // 1 try + 2 retries for b, one each for a and c.
        assert_eq!(source.fetches.load(Ordering::SeqCst), 5);

        let degraded = f.detector.degraded();
        assert_eq!(degraded.len(), 1);
        assert_eq!(degraded[0].document_id, DocumentId::from("fake:b"));

        source.failing.lock().unwrap().clear();
        f.detector.scan(&source).await.unwrap();
        assert!(f.detector.degraded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn resync_ignores_recorded_hashes() {
        let f = fixture(0);
        record(&f, "a", "same").await;
        let source = FakeSource::new(&[("a", "same")]);
        assert_eq!(f.detector.scan(&source).await.unwrap().changed, 0);

        assert_eq!(f.detector.resync(&source).await.unwrap().changed, 1);
        f.detector.flush_all().await.unwrap();
        let pending = f.queue.pending();
        assert!(pending[0].full_resync);
        assert_eq!(pending[0].op, ChangeOp::Update);
    }

    #[tokio::test(start_paused = true)]
    async fn notifications_fetch_missing_payloads() {
        let f = fixture(0);
        let source = FakeSource::new(&[("a", "pushed")]);
        let changed = f
            .detector
            .notify(
                &source,
                Notification {
                    document_id: DocumentId::from("fake:a"),
                    op: ChangeOp::Insert,
                    item: None,
                },
            )
            .await
            .unwrap();
        assert!(changed);

        // Deleting something never seen is a no-op.
        let changed = f
            .detector
            .notify(
                &source,
                Notification {
                    document_id: DocumentId::from("fake:unknown"),
                    op: ChangeOp::Delete,
                    item: None,
                },
            )
            .await
            .unwrap();
        assert!(!changed);

        f.detector.flush_all().await.unwrap();
        assert_eq!(ops(&f.queue), vec![("fake:a".to_string(), ChangeOp::Insert)]);
    }

    fn change(doc: &str, priority: PriorityClass) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            document_id: DocumentId::from(doc),
            op: ChangeOp::Update,
            source_type: SourceType::ApiFeed,
            category: None,
            detected_at: Utc::now(),
            sequence: 0,
            priority,
            body: Some(doc.to_string()),
            content_hash: None,
            title: None,
            diff: None,
            rollbacks: 0,
            full_resync: false,
        }
    }

    fn rejecting(capacity: usize) -> SchedulerConfig {
        SchedulerConfig {
            capacity,
            full_policy: FullPolicy::Reject,
            ..Default::default()
        }
    }

    #[tokio::test(start_paused = true)]
    async fn rejected_events_are_offered_again_on_the_next_flush() {
        let f = fixture_with(0, Arc::new(MemoryVectorStore::new(4, None)), rejecting(1));
        let source = FakeSource::new(&[("a", "alpha"), ("b", "beta")]);
        f.detector.scan(&source).await.unwrap();
        f.detector.flush_all().await.unwrap();
        assert_eq!(ops(&f.queue), vec![("fake:a".to_string(), ChangeOp::Insert)]);
        assert_eq!(f.detector.held(), 1);

        let a = f.queue.try_dequeue().unwrap().unwrap();
        f.queue.complete(&a.document_id);
        f.detector.flush_all().await.unwrap();
        assert_eq!(f.detector.held(), 0);
        assert_eq!(ops(&f.queue), vec![("fake:b".to_string(), ChangeOp::Insert)]);
    }

    #[tokio::test]
    async fn displaced_events_are_held_instead_of_dropped() {
        let f = fixture_with(0, Arc::new(MemoryVectorStore::new(4, None)), rejecting(1));
        f.detector.emit(change("fake:low", PriorityClass::Low)).await.unwrap();
        f.detector.emit(change("fake:urgent", PriorityClass::Critical)).await.unwrap();
        assert_eq!(ops(&f.queue), vec![("fake:urgent".to_string(), ChangeOp::Update)]);
        assert_eq!(f.detector.held(), 1);

        let urgent = f.queue.try_dequeue().unwrap().unwrap();
        f.queue.complete(&urgent.document_id);
        // Nothing is due in the buffer; the held event goes anyway.
        assert_eq!(f.detector.flush_due().await.unwrap(), 0);
        assert_eq!(ops(&f.queue), vec![("fake:low".to_string(), ChangeOp::Update)]);
    }

    #[tokio::test(start_paused = true)]
    async fn failed_event_build_keeps_the_remaining_observations() {
        let store = Arc::new(FlakyStore::new());
        let f = fixture_with(0, store.clone(), SchedulerConfig::default());
        let source = FakeSource::new(&[("a", "alpha"), ("b", "beta"), ("c", "gamma")]);
        f.detector.scan(&source).await.unwrap();

        store.failing.lock().unwrap().insert(DocumentId::from("fake:b"));
        assert!(f.detector.flush_all().await.is_err());
        assert_eq!(ops(&f.queue), vec![("fake:a".to_string(), ChangeOp::Insert)]);
        assert_eq!(f.detector.buffered(), 2);

        store.failing.lock().unwrap().clear();
        assert_eq!(f.detector.flush_all().await.unwrap(), 2);
        let mut emitted = ops(&f.queue);
        emitted.sort();
        assert_eq!(
            emitted,
            vec![
                ("fake:a".to_string(), ChangeOp::Insert),
                ("fake:b".to_string(), ChangeOp::Insert),
                ("fake:c".to_string(), ChangeOp::Insert),
            ]
        );
    }
}
