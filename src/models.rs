//! Core data models for the synchronization engine.
//!
//! These types describe documents and their chunks, the change events
//! that flow from detection to the reindex workers, and the generation
//! records that make index swaps and rollbacks traceable.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Stable, source-assigned document identifier.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DocumentId(String);

impl DocumentId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Identifier for an item of a named source, e.g. `docs:guide/intro.md`.
    pub fn for_source(source: &str, source_id: &str) -> Self {
        Self(format!("{}:{}", source, source_id))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DocumentId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DocumentId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for DocumentId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Chunk identifier: owning document plus the byte offset where the
/// chunk's span starts in the normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ChunkId(String);

impl ChunkId {
    pub fn new(document_id: &DocumentId, offset: usize) -> Self {
        Self(format!("{}#{}", document_id, offset))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// The owning document, recovered from the identifier.
    pub fn document_id(&self) -> DocumentId {
        match self.0.rsplit_once('#') {
            Some((doc, _)) => DocumentId::new(doc),
            None => DocumentId::new(self.0.clone()),
        }
    }
}

impl fmt::Display for ChunkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ChunkId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Monotonically increasing identifier of a live index snapshot.
pub type GenerationId = u64;

/// Kind of source system a document comes from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceType {
    File,
    DatabaseRow,
    ApiFeed,
}

impl SourceType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceType::File => "file",
            SourceType::DatabaseRow => "database_row",
            SourceType::ApiFeed => "api_feed",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SourceType {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "file" => Ok(SourceType::File),
            "database_row" | "database-row" => Ok(SourceType::DatabaseRow),
            "api_feed" | "api-feed" => Ok(SourceType::ApiFeed),
            other => anyhow::bail!(
                "Unknown source type: '{}'. Must be file, database_row, or api_feed.",
                other
            ),
        }
    }
}

/// Raw item produced by a source before hashing and diffing.
#[derive(Debug, Clone)]
pub struct SourceItem {
    pub document_id: DocumentId,
    pub source_type: SourceType,
    pub category: Option<String>,
    pub title: Option<String>,
    pub updated_at: DateTime<Utc>,
    pub body: String,
}

/// Last-known state of a document, as recorded in the content hash store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentRecord {
    pub id: DocumentId,
    pub content_hash: String,
    pub version: u64,
    pub source_type: SourceType,
    pub last_synced_at: DateTime<Utc>,
    /// Deleted documents keep their record with this flag set.
    pub tombstoned: bool,
}

/// Byte range of a chunk within the normalized document content.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

/// A chunk of a document's normalized content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub id: ChunkId,
    pub document_id: DocumentId,
    pub chunk_index: i64,
    pub span: Span,
    pub text: String,
    /// SHA-256 of the chunk text, independent of the document hash.
    pub hash: String,
}

/// Insert, update or delete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeOp {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for ChangeOp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ChangeOp::Insert => "insert",
            ChangeOp::Update => "update",
            ChangeOp::Delete => "delete",
        })
    }
}

/// Semantic impact of a change, as judged by the diff analyzer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Impact {
    Low,
    Medium,
    High,
}

impl FromStr for Impact {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "low" => Ok(Impact::Low),
            "medium" => Ok(Impact::Medium),
            "high" => Ok(Impact::High),
            other => anyhow::bail!("Unknown impact level: '{}'", other),
        }
    }
}

/// Update priority. Ordered so that `Critical > High > Medium > Low`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PriorityClass {
    Low,
    Medium,
    High,
    Critical,
}

impl PriorityClass {
    /// All classes, highest first.
    pub const DESCENDING: [PriorityClass; 4] = [
        PriorityClass::Critical,
        PriorityClass::High,
        PriorityClass::Medium,
        PriorityClass::Low,
    ];

    /// Dense index used by per-class arrays (`Low = 0` … `Critical = 3`).
    pub fn index(self) -> usize {
        self as usize
    }

    /// The next class up; `Critical` stays `Critical`.
    pub fn promoted(self) -> PriorityClass {
        match self {
            PriorityClass::Low => PriorityClass::Medium,
            PriorityClass::Medium => PriorityClass::High,
            PriorityClass::High | PriorityClass::Critical => PriorityClass::Critical,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityClass::Low => "low",
            PriorityClass::Medium => "medium",
            PriorityClass::High => "high",
            PriorityClass::Critical => "critical",
        }
    }
}

impl From<Impact> for PriorityClass {
    fn from(impact: Impact) -> Self {
        match impact {
            Impact::Low => PriorityClass::Low,
            Impact::Medium => PriorityClass::Medium,
            Impact::High => PriorityClass::High,
        }
    }
}

impl fmt::Display for PriorityClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for PriorityClass {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "low" => Ok(PriorityClass::Low),
            "medium" => Ok(PriorityClass::Medium),
            "high" => Ok(PriorityClass::High),
            "critical" => Ok(PriorityClass::Critical),
            other => anyhow::bail!(
                "Unknown priority: '{}'. Must be critical, high, medium, or low.",
                other
            ),
        }
    }
}

/// Partition of a document's chunks after an update.
///
/// `unchanged` lists chunks of the new chunking whose text matches a
/// previous chunk; when the match came from a chunk with different
/// boundaries the pair is also listed in `relocated` as `(from, to)` so
/// the previous vector can be carried over without re-embedding.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkDiff {
    pub added: Vec<ChunkId>,
    pub modified: Vec<ChunkId>,
    pub unchanged: Vec<ChunkId>,
    pub removed: Vec<ChunkId>,
    pub relocated: Vec<(ChunkId, ChunkId)>,
    pub impact: Option<Impact>,
}

impl ChunkDiff {
    /// Chunk ids whose text must be embedded.
    pub fn needs_embedding(&self) -> impl Iterator<Item = &ChunkId> {
        self.added.iter().chain(self.modified.iter())
    }

    /// Previous chunk ids that must leave the live index.
    pub fn tombstones(&self) -> Vec<ChunkId> {
        let mut out = self.removed.clone();
        for (from, to) in &self.relocated {
            if from != to && !self.unchanged.contains(from) && !self.modified.contains(from) {
                out.push(from.clone());
            }
        }
        out.sort();
        out.dedup();
        out
    }

    pub fn is_noop(&self) -> bool {
        self.added.is_empty()
            && self.modified.is_empty()
            && self.removed.is_empty()
            && self.relocated.is_empty()
    }
}

/// A detected mutation awaiting processing.
///
/// Events are never mutated after creation; coalescing and re-queueing
/// build new events through the `superseded_by` / `escalated` helpers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeEvent {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub op: ChangeOp,
    pub source_type: SourceType,
    pub category: Option<String>,
    pub detected_at: DateTime<Utc>,
    /// Detection sequence number; larger means observed later.
    pub sequence: u64,
    pub priority: PriorityClass,
    /// Normalized content for inserts and updates.
    pub body: Option<String>,
    pub content_hash: Option<String>,
    pub title: Option<String>,
    pub diff: Option<ChunkDiff>,
    /// Number of times this document's work was rolled back.
    pub rollbacks: u32,
    /// Re-embed every chunk instead of only the changed ones.
    #[serde(default)]
    pub full_resync: bool,
}

impl ChangeEvent {
    /// Merge a newer event for the same document into this one.
    ///
    /// The newer event's content and diff win. The original detection
    /// time and sequence are kept so the document keeps its FIFO place,
    /// and the priority is the higher of the two.
    pub fn superseded_by(&self, newer: &ChangeEvent) -> ChangeEvent {
        let op = match (self.op, newer.op) {
            // A document first seen and then edited before processing is
            // still an insert from the index's point of view.
            (ChangeOp::Insert, ChangeOp::Update) => ChangeOp::Insert,
            (_, op) => op,
        };
        ChangeEvent {
            id: newer.id,
            document_id: newer.document_id.clone(),
            op,
            source_type: newer.source_type,
            category: newer.category.clone().or_else(|| self.category.clone()),
            detected_at: self.detected_at,
            sequence: self.sequence,
            priority: self.priority.max(newer.priority),
            body: newer.body.clone(),
            content_hash: newer.content_hash.clone(),
            title: newer.title.clone().or_else(|| self.title.clone()),
            diff: newer.diff.clone(),
            rollbacks: self.rollbacks.max(newer.rollbacks),
            full_resync: self.full_resync || newer.full_resync,
        }
    }

    /// Copy of this event at a different priority.
    pub fn with_priority(&self, priority: PriorityClass) -> ChangeEvent {
        ChangeEvent {
            priority,
            ..self.clone()
        }
    }

    /// Copy re-queued after a rollback: one class higher, rollback counted.
    pub fn escalated(&self) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            priority: self.priority.promoted(),
            rollbacks: self.rollbacks + 1,
            ..self.clone()
        }
    }
}

/// Ordered group of events processed together by one worker.
#[derive(Debug, Clone)]
pub struct UpdateBatch {
    pub id: Uuid,
    pub events: Vec<ChangeEvent>,
    pub attempt: u32,
}

impl UpdateBatch {
    pub fn new(events: Vec<ChangeEvent>) -> Self {
        Self {
            id: Uuid::new_v4(),
            events,
            attempt: 0,
        }
    }
}

/// Lifecycle of a generation in the history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GenerationStatus {
    Live,
    Superseded,
    RolledBack,
}

impl GenerationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            GenerationStatus::Live => "live",
            GenerationStatus::Superseded => "superseded",
            GenerationStatus::RolledBack => "rolled_back",
        }
    }
}

impl FromStr for GenerationStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> anyhow::Result<Self> {
        match s {
            "live" => Ok(GenerationStatus::Live),
            "superseded" => Ok(GenerationStatus::Superseded),
            "rolled_back" => Ok(GenerationStatus::RolledBack),
            other => anyhow::bail!("Unknown generation status: '{}'", other),
        }
    }
}

/// Metadata about one committed generation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GenerationRecord {
    pub id: GenerationId,
    pub parent: Option<GenerationId>,
    pub batch_id: Option<Uuid>,
    pub committed_at: DateTime<Utc>,
    pub documents: Vec<DocumentId>,
    pub upserts: usize,
    pub tombstones: usize,
    pub status: GenerationStatus,
}

/// Work that failed permanently and awaits an operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: Uuid,
    pub document_id: DocumentId,
    pub event: ChangeEvent,
    pub reason: String,
    pub attempts: u32,
    pub failed_at: DateTime<Utc>,
}

/// Audit entry written whenever a document is deleted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TombstoneRecord {
    pub document_id: DocumentId,
    pub version: u64,
    pub chunk_ids: Vec<ChunkId>,
    pub generation: GenerationId,
    pub recorded_at: DateTime<Utc>,
}

/// Raised when a commit is rolled back for quality reasons.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Alert {
    pub id: Uuid,
    pub generation: GenerationId,
    pub restored_generation: GenerationId,
    pub detail: String,
    pub raised_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(op: ChangeOp, seq: u64, priority: PriorityClass, body: &str) -> ChangeEvent {
        ChangeEvent {
            id: Uuid::new_v4(),
            document_id: DocumentId::from("docs:a.md"),
            op,
            source_type: SourceType::File,
            category: None,
            detected_at: Utc::now(),
            sequence: seq,
            priority,
            body: Some(body.to_string()),
            content_hash: Some(format!("h-{}", body)),
            title: None,
            diff: None,
            rollbacks: 0,
            full_resync: false,
        }
    }

    #[test]
    fn chunk_id_recovers_document() {
        let doc = DocumentId::for_source("docs", "guide#1.md");
        let id = ChunkId::new(&doc, 42);
        assert_eq!(id.as_str(), "docs:guide#1.md#42");
        assert_eq!(id.document_id(), doc);
    }

    #[test]
    fn priority_ordering_and_promotion() {
        assert!(PriorityClass::Critical > PriorityClass::High);
        assert!(PriorityClass::Medium > PriorityClass::Low);
        assert_eq!(PriorityClass::Low.promoted(), PriorityClass::Medium);
        assert_eq!(PriorityClass::Critical.promoted(), PriorityClass::Critical);
    }

    #[test]
    fn supersede_keeps_position_and_takes_newer_content() {
        let old = event(ChangeOp::Update, 3, PriorityClass::High, "one");
        let new = event(ChangeOp::Update, 9, PriorityClass::Low, "two");
        let merged = old.superseded_by(&new);
        assert_eq!(merged.sequence, 3);
        assert_eq!(merged.priority, PriorityClass::High);
        assert_eq!(merged.body.as_deref(), Some("two"));
        assert_eq!(merged.id, new.id);
    }

    #[test]
    fn insert_then_update_stays_insert() {
        let old = event(ChangeOp::Insert, 1, PriorityClass::Medium, "a");
        let new = event(ChangeOp::Update, 2, PriorityClass::Medium, "b");
        assert_eq!(old.superseded_by(&new).op, ChangeOp::Insert);

        let delete = event(ChangeOp::Delete, 3, PriorityClass::High, "");
        assert_eq!(old.superseded_by(&delete).op, ChangeOp::Delete);
    }

    #[test]
    fn tombstones_include_relocation_sources() {
        let diff = ChunkDiff {
            unchanged: vec![ChunkId::from("d#10")],
            removed: vec![ChunkId::from("d#50")],
            relocated: vec![(ChunkId::from("d#0"), ChunkId::from("d#10"))],
            ..Default::default()
        };
        assert_eq!(
            diff.tombstones(),
            vec![ChunkId::from("d#0"), ChunkId::from("d#50")]
        );
    }
}
