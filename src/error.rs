//! Error taxonomy for the synchronization engine.
//!
//! Failures are contained per document or per batch. The variants mirror
//! how the engine reacts to them:
//!
//! | Variant | Reaction |
//! |---------|----------|
//! | [`SyncError::Transient`] | retried with bounded backoff |
//! | [`SyncError::PermanentDocument`] | parked in the dead-letter set |
//! | [`SyncError::VersionConflict`] | staged work discarded, document re-queued |
//! | [`SyncError::QualityRegression`] | generation rolled back, alert raised |
//!
//! Application plumbing (config loading, CLI) keeps using `anyhow`.

use crate::models::{DocumentId, GenerationId};

/// Typed error for engine components.
#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Network or timeout failure talking to a collaborator (embedding
    /// model, vector store, source system).
    #[error("transient failure in {collaborator}: {message}")]
    Transient {
        collaborator: &'static str,
        message: String,
    },

    /// The document itself cannot be processed (malformed content,
    /// embedding rejected after all retries).
    #[error("document {document_id} failed permanently: {reason}")]
    PermanentDocument {
        document_id: DocumentId,
        reason: String,
    },

    /// A compare-and-swap on the content hash store saw a different
    /// version than the writer expected.
    #[error("version conflict for {document_id}: expected v{expected}, found v{found}")]
    VersionConflict {
        document_id: DocumentId,
        expected: u64,
        found: u64,
    },

    /// Canary evaluation after a commit crossed the configured threshold.
    #[error("quality regression in generation {generation}: {detail}")]
    QualityRegression {
        generation: GenerationId,
        detail: String,
    },

    #[error("update queue is full (capacity {capacity})")]
    QueueFull { capacity: usize },

    #[error("update queue is closed")]
    QueueClosed,

    /// The content hash store could not be reached.
    #[error("content hash store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn transient(collaborator: &'static str, message: impl Into<String>) -> Self {
        SyncError::Transient {
            collaborator,
            message: message.into(),
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SyncError::Transient { .. } | SyncError::StoreUnavailable(_)
        )
    }
}

impl From<sqlx::Error> for SyncError {
    fn from(e: sqlx::Error) -> Self {
        match e {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                SyncError::StoreUnavailable(e.to_string())
            }
            other => SyncError::Other(other.into()),
        }
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
