//! Engine-wide error taxonomy.
//!
//! Validation and not-found errors are surfaced directly to callers with a
//! stable variant. Transient errors are retried inside the owning component
//! before becoming visible. `StorageIo` and `Corruption` are fatal to the
//! current operation and are never silently swallowed.

use std::time::Duration;

use crate::embeddings::EmbedderError;
use crate::search::VectorIndexError;

/// Engine error type
#[non_exhaustive]
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    // ---- Validation ----
    /// A field failed validation
    #[error("invalid field `{field}`: {reason}")]
    InvalidField {
        /// Field name
        field: &'static str,
        /// What was wrong with it
        reason: String,
    },
    /// Operation name not recognized by the dispatch surface
    #[error("unknown operation: {0}")]
    UnknownOperation(String),
    /// A required argument was not supplied
    #[error("missing argument: {0}")]
    MissingArgument(&'static str),

    // ---- NotFound ----
    /// No engram with the given id
    #[error("no such engram: {0}")]
    NoSuchEngram(i64),

    // ---- State ----
    /// The engram already has a successor
    #[error("engram {0} is already superseded")]
    AlreadySuperseded(i64),
    /// The requested supersession would close a chain into a loop
    #[error("superseding {old_id} with {new_id} would create a cycle")]
    Cycle {
        /// Engram being replaced
        old_id: i64,
        /// Proposed successor
        new_id: i64,
    },
    /// Protected engrams refuse deletion and consolidation
    #[error("engram {0} is protected")]
    Protected(i64),

    // ---- Capacity ----
    /// Ingest input exceeds the per-file byte cap
    #[error("file too large: {size} bytes (cap {cap})")]
    FileTooLarge {
        /// Observed size
        size: u64,
        /// Configured cap
        cap: u64,
    },
    /// Ingest input produced more chunks than allowed
    #[error("too many chunks: {count} (cap {cap})")]
    TooManyChunks {
        /// Observed chunk count
        count: usize,
        /// Configured cap
        cap: usize,
    },
    /// The vector index cannot accept more entries
    #[error("vector index is full")]
    IndexFull,

    // ---- Transient ----
    /// The external embedder could not be reached
    #[error("embedder unavailable: {0}")]
    EmbedderUnavailable(String),
    /// The write serializer did not accept the mutation in time
    #[error("write timed out")]
    WriteTimeout,
    /// The vector index lags the store and needs a rebuild
    #[error("vector index is stale")]
    IndexStale,
    /// Caller-supplied deadline expired
    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    // ---- Fatal ----
    /// Underlying storage failure
    #[error("storage I/O error: {0}")]
    StorageIo(#[from] rusqlite::Error),
    /// Internal state violated an invariant
    #[error("corrupt engine state: {0}")]
    Corruption(String),
}

/// Engine result type
pub type Result<T> = std::result::Result<T, EngineError>;

impl From<EmbedderError> for EngineError {
    fn from(e: EmbedderError) -> Self {
        EngineError::EmbedderUnavailable(e.to_string())
    }
}

impl From<VectorIndexError> for EngineError {
    fn from(e: VectorIndexError) -> Self {
        match e {
            VectorIndexError::Dimensions { expected, got } => EngineError::InvalidField {
                field: "embedding",
                reason: format!("expected {expected} dimensions, got {got}"),
            },
            VectorIndexError::Capacity(_) => EngineError::IndexFull,
            other => EngineError::Corruption(other.to_string()),
        }
    }
}

impl EngineError {
    /// Whether retrying the same call may succeed without intervention
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            EngineError::EmbedderUnavailable(_)
                | EngineError::WriteTimeout
                | EngineError::IndexStale
                | EngineError::Timeout(_)
        )
    }

    /// Stable machine-readable code for the façade layer
    pub fn code(&self) -> &'static str {
        match self {
            EngineError::InvalidField { .. } => "invalid_field",
            EngineError::UnknownOperation(_) => "unknown_operation",
            EngineError::MissingArgument(_) => "missing_argument",
            EngineError::NoSuchEngram(_) => "no_such_engram",
            EngineError::AlreadySuperseded(_) => "already_superseded",
            EngineError::Cycle { .. } => "cycle",
            EngineError::Protected(_) => "protected",
            EngineError::FileTooLarge { .. } => "file_too_large",
            EngineError::TooManyChunks { .. } => "too_many_chunks",
            EngineError::IndexFull => "index_full",
            EngineError::EmbedderUnavailable(_) => "embedder_unavailable",
            EngineError::WriteTimeout => "write_timeout",
            EngineError::IndexStale => "index_stale",
            EngineError::Timeout(_) => "timeout",
            EngineError::StorageIo(_) => "storage_io",
            EngineError::Corruption(_) => "corruption",
        }
    }
}
