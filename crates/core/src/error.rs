//! Unified error types for the rollup engine.

use thiserror::Error;

/// Result type alias using our Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Unified error type for the rollup engine.
///
/// The first five variants are the engine's public taxonomy; the rest are
/// internal carriers for wiring and configuration failures.
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed batch. The batch is rejected wholesale, no side effects.
    #[error("validation error: {0}")]
    Validation(String),

    /// Backpressure: a rollup queue is at capacity. Callers retry later.
    #[error("engine overloaded: {0}")]
    Overloaded(String),

    /// Merge contention on an aggregate. Retried internally with bounded
    /// backoff, never surfaced to ingest callers.
    #[error("merge conflict on aggregate '{definition}'")]
    MergeConflict { definition: String },

    /// A recompute cycle exceeded its deadline. Staging is discarded and the
    /// previously published result stays authoritative.
    #[error("recompute for '{definition}' exceeded deadline after {elapsed_ms}ms")]
    RecomputeTimeout { definition: String, elapsed_ms: u64 },

    /// Retention attempted to rewrite a partition with a live recompute
    /// snapshot. The partition is deferred to the next pass.
    #[error("retention race on stream '{stream}' partition {partition}")]
    RetentionRace { stream: String, partition: String },

    #[error("unknown stream: {0}")]
    UnknownStream(String),

    #[error("unknown aggregate definition: {0}")]
    UnknownDefinition(String),

    #[error("invalid aggregate definition '{name}': {message}")]
    InvalidDefinition { name: String, message: String },

    #[error("store error: {0}")]
    Store(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn overloaded(msg: impl Into<String>) -> Self {
        Self::Overloaded(msg.into())
    }

    pub fn merge_conflict(definition: impl Into<String>) -> Self {
        Self::MergeConflict {
            definition: definition.into(),
        }
    }

    pub fn recompute_timeout(definition: impl Into<String>, elapsed_ms: u64) -> Self {
        Self::RecomputeTimeout {
            definition: definition.into(),
            elapsed_ms,
        }
    }

    pub fn retention_race(stream: impl Into<String>, partition: impl ToString) -> Self {
        Self::RetentionRace {
            stream: stream.into(),
            partition: partition.to_string(),
        }
    }

    pub fn invalid_definition(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self::InvalidDefinition {
            name: name.into(),
            message: message.into(),
        }
    }

    pub fn store(msg: impl Into<String>) -> Self {
        Self::Store(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// Whether the caller may retry the same operation later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Overloaded(_) | Self::MergeConflict { .. })
    }
}
