//! Error taxonomy for the scheduling engine.
//!
//! Mirrors the propagation policy: validation and not-found surface
//! directly, conflicts are retried internally and only reported as a
//! boolean, and internal failures are always recorded on the entity rather
//! than swallowed silently.

use thiserror::Error;

/// Errors that can occur anywhere in the scheduling engine.
#[derive(Debug, Error)]
pub enum SchedulerError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("{0} not found: {1}")]
    NotFound(&'static str, String),

    #[error("bot id mismatch: request owned by a different bot")]
    AuthMismatch,

    #[error("malformed task id: {0}")]
    MalformedId(String),

    #[error("try_number must be 1 or 2, got {0}")]
    InvalidTry(u32),

    #[error("no unused id suffix found after {0} attempts")]
    IdExhausted(u32),

    #[error("optimistic concurrency conflict on {0} after {1} retries")]
    Conflict(&'static str, u32),

    #[error("internal failure: {0}")]
    Internal(String),

    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type SchedulerResult<T> = Result<T, SchedulerError>;

impl SchedulerError {
    /// True for the transient-conflict variant, which callers may retry.
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(..))
    }
}
