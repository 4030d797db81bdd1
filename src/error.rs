use thiserror::Error;
use uuid::Uuid;

use crate::config::ConfigError;
use crate::scheduler::JobState;

#[derive(Error, Debug)]
pub enum BenchError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Worker not found: {0}")]
    WorkerNotFound(u64),

    #[error("Worker already registered: {0}")]
    WorkerExists(u64),

    #[error("Worker {0} must have a capacity of at least 1")]
    ZeroCapacity(u64),

    #[error("Illegal transition for job {job_id}: {from} -> {to}")]
    IllegalTransition {
        job_id: Uuid,
        from: JobState,
        to: JobState,
    },

    #[error("Invariant violation: {0}")]
    InvariantViolation(String),

    #[error("Revision resolution failed: {0}")]
    Revision(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl BenchError {
    /// Fatal errors indicate corrupted scheduler state. They halt the
    /// trigger loop instead of being retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            BenchError::IllegalTransition { .. } | BenchError::InvariantViolation(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, BenchError>;
