//! Job error types.

use std::time::Duration;
use thiserror::Error;

/// Result type for job operations.
pub type JobResult<T> = Result<T, JobError>;

/// Job-related errors.
#[derive(Debug, Error)]
pub enum JobError {
    /// Malformed submission. Never enqueued.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Job not found.
    #[error("Job not found: {0}")]
    NotFound(String),

    /// Invalid job state.
    #[error("Invalid job state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// The job is leased, but not by the caller.
    #[error("Lease on job {job_id} is not held by {owner}")]
    LeaseNotHeld { job_id: String, owner: String },

    /// Job handler failed. Retried according to the retry policy.
    #[error("Job execution failed: {0}")]
    Handler(String),

    /// Job handler failed in a way retrying cannot fix.
    #[error("Job failed permanently: {0}")]
    Permanent(String),

    /// Job handler exceeded its execution budget.
    #[error("Job timed out after {0:?}")]
    Timeout(Duration),

    /// The durable store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The durable store rejected an operation.
    #[error("Store error: {0}")]
    Store(String),

    /// No handler is registered for a job type.
    #[error("No handler registered for job type: {0}")]
    UnknownJobType(String),

    /// Configuration error.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Serialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl JobError {
    /// Returns true if a job failing with this error may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            JobError::Handler(_)
                | JobError::Timeout(_)
                | JobError::StoreUnavailable(_)
                | JobError::Internal(_)
        )
    }

    /// Returns true if the error means the store itself is unreachable.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, JobError::StoreUnavailable(_))
    }

    /// Short label used for metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Validation(_) => "validation",
            JobError::NotFound(_) => "not_found",
            JobError::InvalidState { .. } => "invalid_state",
            JobError::LeaseNotHeld { .. } => "lease_not_held",
            JobError::Handler(_) => "handler",
            JobError::Permanent(_) => "permanent",
            JobError::Timeout(_) => "timeout",
            JobError::StoreUnavailable(_) => "store_unavailable",
            JobError::Store(_) => "store",
            JobError::UnknownJobType(_) => "unknown_job_type",
            JobError::Configuration(_) => "configuration",
            JobError::Serialization(_) => "serialization",
            JobError::Internal(_) => "internal",
        }
    }
}

impl From<redis::RedisError> for JobError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
            || err.is_timeout()
        {
            JobError::StoreUnavailable(err.to_string())
        } else {
            JobError::Store(err.to_string())
        }
    }
}

impl From<deadpool_redis::PoolError> for JobError {
    fn from(err: deadpool_redis::PoolError) -> Self {
        JobError::StoreUnavailable(err.to_string())
    }
}
