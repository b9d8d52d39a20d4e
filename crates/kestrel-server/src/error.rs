//! Server error types.

use kestrel_jobs::JobError;
use thiserror::Error;

/// Result type for server operations.
pub type ServerResult<T> = Result<T, ServerError>;

/// Errors raised while bootstrapping or running the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// Configuration could not be loaded or is invalid.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Logging could not be initialized.
    #[error("Logging error: {0}")]
    Logging(String),

    /// The job engine failed.
    #[error(transparent)]
    Jobs(#[from] JobError),
}

impl From<config::ConfigError> for ServerError {
    fn from(err: config::ConfigError) -> Self {
        ServerError::Configuration(err.to_string())
    }
}
