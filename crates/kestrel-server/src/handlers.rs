//! Job handlers served by this binary.

use async_trait::async_trait;
use kestrel_jobs::{JobContext, JobError, JobHandler, Priority};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Job type handled by [`ProcessJobHandler`].
pub const PROCESS_JOB: &str = "process_job";

/// Payload of a `process_job` job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobPayload {
    /// Message to process.
    pub message: String,
    /// Priority label the producer asked for (high, medium, low).
    pub priority: String,
}

impl JobPayload {
    /// Creates a payload labelled with `priority`.
    pub fn new(message: impl Into<String>, priority: Priority) -> Self {
        Self {
            message: message.into(),
            priority: priority.to_string(),
        }
    }

    /// Priority class for the label. Anything other than high or medium runs
    /// as low.
    pub fn priority_class(&self) -> Priority {
        match self.priority.as_str() {
            "high" => Priority::High,
            "medium" => Priority::Medium,
            _ => Priority::Low,
        }
    }
}

/// Processes `process_job` jobs.
///
/// Each job fails its first `simulated_failures` attempts, which exercises
/// retry and dead-letter paths in demos.
#[derive(Debug, Clone, Default)]
pub struct ProcessJobHandler {
    simulated_failures: u32,
}

impl ProcessJobHandler {
    /// Creates a handler that fails each job's first `simulated_failures`
    /// attempts.
    pub fn new(simulated_failures: u32) -> Self {
        Self { simulated_failures }
    }
}

#[async_trait]
impl JobHandler for ProcessJobHandler {
    async fn handle(&self, ctx: JobContext, payload: Vec<u8>) -> Result<(), JobError> {
        let payload: JobPayload = serde_json::from_slice(&payload)
            .map_err(|e| JobError::Handler(format!("failed to parse job payload: {e}")))?;

        info!(
            job_id = %ctx.job_id,
            message = %payload.message,
            priority = %payload.priority,
            attempt = ctx.attempt,
            "Processing job"
        );

        if ctx.attempt <= self.simulated_failures {
            warn!(job_id = %ctx.job_id, attempt = ctx.attempt, "Simulated job failure");
            return Err(JobError::Handler("simulated job failure".to_string()));
        }

        info!(job_id = %ctx.job_id, "Job completed");
        Ok(())
    }
}
