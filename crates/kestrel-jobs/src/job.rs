//! Job records and definitions.

use crate::clock::checked_offset;
use crate::error::{JobError, JobResult};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;
use uuid::Uuid;

/// Unique job identifier.
///
/// Generated as a UUIDv7, so identifiers sort in submission order.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobId(String);

impl JobId {
    /// Creates a new time-ordered job ID.
    pub fn new() -> Self {
        Self(Uuid::now_v7().to_string())
    }

    /// Returns the job ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<String> for JobId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for JobId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Job priority classes.
///
/// Ordered so that `Critical > High > Medium > Low`. A class biases which job
/// a free worker picks; it is not an isolation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    /// Background work.
    Low,
    /// Default class.
    Medium,
    /// Important work.
    High,
    /// Time-sensitive work.
    Critical,
}

impl Priority {
    /// All classes, highest first.
    pub const ALL: [Priority; 4] = [
        Priority::Critical,
        Priority::High,
        Priority::Medium,
        Priority::Low,
    ];

    /// Returns the class name.
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Medium => "medium",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Priority::Medium
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Priority {
    type Err = JobError;

    /// Parses a class name. Unknown names are rejected, never clamped.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "critical" => Ok(Priority::Critical),
            "high" => Ok(Priority::High),
            "medium" => Ok(Priority::Medium),
            "low" => Ok(Priority::Low),
            _ => Err(JobError::Validation(format!("unknown priority class: {s:?}"))),
        }
    }
}

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobState {
    /// Waiting to be leased once `not_before` has passed.
    Pending,
    /// Held by exactly one worker.
    Leased,
    /// Completed successfully.
    Done,
    /// Retry budget exhausted. Immutable except for purge.
    DeadLettered,
}

impl JobState {
    /// Returns the state name.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobState::Pending => "pending",
            JobState::Leased => "leased",
            JobState::Done => "done",
            JobState::DeadLettered => "dead_lettered",
        }
    }
}

impl fmt::Display for JobState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobState {
    type Err = JobError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobState::Pending),
            "leased" => Ok(JobState::Leased),
            "done" => Ok(JobState::Done),
            "dead_lettered" => Ok(JobState::DeadLettered),
            _ => Err(JobError::Store(format!("unknown job state: {s:?}"))),
        }
    }
}

/// A job submission, validated into a [`JobRecord`] on submit.
#[derive(Debug, Clone)]
pub struct NewJob {
    job_type: String,
    payload: Vec<u8>,
    priority: Priority,
    max_retries: Option<i64>,
    delay: Duration,
}

impl NewJob {
    /// Creates a submission with default priority, retries, and no delay.
    pub fn new(job_type: impl Into<String>, payload: impl Into<Vec<u8>>) -> Self {
        Self {
            job_type: job_type.into(),
            payload: payload.into(),
            priority: Priority::default(),
            max_retries: None,
            delay: Duration::ZERO,
        }
    }

    /// Set the priority.
    pub fn priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Set the retry ceiling. Negative values are rejected on submit.
    pub fn max_retries(mut self, max_retries: i64) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Set an initial delay before the job becomes eligible.
    pub fn delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Job type name.
    pub fn job_type(&self) -> &str {
        &self.job_type
    }

    /// Requested priority.
    pub fn requested_priority(&self) -> Priority {
        self.priority
    }

    /// Validates the submission and builds a `Pending` record.
    pub fn into_record(self, default_max_retries: u32, now: DateTime<Utc>) -> JobResult<JobRecord> {
        if self.job_type.trim().is_empty() {
            return Err(JobError::Validation("job type must not be empty".to_string()));
        }

        let max_retries = match self.max_retries {
            None => default_max_retries,
            Some(n) if n < 0 => {
                return Err(JobError::Validation(format!(
                    "max_retries must be non-negative, got {n}"
                )))
            }
            Some(n) => u32::try_from(n).map_err(|_| {
                JobError::Validation(format!("max_retries out of range: {n}"))
            })?,
        };

        let not_before = checked_offset(now, self.delay).ok_or_else(|| {
            JobError::Validation(format!("delay out of range: {:?}", self.delay))
        })?;

        Ok(JobRecord {
            id: JobId::new(),
            job_type: self.job_type,
            payload: self.payload,
            priority: self.priority,
            max_retries,
            retry_count: 0,
            attempts: 0,
            not_before,
            retention_until: None,
            state: JobState::Pending,
            lease_owner: None,
            lease_expiry: None,
            last_error: None,
            created_at: now,
        })
    }
}

/// A job as persisted by the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Job ID.
    pub id: JobId,

    /// Handler name.
    pub job_type: String,

    /// Opaque payload, interpreted only by the handler.
    pub payload: Vec<u8>,

    /// Priority class.
    pub priority: Priority,

    /// Retry ceiling.
    pub max_retries: u32,

    /// Failed attempts so far. Never exceeds `max_retries`.
    pub retry_count: u32,

    /// Number of times the job has been leased.
    pub attempts: u32,

    /// Not eligible for lease before this time.
    pub not_before: DateTime<Utc>,

    /// Terminal records may be purged after this time.
    pub retention_until: Option<DateTime<Utc>>,

    /// Lifecycle state.
    pub state: JobState,

    /// Worker holding the lease.
    pub lease_owner: Option<String>,

    /// Lease expiry.
    pub lease_expiry: Option<DateTime<Utc>>,

    /// Error from the last failed attempt.
    pub last_error: Option<String>,

    /// Submission time.
    pub created_at: DateTime<Utc>,
}

impl JobRecord {
    /// Returns true if the job can be leased at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.state == JobState::Pending && self.not_before <= now
    }

    /// Returns true if `owner` currently holds the lease.
    pub fn is_leased_by(&self, owner: &str) -> bool {
        self.state == JobState::Leased && self.lease_owner.as_deref() == Some(owner)
    }

    /// Create the handler context for this attempt.
    pub fn to_context(&self, worker_id: &str) -> JobContext {
        JobContext {
            job_id: self.id.clone(),
            job_type: self.job_type.clone(),
            priority: self.priority,
            attempt: self.attempts,
            retry_count: self.retry_count,
            max_retries: self.max_retries,
            worker_id: worker_id.to_string(),
            started_at: Utc::now(),
        }
    }
}

/// Job execution context handed to handlers.
#[derive(Debug, Clone)]
pub struct JobContext {
    /// Job ID.
    pub job_id: JobId,

    /// Job type name.
    pub job_type: String,

    /// Priority class.
    pub priority: Priority,

    /// Current attempt number (1-based).
    pub attempt: u32,

    /// Failed attempts before this one.
    pub retry_count: u32,

    /// Retry ceiling.
    pub max_retries: u32,

    /// Worker ID processing this job.
    pub worker_id: String,

    /// Job started executing at this time.
    pub started_at: DateTime<Utc>,
}

impl JobContext {
    /// Returns true if a failure now would dead-letter the job.
    pub fn is_last_attempt(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Returns remaining retries after this attempt.
    pub fn remaining_retries(&self) -> u32 {
        self.max_retries.saturating_sub(self.retry_count)
    }
}
