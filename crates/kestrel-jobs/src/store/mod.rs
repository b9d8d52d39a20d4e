//! Durable store contract.
//!
//! Every operation is a single atomic transaction with respect to concurrent
//! callers: no two workers can observe or hold the same lease.

mod memory;

pub use memory::InMemoryJobStore;

use crate::clock::saturating_offset;
use crate::config::StoreSettings;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, Priority};
use crate::retry::{BackoffPolicy, RetryDecision};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Result of `fail`.
#[derive(Debug, Clone, PartialEq)]
pub enum FailOutcome {
    /// Returned to `Pending`, eligible again after `delay`.
    Requeued {
        /// Backoff applied.
        delay: Duration,
        /// Retry count after this failure.
        retry_count: u32,
    },
    /// Retry budget exhausted or the error was permanent. Carries the final
    /// record.
    DeadLettered(JobRecord),
}

/// Number of records per state.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateCounts {
    /// Pending jobs, including delayed ones.
    pub pending: u64,
    /// Leased jobs.
    pub leased: u64,
    /// Completed jobs awaiting purge.
    pub done: u64,
    /// Dead-lettered jobs awaiting purge.
    pub dead_lettered: u64,
}

/// Durable job store.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a `Pending` record.
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId>;

    /// Lease one eligible job (`not_before <= now`), trying `priorities` in
    /// the given order. Within a class the earliest `not_before` wins, then
    /// submission order.
    async fn lease(
        &self,
        priorities: &[Priority],
        owner: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>>;

    /// `Leased -> Done`.
    async fn ack(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()>;

    /// Record a failed attempt. Either requeues with backoff or dead-letters.
    async fn fail(
        &self,
        id: &JobId,
        owner: &str,
        error: &JobError,
        policy: &dyn BackoffPolicy,
        now: DateTime<Utc>,
    ) -> JobResult<FailOutcome>;

    /// Expire a held lease immediately so the next reclaim returns the job to
    /// `Pending`. Does not consume a retry.
    async fn abandon(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()>;

    /// Return jobs whose lease expired before `now` to `Pending` without
    /// touching `retry_count`.
    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> JobResult<Vec<JobId>>;

    /// Delete terminal records whose retention has passed.
    async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<u64>;

    /// Fetch a record.
    async fn get(&self, id: &JobId) -> JobResult<Option<JobRecord>>;

    /// Earliest `not_before` among pending jobs.
    async fn next_not_before(&self) -> JobResult<Option<DateTime<Utc>>>;

    /// Job types that have pending work.
    async fn pending_job_types(&self) -> JobResult<HashSet<String>>;

    /// Per-state totals.
    async fn counts(&self) -> JobResult<StateCounts>;
}

/// Checks that `owner` holds the lease on `record`.
pub(crate) fn check_lease(record: &JobRecord, owner: &str) -> JobResult<()> {
    if record.state != JobState::Leased {
        return Err(JobError::InvalidState {
            expected: JobState::Leased.to_string(),
            actual: record.state.to_string(),
        });
    }

    if !record.is_leased_by(owner) {
        return Err(JobError::LeaseNotHeld {
            job_id: record.id.to_string(),
            owner: owner.to_string(),
        });
    }

    Ok(())
}

/// Applies a failed attempt to a leased record.
///
/// `retry_count` never exceeds `max_retries`: the failure that would push it
/// past the ceiling dead-letters the job instead.
pub(crate) fn apply_failure(
    record: &mut JobRecord,
    error: &JobError,
    policy: &dyn BackoffPolicy,
    settings: &StoreSettings,
    now: DateTime<Utc>,
) -> FailOutcome {
    let attempted = record.retry_count.saturating_add(1);
    let decision = policy.decide(attempted, record.max_retries, error);

    record.lease_owner = None;
    record.lease_expiry = None;
    record.last_error = Some(error.to_string());

    match decision {
        RetryDecision::Retry(delay) => {
            record.retry_count = attempted;
            record.not_before = saturating_offset(now, delay);
            record.state = JobState::Pending;
            FailOutcome::Requeued {
                delay,
                retry_count: attempted,
            }
        }
        RetryDecision::DeadLetter => {
            record.retry_count = attempted.min(record.max_retries);
            record.state = JobState::DeadLettered;
            record.retention_until = Some(saturating_offset(now, settings.dead_letter_retention));
            FailOutcome::DeadLettered(record.clone())
        }
    }
}
