//! In-process job store.

use super::{apply_failure, check_lease, FailOutcome, JobStore, StateCounts};
use crate::clock::saturating_offset;
use crate::config::StoreSettings;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, Priority};
use crate::retry::BackoffPolicy;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeSet, HashMap, HashSet};
use tracing::debug;

type PendingKey = (DateTime<Utc>, u64, JobId);
type DeadlineKey = (DateTime<Utc>, JobId);

struct StoredJob {
    record: JobRecord,
    sequence: u64,
}

#[derive(Default)]
struct Inner {
    jobs: HashMap<JobId, StoredJob>,
    /// Pending jobs per class, ordered by `not_before` then submission.
    pending: HashMap<Priority, BTreeSet<PendingKey>>,
    /// Leased jobs ordered by lease expiry.
    leased: BTreeSet<DeadlineKey>,
    /// Terminal jobs ordered by retention deadline.
    retained: BTreeSet<DeadlineKey>,
    next_sequence: u64,
}

impl Inner {
    fn push_pending(&mut self, record: &JobRecord, sequence: u64) {
        self.pending
            .entry(record.priority)
            .or_default()
            .insert((record.not_before, sequence, record.id.clone()));
    }

    fn leased_entry(&mut self, id: &JobId, owner: &str) -> JobResult<&mut StoredJob> {
        let stored = self
            .jobs
            .get_mut(id)
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        check_lease(&stored.record, owner)?;
        Ok(stored)
    }
}

/// Job store held in process memory.
///
/// A single mutex guards all indexes, so each operation is atomic. State does
/// not survive a restart.
pub struct InMemoryJobStore {
    inner: Mutex<Inner>,
    settings: StoreSettings,
}

impl InMemoryJobStore {
    /// Create a store with the given lease and retention settings.
    pub fn new(settings: StoreSettings) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            settings,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new(StoreSettings::default())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId> {
        if job.state != JobState::Pending || job.retry_count != 0 {
            return Err(JobError::InvalidState {
                expected: "new pending job".to_string(),
                actual: format!("{} with retry_count {}", job.state, job.retry_count),
            });
        }

        let mut inner = self.inner.lock();
        if inner.jobs.contains_key(&job.id) {
            return Err(JobError::Validation(format!("duplicate job id: {}", job.id)));
        }

        let sequence = inner.next_sequence;
        inner.next_sequence += 1;

        let id = job.id.clone();
        inner.push_pending(&job, sequence);
        inner.jobs.insert(id.clone(), StoredJob { record: job, sequence });

        Ok(id)
    }

    async fn lease(
        &self,
        priorities: &[Priority],
        owner: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let mut inner = self.inner.lock();

        for priority in priorities {
            let Some(queue) = inner.pending.get_mut(priority) else {
                continue;
            };
            let Some(first) = queue.first() else {
                continue;
            };
            if first.0 > now {
                continue;
            }

            let Some((_, _, id)) = queue.pop_first() else {
                continue;
            };

            let expiry = saturating_offset(now, self.settings.lease_duration);
            let Some(stored) = inner.jobs.get_mut(&id) else {
                return Err(JobError::Internal(format!("pending index references missing job {id}")));
            };

            stored.record.state = JobState::Leased;
            stored.record.lease_owner = Some(owner.to_string());
            stored.record.lease_expiry = Some(expiry);
            stored.record.attempts += 1;
            let leased = stored.record.clone();

            inner.leased.insert((expiry, id));
            return Ok(Some(leased));
        }

        Ok(None)
    }

    async fn ack(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        let mut inner = self.inner.lock();
        let retention_until = saturating_offset(now, self.settings.completed_retention);

        let stored = inner.leased_entry(id, owner)?;
        let expiry = stored.record.lease_expiry;
        stored.record.state = JobState::Done;
        stored.record.lease_owner = None;
        stored.record.lease_expiry = None;
        stored.record.retention_until = Some(retention_until);

        if let Some(expiry) = expiry {
            inner.leased.remove(&(expiry, id.clone()));
        }
        inner.retained.insert((retention_until, id.clone()));

        Ok(())
    }

    async fn fail(
        &self,
        id: &JobId,
        owner: &str,
        error: &JobError,
        policy: &dyn BackoffPolicy,
        now: DateTime<Utc>,
    ) -> JobResult<FailOutcome> {
        let mut inner = self.inner.lock();
        let settings = self.settings;

        let stored = inner.leased_entry(id, owner)?;
        let expiry = stored.record.lease_expiry;
        let sequence = stored.sequence;
        let outcome = apply_failure(&mut stored.record, error, policy, &settings, now);
        let record = stored.record.clone();

        if let Some(expiry) = expiry {
            inner.leased.remove(&(expiry, id.clone()));
        }

        match &outcome {
            FailOutcome::Requeued { .. } => inner.push_pending(&record, sequence),
            FailOutcome::DeadLettered(_) => {
                if let Some(until) = record.retention_until {
                    inner.retained.insert((until, id.clone()));
                }
            }
        }

        Ok(outcome)
    }

    async fn abandon(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        let mut inner = self.inner.lock();

        let stored = inner.leased_entry(id, owner)?;
        let previous = stored.record.lease_expiry.replace(now);

        if let Some(expiry) = previous {
            inner.leased.remove(&(expiry, id.clone()));
        }
        inner.leased.insert((now, id.clone()));

        Ok(())
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> JobResult<Vec<JobId>> {
        let mut inner = self.inner.lock();
        let mut reclaimed = Vec::new();

        while let Some((expiry, _)) = inner.leased.first() {
            if *expiry >= now {
                break;
            }
            let Some((_, id)) = inner.leased.pop_first() else {
                break;
            };

            let Some(stored) = inner.jobs.get_mut(&id) else {
                continue;
            };
            stored.record.state = JobState::Pending;
            stored.record.lease_owner = None;
            stored.record.lease_expiry = None;
            let record = stored.record.clone();
            let sequence = stored.sequence;

            inner.push_pending(&record, sequence);
            debug!(job_id = %id, "Reclaimed expired lease");
            reclaimed.push(id);
        }

        Ok(reclaimed)
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let mut inner = self.inner.lock();
        let mut purged = 0u64;

        while let Some((until, _)) = inner.retained.first() {
            if *until > now {
                break;
            }
            let Some((_, id)) = inner.retained.pop_first() else {
                break;
            };
            if inner.jobs.remove(&id).is_some() {
                purged += 1;
            }
        }

        Ok(purged)
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        Ok(self.inner.lock().jobs.get(id).map(|stored| stored.record.clone()))
    }

    async fn next_not_before(&self) -> JobResult<Option<DateTime<Utc>>> {
        let inner = self.inner.lock();
        Ok(inner
            .pending
            .values()
            .filter_map(|queue| queue.first().map(|(not_before, _, _)| *not_before))
            .min())
    }

    async fn pending_job_types(&self) -> JobResult<HashSet<String>> {
        let inner = self.inner.lock();
        Ok(inner
            .pending
            .values()
            .flatten()
            .filter_map(|(_, _, id)| inner.jobs.get(id))
            .map(|stored| stored.record.job_type.clone())
            .collect())
    }

    async fn counts(&self) -> JobResult<StateCounts> {
        let inner = self.inner.lock();
        let mut counts = StateCounts::default();
        for stored in inner.jobs.values() {
            match stored.record.state {
                JobState::Pending => counts.pending += 1,
                JobState::Leased => counts.leased += 1,
                JobState::Done => counts.done += 1,
                JobState::DeadLettered => counts.dead_lettered += 1,
            }
        }
        Ok(counts)
    }
}
