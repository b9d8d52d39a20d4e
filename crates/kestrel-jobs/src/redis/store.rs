//! Redis job store.

use super::codec::{self, millis};
use super::scripts::Scripts;
use super::RedisKeys;
use crate::clock::saturating_offset;
use crate::config::StoreSettings;
use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, JobState, Priority};
use crate::retry::BackoffPolicy;
use crate::store::{apply_failure, check_lease, FailOutcome, JobStore, StateCounts};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use deadpool_redis::Pool;
use redis::AsyncCommands;
use std::collections::{HashMap, HashSet};
use tracing::debug;

/// Job store backed by Redis.
///
/// Every state transition runs as a single Lua script, so concurrent callers
/// (including other processes sharing the key prefix) never hold the same
/// lease.
pub struct RedisJobStore {
    pool: Pool,
    keys: RedisKeys,
    scripts: Scripts,
    settings: StoreSettings,
}

impl RedisJobStore {
    /// Create a new Redis job store.
    pub fn new(pool: Pool, key_prefix: impl Into<String>, settings: StoreSettings) -> Self {
        Self {
            pool,
            keys: RedisKeys::new(key_prefix),
            scripts: Scripts::new(),
            settings,
        }
    }

    /// Get a connection from the pool.
    async fn conn(&self) -> JobResult<deadpool_redis::Connection> {
        Ok(self.pool.get().await?)
    }

    /// Check that the store is reachable.
    pub async fn health_check(&self) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let _: String = redis::cmd("PING").query_async(&mut *conn).await?;
        Ok(())
    }
}

/// Maps a guarded script reply onto the store's error taxonomy.
fn check_status(status: &str, id: &JobId, owner: &str) -> JobResult<()> {
    match status {
        "ok" => Ok(()),
        "not_found" => Err(JobError::NotFound(id.to_string())),
        "owner" => Err(JobError::LeaseNotHeld {
            job_id: id.to_string(),
            owner: owner.to_string(),
        }),
        "conflict" => Err(JobError::Store(format!(
            "job {id} was modified concurrently"
        ))),
        other => match other.strip_prefix("state:") {
            Some(state) => Err(JobError::InvalidState {
                expected: JobState::Leased.to_string(),
                actual: state.to_string(),
            }),
            None => Err(JobError::Store(format!("unexpected script reply: {other}"))),
        },
    }
}

#[async_trait]
impl JobStore for RedisJobStore {
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId> {
        if job.state != JobState::Pending || job.retry_count != 0 {
            return Err(JobError::InvalidState {
                expected: "new pending job".to_string(),
                actual: format!("{} with retry_count {}", job.state, job.retry_count),
            });
        }

        let mut conn = self.conn().await?;

        let mut invocation = self.scripts.enqueue.prepare_invoke();
        invocation
            .key(self.keys.job(job.id.as_str()))
            .key(self.keys.pending(job.priority))
            .arg(job.id.as_str())
            .arg(job.not_before.timestamp_millis());
        for (field, value) in codec::encode(&job) {
            invocation.arg(field).arg(value);
        }

        let inserted: i64 = invocation.invoke_async(&mut *conn).await?;
        if inserted == 0 {
            return Err(JobError::Validation(format!("duplicate job id: {}", job.id)));
        }

        debug!(job_id = %job.id, priority = %job.priority, "Stored job");
        Ok(job.id)
    }

    async fn lease(
        &self,
        priorities: &[Priority],
        owner: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        if priorities.is_empty() {
            return Ok(None);
        }

        let mut conn = self.conn().await?;
        let expiry = saturating_offset(now, self.settings.lease_duration);

        let mut invocation = self.scripts.lease.prepare_invoke();
        invocation.key(self.keys.leased());
        for priority in priorities {
            invocation.key(self.keys.pending(*priority));
        }
        invocation
            .arg(now.timestamp_millis())
            .arg(expiry.timestamp_millis())
            .arg(owner)
            .arg(self.keys.job_prefix());

        let reply: Vec<Vec<u8>> = invocation.invoke_async(&mut *conn).await?;
        if reply.is_empty() {
            return Ok(None);
        }

        codec::pairs(reply).and_then(codec::decode).map(Some)
    }

    async fn ack(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        let mut conn = self.conn().await?;
        let retention_until = saturating_offset(now, self.settings.completed_retention);

        let status: String = self
            .scripts
            .ack
            .key(self.keys.job(id.as_str()))
            .key(self.keys.leased())
            .key(self.keys.done())
            .arg(owner)
            .arg(retention_until.timestamp_millis())
            .arg(id.as_str())
            .invoke_async(&mut *conn)
            .await?;

        check_status(&status, id, owner)
    }

    async fn fail(
        &self,
        id: &JobId,
        owner: &str,
        error: &JobError,
        policy: &dyn BackoffPolicy,
        now: DateTime<Utc>,
    ) -> JobResult<FailOutcome> {
        let mut record = self
            .get(id)
            .await?
            .ok_or_else(|| JobError::NotFound(id.to_string()))?;
        check_lease(&record, owner)?;

        let expected_retry_count = record.retry_count;
        let outcome = apply_failure(&mut record, error, policy, &self.settings, now);

        let (kind, at) = match &outcome {
            FailOutcome::Requeued { .. } => ("requeue", record.not_before),
            FailOutcome::DeadLettered(_) => ("dead", record.retention_until.unwrap_or(now)),
        };

        let mut conn = self.conn().await?;
        let status: String = self
            .scripts
            .fail
            .key(self.keys.job(id.as_str()))
            .key(self.keys.leased())
            .key(self.keys.pending(record.priority))
            .key(self.keys.dead())
            .arg(owner)
            .arg(expected_retry_count)
            .arg(id.as_str())
            .arg(kind)
            .arg(record.retry_count)
            .arg(millis(at))
            .arg(record.last_error.as_deref().unwrap_or_default())
            .invoke_async(&mut *conn)
            .await?;

        check_status(&status, id, owner)?;
        Ok(outcome)
    }

    async fn abandon(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        let mut conn = self.conn().await?;

        let status: String = self
            .scripts
            .abandon
            .key(self.keys.job(id.as_str()))
            .key(self.keys.leased())
            .arg(owner)
            .arg(now.timestamp_millis())
            .arg(id.as_str())
            .invoke_async(&mut *conn)
            .await?;

        check_status(&status, id, owner)
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> JobResult<Vec<JobId>> {
        let mut conn = self.conn().await?;

        let ids: Vec<String> = self
            .scripts
            .reclaim
            .key(self.keys.leased())
            .arg(now.timestamp_millis())
            .arg(self.keys.job_prefix())
            .arg(self.keys.pending_prefix())
            .invoke_async(&mut *conn)
            .await?;

        Ok(ids.into_iter().map(JobId::from).collect())
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        let mut conn = self.conn().await?;

        let purged: u64 = self
            .scripts
            .purge
            .key(self.keys.done())
            .key(self.keys.dead())
            .arg(now.timestamp_millis())
            .arg(self.keys.job_prefix())
            .invoke_async(&mut *conn)
            .await?;

        Ok(purged)
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        let mut conn = self.conn().await?;

        let fields: HashMap<String, Vec<u8>> = conn.hgetall(self.keys.job(id.as_str())).await?;
        if fields.is_empty() {
            return Ok(None);
        }

        codec::decode(fields).map(Some)
    }

    async fn next_not_before(&self) -> JobResult<Option<DateTime<Utc>>> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for priority in Priority::ALL {
            pipe.cmd("ZRANGE")
                .arg(self.keys.pending(priority))
                .arg(0)
                .arg(0)
                .arg("WITHSCORES");
        }
        let heads: Vec<Vec<(String, i64)>> = pipe.query_async(&mut *conn).await?;

        Ok(heads
            .into_iter()
            .flatten()
            .map(|(_, score)| score)
            .min()
            .and_then(DateTime::from_timestamp_millis))
    }

    async fn pending_job_types(&self) -> JobResult<HashSet<String>> {
        let mut conn = self.conn().await?;
        let mut types = HashSet::new();

        for priority in Priority::ALL {
            let ids: Vec<String> = conn.zrange(self.keys.pending(priority), 0, -1).await?;
            if ids.is_empty() {
                continue;
            }

            let mut pipe = redis::pipe();
            for id in &ids {
                pipe.hget(self.keys.job(id), "job_type");
            }
            let job_types: Vec<Option<String>> = pipe.query_async(&mut *conn).await?;
            types.extend(job_types.into_iter().flatten());
        }

        Ok(types)
    }

    async fn counts(&self) -> JobResult<StateCounts> {
        let mut conn = self.conn().await?;

        let mut pipe = redis::pipe();
        for priority in Priority::ALL {
            pipe.zcard(self.keys.pending(priority));
        }
        pipe.zcard(self.keys.leased())
            .zcard(self.keys.done())
            .zcard(self.keys.dead());

        let sizes: Vec<u64> = pipe.query_async(&mut *conn).await?;
        let (pending, rest) = sizes.split_at(Priority::ALL.len().min(sizes.len()));
        let at = |i: usize| rest.get(i).copied().unwrap_or(0);

        Ok(StateCounts {
            pending: pending.iter().sum(),
            leased: at(0),
            done: at(1),
            dead_lettered: at(2),
        })
    }
}
