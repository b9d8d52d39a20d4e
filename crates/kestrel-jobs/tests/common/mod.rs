//! Common test infrastructure for job queue integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use kestrel_jobs::config::RedisConfig;
use kestrel_jobs::redis::create_pool;
use kestrel_jobs::{
    BackoffPolicy, Clock, DeadLetterEntry, DeadLetterStore, FailOutcome, InMemoryJobStore,
    JobError, JobId, JobQueue, JobRecord, JobResult, JobStore, JobsConfig, ManualClock, Priority,
    StateCounts,
};
use std::collections::HashSet;
use std::future::Future;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;
use testcontainers::{runners::AsyncRunner, ContainerAsync};
use testcontainers_modules::redis::Redis;

/// Job configuration with short, test-friendly timings.
pub fn test_config(concurrency: usize) -> JobsConfig {
    let mut config = JobsConfig::default();
    config.worker.concurrency = concurrency;
    config.worker.job_timeout_secs = 5;
    config.worker.store_retry_max_elapsed_secs = 5;
    config.queue.lease_duration_secs = 10;
    config.queue.reclaim_interval_secs = 1;
    config
}

/// Builds a queue over the default in-memory stores.
pub fn queue_with(config: JobsConfig, clock: Arc<dyn Clock>) -> Arc<JobQueue> {
    Arc::new(
        JobQueue::builder(config)
            .clock(clock)
            .build()
            .expect("valid test config"),
    )
}

/// Polls `check` every 10ms until it holds.
///
/// Under paused time the sleeps advance the virtual clock, so this also
/// drives backoff timers forward.
pub async fn wait_for<F, Fut>(mut check: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..10_000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not met in time");
}

/// Current time truncated to millisecond precision, as stored by Redis.
pub fn now_ms() -> DateTime<Utc> {
    DateTime::from_timestamp_millis(Utc::now().timestamp_millis()).expect("valid timestamp")
}

/// Dead-letter store whose appends always fail.
#[derive(Debug, Default)]
pub struct FaultyDeadLetterStore;

#[async_trait]
impl DeadLetterStore for FaultyDeadLetterStore {
    async fn append(&self, _entry: DeadLetterEntry) -> JobResult<()> {
        Err(JobError::StoreUnavailable("dead letter store offline".into()))
    }

    async fn read(&self, _offset: u64, _limit: usize) -> JobResult<Vec<DeadLetterEntry>> {
        Ok(Vec::new())
    }

    async fn len(&self) -> JobResult<u64> {
        Ok(0)
    }
}

/// In-memory store whose first `failures` lease calls fail with `error`.
pub struct FlakyStore {
    inner: InMemoryJobStore,
    failures: AtomicU32,
    error: fn() -> JobError,
    stall: Option<(Arc<ManualClock>, Duration)>,
}

impl FlakyStore {
    pub fn new(failures: u32, error: fn() -> JobError) -> Self {
        Self {
            inner: InMemoryJobStore::default(),
            failures: AtomicU32::new(failures),
            error,
            stall: None,
        }
    }

    /// Advance `clock` by `step` on every failed call.
    pub fn stalling(mut self, clock: Arc<ManualClock>, step: Duration) -> Self {
        self.stall = Some((clock, step));
        self
    }

    pub fn remaining_failures(&self) -> u32 {
        self.failures.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn enqueue(&self, job: JobRecord) -> JobResult<JobId> {
        self.inner.enqueue(job).await
    }

    async fn lease(
        &self,
        priorities: &[Priority],
        owner: &str,
        now: DateTime<Utc>,
    ) -> JobResult<Option<JobRecord>> {
        let tripped = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if tripped {
            if let Some((clock, step)) = &self.stall {
                clock.advance(*step);
            }
            return Err((self.error)());
        }
        self.inner.lease(priorities, owner, now).await
    }

    async fn ack(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        self.inner.ack(id, owner, now).await
    }

    async fn fail(
        &self,
        id: &JobId,
        owner: &str,
        error: &JobError,
        policy: &dyn BackoffPolicy,
        now: DateTime<Utc>,
    ) -> JobResult<FailOutcome> {
        self.inner.fail(id, owner, error, policy, now).await
    }

    async fn abandon(&self, id: &JobId, owner: &str, now: DateTime<Utc>) -> JobResult<()> {
        self.inner.abandon(id, owner, now).await
    }

    async fn reclaim_expired_leases(&self, now: DateTime<Utc>) -> JobResult<Vec<JobId>> {
        self.inner.reclaim_expired_leases(now).await
    }

    async fn purge_expired(&self, now: DateTime<Utc>) -> JobResult<u64> {
        self.inner.purge_expired(now).await
    }

    async fn get(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.inner.get(id).await
    }

    async fn next_not_before(&self) -> JobResult<Option<DateTime<Utc>>> {
        self.inner.next_not_before().await
    }

    async fn pending_job_types(&self) -> JobResult<HashSet<String>> {
        self.inner.pending_job_types().await
    }

    async fn counts(&self) -> JobResult<StateCounts> {
        self.inner.counts().await
    }
}

/// Redis test container wrapper.
///
/// Manages a Redis testcontainer lifecycle and provides a connection pool.
pub struct TestRedis {
    _container: ContainerAsync<Redis>,
    pool: deadpool_redis::Pool,
    prefix: String,
}

impl TestRedis {
    /// Starts a fresh Redis container.
    pub async fn new() -> Self {
        let container = Redis::default()
            .start()
            .await
            .expect("Failed to start Redis container");

        let port = container
            .get_host_port_ipv4(6379)
            .await
            .expect("Failed to get Redis port");

        let config = RedisConfig {
            url: format!("redis://127.0.0.1:{}", port),
            pool_size: 8,
            key_prefix: "kestrel:test".to_string(),
        };

        let pool = Self::connect_with_retry(&config, 30).await;

        Self {
            _container: container,
            pool,
            prefix: config.key_prefix,
        }
    }

    /// Returns a handle to the connection pool.
    pub fn pool(&self) -> deadpool_redis::Pool {
        self.pool.clone()
    }

    /// Key prefix used by the stores under test.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    async fn connect_with_retry(config: &RedisConfig, max_attempts: u32) -> deadpool_redis::Pool {
        let mut attempts = 0;
        loop {
            attempts += 1;
            match create_pool(config).await {
                Ok(pool) => return pool,
                Err(e) => {
                    if attempts >= max_attempts {
                        panic!("Failed to connect to Redis after {} attempts: {}", attempts, e);
                    }
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    }
}
