//! Job queue facade.
//!
//! [`JobQueue`] ties the store, scheduler, retry policy, dead-letter
//! escalator, and handler registry together. It is the surface used by the
//! ingestion side (`submit`), the bootstrapper (`register_handler`), operator
//! tooling (`dead_letter_feed`), and the worker pool.

use crate::clock::{until, Clock, SystemClock};
use crate::config::JobsConfig;
use crate::dead_letter::{DeadLetterEntry, DeadLetterEscalator, DeadLetterStore, InMemoryDeadLetterStore};
use crate::error::{JobError, JobResult};
use crate::handler::{FnHandler, HandlerRegistry, JobHandler};
use crate::job::{JobContext, JobId, JobRecord, NewJob};
use crate::metrics::JobMetrics;
use crate::retry::{BackoffPolicy, RetryPolicy};
use crate::scheduler::{ActiveLease, PriorityScheduler};
use crate::store::{FailOutcome, InMemoryJobStore, JobStore, StateCounts};
use backoff::ExponentialBackoffBuilder;
use futures::future::BoxFuture;
use futures::stream::{self, BoxStream, StreamExt};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::futures::Notified;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Dead-letter entries fetched per page by the feed.
const FEED_PAGE_SIZE: usize = 100;

/// Priority-aware job queue.
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    scheduler: PriorityScheduler,
    escalator: DeadLetterEscalator,
    policy: Arc<dyn BackoffPolicy>,
    handlers: HandlerRegistry,
    clock: Arc<dyn Clock>,
    work_available: Notify,
    config: JobsConfig,
}

impl JobQueue {
    /// Start building a queue from configuration.
    pub fn builder(config: JobsConfig) -> JobQueueBuilder {
        JobQueueBuilder::new(config)
    }

    /// Queue configuration.
    pub fn config(&self) -> &JobsConfig {
        &self.config
    }

    /// The priority scheduler.
    pub fn scheduler(&self) -> &PriorityScheduler {
        &self.scheduler
    }

    /// The underlying job store.
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Current time according to the queue's clock.
    pub fn now(&self) -> chrono::DateTime<chrono::Utc> {
        self.clock.now()
    }

    /// Register a handler for `job_type`.
    pub fn register_handler(&self, job_type: impl Into<String>, handler: impl JobHandler + 'static) {
        self.handlers.register(job_type, Arc::new(handler));
    }

    /// Register a closure as the handler for `job_type`.
    pub fn register_fn<F>(&self, job_type: impl Into<String>, f: F)
    where
        F: Fn(JobContext, Vec<u8>) -> BoxFuture<'static, Result<(), JobError>>
            + Send
            + Sync
            + 'static,
    {
        self.register_handler(job_type, FnHandler::new(f));
    }

    /// Look up the handler for `job_type`.
    pub fn handler(&self, job_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(job_type)
    }

    /// Fails with `UnknownJobType` if the store holds pending jobs that no
    /// registered handler can process.
    pub async fn validate_handlers(&self) -> JobResult<()> {
        let pending = self.store.pending_job_types().await?;
        let mut missing: Vec<String> = pending
            .into_iter()
            .filter(|job_type| !self.handlers.contains(job_type))
            .collect();

        if missing.is_empty() {
            return Ok(());
        }

        missing.sort();
        Err(JobError::UnknownJobType(missing.join(", ")))
    }

    /// Submit a job.
    ///
    /// Rejects priority classes missing from the configured weights, job types
    /// with no registered handler, negative retry ceilings, and empty types.
    pub async fn submit(&self, job: NewJob) -> JobResult<JobId> {
        let priority = job.requested_priority();
        if !self.scheduler.accepts(priority) {
            return Err(JobError::Validation(format!(
                "priority class {priority} is not configured"
            )));
        }

        if !self.handlers.contains(job.job_type()) {
            return Err(JobError::UnknownJobType(job.job_type().to_string()));
        }

        let now = self.clock.now();
        let record = job.into_record(self.config.queue.default_max_retries, now)?;
        let job_type = record.job_type.clone();
        let not_before = record.not_before;

        let store = &self.store;
        let id = self
            .with_store_retry("enqueue", move || store.enqueue(record.clone()))
            .await?;

        JobMetrics::job_submitted(&job_type, priority);
        debug!(
            job_id = %id,
            job_type = %job_type,
            priority = %priority,
            not_before = %not_before,
            "Enqueued job"
        );

        self.work_available.notify_waiters();
        Ok(id)
    }

    /// Lease the next job according to the scheduler's weights.
    pub async fn lease_next(&self, owner: &str) -> JobResult<Option<ActiveLease>> {
        let order = self.scheduler.lease_order();

        let store = &self.store;
        let clock = &self.clock;
        let order = order.as_slice();
        let leased = self
            .with_store_retry("lease", move || store.lease(order, owner, clock.now()))
            .await?;

        Ok(leased.map(|record| {
            JobMetrics::job_leased(&record.job_type, record.priority);
            debug!(
                job_id = %record.id,
                job_type = %record.job_type,
                priority = %record.priority,
                attempt = record.attempts,
                worker_id = %owner,
                "Leased job"
            );
            self.scheduler.track(record)
        }))
    }

    /// Mark a leased job done.
    pub async fn complete(&self, job: &JobRecord, owner: &str) -> JobResult<()> {
        let store = &self.store;
        let clock = &self.clock;
        let id = &job.id;
        self.with_store_retry("ack", move || store.ack(id, owner, clock.now()))
            .await?;

        debug!(job_id = %job.id, "Completed job");
        Ok(())
    }

    /// Record a failed attempt. Dead-lettered jobs are escalated after the
    /// state transition commits.
    pub async fn fail(&self, job: &JobRecord, owner: &str, error: &JobError) -> JobResult<FailOutcome> {
        let store = &self.store;
        let clock = &self.clock;
        let policy = self.policy.as_ref();
        let id = &job.id;
        let outcome = self
            .with_store_retry("fail", move || {
                store.fail(id, owner, error, policy, clock.now())
            })
            .await?;

        match &outcome {
            FailOutcome::Requeued { delay, retry_count } => {
                JobMetrics::job_retried(&job.job_type, *retry_count);
                debug!(
                    job_id = %job.id,
                    retry_count = retry_count,
                    delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                    "Scheduled job retry"
                );
                self.work_available.notify_waiters();
            }
            FailOutcome::DeadLettered(record) => {
                JobMetrics::job_dead_lettered(&record.job_type, error.kind());
                self.escalator
                    .escalate(record, error, self.clock.now())
                    .await;
            }
        }

        Ok(outcome)
    }

    /// Give up a held lease without acking or failing. The job returns to
    /// `Pending` on the next reclaim and keeps its retry count.
    pub async fn abandon(&self, job: &JobRecord, owner: &str) -> JobResult<()> {
        let store = &self.store;
        let clock = &self.clock;
        let id = &job.id;
        self.with_store_retry("abandon", move || store.abandon(id, owner, clock.now()))
            .await?;

        debug!(job_id = %job.id, worker_id = %owner, "Abandoned job lease");
        Ok(())
    }

    /// Return jobs with expired leases to `Pending`.
    pub async fn reclaim_expired_leases(&self) -> JobResult<Vec<JobId>> {
        let reclaimed = self.store.reclaim_expired_leases(self.clock.now()).await?;

        if !reclaimed.is_empty() {
            JobMetrics::jobs_reclaimed(reclaimed.len() as u64);
            info!(count = reclaimed.len(), "Reclaimed expired leases");
            self.work_available.notify_waiters();
        }

        Ok(reclaimed)
    }

    /// Delete terminal records whose retention has passed.
    pub async fn purge_expired(&self) -> JobResult<u64> {
        let purged = self.store.purge_expired(self.clock.now()).await?;

        if purged > 0 {
            JobMetrics::jobs_purged(purged);
            info!(count = purged, "Purged expired jobs");
        }

        Ok(purged)
    }

    /// Fetch a job record.
    pub async fn get_job(&self, id: &JobId) -> JobResult<Option<JobRecord>> {
        self.store.get(id).await
    }

    /// Per-state totals.
    pub async fn counts(&self) -> JobResult<StateCounts> {
        self.store.counts().await
    }

    /// Dead-letter entries in append order.
    ///
    /// Lazily paged; the stream ends at the last entry present when the final
    /// page is read. Entries are never mutated.
    pub fn dead_letter_feed(&self) -> BoxStream<'static, JobResult<DeadLetterEntry>> {
        let store = Arc::clone(self.escalator.store());

        stream::unfold(Some(0u64), move |offset| {
            let store = Arc::clone(&store);
            async move {
                let offset = offset?;
                match store.read(offset, FEED_PAGE_SIZE).await {
                    Ok(page) if page.is_empty() => None,
                    Ok(page) => {
                        let next = offset + page.len() as u64;
                        let items: Vec<_> = page.into_iter().map(Ok).collect();
                        Some((stream::iter(items), Some(next)))
                    }
                    Err(e) => Some((stream::iter(vec![Err(e)]), None)),
                }
            }
        })
        .flatten()
        .boxed()
    }

    /// A future resolved by the next submission, requeue, or reclaim.
    ///
    /// Call [`Notified::enable`] before checking the store so a signal sent in
    /// between is not lost.
    pub fn work_available(&self) -> Notified<'_> {
        self.work_available.notified()
    }

    /// How long an idle worker should wait before re-checking the store:
    /// until the earliest pending `not_before`, capped by `max_idle_wait`.
    pub async fn idle_wait(&self) -> Duration {
        let max_wait = self.config.worker.max_idle_wait();

        match self.store.next_not_before().await {
            Ok(Some(at)) => until(at, self.clock.now()).min(max_wait),
            Ok(None) => max_wait,
            Err(e) => {
                warn!(error = %e, "Failed to read next eligible time");
                max_wait
            }
        }
    }

    /// Retry a store call while the store is unavailable.
    async fn with_store_retry<T, F, Fut>(&self, operation: &'static str, mut op: F) -> JobResult<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = JobResult<T>>,
    {
        let policy = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(50))
            .with_max_interval(Duration::from_secs(5))
            .with_max_elapsed_time(Some(self.config.worker.store_retry_max_elapsed()))
            .build();

        backoff::future::retry(policy, || {
            let attempt = op();
            async move {
                attempt.await.map_err(|e| {
                    if e.is_store_unavailable() {
                        warn!(operation, error = %e, "Store unavailable, retrying");
                        backoff::Error::transient(e)
                    } else {
                        backoff::Error::permanent(e)
                    }
                })
            }
        })
        .await
    }
}

/// Builder for [`JobQueue`].
pub struct JobQueueBuilder {
    config: JobsConfig,
    store: Option<Arc<dyn JobStore>>,
    dead_letters: Option<Arc<dyn DeadLetterStore>>,
    policy: Option<Arc<dyn BackoffPolicy>>,
    clock: Option<Arc<dyn Clock>>,
}

impl JobQueueBuilder {
    /// Create a builder. Unset parts default to in-memory stores, the
    /// configured retry policy, and the system clock.
    pub fn new(config: JobsConfig) -> Self {
        Self {
            config,
            store: None,
            dead_letters: None,
            policy: None,
            clock: None,
        }
    }

    /// Use `store` for job records.
    pub fn store(mut self, store: Arc<dyn JobStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Use `store` for dead-letter entries.
    pub fn dead_letter_store(mut self, store: Arc<dyn DeadLetterStore>) -> Self {
        self.dead_letters = Some(store);
        self
    }

    /// Override the backoff policy.
    pub fn backoff_policy(mut self, policy: Arc<dyn BackoffPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Override the clock.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Validate the configuration and build the queue.
    pub fn build(self) -> JobResult<JobQueue> {
        self.config.validate()?;

        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryJobStore::new(self.config.queue.store_settings())));
        let dead_letters = self
            .dead_letters
            .unwrap_or_else(|| Arc::new(InMemoryDeadLetterStore::new()));
        let policy = self
            .policy
            .unwrap_or_else(|| Arc::new(RetryPolicy::from(&self.config.retry)));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));

        Ok(JobQueue {
            store,
            scheduler: PriorityScheduler::new(&self.config.queue.priority_weights),
            escalator: DeadLetterEscalator::new(dead_letters),
            policy,
            handlers: HandlerRegistry::new(),
            clock,
            work_available: Notify::new(),
            config: self.config,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::job::{JobState, Priority};
    use chrono::Utc;
    use futures::{FutureExt, TryStreamExt};
    use std::collections::BTreeMap;

    fn queue_with_clock(clock: Arc<ManualClock>) -> JobQueue {
        let queue = JobQueue::builder(JobsConfig::default())
            .clock(clock)
            .build()
            .unwrap();
        queue.register_fn("test_job", |_, _| async { Ok(()) }.boxed());
        queue
    }

    #[tokio::test]
    async fn test_submit_rejects_unregistered_type() {
        let queue = queue_with_clock(Arc::new(ManualClock::default()));
        let err = queue.submit(NewJob::new("unknown", Vec::new())).await.unwrap_err();
        assert!(matches!(err, JobError::UnknownJobType(_)));
    }

    #[tokio::test]
    async fn test_submit_rejects_unconfigured_priority() {
        let mut config = JobsConfig::default();
        config.queue.priority_weights = BTreeMap::from([(Priority::High, 1), (Priority::Low, 1)]);
        let queue = JobQueue::builder(config).build().unwrap();
        queue.register_fn("test_job", |_, _| async { Ok(()) }.boxed());

        let err = queue
            .submit(NewJob::new("test_job", Vec::new()).priority(Priority::Critical))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));

        let counts = queue.counts().await.unwrap();
        assert_eq!(counts.pending, 0);
    }

    #[tokio::test]
    async fn test_submit_rejects_negative_retries() {
        let queue = queue_with_clock(Arc::new(ManualClock::default()));
        let err = queue
            .submit(NewJob::new("test_job", Vec::new()).max_retries(-1))
            .await
            .unwrap_err();
        assert!(matches!(err, JobError::Validation(_)));
    }

    #[tokio::test]
    async fn test_build_rejects_invalid_config() {
        let mut config = JobsConfig::default();
        config.queue.priority_weights.clear();
        assert!(JobQueue::builder(config).build().is_err());
    }

    #[tokio::test]
    async fn test_fail_dead_letters_and_escalates() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = queue_with_clock(clock.clone());
        let id = queue
            .submit(NewJob::new("test_job", b"data".to_vec()).max_retries(0))
            .await
            .unwrap();

        let lease = queue.lease_next("w1").await.unwrap().unwrap();
        let outcome = queue
            .fail(&lease.record, "w1", &JobError::Handler("boom".into()))
            .await
            .unwrap();
        assert!(matches!(outcome, FailOutcome::DeadLettered(_)));

        let entries: Vec<DeadLetterEntry> = queue.dead_letter_feed().try_collect().await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, id);
        assert_eq!(entries[0].payload, b"data".to_vec());
        assert_eq!(entries[0].retry_count, 0);
    }

    #[tokio::test]
    async fn test_idle_wait_tracks_next_not_before() {
        let clock = Arc::new(ManualClock::new(Utc::now()));
        let queue = queue_with_clock(clock.clone());

        assert_eq!(queue.idle_wait().await, queue.config().worker.max_idle_wait());

        queue
            .submit(NewJob::new("test_job", Vec::new()).delay(Duration::from_millis(300)))
            .await
            .unwrap();
        assert_eq!(queue.idle_wait().await, Duration::from_millis(300));

        clock.advance(Duration::from_millis(500));
        assert_eq!(queue.idle_wait().await, Duration::ZERO);
    }

    #[tokio::test]
    async fn test_validate_handlers_reports_missing_types() {
        let store = Arc::new(InMemoryJobStore::default());
        let record = NewJob::new("orphan", Vec::new()).into_record(0, Utc::now()).unwrap();
        store.enqueue(record).await.unwrap();

        let queue = JobQueue::builder(JobsConfig::default())
            .store(store)
            .build()
            .unwrap();

        let err = queue.validate_handlers().await.unwrap_err();
        assert!(matches!(err, JobError::UnknownJobType(ref t) if t == "orphan"));

        queue.register_fn("orphan", |_, _| async { Ok(()) }.boxed());
        assert!(queue.validate_handlers().await.is_ok());
    }

    #[tokio::test]
    async fn test_dead_letter_feed_spans_pages() {
        let queue = queue_with_clock(Arc::new(ManualClock::new(Utc::now())));
        let error = JobError::Handler("boom".into());
        let mut dead = Vec::new();

        for _ in 0..(FEED_PAGE_SIZE + 5) {
            let id = queue
                .submit(NewJob::new("test_job", Vec::new()).max_retries(0))
                .await
                .unwrap();
            let lease = queue.lease_next("w1").await.unwrap().unwrap();
            queue.fail(&lease.record, "w1", &error).await.unwrap();
            dead.push(id);
        }

        let entries: Vec<DeadLetterEntry> = queue.dead_letter_feed().try_collect().await.unwrap();
        let ids: Vec<JobId> = entries.into_iter().map(|e| e.job_id).collect();
        assert_eq!(ids, dead);
    }

    #[tokio::test]
    async fn test_complete_marks_done() {
        let queue = queue_with_clock(Arc::new(ManualClock::new(Utc::now())));
        let id = queue.submit(NewJob::new("test_job", Vec::new())).await.unwrap();

        let lease = queue.lease_next("w1").await.unwrap().unwrap();
        assert_eq!(queue.scheduler().active_count(Priority::Medium), 1);
        queue.complete(&lease.record, "w1").await.unwrap();
        drop(lease);

        assert_eq!(queue.scheduler().active_count(Priority::Medium), 0);
        let record = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Done);
    }
}
