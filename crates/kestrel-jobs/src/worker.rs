//! Worker pool for processing jobs.

use crate::error::{JobError, JobResult};
use crate::metrics::JobMetrics;
use crate::queue::JobQueue;
use crate::scheduler::ActiveLease;
use crate::store::FailOutcome;
use futures::FutureExt;
use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::{timeout, Instant, MissedTickBehavior};
use tracing::{debug, error, info, warn, Instrument};
use uuid::Uuid;

/// Lower bound on an idle wait, so a worker never spins on the store.
const MIN_IDLE_WAIT: Duration = Duration::from_millis(1);

#[derive(Debug, Default)]
struct PoolCounters {
    processed: AtomicU64,
    failed: AtomicU64,
    retried: AtomicU64,
    dead_lettered: AtomicU64,
    cancelled: AtomicU64,
}

/// Worker pool for concurrent job processing.
///
/// Runs `worker.concurrency` worker tasks plus one maintenance task that
/// reclaims expired leases and purges expired records.
pub struct WorkerPool {
    /// Unique pool ID.
    id: String,

    /// Job queue.
    queue: Arc<JobQueue>,

    /// Shutdown signal sender.
    shutdown_tx: watch::Sender<bool>,

    /// Running flag.
    running: Arc<AtomicBool>,

    /// Outcome counters.
    counters: Arc<PoolCounters>,
}

impl WorkerPool {
    /// Create a new worker pool over `queue`.
    pub fn new(queue: Arc<JobQueue>) -> Self {
        let (shutdown_tx, _) = watch::channel(false);

        Self {
            id: format!("worker-pool-{}", Uuid::new_v4()),
            queue,
            shutdown_tx,
            running: Arc::new(AtomicBool::new(false)),
            counters: Arc::new(PoolCounters::default()),
        }
    }

    /// Run the pool until [`stop`](Self::stop) is called or a fatal error
    /// occurs.
    ///
    /// Refuses to start if the store holds pending jobs with no registered
    /// handler. A worker that leases such a job anyway abandons it and stops
    /// the pool, which then returns [`JobError::UnknownJobType`].
    pub async fn run(&self) -> JobResult<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            return Err(JobError::Internal("Worker pool already running".to_string()));
        }

        let result = self.run_workers().await;
        self.running.store(false, Ordering::SeqCst);

        info!(
            pool_id = %self.id,
            processed = self.counters.processed.load(Ordering::Relaxed),
            failed = self.counters.failed.load(Ordering::Relaxed),
            "Worker pool stopped"
        );

        result
    }

    async fn run_workers(&self) -> JobResult<()> {
        self.queue.validate_handlers().await?;
        self.shutdown_tx.send_replace(false);

        let worker_config = &self.queue.config().worker;
        let queue_config = &self.queue.config().queue;

        info!(
            pool_id = %self.id,
            concurrency = worker_config.concurrency,
            classes = ?self.queue.scheduler().classes(),
            "Starting worker pool"
        );

        let mut tasks = JoinSet::new();

        for n in 0..worker_config.concurrency {
            let worker = Worker {
                id: format!("{}-{}", self.id, n),
                queue: Arc::clone(&self.queue),
                job_timeout: worker_config.job_timeout(),
                counters: Arc::clone(&self.counters),
            };
            let span = tracing::info_span!("worker", worker_id = %worker.id);
            tasks.spawn(worker.run(self.shutdown_tx.subscribe()).instrument(span));
        }

        tasks.spawn(
            maintain(
                Arc::clone(&self.queue),
                queue_config.reclaim_interval(),
                self.shutdown_tx.subscribe(),
            )
            .instrument(tracing::info_span!("maintenance", pool_id = %self.id)),
        );

        let mut result = Ok(());

        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => Err(JobError::Internal(format!("worker task failed: {e}"))),
            };

            if let Err(e) = outcome {
                error!(pool_id = %self.id, error = %e, "Worker stopped with a fatal error");
                self.shutdown_tx.send_replace(true);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }

        result
    }

    /// Stop the worker pool. Running handlers are cancelled and their leases
    /// abandoned.
    pub fn stop(&self) {
        info!(pool_id = %self.id, "Stopping worker pool...");
        self.shutdown_tx.send_replace(true);
    }

    /// Check if the pool is running.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Get the pool ID.
    pub fn id(&self) -> &str {
        &self.id
    }

    /// Get pool statistics.
    pub fn stats(&self) -> WorkerPoolStats {
        WorkerPoolStats {
            id: self.id.clone(),
            running: self.is_running(),
            concurrency: self.queue.config().worker.concurrency,
            jobs_processed: self.counters.processed.load(Ordering::Relaxed),
            jobs_failed: self.counters.failed.load(Ordering::Relaxed),
            jobs_retried: self.counters.retried.load(Ordering::Relaxed),
            jobs_dead_lettered: self.counters.dead_lettered.load(Ordering::Relaxed),
            jobs_cancelled: self.counters.cancelled.load(Ordering::Relaxed),
        }
    }
}

/// Worker pool statistics.
#[derive(Debug, Clone)]
pub struct WorkerPoolStats {
    /// Pool ID.
    pub id: String,

    /// Is running.
    pub running: bool,

    /// Configured concurrency.
    pub concurrency: usize,

    /// Jobs completed successfully.
    pub jobs_processed: u64,

    /// Failed attempts.
    pub jobs_failed: u64,

    /// Failed attempts requeued with backoff.
    pub jobs_retried: u64,

    /// Jobs dead-lettered.
    pub jobs_dead_lettered: u64,

    /// Attempts cancelled by shutdown.
    pub jobs_cancelled: u64,
}

/// One execution slot.
struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    job_timeout: Duration,
    counters: Arc<PoolCounters>,
}

impl Worker {
    async fn run(self, mut shutdown: watch::Receiver<bool>) -> JobResult<()> {
        debug!(worker_id = %self.id, "Worker started");

        loop {
            if *shutdown.borrow() {
                break;
            }

            // Registered before the store is checked so a submission landing
            // in between still wakes this worker.
            let notified = self.queue.work_available();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.queue.lease_next(&self.id).await {
                Ok(Some(lease)) => self.execute(lease, &mut shutdown).await?,
                Ok(None) => {
                    let wait = self.queue.idle_wait().await.max(MIN_IDLE_WAIT);
                    tokio::select! {
                        () = notified.as_mut() => {}
                        () = tokio::time::sleep(wait) => {}
                        () = shutdown_requested(&mut shutdown) => break,
                    }
                }
                Err(e) => {
                    error!(worker_id = %self.id, error = %e, "Failed to lease job");
                    let wait = self.queue.config().worker.max_idle_wait();
                    tokio::select! {
                        () = tokio::time::sleep(wait) => {}
                        () = shutdown_requested(&mut shutdown) => break,
                    }
                }
            }
        }

        debug!(worker_id = %self.id, "Worker stopped");
        Ok(())
    }

    async fn execute(&self, lease: ActiveLease, shutdown: &mut watch::Receiver<bool>) -> JobResult<()> {
        let job = &lease.record;

        let Some(handler) = self.queue.handler(&job.job_type) else {
            error!(
                job_id = %job.id,
                job_type = %job.job_type,
                "No handler registered for job type"
            );
            if let Err(e) = self.queue.abandon(job, &self.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to abandon lease");
            }
            return Err(JobError::UnknownJobType(job.job_type.clone()));
        };

        debug!(
            job_id = %job.id,
            job_type = %job.job_type,
            attempt = job.attempts,
            "Processing job"
        );

        let ctx = job.to_context(&self.id);
        let started = Instant::now();
        let execution = AssertUnwindSafe(handler.handle(ctx, job.payload.clone())).catch_unwind();

        let outcome = tokio::select! {
            result = timeout(self.job_timeout, execution) => match result {
                Ok(Ok(Ok(()))) => Ok(()),
                Ok(Ok(Err(e))) => Err(e),
                Ok(Err(panic)) => Err(JobError::Handler(format!(
                    "handler panicked: {}",
                    panic_message(panic.as_ref())
                ))),
                Err(_) => Err(JobError::Timeout(self.job_timeout)),
            },
            () = shutdown_requested(shutdown) => {
                // No ack or fail: the abandoned lease is recovered by reclaim.
                info!(job_id = %job.id, "Job cancelled by shutdown");
                JobMetrics::job_cancelled(&job.job_type);
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                if let Err(e) = self.queue.abandon(job, &self.id).await {
                    warn!(job_id = %job.id, error = %e, "Failed to abandon lease");
                }
                return Ok(());
            }
        };

        let elapsed = started.elapsed();

        match outcome {
            Ok(()) => match self.queue.complete(job, &self.id).await {
                Ok(()) => {
                    JobMetrics::job_completed(&job.job_type, elapsed);
                    self.counters.processed.fetch_add(1, Ordering::Relaxed);
                }
                Err(e) => {
                    error!(job_id = %job.id, error = %e, "Failed to mark job as complete");
                }
            },
            Err(error) => {
                if let JobError::Timeout(limit) = &error {
                    warn!(job_id = %job.id, timeout = ?limit, "Job timed out");
                    JobMetrics::job_timed_out(&job.job_type);
                } else {
                    warn!(job_id = %job.id, error = %error, "Job execution failed");
                }
                JobMetrics::job_failed(&job.job_type, error.kind(), elapsed);
                self.counters.failed.fetch_add(1, Ordering::Relaxed);

                match self.queue.fail(job, &self.id, &error).await {
                    Ok(FailOutcome::Requeued { .. }) => {
                        self.counters.retried.fetch_add(1, Ordering::Relaxed);
                    }
                    Ok(FailOutcome::DeadLettered(_)) => {
                        self.counters.dead_lettered.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        error!(job_id = %job.id, error = %e, "Failed to mark job as failed");
                    }
                }
            }
        }

        Ok(())
    }
}

/// Periodically reclaims expired leases and purges expired records.
async fn maintain(
    queue: Arc<JobQueue>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) -> JobResult<()> {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(e) = queue.reclaim_expired_leases().await {
                    error!(error = %e, "Failed to reclaim expired leases");
                }
                if let Err(e) = queue.purge_expired().await {
                    error!(error = %e, "Failed to purge expired jobs");
                }
            }
            () = shutdown_requested(&mut shutdown) => break,
        }
    }

    Ok(())
}

/// Resolves once shutdown has been requested or the pool is gone.
async fn shutdown_requested(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

fn panic_message<'a>(panic: &'a (dyn Any + Send + 'static)) -> &'a str {
    if let Some(s) = panic.downcast_ref::<&str>() {
        s
    } else if let Some(s) = panic.downcast_ref::<String>() {
        s
    } else {
        "unknown panic"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::config::JobsConfig;
    use crate::job::{JobState, NewJob};
    use futures::future::pending;

    fn test_queue() -> Arc<JobQueue> {
        let mut config = JobsConfig::default();
        config.worker.concurrency = 2;
        config.worker.job_timeout_secs = 5;
        config.queue.lease_duration_secs = 10;
        config.queue.reclaim_interval_secs = 1;

        Arc::new(
            JobQueue::builder(config)
                .clock(Arc::new(TokioClock::new()))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn test_panic_message() {
        let boxed: Box<dyn Any + Send> = Box::new("boom");
        assert_eq!(panic_message(boxed.as_ref()), "boom");
        let boxed: Box<dyn Any + Send> = Box::new(String::from("bang"));
        assert_eq!(panic_message(boxed.as_ref()), "bang");
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_processes_job() {
        let queue = test_queue();
        queue.register_fn("test_job", |_, _| async { Ok(()) }.boxed());
        let id = queue.submit(NewJob::new("test_job", Vec::new())).await.unwrap();

        let pool = Arc::new(WorkerPool::new(queue.clone()));
        let runner = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop();
        runner.await.unwrap().unwrap();

        assert_eq!(queue.get_job(&id).await.unwrap().unwrap().state, JobState::Done);
        assert_eq!(pool.stats().jobs_processed, 1);
        assert!(!pool.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_pool_refuses_to_start_with_unregistered_pending_type() {
        let queue = test_queue();
        let record = NewJob::new("orphan", Vec::new())
            .into_record(0, queue.now())
            .unwrap();
        queue.store().enqueue(record).await.unwrap();

        let pool = WorkerPool::new(queue);
        let err = pool.run().await.unwrap_err();
        assert!(matches!(err, JobError::UnknownJobType(_)));
        assert!(!pool.is_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_abandons_running_job() {
        let queue = test_queue();
        queue.register_fn("stuck", |_, _| pending::<Result<(), JobError>>().boxed());
        let id = queue.submit(NewJob::new("stuck", Vec::new())).await.unwrap();

        let pool = Arc::new(WorkerPool::new(queue.clone()));
        let runner = tokio::spawn({
            let pool = pool.clone();
            async move { pool.run().await }
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        pool.stop();
        runner.await.unwrap().unwrap();

        let record = queue.get_job(&id).await.unwrap().unwrap();
        assert_eq!(record.state, JobState::Leased);
        assert_eq!(record.retry_count, 0);
        assert_eq!(pool.stats().jobs_cancelled, 1);
        assert_eq!(pool.stats().jobs_failed, 0);

        tokio::time::sleep(Duration::from_millis(1)).await;
        let reclaimed = queue.reclaim_expired_leases().await.unwrap();
        assert_eq!(reclaimed, vec![id]);
    }
}
