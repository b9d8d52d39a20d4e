//! Application runner.

use crate::config::AppConfig;
use crate::error::ServerResult;
use crate::startup::{build_queue, print_startup_info, seed_demo_jobs};
use futures::StreamExt;
use kestrel_jobs::{register_metrics, Clock, JobError, JobQueue, SystemClock, WorkerPool, WorkerPoolStats};
use std::future::Future;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Runs the worker pool for a loaded configuration.
pub struct App {
    config: AppConfig,
    clock: Arc<dyn Clock>,
}

impl App {
    /// Creates an application for `config` on the system clock.
    pub fn new(config: AppConfig) -> Self {
        Self {
            config,
            clock: Arc::new(SystemClock),
        }
    }

    /// Overrides the clock.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Runs until `shutdown` resolves or the pool stops with a fatal error.
    pub async fn run(self, shutdown: impl Future<Output = ()>) -> ServerResult<WorkerPoolStats> {
        register_metrics();

        let queue = build_queue(&self.config, self.clock).await?;
        print_startup_info(&self.config);

        if self.config.demo.seed_jobs > 0 {
            let ids = seed_demo_jobs(&queue, self.config.demo.seed_jobs).await?;
            info!(count = ids.len(), "Seeded demo jobs");
        }

        let pool = Arc::new(WorkerPool::new(Arc::clone(&queue)));
        let mut runner = tokio::spawn({
            let pool = Arc::clone(&pool);
            async move { pool.run().await }
        });

        let finished = tokio::select! {
            joined = &mut runner => Some(joined),
            () = shutdown => None,
        };
        let joined = match finished {
            Some(joined) => joined,
            None => {
                pool.stop();
                runner.await
            }
        };
        joined.map_err(|e| JobError::Internal(format!("worker pool task failed: {e}")))??;

        log_summary(&queue).await;
        Ok(pool.stats())
    }
}

async fn log_summary(queue: &JobQueue) {
    match queue.counts().await {
        Ok(counts) => info!(
            pending = counts.pending,
            leased = counts.leased,
            done = counts.done,
            dead_lettered = counts.dead_lettered,
            "Job totals"
        ),
        Err(e) => error!(error = %e, "Failed to read job totals"),
    }

    let mut feed = queue.dead_letter_feed();
    while let Some(entry) = feed.next().await {
        match entry {
            Ok(entry) => warn!(
                job_id = %entry.job_id,
                job_type = %entry.job_type,
                priority = %entry.priority,
                retry_count = entry.retry_count,
                error = %entry.error,
                "Dead-lettered job"
            ),
            Err(e) => {
                error!(error = %e, "Failed to read dead-letter feed");
                break;
            }
        }
    }
}
