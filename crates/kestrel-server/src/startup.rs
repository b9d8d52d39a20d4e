//! Server startup utilities.

use crate::config::{AppConfig, LoggingConfig};
use crate::error::{ServerError, ServerResult};
use crate::handlers::{JobPayload, ProcessJobHandler, PROCESS_JOB};
use kestrel_jobs::redis::{create_pool, RedisDeadLetterStore, RedisJobStore};
use kestrel_jobs::{Clock, JobId, JobQueue, NewJob, Priority, StoreBackend};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

/// Priorities cycled through by demo seeding.
const SEED_PRIORITIES: [Priority; 3] = [Priority::High, Priority::Medium, Priority::Low];

/// Retry ceiling for demo jobs.
const SEED_MAX_RETRIES: i64 = 3;

/// Prints the startup banner.
pub fn print_banner() {
    info!(r#"
    __ __          __             __
   / //_/__  _____/ /_________  / /
  / ,< / _ \/ ___/ __/ ___/ _ \/ /
 / /| /  __(__  ) /_/ /  /  __/ /
/_/ |_\___/____/\__/_/   \___/_/

                Job Worker
    "#);
}

/// Prints server startup information.
pub fn print_startup_info(config: &AppConfig) {
    let separator = "=".repeat(60);
    let jobs = &config.jobs;
    info!("{}", separator);
    info!("Environment:  {}", config.app.environment);
    info!("Store:        {:?}", jobs.store.backend);
    info!("Concurrency:  {}", jobs.worker.concurrency);
    info!("Weights:      {:?}", jobs.queue.priority_weights);
    info!("Job timeout:  {}s", jobs.worker.job_timeout_secs);
    info!("Lease:        {}s", jobs.queue.lease_duration_secs);
    info!("{}", separator);
}

/// Installs the global tracing subscriber.
pub fn init_logging(config: &LoggingConfig) -> ServerResult<()> {
    use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.level));
    let registry = tracing_subscriber::registry().with(filter);

    let result = if config.json {
        registry.with(fmt::layer().json().with_target(true)).try_init()
    } else {
        registry.with(fmt::layer().with_target(true)).try_init()
    };

    result.map_err(|e| ServerError::Logging(e.to_string()))
}

/// Builds the job queue over the configured store and registers handlers.
pub async fn build_queue(config: &AppConfig, clock: Arc<dyn Clock>) -> ServerResult<Arc<JobQueue>> {
    let jobs = &config.jobs;
    let mut builder = JobQueue::builder(jobs.clone()).clock(clock);

    if jobs.store.backend == StoreBackend::Redis {
        let pool = create_pool(&jobs.redis).await?;
        let prefix = &jobs.redis.key_prefix;
        builder = builder
            .store(Arc::new(RedisJobStore::new(
                pool.clone(),
                prefix,
                jobs.queue.store_settings(),
            )))
            .dead_letter_store(Arc::new(RedisDeadLetterStore::new(pool, prefix)));
    }

    let queue = Arc::new(builder.build()?);
    queue.register_handler(
        PROCESS_JOB,
        ProcessJobHandler::new(config.demo.simulated_failures),
    );

    Ok(queue)
}

/// Submits `count` demo jobs, cycling through high, medium, and low.
pub async fn seed_demo_jobs(queue: &JobQueue, count: u32) -> ServerResult<Vec<JobId>> {
    let mut ids = Vec::new();

    for (n, priority) in (1..=count).zip(SEED_PRIORITIES.iter().cycle()) {
        let payload = JobPayload::new(format!("Job #{n}"), *priority);
        let body = serde_json::to_vec(&payload)
            .map_err(|e| ServerError::Configuration(format!("demo payload: {e}")))?;

        let id = queue
            .submit(
                NewJob::new(PROCESS_JOB, body)
                    .priority(payload.priority_class())
                    .max_retries(SEED_MAX_RETRIES),
            )
            .await?;

        info!(job_id = %id, message = %payload.message, priority = %priority, "Enqueued demo job");
        ids.push(id);
    }

    Ok(ids)
}

/// Resolves on Ctrl+C or SIGTERM.
pub async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to install signal handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown...");
        }
        _ = terminate => {
            info!("Received terminate signal, initiating graceful shutdown...");
        }
    }
}
