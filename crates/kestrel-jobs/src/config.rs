//! Job queue configuration.

use crate::error::{JobError, JobResult};
use crate::job::Priority;
use crate::retry::{RetryPolicy, RetryStrategy};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

/// Upper bound for any configured duration in seconds (100 years).
pub const MAX_DURATION_SECS: u64 = 100 * 365 * 86_400;

/// Configuration for the job queue system.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Worker pool configuration.
    #[serde(default)]
    pub worker: WorkerConfig,

    /// Queue configuration.
    #[serde(default)]
    pub queue: QueueConfig,

    /// Retry policy configuration.
    #[serde(default)]
    pub retry: RetryConfig,

    /// Store backend selection.
    #[serde(default)]
    pub store: StoreConfig,

    /// Redis connection configuration.
    #[serde(default)]
    pub redis: RedisConfig,
}

impl JobsConfig {
    /// Validates settings the engine cannot run safely without.
    pub fn validate(&self) -> JobResult<()> {
        if self.worker.concurrency == 0 {
            return Err(JobError::Configuration(
                "worker.concurrency must be at least 1".to_string(),
            ));
        }

        if self.queue.priority_weights.is_empty() {
            return Err(JobError::Configuration(
                "queue.priority_weights must name at least one priority class".to_string(),
            ));
        }

        if let Some((priority, _)) = self.queue.priority_weights.iter().find(|(_, w)| **w == 0) {
            return Err(JobError::Configuration(format!(
                "queue.priority_weights.{priority} must be at least 1"
            )));
        }

        let durations = [
            ("worker.job_timeout_secs", self.worker.job_timeout_secs),
            ("worker.store_retry_max_elapsed_secs", self.worker.store_retry_max_elapsed_secs),
            ("queue.lease_duration_secs", self.queue.lease_duration_secs),
            ("queue.reclaim_interval_secs", self.queue.reclaim_interval_secs),
            ("queue.completed_retention_secs", self.queue.completed_retention_secs),
            ("queue.dead_letter_retention_secs", self.queue.dead_letter_retention_secs),
        ];
        if let Some((name, secs)) = durations.iter().find(|(_, secs)| *secs > MAX_DURATION_SECS) {
            return Err(JobError::Configuration(format!(
                "{name} ({secs}) must not exceed {MAX_DURATION_SECS}"
            )));
        }

        if self.queue.lease_duration() <= self.worker.job_timeout() {
            return Err(JobError::Configuration(format!(
                "queue.lease_duration_secs ({}) must exceed worker.job_timeout_secs ({})",
                self.queue.lease_duration_secs, self.worker.job_timeout_secs
            )));
        }

        if self.queue.reclaim_interval_secs == 0 {
            return Err(JobError::Configuration(
                "queue.reclaim_interval_secs must be at least 1".to_string(),
            ));
        }

        Ok(())
    }
}

/// Worker pool configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkerConfig {
    /// Number of concurrent execution slots.
    #[serde(default = "default_concurrency")]
    pub concurrency: usize,

    /// Job execution timeout in seconds.
    #[serde(default = "default_job_timeout")]
    pub job_timeout_secs: u64,

    /// Longest an idle worker waits before re-checking the store, in
    /// milliseconds. Submissions made by other processes sharing the store
    /// do not wake local workers.
    #[serde(default = "default_max_idle_wait")]
    pub max_idle_wait_ms: u64,

    /// How long store calls are retried while the store is unavailable.
    #[serde(default = "default_store_retry_max_elapsed")]
    pub store_retry_max_elapsed_secs: u64,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            concurrency: default_concurrency(),
            job_timeout_secs: default_job_timeout(),
            max_idle_wait_ms: default_max_idle_wait(),
            store_retry_max_elapsed_secs: default_store_retry_max_elapsed(),
        }
    }
}

fn default_concurrency() -> usize {
    // Use available parallelism or fallback to 4
    std::thread::available_parallelism()
        .map(|p| p.get())
        .unwrap_or(4)
        .max(4)
}

fn default_job_timeout() -> u64 {
    300 // 5 minutes
}

fn default_max_idle_wait() -> u64 {
    1000
}

fn default_store_retry_max_elapsed() -> u64 {
    60
}

impl WorkerConfig {
    /// Returns job timeout as Duration.
    pub fn job_timeout(&self) -> Duration {
        Duration::from_secs(self.job_timeout_secs)
    }

    /// Returns the idle wait bound as Duration.
    pub fn max_idle_wait(&self) -> Duration {
        Duration::from_millis(self.max_idle_wait_ms)
    }

    /// Returns the store retry budget as Duration.
    pub fn store_retry_max_elapsed(&self) -> Duration {
        Duration::from_secs(self.store_retry_max_elapsed_secs)
    }
}

/// Queue configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// Worker slots conceptually reserved per priority class. Classes not
    /// listed are rejected on submit.
    #[serde(default = "default_priority_weights")]
    pub priority_weights: BTreeMap<Priority, u32>,

    /// Lease duration in seconds. Must exceed the job timeout.
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,

    /// How often expired leases are reclaimed, in seconds.
    #[serde(default = "default_reclaim_interval")]
    pub reclaim_interval_secs: u64,

    /// Retention for completed jobs in seconds.
    #[serde(default = "default_completed_retention")]
    pub completed_retention_secs: u64,

    /// Retention for dead-lettered jobs in seconds.
    #[serde(default = "default_dead_letter_retention")]
    pub dead_letter_retention_secs: u64,

    /// Retry ceiling for submissions that do not set one.
    #[serde(default = "default_max_retries")]
    pub default_max_retries: u32,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            priority_weights: default_priority_weights(),
            lease_duration_secs: default_lease_duration(),
            reclaim_interval_secs: default_reclaim_interval(),
            completed_retention_secs: default_completed_retention(),
            dead_letter_retention_secs: default_dead_letter_retention(),
            default_max_retries: default_max_retries(),
        }
    }
}

fn default_priority_weights() -> BTreeMap<Priority, u32> {
    BTreeMap::from([
        (Priority::Critical, 4),
        (Priority::High, 3),
        (Priority::Medium, 2),
        (Priority::Low, 1),
    ])
}

fn default_lease_duration() -> u64 {
    360 // job timeout plus one minute
}

fn default_reclaim_interval() -> u64 {
    15
}

fn default_completed_retention() -> u64 {
    86400 // 1 day
}

fn default_dead_letter_retention() -> u64 {
    86400 * 30 // 30 days
}

fn default_max_retries() -> u32 {
    3
}

impl QueueConfig {
    /// Returns lease duration as Duration.
    pub fn lease_duration(&self) -> Duration {
        Duration::from_secs(self.lease_duration_secs)
    }

    /// Returns reclaim interval as Duration.
    pub fn reclaim_interval(&self) -> Duration {
        Duration::from_secs(self.reclaim_interval_secs)
    }

    /// Returns the store retention settings.
    pub fn store_settings(&self) -> StoreSettings {
        StoreSettings {
            lease_duration: self.lease_duration(),
            completed_retention: Duration::from_secs(self.completed_retention_secs),
            dead_letter_retention: Duration::from_secs(self.dead_letter_retention_secs),
        }
    }
}

/// Lease and retention durations a store applies to state transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoreSettings {
    /// Lease duration handed out by `lease`.
    pub lease_duration: Duration,
    /// How long `Done` records are retained.
    pub completed_retention: Duration,
    /// How long `DeadLettered` records are retained.
    pub dead_letter_retention: Duration,
}

impl Default for StoreSettings {
    fn default() -> Self {
        QueueConfig::default().store_settings()
    }
}

/// Retry configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Backoff strategy.
    #[serde(default = "default_strategy")]
    pub strategy: RetryStrategy,

    /// Base delay in milliseconds.
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,

    /// Backoff multiplier.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,

    /// Jitter factor.
    #[serde(default)]
    pub jitter_factor: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            strategy: default_strategy(),
            base_delay_ms: default_base_delay(),
            max_delay_ms: default_max_delay(),
            multiplier: default_multiplier(),
            jitter_factor: 0.0,
        }
    }
}

fn default_strategy() -> RetryStrategy {
    RetryStrategy::Linear
}

fn default_base_delay() -> u64 {
    1000 // 1 second
}

fn default_max_delay() -> u64 {
    3600000 // 1 hour
}

fn default_multiplier() -> f64 {
    2.0
}

impl From<&RetryConfig> for RetryPolicy {
    fn from(config: &RetryConfig) -> Self {
        RetryPolicy {
            strategy: config.strategy,
            base_delay_ms: config.base_delay_ms,
            max_delay_ms: config.max_delay_ms,
            multiplier: config.multiplier,
            jitter_factor: config.jitter_factor.clamp(0.0, 1.0),
        }
    }
}

/// Store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// In-process store. State is lost on restart.
    #[default]
    Memory,
    /// Redis-backed store.
    Redis,
}

/// Store configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: StoreBackend,
}

/// Redis connection configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisConfig {
    /// Redis URL.
    #[serde(default = "default_redis_url")]
    pub url: String,

    /// Connection pool size.
    #[serde(default = "default_pool_size")]
    pub pool_size: usize,

    /// Key prefix for all job-related keys.
    #[serde(default = "default_key_prefix")]
    pub key_prefix: String,
}

impl Default for RedisConfig {
    fn default() -> Self {
        Self {
            url: default_redis_url(),
            pool_size: default_pool_size(),
            key_prefix: default_key_prefix(),
        }
    }
}

fn default_redis_url() -> String {
    "redis://localhost:6379".to_string()
}

fn default_pool_size() -> usize {
    10
}

fn default_key_prefix() -> String {
    "kestrel:jobs".to_string()
}
