//! Redis-backed job and dead-letter stores.

mod codec;
mod dead_letter;
mod scripts;
mod store;

pub use dead_letter::RedisDeadLetterStore;
pub use store::RedisJobStore;

use crate::config::RedisConfig;
use crate::error::{JobError, JobResult};
use crate::job::Priority;
use deadpool_redis::{Config, Pool, Runtime};
use tracing::info;

/// Create a Redis connection pool.
pub async fn create_pool(config: &RedisConfig) -> JobResult<Pool> {
    info!("Creating Redis connection pool for job store...");

    let cfg = Config::from_url(&config.url);

    let pool = cfg
        .builder()
        .map_err(|e| JobError::Configuration(format!("Invalid Redis config: {}", e)))?
        .max_size(config.pool_size)
        .runtime(Runtime::Tokio1)
        .build()
        .map_err(|e| JobError::Configuration(format!("Failed to create pool: {}", e)))?;

    // Test connection
    let mut conn = pool.get().await?;
    redis::cmd("PING")
        .query_async::<String>(&mut *conn)
        .await?;

    info!("Redis connection pool created successfully");

    Ok(pool)
}

/// Redis key builder for the job store.
#[derive(Debug, Clone)]
pub struct RedisKeys {
    prefix: String,
}

impl RedisKeys {
    /// Create a new key builder with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Job record key (hash of record fields).
    pub fn job(&self, job_id: &str) -> String {
        format!("{}{}", self.job_prefix(), job_id)
    }

    /// Prefix shared by all job record keys.
    pub fn job_prefix(&self) -> String {
        format!("{}:job:", self.prefix)
    }

    /// Pending jobs of one class (sorted set scored by `not_before` ms).
    pub fn pending(&self, priority: Priority) -> String {
        format!("{}{}", self.pending_prefix(), priority.as_str())
    }

    /// Prefix shared by the pending sets.
    pub fn pending_prefix(&self) -> String {
        format!("{}:pending:", self.prefix)
    }

    /// Leased jobs (sorted set scored by lease expiry ms).
    pub fn leased(&self) -> String {
        format!("{}:leased", self.prefix)
    }

    /// Completed jobs (sorted set scored by retention deadline ms).
    pub fn done(&self) -> String {
        format!("{}:done", self.prefix)
    }

    /// Dead-lettered jobs (sorted set scored by retention deadline ms).
    pub fn dead(&self) -> String {
        format!("{}:dead", self.prefix)
    }

    /// Dead-letter entries (list of JSON entries, append order).
    pub fn dead_letter(&self) -> String {
        format!("{}:dead_letter", self.prefix)
    }
}

impl Default for RedisKeys {
    fn default() -> Self {
        Self::new("kestrel:jobs")
    }
}
