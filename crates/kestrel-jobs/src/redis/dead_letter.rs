//! Redis dead-letter store.

use super::RedisKeys;
use crate::dead_letter::{DeadLetterEntry, DeadLetterStore};
use crate::error::JobResult;
use async_trait::async_trait;
use deadpool_redis::Pool;
use redis::AsyncCommands;

/// Dead-letter entries kept as JSON in a Redis list, in append order.
pub struct RedisDeadLetterStore {
    pool: Pool,
    key: String,
}

impl RedisDeadLetterStore {
    /// Create a store under `key_prefix`.
    pub fn new(pool: Pool, key_prefix: impl Into<String>) -> Self {
        Self {
            pool,
            key: RedisKeys::new(key_prefix).dead_letter(),
        }
    }
}

#[async_trait]
impl DeadLetterStore for RedisDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> JobResult<()> {
        let json = serde_json::to_string(&entry)?;
        let mut conn = self.pool.get().await?;
        let _: () = conn.rpush(&self.key, json).await?;
        Ok(())
    }

    async fn read(&self, offset: u64, limit: usize) -> JobResult<Vec<DeadLetterEntry>> {
        if limit == 0 {
            return Ok(Vec::new());
        }

        let start = isize::try_from(offset).unwrap_or(isize::MAX);
        let stop = start.saturating_add(isize::try_from(limit).unwrap_or(isize::MAX) - 1);

        let mut conn = self.pool.get().await?;
        let raw: Vec<String> = conn.lrange(&self.key, start, stop).await?;

        raw.iter()
            .map(|json| serde_json::from_str(json).map_err(Into::into))
            .collect()
    }

    async fn len(&self) -> JobResult<u64> {
        let mut conn = self.pool.get().await?;
        let len: u64 = conn.llen(&self.key).await?;
        Ok(len)
    }
}
