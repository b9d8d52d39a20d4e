//! Dead-letter escalation.
//!
//! Jobs that exhaust their retry budget are copied into an append-only store
//! that is read by operators and never mutated by the engine.

use crate::error::{JobError, JobResult};
use crate::job::{JobId, JobRecord, Priority};
use crate::metrics::JobMetrics;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{error, warn};

/// A dead-lettered job with its failure metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterEntry {
    /// Job ID.
    pub job_id: JobId,

    /// Handler name.
    pub job_type: String,

    /// Priority class at submission.
    pub priority: Priority,

    /// Payload as submitted.
    pub payload: Vec<u8>,

    /// Final error description.
    pub error: String,

    /// Retry count at exhaustion.
    pub retry_count: u32,

    /// When the job was dead-lettered.
    pub timestamp: DateTime<Utc>,
}

impl DeadLetterEntry {
    /// Builds an entry from a dead-lettered record.
    pub fn from_record(record: &JobRecord, error: &JobError, timestamp: DateTime<Utc>) -> Self {
        Self {
            job_id: record.id.clone(),
            job_type: record.job_type.clone(),
            priority: record.priority,
            payload: record.payload.clone(),
            error: record
                .last_error
                .clone()
                .unwrap_or_else(|| error.to_string()),
            retry_count: record.retry_count,
            timestamp,
        }
    }
}

/// Append-only dead-letter store, keyed independently of the job store.
#[async_trait]
pub trait DeadLetterStore: Send + Sync {
    /// Append an entry.
    async fn append(&self, entry: DeadLetterEntry) -> JobResult<()>;

    /// Read up to `limit` entries starting at `offset`, in append order.
    async fn read(&self, offset: u64, limit: usize) -> JobResult<Vec<DeadLetterEntry>>;

    /// Number of entries.
    async fn len(&self) -> JobResult<u64>;
}

/// In-process dead-letter store.
#[derive(Debug, Default)]
pub struct InMemoryDeadLetterStore {
    entries: RwLock<Vec<DeadLetterEntry>>,
}

impl InMemoryDeadLetterStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl DeadLetterStore for InMemoryDeadLetterStore {
    async fn append(&self, entry: DeadLetterEntry) -> JobResult<()> {
        self.entries.write().push(entry);
        Ok(())
    }

    async fn read(&self, offset: u64, limit: usize) -> JobResult<Vec<DeadLetterEntry>> {
        let entries = self.entries.read();
        let start = usize::try_from(offset).unwrap_or(usize::MAX).min(entries.len());
        Ok(entries[start..].iter().take(limit).cloned().collect())
    }

    async fn len(&self) -> JobResult<u64> {
        Ok(self.entries.read().len() as u64)
    }
}

/// Forwards dead-lettered jobs to a [`DeadLetterStore`].
///
/// The job's `DeadLettered` state is committed before escalation runs, so an
/// append failure only loses the entry. It is logged and counted, never
/// returned.
#[derive(Clone)]
pub struct DeadLetterEscalator {
    store: Arc<dyn DeadLetterStore>,
}

impl DeadLetterEscalator {
    /// Create an escalator writing to `store`.
    pub fn new(store: Arc<dyn DeadLetterStore>) -> Self {
        Self { store }
    }

    /// The underlying store.
    pub fn store(&self) -> &Arc<dyn DeadLetterStore> {
        &self.store
    }

    /// Record a dead-lettered job. Returns true if the entry was appended.
    pub async fn escalate(&self, record: &JobRecord, error: &JobError, now: DateTime<Utc>) -> bool {
        let entry = DeadLetterEntry::from_record(record, error, now);

        warn!(
            job_id = %record.id,
            job_type = %record.job_type,
            retry_count = record.retry_count,
            error = %entry.error,
            "Job moved to dead letter store"
        );

        match self.store.append(entry).await {
            Ok(()) => true,
            Err(e) => {
                error!(
                    job_id = %record.id,
                    job_type = %record.job_type,
                    error = %e,
                    "Failed to append dead letter entry; entry lost"
                );
                JobMetrics::dead_letter_append_failed(&record.job_type);
                false
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::{JobState, NewJob};

    struct BrokenStore;

    #[async_trait]
    impl DeadLetterStore for BrokenStore {
        async fn append(&self, _entry: DeadLetterEntry) -> JobResult<()> {
            Err(JobError::StoreUnavailable("disk full".into()))
        }

        async fn read(&self, _offset: u64, _limit: usize) -> JobResult<Vec<DeadLetterEntry>> {
            Ok(Vec::new())
        }

        async fn len(&self) -> JobResult<u64> {
            Ok(0)
        }
    }

    fn dead_record() -> JobRecord {
        let mut record = NewJob::new("send_email", b"{}".to_vec())
            .priority(Priority::High)
            .max_retries(2)
            .into_record(0, Utc::now())
            .unwrap();
        record.state = JobState::DeadLettered;
        record.retry_count = 2;
        record.last_error = Some("Job execution failed: smtp down".into());
        record
    }

    #[tokio::test]
    async fn test_escalate_appends_entry() {
        let store = Arc::new(InMemoryDeadLetterStore::new());
        let escalator = DeadLetterEscalator::new(store.clone());
        let record = dead_record();

        assert!(escalator.escalate(&record, &JobError::Handler("smtp down".into()), Utc::now()).await);

        let entries = store.read(0, 10).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].job_id, record.id);
        assert_eq!(entries[0].retry_count, 2);
        assert_eq!(entries[0].payload, b"{}".to_vec());
        assert_eq!(entries[0].error, "Job execution failed: smtp down");
    }

    #[tokio::test]
    async fn test_escalate_swallows_append_failure() {
        let escalator = DeadLetterEscalator::new(Arc::new(BrokenStore));
        let record = dead_record();

        assert!(!escalator.escalate(&record, &JobError::Handler("x".into()), Utc::now()).await);
    }

    #[tokio::test]
    async fn test_read_pages_in_append_order() {
        let store = InMemoryDeadLetterStore::new();
        let error = JobError::Handler("x".into());
        for _ in 0..5 {
            store
                .append(DeadLetterEntry::from_record(&dead_record(), &error, Utc::now()))
                .await
                .unwrap();
        }

        let all = store.read(0, 10).await.unwrap();
        let page = store.read(3, 10).await.unwrap();
        assert_eq!(store.len().await.unwrap(), 5);
        assert_eq!(page.len(), 2);
        assert_eq!(page[0], all[3]);
        assert!(store.read(9, 10).await.unwrap().is_empty());
    }
}
