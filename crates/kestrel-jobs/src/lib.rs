//! Kestrel Jobs - Durable Priority Job Queue
//!
//! A lease-based job dispatch engine with:
//! - Priority classes (critical, high, medium, low) with per-class worker weights
//! - Bounded worker pools with execution timeouts and graceful cancellation
//! - Pluggable retry backoff (linear by default)
//! - Dead-letter escalation for jobs that exhaust their retries
//! - In-memory and Redis-backed stores
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                    Kestrel Jobs Architecture                     │
//! ├─────────────────────────────────────────────────────────────────┤
//! │                                                                  │
//! │  submit()                                                        │
//! │     │                                                            │
//! │     ▼                                                            │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                  Durable Job Store                       │    │
//! │  │  ┌─────────┐ ┌─────────┐ ┌─────────┐ ┌─────────┐        │    │
//! │  │  │Critical │ │  High   │ │ Medium  │ │   Low   │        │    │
//! │  │  │ Pending │ │ Pending │ │ Pending │ │ Pending │        │    │
//! │  │  └────┬────┘ └────┬────┘ └────┬────┘ └────┬────┘        │    │
//! │  │       └───────────┴─────┬────┴───────────┘              │    │
//! │  └─────────────────────────┼───────────────────────────────┘    │
//! │                            │ lease (priority scheduler)          │
//! │                            ▼                                     │
//! │  ┌─────────────────────────────────────────────────────────┐    │
//! │  │                   Worker Pool                            │    │
//! │  │  ┌──────────┐ ┌──────────┐ ┌──────────┐ ┌──────────┐    │    │
//! │  │  │ Worker 1 │ │ Worker 2 │ │ Worker 3 │ │ Worker N │    │    │
//! │  │  └────┬─────┘ └────┬─────┘ └────┬─────┘ └────┬─────┘    │    │
//! │  │       └────────────┴─────┬──────┴────────────┘          │    │
//! │  │              ┌───────────┼───────────┐                  │    │
//! │  │              ▼           ▼           ▼                  │    │
//! │  │          ┌──────┐  ┌──────────┐ ┌─────────────┐         │    │
//! │  │          │ Done │  │ Retry w/ │ │ Dead Letter │         │    │
//! │  │          │      │  │ backoff  │ │    Store    │         │    │
//! │  │          └──────┘  └──────────┘ └─────────────┘         │    │
//! │  └─────────────────────────────────────────────────────────┘    │
//! │                                                                  │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_jobs::prelude::*;
//! use futures::FutureExt;
//!
//! let queue = Arc::new(JobQueue::builder(JobsConfig::default()).build()?);
//!
//! queue.register_fn("send_email", |ctx, payload| {
//!     async move {
//!         // Send email logic
//!         Ok(())
//!     }
//!     .boxed()
//! });
//!
//! queue
//!     .submit(NewJob::new("send_email", payload).priority(Priority::High).max_retries(3))
//!     .await?;
//!
//! WorkerPool::new(queue).run().await?;
//! ```

pub mod clock;
pub mod config;
pub mod dead_letter;
pub mod error;
pub mod handler;
pub mod job;
pub mod metrics;
pub mod queue;
pub mod redis;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod worker;

pub use clock::{Clock, ManualClock, SystemClock, TokioClock};
pub use config::{JobsConfig, StoreBackend, StoreSettings};
pub use dead_letter::{DeadLetterEntry, DeadLetterEscalator, DeadLetterStore, InMemoryDeadLetterStore};
pub use error::{JobError, JobResult};
pub use handler::{FnHandler, HandlerRegistry, JobHandler};
pub use job::{JobContext, JobId, JobRecord, JobState, NewJob, Priority};
pub use metrics::{register_metrics, JobMetrics};
pub use queue::{JobQueue, JobQueueBuilder};
pub use retry::{BackoffPolicy, RetryDecision, RetryPolicy, RetryStrategy};
pub use scheduler::{ActiveLease, PriorityScheduler};
pub use store::{FailOutcome, InMemoryJobStore, JobStore, StateCounts};
pub use worker::{WorkerPool, WorkerPoolStats};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::handler::JobHandler;
    pub use crate::job::{JobContext, JobId, NewJob, Priority};
    pub use crate::queue::JobQueue;
    pub use crate::retry::{BackoffPolicy, RetryPolicy};
    pub use crate::worker::WorkerPool;
    pub use crate::{JobError, JobResult, JobsConfig};
}
