//! Queue-level scenarios driven by a manual clock.

mod common;

use chrono::{DateTime, Utc};
use common::{queue_with, test_config, FaultyDeadLetterStore, FlakyStore};
use futures::{FutureExt, TryStreamExt};
use kestrel_jobs::{
    DeadLetterEntry, FailOutcome, JobError, JobId, JobQueue, JobState, ManualClock, NewJob,
    Priority, RetryPolicy, SystemClock,
};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio_test::{assert_err, assert_ok};

fn manual_queue() -> (Arc<JobQueue>, Arc<ManualClock>) {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = queue_with(test_config(1), clock.clone());
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());
    (queue, clock)
}

async fn submit(queue: &JobQueue, label: &str, priority: Priority, max_retries: i64) -> JobId {
    assert_ok!(
        queue
            .submit(
                NewJob::new("scenario", label.as_bytes().to_vec())
                    .priority(priority)
                    .max_retries(max_retries)
            )
            .await
    )
}

async fn lease_label(queue: &JobQueue) -> Option<(String, kestrel_jobs::ActiveLease)> {
    let lease = assert_ok!(queue.lease_next("w1").await)?;
    let label = String::from_utf8(lease.record.payload.clone()).expect("utf8 payload");
    Some((label, lease))
}

#[tokio::test]
async fn test_critical_retried_between_low_jobs() {
    let (queue, clock) = manual_queue();
    let critical = submit(&queue, "critical", Priority::Critical, 2).await;
    submit(&queue, "low-a", Priority::Low, 0).await;
    submit(&queue, "low-b", Priority::Low, 0).await;

    let boom = JobError::Handler("transient".into());
    let mut order = Vec::new();

    // Attempt 1 of critical fails; it backs off for 1s.
    let (label, lease) = lease_label(&queue).await.unwrap();
    order.push(label);
    let outcome = assert_ok!(queue.fail(&lease.record, "w1", &boom).await);
    assert_eq!(
        outcome,
        FailOutcome::Requeued {
            delay: Duration::from_secs(1),
            retry_count: 1
        }
    );
    drop(lease);

    let (label, lease) = lease_label(&queue).await.unwrap();
    order.push(label);
    assert_ok!(queue.complete(&lease.record, "w1").await);
    drop(lease);

    clock.advance(Duration::from_secs(1));

    // Attempt 2 of critical fails; linear backoff doubles the delay.
    let (label, lease) = lease_label(&queue).await.unwrap();
    order.push(label);
    let outcome = assert_ok!(queue.fail(&lease.record, "w1", &boom).await);
    assert_eq!(
        outcome,
        FailOutcome::Requeued {
            delay: Duration::from_secs(2),
            retry_count: 2
        }
    );
    drop(lease);

    let (label, lease) = lease_label(&queue).await.unwrap();
    order.push(label);
    assert_ok!(queue.complete(&lease.record, "w1").await);
    drop(lease);

    assert!(lease_label(&queue).await.is_none());
    clock.advance(Duration::from_secs(2));

    let (label, lease) = lease_label(&queue).await.unwrap();
    order.push(label);
    assert_ok!(queue.complete(&lease.record, "w1").await);

    assert_eq!(order, ["critical", "low-a", "critical", "low-b", "critical"]);

    let record = assert_ok!(queue.get_job(&critical).await).unwrap();
    assert_eq!(record.state, JobState::Done);
    assert_eq!(record.attempts, 3);
    assert_eq!(record.retry_count, 2);
}

#[tokio::test]
async fn test_critical_leased_before_earlier_low() {
    let (queue, _clock) = manual_queue();
    submit(&queue, "low", Priority::Low, 0).await;
    submit(&queue, "critical", Priority::Critical, 0).await;

    let (first, _lease) = lease_label(&queue).await.unwrap();
    assert_eq!(first, "critical");
}

#[tokio::test]
async fn test_same_class_is_fifo() {
    let (queue, _clock) = manual_queue();
    for label in ["a", "b", "c"] {
        submit(&queue, label, Priority::High, 0).await;
    }

    let mut order = Vec::new();
    while let Some((label, lease)) = lease_label(&queue).await {
        assert_ok!(queue.complete(&lease.record, "w1").await);
        order.push(label);
    }
    assert_eq!(order, ["a", "b", "c"]);
}

#[tokio::test]
async fn test_zero_retries_dead_letters_after_one_attempt() {
    let (queue, _clock) = manual_queue();
    let id = submit(&queue, "once", Priority::Medium, 0).await;

    let (_, lease) = lease_label(&queue).await.unwrap();
    let outcome = assert_ok!(
        queue
            .fail(&lease.record, "w1", &JobError::Handler("boom".into()))
            .await
    );
    assert!(matches!(outcome, FailOutcome::DeadLettered(_)));

    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::DeadLettered);
    assert_eq!(record.attempts, 1);
    assert_eq!(record.retry_count, 0);

    let entries: Vec<DeadLetterEntry> = assert_ok!(queue.dead_letter_feed().try_collect().await);
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].job_id, id);
    assert_eq!(entries[0].job_type, "scenario");
    assert_eq!(entries[0].priority, Priority::Medium);
    assert_eq!(entries[0].payload, b"once".to_vec());
    assert!(entries[0].error.contains("boom"));
}

#[tokio::test]
async fn test_retry_count_never_exceeds_max_retries() {
    let (queue, clock) = manual_queue();
    let id = submit(&queue, "flaky", Priority::High, 3).await;
    let boom = JobError::Handler("boom".into());
    let mut attempts = 0;

    loop {
        let (_, lease) = lease_label(&queue).await.unwrap();
        attempts += 1;
        match assert_ok!(queue.fail(&lease.record, "w1", &boom).await) {
            FailOutcome::Requeued { delay, retry_count } => {
                assert!(retry_count <= 3);
                clock.advance(delay);
            }
            FailOutcome::DeadLettered(record) => {
                assert_eq!(record.retry_count, 3);
                break;
            }
        }
    }

    assert_eq!(attempts, 4);
    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::DeadLettered);
    assert_eq!(record.attempts, 4);
}

#[tokio::test]
async fn test_backoff_is_monotonic_across_retries() {
    let (queue, clock) = manual_queue();
    submit(&queue, "flaky", Priority::Low, 5).await;
    let boom = JobError::Handler("boom".into());
    let mut delays = Vec::new();

    while let Some((_, lease)) = lease_label(&queue).await {
        if let FailOutcome::Requeued { delay, .. } = assert_ok!(queue.fail(&lease.record, "w1", &boom).await) {
            delays.push(delay);
            clock.advance(delay);
        }
    }

    assert_eq!(delays.len(), 5);
    assert!(delays.windows(2).all(|w| w[0] <= w[1]), "{delays:?}");
}

#[tokio::test]
async fn test_permanent_error_skips_retries() {
    let (queue, _clock) = manual_queue();
    let id = submit(&queue, "bad", Priority::Low, 5).await;

    let (_, lease) = lease_label(&queue).await.unwrap();
    let outcome = assert_ok!(
        queue
            .fail(&lease.record, "w1", &JobError::Permanent("malformed".into()))
            .await
    );
    assert!(matches!(outcome, FailOutcome::DeadLettered(_)));

    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::DeadLettered);
}

#[tokio::test]
async fn test_reclaim_does_not_consume_a_retry() {
    let (queue, clock) = manual_queue();
    let id = submit(&queue, "crashy", Priority::Medium, 1).await;

    let (_, lease) = lease_label(&queue).await.unwrap();
    drop(lease);

    // Worker vanished; its lease runs out.
    clock.advance(queue.config().queue.lease_duration() + Duration::from_secs(1));
    let reclaimed = assert_ok!(queue.reclaim_expired_leases().await);
    assert_eq!(reclaimed, vec![id.clone()]);

    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::Pending);
    assert_eq!(record.retry_count, 0);
    assert!(record.lease_owner.is_none());

    let (_, lease) = lease_label(&queue).await.unwrap();
    assert_eq!(lease.record.attempts, 2);
    assert_eq!(lease.record.retry_count, 0);
}

#[tokio::test]
async fn test_stale_owner_cannot_ack_after_reclaim() {
    let (queue, clock) = manual_queue();
    let id = submit(&queue, "slow", Priority::Medium, 1).await;

    let stale = assert_ok!(queue.lease_next("w1").await).unwrap();
    clock.advance(queue.config().queue.lease_duration() + Duration::from_secs(1));
    assert_ok!(queue.reclaim_expired_leases().await);

    let fresh = assert_ok!(queue.lease_next("w2").await).unwrap();
    assert_eq!(fresh.record.id, id);

    let err = assert_err!(queue.complete(&stale.record, "w1").await);
    assert!(matches!(err, JobError::LeaseNotHeld { .. }));

    assert_ok!(queue.complete(&fresh.record, "w2").await);
}

#[tokio::test]
async fn test_dead_letter_append_failure_keeps_state() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = JobQueue::builder(test_config(1))
        .clock(clock)
        .dead_letter_store(Arc::new(FaultyDeadLetterStore))
        .build()
        .expect("valid config");
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());

    let id = assert_ok!(queue.submit(NewJob::new("scenario", Vec::new()).max_retries(0)).await);
    let lease = assert_ok!(queue.lease_next("w1").await).unwrap();

    let outcome = assert_ok!(
        queue
            .fail(&lease.record, "w1", &JobError::Handler("boom".into()))
            .await
    );
    assert!(matches!(outcome, FailOutcome::DeadLettered(_)));

    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::DeadLettered);

    let counts = assert_ok!(queue.counts().await);
    assert_eq!(counts.dead_lettered, 1);
    assert_eq!(counts.pending, 0);
}

#[tokio::test]
async fn test_delayed_job_not_leased_early() {
    let (queue, clock) = manual_queue();
    assert_ok!(
        queue
            .submit(NewJob::new("scenario", Vec::new()).delay(Duration::from_secs(30)))
            .await
    );

    assert!(assert_ok!(queue.lease_next("w1").await).is_none());
    clock.advance(Duration::from_secs(30));
    assert!(assert_ok!(queue.lease_next("w1").await).is_some());
}

#[tokio::test]
async fn test_unavailable_store_is_retried() {
    let store = Arc::new(FlakyStore::new(2, || {
        JobError::StoreUnavailable("connection reset".into())
    }));
    let queue = JobQueue::builder(test_config(1))
        .store(store.clone())
        .build()
        .expect("valid config");
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());

    let id = assert_ok!(queue.submit(NewJob::new("scenario", Vec::new())).await);
    let lease = assert_ok!(queue.lease_next("w1").await).unwrap();

    assert_eq!(lease.record.id, id);
    assert_eq!(store.remaining_failures(), 0);
}

#[tokio::test]
async fn test_retried_lease_uses_current_time() {
    let start = Utc::now();
    let clock = Arc::new(ManualClock::new(start));
    let store = Arc::new(
        FlakyStore::new(2, || JobError::StoreUnavailable("connection reset".into()))
            .stalling(clock.clone(), Duration::from_secs(3)),
    );
    let queue = JobQueue::builder(test_config(1))
        .store(store.clone())
        .clock(clock.clone())
        .build()
        .expect("valid config");
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());

    assert_ok!(queue.submit(NewJob::new("scenario", Vec::new())).await);
    let lease = assert_ok!(queue.lease_next("w1").await).unwrap();

    // Two failed attempts moved the clock 6s before the lease went through.
    let lease_duration = chrono::Duration::from_std(queue.config().queue.lease_duration()).unwrap();
    assert_eq!(
        lease.record.lease_expiry,
        Some(start + chrono::Duration::seconds(6) + lease_duration)
    );
}

#[tokio::test]
async fn test_submit_rejects_out_of_range_delay() {
    let (queue, _clock) = manual_queue();
    let err = assert_err!(
        queue
            .submit(NewJob::new("scenario", Vec::new()).delay(Duration::MAX))
            .await
    );
    assert!(matches!(err, JobError::Validation(_)));
    assert_eq!(assert_ok!(queue.counts().await).pending, 0);
}

#[tokio::test]
async fn test_huge_backoff_requeues_at_latest_time() {
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let queue = Arc::new(
        JobQueue::builder(test_config(1))
            .clock(clock.clone())
            .backoff_policy(Arc::new(RetryPolicy::linear(Duration::from_secs(u64::MAX / 1000))))
            .build()
            .expect("valid config"),
    );
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());
    let id = submit(&queue, "slow", Priority::High, 3).await;

    let (_, lease) = lease_label(&queue).await.unwrap();
    let outcome = assert_ok!(
        queue
            .fail(&lease.record, "w1", &JobError::Handler("transient".into()))
            .await
    );
    assert!(matches!(outcome, FailOutcome::Requeued { retry_count: 1, .. }));
    drop(lease);

    let record = assert_ok!(queue.get_job(&id).await).unwrap();
    assert_eq!(record.state, JobState::Pending);
    assert_eq!(record.not_before, DateTime::<Utc>::MAX_UTC);
    assert!(record.lease_owner.is_none());
    assert!(assert_ok!(queue.lease_next("w1").await).is_none());
}

#[tokio::test]
async fn test_store_rejection_is_not_retried() {
    let store = Arc::new(FlakyStore::new(2, || JobError::Store("corrupt record".into())));
    let queue = JobQueue::builder(test_config(1))
        .store(store.clone())
        .build()
        .expect("valid config");

    let err = assert_err!(queue.lease_next("w1").await);
    assert!(matches!(err, JobError::Store(_)));
    assert_eq!(store.remaining_failures(), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_leases_are_exclusive() {
    let queue = queue_with(test_config(16), Arc::new(SystemClock));
    queue.register_fn("scenario", |_, _| async { Ok(()) }.boxed());

    let mut submitted = HashSet::new();
    for n in 0..200 {
        let priority = Priority::ALL[n % Priority::ALL.len()];
        submitted.insert(assert_ok!(
            queue.submit(NewJob::new("scenario", Vec::new()).priority(priority)).await
        ));
    }

    let mut tasks = Vec::new();
    for n in 0..16 {
        let queue = queue.clone();
        tasks.push(tokio::spawn(async move {
            let owner = format!("w{n}");
            let mut leased = Vec::new();
            while let Some(lease) = queue.lease_next(&owner).await.expect("lease") {
                leased.push(lease.record.id.clone());
                queue.complete(&lease.record, &owner).await.expect("complete");
            }
            leased
        }));
    }

    let mut seen = HashSet::new();
    for task in tasks {
        for id in task.await.expect("task panicked") {
            assert!(seen.insert(id), "job leased twice");
        }
    }

    assert_eq!(seen, submitted);
    let counts = assert_ok!(queue.counts().await);
    assert_eq!(counts.done, 200);
}
