//! Metrics for job queue monitoring.
//!
//! Recorded through the `metrics` facade. Without an installed recorder every
//! call is a no-op.

use crate::job::Priority;
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram};
use std::time::Duration;

/// Metric names for the job queue system.
pub mod names {
    /// Total jobs submitted.
    pub const JOBS_SUBMITTED_TOTAL: &str = "kestrel_jobs_submitted_total";
    /// Total jobs leased by workers.
    pub const JOBS_LEASED_TOTAL: &str = "kestrel_jobs_leased_total";
    /// Total jobs completed successfully.
    pub const JOBS_COMPLETED_TOTAL: &str = "kestrel_jobs_completed_total";
    /// Total failed attempts.
    pub const JOBS_FAILED_TOTAL: &str = "kestrel_jobs_failed_total";
    /// Total jobs requeued with backoff.
    pub const JOBS_RETRIED_TOTAL: &str = "kestrel_jobs_retried_total";
    /// Total jobs dead-lettered.
    pub const JOBS_DEAD_LETTERED_TOTAL: &str = "kestrel_jobs_dead_lettered_total";
    /// Dead-letter entries lost to append failures.
    pub const DEAD_LETTER_APPEND_FAILURES_TOTAL: &str =
        "kestrel_jobs_dead_letter_append_failures_total";
    /// Total expired leases returned to pending.
    pub const JOBS_RECLAIMED_TOTAL: &str = "kestrel_jobs_reclaimed_total";
    /// Total attempts that exceeded the execution timeout.
    pub const JOBS_TIMED_OUT_TOTAL: &str = "kestrel_jobs_timed_out_total";
    /// Total attempts cancelled by shutdown.
    pub const JOBS_CANCELLED_TOTAL: &str = "kestrel_jobs_cancelled_total";
    /// Total terminal records purged.
    pub const JOBS_PURGED_TOTAL: &str = "kestrel_jobs_purged_total";

    /// Jobs currently executing, per priority class.
    pub const JOBS_ACTIVE: &str = "kestrel_jobs_active";

    /// Job execution duration in seconds.
    pub const JOB_DURATION_SECONDS: &str = "kestrel_job_duration_seconds";
}

/// Register all metric descriptions.
pub fn register_metrics() {
    describe_counter!(names::JOBS_SUBMITTED_TOTAL, "Total number of jobs submitted");
    describe_counter!(names::JOBS_LEASED_TOTAL, "Total number of jobs leased by workers");
    describe_counter!(
        names::JOBS_COMPLETED_TOTAL,
        "Total number of jobs completed successfully"
    );
    describe_counter!(names::JOBS_FAILED_TOTAL, "Total number of failed job attempts");
    describe_counter!(names::JOBS_RETRIED_TOTAL, "Total number of jobs requeued with backoff");
    describe_counter!(
        names::JOBS_DEAD_LETTERED_TOTAL,
        "Total number of jobs moved to the dead letter store"
    );
    describe_counter!(
        names::DEAD_LETTER_APPEND_FAILURES_TOTAL,
        "Dead letter entries lost because the append failed"
    );
    describe_counter!(
        names::JOBS_RECLAIMED_TOTAL,
        "Total number of expired leases returned to pending"
    );
    describe_counter!(names::JOBS_TIMED_OUT_TOTAL, "Total number of jobs that timed out");
    describe_counter!(
        names::JOBS_CANCELLED_TOTAL,
        "Total number of job attempts cancelled by shutdown"
    );
    describe_counter!(names::JOBS_PURGED_TOTAL, "Total number of terminal jobs purged");

    describe_gauge!(names::JOBS_ACTIVE, "Current number of executing jobs");

    describe_histogram!(names::JOB_DURATION_SECONDS, "Job execution duration in seconds");
}

/// Job metrics recorder.
#[derive(Clone)]
pub struct JobMetrics;

impl JobMetrics {
    /// Record a job submitted.
    pub fn job_submitted(job_type: &str, priority: Priority) {
        counter!(
            names::JOBS_SUBMITTED_TOTAL,
            "job_type" => job_type.to_string(),
            "priority" => priority.as_str()
        )
        .increment(1);
    }

    /// Record a job leased.
    pub fn job_leased(job_type: &str, priority: Priority) {
        counter!(
            names::JOBS_LEASED_TOTAL,
            "job_type" => job_type.to_string(),
            "priority" => priority.as_str()
        )
        .increment(1);
    }

    /// Record a job completed.
    pub fn job_completed(job_type: &str, duration: Duration) {
        counter!(
            names::JOBS_COMPLETED_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "completed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a failed attempt.
    pub fn job_failed(job_type: &str, error_kind: &'static str, duration: Duration) {
        counter!(
            names::JOBS_FAILED_TOTAL,
            "job_type" => job_type.to_string(),
            "error_type" => error_kind
        )
        .increment(1);

        histogram!(
            names::JOB_DURATION_SECONDS,
            "job_type" => job_type.to_string(),
            "status" => "failed"
        )
        .record(duration.as_secs_f64());
    }

    /// Record a job requeued with backoff.
    pub fn job_retried(job_type: &str, retry_count: u32) {
        counter!(
            names::JOBS_RETRIED_TOTAL,
            "job_type" => job_type.to_string(),
            "retry" => retry_count.to_string()
        )
        .increment(1);
    }

    /// Record a job dead-lettered.
    pub fn job_dead_lettered(job_type: &str, error_kind: &'static str) {
        counter!(
            names::JOBS_DEAD_LETTERED_TOTAL,
            "job_type" => job_type.to_string(),
            "reason" => error_kind
        )
        .increment(1);
    }

    /// Record a lost dead-letter entry.
    pub fn dead_letter_append_failed(job_type: &str) {
        counter!(
            names::DEAD_LETTER_APPEND_FAILURES_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Record reclaimed leases.
    pub fn jobs_reclaimed(count: u64) {
        counter!(names::JOBS_RECLAIMED_TOTAL).increment(count);
    }

    /// Record a job timeout.
    pub fn job_timed_out(job_type: &str) {
        counter!(
            names::JOBS_TIMED_OUT_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Record a job cancelled.
    pub fn job_cancelled(job_type: &str) {
        counter!(
            names::JOBS_CANCELLED_TOTAL,
            "job_type" => job_type.to_string()
        )
        .increment(1);
    }

    /// Record purged records.
    pub fn jobs_purged(count: u64) {
        counter!(names::JOBS_PURGED_TOTAL).increment(count);
    }

    /// Update the executing-jobs gauge for a class.
    pub fn active_changed(priority: Priority, active: u32) {
        gauge!(
            names::JOBS_ACTIVE,
            "priority" => priority.as_str()
        )
        .set(f64::from(active));
    }
}
