//! Retry policies for failed jobs.

use crate::error::JobError;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// What happens to a job after a failed attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Return the job to `Pending` after this delay.
    Retry(Duration),
    /// Move the job to the dead-letter store now.
    DeadLetter,
}

/// Pluggable backoff policy.
///
/// Implementations must be total and deterministic in `retry_count` and the
/// error, and non-decreasing in `retry_count` for a given error kind.
pub trait BackoffPolicy: Send + Sync {
    /// Delay before the retry numbered `retry_count` (1-based).
    fn delay(&self, retry_count: u32, error: &JobError) -> Duration;

    /// Returns true if the error should dead-letter the job without retrying.
    fn is_permanent(&self, error: &JobError) -> bool {
        !error.is_retryable()
    }

    /// Decide the outcome of a failed attempt.
    ///
    /// `retry_count` is the count after incrementing for this failure.
    fn decide(&self, retry_count: u32, max_retries: u32, error: &JobError) -> RetryDecision {
        if retry_count > max_retries || self.is_permanent(error) {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry(self.delay(retry_count, error))
        }
    }
}

/// Retry strategy enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Same delay before every retry.
    Constant,
    /// `retry_count * base_delay`.
    Linear,
    /// `base_delay * multiplier^(retry_count - 1)` with deterministic jitter.
    Exponential,
}

/// Retry policy configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Retry strategy.
    pub strategy: RetryStrategy,

    /// Base delay in milliseconds.
    pub base_delay_ms: u64,

    /// Maximum delay in milliseconds.
    pub max_delay_ms: u64,

    /// Backoff multiplier (exponential only).
    pub multiplier: f64,

    /// Jitter factor (0.0 to 1.0, exponential only).
    pub jitter_factor: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::linear(Duration::from_secs(1))
    }
}

impl RetryPolicy {
    /// Creates a fixed delay retry policy.
    pub fn constant(delay: Duration) -> Self {
        let ms = duration_ms(delay);
        Self {
            strategy: RetryStrategy::Constant,
            base_delay_ms: ms,
            max_delay_ms: ms,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates a linear backoff retry policy.
    pub fn linear(base: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Linear,
            base_delay_ms: duration_ms(base),
            max_delay_ms: u64::MAX,
            multiplier: 1.0,
            jitter_factor: 0.0,
        }
    }

    /// Creates an exponential backoff retry policy.
    pub fn exponential(base: Duration) -> Self {
        Self {
            strategy: RetryStrategy::Exponential,
            base_delay_ms: duration_ms(base),
            max_delay_ms: 3_600_000, // 1 hour
            multiplier: 2.0,
            jitter_factor: 0.1,
        }
    }

    /// Sets the maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay_ms = duration_ms(delay);
        self
    }

    /// Sets the backoff multiplier.
    pub fn with_multiplier(mut self, multiplier: f64) -> Self {
        self.multiplier = multiplier;
        self
    }

    /// Enables jitter.
    pub fn with_jitter(mut self, factor: f64) -> Self {
        self.jitter_factor = factor.clamp(0.0, 1.0);
        self
    }

    /// Disables jitter.
    pub fn without_jitter(mut self) -> Self {
        self.jitter_factor = 0.0;
        self
    }

    /// Calculate the delay before retry number `retry_count`.
    pub fn delay_for_retry(&self, retry_count: u32) -> Duration {
        if retry_count == 0 {
            return Duration::ZERO;
        }

        let base_delay = match self.strategy {
            RetryStrategy::Constant => self.base_delay_ms,
            RetryStrategy::Linear => self.base_delay_ms.saturating_mul(u64::from(retry_count)),
            RetryStrategy::Exponential => {
                let exp = i32::try_from(retry_count - 1).unwrap_or(i32::MAX);
                let delay = self.base_delay_ms as f64 * self.multiplier.max(1.0).powi(exp);
                if delay >= u64::MAX as f64 {
                    u64::MAX
                } else {
                    delay as u64
                }
            }
        };

        let capped_delay = base_delay.min(self.max_delay_ms);

        // Jitter stays below the gap to the next uncapped delay, so the
        // sequence is non-decreasing.
        let final_delay = if self.strategy == RetryStrategy::Exponential && self.jitter_factor > 0.0 {
            let gap = (self.multiplier - 1.0).clamp(0.0, 1.0);
            let jitter_range = (capped_delay as f64 * self.jitter_factor * gap) as u64;
            let jittered = capped_delay.saturating_add(deterministic_jitter(retry_count, jitter_range));
            jittered.min(self.max_delay_ms)
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay)
    }
}

impl BackoffPolicy for RetryPolicy {
    fn delay(&self, retry_count: u32, _error: &JobError) -> Duration {
        self.delay_for_retry(retry_count)
    }
}

/// Jitter in `[0, range)` derived from the retry number alone.
fn deterministic_jitter(retry_count: u32, range: u64) -> u64 {
    if range == 0 {
        return 0;
    }

    // splitmix64
    let mut z = u64::from(retry_count).wrapping_add(0x9E37_79B9_7F4A_7C15);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^= z >> 31;
    z % range
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}
