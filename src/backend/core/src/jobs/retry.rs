//! Retry decisions for failed attempts.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::time::Duration;

use super::job::FailureKind;

/// What to do with a job whose attempt just failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Put the job back to pending, not runnable before `scheduled_at`
    Retry {
        delay: Duration,
        scheduled_at: DateTime<Utc>,
    },
    /// Give up; the job becomes dead
    Dead,
}

/// Exponential backoff retry policy.
///
/// The per-job retry budget lives on the job itself (`max_retries`); the policy only
/// owns the backoff curve.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay before the first retry is `base_delay * 2^attempt`
    pub base_delay_secs: u64,
    /// Upper bound on any single delay
    pub max_delay_secs: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_delay_secs: 5,
            max_delay_secs: 3600, // 1 hour max
        }
    }
}

impl RetryPolicy {
    pub fn new(base_delay_secs: u64, max_delay_secs: u64) -> Self {
        Self {
            base_delay_secs,
            max_delay_secs,
        }
    }

    /// Delay before the retry that follows execution number `attempt`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let factor = 2u64.checked_pow(attempt).unwrap_or(u64::MAX);
        let secs = self
            .base_delay_secs
            .saturating_mul(factor)
            .min(self.max_delay_secs);
        Duration::from_secs(secs)
    }

    /// Decide the fate of a job after its `attempt`-th execution failed.
    pub fn decide(
        &self,
        attempt: u32,
        max_retries: u32,
        kind: FailureKind,
        now: DateTime<Utc>,
    ) -> RetryDecision {
        if !kind.is_retryable() || attempt > max_retries {
            return RetryDecision::Dead;
        }

        let delay = self.delay_for_attempt(attempt);
        let scheduled_at = now
            + chrono::Duration::from_std(delay).unwrap_or_else(|_| chrono::Duration::seconds(0));
        RetryDecision::Retry {
            delay,
            scheduled_at,
        }
    }
}
