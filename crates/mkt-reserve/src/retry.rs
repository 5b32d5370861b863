//! Bounded retry with jittered exponential backoff.
//!
//! Used only for retryable store failures (version conflicts and transient
//! backend faults). Policy and precondition failures never retry. The
//! jitter spreads racing losers apart so they do not re-collide on the same
//! listing in lockstep.

use std::time::Duration;

use rand::Rng;

/// Retry bounds for the coordinator's read-verify-write cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first (minimum 1).
    pub max_attempts: u32,
    /// Backoff before the second attempt; doubles per attempt after that.
    pub base_backoff: Duration,
    /// Upper bound on any single backoff, jitter included.
    pub max_backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_backoff: Duration::from_millis(25),
            max_backoff: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    /// Backoff before retry number `attempt` (1-based: the delay preceding
    /// the second attempt is `attempt == 1`).
    ///
    /// Half the exponential step is deterministic, half uniformly random,
    /// capped at `max_backoff`.
    pub fn backoff_with_jitter(&self, attempt: u32) -> Duration {
        let exp = self
            .base_backoff
            .saturating_mul(1u32 << attempt.saturating_sub(1).min(16));
        let exp = exp.min(self.max_backoff);
        let half = exp / 2;
        let jitter_micros = if half.is_zero() {
            0
        } else {
            rand::thread_rng().gen_range(0..=half.as_micros() as u64)
        };
        (half + Duration::from_micros(jitter_micros)).min(self.max_backoff)
    }
}
