//! Retry policy for provider requests
//!
//! Delay for attempt `k` (0-indexed) is `min(cap, base * 2^k)` plus a jitter
//! drawn uniformly from `[0, jitter)`.

use rand::Rng;
use std::time::Duration;

/// HTTP statuses treated as transient: rate limiting and upstream failures.
///
/// 403 is included because Gmail reports per-user rate limits with it.
pub const RETRYABLE_STATUS: [u16; 6] = [403, 429, 500, 502, 503, 504];

pub fn is_retryable_status(status: u16) -> bool {
    RETRYABLE_STATUS.contains(&status)
}

#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_jitter: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 8,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(60),
            max_jitter: Duration::from_millis(250),
        }
    }
}

impl RetryPolicy {
    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Exponential part of the delay for `attempt`, capped
    pub fn base_backoff(&self, attempt: u32) -> Duration {
        // 2^31 * base already exceeds any sane cap
        let factor = 2u32.saturating_pow(attempt.min(31));
        self.base_delay
            .checked_mul(factor)
            .unwrap_or(self.max_delay)
            .min(self.max_delay)
    }

    /// Delay for `attempt` with a given jitter fraction in `[0, 1)`
    pub fn delay_with_jitter(&self, attempt: u32, jitter_fraction: f64) -> Duration {
        let fraction = jitter_fraction.clamp(0.0, 1.0);
        let jitter = self.max_jitter.mul_f64(fraction);
        // mul_f64 can round up to the bound; keep the interval half-open
        let jitter = if jitter >= self.max_jitter && !self.max_jitter.is_zero() {
            self.max_jitter - Duration::from_nanos(1)
        } else {
            jitter
        };
        self.base_backoff(attempt) + jitter
    }

    /// Delay for `attempt` with random jitter
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let fraction: f64 = rand::thread_rng().gen_range(0.0..1.0);
        self.delay_with_jitter(attempt, fraction)
    }
}
