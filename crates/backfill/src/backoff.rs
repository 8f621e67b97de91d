//! Retry schedule for failed jobs.
//!
//! The engine only exposes the schedule; an external scheduler reads job
//! state, filters for failed jobs below the retry cap, waits out the delay,
//! increments the counter, and re-enqueues.

use std::time::Duration;

/// Maximum retry attempts before a failed job is abandoned.
pub const MAX_RETRIES: u32 = 10;

/// Exponential backoff schedule: `base_delay * 2^attempt`.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base_delay: Duration,
    pub max_retries: u32,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_secs(10),
            max_retries: MAX_RETRIES,
        }
    }
}

impl BackoffPolicy {
    /// Delay before the given attempt (0-indexed). 2^attempt is computed
    /// with a checked shift so large attempts saturate instead of wrapping.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let multiplier = 1u32.checked_shl(attempt).unwrap_or(u32::MAX);
        self.base_delay
            .checked_mul(multiplier)
            .unwrap_or(Duration::MAX)
    }

    /// Whether a job with the given retry count is still eligible.
    pub fn should_retry(&self, retry_count: u32) -> bool {
        retry_count < self.max_retries
    }
}
