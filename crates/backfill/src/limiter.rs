//! Process-wide token bucket throttling snapshot fetches.

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;
use tracing::trace;

use crate::error::BackfillError;

#[derive(Debug)]
struct Bucket {
    tokens: f64,
    last_refill: Instant,
}

/// Token bucket shared by every snapshot fetch in the process.
///
/// Live event processing and user callbacks are not throttled here.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<Bucket>,
    max_tokens: u32,
    refill_rate: f64,
}

impl RateLimiter {
    /// Create a limiter refilling at `rate_per_second` with the given burst
    /// capacity.
    pub fn new(rate_per_second: f64, burst: u32) -> Result<Self, BackfillError> {
        if !rate_per_second.is_finite() || rate_per_second <= 0.0 {
            return Err(BackfillError::configuration(format!(
                "rate limit must be a positive finite number, got {rate_per_second}"
            )));
        }
        if burst == 0 {
            return Err(BackfillError::configuration(
                "burst capacity must be at least 1",
            ));
        }

        Ok(Self {
            bucket: Mutex::new(Bucket {
                tokens: burst as f64,
                last_refill: Instant::now(),
            }),
            max_tokens: burst,
            refill_rate: rate_per_second,
        })
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        let mut bucket = self.bucket.lock();
        self.refill(&mut bucket);
        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Take a token, sleeping until one is available or the token is
    /// cancelled.
    ///
    /// # Cancel Safety
    ///
    /// The bucket lock is never held across an await: availability is
    /// checked under the lock, the sleep happens without it, and the loop
    /// retries to handle races with other acquirers.
    pub async fn acquire(&self, token: &CancellationToken) -> Result<Duration, BackfillError> {
        let mut total_wait = Duration::ZERO;

        loop {
            let wait = {
                let mut bucket = self.bucket.lock();
                self.refill(&mut bucket);
                if bucket.tokens >= 1.0 {
                    bucket.tokens -= 1.0;
                    return Ok(total_wait);
                }
                let needed = 1.0 - bucket.tokens;
                Duration::from_secs_f64(needed / self.refill_rate)
            };

            trace!(wait = ?wait, "sync rate limited");
            tokio::select! {
                _ = token.cancelled() => return Err(BackfillError::Cancelled),
                _ = tokio::time::sleep(wait) => {}
            }
            total_wait += wait;
        }
    }

    fn refill(&self, bucket: &mut Bucket) {
        let now = Instant::now();
        let elapsed = now.duration_since(bucket.last_refill);
        let new_tokens = elapsed.as_secs_f64() * self.refill_rate;
        bucket.tokens = (bucket.tokens + new_tokens).min(self.max_tokens as f64);
        bucket.last_refill = now;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn burst_bounds_immediate_acquires() {
        let limiter = RateLimiter::new(1.0, 1).unwrap();
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn refill_restores_tokens() {
        let limiter = RateLimiter::new(100.0, 1).unwrap();
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
        std::thread::sleep(Duration::from_millis(20));
        assert!(limiter.try_acquire());
    }

    #[test]
    fn invalid_rates_are_rejected() {
        assert!(RateLimiter::new(0.0, 1).is_err());
        assert!(RateLimiter::new(-1.0, 1).is_err());
        assert!(RateLimiter::new(f64::NAN, 1).is_err());
        assert!(RateLimiter::new(2.0, 0).is_err());
    }

    #[tokio::test]
    async fn acquire_waits_for_refill() {
        let limiter = RateLimiter::new(50.0, 1).unwrap();
        let token = CancellationToken::new();

        let first = limiter.acquire(&token).await.unwrap();
        assert_eq!(first, Duration::ZERO);

        let second = limiter.acquire(&token).await.unwrap();
        assert!(second > Duration::ZERO);
    }

    #[tokio::test]
    async fn acquire_observes_cancellation() {
        let limiter = RateLimiter::new(0.001, 1).unwrap();
        let token = CancellationToken::new();
        assert!(limiter.try_acquire());

        token.cancel();
        let result = limiter.acquire(&token).await;
        assert!(matches!(result, Err(BackfillError::Cancelled)));
    }
}
