//! Token bucket limiting dispatched steps per minute.
//!
//! Tokens refill continuously based on elapsed time. The executor polls
//! with `try_acquire`: when the bucket is empty the cycle simply returns
//! instead of waiting. Only live-mode dispatches consume tokens; shadow
//! mode always observes.

use std::time::Instant;

use tokio::sync::Mutex;

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// Steps-per-minute token bucket.
pub struct StepRateLimiter {
    state: Mutex<BucketState>,
    capacity: f64,
    /// Tokens added per second
    refill_rate: f64,
}

impl StepRateLimiter {
    pub fn new(max_steps_per_minute: u32) -> Self {
        let capacity = f64::from(max_steps_per_minute.max(1));
        Self {
            state: Mutex::new(BucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
            capacity,
            refill_rate: capacity / 60.0,
        }
    }

    /// Consume one token if available. Never waits.
    pub async fn try_acquire(&self) -> bool {
        let mut state = self.state.lock().await;
        let now = Instant::now();
        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * self.refill_rate).min(self.capacity);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Current token count, for monitoring.
    pub async fn available_tokens(&self) -> f64 {
        let state = self.state.lock().await;
        let elapsed = state.last_refill.elapsed().as_secs_f64();
        (state.tokens + elapsed * self.refill_rate).min(self.capacity)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn test_burst_up_to_capacity() {
        let limiter = StepRateLimiter::new(5);
        for _ in 0..5 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_refill_over_time() {
        let limiter = StepRateLimiter::new(60); // one token per second
        for _ in 0..60 {
            assert!(limiter.try_acquire().await);
        }
        assert!(!limiter.try_acquire().await);

        tokio::time::sleep(Duration::from_millis(1_100)).await;
        assert!(limiter.try_acquire().await);
    }

    #[tokio::test]
    async fn test_empty_bucket_does_not_block() {
        let limiter = StepRateLimiter::new(1);
        assert!(limiter.try_acquire().await);

        let start = Instant::now();
        assert!(!limiter.try_acquire().await);
        assert!(start.elapsed() < Duration::from_millis(50));
    }
}
