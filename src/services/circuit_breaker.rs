//! Circuit breaker for bot-interface infra failures.
//!
//! Transport errors and 5xx-class outcomes trip the breaker; the
//! executor skips whole cycles while it is open. Repeated trips back off
//! exponentially. Task state is never touched by a trip.

use chrono::{DateTime, Duration, Utc};

use crate::domain::models::config::BreakerConfig;

/// State of the breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
}

/// Infra-failure circuit breaker with windowed counting.
#[derive(Debug)]
pub struct CircuitBreaker {
    config: BreakerConfig,
    failures: Vec<DateTime<Utc>>,
    state: BreakerState,
    resume_at: Option<DateTime<Utc>>,
    /// Consecutive trips without an intervening success
    trip_count: u32,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Self {
        Self {
            config,
            failures: Vec::new(),
            state: BreakerState::Closed,
            resume_at: None,
            trip_count: 0,
        }
    }

    pub fn state(&self) -> BreakerState {
        self.state
    }

    pub fn resume_at(&self) -> Option<DateTime<Utc>> {
        self.resume_at
    }

    /// Whether execution may proceed right now. An expired cooldown
    /// closes the breaker (failure counting restarts from zero).
    pub fn allows(&mut self, now: DateTime<Utc>) -> bool {
        match self.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                if self.resume_at.is_some_and(|at| now >= at) {
                    self.state = BreakerState::Closed;
                    self.resume_at = None;
                    self.failures.clear();
                    true
                } else {
                    false
                }
            }
        }
    }

    /// Record an infra failure; trips the breaker at the threshold.
    pub fn record_failure(&mut self, now: DateTime<Utc>) {
        self.failures.push(now);
        let cutoff = now - Duration::milliseconds(self.config.window_ms);
        self.failures.retain(|ts| *ts > cutoff);

        if self.state == BreakerState::Closed
            && self.failures.len() as u32 >= self.config.failure_threshold
        {
            self.trip(now);
        }
    }

    /// A successful bot interaction resets the failure counter and the
    /// trip backoff.
    pub fn record_success(&mut self) {
        self.failures.clear();
        self.trip_count = 0;
        if self.state == BreakerState::Open {
            self.state = BreakerState::Closed;
            self.resume_at = None;
        }
    }

    fn trip(&mut self, now: DateTime<Utc>) {
        self.trip_count = self.trip_count.saturating_add(1);
        let backoff_factor = 2_i64.saturating_pow(self.trip_count.saturating_sub(1).min(6));
        let cooldown_ms = self.config.open_ms.saturating_mul(backoff_factor);
        self.state = BreakerState::Open;
        self.resume_at = Some(now + Duration::milliseconds(cooldown_ms));
        tracing::warn!(
            trip_count = self.trip_count,
            cooldown_ms,
            "Bot circuit breaker opened"
        );
    }
}
