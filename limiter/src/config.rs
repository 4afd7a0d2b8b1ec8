//! Rate limiter configuration.

use std::time::Duration;

/// Longest single sleep of a waiting caller before it asks the store again.
pub const DEFAULT_MAX_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Parameters of one named token bucket.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimiterConfig {
    /// Burst size and upper bound on stored tokens.
    pub capacity: u64,
    /// Tokens added per second.
    pub refill_rate_per_second: f64,
    /// Upper bound on one sleep while waiting for permits.
    pub max_poll_interval: Duration,
}

impl RateLimiterConfig {
    pub fn new(capacity: u64, refill_rate_per_second: f64) -> Self {
        Self {
            capacity,
            refill_rate_per_second,
            max_poll_interval: DEFAULT_MAX_POLL_INTERVAL,
        }
    }

    /// `permits` per minute, all of them available as a burst.
    pub fn per_minute(permits: u64) -> Self {
        Self::new(permits, permits as f64 / 60.0)
    }

    pub fn with_max_poll_interval(mut self, interval: Duration) -> Self {
        self.max_poll_interval = interval;
        self
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.capacity == 0 {
            return Err("Capacity must be at least 1".to_string());
        }

        if !self.refill_rate_per_second.is_finite() || self.refill_rate_per_second <= 0.0 {
            return Err("Refill rate must be a positive number".to_string());
        }

        if self.max_poll_interval < Duration::from_millis(1) {
            return Err("Max poll interval must be at least 1ms".to_string());
        }

        Ok(())
    }
}
