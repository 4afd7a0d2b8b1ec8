//! Token bucket arithmetic.
//!
//! Pure functions over [`RateLimiterState`]; time is always passed in as
//! store-clock milliseconds so the same code runs inside store scripts and
//! in tests.

use serde::{Deserialize, Serialize};

/// Tolerance for float rounding when comparing token counts.
const EPSILON: f64 = 1e-9;

/// Stored state of one rate limiter.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterState {
    pub key: String,
    pub capacity: u64,
    pub refill_rate_per_second: f64,
    /// Always within `0..=capacity`.
    pub available_tokens: f64,
    /// Store-clock time of the last refill, Unix milliseconds.
    pub last_refill_at_ms: u64,
}

/// Outcome of asking the bucket for permits.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Take {
    /// Permits were debited.
    Granted { remaining: f64 },
    /// Not enough tokens; enough will have refilled after `retry_after_ms`.
    Denied { retry_after_ms: u64 },
}

impl RateLimiterState {
    /// A full bucket.
    pub fn new(key: &str, capacity: u64, refill_rate_per_second: f64, now_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            capacity,
            refill_rate_per_second,
            available_tokens: capacity as f64,
            last_refill_at_ms: now_ms,
        }
    }

    /// Add the tokens accrued since the last refill.
    pub fn refill(&mut self, now_ms: u64) {
        let elapsed_ms = now_ms.saturating_sub(self.last_refill_at_ms);
        let accrued = elapsed_ms as f64 * self.refill_rate_per_second / 1000.0;
        self.available_tokens = (self.available_tokens + accrued).clamp(0.0, self.capacity as f64);
        self.last_refill_at_ms = self.last_refill_at_ms.max(now_ms);
    }

    /// Refill, then debit `permits` if the bucket holds enough.
    pub fn take(&mut self, permits: u64, now_ms: u64) -> Take {
        self.refill(now_ms);

        let wanted = permits as f64;
        if self.available_tokens + EPSILON >= wanted {
            self.available_tokens = (self.available_tokens - wanted).max(0.0);
            Take::Granted {
                remaining: self.available_tokens,
            }
        } else {
            Take::Denied {
                retry_after_ms: self.wait_for(permits),
            }
        }
    }

    /// Milliseconds until `permits` tokens will be available.
    pub fn wait_for(&self, permits: u64) -> u64 {
        let missing = permits as f64 - self.available_tokens;
        if missing <= EPSILON {
            return 0;
        }
        if self.refill_rate_per_second <= 0.0 {
            return u64::MAX;
        }
        (missing * 1000.0 / self.refill_rate_per_second).ceil() as u64
    }

    /// Whole permits available right now.
    pub fn whole_tokens(&self) -> u64 {
        (self.available_tokens + EPSILON).floor() as u64
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_burst_then_refill() {
        let mut bucket = RateLimiterState::new("k", 5, 10.0, 0);

        for _ in 0..5 {
            assert!(matches!(bucket.take(1, 0), Take::Granted { .. }));
        }
        assert_eq!(bucket.take(1, 0), Take::Denied { retry_after_ms: 100 });
        assert!(matches!(bucket.take(1, 100), Take::Granted { .. }));
    }

    #[test]
    fn test_refill_caps_at_capacity() {
        let mut bucket = RateLimiterState::new("k", 3, 100.0, 0);
        bucket.take(3, 0);

        bucket.refill(60_000);
        assert_eq!(bucket.available_tokens, 3.0);
        assert_eq!(bucket.whole_tokens(), 3);
    }

    #[test]
    fn test_clock_going_backwards_adds_nothing() {
        let mut bucket = RateLimiterState::new("k", 10, 1.0, 5_000);
        bucket.take(10, 5_000);

        bucket.refill(1_000);
        assert_eq!(bucket.available_tokens, 0.0);
        assert_eq!(bucket.last_refill_at_ms, 5_000);
    }

    #[test]
    fn test_wait_for_fractional_tokens() {
        let mut bucket = RateLimiterState::new("k", 2, 4.0, 0);
        bucket.take(2, 0);
        bucket.refill(125);

        // Half a token accrued; the other half needs 125ms more.
        assert_eq!(bucket.wait_for(1), 125);
    }

    proptest! {
        #[test]
        fn never_grants_more_than_capacity_plus_refill(
            capacity in 1u64..50,
            rate in 0.5f64..200.0,
            requests in proptest::collection::vec((0u64..500, 1u64..5), 1..200),
        ) {
            let mut bucket = RateLimiterState::new("k", capacity, rate, 0);
            let mut now_ms = 0u64;
            let mut granted = 0u64;

            for (step_ms, permits) in requests {
                now_ms += step_ms;
                if let Take::Granted { .. } = bucket.take(permits, now_ms) {
                    granted += permits;
                }
                prop_assert!(bucket.available_tokens >= 0.0);
                prop_assert!(bucket.available_tokens <= capacity as f64);
            }

            let bound = capacity as f64 + rate * now_ms as f64 / 1000.0;
            prop_assert!(granted as f64 <= bound + 1e-6);
        }
    }
}
