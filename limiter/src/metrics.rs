//! Rate limiter metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use latchkey_common::{CoordinationError, Result};

/// Counters shared by the limiters of one manager.
#[derive(Default)]
pub struct LimiterMetrics {
    /// Requests that got their permits.
    pub granted_requests: AtomicU64,
    /// Permits handed out.
    pub granted_permits: AtomicU64,
    /// Store round trips that found the bucket short.
    pub denials: AtomicU64,
    /// Requests that gave up at their deadline.
    pub timeouts: AtomicU64,
    /// Requests cancelled by the caller.
    pub cancellations: AtomicU64,
}

impl LimiterMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the outcome of one permit request.
    pub fn record_request(&self, permits: u64, result: &Result<()>) {
        match result {
            Ok(()) => {
                self.granted_requests.fetch_add(1, Ordering::Relaxed);
                self.granted_permits.fetch_add(permits, Ordering::Relaxed);
            }
            Err(CoordinationError::AcquisitionTimeout { .. }) => {
                self.timeouts.fetch_add(1, Ordering::Relaxed);
            }
            Err(CoordinationError::Cancelled { .. }) => {
                self.cancellations.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }

    pub fn denied(&self) {
        self.denials.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> LimiterMetricsSnapshot {
        LimiterMetricsSnapshot {
            granted_requests: self.granted_requests.load(Ordering::Relaxed),
            granted_permits: self.granted_permits.load(Ordering::Relaxed),
            denials: self.denials.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP latchkey_limiter_granted_requests_total Permit requests granted
# TYPE latchkey_limiter_granted_requests_total counter
latchkey_limiter_granted_requests_total {}

# HELP latchkey_limiter_granted_permits_total Permits handed out
# TYPE latchkey_limiter_granted_permits_total counter
latchkey_limiter_granted_permits_total {}

# HELP latchkey_limiter_denials_total Attempts that found too few tokens
# TYPE latchkey_limiter_denials_total counter
latchkey_limiter_denials_total {}

# HELP latchkey_limiter_timeouts_total Requests that timed out
# TYPE latchkey_limiter_timeouts_total counter
latchkey_limiter_timeouts_total {}

# HELP latchkey_limiter_cancellations_total Requests cancelled by the caller
# TYPE latchkey_limiter_cancellations_total counter
latchkey_limiter_cancellations_total {}
"#,
            snapshot.granted_requests,
            snapshot.granted_permits,
            snapshot.denials,
            snapshot.timeouts,
            snapshot.cancellations,
        )
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LimiterMetricsSnapshot {
    pub granted_requests: u64,
    pub granted_permits: u64,
    pub denials: u64,
    pub timeouts: u64,
    pub cancellations: u64,
}

/// Shared metrics instance.
pub type SharedLimiterMetrics = Arc<LimiterMetrics>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_request() {
        let metrics = LimiterMetrics::new();
        metrics.record_request(3, &Ok(()));
        metrics.record_request(
            1,
            &Err(CoordinationError::Cancelled {
                key: "k".to_string(),
            }),
        );

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.granted_requests, 1);
        assert_eq!(snapshot.granted_permits, 3);
        assert_eq!(snapshot.cancellations, 1);
        assert!(metrics
            .to_prometheus()
            .contains("latchkey_limiter_granted_permits_total 3"));
    }
}
