//! Lock metrics.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use latchkey_common::{CoordinationError, Result};

/// Counters shared by every lock of one client.
pub struct LockMetrics {
    /// Successful acquisitions, reentrant ones included.
    pub acquisitions: AtomicU64,
    /// Releases that dropped a hold.
    pub releases: AtomicU64,
    /// Acquisitions that gave up at their deadline.
    pub timeouts: AtomicU64,
    /// Acquisitions cancelled by the caller.
    pub cancellations: AtomicU64,
    /// Successful watchdog renewals.
    pub renewals: AtomicU64,
    /// Watchdogs that found their lease gone.
    pub leases_lost: AtomicU64,
    /// Releases attempted by a non-holder.
    pub not_owner: AtomicU64,
}

impl LockMetrics {
    /// Create new metrics instance.
    pub fn new() -> Self {
        Self {
            acquisitions: AtomicU64::new(0),
            releases: AtomicU64::new(0),
            timeouts: AtomicU64::new(0),
            cancellations: AtomicU64::new(0),
            renewals: AtomicU64::new(0),
            leases_lost: AtomicU64::new(0),
            not_owner: AtomicU64::new(0),
        }
    }

    /// Record the outcome of an acquisition.
    pub fn record_acquire<T>(&self, result: &Result<T>) {
        let counter = match result {
            Ok(_) => &self.acquisitions,
            Err(CoordinationError::AcquisitionTimeout { .. }) => &self.timeouts,
            Err(CoordinationError::Cancelled { .. }) => &self.cancellations,
            Err(_) => return,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Record the outcome of a release.
    pub fn record_release<T>(&self, result: &Result<T>) {
        match result {
            Ok(_) => {
                self.releases.fetch_add(1, Ordering::Relaxed);
            }
            Err(CoordinationError::NotOwner { .. }) => {
                self.not_owner.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {}
        }
    }

    /// Record a watchdog renewal.
    pub fn lease_renewed(&self) {
        self.renewals.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a watchdog that lost its lease.
    pub fn lease_lost(&self) {
        self.leases_lost.fetch_add(1, Ordering::Relaxed);
    }

    /// Get current metrics snapshot.
    pub fn snapshot(&self) -> LockMetricsSnapshot {
        LockMetricsSnapshot {
            acquisitions: self.acquisitions.load(Ordering::Relaxed),
            releases: self.releases.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
            cancellations: self.cancellations.load(Ordering::Relaxed),
            renewals: self.renewals.load(Ordering::Relaxed),
            leases_lost: self.leases_lost.load(Ordering::Relaxed),
            not_owner: self.not_owner.load(Ordering::Relaxed),
        }
    }

    /// Export metrics in Prometheus format.
    pub fn to_prometheus(&self) -> String {
        let snapshot = self.snapshot();
        format!(
            r#"# HELP latchkey_lock_acquisitions_total Total lock acquisitions
# TYPE latchkey_lock_acquisitions_total counter
latchkey_lock_acquisitions_total {}

# HELP latchkey_lock_releases_total Total lock releases
# TYPE latchkey_lock_releases_total counter
latchkey_lock_releases_total {}

# HELP latchkey_lock_timeouts_total Acquisitions that timed out
# TYPE latchkey_lock_timeouts_total counter
latchkey_lock_timeouts_total {}

# HELP latchkey_lock_cancellations_total Acquisitions cancelled by the caller
# TYPE latchkey_lock_cancellations_total counter
latchkey_lock_cancellations_total {}

# HELP latchkey_lock_renewals_total Watchdog lease renewals
# TYPE latchkey_lock_renewals_total counter
latchkey_lock_renewals_total {}

# HELP latchkey_lock_leases_lost_total Leases found expired or taken by the watchdog
# TYPE latchkey_lock_leases_lost_total counter
latchkey_lock_leases_lost_total {}

# HELP latchkey_lock_not_owner_total Releases attempted by a non-holder
# TYPE latchkey_lock_not_owner_total counter
latchkey_lock_not_owner_total {}
"#,
            snapshot.acquisitions,
            snapshot.releases,
            snapshot.timeouts,
            snapshot.cancellations,
            snapshot.renewals,
            snapshot.leases_lost,
            snapshot.not_owner,
        )
    }
}

impl Default for LockMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of metrics at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockMetricsSnapshot {
    pub acquisitions: u64,
    pub releases: u64,
    pub timeouts: u64,
    pub cancellations: u64,
    pub renewals: u64,
    pub leases_lost: u64,
    pub not_owner: u64,
}

/// Shared metrics instance.
pub type SharedLockMetrics = Arc<LockMetrics>;

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_record_outcomes() {
        let metrics = LockMetrics::new();

        metrics.record_acquire(&Ok(1u32));
        metrics.record_acquire::<u32>(&Err(CoordinationError::AcquisitionTimeout {
            key: "k".to_string(),
            waited: Duration::from_millis(5),
        }));
        metrics.record_acquire::<u32>(&Err(CoordinationError::StoreUnavailable("down".into())));

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.acquisitions, 1);
        assert_eq!(snapshot.timeouts, 1);
        assert_eq!(snapshot.cancellations, 0);
    }

    #[test]
    fn test_prometheus_export() {
        let metrics = LockMetrics::new();
        metrics.lease_renewed();

        let output = metrics.to_prometheus();
        assert!(output.contains("latchkey_lock_renewals_total 1"));
    }
}
