//! Background lease renewal.
//!
//! A watchdog keeps one owner's lease on one key alive while the owner holds
//! it. It stops when the owner releases, when renewal reports the lease gone,
//! or when its handle is dropped. A paused or partitioned process simply
//! stops renewing and the lease runs out.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use latchkey_common::{OwnerId, Result};

use crate::metrics::LockMetrics;

/// Something that can extend an owner's lease on a key.
#[async_trait]
pub trait LeaseRenewer: Send + Sync {
    /// Extend the lease; `Ok(false)` means the owner no longer holds the key.
    async fn renew(&self, key: &str, owner: &OwnerId, lease: Duration) -> Result<bool>;
}

/// Handle to a running renewal task.
#[derive(Debug)]
pub struct Watchdog {
    cancel: CancellationToken,
}

impl Watchdog {
    /// Start renewing `owner`'s lease on `key` every `interval`.
    pub fn spawn(
        renewer: Arc<dyn LeaseRenewer>,
        key: String,
        owner: OwnerId,
        lease: Duration,
        interval: Duration,
        metrics: Arc<LockMetrics>,
    ) -> Self {
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }

                match renewer.renew(&key, &owner, lease).await {
                    Ok(true) => {
                        metrics.lease_renewed();
                        debug!(key = %key, owner = %owner, "Lease renewed");
                    }
                    Ok(false) => {
                        metrics.lease_lost();
                        debug!(key = %key, owner = %owner, "Lease no longer held, watchdog stopping");
                        break;
                    }
                    Err(e) => {
                        warn!(key = %key, owner = %owner, error = %e, "Lease renewal failed");
                    }
                }
            }
            token.cancel();
        });

        Self { cancel }
    }

    /// Stop renewing.
    pub fn stop(&self) {
        self.cancel.cancel();
    }

    /// Whether the renewal task is still alive.
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Watchdogs of one client, at most one per (key, owner).
///
/// Dropping the registry stops every watchdog it holds.
pub struct WatchdogRegistry {
    watchdogs: DashMap<(String, OwnerId), Watchdog>,
    interval: Duration,
    metrics: Arc<LockMetrics>,
}

impl WatchdogRegistry {
    /// Create a registry renewing every `interval`.
    pub fn new(interval: Duration, metrics: Arc<LockMetrics>) -> Self {
        Self {
            watchdogs: DashMap::new(),
            interval,
            metrics,
        }
    }

    /// Make sure a watchdog renews `owner`'s lease on `key`.
    pub fn ensure(&self, renewer: Arc<dyn LeaseRenewer>, key: &str, owner: &OwnerId, lease: Duration) {
        let id = (key.to_string(), owner.clone());
        let mut entry = self.watchdogs.entry(id).or_insert_with(|| {
            Watchdog::spawn(
                renewer.clone(),
                key.to_string(),
                owner.clone(),
                lease,
                self.interval,
                self.metrics.clone(),
            )
        });

        if !entry.is_running() {
            *entry = Watchdog::spawn(
                renewer,
                key.to_string(),
                owner.clone(),
                lease,
                self.interval,
                self.metrics.clone(),
            );
        }
    }

    /// Stop renewing `owner`'s lease on `key`.
    pub fn stop(&self, key: &str, owner: &OwnerId) {
        if let Some((_, watchdog)) = self.watchdogs.remove(&(key.to_string(), owner.clone())) {
            watchdog.stop();
        }
    }

    /// Whether a live watchdog covers `owner` on `key`.
    pub fn is_watching(&self, key: &str, owner: &OwnerId) -> bool {
        self.watchdogs
            .get(&(key.to_string(), owner.clone()))
            .map(|w| w.is_running())
            .unwrap_or(false)
    }

    /// Stop every watchdog.
    pub fn shutdown(&self) {
        for entry in self.watchdogs.iter() {
            entry.value().stop();
        }
        self.watchdogs.clear();
    }

    /// Number of live watchdogs.
    pub fn active(&self) -> usize {
        self.watchdogs.iter().filter(|w| w.is_running()).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Renews a fixed number of times, then reports the lease lost.
    struct CountingRenewer {
        renewals: AtomicU32,
        succeed_for: u32,
    }

    #[async_trait]
    impl LeaseRenewer for CountingRenewer {
        async fn renew(&self, _: &str, _: &OwnerId, _: Duration) -> Result<bool> {
            let n = self.renewals.fetch_add(1, Ordering::SeqCst) + 1;
            Ok(n <= self.succeed_for)
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_stops_on_lost_lease() {
        let renewer = Arc::new(CountingRenewer {
            renewals: AtomicU32::new(0),
            succeed_for: 2,
        });
        let metrics = Arc::new(LockMetrics::new());

        let watchdog = Watchdog::spawn(
            renewer.clone(),
            "k".to_string(),
            OwnerId::new("a"),
            Duration::from_secs(3),
            Duration::from_secs(1),
            metrics.clone(),
        );

        tokio::time::sleep(Duration::from_millis(3500)).await;
        assert!(!watchdog.is_running());
        assert_eq!(renewer.renewals.load(Ordering::SeqCst), 3);

        let snapshot = metrics.snapshot();
        assert_eq!(snapshot.renewals, 2);
        assert_eq!(snapshot.leases_lost, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_registry_stop_halts_renewals() {
        let renewer = Arc::new(CountingRenewer {
            renewals: AtomicU32::new(0),
            succeed_for: u32::MAX,
        });
        let registry = WatchdogRegistry::new(Duration::from_secs(1), Arc::new(LockMetrics::new()));
        let owner = OwnerId::new("a");

        registry.ensure(renewer.clone(), "k", &owner, Duration::from_secs(3));
        registry.ensure(renewer.clone(), "k", &owner, Duration::from_secs(3));
        assert_eq!(registry.active(), 1);

        tokio::time::sleep(Duration::from_millis(2500)).await;
        registry.stop("k", &owner);
        let renewed = renewer.renewals.load(Ordering::SeqCst);
        assert_eq!(renewed, 2);

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(renewer.renewals.load(Ordering::SeqCst), renewed);
        assert!(!registry.is_watching("k", &owner));
    }
}
