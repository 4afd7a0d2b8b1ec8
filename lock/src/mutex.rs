//! Reentrant distributed mutex.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::instrument;

use latchkey_common::{CoordinationError, OwnerId, Result};

use crate::config::LockConfig;
use crate::lease::{LeaseManager, LockKeys, ReleaseOutcome};
use crate::lock::{AcquireOptions, DistributedLock, Lease};
use crate::metrics::SharedLockMetrics;
use crate::watchdog::{LeaseRenewer, WatchdogRegistry};

/// Shared pieces every lock handle of one client works with.
#[derive(Clone)]
pub(crate) struct LockContext {
    pub leases: Arc<LeaseManager>,
    pub watchdogs: Arc<WatchdogRegistry>,
    pub metrics: SharedLockMetrics,
    pub config: Arc<LockConfig>,
}

impl LockContext {
    /// Lease to request for `lease`.
    pub fn lease_duration(&self, lease: Lease) -> Duration {
        match lease {
            Lease::Watchdog => self.config.watchdog_timeout,
            Lease::Fixed(duration) => duration,
        }
    }

    /// Start the watchdog when the hold asked for one.
    pub fn watch(&self, renewer: Arc<dyn LeaseRenewer>, key: &str, owner: &OwnerId, lease: Lease) {
        if lease == Lease::Watchdog {
            self.watchdogs
                .ensure(renewer, key, owner, self.config.watchdog_timeout);
        }
    }

    /// Drop one hold on an exclusive record and stop renewal with the last one.
    ///
    /// A failed round trip leaves the watchdog running: the hold may still
    /// be in the store and must not lapse behind the owner's back.
    pub async fn release_exclusive(&self, keys: &LockKeys, owner: &OwnerId) -> Result<()> {
        let result = self.leases.release(keys, owner).await;
        self.metrics.record_release(&result);

        match result {
            Ok(ReleaseOutcome::Released) => {
                self.watchdogs.stop(&keys.record, owner);
                Ok(())
            }
            Ok(ReleaseOutcome::StillHeld { .. }) => Ok(()),
            Err(e @ CoordinationError::NotOwner { .. }) => {
                self.watchdogs.stop(&keys.record, owner);
                Err(e)
            }
            Err(e) => Err(e),
        }
    }
}

/// Reentrant mutual-exclusion lock.
///
/// Contended callers poll with backoff and wake early on release; no order
/// among waiters is promised.
pub struct MutexLock {
    keys: LockKeys,
    ctx: LockContext,
}

impl MutexLock {
    pub(crate) fn new(keys: LockKeys, ctx: LockContext) -> Self {
        Self { keys, ctx }
    }

    /// Store keys of this lock.
    pub fn keys(&self) -> &LockKeys {
        &self.keys
    }
}

#[async_trait]
impl DistributedLock for MutexLock {
    fn name(&self) -> &str {
        &self.keys.name
    }

    #[instrument(skip(self, owner, options), fields(lock = %self.keys.name, owner = %owner))]
    async fn acquire(&self, owner: &OwnerId, options: AcquireOptions) -> Result<u32> {
        let lease = self.ctx.lease_duration(options.lease);
        let result = self
            .ctx
            .leases
            .acquire_with(&self.keys, owner, lease, options.wait, options.cancel.as_ref())
            .await;
        self.ctx.metrics.record_acquire(&result);

        let hold_count = result?;
        self.ctx
            .watch(self.ctx.leases.clone(), &self.keys.record, owner, options.lease);
        Ok(hold_count)
    }

    #[instrument(skip(self, owner), fields(lock = %self.keys.name, owner = %owner))]
    async fn unlock(&self, owner: &OwnerId) -> Result<()> {
        self.ctx.release_exclusive(&self.keys, owner).await
    }

    async fn hold_count(&self, owner: &OwnerId) -> Result<u32> {
        Ok(self
            .ctx
            .leases
            .record(&self.keys)
            .await?
            .filter(|r| r.is_held_by(owner))
            .map(|r| r.hold_count)
            .unwrap_or(0))
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.ctx.leases.record(&self.keys).await?.is_some())
    }

    async fn remaining_lease(&self) -> Result<Option<Duration>> {
        self.ctx.leases.lease_ttl(&self.keys.record).await
    }

    async fn force_unlock(&self) -> Result<bool> {
        self.ctx.leases.force_release(&self.keys).await
    }
}
