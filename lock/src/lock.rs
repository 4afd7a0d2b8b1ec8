//! The lock handle interface shared by every lock variant.

use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;

use latchkey_common::{OwnerId, Result};

/// How long a granted lock stays valid without further action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lease {
    /// Lease of `watchdog_timeout`, renewed in the background until unlock.
    Watchdog,
    /// Fixed lease; the lock releases itself when it runs out.
    Fixed(Duration),
}

/// Parameters of one acquisition.
#[derive(Debug, Clone)]
pub struct AcquireOptions {
    /// Wait budget; `None` waits until granted or cancelled.
    pub wait: Option<Duration>,
    /// Lease of the granted hold.
    pub lease: Lease,
    /// Caller-side cancellation of the wait.
    pub cancel: Option<CancellationToken>,
}

impl AcquireOptions {
    /// Wait forever with a watchdog lease.
    pub fn blocking() -> Self {
        Self {
            wait: None,
            lease: Lease::Watchdog,
            cancel: None,
        }
    }

    /// Wait at most `wait` with a watchdog lease.
    pub fn within(wait: Duration) -> Self {
        Self {
            wait: Some(wait),
            ..Self::blocking()
        }
    }

    /// Use a fixed lease instead of the watchdog.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = Lease::Fixed(lease);
        self
    }

    /// Abort the wait when `token` is cancelled.
    pub fn cancel_on(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }
}

impl Default for AcquireOptions {
    fn default() -> Self {
        Self::blocking()
    }
}

/// A named lock living in the shared store.
///
/// Handles are cheap and stateless: every call goes to the store, and the
/// owner is passed explicitly so reentrancy never depends on which task or
/// thread makes the call.
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Lock name.
    fn name(&self) -> &str;

    /// Acquire a hold for `owner`, returning the owner's new hold count.
    ///
    /// Fails with `AcquisitionTimeout` when the wait budget runs out and
    /// `Cancelled` when the cancellation token fires.
    async fn acquire(&self, owner: &OwnerId, options: AcquireOptions) -> Result<u32>;

    /// Drop one hold. Fails with `NotOwner` if `owner` holds nothing.
    async fn unlock(&self, owner: &OwnerId) -> Result<()>;

    /// Holds currently owned by `owner` (0 when not held).
    async fn hold_count(&self, owner: &OwnerId) -> Result<u32>;

    /// Whether anyone holds the lock.
    async fn is_locked(&self) -> Result<bool>;

    /// Remaining lease of the current hold, if any.
    async fn remaining_lease(&self) -> Result<Option<Duration>>;

    /// Delete the lock regardless of owner and wake all waiters.
    async fn force_unlock(&self) -> Result<bool>;

    /// Block until acquired; the watchdog keeps the lease alive.
    async fn lock(&self, owner: &OwnerId) -> Result<()> {
        self.acquire(owner, AcquireOptions::blocking()).await.map(|_| ())
    }

    /// Block until acquired; the hold expires after `lease` unless unlocked.
    async fn lock_with_lease(&self, owner: &OwnerId, lease: Duration) -> Result<()> {
        self.acquire(owner, AcquireOptions::blocking().with_lease(lease))
            .await
            .map(|_| ())
    }

    /// Wait at most `wait`; `lease` of `None` means watchdog renewal.
    ///
    /// Timing out is reported as `Ok(false)`, every other failure as an error.
    async fn try_lock(
        &self,
        owner: &OwnerId,
        wait: Duration,
        lease: Option<Duration>,
    ) -> Result<bool> {
        let mut options = AcquireOptions::within(wait);
        if let Some(lease) = lease {
            options = options.with_lease(lease);
        }

        match self.acquire(owner, options).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Whether `owner` holds at least one hold.
    async fn is_held_by(&self, owner: &OwnerId) -> Result<bool> {
        Ok(self.hold_count(owner).await? > 0)
    }
}
