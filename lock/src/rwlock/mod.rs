//! Distributed read-write lock.
//!
//! [`ReadWriteLock`] hands out two facades, [`ReadLock`] and [`WriteLock`],
//! over one shared store key. Readers share the lock; a writer excludes
//! everyone. Writers have priority: once a writer is waiting, new readers
//! queue behind it. Holding the write lock and then taking the read lock is
//! allowed; the reverse fails with `WouldDeadlock`.

mod state;

pub use state::{ReaderHold, RwState, WriterHold};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, instrument, warn};

use latchkey_common::{as_millis, CoordinationError, Deadline, KeySpace, OwnerId, Result};
use latchkey_store::{decode_reply, Script, SharedStore};

use crate::lease::{validate_request, Attempt, ForceReleaseScript, ReleaseReply};
use crate::lock::{AcquireOptions, DistributedLock, Lease};
use crate::mutex::LockContext;
use crate::wait::Waiter;
use crate::watchdog::LeaseRenewer;

use self::state::{
    ReadAcquireScript, ReadReleaseScript, RwInspectScript, RwRenewScript, RwSnapshot,
    WriteAcquireScript, WriteCancelScript, WriteReleaseScript,
};

/// Store keys of one read-write lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RwKeys {
    pub name: String,
    /// Shared state of both modes.
    pub state: String,
    /// Channel published whenever a hold or pending writer goes away.
    pub signal: String,
}

impl RwKeys {
    pub fn new(keys: &KeySpace, name: &str) -> Self {
        Self {
            name: name.to_string(),
            state: keys.rwlock(name),
            signal: keys.signal(name),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Read,
    Write,
}

impl Mode {
    fn as_str(self) -> &'static str {
        match self {
            Mode::Read => "read",
            Mode::Write => "write",
        }
    }
}

/// Protocol shared by both facades.
struct RwLockCore {
    keys: RwKeys,
    ctx: LockContext,
}

impl RwLockCore {
    async fn attempt(&self, mode: Mode, owner: &OwnerId, lease: Lease) -> Result<Attempt> {
        let lease_ms = as_millis(self.ctx.lease_duration(lease)).max(1).to_string();
        let renewable = (lease == Lease::Watchdog).to_string();
        let (script, args): (&dyn Script, Vec<String>) = match mode {
            Mode::Read => (&ReadAcquireScript, vec![owner.to_string(), lease_ms, renewable]),
            Mode::Write => (
                &WriteAcquireScript,
                vec![
                    owner.to_string(),
                    lease_ms,
                    as_millis(self.ctx.config.waiter_ttl).to_string(),
                    renewable,
                ],
            ),
        };

        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(script, &[self.keys.state.clone()], &args)
            .await?;
        Ok(decode_reply(script.name(), &reply)?)
    }

    async fn acquire(&self, mode: Mode, owner: &OwnerId, options: AcquireOptions) -> Result<u32> {
        let lease = self.ctx.lease_duration(options.lease);
        validate_request(owner, lease)?;

        let waiter = Waiter {
            store: self.ctx.leases.store().as_ref(),
            signal: &self.keys.signal,
            key: &self.keys.state,
            owner,
            deadline: Deadline::after(options.wait),
            cancel: options.cancel.as_ref(),
            policy: self.ctx.leases.policy(),
        };

        let result = waiter.run(|| self.attempt(mode, owner, options.lease)).await;
        self.ctx.metrics.record_acquire(&result);

        let hold_count = match result {
            Ok(hold_count) => hold_count,
            Err(e) => {
                if mode == Mode::Write {
                    self.withdraw_writer(owner).await;
                }
                return Err(e);
            }
        };

        info!(lock = %self.keys.name, owner = %owner, mode = mode.as_str(), hold_count, "Read-write lock acquired");
        let renewer = Arc::new(RwRenewer {
            store: self.ctx.leases.store().clone(),
        });
        self.ctx
            .watch(renewer, &self.keys.state, owner, options.lease);
        Ok(hold_count)
    }

    async fn withdraw_writer(&self, owner: &OwnerId) {
        let result = self
            .ctx
            .leases
            .store()
            .atomic_execute(
                &WriteCancelScript,
                &[self.keys.state.clone(), self.keys.signal.clone()],
                &[owner.to_string()],
            )
            .await;

        // A claim left behind lapses after waiter_ttl.
        if let Err(e) = result {
            warn!(lock = %self.keys.name, owner = %owner, error = %e, "Failed to withdraw pending writer");
        }
    }

    async fn release(&self, mode: Mode, owner: &OwnerId) -> Result<()> {
        let result = self.release_once(mode, owner).await;
        self.ctx.metrics.record_release(&result);

        match result? {
            ReleaseReply::Released { retains_lease } => {
                // The same watchdog renews both modes of one owner.
                if !retains_lease {
                    self.ctx.watchdogs.stop(&self.keys.state, owner);
                }
                info!(lock = %self.keys.name, owner = %owner, mode = mode.as_str(), "Read-write lock released");
            }
            ReleaseReply::StillHeld { hold_count } => {
                debug!(lock = %self.keys.name, owner = %owner, mode = mode.as_str(), hold_count, "Reentrant hold released");
            }
            ReleaseReply::NotHeld => {}
        }
        Ok(())
    }

    /// Run the release script; `NotHeld` comes back as `NotOwner`.
    async fn release_once(&self, mode: Mode, owner: &OwnerId) -> Result<ReleaseReply> {
        let script: &dyn Script = match mode {
            Mode::Read => &ReadReleaseScript,
            Mode::Write => &WriteReleaseScript,
        };
        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(
                script,
                &[self.keys.state.clone(), self.keys.signal.clone()],
                &[owner.to_string()],
            )
            .await?;

        match decode_reply(script.name(), &reply)? {
            ReleaseReply::NotHeld => Err(CoordinationError::NotOwner {
                key: self.keys.state.clone(),
                owner: owner.clone(),
            }),
            other => Ok(other),
        }
    }

    async fn snapshot(&self) -> Result<RwSnapshot> {
        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(&RwInspectScript, &[self.keys.state.clone()], &[])
            .await?;
        Ok(decode_reply(RwInspectScript.name(), &reply)?)
    }

    async fn force_release(&self) -> Result<bool> {
        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(
                &ForceReleaseScript,
                &[self.keys.state.clone(), self.keys.signal.clone()],
                &[],
            )
            .await?;
        Ok(reply.as_int() == Some(1))
    }
}

/// Renews an owner's watchdog-backed holds.
///
/// Holds only the store so that a running watchdog does not keep the lock
/// context, and with it the watchdog registry, alive.
struct RwRenewer {
    store: SharedStore,
}

#[async_trait]
impl LeaseRenewer for RwRenewer {
    async fn renew(&self, key: &str, owner: &OwnerId, lease: Duration) -> Result<bool> {
        let args = [owner.to_string(), as_millis(lease).max(1).to_string()];
        let reply = self
            .store
            .atomic_execute(&RwRenewScript, &[key.to_string()], &args)
            .await?;
        Ok(reply.as_int() == Some(1))
    }
}

/// A read-write lock; obtain the facades with [`read_lock`](Self::read_lock)
/// and [`write_lock`](Self::write_lock).
#[derive(Clone)]
pub struct ReadWriteLock {
    core: Arc<RwLockCore>,
}

impl ReadWriteLock {
    pub(crate) fn new(keys: RwKeys, ctx: LockContext) -> Self {
        Self {
            core: Arc::new(RwLockCore { keys, ctx }),
        }
    }

    pub fn name(&self) -> &str {
        &self.core.keys.name
    }

    pub fn keys(&self) -> &RwKeys {
        &self.core.keys
    }

    pub fn read_lock(&self) -> ReadLock {
        ReadLock {
            core: self.core.clone(),
        }
    }

    pub fn write_lock(&self) -> WriteLock {
        WriteLock {
            core: self.core.clone(),
        }
    }

    /// Current holders and pending writers.
    pub async fn state(&self) -> Result<RwState> {
        Ok(self.core.snapshot().await?.state)
    }
}

/// Shared-mode facade of a [`ReadWriteLock`].
pub struct ReadLock {
    core: Arc<RwLockCore>,
}

/// Exclusive-mode facade of a [`ReadWriteLock`].
pub struct WriteLock {
    core: Arc<RwLockCore>,
}

#[async_trait]
impl DistributedLock for ReadLock {
    fn name(&self) -> &str {
        &self.core.keys.name
    }

    #[instrument(skip(self, owner, options), fields(lock = %self.core.keys.name, owner = %owner))]
    async fn acquire(&self, owner: &OwnerId, options: AcquireOptions) -> Result<u32> {
        self.core.acquire(Mode::Read, owner, options).await
    }

    #[instrument(skip(self, owner), fields(lock = %self.core.keys.name, owner = %owner))]
    async fn unlock(&self, owner: &OwnerId) -> Result<()> {
        self.core.release(Mode::Read, owner).await
    }

    async fn hold_count(&self, owner: &OwnerId) -> Result<u32> {
        Ok(self.core.snapshot().await?.state.read_holds(owner))
    }

    /// Whether any reader holds the lock.
    async fn is_locked(&self) -> Result<bool> {
        Ok(!self.core.snapshot().await?.state.readers.is_empty())
    }

    /// Lease left on the longest-lived read hold.
    async fn remaining_lease(&self) -> Result<Option<Duration>> {
        let snapshot = self.core.snapshot().await?;
        Ok(snapshot
            .state
            .readers_remaining(snapshot.now_ms)
            .map(Duration::from_millis))
    }

    /// Clears the whole lock, writer included.
    async fn force_unlock(&self) -> Result<bool> {
        self.core.force_release().await
    }
}

#[async_trait]
impl DistributedLock for WriteLock {
    fn name(&self) -> &str {
        &self.core.keys.name
    }

    #[instrument(skip(self, owner, options), fields(lock = %self.core.keys.name, owner = %owner))]
    async fn acquire(&self, owner: &OwnerId, options: AcquireOptions) -> Result<u32> {
        self.core.acquire(Mode::Write, owner, options).await
    }

    #[instrument(skip(self, owner), fields(lock = %self.core.keys.name, owner = %owner))]
    async fn unlock(&self, owner: &OwnerId) -> Result<()> {
        self.core.release(Mode::Write, owner).await
    }

    async fn hold_count(&self, owner: &OwnerId) -> Result<u32> {
        Ok(self.core.snapshot().await?.state.write_holds(owner))
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.core.snapshot().await?.state.writer.is_some())
    }

    async fn remaining_lease(&self) -> Result<Option<Duration>> {
        let snapshot = self.core.snapshot().await?;
        Ok(snapshot
            .state
            .writer_remaining(snapshot.now_ms)
            .map(Duration::from_millis))
    }

    /// Clears the whole lock, readers included.
    async fn force_unlock(&self) -> Result<bool> {
        self.core.force_release().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::LockClient;
    use latchkey_store::InMemoryStore;

    fn client() -> LockClient {
        LockClient::new(Arc::new(InMemoryStore::new()), LockConfig::default()).unwrap()
    }

    #[tokio::test]
    async fn test_readers_share_and_block_writer() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let (r1, r2, w) = (OwnerId::new("r1"), OwnerId::new("r2"), OwnerId::new("w"));

        rw.read_lock().lock(&r1).await.unwrap();
        rw.read_lock().lock(&r2).await.unwrap();
        assert!(!rw.write_lock().try_lock(&w, Duration::ZERO, None).await.unwrap());

        rw.read_lock().unlock(&r1).await.unwrap();
        rw.read_lock().unlock(&r2).await.unwrap();
        assert!(rw.write_lock().try_lock(&w, Duration::ZERO, None).await.unwrap());
        assert!(!rw.read_lock().try_lock(&r1, Duration::ZERO, None).await.unwrap());
    }

    #[tokio::test]
    async fn test_write_after_read_would_deadlock() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let a = OwnerId::new("a");

        rw.read_lock().lock(&a).await.unwrap();
        let err = rw.write_lock().lock(&a).await.unwrap_err();
        assert!(matches!(err, CoordinationError::WouldDeadlock { .. }));
        assert!(rw.state().await.unwrap().pending_writers.is_empty());
    }

    #[tokio::test]
    async fn test_writer_reads_under_its_own_write_lock() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let a = OwnerId::new("a");

        rw.write_lock().lock(&a).await.unwrap();
        rw.read_lock().lock(&a).await.unwrap();

        rw.write_lock().unlock(&a).await.unwrap();
        assert!(client.watchdogs().is_watching(&rw.keys().state, &a));
        assert_eq!(rw.read_lock().hold_count(&a).await.unwrap(), 1);

        rw.read_lock().unlock(&a).await.unwrap();
        assert!(!client.watchdogs().is_watching(&rw.keys().state, &a));
        assert_eq!(rw.state().await.unwrap(), RwState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiting_writer_goes_before_new_readers() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let r1 = OwnerId::new("r1");
        rw.read_lock().lock(&r1).await.unwrap();

        let writer = {
            let write = rw.write_lock();
            tokio::spawn(async move {
                write
                    .try_lock(&OwnerId::new("w"), Duration::from_secs(30), None)
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert!(!rw
            .read_lock()
            .try_lock(&OwnerId::new("r2"), Duration::from_millis(200), None)
            .await
            .unwrap());

        rw.read_lock().unlock(&r1).await.unwrap();
        assert!(writer.await.unwrap().unwrap());
        assert_eq!(rw.write_lock().hold_count(&OwnerId::new("w")).await.unwrap(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_writer_releases_readers() {
        let client = client();
        let rw = client.read_write_lock("doc");
        rw.read_lock().lock(&OwnerId::new("r1")).await.unwrap();

        assert!(!rw
            .write_lock()
            .try_lock(&OwnerId::new("w"), Duration::from_secs(1), None)
            .await
            .unwrap());
        assert!(rw
            .read_lock()
            .try_lock(&OwnerId::new("r2"), Duration::ZERO, None)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_lease_expires() {
        let client = client();
        let rw = client.read_write_lock("doc");

        rw.read_lock()
            .lock_with_lease(&OwnerId::new("r"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            rw.read_lock().remaining_lease().await.unwrap(),
            Some(Duration::from_secs(10))
        );

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(rw
            .write_lock()
            .try_lock(&OwnerId::new("w"), Duration::from_secs(1), None)
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_fixed_read_hold_under_write_lock_still_expires() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let a = OwnerId::new("a");

        rw.write_lock().lock(&a).await.unwrap();
        rw.read_lock()
            .lock_with_lease(&a, Duration::from_secs(15))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(20)).await;
        assert_eq!(rw.write_lock().hold_count(&a).await.unwrap(), 1);
        assert_eq!(rw.read_lock().hold_count(&a).await.unwrap(), 0);

        let err = rw.read_lock().unlock(&a).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));
        rw.write_lock().unlock(&a).await.unwrap();
        assert!(!client.watchdogs().is_watching(&rw.keys().state, &a));

        tokio::time::sleep(Duration::from_secs(40)).await;
        assert_eq!(rw.state().await.unwrap(), RwState::default());
    }

    #[tokio::test(start_paused = true)]
    async fn test_watchdog_read_hold_outlives_fixed_write_hold() {
        let client = client();
        let rw = client.read_write_lock("doc");
        let a = OwnerId::new("a");

        rw.write_lock()
            .lock_with_lease(&a, Duration::from_secs(15))
            .await
            .unwrap();
        rw.read_lock().lock(&a).await.unwrap();
        rw.write_lock().unlock(&a).await.unwrap();
        assert!(client.watchdogs().is_watching(&rw.keys().state, &a));

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(rw.read_lock().hold_count(&a).await.unwrap(), 1);
        rw.read_lock().unlock(&a).await.unwrap();
    }
}
