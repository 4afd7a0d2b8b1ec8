//! Lease management for exclusive lock records.
//!
//! A lock record names its owner, a hold count and the lease deadline. The
//! record's store key expires together with the lease, so a crashed holder
//! frees the lock without anyone cleaning up after it. Acquire, release and
//! renew each run as a single store script.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument};

use latchkey_common::{
    as_millis, from_unix_ms, CoordinationError, Deadline, KeySpace, OwnerId, Result, Timestamp,
};
use latchkey_store::{
    arg_at, decode_reply, decode_value, json_reply, key_at, read_json, write_json, KeyTtl, Reply, Script,
    ScriptContext, SharedStore, StoreResult,
};

use crate::config::LockConfig;
use crate::wait::{RetryPolicy, Waiter};
use crate::watchdog::LeaseRenewer;

/// Store keys of one exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockKeys {
    /// Lock name as given by the caller.
    pub name: String,
    /// Key of the lock record.
    pub record: String,
    /// Channel published on release.
    pub signal: String,
}

impl LockKeys {
    /// Keys of the lock called `name`.
    pub fn new(keys: &KeySpace, name: &str) -> Self {
        Self {
            name: name.to_string(),
            record: keys.lock(name),
            signal: keys.signal(name),
        }
    }
}

/// Current holder of an exclusive lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LockRecord {
    pub key: String,
    pub owner_id: OwnerId,
    /// Reentrant holds; at least 1 while the record exists.
    pub hold_count: u32,
    /// Store-clock deadline in Unix milliseconds.
    pub lease_expires_at_ms: u64,
}

impl LockRecord {
    /// Grant a first hold.
    pub fn grant(key: &str, owner: OwnerId, now_ms: u64, lease_ms: u64) -> Self {
        Self {
            key: key.to_string(),
            owner_id: owner,
            hold_count: 1,
            lease_expires_at_ms: now_ms.saturating_add(lease_ms),
        }
    }

    /// Add a reentrant hold and refresh the lease.
    pub fn reenter(&mut self, now_ms: u64, lease_ms: u64) {
        self.hold_count += 1;
        self.lease_expires_at_ms = now_ms.saturating_add(lease_ms);
    }

    /// Whether `owner` is the holder.
    pub fn is_held_by(&self, owner: &OwnerId) -> bool {
        &self.owner_id == owner
    }

    /// Lease deadline as a timestamp.
    pub fn lease_expires_at(&self) -> Timestamp {
        from_unix_ms(self.lease_expires_at_ms)
    }

    /// Lease left at store time `now_ms`.
    pub fn remaining_at(&self, now_ms: u64) -> Duration {
        Duration::from_millis(self.lease_expires_at_ms.saturating_sub(now_ms))
    }

    /// Persist the record with its key expiring at the lease deadline.
    pub(crate) fn save(&self, ctx: &mut dyn ScriptContext, now_ms: u64) -> StoreResult<()> {
        write_json(ctx, &self.key, self, Some(self.remaining_at(now_ms)))
    }
}

/// Outcome of a single acquisition attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum Attempt {
    /// The hold was granted.
    Acquired { hold_count: u32 },
    /// Someone else holds the lock; retry no later than `retry_after_ms`.
    Blocked { retry_after_ms: Option<u64> },
    /// Granting would require the caller to wait on itself.
    WouldDeadlock,
}

impl Attempt {
    pub(crate) fn blocked_for(remaining: Duration) -> Self {
        Attempt::Blocked {
            retry_after_ms: Some(as_millis(remaining)),
        }
    }
}

/// Outcome of a release script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum ReleaseReply {
    /// The owner's last hold of this kind is gone.
    ///
    /// `retains_lease` is set when the owner still holds the key in another
    /// mode, so its lease must keep being renewed.
    Released { retains_lease: bool },
    /// The owner still has reentrant holds.
    StillHeld { hold_count: u32 },
    /// The owner did not hold the lock.
    NotHeld,
}

/// Result of a successful release.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseOutcome {
    /// The lock is free (for this owner) and waiters were signalled.
    Released,
    /// The owner still holds `hold_count` holds.
    StillHeld { hold_count: u32 },
}

/// Grants a first hold or a reentrant one.
///
/// keys: `[record]`, args: `[owner, lease_ms]`
pub(crate) struct AcquireScript;

impl Script for AcquireScript {
    fn name(&self) -> &'static str {
        "lock_acquire"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let now_ms = ctx.now_ms();

        let attempt = match read_json::<LockRecord>(ctx, key)? {
            None => {
                let record = LockRecord::grant(key, owner, now_ms, lease_ms);
                record.save(ctx, now_ms)?;
                Attempt::Acquired { hold_count: 1 }
            }
            Some(mut record) if record.is_held_by(&owner) => {
                record.reenter(now_ms, lease_ms);
                record.save(ctx, now_ms)?;
                Attempt::Acquired {
                    hold_count: record.hold_count,
                }
            }
            Some(record) => Attempt::blocked_for(record.remaining_at(now_ms)),
        };

        json_reply(self.name(), &attempt)
    }
}

/// Drops one hold and signals waiters when the last one goes.
///
/// keys: `[record, signal]`, args: `[owner]`
pub(crate) struct ReleaseScript;

impl Script for ReleaseScript {
    fn name(&self) -> &'static str {
        "lock_release"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let now_ms = ctx.now_ms();

        let reply = match read_json::<LockRecord>(ctx, key)? {
            Some(mut record) if record.is_held_by(&owner) => {
                if record.hold_count > 1 {
                    record.hold_count -= 1;
                    record.save(ctx, now_ms)?;
                    ReleaseReply::StillHeld {
                        hold_count: record.hold_count,
                    }
                } else {
                    ctx.delete(key);
                    ctx.publish(signal);
                    ReleaseReply::Released {
                        retains_lease: false,
                    }
                }
            }
            _ => ReleaseReply::NotHeld,
        };

        json_reply(self.name(), &reply)
    }
}

/// Extends the lease if the owner still holds the lock.
///
/// keys: `[record]`, args: `[owner, lease_ms]`; replies 1 or 0.
pub(crate) struct RenewScript;

impl Script for RenewScript {
    fn name(&self) -> &'static str {
        "lock_renew"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let now_ms = ctx.now_ms();

        match read_json::<LockRecord>(ctx, key)? {
            Some(mut record) if record.is_held_by(&owner) => {
                record.lease_expires_at_ms = now_ms.saturating_add(lease_ms);
                record.save(ctx, now_ms)?;
                Ok(Reply::Int(1))
            }
            _ => Ok(Reply::Int(0)),
        }
    }
}

/// Deletes a key regardless of owner and signals waiters.
///
/// keys: `[key, signal]`; replies 1 if something was deleted.
pub(crate) struct ForceReleaseScript;

impl Script for ForceReleaseScript {
    fn name(&self) -> &'static str {
        "lock_force_release"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], _: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;

        let deleted = ctx.delete(key);
        ctx.publish(signal);
        Ok(Reply::Int(deleted as i64))
    }
}

/// Reads the remaining lifetime of a key on the store clock.
///
/// keys: `[key]`; replies milliseconds, or nil when the key is gone.
pub(crate) struct LeaseTtlScript;

impl Script for LeaseTtlScript {
    fn name(&self) -> &'static str {
        "lease_ttl"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], _: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        Ok(match ctx.pttl(key) {
            KeyTtl::Expires(left) => Reply::Int(as_millis(left) as i64),
            KeyTtl::Persistent => Reply::Int(i64::MAX),
            KeyTtl::Missing => Reply::Nil,
        })
    }
}

/// Reject arguments that can never lead to a valid hold.
pub(crate) fn validate_request(owner: &OwnerId, lease: Duration) -> Result<()> {
    if !owner.is_valid() {
        return Err(CoordinationError::InvalidArgument(format!(
            "invalid owner id {:?}",
            owner.as_str()
        )));
    }
    if lease.is_zero() {
        return Err(CoordinationError::InvalidArgument(
            "lease duration must be positive".to_string(),
        ));
    }
    Ok(())
}

/// Issues, renews and revokes leases on exclusive lock records.
pub struct LeaseManager {
    store: SharedStore,
    policy: RetryPolicy,
}

impl LeaseManager {
    /// Create a lease manager over `store`.
    pub fn new(store: SharedStore, config: &LockConfig) -> Self {
        Self {
            store,
            policy: RetryPolicy::from_config(config),
        }
    }

    /// Underlying store.
    pub fn store(&self) -> &SharedStore {
        &self.store
    }

    pub(crate) fn policy(&self) -> RetryPolicy {
        self.policy
    }

    /// Make one acquisition attempt.
    pub async fn try_acquire(&self, keys: &LockKeys, owner: &OwnerId, lease: Duration) -> Result<Attempt> {
        validate_request(owner, lease)?;

        let args = [owner.to_string(), as_millis(lease).max(1).to_string()];
        let reply = self
            .store
            .atomic_execute(&AcquireScript, &[keys.record.clone()], &args)
            .await?;
        Ok(decode_reply(AcquireScript.name(), &reply)?)
    }

    /// Acquire within `wait`, returning whether the hold was granted.
    pub async fn acquire(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
        wait: Option<Duration>,
    ) -> Result<bool> {
        match self.acquire_with(keys, owner, lease, wait, None).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Acquire within `wait`, honouring `cancel`; returns the new hold count.
    #[instrument(skip(self, keys, owner, cancel), fields(key = %keys.record, owner = %owner))]
    pub async fn acquire_with(
        &self,
        keys: &LockKeys,
        owner: &OwnerId,
        lease: Duration,
        wait: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<u32> {
        validate_request(owner, lease)?;

        let waiter = Waiter {
            store: self.store.as_ref(),
            signal: &keys.signal,
            key: &keys.record,
            owner,
            deadline: Deadline::after(wait),
            cancel,
            policy: self.policy,
        };

        let hold_count = waiter.run(|| self.try_acquire(keys, owner, lease)).await?;

        info!(key = %keys.record, owner = %owner, hold_count, "Lock acquired");
        Ok(hold_count)
    }

    /// Drop one hold of `owner`.
    #[instrument(skip(self, keys, owner), fields(key = %keys.record, owner = %owner))]
    pub async fn release(&self, keys: &LockKeys, owner: &OwnerId) -> Result<ReleaseOutcome> {
        let reply = self
            .store
            .atomic_execute(
                &ReleaseScript,
                &[keys.record.clone(), keys.signal.clone()],
                &[owner.to_string()],
            )
            .await?;

        match decode_reply(ReleaseScript.name(), &reply)? {
            ReleaseReply::Released { .. } => {
                info!(key = %keys.record, owner = %owner, "Lock released");
                Ok(ReleaseOutcome::Released)
            }
            ReleaseReply::StillHeld { hold_count } => {
                debug!(key = %keys.record, owner = %owner, hold_count, "Reentrant hold released");
                Ok(ReleaseOutcome::StillHeld { hold_count })
            }
            ReleaseReply::NotHeld => Err(CoordinationError::NotOwner {
                key: keys.record.clone(),
                owner: owner.clone(),
            }),
        }
    }

    /// Extend the lease if `owner` still holds the record.
    ///
    /// Returns `false` once ownership is lost; that is not an error.
    pub async fn renew(&self, key: &str, owner: &OwnerId, lease: Duration) -> Result<bool> {
        let args = [owner.to_string(), as_millis(lease).max(1).to_string()];
        let reply = self
            .store
            .atomic_execute(&RenewScript, &[key.to_string()], &args)
            .await?;
        Ok(reply.as_int() == Some(1))
    }

    /// Delete the record whoever holds it.
    pub async fn force_release(&self, keys: &LockKeys) -> Result<bool> {
        let reply = self
            .store
            .atomic_execute(
                &ForceReleaseScript,
                &[keys.record.clone(), keys.signal.clone()],
                &[],
            )
            .await?;
        let deleted = reply.as_int() == Some(1);
        if deleted {
            info!(key = %keys.record, "Lock force-released");
        }
        Ok(deleted)
    }

    /// Remaining lease on `key`, if it is held.
    pub async fn lease_ttl(&self, key: &str) -> Result<Option<Duration>> {
        let reply = self
            .store
            .atomic_execute(&LeaseTtlScript, &[key.to_string()], &[])
            .await?;
        Ok(reply.as_int().map(|ms| Duration::from_millis(ms.max(0) as u64)))
    }

    /// Current record, if the lock is held.
    pub async fn record(&self, keys: &LockKeys) -> Result<Option<LockRecord>> {
        match self.store.get(&keys.record).await? {
            Some(raw) => Ok(Some(decode_value(&keys.record, &raw)?)),
            None => Ok(None),
        }
    }
}

#[async_trait]
impl LeaseRenewer for LeaseManager {
    async fn renew(&self, key: &str, owner: &OwnerId, lease: Duration) -> Result<bool> {
        LeaseManager::renew(self, key, owner, lease).await
    }
}

/// Shared lease manager.
pub type SharedLeaseManager = Arc<LeaseManager>;

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_store::InMemoryStore;

    fn manager() -> (Arc<InMemoryStore>, LeaseManager, LockKeys) {
        let store = Arc::new(InMemoryStore::new());
        let manager = LeaseManager::new(store.clone(), &LockConfig::default());
        let keys = LockKeys::new(&KeySpace::default(), "orders");
        (store, manager, keys)
    }

    #[tokio::test]
    async fn test_first_acquire_creates_record() {
        let (_, manager, keys) = manager();
        let owner = OwnerId::new("a");

        let attempt = manager
            .try_acquire(&keys, &owner, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(attempt, Attempt::Acquired { hold_count: 1 });

        let record = manager.record(&keys).await.unwrap().unwrap();
        assert_eq!(record.owner_id, owner);
        assert_eq!(record.hold_count, 1);
        assert_eq!(record.key, keys.record);
    }

    #[tokio::test]
    async fn test_reentrant_acquire_increments_hold_count() {
        let (_, manager, keys) = manager();
        let owner = OwnerId::new("a");
        let lease = Duration::from_secs(10);

        manager.try_acquire(&keys, &owner, lease).await.unwrap();
        let attempt = manager.try_acquire(&keys, &owner, lease).await.unwrap();
        assert_eq!(attempt, Attempt::Acquired { hold_count: 2 });

        assert_eq!(
            manager.release(&keys, &owner).await.unwrap(),
            ReleaseOutcome::StillHeld { hold_count: 1 }
        );
        assert_eq!(
            manager.release(&keys, &owner).await.unwrap(),
            ReleaseOutcome::Released
        );
        assert!(manager.record(&keys).await.unwrap().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_contended_attempt_reports_remaining_lease() {
        let (_, manager, keys) = manager();
        manager
            .try_acquire(&keys, &OwnerId::new("a"), Duration::from_secs(10))
            .await
            .unwrap();

        let attempt = manager
            .try_acquire(&keys, &OwnerId::new("b"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(
            attempt,
            Attempt::Blocked {
                retry_after_ms: Some(10_000)
            }
        );
    }

    #[tokio::test]
    async fn test_release_by_stranger_fails() {
        let (_, manager, keys) = manager();
        manager
            .try_acquire(&keys, &OwnerId::new("a"), Duration::from_secs(10))
            .await
            .unwrap();

        let err = manager.release(&keys, &OwnerId::new("b")).await.unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));

        let err = manager
            .release(&LockKeys::new(&KeySpace::default(), "free"), &OwnerId::new("a"))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::NotOwner { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn test_renew_extends_only_for_holder() {
        let (_, manager, keys) = manager();
        let owner = OwnerId::new("a");
        manager
            .try_acquire(&keys, &owner, Duration::from_secs(3))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager
            .renew(&keys.record, &owner, Duration::from_secs(3))
            .await
            .unwrap());
        assert!(!manager
            .renew(&keys.record, &OwnerId::new("b"), Duration::from_secs(3))
            .await
            .unwrap());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.record(&keys).await.unwrap().is_some());

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(manager.record(&keys).await.unwrap().is_none());
        assert!(!manager
            .renew(&keys.record, &owner, Duration::from_secs(3))
            .await
            .unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_lease_ttl_follows_store_clock() {
        let (_, manager, keys) = manager();
        assert_eq!(manager.lease_ttl(&keys.record).await.unwrap(), None);

        manager
            .try_acquire(&keys, &OwnerId::new("a"), Duration::from_secs(10))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(
            manager.lease_ttl(&keys.record).await.unwrap(),
            Some(Duration::from_secs(6))
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_expired_lease_is_treated_as_absent() {
        let (_, manager, keys) = manager();
        manager
            .try_acquire(&keys, &OwnerId::new("a"), Duration::from_secs(1))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(1001)).await;
        let attempt = manager
            .try_acquire(&keys, &OwnerId::new("b"), Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(attempt, Attempt::Acquired { hold_count: 1 });
    }

    #[tokio::test(start_paused = true)]
    async fn test_blocking_acquire_times_out() {
        let (_, manager, keys) = manager();
        let lease = Duration::from_secs(30);
        assert!(manager
            .acquire(&keys, &OwnerId::new("a"), lease, Some(Duration::ZERO))
            .await
            .unwrap());

        let granted = manager
            .acquire(&keys, &OwnerId::new("b"), lease, Some(Duration::from_secs(1)))
            .await
            .unwrap();
        assert!(!granted);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let (store, manager, keys) = manager();
        store.set_available(false);

        let err = manager
            .acquire(&keys, &OwnerId::new("a"), Duration::from_secs(1), None)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::StoreUnavailable(_)));
    }

    #[tokio::test]
    async fn test_invalid_requests_rejected() {
        let (_, manager, keys) = manager();

        let err = manager
            .try_acquire(&keys, &OwnerId::new(""), Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));

        let err = manager
            .try_acquire(&keys, &OwnerId::new("a"), Duration::ZERO)
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
    }
}
