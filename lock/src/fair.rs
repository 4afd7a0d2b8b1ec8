//! First-come, first-served distributed lock.
//!
//! Contended callers join a waiter queue stored next to the lock record. The
//! lock is granted only to the queue head, so a caller arriving later never
//! overtakes one still waiting. Waiters refresh their entry on every poll; an
//! entry whose owner stopped polling (crashed, aborted) lapses after
//! `waiter_ttl` and stops blocking the queue.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use latchkey_common::{as_millis, Deadline, KeySpace, OwnerId, Result};
use latchkey_store::{
    arg_at, decode_reply, json_reply, key_at, read_json, write_json, Reply, Script, ScriptContext,
    StoreResult,
};

use crate::lease::{validate_request, Attempt, LockKeys, LockRecord};
use crate::lock::{AcquireOptions, DistributedLock};
use crate::mutex::LockContext;
use crate::wait::Waiter;

/// Store keys of one fair lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FairKeys {
    /// Record and release channel, kept apart from a mutex of the same name.
    pub lock: LockKeys,
    /// Waiter queue.
    pub queue: String,
    /// Counter handing out waiter sequence numbers.
    pub sequence: String,
}

impl FairKeys {
    pub fn new(keys: &KeySpace, name: &str) -> Self {
        Self {
            lock: LockKeys {
                name: name.to_string(),
                record: keys.fair_lock(name),
                signal: keys.fair_signal(name),
            },
            queue: keys.fair_queue(name),
            sequence: keys.fair_sequence(name),
        }
    }
}

/// A caller waiting for a fair lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WaiterEntry {
    pub key: String,
    pub owner_id: OwnerId,
    /// Store-clock time the waiter joined, Unix milliseconds.
    pub enqueued_at_ms: u64,
    /// Store-assigned position; strictly increasing per lock.
    pub sequence: u64,
    /// The entry lapses at this store-clock time unless refreshed.
    pub expires_at_ms: u64,
}

/// Live queue of a fair lock, ordered by sequence.
#[derive(Debug, Default)]
struct WaiterQueue {
    entries: Vec<WaiterEntry>,
}

impl WaiterQueue {
    fn load(ctx: &dyn ScriptContext, key: &str, now_ms: u64) -> StoreResult<Self> {
        let mut entries: Vec<WaiterEntry> = read_json(ctx, key)?.unwrap_or_default();
        entries.retain(|e| e.expires_at_ms > now_ms);
        entries.sort_by_key(|e| e.sequence);
        Ok(Self { entries })
    }

    fn head(&self) -> Option<&WaiterEntry> {
        self.entries.first()
    }

    fn position(&self, owner: &OwnerId) -> Option<usize> {
        self.entries.iter().position(|e| &e.owner_id == owner)
    }

    fn remove(&mut self, owner: &OwnerId) -> Option<WaiterEntry> {
        self.position(owner).map(|idx| self.entries.remove(idx))
    }

    /// Write back, letting the key expire with its last entry.
    fn save(&self, ctx: &mut dyn ScriptContext, key: &str, now_ms: u64) -> StoreResult<()> {
        match self.entries.iter().map(|e| e.expires_at_ms).max() {
            Some(last) => write_json(
                ctx,
                key,
                &self.entries,
                Some(Duration::from_millis(last.saturating_sub(now_ms))),
            ),
            None => {
                ctx.delete(key);
                Ok(())
            }
        }
    }
}

/// Grants the lock to the queue head, or queues the caller.
///
/// keys: `[record, queue, sequence]`, args: `[owner, lease_ms, waiter_ttl_ms]`
pub(crate) struct FairAcquireScript;

impl Script for FairAcquireScript {
    fn name(&self) -> &'static str {
        "fair_acquire"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let record_key = key_at(self, keys, 0)?;
        let queue_key = key_at(self, keys, 1)?;
        let sequence_key = key_at(self, keys, 2)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let waiter_ttl_ms: u64 = arg_at(self, args, 2)?;
        let now_ms = ctx.now_ms();

        let mut queue = WaiterQueue::load(ctx, queue_key, now_ms)?;
        let record = read_json::<LockRecord>(ctx, record_key)?;

        let attempt = match record {
            Some(mut record) if record.is_held_by(&owner) => {
                record.reenter(now_ms, lease_ms);
                record.save(ctx, now_ms)?;
                Attempt::Acquired {
                    hold_count: record.hold_count,
                }
            }
            None if queue.head().map_or(true, |head| head.owner_id == owner) => {
                queue.remove(&owner);
                LockRecord::grant(record_key, owner, now_ms, lease_ms).save(ctx, now_ms)?;
                Attempt::Acquired { hold_count: 1 }
            }
            held => {
                let expires_at_ms = now_ms.saturating_add(waiter_ttl_ms);
                match queue.position(&owner) {
                    Some(idx) => queue.entries[idx].expires_at_ms = expires_at_ms,
                    None => {
                        let sequence = ctx.incr(sequence_key)? as u64;
                        queue.entries.push(WaiterEntry {
                            key: record_key.to_string(),
                            owner_id: owner,
                            enqueued_at_ms: now_ms,
                            sequence,
                            expires_at_ms,
                        });
                    }
                }
                match held {
                    Some(record) => Attempt::blocked_for(record.remaining_at(now_ms)),
                    None => Attempt::Blocked {
                        retry_after_ms: None,
                    },
                }
            }
        };

        queue.save(ctx, queue_key, now_ms)?;
        json_reply(self.name(), &attempt)
    }
}

/// Removes a waiter that gave up.
///
/// keys: `[queue, signal]`, args: `[owner]`; replies 1 if an entry was removed.
/// Wakes the others when the head leaves so the next in line can go.
pub(crate) struct FairCancelScript;

impl Script for FairCancelScript {
    fn name(&self) -> &'static str {
        "fair_cancel"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let queue_key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let now_ms = ctx.now_ms();

        let mut queue = WaiterQueue::load(ctx, queue_key, now_ms)?;
        let was_head = queue.head().map_or(false, |head| head.owner_id == owner);
        let removed = queue.remove(&owner).is_some();
        queue.save(ctx, queue_key, now_ms)?;

        if was_head {
            ctx.publish(signal);
        }
        Ok(Reply::Int(removed as i64))
    }
}

/// Reads the live waiters in grant order.
///
/// keys: `[queue]`
struct FairQueueScript;

impl Script for FairQueueScript {
    fn name(&self) -> &'static str {
        "fair_queue"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], _: &[String]) -> StoreResult<Reply> {
        let queue_key = key_at(self, keys, 0)?;
        let now_ms = ctx.now_ms();
        let queue = WaiterQueue::load(ctx, queue_key, now_ms)?;
        json_reply(self.name(), &queue.entries)
    }
}

/// Reentrant lock granted in arrival order.
pub struct FairLock {
    keys: FairKeys,
    ctx: LockContext,
}

impl FairLock {
    pub(crate) fn new(keys: FairKeys, ctx: LockContext) -> Self {
        Self { keys, ctx }
    }

    /// Store keys of this lock.
    pub fn keys(&self) -> &FairKeys {
        &self.keys
    }

    /// Callers currently waiting, head first.
    pub async fn queue(&self) -> Result<Vec<WaiterEntry>> {
        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(&FairQueueScript, &[self.keys.queue.clone()], &[])
            .await?;
        Ok(decode_reply(FairQueueScript.name(), &reply)?)
    }

    async fn try_acquire(&self, owner: &OwnerId, lease: Duration) -> Result<Attempt> {
        let keys = [
            self.keys.lock.record.clone(),
            self.keys.queue.clone(),
            self.keys.sequence.clone(),
        ];
        let args = [
            owner.to_string(),
            as_millis(lease).max(1).to_string(),
            as_millis(self.ctx.config.waiter_ttl).to_string(),
        ];
        let reply = self
            .ctx
            .leases
            .store()
            .atomic_execute(&FairAcquireScript, &keys, &args)
            .await?;
        Ok(decode_reply(FairAcquireScript.name(), &reply)?)
    }

    /// Leave the queue after giving up.
    async fn leave_queue(&self, owner: &OwnerId) {
        let result = self
            .ctx
            .leases
            .store()
            .atomic_execute(
                &FairCancelScript,
                &[self.keys.queue.clone(), self.keys.lock.signal.clone()],
                &[owner.to_string()],
            )
            .await;

        match result {
            Ok(reply) => {
                debug!(lock = %self.keys.lock.name, owner = %owner, removed = reply.as_int() == Some(1), "Left fair queue");
            }
            // The entry lapses on its own after waiter_ttl.
            Err(e) => {
                warn!(lock = %self.keys.lock.name, owner = %owner, error = %e, "Failed to leave fair queue");
            }
        }
    }
}

#[async_trait]
impl DistributedLock for FairLock {
    fn name(&self) -> &str {
        &self.keys.lock.name
    }

    #[instrument(skip(self, owner, options), fields(lock = %self.keys.lock.name, owner = %owner))]
    async fn acquire(&self, owner: &OwnerId, options: AcquireOptions) -> Result<u32> {
        let lease = self.ctx.lease_duration(options.lease);
        validate_request(owner, lease)?;

        let waiter = Waiter {
            store: self.ctx.leases.store().as_ref(),
            signal: &self.keys.lock.signal,
            key: &self.keys.lock.record,
            owner,
            deadline: Deadline::after(options.wait),
            cancel: options.cancel.as_ref(),
            policy: self.ctx.leases.policy(),
        };

        let result = waiter.run(|| self.try_acquire(owner, lease)).await;
        self.ctx.metrics.record_acquire(&result);

        let hold_count = match result {
            Ok(hold_count) => hold_count,
            Err(e) => {
                self.leave_queue(owner).await;
                return Err(e);
            }
        };

        info!(lock = %self.keys.lock.name, owner = %owner, hold_count, "Fair lock acquired");
        self.ctx.watch(
            self.ctx.leases.clone(),
            &self.keys.lock.record,
            owner,
            options.lease,
        );
        Ok(hold_count)
    }

    #[instrument(skip(self, owner), fields(lock = %self.keys.lock.name, owner = %owner))]
    async fn unlock(&self, owner: &OwnerId) -> Result<()> {
        self.ctx.release_exclusive(&self.keys.lock, owner).await
    }

    async fn hold_count(&self, owner: &OwnerId) -> Result<u32> {
        Ok(self
            .ctx
            .leases
            .record(&self.keys.lock)
            .await?
            .filter(|r| r.is_held_by(owner))
            .map(|r| r.hold_count)
            .unwrap_or(0))
    }

    async fn is_locked(&self) -> Result<bool> {
        Ok(self.ctx.leases.record(&self.keys.lock).await?.is_some())
    }

    async fn remaining_lease(&self) -> Result<Option<Duration>> {
        self.ctx.leases.lease_ttl(&self.keys.lock.record).await
    }

    async fn force_unlock(&self) -> Result<bool> {
        self.ctx.leases.force_release(&self.keys.lock).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LockConfig;
    use crate::LockClient;
    use latchkey_store::InMemoryStore;
    use std::sync::Arc;

    fn client() -> LockClient {
        LockClient::new(Arc::new(InMemoryStore::new()), LockConfig::default()).unwrap()
    }

    fn owners(queue: &[WaiterEntry]) -> Vec<&str> {
        queue.iter().map(|e| e.owner_id.as_str()).collect()
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_granted_in_arrival_order() {
        let client = client();
        let lock = Arc::new(client.fair_lock("fairLock"));
        let a = OwnerId::new("a");
        lock.lock(&a).await.unwrap();

        let spawn_waiter = |name: &'static str| {
            let lock = lock.clone();
            tokio::spawn(async move {
                lock.try_lock(&OwnerId::new(name), Duration::from_secs(60), None)
                    .await
            })
        };

        let b = spawn_waiter("b");
        tokio::time::sleep(Duration::from_millis(100)).await;
        let c = spawn_waiter("c");
        tokio::time::sleep(Duration::from_millis(100)).await;

        let queue = lock.queue().await.unwrap();
        assert_eq!(owners(&queue), vec!["b", "c"]);
        assert!(queue[0].sequence < queue[1].sequence);

        lock.unlock(&a).await.unwrap();
        assert!(b.await.unwrap().unwrap());
        assert!(lock.is_held_by(&OwnerId::new("b")).await.unwrap());
        assert!(!c.is_finished());
        assert_eq!(owners(&lock.queue().await.unwrap()), vec!["c"]);

        lock.unlock(&OwnerId::new("b")).await.unwrap();
        assert!(c.await.unwrap().unwrap());
        assert!(lock.queue().await.unwrap().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_caller_cannot_jump_queue() {
        let client = client();
        let lock = client.fair_lock("m");
        let lease = Duration::from_secs(10);
        lock.lock_with_lease(&OwnerId::new("a"), Duration::from_secs(1))
            .await
            .unwrap();

        let b = OwnerId::new("b");
        assert!(matches!(
            lock.try_acquire(&b, lease).await.unwrap(),
            Attempt::Blocked { .. }
        ));

        // a's lease is gone, but b is still queued ahead of c.
        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!lock.is_locked().await.unwrap());
        assert_eq!(
            lock.try_acquire(&OwnerId::new("c"), lease).await.unwrap(),
            Attempt::Blocked {
                retry_after_ms: None
            }
        );

        assert_eq!(
            lock.try_acquire(&b, lease).await.unwrap(),
            Attempt::Acquired { hold_count: 1 }
        );
        assert_eq!(owners(&lock.queue().await.unwrap()), vec!["c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_waiter_leaves_queue() {
        let client = client();
        let lock = client.fair_lock("m");
        lock.lock(&OwnerId::new("a")).await.unwrap();

        let granted = lock
            .try_lock(&OwnerId::new("b"), Duration::from_secs(1), None)
            .await
            .unwrap();
        assert!(!granted);
        assert!(lock.queue().await.unwrap().is_empty());
        assert_eq!(client.metrics().snapshot().timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_abandoned_waiter_lapses() {
        let client = client();
        let lock = Arc::new(client.fair_lock("m"));
        let a = OwnerId::new("a");
        lock.lock(&a).await.unwrap();

        let ghost = {
            let lock = lock.clone();
            tokio::spawn(async move { lock.lock(&OwnerId::new("ghost")).await })
        };
        tokio::time::sleep(Duration::from_millis(100)).await;
        ghost.abort();
        assert!(ghost.await.unwrap_err().is_cancelled());
        assert_eq!(owners(&lock.queue().await.unwrap()), vec!["ghost"]);

        lock.unlock(&a).await.unwrap();
        let granted = lock
            .try_lock(&OwnerId::new("c"), Duration::from_secs(10), None)
            .await
            .unwrap();
        assert!(granted);
        assert!(lock.queue().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_holder_reenters_ahead_of_queue() {
        let client = client();
        let lock = client.fair_lock("m");
        let a = OwnerId::new("a");

        lock.lock(&a).await.unwrap();
        assert!(!lock
            .try_lock(&OwnerId::new("b"), Duration::ZERO, None)
            .await
            .unwrap());
        assert_eq!(lock.acquire(&a, AcquireOptions::within(Duration::ZERO)).await.unwrap(), 2);

        lock.unlock(&a).await.unwrap();
        lock.unlock(&a).await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    }
}
