//! Shared read-write lock state and the scripts that mutate it.
//!
//! One key holds the writer, every reader and the writers waiting to get in.
//! Each hold carries its own lease; expired holds are pruned whenever a
//! script loads the state, and the key itself expires with the last hold.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use latchkey_common::OwnerId;
use latchkey_store::{
    arg_at, json_reply, key_at, read_json, write_json, Reply, Script, ScriptContext, StoreResult,
};

use crate::lease::{Attempt, ReleaseReply};

/// Exclusive holder of a read-write lock.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriterHold {
    pub owner_id: OwnerId,
    pub hold_count: u32,
    pub lease_expires_at_ms: u64,
    /// Extended by the owner's watchdog; fixed-lease holds are not.
    #[serde(default)]
    pub renewable: bool,
}

/// One reader's holds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReaderHold {
    pub hold_count: u32,
    pub lease_expires_at_ms: u64,
    #[serde(default)]
    pub renewable: bool,
}

/// Everything stored under a read-write lock key.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RwState {
    pub writer: Option<WriterHold>,
    pub readers: BTreeMap<OwnerId, ReaderHold>,
    /// Writers waiting for the lock, with the store time their claim lapses.
    pub pending_writers: BTreeMap<OwnerId, u64>,
}

impl RwState {
    /// Load the state with every lapsed hold and claim removed.
    pub(crate) fn load(ctx: &dyn ScriptContext, key: &str, now_ms: u64) -> StoreResult<Self> {
        let mut state: RwState = read_json(ctx, key)?.unwrap_or_default();
        state.prune(now_ms);
        Ok(state)
    }

    fn prune(&mut self, now_ms: u64) {
        if self
            .writer
            .as_ref()
            .map_or(false, |w| w.lease_expires_at_ms <= now_ms)
        {
            self.writer = None;
        }
        self.readers.retain(|_, r| r.lease_expires_at_ms > now_ms);
        self.pending_writers.retain(|_, expires| *expires > now_ms);
    }

    /// Write back; the key expires with the longest-lived entry.
    pub(crate) fn save(&self, ctx: &mut dyn ScriptContext, key: &str, now_ms: u64) -> StoreResult<()> {
        let last = self
            .writer
            .iter()
            .map(|w| w.lease_expires_at_ms)
            .chain(self.readers.values().map(|r| r.lease_expires_at_ms))
            .chain(self.pending_writers.values().copied())
            .max();

        match last {
            Some(last) => write_json(
                ctx,
                key,
                self,
                Some(Duration::from_millis(last.saturating_sub(now_ms))),
            ),
            None => {
                ctx.delete(key);
                Ok(())
            }
        }
    }

    pub fn is_writer(&self, owner: &OwnerId) -> bool {
        self.writer.as_ref().map_or(false, |w| &w.owner_id == owner)
    }

    pub fn read_holds(&self, owner: &OwnerId) -> u32 {
        self.readers.get(owner).map_or(0, |r| r.hold_count)
    }

    pub fn write_holds(&self, owner: &OwnerId) -> u32 {
        match &self.writer {
            Some(w) if &w.owner_id == owner => w.hold_count,
            _ => 0,
        }
    }

    /// Lease left on the write hold.
    pub fn writer_remaining(&self, now_ms: u64) -> Option<u64> {
        self.writer
            .as_ref()
            .map(|w| w.lease_expires_at_ms.saturating_sub(now_ms))
    }

    /// Time until the last current reader's lease runs out.
    pub fn readers_remaining(&self, now_ms: u64) -> Option<u64> {
        self.readers
            .values()
            .map(|r| r.lease_expires_at_ms.saturating_sub(now_ms))
            .max()
    }

    /// Whether `owner` keeps a hold its watchdog must go on renewing.
    fn has_renewable_hold(&self, owner: &OwnerId) -> bool {
        let writes = self
            .writer
            .as_ref()
            .map_or(false, |w| &w.owner_id == owner && w.renewable);
        writes || self.readers.get(owner).map_or(false, |r| r.renewable)
    }

    fn add_read_hold(&mut self, owner: OwnerId, expires_at_ms: u64, renewable: bool) -> u32 {
        let hold = self.readers.entry(owner).or_insert(ReaderHold {
            hold_count: 0,
            lease_expires_at_ms: expires_at_ms,
            renewable,
        });
        hold.hold_count += 1;
        hold.lease_expires_at_ms = expires_at_ms;
        hold.renewable |= renewable;
        hold.hold_count
    }
}

/// Snapshot returned to inspecting callers, with the store time it was taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct RwSnapshot {
    pub now_ms: u64,
    pub state: RwState,
}

/// Grants a read hold unless a writer holds or waits for the lock.
///
/// A caller that already reads, or holds the write lock, is always granted.
/// keys: `[state]`, args: `[owner, lease_ms, renewable]`
pub(crate) struct ReadAcquireScript;

impl Script for ReadAcquireScript {
    fn name(&self) -> &'static str {
        "rw_read_acquire"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let renewable: bool = arg_at(self, args, 2)?;
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;

        let reentrant = state.is_writer(&owner) || state.read_holds(&owner) > 0;
        let attempt = if !reentrant && state.writer.is_some() {
            Attempt::Blocked {
                retry_after_ms: state.writer_remaining(now_ms),
            }
        } else if !reentrant && !state.pending_writers.is_empty() {
            Attempt::Blocked {
                retry_after_ms: None,
            }
        } else {
            let hold_count = state.add_read_hold(owner, now_ms.saturating_add(lease_ms), renewable);
            state.save(ctx, key, now_ms)?;
            Attempt::Acquired { hold_count }
        };

        json_reply(self.name(), &attempt)
    }
}

/// Grants the write hold once no one else reads or writes.
///
/// A blocked writer registers as pending, which holds back new readers.
/// Asking for the write hold while only reading would wait forever on
/// oneself and is refused.
/// keys: `[state]`, args: `[owner, lease_ms, waiter_ttl_ms, renewable]`
pub(crate) struct WriteAcquireScript;

impl Script for WriteAcquireScript {
    fn name(&self) -> &'static str {
        "rw_write_acquire"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let waiter_ttl_ms: u64 = arg_at(self, args, 2)?;
        let renewable: bool = arg_at(self, args, 3)?;
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;
        let expires_at_ms = now_ms.saturating_add(lease_ms);

        let attempt = if let Some(writer) = state.writer.as_mut().filter(|w| w.owner_id == owner) {
            writer.hold_count += 1;
            writer.lease_expires_at_ms = expires_at_ms;
            writer.renewable |= renewable;
            Attempt::Acquired {
                hold_count: writer.hold_count,
            }
        } else if state.read_holds(&owner) > 0 {
            state.pending_writers.remove(&owner);
            Attempt::WouldDeadlock
        } else if state.writer.is_none() && state.readers.is_empty() {
            state.pending_writers.remove(&owner);
            state.writer = Some(WriterHold {
                owner_id: owner,
                hold_count: 1,
                lease_expires_at_ms: expires_at_ms,
                renewable,
            });
            Attempt::Acquired { hold_count: 1 }
        } else {
            let retry_after_ms = state
                .writer_remaining(now_ms)
                .or_else(|| state.readers_remaining(now_ms));
            state
                .pending_writers
                .insert(owner, now_ms.saturating_add(waiter_ttl_ms));
            Attempt::Blocked { retry_after_ms }
        };

        state.save(ctx, key, now_ms)?;
        json_reply(self.name(), &attempt)
    }
}

/// Drops one read hold.
///
/// keys: `[state, signal]`, args: `[owner]`
pub(crate) struct ReadReleaseScript;

impl Script for ReadReleaseScript {
    fn name(&self) -> &'static str {
        "rw_read_release"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;

        let reply = match state.readers.get_mut(&owner) {
            None => ReleaseReply::NotHeld,
            Some(hold) if hold.hold_count > 1 => {
                hold.hold_count -= 1;
                ReleaseReply::StillHeld {
                    hold_count: hold.hold_count,
                }
            }
            Some(_) => {
                state.readers.remove(&owner);
                ctx.publish(signal);
                ReleaseReply::Released {
                    retains_lease: state.has_renewable_hold(&owner),
                }
            }
        };

        if reply != ReleaseReply::NotHeld {
            state.save(ctx, key, now_ms)?;
        }
        json_reply(self.name(), &reply)
    }
}

/// Drops one write hold.
///
/// keys: `[state, signal]`, args: `[owner]`
pub(crate) struct WriteReleaseScript;

impl Script for WriteReleaseScript {
    fn name(&self) -> &'static str {
        "rw_write_release"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;

        let reply = match state.writer.as_mut().filter(|w| w.owner_id == owner) {
            None => ReleaseReply::NotHeld,
            Some(writer) if writer.hold_count > 1 => {
                writer.hold_count -= 1;
                ReleaseReply::StillHeld {
                    hold_count: writer.hold_count,
                }
            }
            Some(_) => {
                state.writer = None;
                ctx.publish(signal);
                ReleaseReply::Released {
                    retains_lease: state.has_renewable_hold(&owner),
                }
            }
        };

        if reply != ReleaseReply::NotHeld {
            state.save(ctx, key, now_ms)?;
        }
        json_reply(self.name(), &reply)
    }
}

/// Extends the watchdog-backed holds of one owner.
///
/// Fixed-lease holds keep their deadline. keys: `[state]`,
/// args: `[owner, lease_ms]`; replies 1 if a renewable hold was extended.
pub(crate) struct RwRenewScript;

impl Script for RwRenewScript {
    fn name(&self) -> &'static str {
        "rw_renew"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let lease_ms: u64 = arg_at(self, args, 1)?;
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;
        let expires_at_ms = now_ms.saturating_add(lease_ms);

        let mut renewed = false;
        if let Some(writer) = state
            .writer
            .as_mut()
            .filter(|w| w.owner_id == owner && w.renewable)
        {
            writer.lease_expires_at_ms = expires_at_ms;
            renewed = true;
        }
        if let Some(reader) = state.readers.get_mut(&owner).filter(|r| r.renewable) {
            reader.lease_expires_at_ms = expires_at_ms;
            renewed = true;
        }

        if renewed {
            state.save(ctx, key, now_ms)?;
        }
        Ok(Reply::Int(renewed as i64))
    }
}

/// Withdraws a pending writer that gave up, waking the readers it held back.
///
/// keys: `[state, signal]`, args: `[owner]`; replies 1 if a claim was removed.
pub(crate) struct WriteCancelScript;

impl Script for WriteCancelScript {
    fn name(&self) -> &'static str {
        "rw_write_cancel"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let signal = key_at(self, keys, 1)?;
        let owner = OwnerId::new(arg_at::<String>(self, args, 0)?);
        let now_ms = ctx.now_ms();
        let mut state = RwState::load(ctx, key, now_ms)?;

        let removed = state.pending_writers.remove(&owner).is_some();
        if removed {
            state.save(ctx, key, now_ms)?;
            ctx.publish(signal);
        }
        Ok(Reply::Int(removed as i64))
    }
}

/// Reads the pruned state.
///
/// keys: `[state]`
pub(crate) struct RwInspectScript;

impl Script for RwInspectScript {
    fn name(&self) -> &'static str {
        "rw_inspect"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], _: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let now_ms = ctx.now_ms();
        let state = RwState::load(ctx, key, now_ms)?;
        json_reply(self.name(), &RwSnapshot { now_ms, state })
    }
}
