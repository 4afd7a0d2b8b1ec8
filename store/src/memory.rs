//! In-process atomic store.
//!
//! Every operation takes one mutex, so scripts run with nothing interleaved.
//! The clock follows `tokio::time`, which lets paused-time tests drive expiry.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::{debug, warn};

use latchkey_common::as_millis;

use crate::error::{StoreError, StoreResult};
use crate::script::{KeyTtl, Reply, Script, ScriptContext};
use crate::store::AtomicStore;

/// Stored value with optional expiry on the store clock.
#[derive(Debug, Clone)]
struct Entry {
    value: String,
    expires_at_ms: Option<u64>,
}

impl Entry {
    fn is_live(&self, now_ms: u64) -> bool {
        match self.expires_at_ms {
            Some(at) => now_ms < at,
            None => true,
        }
    }
}

/// Script view over the locked key space.
struct Txn<'a> {
    entries: &'a mut HashMap<String, Entry>,
    now_ms: u64,
    published: Vec<String>,
}

impl Txn<'_> {
    fn live(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key).filter(|e| e.is_live(self.now_ms))
    }
}

impl ScriptContext for Txn<'_> {
    fn now_ms(&self) -> u64 {
        self.now_ms
    }

    fn get(&self, key: &str) -> Option<String> {
        self.live(key).map(|e| e.value.clone())
    }

    fn set(&mut self, key: &str, value: String, ttl: Option<Duration>) {
        let expires_at_ms = ttl.map(|ttl| self.now_ms.saturating_add(as_millis(ttl)));
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at_ms,
            },
        );
    }

    fn pttl(&self, key: &str) -> KeyTtl {
        match self.live(key) {
            None => KeyTtl::Missing,
            Some(Entry {
                expires_at_ms: None,
                ..
            }) => KeyTtl::Persistent,
            Some(Entry {
                expires_at_ms: Some(at),
                ..
            }) => KeyTtl::Expires(Duration::from_millis(at.saturating_sub(self.now_ms))),
        }
    }

    fn delete(&mut self, key: &str) -> bool {
        match self.entries.remove(key) {
            Some(entry) => entry.is_live(self.now_ms),
            None => false,
        }
    }

    fn incr(&mut self, key: &str) -> StoreResult<i64> {
        let current = match self.live(key) {
            Some(entry) => entry.value.parse::<i64>().map_err(|e| StoreError::Corrupt {
                key: key.to_string(),
                reason: e.to_string(),
            })?,
            None => 0,
        };
        let next = current + 1;
        let expires_at_ms = self.live(key).and_then(|e| e.expires_at_ms);
        self.entries.insert(
            key.to_string(),
            Entry {
                value: next.to_string(),
                expires_at_ms,
            },
        );
        Ok(next)
    }

    fn publish(&mut self, channel: &str) {
        self.published.push(channel.to_string());
    }
}

/// In-process implementation of [`AtomicStore`].
pub struct InMemoryStore {
    /// Key space guarded by a single lock.
    entries: Mutex<HashMap<String, Entry>>,
    /// Wall clock at creation, in Unix milliseconds.
    epoch_ms: u64,
    /// Monotonic origin of the store clock.
    origin: Instant,
    /// Release notification channels.
    channels: DashMap<String, Arc<Notify>>,
    /// Fault injection switch.
    available: AtomicBool,
    /// Simulated round-trip latency.
    latency: Option<Duration>,
}

impl InMemoryStore {
    /// Create an empty store.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            epoch_ms: latchkey_common::now().timestamp_millis().max(0) as u64,
            origin: Instant::now(),
            channels: DashMap::new(),
            available: AtomicBool::new(true),
            latency: None,
        }
    }

    /// Add a fixed delay before every operation, like a network hop.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Store clock in Unix milliseconds.
    pub fn now_ms(&self) -> u64 {
        self.epoch_ms + as_millis(self.origin.elapsed())
    }

    /// Simulate an outage (`false`) or recovery (`true`).
    pub fn set_available(&self, available: bool) {
        if !available {
            warn!("In-memory store marked unavailable");
        }
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of live keys.
    pub fn len(&self) -> usize {
        let now_ms = self.now_ms();
        self.entries.lock().values().filter(|e| e.is_live(now_ms)).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop expired keys and idle notification channels.
    pub fn purge_expired(&self) -> usize {
        let now_ms = self.now_ms();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|_, e| e.is_live(now_ms));
        let purged = before - entries.len();
        drop(entries);

        self.channels.retain(|_, notify| Arc::strong_count(notify) > 1);

        if purged > 0 {
            debug!(purged, "Purged expired keys");
        }
        purged
    }

    /// Run the expiry sweep forever.
    pub async fn run_expiry_loop(&self, interval: Duration) {
        loop {
            tokio::time::sleep(interval).await;
            self.purge_expired();
        }
    }

    async fn round_trip(&self) -> StoreResult<()> {
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if !self.available.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store is offline".to_string()));
        }
        Ok(())
    }

    fn channel(&self, name: &str) -> Arc<Notify> {
        self.channels
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Notify::new()))
            .clone()
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AtomicStore for InMemoryStore {
    async fn atomic_execute(
        &self,
        script: &dyn Script,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Reply> {
        self.round_trip().await?;

        let now_ms = self.now_ms();
        let (reply, published) = {
            let mut entries = self.entries.lock();
            let mut txn = Txn {
                entries: &mut entries,
                now_ms,
                published: Vec::new(),
            };
            let reply = script.run(&mut txn, keys, args)?;
            (reply, txn.published)
        };

        for channel in published {
            if let Some(notify) = self.channels.get(&channel) {
                notify.notify_waiters();
            }
        }

        Ok(reply)
    }

    async fn set_with_expiry(
        &self,
        key: &str,
        value: &str,
        ttl: Option<Duration>,
    ) -> StoreResult<()> {
        self.round_trip().await?;

        let now_ms = self.now_ms();
        self.entries.lock().insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at_ms: ttl.map(|ttl| now_ms.saturating_add(as_millis(ttl))),
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> StoreResult<Option<String>> {
        self.round_trip().await?;

        let now_ms = self.now_ms();
        Ok(self
            .entries
            .lock()
            .get(key)
            .filter(|e| e.is_live(now_ms))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> StoreResult<bool> {
        self.round_trip().await?;

        let now_ms = self.now_ms();
        Ok(self
            .entries
            .lock()
            .remove(key)
            .map(|e| e.is_live(now_ms))
            .unwrap_or(false))
    }

    async fn wait_for_signal(&self, channel: &str, timeout: Duration) -> StoreResult<()> {
        self.round_trip().await?;

        let notify = self.channel(channel);
        let _ = tokio::time::timeout(timeout, notify.notified()).await;
        Ok(())
    }
}
