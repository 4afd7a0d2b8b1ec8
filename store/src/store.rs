//! The atomic store contract consumed by locks and rate limiters.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::error::StoreResult;
use crate::script::{Reply, Script};

/// A shared key-value store with atomic scripts and per-key expiry.
///
/// Every individual call is linearizable. Anything that must read and then
/// write goes through [`AtomicStore::atomic_execute`].
#[async_trait]
pub trait AtomicStore: Send + Sync {
    /// Run `script` as one indivisible step.
    async fn atomic_execute(
        &self,
        script: &dyn Script,
        keys: &[String],
        args: &[String],
    ) -> StoreResult<Reply>;

    /// Set a value, optionally expiring after `ttl`.
    async fn set_with_expiry(&self, key: &str, value: &str, ttl: Option<Duration>)
        -> StoreResult<()>;

    /// Read a live value.
    async fn get(&self, key: &str) -> StoreResult<Option<String>>;

    /// Delete a key. Returns whether a live key was removed.
    async fn delete(&self, key: &str) -> StoreResult<bool>;

    /// Wait until a script publishes on `channel` or `timeout` passes.
    ///
    /// Stores without notifications simply sleep, which turns every waiter
    /// into a poller.
    async fn wait_for_signal(&self, channel: &str, timeout: Duration) -> StoreResult<()> {
        let _ = channel;
        tokio::time::sleep(timeout).await;
        Ok(())
    }
}

/// Shared store handle.
pub type SharedStore = Arc<dyn AtomicStore>;
