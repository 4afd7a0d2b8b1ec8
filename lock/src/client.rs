//! Entry point handing out lock handles.

use std::fmt;
use std::sync::Arc;

use tracing::info;

use latchkey_common::{ClientId, CoordinationError, KeySpace, OwnerId, Result};
use latchkey_store::SharedStore;

use crate::config::LockConfig;
use crate::fair::{FairKeys, FairLock};
use crate::lease::{LeaseManager, LockKeys};
use crate::metrics::LockMetrics;
use crate::mutex::{LockContext, MutexLock};
use crate::rwlock::{ReadWriteLock, RwKeys};
use crate::watchdog::WatchdogRegistry;

/// One process's view of the shared store.
///
/// Every lock handed out by a client shares its configuration, watchdogs
/// and metrics. Handles are cheap; create them per use if convenient.
///
/// Handles keep the shared watchdogs alive: dropping the client alone does
/// not stop renewal of locks still held through a handle. Renewal ends with
/// the last client or handle, or with [`shutdown`](Self::shutdown).
pub struct LockClient {
    id: ClientId,
    keys: KeySpace,
    ctx: LockContext,
}

impl LockClient {
    /// Create a client over `store`.
    pub fn new(store: SharedStore, config: LockConfig) -> Result<Self> {
        config.validate().map_err(CoordinationError::InvalidArgument)?;

        let metrics = Arc::new(LockMetrics::new());
        let ctx = LockContext {
            leases: Arc::new(LeaseManager::new(store, &config)),
            watchdogs: Arc::new(WatchdogRegistry::new(
                config.renewal_interval(),
                metrics.clone(),
            )),
            metrics,
            config: Arc::new(config),
        };
        let client = Self {
            id: ClientId::new(),
            keys: KeySpace::new(ctx.config.key_prefix.clone()),
            ctx,
        };

        info!(
            client = %client.id,
            prefix = %client.keys.prefix(),
            watchdog_timeout_ms = client.ctx.config.watchdog_timeout.as_millis() as u64,
            "Lock client created"
        );
        Ok(client)
    }

    /// Reentrant lock without ordering among waiters.
    pub fn mutex(&self, name: &str) -> MutexLock {
        MutexLock::new(LockKeys::new(&self.keys, name), self.ctx.clone())
    }

    /// Reentrant lock granted in arrival order.
    pub fn fair_lock(&self, name: &str) -> FairLock {
        FairLock::new(FairKeys::new(&self.keys, name), self.ctx.clone())
    }

    /// Writer-priority read-write lock.
    pub fn read_write_lock(&self, name: &str) -> ReadWriteLock {
        ReadWriteLock::new(RwKeys::new(&self.keys, name), self.ctx.clone())
    }

    pub fn client_id(&self) -> ClientId {
        self.id
    }

    /// Owner identity for a local actor (task, worker) of this client.
    pub fn owner(&self, local: impl fmt::Display) -> OwnerId {
        self.id.owner(local)
    }

    pub fn config(&self) -> &LockConfig {
        &self.ctx.config
    }

    pub fn metrics(&self) -> &LockMetrics {
        &self.ctx.metrics
    }

    pub fn watchdogs(&self) -> &WatchdogRegistry {
        &self.ctx.watchdogs
    }

    pub fn store(&self) -> &SharedStore {
        self.ctx.leases.store()
    }

    /// Stop every watchdog; held leases run out on their own.
    pub fn shutdown(&self) {
        let active = self.ctx.watchdogs.active();
        self.ctx.watchdogs.shutdown();
        info!(client = %self.id, stopped = active, "Lock client shut down");
    }
}
