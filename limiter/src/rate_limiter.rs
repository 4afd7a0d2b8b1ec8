//! Distributed token-bucket rate limiter.
//!
//! The bucket lives in the shared store. Every request refills and debits
//! the bucket in a single script, so concurrent callers in different
//! processes can never spend the same tokens twice.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use latchkey_common::{CoordinationError, Deadline, KeySpace, Result};
use latchkey_store::{
    arg_at, decode_reply, json_reply, key_at, read_json, write_json, Reply, Script, ScriptContext,
    SharedStore, StoreResult,
};

use crate::bucket::{RateLimiterState, Take};
use crate::config::RateLimiterConfig;
use crate::metrics::{LimiterMetrics, SharedLimiterMetrics};

/// Reply of [`ConfigureScript`].
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Configured {
    created: bool,
    state: RateLimiterState,
}

/// Creates the bucket unless it already exists.
///
/// keys: `[state]`, args: `[capacity, rate]`
struct ConfigureScript;

impl Script for ConfigureScript {
    fn name(&self) -> &'static str {
        "limiter_configure"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let capacity: u64 = arg_at(self, args, 0)?;
        let rate: f64 = arg_at(self, args, 1)?;

        let configured = match read_json::<RateLimiterState>(ctx, key)? {
            Some(state) => Configured {
                created: false,
                state,
            },
            None => {
                let state = RateLimiterState::new(key, capacity, rate, ctx.now_ms());
                write_json(ctx, key, &state, None)?;
                Configured {
                    created: true,
                    state,
                }
            }
        };

        json_reply(self.name(), &configured)
    }
}

/// Refills the bucket and debits the permits if enough are there.
///
/// A bucket that vanished from the store is recreated full from the args.
/// keys: `[state]`, args: `[permits, capacity, rate]`
struct TakeScript;

impl Script for TakeScript {
    fn name(&self) -> &'static str {
        "limiter_take"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], args: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let permits: u64 = arg_at(self, args, 0)?;
        let capacity: u64 = arg_at(self, args, 1)?;
        let rate: f64 = arg_at(self, args, 2)?;
        let now_ms = ctx.now_ms();

        let mut state = read_json::<RateLimiterState>(ctx, key)?
            .unwrap_or_else(|| RateLimiterState::new(key, capacity, rate, now_ms));
        let take = state.take(permits, now_ms);
        write_json(ctx, key, &state, None)?;

        json_reply(self.name(), &take)
    }
}

/// Reports the refilled bucket without changing it.
///
/// keys: `[state]`
struct PeekScript;

impl Script for PeekScript {
    fn name(&self) -> &'static str {
        "limiter_peek"
    }

    fn run(&self, ctx: &mut dyn ScriptContext, keys: &[String], _: &[String]) -> StoreResult<Reply> {
        let key = key_at(self, keys, 0)?;
        let now_ms = ctx.now_ms();

        let state = read_json::<RateLimiterState>(ctx, key)?.map(|mut state| {
            state.refill(now_ms);
            state
        });
        json_reply(self.name(), &state)
    }
}

/// Handle to one named token bucket.
pub struct RateLimiter {
    name: String,
    key: String,
    config: RateLimiterConfig,
    store: SharedStore,
    metrics: SharedLimiterMetrics,
}

impl RateLimiter {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Store key of the bucket.
    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    /// Wait as long as needed for `permits`, then consume them.
    pub async fn acquire(&self, permits: u64) -> Result<()> {
        self.acquire_with(permits, None, None).await
    }

    /// Consume `permits` if they become available within `wait`.
    ///
    /// Gives up at once when the refill needed is longer than `wait`.
    pub async fn try_acquire(&self, permits: u64, wait: Duration) -> Result<bool> {
        match self.acquire_with(permits, Some(wait), None).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_timeout() => Ok(false),
            Err(e) => Err(e),
        }
    }

    /// Wait at most `wait` (forever if `None`) for `permits`, honouring `cancel`.
    #[instrument(skip(self, cancel), fields(limiter = %self.name))]
    pub async fn acquire_with(
        &self,
        permits: u64,
        wait: Option<Duration>,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        self.check_permits(permits)?;

        let result = self.wait_for_permits(permits, Deadline::after(wait), cancel).await;
        self.metrics.record_request(permits, &result);
        result
    }

    async fn wait_for_permits(
        &self,
        permits: u64,
        deadline: Deadline,
        cancel: Option<&CancellationToken>,
    ) -> Result<()> {
        let cancel = cancel.cloned().unwrap_or_default();

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            let retry_after = match self.take(permits).await? {
                Take::Granted { remaining } => {
                    debug!(limiter = %self.name, permits, remaining, "Permits granted");
                    return Ok(());
                }
                Take::Denied { retry_after_ms } => Duration::from_millis(retry_after_ms),
            };
            self.metrics.denied();

            if deadline.remaining().map_or(false, |left| retry_after > left) {
                return Err(CoordinationError::AcquisitionTimeout {
                    key: self.key.clone(),
                    waited: deadline.elapsed(),
                });
            }

            let pause = retry_after.clamp(Duration::from_millis(1), self.config.max_poll_interval);
            debug!(limiter = %self.name, permits, pause_ms = pause.as_millis() as u64, "Waiting for refill");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                _ = tokio::time::sleep(pause) => {}
            }
        }
    }

    /// Whole permits that could be taken right now.
    pub async fn available_permits(&self) -> Result<u64> {
        let reply = self
            .store
            .atomic_execute(&PeekScript, &[self.key.clone()], &[])
            .await?;
        let state: Option<RateLimiterState> = decode_reply(PeekScript.name(), &reply)?;
        Ok(state.map_or(self.config.capacity, |s| s.whole_tokens()))
    }

    async fn take(&self, permits: u64) -> Result<Take> {
        let args = [
            permits.to_string(),
            self.config.capacity.to_string(),
            self.config.refill_rate_per_second.to_string(),
        ];
        let reply = self
            .store
            .atomic_execute(&TakeScript, &[self.key.clone()], &args)
            .await?;
        Ok(decode_reply(TakeScript.name(), &reply)?)
    }

    fn check_permits(&self, permits: u64) -> Result<()> {
        if permits == 0 {
            return Err(CoordinationError::InvalidArgument(
                "permits must be at least 1".to_string(),
            ));
        }
        if permits > self.config.capacity {
            return Err(CoordinationError::InvalidArgument(format!(
                "{} permits can never fit a bucket of capacity {}",
                permits, self.config.capacity
            )));
        }
        Ok(())
    }

    fn cancelled(&self) -> CoordinationError {
        CoordinationError::Cancelled {
            key: self.key.clone(),
        }
    }
}

/// Creates and caches the rate limiters of one process.
pub struct RateLimiterManager {
    store: SharedStore,
    keys: KeySpace,
    limiters: DashMap<String, Arc<RateLimiter>>,
    metrics: SharedLimiterMetrics,
}

impl RateLimiterManager {
    /// Create a manager using the default key prefix.
    pub fn new(store: SharedStore) -> Self {
        Self::with_key_space(store, KeySpace::default())
    }

    pub fn with_key_space(store: SharedStore, keys: KeySpace) -> Self {
        Self {
            store,
            keys,
            limiters: DashMap::new(),
            metrics: Arc::new(LimiterMetrics::new()),
        }
    }

    /// Get the limiter `name`, creating its bucket if the store has none.
    pub async fn create_if_absent(
        &self,
        capacity: u64,
        refill_rate_per_second: f64,
        name: &str,
    ) -> Result<Arc<RateLimiter>> {
        self.create_with_config(name, RateLimiterConfig::new(capacity, refill_rate_per_second))
            .await
    }

    /// Like [`create_if_absent`](Self::create_if_absent) with full configuration.
    ///
    /// A bucket that already exists keeps its stored capacity and rate.
    pub async fn create_with_config(
        &self,
        name: &str,
        config: RateLimiterConfig,
    ) -> Result<Arc<RateLimiter>> {
        if name.is_empty() {
            return Err(CoordinationError::InvalidArgument(
                "limiter name cannot be empty".to_string(),
            ));
        }
        config.validate().map_err(CoordinationError::InvalidArgument)?;

        if let Some(limiter) = self.limiters.get(name) {
            return Ok(limiter.clone());
        }

        let key = self.keys.limiter(name);
        let args = [
            config.capacity.to_string(),
            config.refill_rate_per_second.to_string(),
        ];
        let reply = self
            .store
            .atomic_execute(&ConfigureScript, &[key.clone()], &args)
            .await?;
        let configured: Configured = decode_reply(ConfigureScript.name(), &reply)?;

        let stored = &configured.state;
        let config = if stored.capacity != config.capacity
            || stored.refill_rate_per_second != config.refill_rate_per_second
        {
            warn!(
                limiter = %name,
                capacity = stored.capacity,
                refill_rate_per_second = stored.refill_rate_per_second,
                "Limiter already configured with different parameters, keeping stored ones"
            );
            RateLimiterConfig {
                capacity: stored.capacity,
                refill_rate_per_second: stored.refill_rate_per_second,
                ..config
            }
        } else {
            config
        };

        if configured.created {
            info!(limiter = %name, capacity = config.capacity, refill_rate_per_second = config.refill_rate_per_second, "Rate limiter created");
        }

        let limiter = Arc::new(RateLimiter {
            name: name.to_string(),
            key,
            config,
            store: self.store.clone(),
            metrics: self.metrics.clone(),
        });
        Ok(self
            .limiters
            .entry(name.to_string())
            .or_insert(limiter)
            .clone())
    }

    /// A limiter created earlier by this manager.
    pub fn get(&self, name: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(name).map(|l| l.clone())
    }

    pub fn metrics(&self) -> &LimiterMetrics {
        &self.metrics
    }

    /// Number of limiters created by this manager.
    pub fn len(&self) -> usize {
        self.limiters.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limiters.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use latchkey_store::InMemoryStore;

    fn manager() -> (Arc<InMemoryStore>, RateLimiterManager) {
        let store = Arc::new(InMemoryStore::new());
        (store.clone(), RateLimiterManager::new(store))
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_single_refill() {
        let (_, manager) = manager();
        let limiter = manager.create_if_absent(5, 10.0, "api").await.unwrap();

        for _ in 0..5 {
            assert!(limiter.try_acquire(1, Duration::ZERO).await.unwrap());
        }
        assert!(!limiter.try_acquire(1, Duration::ZERO).await.unwrap());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(limiter.try_acquire(1, Duration::ZERO).await.unwrap());
        assert!(!limiter.try_acquire(1, Duration::ZERO).await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_refill() {
        let (_, manager) = manager();
        let limiter = manager.create_if_absent(2, 4.0, "api").await.unwrap();
        limiter.acquire(2).await.unwrap();

        let started = tokio::time::Instant::now();
        limiter.acquire(1).await.unwrap();
        assert!(started.elapsed() >= Duration::from_millis(250));
        assert!(started.elapsed() < Duration::from_millis(400));
    }

    #[tokio::test(start_paused = true)]
    async fn test_try_acquire_within_budget() {
        let (_, manager) = manager();
        let limiter = manager.create_if_absent(1, 1.0, "api").await.unwrap();
        limiter.acquire(1).await.unwrap();

        assert!(!limiter.try_acquire(1, Duration::from_millis(500)).await.unwrap());
        assert!(limiter.try_acquire(1, Duration::from_secs(2)).await.unwrap());

        let snapshot = manager.metrics().snapshot();
        assert_eq!(snapshot.granted_requests, 2);
        assert_eq!(snapshot.timeouts, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancelled_wait() {
        let (_, manager) = manager();
        let limiter = manager.create_if_absent(1, 0.1, "slow").await.unwrap();
        limiter.acquire(1).await.unwrap();

        let token = CancellationToken::new();
        let waiter = {
            let limiter = limiter.clone();
            let token = token.clone();
            tokio::spawn(async move { limiter.acquire_with(1, None, Some(&token)).await })
        };

        tokio::time::sleep(Duration::from_secs(1)).await;
        token.cancel();
        let err = waiter.await.unwrap().unwrap_err();
        assert!(matches!(err, CoordinationError::Cancelled { .. }));
    }

    #[tokio::test]
    async fn test_invalid_requests() {
        let (_, manager) = manager();
        let limiter = manager.create_if_absent(5, 10.0, "api").await.unwrap();

        for permits in [0, 6] {
            let err = limiter.acquire(permits).await.unwrap_err();
            assert!(matches!(err, CoordinationError::InvalidArgument(_)));
        }

        let err = manager.create_if_absent(0, 10.0, "bad").await.err().unwrap();
        assert!(matches!(err, CoordinationError::InvalidArgument(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_create_is_idempotent_across_managers() {
        let (store, first) = manager();
        let limiter = first.create_if_absent(5, 10.0, "api").await.unwrap();
        limiter.acquire(3).await.unwrap();

        let second = RateLimiterManager::new(store);
        let other = second.create_if_absent(50, 1.0, "api").await.unwrap();
        assert_eq!(other.config().capacity, 5);
        assert_eq!(other.config().refill_rate_per_second, 10.0);
        assert_eq!(other.available_permits().await.unwrap(), 2);

        assert!(Arc::ptr_eq(
            &limiter,
            &first.create_if_absent(5, 10.0, "api").await.unwrap()
        ));
        assert_eq!(first.len(), 1);
    }

    #[tokio::test]
    async fn test_store_outage_fails_closed() {
        let (store, manager) = manager();
        let limiter = manager.create_if_absent(5, 10.0, "api").await.unwrap();

        store.set_available(false);
        let err = limiter
            .try_acquire(1, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CoordinationError::StoreUnavailable(_)));
    }
}
