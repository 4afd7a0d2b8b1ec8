//! Retry loop shared by every blocking acquisition.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use latchkey_common::{CoordinationError, Deadline, OwnerId, Result};
use latchkey_store::AtomicStore;

use crate::config::LockConfig;
use crate::lease::Attempt;

/// Bounds of the delay between contended attempts.
#[derive(Debug, Clone, Copy)]
pub(crate) struct RetryPolicy {
    pub min: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn from_config(config: &LockConfig) -> Self {
        Self {
            min: config.retry_min_backoff,
            max: config.retry_max_backoff,
        }
    }
}

/// Exponential backoff with jitter.
#[derive(Debug)]
pub(crate) struct Backoff {
    next: Duration,
    max: Duration,
}

impl Backoff {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            next: policy.min,
            max: policy.max,
        }
    }

    /// Next delay: uniformly drawn from the upper half of the current step.
    pub fn next_delay(&mut self) -> Duration {
        let step = self.next;
        self.next = (self.next * 2).min(self.max);

        let half = step / 2;
        let jitter_ms = rand::thread_rng().gen_range(0..=half.as_millis() as u64);
        half + Duration::from_millis(jitter_ms)
    }
}

/// One blocked caller waiting for its turn.
pub(crate) struct Waiter<'a> {
    pub store: &'a dyn AtomicStore,
    pub signal: &'a str,
    pub key: &'a str,
    pub owner: &'a OwnerId,
    pub deadline: Deadline,
    pub cancel: Option<&'a CancellationToken>,
    pub policy: RetryPolicy,
}

impl Waiter<'_> {
    /// Call `attempt` until it grants a hold, the deadline passes or the
    /// caller cancels. Between attempts the waiter sleeps on the release
    /// signal, never longer than the holder's remaining lease.
    pub async fn run<F, Fut>(&self, mut attempt: F) -> Result<u32>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<Attempt>>,
    {
        let cancel = self.cancel.cloned().unwrap_or_default();
        let mut backoff = Backoff::new(self.policy);

        loop {
            if cancel.is_cancelled() {
                return Err(self.cancelled());
            }

            let retry_after = match attempt().await? {
                Attempt::Acquired { hold_count } => return Ok(hold_count),
                Attempt::WouldDeadlock => {
                    return Err(CoordinationError::WouldDeadlock {
                        key: self.key.to_string(),
                        owner: self.owner.clone(),
                    })
                }
                Attempt::Blocked { retry_after_ms } => retry_after_ms.map(Duration::from_millis),
            };

            if self.deadline.is_exceeded() {
                return Err(CoordinationError::AcquisitionTimeout {
                    key: self.key.to_string(),
                    waited: self.deadline.elapsed(),
                });
            }

            let mut delay = backoff.next_delay();
            if let Some(lease_left) = retry_after {
                delay = delay.min(lease_left);
            }
            let delay = self.deadline.clamp(delay.max(Duration::from_millis(1)));

            debug!(key = %self.key, owner = %self.owner, delay_ms = delay.as_millis() as u64, "Lock busy, waiting");

            tokio::select! {
                biased;
                _ = cancel.cancelled() => return Err(self.cancelled()),
                woken = self.store.wait_for_signal(self.signal, delay) => woken?,
            }
        }
    }

    fn cancelled(&self) -> CoordinationError {
        CoordinationError::Cancelled {
            key: self.key.to_string(),
        }
    }
}
