//! Latchkey Locks
//!
//! Distributed locks over a shared [`AtomicStore`](latchkey_store::AtomicStore).
//! Every state change is one atomic store script, and every hold carries a
//! lease so a crashed holder frees its locks by itself.
//!
//! - [`MutexLock`]: reentrant mutual exclusion, no ordering among waiters.
//! - [`FairLock`]: reentrant and granted in arrival order.
//! - [`ReadWriteLock`]: shared readers, exclusive writer, writer priority.
//!
//! Holds taken without an explicit lease are kept alive by a watchdog until
//! they are unlocked.

pub mod client;
pub mod config;
pub mod fair;
pub mod lease;
pub mod lock;
pub mod metrics;
pub mod mutex;
pub mod rwlock;
pub mod watchdog;
mod wait;

pub use client::LockClient;
pub use config::LockConfig;
pub use fair::{FairKeys, FairLock, WaiterEntry};
pub use lease::{Attempt, LeaseManager, LockKeys, LockRecord, ReleaseOutcome, SharedLeaseManager};
pub use lock::{AcquireOptions, DistributedLock, Lease};
pub use metrics::{LockMetrics, LockMetricsSnapshot, SharedLockMetrics};
pub use mutex::MutexLock;
pub use rwlock::{ReadLock, ReadWriteLock, RwKeys, RwState, WriteLock};
pub use watchdog::{LeaseRenewer, Watchdog, WatchdogRegistry};

pub use latchkey_common::{CoordinationError, OwnerId, Result};
