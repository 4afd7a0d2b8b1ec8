//! Latchkey Rate Limiter
//!
//! Token buckets kept in a shared [`AtomicStore`](latchkey_store::AtomicStore).
//! Refill and debit happen in one store script per request, so the permits
//! granted across every process never exceed `capacity + rate * elapsed`.

pub mod bucket;
pub mod config;
pub mod metrics;
pub mod rate_limiter;

pub use bucket::{RateLimiterState, Take};
pub use config::RateLimiterConfig;
pub use metrics::{LimiterMetrics, LimiterMetricsSnapshot, SharedLimiterMetrics};
pub use rate_limiter::{RateLimiter, RateLimiterManager};
