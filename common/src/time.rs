//! Time utilities and constants for latchkey.

use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use tokio::time::Instant;

/// Protocol timing constants.
pub mod constants {
    use std::time::Duration;

    /// Lease used when the caller asks for no explicit lease (30 seconds).
    pub const DEFAULT_WATCHDOG_TIMEOUT: Duration = Duration::from_secs(30);

    /// The watchdog renews this many times per lease period.
    pub const DEFAULT_RENEWAL_DIVISOR: u32 = 3;

    /// First retry delay of a contended acquisition (10 milliseconds).
    pub const MIN_RETRY_BACKOFF: Duration = Duration::from_millis(10);

    /// Upper bound on a single retry delay (500 milliseconds).
    pub const MAX_RETRY_BACKOFF: Duration = Duration::from_millis(500);

    /// How long a fair-lock waiter survives without polling (5 seconds).
    pub const DEFAULT_FAIR_WAITER_TTL: Duration = Duration::from_secs(5);
}

/// A timestamp with timezone (always UTC).
pub type Timestamp = DateTime<Utc>;

/// Get the current timestamp.
pub fn now() -> Timestamp {
    Utc::now()
}

/// Convert store-clock milliseconds since the Unix epoch into a timestamp.
pub fn from_unix_ms(ms: u64) -> Timestamp {
    Utc.timestamp_millis_opt(ms as i64)
        .single()
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH)
}

/// Duration to whole milliseconds, saturating.
pub fn as_millis(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Point in time after which a wait gives up.
///
/// `None` budget means wait forever.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    started: Instant,
    at: Option<Instant>,
}

impl Deadline {
    /// Create a deadline `budget` from now.
    pub fn after(budget: Option<Duration>) -> Self {
        let started = Instant::now();
        Self {
            started,
            at: budget.map(|b| started + b),
        }
    }

    /// A deadline that never passes.
    pub fn never() -> Self {
        Self::after(None)
    }

    /// Check if the deadline has passed.
    pub fn is_exceeded(&self) -> bool {
        match self.at {
            Some(at) => Instant::now() >= at,
            None => false,
        }
    }

    /// Remaining time, `None` when unbounded.
    pub fn remaining(&self) -> Option<Duration> {
        self.at.map(|at| at.saturating_duration_since(Instant::now()))
    }

    /// Time spent since the deadline was created.
    pub fn elapsed(&self) -> Duration {
        self.started.elapsed()
    }

    /// Clamp a proposed sleep so it does not overshoot the deadline.
    pub fn clamp(&self, wait: Duration) -> Duration {
        match self.remaining() {
            Some(remaining) => wait.min(remaining),
            None => wait,
        }
    }
}
