//! Lock configuration.

use std::time::Duration;

use latchkey_common::constants;
use latchkey_common::DEFAULT_PREFIX;

/// Configuration shared by every lock handed out by one client.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Lease used when the caller does not pick one; kept alive by the watchdog.
    pub watchdog_timeout: Duration,
    /// The watchdog renews every `watchdog_timeout / renewal_divisor`.
    pub renewal_divisor: u32,
    /// First delay between contended attempts.
    pub retry_min_backoff: Duration,
    /// Upper bound on a single delay between contended attempts.
    pub retry_max_backoff: Duration,
    /// Lifetime of a fair-lock waiter or pending writer that stops polling.
    pub waiter_ttl: Duration,
    /// Namespace prefix for store keys.
    pub key_prefix: String,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            watchdog_timeout: constants::DEFAULT_WATCHDOG_TIMEOUT,
            renewal_divisor: constants::DEFAULT_RENEWAL_DIVISOR,
            retry_min_backoff: constants::MIN_RETRY_BACKOFF,
            retry_max_backoff: constants::MAX_RETRY_BACKOFF,
            waiter_ttl: constants::DEFAULT_FAIR_WAITER_TTL,
            key_prefix: DEFAULT_PREFIX.to_string(),
        }
    }
}

impl LockConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(ms) = env_millis("LATCHKEY_WATCHDOG_TIMEOUT_MS") {
            config.watchdog_timeout = ms;
        }

        if let Some(ms) = env_millis("LATCHKEY_RETRY_MAX_BACKOFF_MS") {
            config.retry_max_backoff = ms;
        }

        if let Some(ms) = env_millis("LATCHKEY_FAIR_WAITER_TTL_MS") {
            config.waiter_ttl = ms;
        }

        if let Ok(prefix) = std::env::var("LATCHKEY_KEY_PREFIX") {
            config.key_prefix = prefix;
        }

        config
    }

    /// Interval between watchdog renewals.
    pub fn renewal_interval(&self) -> Duration {
        self.watchdog_timeout / self.renewal_divisor.max(1)
    }

    /// Validate configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.watchdog_timeout.is_zero() {
            return Err("Watchdog timeout cannot be zero".to_string());
        }

        if self.renewal_divisor < 2 {
            return Err("Renewal divisor must be at least 2".to_string());
        }

        if self.retry_min_backoff.is_zero() || self.retry_min_backoff > self.retry_max_backoff {
            return Err("Retry backoff must satisfy 0 < min <= max".to_string());
        }

        if self.waiter_ttl <= self.retry_max_backoff {
            return Err("Waiter TTL must exceed the maximum retry backoff".to_string());
        }

        if self.key_prefix.is_empty() {
            return Err("Key prefix cannot be empty".to_string());
        }

        Ok(())
    }
}

fn env_millis(name: &str) -> Option<Duration> {
    std::env::var(name)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = LockConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.renewal_interval(), Duration::from_secs(10));
    }

    #[test]
    fn test_invalid_config() {
        let mut config = LockConfig::default();
        config.waiter_ttl = config.retry_max_backoff;
        assert!(config.validate().is_err());

        let mut config = LockConfig::default();
        config.renewal_divisor = 1;
        assert!(config.validate().is_err());
    }
}
