//! Store key layout.
//!
//! Every lock and limiter name maps onto a fixed set of keys under a shared
//! prefix so independent deployments can share one store.

/// Default prefix for all keys.
pub const DEFAULT_PREFIX: &str = "latchkey";

/// Key namespace for one deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeySpace {
    prefix: String,
}

impl KeySpace {
    /// Create a key space with the given prefix.
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
        }
    }

    /// Get the prefix.
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Lock record of a mutex.
    pub fn lock(&self, name: &str) -> String {
        format!("{}:lock:{}", self.prefix, name)
    }

    /// Lock record of a fair lock, apart from any mutex of the same name.
    pub fn fair_lock(&self, name: &str) -> String {
        format!("{}:fair:{}:lock", self.prefix, name)
    }

    /// Release notification channel of a fair lock.
    pub fn fair_signal(&self, name: &str) -> String {
        format!("{}:fair:{}:signal", self.prefix, name)
    }

    /// Waiter queue of a fair lock.
    pub fn fair_queue(&self, name: &str) -> String {
        format!("{}:fair:{}:queue", self.prefix, name)
    }

    /// Waiter sequence counter of a fair lock.
    pub fn fair_sequence(&self, name: &str) -> String {
        format!("{}:fair:{}:seq", self.prefix, name)
    }

    /// Shared state of a read-write lock.
    pub fn rwlock(&self, name: &str) -> String {
        format!("{}:rwlock:{}", self.prefix, name)
    }

    /// Token bucket state of a rate limiter.
    pub fn limiter(&self, name: &str) -> String {
        format!("{}:limiter:{}", self.prefix, name)
    }

    /// Release notification channel for a lock name.
    pub fn signal(&self, name: &str) -> String {
        format!("{}:signal:{}", self.prefix, name)
    }
}

impl Default for KeySpace {
    fn default() -> Self {
        Self::new(DEFAULT_PREFIX)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_layout() {
        let keys = KeySpace::default();
        assert_eq!(keys.lock("orders"), "latchkey:lock:orders");
        assert_eq!(keys.fair_lock("orders"), "latchkey:fair:orders:lock");
        assert_eq!(keys.fair_signal("orders"), "latchkey:fair:orders:signal");
        assert_eq!(keys.fair_queue("orders"), "latchkey:fair:orders:queue");
        assert_eq!(keys.fair_sequence("orders"), "latchkey:fair:orders:seq");
        assert_eq!(keys.rwlock("orders"), "latchkey:rwlock:orders");
        assert_eq!(keys.limiter("api"), "latchkey:limiter:api");
        assert_eq!(keys.signal("orders"), "latchkey:signal:orders");
    }

    #[test]
    fn test_custom_prefix() {
        let keys = KeySpace::new("staging");
        assert_eq!(keys.lock("a"), "staging:lock:a");
    }
}
