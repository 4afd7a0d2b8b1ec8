//! Simulation scenarios.

use serde::{Deserialize, Serialize};

/// What a scenario exercises.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ScenarioKind {
    /// Workers hammer one mutex; no two may hold it at once.
    MutexContention,
    /// Workers queue on a fair lock; grants must follow arrival order.
    FairOrder,
    /// Readers and writers share a read-write lock.
    ReadWrite,
    /// Workers draw from one token bucket; grants must stay within budget.
    RateLimit,
    /// A holder vanishes without unlocking; its lease must free the lock.
    LeaseExpiry,
}

/// A simulation scenario.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Scenario {
    /// Scenario name.
    pub name: String,
    /// Description.
    pub description: String,
    pub kind: ScenarioKind,
}

impl Scenario {
    /// Load a scenario by name.
    pub fn load(name: &str) -> anyhow::Result<Self> {
        Self::all()
            .into_iter()
            .find(|s| s.name == name)
            .ok_or_else(|| anyhow::anyhow!("Unknown scenario: {}", name))
    }

    /// Every built-in scenario.
    pub fn all() -> Vec<Self> {
        vec![
            Self::new(
                "mutex-contention",
                "Concurrent workers in separate clients contend for one mutex",
                ScenarioKind::MutexContention,
            ),
            Self::new(
                "fair-order",
                "Workers queue on a fair lock and must be served first come, first served",
                ScenarioKind::FairOrder,
            ),
            Self::new(
                "read-write",
                "Readers share a read-write lock while writers take it exclusively",
                ScenarioKind::ReadWrite,
            ),
            Self::new(
                "rate-limit",
                "Workers drain one token bucket faster than it refills",
                ScenarioKind::RateLimit,
            ),
            Self::new(
                "lease-expiry",
                "A holder disappears and another worker takes over after the lease",
                ScenarioKind::LeaseExpiry,
            ),
        ]
    }

    fn new(name: &str, description: &str, kind: ScenarioKind) -> Self {
        Self {
            name: name.to_string(),
            description: description.to_string(),
            kind,
        }
    }
}
