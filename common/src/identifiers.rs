//! Identifier types for lock owners and client processes.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a client process talking to the store.
/// Uses UUID v4 so independently started processes never collide.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ClientId(Uuid);

impl ClientId {
    /// Create a new random client ID.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create from an existing UUID.
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Parse from string.
    pub fn parse(s: &str) -> Result<Self, uuid::Error> {
        Ok(Self(Uuid::parse_str(s)?))
    }

    /// Get the underlying UUID.
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }

    /// Build the owner identity for a task or thread inside this process.
    pub fn owner(&self, local: impl fmt::Display) -> OwnerId {
        OwnerId::composite(self, local)
    }
}

impl Default for ClientId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identity of a lock owner.
///
/// Reentrancy is keyed on this value: two calls carrying the same `OwnerId`
/// are the same logical owner no matter which task or thread issues them.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct OwnerId(String);

impl OwnerId {
    /// Create an owner ID from an arbitrary string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Create the `client:local` composite identity.
    pub fn composite(client: &ClientId, local: impl fmt::Display) -> Self {
        Self(format!("{}:{}", client, local))
    }

    /// Get the ID as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Validate the owner ID format.
    pub fn is_valid(&self) -> bool {
        !self.0.is_empty() && self.0.len() <= 256 && !self.0.chars().any(char::is_whitespace)
    }
}

impl fmt::Display for OwnerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for OwnerId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for OwnerId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_id_creation() {
        let id1 = ClientId::new();
        let id2 = ClientId::new();
        assert_ne!(id1, id2);
    }

    #[test]
    fn test_client_id_parse() {
        let uuid_str = "6f1c2a1e-9d6b-4c1e-8a41-0b5b7a9f1c3d";
        let id = ClientId::parse(uuid_str).unwrap();
        assert_eq!(id.to_string(), uuid_str);
    }

    #[test]
    fn test_composite_owner() {
        let client = ClientId::parse("6f1c2a1e-9d6b-4c1e-8a41-0b5b7a9f1c3d").unwrap();
        let owner = client.owner(7);
        assert_eq!(owner.as_str(), "6f1c2a1e-9d6b-4c1e-8a41-0b5b7a9f1c3d:7");
        assert_eq!(owner, OwnerId::composite(&client, 7));
    }

    #[test]
    fn test_owner_id_validation() {
        assert!(OwnerId::new("worker-1").is_valid());
        assert!(!OwnerId::new("").is_valid());
        assert!(!OwnerId::new("has space").is_valid());
    }
}
