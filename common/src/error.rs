//! Error types for latchkey coordination primitives.

use std::time::Duration;

use thiserror::Error;

use crate::OwnerId;

/// Main error type for lock and rate limiter operations.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CoordinationError {
    /// The wait budget ran out before the lock or permits were granted.
    #[error("Acquisition of {key} timed out after {waited:?}")]
    AcquisitionTimeout { key: String, waited: Duration },

    /// Release or renewal attempted by an owner that does not hold the lock.
    #[error("{owner} does not hold {key}")]
    NotOwner { key: String, owner: OwnerId },

    /// Write acquisition attempted while holding only the read lock.
    #[error("{owner} holds a read lock on {key}; acquiring the write lock would deadlock")]
    WouldDeadlock { key: String, owner: OwnerId },

    /// The shared store could not be reached.
    #[error("Store unavailable: {0}")]
    StoreUnavailable(String),

    /// The wait was cancelled by the caller.
    #[error("Acquisition of {key} was cancelled")]
    Cancelled { key: String },

    /// Caller supplied an argument that can never succeed.
    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    /// A stored value could not be decoded.
    #[error("Corrupt state at {key}: {reason}")]
    CorruptState { key: String, reason: String },
}

impl CoordinationError {
    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            CoordinationError::AcquisitionTimeout { .. } | CoordinationError::StoreUnavailable(_)
        )
    }

    /// Check if this error is the declared timeout outcome.
    pub fn is_timeout(&self) -> bool {
        matches!(self, CoordinationError::AcquisitionTimeout { .. })
    }

    /// Get error code for callers that surface errors over a wire.
    pub fn error_code(&self) -> &'static str {
        match self {
            CoordinationError::AcquisitionTimeout { .. } => "ACQUISITION_TIMEOUT",
            CoordinationError::NotOwner { .. } => "NOT_OWNER",
            CoordinationError::WouldDeadlock { .. } => "WOULD_DEADLOCK",
            CoordinationError::StoreUnavailable(_) => "STORE_UNAVAILABLE",
            CoordinationError::Cancelled { .. } => "CANCELLED",
            CoordinationError::InvalidArgument(_) => "INVALID_ARGUMENT",
            CoordinationError::CorruptState { .. } => "CORRUPT_STATE",
        }
    }
}

/// Result type alias for coordination operations.
pub type Result<T> = std::result::Result<T, CoordinationError>;
