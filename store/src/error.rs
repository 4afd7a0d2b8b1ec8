//! Store error types.

use latchkey_common::CoordinationError;
use thiserror::Error;

/// Errors raised by an [`AtomicStore`](crate::AtomicStore).
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// The store could not be reached or refused the operation.
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A script was invoked with malformed keys or arguments.
    #[error("Script {script} rejected its input: {reason}")]
    Script { script: String, reason: String },

    /// A stored value could not be decoded by a script.
    #[error("Corrupt value at {key}: {reason}")]
    Corrupt { key: String, reason: String },
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

impl From<StoreError> for CoordinationError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Unavailable(reason) => CoordinationError::StoreUnavailable(reason),
            StoreError::Script { script, reason } => {
                CoordinationError::InvalidArgument(format!("{}: {}", script, reason))
            }
            StoreError::Corrupt { key, reason } => CoordinationError::CorruptState { key, reason },
        }
    }
}
