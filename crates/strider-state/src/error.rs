//! Error types for the state store.

use thiserror::Error;

/// Result type alias for state store operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during state store operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to open database: {0}")]
    Open(String),

    #[error("transaction error: {0}")]
    Transaction(String),

    #[error("table error: {0}")]
    Table(String),

    #[error("read error: {0}")]
    Read(String),

    #[error("write error: {0}")]
    Write(String),

    #[error("serialization error: {0}")]
    Serialize(String),

    #[error("deserialization error: {0}")]
    Deserialize(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("version conflict on {key}: expected {expected:?}, found {actual:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        actual: Option<u64>,
    },
}

impl StateError {
    /// Conflicts are retryable; everything else is not.
    pub fn is_retryable(&self) -> bool {
        matches!(self, StateError::Conflict { .. })
    }
}
