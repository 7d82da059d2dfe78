//! Tracker error types.

use thiserror::Error;

/// Result type alias for tracker operations.
pub type TrackerResult<T> = Result<T, TrackerError>;

/// Errors surfaced by the instance tracker.
#[derive(Debug, Error)]
pub enum TrackerError {
    /// The update mailbox is at capacity; the operation was dropped.
    #[error("tracker update queue full, dropped operation for {0}")]
    QueueFull(String),

    /// Deadline expired. The operation, once accepted, still runs.
    #[error("tracker operation timed out after {0} ms")]
    Timeout(u64),

    #[error("instance not found: {0}")]
    NotFound(String),

    /// Invariant violated — the leader must fail-stop.
    #[error("inconsistent tracker state: {0}")]
    InconsistentState(String),

    /// The writer task is gone; the process is shutting down.
    #[error("tracker stopped")]
    Stopped,

    #[error("state store error: {0}")]
    State(#[from] strider_state::StateError),
}
