//! Driver error types.

use thiserror::Error;

/// Result type alias for driver operations.
pub type DriverResult<T> = Result<T, DriverError>;

/// Errors surfaced by the scheduler adapter and broker driver.
#[derive(Debug, Error)]
pub enum DriverError {
    /// The broker call failed but may succeed on retry.
    #[error("transient broker error: {0}")]
    TransientBroker(String),

    /// A callback arrived while not leading; the action was refused.
    #[error("not the elected leader")]
    NotLeader,

    #[error("tracker error: {0}")]
    Tracker(#[from] strider_tracker::TrackerError),

    #[error("state store error: {0}")]
    State(#[from] strider_state::StateError),
}
