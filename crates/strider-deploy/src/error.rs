//! Deployment error types.

use thiserror::Error;

/// Result type alias for deployment operations.
pub type DeployResult<T> = Result<T, DeployError>;

/// Errors surfaced by the deployment executor.
#[derive(Debug, Error)]
pub enum DeployError {
    /// Another plan holds a lock on an affected run spec. Retryable once
    /// that plan finishes, or override with force.
    #[error("deployment {holder} already locks {run_spec}")]
    Conflict { holder: String, run_spec: String },

    #[error("deployment {plan_id} step {step} failed: {reason}")]
    StepFailed {
        plan_id: String,
        step: usize,
        reason: String,
    },

    #[error("deployment {0} cancelled by an overriding plan")]
    Cancelled(String),

    #[error("deployment not found: {0}")]
    NotFound(String),

    #[error("tracker error: {0}")]
    Tracker(#[from] strider_tracker::TrackerError),

    #[error("state store error: {0}")]
    State(#[from] strider_state::StateError),
}
