//! Domain model for the Strider orchestrator.
//!
//! Everything the rest of the workspace agrees on lives here: path
//! identifiers, run specs (apps and pods), the group tree, placement
//! constraints, upgrade and unreachable strategies, volumes and
//! residency, validation, and the recognized configuration surface.

pub mod config;
pub mod constraint;
pub mod deployment;
pub mod group;
pub mod instance;
pub mod pathid;
pub mod spec;
pub mod validation;

pub use config::SchedulerConfig;
pub use constraint::{Constraint, ConstraintField, ConstraintOperator};
pub use deployment::{DeploymentAction, DeploymentPlan, DeploymentStep};
pub use group::{Group, RootGroup};
pub use instance::{
    AgentInfo, Condition, Goal, Instance, InstanceId, InstanceState, NetworkInfo, Reservation,
    ReservationState, Task, TaskId, TaskState, TaskStatus,
};
pub use pathid::AbsolutePathId;
pub use spec::{
    AppSpec, BackoffSpec, FetchUri, HealthCheckSpec, KillSelection, PodSpec, Residency,
    Resources, RunSpec, TaskLostBehavior, UnreachableStrategy, UpgradeStrategy, VolumeSpec,
    Workload,
};
pub use validation::{ValidationError, Violation};

/// Epoch milliseconds. Used for spec versions and instance timestamps.
pub type Timestamp = u64;

/// Status-update messages are clamped to this many characters before any
/// downstream consumer (event stream, persistence) sees them.
pub const MAX_STATUS_MESSAGE_LENGTH: usize = 120;

/// Current wall clock as epoch milliseconds.
pub fn now_millis() -> Timestamp {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}
