//! Deployment planning and execution.
//!
//! The planner diffs two root groups into an ordered plan of steps; the
//! executor drives a plan against the tracker and launch queue, holding
//! locks on the affected run specs and gating on health capacity.

mod error;
mod executor;
mod plan;

pub use error::{DeployError, DeployResult};
pub use executor::{
    DeploymentExecutor, DeploymentStatus, ExecutorConfig, InstanceKiller,
};
pub use plan::{plan_deployment, restart_batch, select_victims, RestartBatch, SpecChange};
