//! Deployment plans as data.
//!
//! A plan is the diff between two root groups, materialized as an
//! ordered list of steps. Actions within one step touch disjoint run
//! specs and may execute concurrently; steps execute in order. Plans are
//! serialized as-is, so a fresh leader can resume one by re-reading it.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

use crate::pathid::AbsolutePathId;
use crate::spec::RunSpec;
use crate::Timestamp;

/// One action of a deployment step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum DeploymentAction {
    /// Bring a new run spec into existence and scale it up.
    StartApplication { run_spec: RunSpec },
    /// Change only the instance count.
    ScaleApplication { run_spec: RunSpec, to: u32 },
    /// Replace all instances with the new spec version, gated by the
    /// upgrade strategy.
    RestartApplication { run_spec: RunSpec },
    /// Kill all instances and drop the spec.
    StopApplication { run_spec: RunSpec },
}

impl DeploymentAction {
    pub fn run_spec(&self) -> &RunSpec {
        match self {
            DeploymentAction::StartApplication { run_spec }
            | DeploymentAction::ScaleApplication { run_spec, .. }
            | DeploymentAction::RestartApplication { run_spec }
            | DeploymentAction::StopApplication { run_spec } => run_spec,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DeploymentAction::StartApplication { .. } => "start",
            DeploymentAction::ScaleApplication { .. } => "scale",
            DeploymentAction::RestartApplication { .. } => "restart",
            DeploymentAction::StopApplication { .. } => "stop",
        }
    }
}

/// A set of mutually independent actions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentStep {
    pub actions: Vec<DeploymentAction>,
}

/// The ordered plan moving the cluster from one root to another.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeploymentPlan {
    pub id: String,
    /// Version of the root the plan was computed against.
    pub original_version: Timestamp,
    /// Version of the root the plan drives toward.
    pub target_version: Timestamp,
    pub steps: Vec<DeploymentStep>,
}

impl DeploymentPlan {
    /// Run-spec ids this plan touches; these are the plan's locks.
    pub fn affected_run_spec_ids(&self) -> BTreeSet<AbsolutePathId> {
        self.steps
            .iter()
            .flat_map(|s| s.actions.iter())
            .map(|a| a.run_spec().id.clone())
            .collect()
    }

    /// True when the plan changes nothing.
    pub fn is_empty(&self) -> bool {
        self.steps.iter().all(|s| s.actions.is_empty())
    }

    /// Whether two plans contend for any run spec.
    pub fn conflicts_with(&self, other: &DeploymentPlan) -> bool {
        let mine = self.affected_run_spec_ids();
        other
            .affected_run_spec_ids()
            .iter()
            .any(|id| mine.contains(id))
    }
}
