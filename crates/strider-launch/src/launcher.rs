//! Translation of matches into broker operations.
//!
//! Pure builders: the scheduler adapter records `Provisioned` intent in
//! the tracker first, then sends the operations built here in a single
//! accept, and reverts the tracker on send failure.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use strider_core::instance::Instance;
use strider_core::spec::RunSpec;
use strider_core::Resources;

/// Operations sent to the broker inside an accept call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum LaunchOperation {
    /// Claim resources on the agent under the reservation labels.
    Reserve {
        resources: Resources,
        labels: HashMap<String, String>,
    },
    /// Carve a persistent volume out of reserved disk.
    CreateVolume {
        volume_id: String,
        container_path: String,
        size_mib: u64,
        labels: HashMap<String, String>,
    },
    /// Launch the instance's tasks on the agent.
    Launch {
        instance_id: String,
        task_ids: Vec<String>,
        agent_id: String,
        resources: Resources,
    },
    /// Give reserved resources back.
    Unreserve {
        resources: Resources,
        labels: HashMap<String, String>,
    },
    /// Destroy a persistent volume before unreserving its disk.
    DestroyVolume { volume_id: String },
}

/// The launch operation for a provisioned instance. For resident
/// launches the resources are the reserved ones; reserve/create-volume
/// operations, when needed, come from the reservation manager and
/// precede this in the same accept.
pub fn launch_operations(spec: &RunSpec, instance: &Instance) -> Vec<LaunchOperation> {
    let agent_id = instance
        .agent
        .as_ref()
        .map(|a| a.agent_id.clone())
        .unwrap_or_default();
    let resources = match &instance.reservation {
        Some(reservation) => reservation.resources,
        None => spec.resources,
    };
    vec![LaunchOperation::Launch {
        instance_id: instance.id.to_string(),
        task_ids: instance.tasks.values().map(|t| t.id.to_string()).collect(),
        agent_id,
        resources,
    }]
}
