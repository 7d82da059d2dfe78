//! The reservation manager.
//!
//! Resident instances own a reservation on one agent: resources plus
//! persistent volumes, labeled with the instance id. This module builds
//! the reserve/release operation sequences and decides when a lost
//! resident task escalates to a relaunch elsewhere.

use std::collections::HashMap;

use tracing::debug;

use strider_core::instance::{Instance, InstanceId, Reservation, ReservationState};
use strider_core::spec::{Residency, RunSpec, TaskLostBehavior, VolumeSpec};
use strider_core::Timestamp;

use crate::launcher::LaunchOperation;

fn reservation_labels(instance_id: &InstanceId) -> HashMap<String, String> {
    let mut labels = HashMap::new();
    labels.insert(
        Reservation::INSTANCE_LABEL.to_string(),
        instance_id.to_string(),
    );
    labels
}

/// Build the reservation record and the reserve + create-volume
/// operations for a fresh resident launch. The returned reservation is
/// recorded on the instance before the accept goes out.
pub fn reserve_operations(
    spec: &RunSpec,
    instance_id: &InstanceId,
    agent_id: &str,
) -> (Reservation, Vec<LaunchOperation>) {
    let labels = reservation_labels(instance_id);
    let resources = spec.total_resources();

    let mut operations = vec![LaunchOperation::Reserve {
        resources,
        labels: labels.clone(),
    }];
    let mut volume_ids = Vec::new();
    for (index, volume) in spec.volumes.iter().enumerate() {
        if let VolumeSpec::Persistent {
            container_path,
            size_mib,
        } = volume
        {
            let volume_id = format!("{instance_id}-vol-{index}");
            operations.push(LaunchOperation::CreateVolume {
                volume_id: volume_id.clone(),
                container_path: container_path.clone(),
                size_mib: *size_mib,
                labels: labels.clone(),
            });
            volume_ids.push(volume_id);
        }
    }

    let reservation = Reservation {
        agent_id: agent_id.to_string(),
        state: ReservationState::New,
        resources,
        volume_ids,
        labels,
    };
    debug!(instance = %instance_id, agent = agent_id, "reservation prepared");
    (reservation, operations)
}

/// Build the destroy-volume + unreserve sequence that releases a
/// decommissioned instance's reservation. Volumes go first; disk cannot
/// be unreserved while a volume still occupies it.
pub fn release_operations(instance: &Instance) -> Vec<LaunchOperation> {
    let Some(reservation) = &instance.reservation else {
        return Vec::new();
    };
    let mut operations: Vec<LaunchOperation> = reservation
        .volume_ids
        .iter()
        .map(|volume_id| LaunchOperation::DestroyVolume {
            volume_id: volume_id.clone(),
        })
        .collect();
    operations.push(LaunchOperation::Unreserve {
        resources: reservation.resources,
        labels: reservation.labels.clone(),
    });
    operations
}

/// Whether a resident instance whose agent is lost should give up on
/// its reservation and relaunch elsewhere.
pub fn relaunch_elsewhere_due(residency: &Residency, lost_since: Timestamp, now: Timestamp) -> bool {
    match residency.task_lost_behavior {
        TaskLostBehavior::WaitForever => false,
        TaskLostBehavior::RelaunchAfterTimeout => {
            now >= lost_since + residency.relaunch_escalation_timeout_secs * 1000
        }
    }
}
