//! The emitted event vocabulary.
//!
//! Event names on the wire are the `event_type` tags below. Payloads
//! carry semantic identifiers (path ids, task ids, condition names), not
//! internal structs, so consumers never couple to tracker internals.

use serde::{Deserialize, Serialize};
use strider_core::{AbsolutePathId, Timestamp};

/// Condition/goal transition of a single instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstanceChange {
    pub instance_id: String,
    pub run_spec_id: AbsolutePathId,
    pub condition: String,
    pub goal: String,
}

/// Deployment lifecycle stages sharing one payload shape.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeploymentEventKind {
    Info,
    Success,
    Failed,
}

/// Everything the core emits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum Event {
    SchedulerRegisteredEvent {
        framework_id: String,
        master: String,
    },
    SchedulerReregisteredEvent {
        master: String,
    },
    SchedulerDisconnectedEvent,

    DeploymentInfo {
        plan_id: String,
        step: usize,
    },
    DeploymentSuccess {
        plan_id: String,
    },
    DeploymentFailed {
        plan_id: String,
        reason: String,
    },
    DeploymentStepSuccess {
        plan_id: String,
        step: usize,
    },
    DeploymentStepFailure {
        plan_id: String,
        step: usize,
        reason: String,
    },

    /// One per broker status update. `message` arrives already clamped
    /// to the maximum status message length.
    StatusUpdateEvent {
        instance_id: String,
        task_id: String,
        run_spec_id: AbsolutePathId,
        task_state: String,
        message: String,
        host: String,
        timestamp: Timestamp,
    },
    InstanceChangedEvent(InstanceChange),
    InstanceHealthChangedEvent {
        instance_id: String,
        run_spec_id: AbsolutePathId,
        healthy: bool,
    },
    UnhealthyInstanceKillEvent {
        instance_id: String,
        run_spec_id: AbsolutePathId,
    },
    FrameworkMessageEvent {
        agent_id: String,
        payload: Vec<u8>,
    },
}

impl Event {
    /// The wire name of the event, e.g. `deployment_success`.
    pub fn name(&self) -> &'static str {
        match self {
            Event::SchedulerRegisteredEvent { .. } => "scheduler_registered_event",
            Event::SchedulerReregisteredEvent { .. } => "scheduler_reregistered_event",
            Event::SchedulerDisconnectedEvent => "scheduler_disconnected_event",
            Event::DeploymentInfo { .. } => "deployment_info",
            Event::DeploymentSuccess { .. } => "deployment_success",
            Event::DeploymentFailed { .. } => "deployment_failed",
            Event::DeploymentStepSuccess { .. } => "deployment_step_success",
            Event::DeploymentStepFailure { .. } => "deployment_step_failure",
            Event::StatusUpdateEvent { .. } => "status_update_event",
            Event::InstanceChangedEvent(_) => "instance_changed_event",
            Event::InstanceHealthChangedEvent { .. } => "instance_health_changed_event",
            Event::UnhealthyInstanceKillEvent { .. } => "unhealthy_instance_kill_event",
            Event::FrameworkMessageEvent { .. } => "framework_message_event",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_type_tag_matches_name() {
        let event = Event::DeploymentSuccess {
            plan_id: "plan-1".to_string(),
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event_type"], event.name());
    }

    #[test]
    fn status_update_serializes_roundtrip() {
        let event = Event::StatusUpdateEvent {
            instance_id: "svc.i1".to_string(),
            task_id: "svc.i1.1".to_string(),
            run_spec_id: AbsolutePathId::parse("/svc").unwrap(),
            task_state: "TASK_RUNNING".to_string(),
            message: "started".to_string(),
            host: "agent-1".to_string(),
            timestamp: 1000,
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: Event = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
