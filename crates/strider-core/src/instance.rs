//! Instances, tasks, and reservations.
//!
//! An instance is one realization of a run spec with an id that is
//! stable across task restarts. Tasks are incarnations of that instance
//! on an agent; resident instances additionally own a reservation. The
//! transition policy lives in the tracker — this module is the data and
//! the pure predicates on it.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;

use crate::pathid::AbsolutePathId;
use crate::spec::Resources;
use crate::Timestamp;

// ── Identifiers ─────────────────────────────────────────────────────

/// Stable instance identity: survives task restarts.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct InstanceId {
    pub run_spec_id: AbsolutePathId,
    pub nonce: u64,
}

impl InstanceId {
    pub fn new(run_spec_id: AbsolutePathId, nonce: u64) -> Self {
        Self { run_spec_id, nonce }
    }
}

impl fmt::Display for InstanceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.inst-{}", self.run_spec_id.safe_path(), self.nonce)
    }
}

/// Task identity: instance id, task name within the instance (pods run
/// several), and the incarnation counter.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TaskId {
    pub instance_id: InstanceId,
    pub name: String,
    pub incarnation: u64,
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.instance_id, self.name, self.incarnation)
    }
}

// ── Conditions & goals ──────────────────────────────────────────────

/// The instance/task condition ladder.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Condition {
    Scheduled,
    Provisioned,
    Staging,
    Starting,
    Running,
    Killing,
    Killed,
    Finished,
    Failed,
    Error,
    Gone,
    Unreachable,
    UnreachableInactive,
    Dropped,
    Unknown,
}

impl Condition {
    /// Terminal conditions: no further broker updates for this task are
    /// meaningful.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Condition::Killed
                | Condition::Finished
                | Condition::Failed
                | Condition::Error
                | Condition::Gone
                | Condition::Dropped
                | Condition::Unknown
        )
    }

    /// Conditions that consume (or are about to consume) agent resources.
    pub fn is_active(self) -> bool {
        matches!(
            self,
            Condition::Provisioned
                | Condition::Staging
                | Condition::Starting
                | Condition::Running
                | Condition::Killing
                | Condition::Unreachable
        )
    }

    pub fn name(self) -> &'static str {
        match self {
            Condition::Scheduled => "Scheduled",
            Condition::Provisioned => "Provisioned",
            Condition::Staging => "Staging",
            Condition::Starting => "Starting",
            Condition::Running => "Running",
            Condition::Killing => "Killing",
            Condition::Killed => "Killed",
            Condition::Finished => "Finished",
            Condition::Failed => "Failed",
            Condition::Error => "Error",
            Condition::Gone => "Gone",
            Condition::Unreachable => "Unreachable",
            Condition::UnreachableInactive => "UnreachableInactive",
            Condition::Dropped => "Dropped",
            Condition::Unknown => "Unknown",
        }
    }
}

/// What the orchestrator wants for the instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Goal {
    Running,
    /// Keep the record (and reservation) for re-launch.
    Stopped,
    /// Remove the record once the instance reaches a terminal condition.
    Decommissioned,
}

impl Goal {
    pub fn is_terminal(self) -> bool {
        matches!(self, Goal::Stopped | Goal::Decommissioned)
    }

    pub fn name(self) -> &'static str {
        match self {
            Goal::Running => "Running",
            Goal::Stopped => "Stopped",
            Goal::Decommissioned => "Decommissioned",
        }
    }
}

// ── Broker task states ──────────────────────────────────────────────

/// Task states as reported by the resource broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TaskState {
    #[serde(rename = "TASK_STAGING")]
    Staging,
    #[serde(rename = "TASK_STARTING")]
    Starting,
    #[serde(rename = "TASK_RUNNING")]
    Running,
    #[serde(rename = "TASK_KILLING")]
    Killing,
    #[serde(rename = "TASK_FINISHED")]
    Finished,
    #[serde(rename = "TASK_FAILED")]
    Failed,
    #[serde(rename = "TASK_KILLED")]
    Killed,
    #[serde(rename = "TASK_ERROR")]
    Error,
    #[serde(rename = "TASK_LOST")]
    Lost,
    #[serde(rename = "TASK_GONE")]
    Gone,
    #[serde(rename = "TASK_GONE_BY_OPERATOR")]
    GoneByOperator,
    #[serde(rename = "TASK_UNREACHABLE")]
    Unreachable,
    #[serde(rename = "TASK_DROPPED")]
    Dropped,
    #[serde(rename = "TASK_UNKNOWN")]
    Unknown,
}

impl TaskState {
    /// The condition a broker state maps to.
    pub fn to_condition(self) -> Condition {
        match self {
            TaskState::Staging => Condition::Staging,
            TaskState::Starting => Condition::Starting,
            TaskState::Running => Condition::Running,
            TaskState::Killing => Condition::Killing,
            TaskState::Finished => Condition::Finished,
            TaskState::Failed => Condition::Failed,
            TaskState::Killed => Condition::Killed,
            TaskState::Error => Condition::Error,
            TaskState::Lost | TaskState::Gone | TaskState::GoneByOperator => Condition::Gone,
            TaskState::Unreachable => Condition::Unreachable,
            TaskState::Dropped => Condition::Dropped,
            TaskState::Unknown => Condition::Unknown,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            TaskState::Staging => "TASK_STAGING",
            TaskState::Starting => "TASK_STARTING",
            TaskState::Running => "TASK_RUNNING",
            TaskState::Killing => "TASK_KILLING",
            TaskState::Finished => "TASK_FINISHED",
            TaskState::Failed => "TASK_FAILED",
            TaskState::Killed => "TASK_KILLED",
            TaskState::Error => "TASK_ERROR",
            TaskState::Lost => "TASK_LOST",
            TaskState::Gone => "TASK_GONE",
            TaskState::GoneByOperator => "TASK_GONE_BY_OPERATOR",
            TaskState::Unreachable => "TASK_UNREACHABLE",
            TaskState::Dropped => "TASK_DROPPED",
            TaskState::Unknown => "TASK_UNKNOWN",
        }
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

/// Ports and addresses a task was given.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct NetworkInfo {
    pub host_ports: Vec<u16>,
    pub ip_addresses: Vec<String>,
}

/// Last observed status of a task. `state` is absent until the broker
/// reports on the task for the first time.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskStatus {
    pub state: Option<TaskState>,
    pub condition: Condition,
    /// Already clamped to the maximum status message length.
    pub message: String,
    pub network: NetworkInfo,
    pub healthy: Option<bool>,
    pub timestamp: Timestamp,
}

/// One OS-level execution of (part of) an instance on an agent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: TaskId,
    pub status: TaskStatus,
    pub agent_id: String,
}

// ── Agents & reservations ───────────────────────────────────────────

/// Where an instance landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub host: String,
    pub region: Option<String>,
    pub zone: Option<String>,
    pub attributes: HashMap<String, String>,
}

/// Reservation lifecycle on the instance record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReservationState {
    /// Resources reserved, no task yet.
    New,
    /// A task is running on the reserved resources.
    Launched,
    /// Task terminal, reservation retained for re-launch.
    Suspended,
}

/// A durable claim on agent resources, labeled with the owning instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Reservation {
    pub agent_id: String,
    pub state: ReservationState,
    pub resources: Resources,
    /// Persistent-volume ids bound to the reservation.
    pub volume_ids: Vec<String>,
    /// Reservation labels; always includes the owning instance id.
    pub labels: HashMap<String, String>,
}

impl Reservation {
    /// The label under which the owning instance id is recorded.
    pub const INSTANCE_LABEL: &'static str = "strider.instance_id";

    pub fn owner(&self) -> Option<&str> {
        self.labels.get(Self::INSTANCE_LABEL).map(String::as_str)
    }
}

// ── Instances ───────────────────────────────────────────────────────

/// Aggregated instance state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceState {
    pub condition: Condition,
    /// When the condition last changed.
    pub since: Timestamp,
    /// When the instance last became active (launch accepted).
    pub active_since: Option<Timestamp>,
    pub healthy: Option<bool>,
    pub goal: Goal,
}

/// One realization of a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub run_spec_version: Timestamp,
    pub state: InstanceState,
    pub agent: Option<AgentInfo>,
    /// Tasks keyed by task name. One entry for apps; one per pod task.
    pub tasks: BTreeMap<String, Task>,
    pub reservation: Option<Reservation>,
    /// Incarnation counter; embedded into every task id minted for this
    /// instance.
    pub incarnation: u64,
    /// When the instance was (last) scheduled.
    pub scheduled_at: Timestamp,
}

impl Instance {
    /// A freshly scheduled instance: wants to run, owns no tasks yet.
    pub fn scheduled(id: InstanceId, run_spec_version: Timestamp, now: Timestamp) -> Self {
        Self {
            id,
            run_spec_version,
            state: InstanceState {
                condition: Condition::Scheduled,
                since: now,
                active_since: None,
                healthy: None,
                goal: Goal::Running,
            },
            agent: None,
            tasks: BTreeMap::new(),
            reservation: None,
            incarnation: 0,
            scheduled_at: now,
        }
    }

    pub fn run_spec_id(&self) -> &AbsolutePathId {
        &self.id.run_spec_id
    }

    pub fn condition(&self) -> Condition {
        self.state.condition
    }

    pub fn goal(&self) -> Goal {
        self.state.goal
    }

    /// Running and (if the spec health-checks) reported healthy.
    pub fn is_running_and_healthy(&self) -> bool {
        self.state.condition == Condition::Running && self.state.healthy.unwrap_or(true)
    }

    /// Waiting for an offer.
    pub fn is_scheduled(&self) -> bool {
        self.state.condition == Condition::Scheduled
    }

    pub fn is_active(&self) -> bool {
        self.state.condition.is_active()
    }

    /// Terminal condition with goal `Decommissioned` — the record should
    /// be expunged.
    pub fn should_expunge(&self) -> bool {
        self.state.goal == Goal::Decommissioned
            && (self.state.condition.is_terminal() || self.tasks.is_empty())
    }

    /// Whether this instance holds a reservation (is resident).
    pub fn is_reserved(&self) -> bool {
        self.reservation.is_some()
    }

    /// Mint the next task id for the named task, bumping the incarnation.
    pub fn next_task_id(&mut self, task_name: &str) -> TaskId {
        self.incarnation += 1;
        TaskId {
            instance_id: self.id.clone(),
            name: task_name.to_string(),
            incarnation: self.incarnation,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn instance(id: &str) -> Instance {
        Instance::scheduled(
            InstanceId::new(AbsolutePathId::parse(id).unwrap(), 1),
            1000,
            1000,
        )
    }

    #[test]
    fn instance_id_display_is_stable() {
        let id = InstanceId::new(AbsolutePathId::parse("/rt/write").unwrap(), 42);
        assert_eq!(id.to_string(), "rt_write.inst-42");
    }

    #[test]
    fn task_id_embeds_instance_and_incarnation() {
        let mut inst = instance("/svc");
        let t1 = inst.next_task_id("app");
        let t2 = inst.next_task_id("app");
        assert_eq!(t1.to_string(), "svc.inst-1.app.1");
        assert_eq!(t2.to_string(), "svc.inst-1.app.2");
        assert_eq!(inst.incarnation, 2);
    }

    #[test]
    fn terminal_conditions() {
        for c in [
            Condition::Killed,
            Condition::Finished,
            Condition::Failed,
            Condition::Error,
            Condition::Gone,
            Condition::Dropped,
            Condition::Unknown,
        ] {
            assert!(c.is_terminal(), "{c:?} should be terminal");
        }
        for c in [
            Condition::Scheduled,
            Condition::Running,
            Condition::Unreachable,
            Condition::UnreachableInactive,
        ] {
            assert!(!c.is_terminal(), "{c:?} should not be terminal");
        }
    }

    #[test]
    fn task_state_condition_mapping() {
        assert_eq!(TaskState::Staging.to_condition(), Condition::Staging);
        assert_eq!(TaskState::Running.to_condition(), Condition::Running);
        assert_eq!(TaskState::Lost.to_condition(), Condition::Gone);
        assert_eq!(TaskState::GoneByOperator.to_condition(), Condition::Gone);
        assert_eq!(TaskState::Unreachable.to_condition(), Condition::Unreachable);
        assert_eq!(TaskState::Dropped.to_condition(), Condition::Dropped);
        assert_eq!(TaskState::Unknown.to_condition(), Condition::Unknown);
    }

    #[test]
    fn task_state_serde_uses_broker_names() {
        let json = serde_json::to_string(&TaskState::GoneByOperator).unwrap();
        assert_eq!(json, "\"TASK_GONE_BY_OPERATOR\"");
        assert_eq!(TaskState::Running.name(), "TASK_RUNNING");
    }

    #[test]
    fn healthy_defaults_to_true_without_checks() {
        let mut inst = instance("/svc");
        inst.state.condition = Condition::Running;
        assert!(inst.is_running_and_healthy());
        inst.state.healthy = Some(false);
        assert!(!inst.is_running_and_healthy());
    }

    #[test]
    fn expunge_requires_decommissioned_and_terminal() {
        let mut inst = instance("/svc");
        inst.state.goal = Goal::Decommissioned;
        // Scheduled with no tasks: nothing to wait for.
        assert!(inst.should_expunge());

        inst.state.condition = Condition::Running;
        inst.tasks.insert(
            "app".to_string(),
            Task {
                id: TaskId {
                    instance_id: inst.id.clone(),
                    name: "app".to_string(),
                    incarnation: 1,
                },
                status: TaskStatus {
                    state: Some(TaskState::Running),
                    condition: Condition::Running,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                    timestamp: 1000,
                },
                agent_id: "agent-1".to_string(),
            },
        );
        assert!(!inst.should_expunge());

        inst.state.condition = Condition::Killed;
        assert!(inst.should_expunge());
    }

    #[test]
    fn reservation_owner_label() {
        let mut labels = HashMap::new();
        labels.insert(
            Reservation::INSTANCE_LABEL.to_string(),
            "svc.inst-1".to_string(),
        );
        let reservation = Reservation {
            agent_id: "agent-1".to_string(),
            state: ReservationState::New,
            resources: Resources::new(0.1, 32.0, 2.0, 0.0),
            volume_ids: vec!["vol-1".to_string()],
            labels,
        };
        assert_eq!(reservation.owner(), Some("svc.inst-1"));
    }
}
