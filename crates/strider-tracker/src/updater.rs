//! State computation — the pure part of the tracker.
//!
//! Given the current record of an instance and one operation, compute
//! the effect: an updated record, an expunge, or nothing. No I/O here;
//! the writer task owns persistence and event publication.

use strider_core::instance::{
    AgentInfo, Condition, Goal, Instance, InstanceId, NetworkInfo, Reservation,
    ReservationState, Task, TaskId, TaskState, TaskStatus,
};
use strider_core::{Timestamp, MAX_STATUS_MESSAGE_LENGTH};
use strider_events::{Event, InstanceChange};

use crate::error::{TrackerError, TrackerResult};

/// A broker status update, as handed to the tracker.
#[derive(Debug, Clone)]
pub struct StatusUpdate {
    pub state: TaskState,
    pub message: String,
    pub network: NetworkInfo,
    pub healthy: Option<bool>,
}

/// Operations the tracker serializes.
#[derive(Debug, Clone)]
pub enum Op {
    /// Create a new instance record awaiting resources.
    Schedule { instance: Instance },
    /// Record launch intent: agent chosen, tasks minted, accept not yet
    /// sent. Bumps the incarnation.
    Provision {
        instance_id: InstanceId,
        agent: AgentInfo,
        task_names: Vec<String>,
        now: Timestamp,
    },
    /// Attach a fresh reservation to a resident instance.
    Reserve {
        instance_id: InstanceId,
        reservation: Reservation,
        now: Timestamp,
    },
    /// A task status update from the broker.
    BrokerUpdate {
        task_id: TaskId,
        update: StatusUpdate,
        now: Timestamp,
    },
    /// Change what the orchestrator wants for the instance.
    SetGoal {
        instance_id: InstanceId,
        goal: Goal,
        now: Timestamp,
    },
    /// Promote an unreachable instance to inactive (reaper only).
    MarkUnreachableInactive {
        instance_id: InstanceId,
        now: Timestamp,
    },
    /// Drop the record unconditionally.
    ForceExpunge { instance_id: InstanceId },
    /// Restore a snapshot (launcher revert path).
    RevertTo { instance: Instance },
}

impl Op {
    /// The instance the operation addresses — the sequencing key.
    pub fn instance_id(&self) -> &InstanceId {
        match self {
            Op::Schedule { instance } | Op::RevertTo { instance } => &instance.id,
            Op::Provision { instance_id, .. }
            | Op::Reserve { instance_id, .. }
            | Op::SetGoal { instance_id, .. }
            | Op::MarkUnreachableInactive { instance_id, .. }
            | Op::ForceExpunge { instance_id } => instance_id,
            Op::BrokerUpdate { task_id, .. } => &task_id.instance_id,
        }
    }
}

/// What an applied operation did.
#[derive(Debug, Clone)]
pub enum Effect {
    Update {
        instance: Instance,
        previous: Option<Instance>,
        events: Vec<Event>,
    },
    Expunge {
        instance: Instance,
        events: Vec<Event>,
    },
    Noop,
}

impl Effect {
    pub fn is_noop(&self) -> bool {
        matches!(self, Effect::Noop)
    }
}

/// Clamp a status message to the maximum length every downstream
/// consumer may rely on.
pub fn clamp_message(message: &str) -> String {
    message.chars().take(MAX_STATUS_MESSAGE_LENGTH).collect()
}

fn instance_changed(instance: &Instance) -> Event {
    Event::InstanceChangedEvent(InstanceChange {
        instance_id: instance.id.to_string(),
        run_spec_id: instance.run_spec_id().clone(),
        condition: instance.condition().name().to_string(),
        goal: instance.goal().name().to_string(),
    })
}

/// Aggregate the instance condition from its tasks. All-running wins
/// only when every task runs; otherwise the most severe task condition
/// dominates.
fn aggregate_condition(instance: &Instance) -> Condition {
    const SEVERITY: [Condition; 14] = [
        Condition::Error,
        Condition::Failed,
        Condition::Gone,
        Condition::Dropped,
        Condition::Unknown,
        Condition::Unreachable,
        Condition::UnreachableInactive,
        Condition::Killing,
        Condition::Killed,
        Condition::Finished,
        Condition::Staging,
        Condition::Starting,
        Condition::Provisioned,
        Condition::Scheduled,
    ];
    let conditions: Vec<Condition> = instance
        .tasks
        .values()
        .map(|t| t.status.condition)
        .collect();
    if conditions.is_empty() {
        return instance.condition();
    }
    if conditions.iter().all(|c| *c == Condition::Running) {
        return Condition::Running;
    }
    for severity in SEVERITY {
        if conditions.contains(&severity) {
            return severity;
        }
    }
    Condition::Running
}

/// Apply one operation against the current record. Pure: the caller
/// persists and publishes.
pub fn apply(current: Option<&Instance>, op: Op) -> TrackerResult<Effect> {
    match op {
        Op::Schedule { instance } => {
            if current.is_some() {
                return Ok(Effect::Noop);
            }
            let events = vec![instance_changed(&instance)];
            Ok(Effect::Update {
                instance,
                previous: None,
                events,
            })
        }

        Op::Provision {
            instance_id,
            agent,
            task_names,
            now,
        } => {
            let previous = require(current, &instance_id)?;
            let mut instance = previous.clone();
            instance.incarnation += 1;
            instance.tasks.clear();
            for name in &task_names {
                let task_id = TaskId {
                    instance_id: instance.id.clone(),
                    name: name.clone(),
                    incarnation: instance.incarnation,
                };
                instance.tasks.insert(
                    name.clone(),
                    Task {
                        id: task_id,
                        status: TaskStatus {
                            state: None,
                            condition: Condition::Provisioned,
                            message: String::new(),
                            network: NetworkInfo::default(),
                            healthy: None,
                            timestamp: now,
                        },
                        agent_id: agent.agent_id.clone(),
                    },
                );
            }
            instance.agent = Some(agent);
            instance.state.condition = Condition::Provisioned;
            instance.state.since = now;
            instance.state.active_since = Some(now);
            instance.state.healthy = None;
            if let Some(reservation) = instance.reservation.as_mut() {
                reservation.state = ReservationState::Launched;
            }
            let events = vec![instance_changed(&instance)];
            Ok(Effect::Update {
                instance,
                previous: Some(previous.clone()),
                events,
            })
        }

        Op::Reserve {
            instance_id,
            reservation,
            now,
        } => {
            let previous = require(current, &instance_id)?;
            if let Some(existing) = &previous.reservation {
                if existing.agent_id != reservation.agent_id {
                    return Err(TrackerError::InconsistentState(format!(
                        "instance {instance_id} already reserved on {}",
                        existing.agent_id
                    )));
                }
            }
            let mut instance = previous.clone();
            instance.reservation = Some(reservation);
            instance.state.since = now;
            Ok(Effect::Update {
                instance,
                previous: Some(previous.clone()),
                events: Vec::new(),
            })
        }

        Op::BrokerUpdate {
            task_id,
            update,
            now,
        } => {
            let previous = require(current, &task_id.instance_id)?;
            apply_broker_update(previous, task_id, update, now)
        }

        Op::SetGoal {
            instance_id,
            goal,
            now,
        } => {
            let previous = require(current, &instance_id)?;
            if previous.goal() == goal {
                return Ok(Effect::Noop);
            }
            let mut instance = previous.clone();
            instance.state.goal = goal;
            instance.state.since = now;
            let events = vec![instance_changed(&instance)];
            if goal == Goal::Decommissioned && instance.should_expunge() {
                return Ok(Effect::Expunge { instance, events });
            }
            Ok(Effect::Update {
                instance,
                previous: Some(previous.clone()),
                events,
            })
        }

        Op::MarkUnreachableInactive { instance_id, now } => {
            let previous = require(current, &instance_id)?;
            if previous.condition() != Condition::Unreachable {
                return Ok(Effect::Noop);
            }
            let mut instance = previous.clone();
            instance.state.condition = Condition::UnreachableInactive;
            instance.state.since = now;
            for task in instance.tasks.values_mut() {
                if task.status.condition == Condition::Unreachable {
                    task.status.condition = Condition::UnreachableInactive;
                }
            }
            let events = vec![instance_changed(&instance)];
            Ok(Effect::Update {
                instance,
                previous: Some(previous.clone()),
                events,
            })
        }

        Op::ForceExpunge { instance_id } => match current {
            Some(instance) => {
                let mut gone = instance.clone();
                gone.state.goal = Goal::Decommissioned;
                let events = vec![instance_changed(&gone)];
                Ok(Effect::Expunge {
                    instance: gone,
                    events,
                })
            }
            None => Ok(Effect::Noop),
        },

        Op::RevertTo { instance } => {
            let previous = current.cloned();
            let events = vec![instance_changed(&instance)];
            Ok(Effect::Update {
                instance,
                previous,
                events,
            })
        }
    }
}

fn require<'a>(current: Option<&'a Instance>, id: &InstanceId) -> TrackerResult<&'a Instance> {
    current.ok_or_else(|| TrackerError::NotFound(id.to_string()))
}

fn apply_broker_update(
    previous: &Instance,
    task_id: TaskId,
    update: StatusUpdate,
    now: Timestamp,
) -> TrackerResult<Effect> {
    let Some(task) = previous.tasks.get(&task_id.name) else {
        return Err(TrackerError::NotFound(task_id.to_string()));
    };
    // Updates for older incarnations are stale; updates for a task that
    // already finished are ignored.
    if task.id.incarnation != task_id.incarnation || task.status.condition.is_terminal() {
        return Ok(Effect::Noop);
    }

    let mut instance = previous.clone();
    let condition = update.state.to_condition();
    let message = clamp_message(&update.message);
    let previously_healthy = instance.state.healthy;

    {
        let task = instance
            .tasks
            .get_mut(&task_id.name)
            .expect("task present, checked above");
        task.status.state = Some(update.state);
        task.status.condition = condition;
        task.status.message = message.clone();
        task.status.healthy = update.healthy;
        task.status.timestamp = now;
        if !update.network.host_ports.is_empty() || !update.network.ip_addresses.is_empty() {
            task.status.network = update.network;
        }
    }

    instance.state.condition = aggregate_condition(&instance);
    instance.state.since = now;
    if update.healthy.is_some() {
        instance.state.healthy = update.healthy;
    }

    let mut events = vec![Event::StatusUpdateEvent {
        instance_id: instance.id.to_string(),
        task_id: task_id.to_string(),
        run_spec_id: instance.run_spec_id().clone(),
        task_state: update.state.name().to_string(),
        message,
        host: instance
            .agent
            .as_ref()
            .map(|a| a.host.clone())
            .unwrap_or_default(),
        timestamp: now,
    }];
    if update.healthy.is_some() && update.healthy != previously_healthy {
        events.push(Event::InstanceHealthChangedEvent {
            instance_id: instance.id.to_string(),
            run_spec_id: instance.run_spec_id().clone(),
            healthy: update.healthy.unwrap_or(false),
        });
    }

    if !instance.state.condition.is_terminal() {
        events.push(instance_changed(&instance));
        return Ok(Effect::Update {
            instance,
            previous: Some(previous.clone()),
            events,
        });
    }

    // The instance reached a terminal condition; what happens next is
    // the goal's call.
    match instance.goal() {
        Goal::Decommissioned => {
            events.push(instance_changed(&instance));
            Ok(Effect::Expunge { instance, events })
        }
        Goal::Stopped | Goal::Running => {
            // Keep the record for re-launch. Stopped waits for a new
            // goal; Running goes straight back to the launch queue.
            instance.tasks.clear();
            instance.state.condition = Condition::Scheduled;
            instance.state.active_since = None;
            instance.state.healthy = None;
            if let Some(reservation) = instance.reservation.as_mut() {
                reservation.state = ReservationState::Suspended;
            } else {
                instance.agent = None;
            }
            events.push(instance_changed(&instance));
            Ok(Effect::Update {
                instance,
                previous: Some(previous.clone()),
                events,
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use strider_core::pathid::AbsolutePathId;
    use strider_core::Resources;

    fn instance_id(path: &str) -> InstanceId {
        InstanceId::new(AbsolutePathId::parse(path).unwrap(), 1)
    }

    fn scheduled(path: &str) -> Instance {
        Instance::scheduled(instance_id(path), 1000, 1000)
    }

    fn agent() -> AgentInfo {
        AgentInfo {
            agent_id: "agent-1".to_string(),
            host: "host-1".to_string(),
            region: None,
            zone: None,
            attributes: HashMap::new(),
        }
    }

    fn provisioned(path: &str) -> Instance {
        let inst = scheduled(path);
        let effect = apply(
            Some(&inst),
            Op::Provision {
                instance_id: inst.id.clone(),
                agent: agent(),
                task_names: vec!["app".to_string()],
                now: 1001,
            },
        )
        .unwrap();
        match effect {
            Effect::Update { instance, .. } => instance,
            other => panic!("expected update, got {other:?}"),
        }
    }

    fn update_for(inst: &Instance, state: TaskState, message: &str) -> Op {
        Op::BrokerUpdate {
            task_id: inst.tasks["app"].id.clone(),
            update: StatusUpdate {
                state,
                message: message.to_string(),
                network: NetworkInfo::default(),
                healthy: None,
            },
            now: 2000,
        }
    }

    fn apply_update(inst: &Instance, state: TaskState) -> Effect {
        apply(Some(inst), update_for(inst, state, "")).unwrap()
    }

    #[test]
    fn schedule_creates_record() {
        let inst = scheduled("/svc");
        let effect = apply(None, Op::Schedule { instance: inst.clone() }).unwrap();
        match effect {
            Effect::Update {
                instance,
                previous,
                events,
            } => {
                assert_eq!(instance.condition(), Condition::Scheduled);
                assert!(previous.is_none());
                assert_eq!(events.len(), 1);
            }
            other => panic!("unexpected {other:?}"),
        }
        // Scheduling twice is a no-op.
        assert!(apply(Some(&inst), Op::Schedule { instance: inst.clone() })
            .unwrap()
            .is_noop());
    }

    #[test]
    fn provision_mints_tasks_and_bumps_incarnation() {
        let inst = provisioned("/svc");
        assert_eq!(inst.condition(), Condition::Provisioned);
        assert_eq!(inst.incarnation, 1);
        assert_eq!(inst.tasks["app"].id.incarnation, 1);
        assert_eq!(inst.state.active_since, Some(1001));
    }

    #[test]
    fn running_update_transitions() {
        let inst = provisioned("/svc");
        match apply_update(&inst, TaskState::Running) {
            Effect::Update { instance, events, .. } => {
                assert_eq!(instance.condition(), Condition::Running);
                assert!(events
                    .iter()
                    .any(|e| e.name() == "status_update_event"));
                assert!(events
                    .iter()
                    .any(|e| e.name() == "instance_changed_event"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn message_clamped_to_limit() {
        let inst = provisioned("/svc");
        let long = "x".repeat(200 + MAX_STATUS_MESSAGE_LENGTH);
        let effect = apply(
            Some(&inst),
            update_for(&inst, TaskState::Running, &long),
        )
        .unwrap();
        match effect {
            Effect::Update { events, .. } => {
                let Some(Event::StatusUpdateEvent { message, .. }) = events.first() else {
                    panic!("expected status update event");
                };
                assert_eq!(message.chars().count(), MAX_STATUS_MESSAGE_LENGTH);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_with_goal_running_reschedules() {
        let mut inst = provisioned("/svc");
        if let Effect::Update { instance, .. } = apply_update(&inst, TaskState::Running) {
            inst = instance;
        }
        match apply_update(&inst, TaskState::Failed) {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.condition(), Condition::Scheduled);
                assert!(instance.tasks.is_empty());
                assert!(instance.agent.is_none());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_with_goal_stopped_retains_reservation() {
        let mut inst = provisioned("/rt/write");
        inst.reservation = Some(Reservation {
            agent_id: "agent-1".to_string(),
            state: ReservationState::Launched,
            resources: Resources::new(0.001, 1.0, 3.0, 0.0),
            volume_ids: vec!["vol-1".to_string()],
            labels: HashMap::new(),
        });
        inst.state.goal = Goal::Stopped;

        match apply_update(&inst, TaskState::Finished) {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.condition(), Condition::Scheduled);
                assert!(instance.tasks.is_empty());
                let reservation = instance.reservation.expect("reservation kept");
                assert_eq!(reservation.state, ReservationState::Suspended);
                // Reservation pins the agent.
                assert!(instance.agent.is_some());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn terminal_with_goal_decommissioned_expunges() {
        let mut inst = provisioned("/svc");
        inst.state.goal = Goal::Decommissioned;

        match apply_update(&inst, TaskState::Killed) {
            Effect::Expunge { instance, events } => {
                assert_eq!(instance.condition(), Condition::Killed);
                assert!(!events.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn duplicate_terminal_update_is_noop() {
        let mut inst = provisioned("/svc");
        inst.state.goal = Goal::Decommissioned;
        let op = update_for(&inst, TaskState::Killed, "");

        // First application expunges; replay against the still-present
        // record (e.g. persistence raced) must be a no-op because the
        // task condition is terminal.
        let mut terminal = inst.clone();
        terminal
            .tasks
            .get_mut("app")
            .unwrap()
            .status
            .condition = Condition::Killed;
        assert!(apply(Some(&terminal), op).unwrap().is_noop());
    }

    #[test]
    fn stale_incarnation_is_noop() {
        let inst = provisioned("/svc");
        let mut stale_id = inst.tasks["app"].id.clone();
        stale_id.incarnation = 0;
        let effect = apply(
            Some(&inst),
            Op::BrokerUpdate {
                task_id: stale_id,
                update: StatusUpdate {
                    state: TaskState::Failed,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                },
                now: 2000,
            },
        )
        .unwrap();
        assert!(effect.is_noop());
    }

    #[test]
    fn unreachable_then_inactive() {
        let inst = provisioned("/svc");
        let unreachable = match apply_update(&inst, TaskState::Unreachable) {
            Effect::Update { instance, .. } => instance,
            other => panic!("unexpected {other:?}"),
        };
        assert_eq!(unreachable.condition(), Condition::Unreachable);

        let effect = apply(
            Some(&unreachable),
            Op::MarkUnreachableInactive {
                instance_id: unreachable.id.clone(),
                now: 3000,
            },
        )
        .unwrap();
        match effect {
            Effect::Update { instance, .. } => {
                assert_eq!(instance.condition(), Condition::UnreachableInactive);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn health_change_emits_event() {
        let inst = provisioned("/svc");
        let effect = apply(
            Some(&inst),
            Op::BrokerUpdate {
                task_id: inst.tasks["app"].id.clone(),
                update: StatusUpdate {
                    state: TaskState::Running,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: Some(false),
                },
                now: 2000,
            },
        )
        .unwrap();
        match effect {
            Effect::Update { events, .. } => {
                assert!(events
                    .iter()
                    .any(|e| e.name() == "instance_health_changed_event"));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn set_goal_decommissioned_on_scheduled_expunges() {
        let inst = scheduled("/svc");
        let effect = apply(
            Some(&inst),
            Op::SetGoal {
                instance_id: inst.id.clone(),
                goal: Goal::Decommissioned,
                now: 2000,
            },
        )
        .unwrap();
        assert!(matches!(effect, Effect::Expunge { .. }));
    }

    #[test]
    fn force_expunge_missing_is_noop() {
        let effect = apply(
            None,
            Op::ForceExpunge {
                instance_id: instance_id("/svc"),
            },
        )
        .unwrap();
        assert!(effect.is_noop());
    }

    #[test]
    fn update_for_unknown_instance_errors() {
        let inst = provisioned("/svc");
        let op = update_for(&inst, TaskState::Running, "");
        assert!(matches!(apply(None, op), Err(TrackerError::NotFound(_))));
    }
}
