//! Periodic task reconciliation.
//!
//! The leader asks the broker for the status of every non-terminal task
//! it knows. A task whose status has not moved by the next round is
//! degraded to `Unknown`; the tracker's goal policy takes it from
//! there. The same ticker escalates lost resident instances whose
//! policy allows giving up the reservation after a timeout.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use strider_core::instance::{Condition, TaskId};
use strider_core::{NetworkInfo, TaskState, Timestamp};
use strider_launch::relaunch_elsewhere_due;
use strider_state::GroupRepository;
use strider_tracker::{InstanceTracker, Op, StatusUpdate};

use crate::broker::BrokerDriver;
use crate::error::DriverResult;

/// Outcome of one reconciliation round.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcileStats {
    pub asked: usize,
    pub degraded: usize,
    /// Resident instances that gave up their reservation.
    pub escalated: usize,
}

/// The reconciliation ticker.
pub struct ReconciliationLoop {
    tracker: InstanceTracker,
    driver: Arc<dyn BrokerDriver>,
    groups: GroupRepository,
    interval: Duration,
    initial_delay: Duration,
    /// Tasks asked last round, with the status timestamp seen then.
    asked: Mutex<HashMap<String, (TaskId, Timestamp)>>,
}

impl ReconciliationLoop {
    pub fn new(
        tracker: InstanceTracker,
        driver: Arc<dyn BrokerDriver>,
        groups: GroupRepository,
        interval: Duration,
        initial_delay: Duration,
    ) -> Self {
        Self {
            tracker,
            driver,
            groups,
            interval,
            initial_delay,
            asked: Mutex::new(HashMap::new()),
        }
    }

    /// Tick until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(interval = ?self.interval, "reconciliation loop started");
        tokio::select! {
            _ = tokio::time::sleep(self.initial_delay) => {}
            _ = shutdown.changed() => return,
        }
        loop {
            if let Err(e) = self.reconcile_once().await {
                warn!(error = %e, "reconciliation round failed");
            }
            tokio::select! {
                _ = tokio::time::sleep(self.interval) => {}
                _ = shutdown.changed() => {
                    debug!("reconciliation loop shutting down");
                    break;
                }
            }
        }
    }

    /// One round: escalate lost residents, degrade the silent, then ask
    /// about the living.
    pub async fn reconcile_once(&self) -> DriverResult<ReconcileStats> {
        let mut stats = ReconcileStats::default();
        let now = strider_core::now_millis();
        let root = self.groups.root()?;

        let mut current: HashMap<String, (TaskId, Timestamp)> = HashMap::new();
        for instance in self.tracker.list().await? {
            // Resident escalation: an unreachable instance whose policy
            // is relaunch-after-timeout abandons its reservation once
            // the escalation window passes.
            let lost = matches!(
                instance.condition(),
                Condition::Unreachable | Condition::UnreachableInactive
            );
            if lost && instance.is_reserved() {
                let residency = root
                    .as_ref()
                    .and_then(|r| r.find_run_spec(instance.run_spec_id()))
                    .and_then(|s| s.residency.clone());
                if let Some(residency) = residency {
                    if relaunch_elsewhere_due(&residency, instance.state.since, now) {
                        warn!(
                            instance = %instance.id,
                            "lost resident past escalation timeout, abandoning reservation"
                        );
                        let _ = self
                            .tracker
                            .process(Op::ForceExpunge {
                                instance_id: instance.id.clone(),
                            })
                            .await;
                        stats.escalated += 1;
                        continue;
                    }
                }
            }

            for task in instance.tasks.values() {
                if !task.status.condition.is_terminal() {
                    current.insert(
                        task.id.to_string(),
                        (task.id.clone(), task.status.timestamp),
                    );
                }
            }
        }

        // Anything asked last round with an unmoved status timestamp
        // never answered.
        let previous = std::mem::take(&mut *self.asked.lock().await);
        for (key, (task_id, asked_at)) in previous {
            let unmoved = current
                .get(&key)
                .is_some_and(|(_, now_at)| *now_at == asked_at);
            if unmoved {
                warn!(task = %task_id, "no status since last round, degrading to unknown");
                let _ = self
                    .tracker
                    .process(Op::BrokerUpdate {
                        task_id,
                        update: StatusUpdate {
                            state: TaskState::Unknown,
                            message: "no status during reconciliation".to_string(),
                            network: NetworkInfo::default(),
                            healthy: None,
                        },
                        now: strider_core::now_millis(),
                    })
                    .await;
                current.remove(&key);
                stats.degraded += 1;
            }
        }

        let ids: Vec<String> = current.keys().cloned().collect();
        stats.asked = ids.len();
        if !ids.is_empty() {
            self.driver.reconcile_tasks(ids).await?;
        }
        *self.asked.lock().await = current;

        debug!(asked = stats.asked, degraded = stats.degraded, "reconciliation round");
        Ok(stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use strider_core::instance::{AgentInfo, Condition, Instance, InstanceId};
    use strider_core::AbsolutePathId;
    use strider_events::EventBus;
    use strider_launch::LaunchOperation;
    use strider_state::{InstanceRepository, KvStore};
    use strider_tracker::{Effect, TrackerConfig};

    use crate::broker::OfferFilters;

    #[derive(Default)]
    struct RecordingDriver {
        reconciled: std::sync::Mutex<Vec<Vec<String>>>,
    }

    #[async_trait]
    impl BrokerDriver for RecordingDriver {
        async fn accept_offers(
            &self,
            _offer_ids: &[String],
            _operations: Vec<LaunchOperation>,
            _filters: OfferFilters,
        ) -> DriverResult<()> {
            Ok(())
        }
        async fn decline_offer(&self, _offer_id: &str, _filters: OfferFilters) -> DriverResult<()> {
            Ok(())
        }
        async fn kill_task(&self, _task_id: &str) -> DriverResult<()> {
            Ok(())
        }
        async fn reconcile_tasks(&self, task_ids: Vec<String>) -> DriverResult<()> {
            self.reconciled.lock().unwrap().push(task_ids);
            Ok(())
        }
        async fn revive_offers(&self) -> DriverResult<()> {
            Ok(())
        }
        async fn suppress_offers(&self) -> DriverResult<()> {
            Ok(())
        }
        async fn stop(&self, _failover: bool) -> DriverResult<()> {
            Ok(())
        }
    }

    async fn running_instance(tracker: &InstanceTracker) -> Instance {
        let instance = Instance::scheduled(
            InstanceId::new(AbsolutePathId::parse("/svc").unwrap(), 1),
            1,
            1000,
        );
        let id = instance.id.clone();
        tracker.process(Op::Schedule { instance }).await.unwrap();
        let effect = tracker
            .process(Op::Provision {
                instance_id: id.clone(),
                agent: AgentInfo {
                    agent_id: "agent-1".to_string(),
                    host: "h1".to_string(),
                    region: None,
                    zone: None,
                    attributes: Default::default(),
                },
                task_names: vec!["app".to_string()],
                now: 1000,
            })
            .await
            .unwrap();
        let Effect::Update { instance, .. } = effect else {
            panic!("expected update");
        };
        tracker
            .process(Op::BrokerUpdate {
                task_id: instance.tasks["app"].id.clone(),
                update: StatusUpdate {
                    state: TaskState::Running,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                },
                now: 2000,
            })
            .await
            .unwrap();
        tracker.get(&id).await.unwrap().unwrap()
    }

    fn setup() -> (InstanceTracker, Arc<RecordingDriver>, ReconciliationLoop, GroupRepository) {
        let store = KvStore::open_in_memory().unwrap();
        let tracker = InstanceTracker::spawn(
            TrackerConfig::default(),
            InstanceRepository::new(store.clone()),
            EventBus::new(),
        )
        .unwrap();
        let driver = Arc::new(RecordingDriver::default());
        let groups = GroupRepository::new(store);
        let reconciler = ReconciliationLoop::new(
            tracker.clone(),
            driver.clone(),
            groups.clone(),
            Duration::from_secs(600),
            Duration::from_secs(15),
        );
        (tracker, driver, reconciler, groups)
    }

    #[tokio::test]
    async fn asks_about_non_terminal_tasks() {
        let (tracker, driver, reconciler, _) = setup();
        let instance = running_instance(&tracker).await;

        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.asked, 1);
        assert_eq!(stats.degraded, 0);

        let recorded = driver.reconciled.lock().unwrap();
        assert_eq!(recorded.len(), 1);
        assert_eq!(recorded[0], vec![instance.tasks["app"].id.to_string()]);
    }

    #[tokio::test]
    async fn silent_task_degrades_to_unknown() {
        let (tracker, _, reconciler, _) = setup();
        let instance = running_instance(&tracker).await;

        reconciler.reconcile_once().await.unwrap();
        // No status arrives in between.
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.degraded, 1);

        // Unknown is terminal with goal Running: back to Scheduled for
        // relaunch.
        let after = tracker.get(&instance.id).await.unwrap().unwrap();
        assert_eq!(after.condition(), Condition::Scheduled);
    }

    #[tokio::test]
    async fn answered_task_is_not_degraded() {
        let (tracker, _, reconciler, _) = setup();
        let instance = running_instance(&tracker).await;

        reconciler.reconcile_once().await.unwrap();
        // The broker answers with a fresh RUNNING.
        tracker
            .process(Op::BrokerUpdate {
                task_id: instance.tasks["app"].id.clone(),
                update: StatusUpdate {
                    state: TaskState::Running,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                },
                now: 5000,
            })
            .await
            .unwrap();

        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.degraded, 0);
        assert_eq!(stats.asked, 1);
    }

    #[tokio::test]
    async fn lost_resident_escalates_after_timeout() {
        use strider_core::spec::{Residency, RunSpec, TaskLostBehavior};
        use strider_core::{Group, Reservation, ReservationState, Resources};

        let (tracker, _, reconciler, groups) = setup();

        let mut spec = RunSpec::app(AbsolutePathId::parse("/svc").unwrap(), 1);
        spec.residency = Some(Residency {
            relaunch_escalation_timeout_secs: 1,
            task_lost_behavior: TaskLostBehavior::RelaunchAfterTimeout,
        });
        let mut root = Group::empty_root(1);
        root.put_run_spec(spec, 1);
        groups.store_root(&root, None).unwrap();

        let instance = running_instance(&tracker).await;
        tracker
            .process(Op::Reserve {
                instance_id: instance.id.clone(),
                reservation: Reservation {
                    agent_id: "agent-1".to_string(),
                    state: ReservationState::Launched,
                    resources: Resources::new(0.1, 32.0, 3.0, 0.0),
                    volume_ids: vec!["vol-1".to_string()],
                    labels: Default::default(),
                },
                now: 1000,
            })
            .await
            .unwrap();
        tracker
            .process(Op::BrokerUpdate {
                task_id: instance.tasks["app"].id.clone(),
                update: StatusUpdate {
                    state: TaskState::Unreachable,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                },
                // Far in the past relative to the wall clock the
                // reconciler reads.
                now: 1000,
            })
            .await
            .unwrap();

        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.escalated, 1);
        assert!(tracker.get(&instance.id).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn wait_forever_resident_is_never_escalated() {
        use strider_core::{Group, Reservation, ReservationState, Resources};
        use strider_core::spec::RunSpec;

        let (tracker, _, reconciler, groups) = setup();

        // Default residency (WaitForever) through explicit None: the
        // spec is resident by reservation only, with no residency
        // policy in the root.
        let spec = RunSpec::app(AbsolutePathId::parse("/svc").unwrap(), 1);
        let mut root = Group::empty_root(1);
        root.put_run_spec(spec, 1);
        groups.store_root(&root, None).unwrap();

        let instance = running_instance(&tracker).await;
        tracker
            .process(Op::Reserve {
                instance_id: instance.id.clone(),
                reservation: Reservation {
                    agent_id: "agent-1".to_string(),
                    state: ReservationState::Launched,
                    resources: Resources::new(0.1, 32.0, 3.0, 0.0),
                    volume_ids: Vec::new(),
                    labels: Default::default(),
                },
                now: 1000,
            })
            .await
            .unwrap();
        tracker
            .process(Op::BrokerUpdate {
                task_id: instance.tasks["app"].id.clone(),
                update: StatusUpdate {
                    state: TaskState::Unreachable,
                    message: String::new(),
                    network: NetworkInfo::default(),
                    healthy: None,
                },
                now: 1000,
            })
            .await
            .unwrap();

        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats.escalated, 0);
        assert!(tracker.get(&instance.id).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn empty_tracker_asks_nothing() {
        let (_, driver, reconciler, _) = setup();
        let stats = reconciler.reconcile_once().await.unwrap();
        assert_eq!(stats, ReconcileStats::default());
        assert!(driver.reconciled.lock().unwrap().is_empty());
    }
}
