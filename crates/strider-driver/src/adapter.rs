//! The scheduler adapter — the broker callback contract, gated on
//! leadership.
//!
//! Offers flow through here into the matcher and launcher; status
//! updates flow into the tracker; registration state (framework id,
//! local region) is persisted and published. Inconsistent state invokes
//! the crash strategy: the process fail-stops and a fresh leader
//! rebuilds from persistence and reconciliation.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, error, info, warn};

use strider_core::instance::{Goal, Instance, TaskState};
use strider_core::spec::RunSpec;
use strider_core::{NetworkInfo, SchedulerConfig};
use strider_events::{Event, EventBus};
use strider_deploy::InstanceKiller;
use strider_launch::{launch_operations, reserve_operations, LaunchOperation, LaunchQueue};
use strider_matcher::{match_offer, MatcherConfig, Offer, OfferMatchResult, SpecDemand};
use strider_state::{FrameworkIdRepository, GroupRepository};
use strider_tracker::{Effect, InstanceTracker, Op, StatusUpdate, TrackerError};

use crate::broker::{BrokerDriver, BrokerTaskStatus, MasterInfo, OfferFilters};
use crate::election::Leadership;
use crate::error::{DriverError, DriverResult};

/// Delay between an abdication request and the actual abdication, so
/// the admin response gets out before leadership goes away.
pub const ABDICATION_GRACE: Duration = Duration::from_millis(500);

/// Message the broker uses to announce the framework was removed.
const FRAMEWORK_REMOVED: &str = "Framework has been removed";

/// Invoked on unrecoverable errors; the default in the daemon exits the
/// process.
pub type CrashStrategy = Arc<dyn Fn(&str) + Send + Sync>;

/// The adapter. Cheap to clone.
#[derive(Clone)]
pub struct SchedulerAdapter {
    config: SchedulerConfig,
    tracker: InstanceTracker,
    queue: LaunchQueue,
    bus: EventBus,
    driver: Arc<dyn BrokerDriver>,
    leadership: Arc<dyn Leadership>,
    frameworks: FrameworkIdRepository,
    groups: GroupRepository,
    crash: CrashStrategy,
    local_region: Arc<RwLock<Option<String>>>,
    rescinded: Arc<Mutex<HashSet<String>>>,
    suppressed: Arc<Mutex<bool>>,
    /// Consecutive unhealthy reports per instance.
    unhealthy_streaks: Arc<Mutex<HashMap<String, u32>>>,
}

impl SchedulerAdapter {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: SchedulerConfig,
        tracker: InstanceTracker,
        queue: LaunchQueue,
        bus: EventBus,
        driver: Arc<dyn BrokerDriver>,
        leadership: Arc<dyn Leadership>,
        frameworks: FrameworkIdRepository,
        groups: GroupRepository,
        crash: CrashStrategy,
    ) -> Self {
        Self {
            config,
            tracker,
            queue,
            bus,
            driver,
            leadership,
            frameworks,
            groups,
            crash,
            local_region: Arc::new(RwLock::new(None)),
            rescinded: Arc::new(Mutex::new(HashSet::new())),
            suppressed: Arc::new(Mutex::new(false)),
            unhealthy_streaks: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// The region learned from the master's domain info.
    pub async fn local_region(&self) -> Option<String> {
        self.local_region.read().await.clone()
    }

    fn require_leader(&self) -> DriverResult<()> {
        if self.leadership.is_leader() {
            Ok(())
        } else {
            Err(DriverError::NotLeader)
        }
    }

    // ── Registration lifecycle ──────────────────────────────────────

    pub async fn registered(&self, framework_id: &str, master: MasterInfo) -> DriverResult<()> {
        self.frameworks
            .set(framework_id, strider_core::now_millis())?;
        if let Some(domain) = &master.domain {
            *self.local_region.write().await = Some(domain.region.clone());
        }
        info!(framework_id, master = %master.url, "registered with broker master");
        self.bus.publish(Event::SchedulerRegisteredEvent {
            framework_id: framework_id.to_string(),
            master: master.url,
        });
        Ok(())
    }

    pub async fn reregistered(&self, master: MasterInfo) -> DriverResult<()> {
        if let Some(domain) = &master.domain {
            *self.local_region.write().await = Some(domain.region.clone());
        }
        info!(master = %master.url, "re-registered with broker master");
        self.bus.publish(Event::SchedulerReregisteredEvent {
            master: master.url,
        });
        Ok(())
    }

    pub async fn disconnected(&self) {
        warn!("disconnected from broker master");
        // Keep the framework id alive at the master for the next leader.
        if let Err(e) = self.driver.stop(true).await {
            warn!(error = %e, "driver stop failed during disconnect");
        }
        self.bus.publish(Event::SchedulerDisconnectedEvent);
        self.leadership.abdicate();
    }

    pub async fn broker_error(&self, message: &str) {
        error!(message, "broker reported scheduler error");
        if message.contains(FRAMEWORK_REMOVED) {
            // A fresh registration is wanted; drop the stored id before
            // going down.
            if let Err(e) = self.frameworks.clear() {
                error!(error = %e, "failed to clear framework id");
            }
        }
        (self.crash)(message);
    }

    /// Admin-surface abdication: delayed so the response gets flushed.
    pub fn abdicate_after_grace(&self) {
        let leadership = self.leadership.clone();
        tokio::spawn(async move {
            tokio::time::sleep(ABDICATION_GRACE).await;
            leadership.abdicate();
        });
    }

    // ── Offers ──────────────────────────────────────────────────────

    pub async fn rescinded(&self, offer_id: &str) {
        debug!(offer_id, "offer rescinded");
        self.rescinded.lock().await.insert(offer_id.to_string());
    }

    /// Process a batch of offers. Each offer gets its own worker and
    /// must be decided within the matching timeout or it is declined.
    pub async fn offers(&self, offers: Vec<Offer>) {
        if self.require_leader().is_err() {
            // An offer arriving during abdication is declined.
            for offer in &offers {
                let _ = self
                    .driver
                    .decline_offer(&offer.id, OfferFilters::default())
                    .await;
            }
            return;
        }
        let timeout = Duration::from_millis(self.config.offer_matching_timeout_millis);
        for offer in offers {
            let adapter = self.clone();
            tokio::spawn(async move {
                let offer_id = offer.id.clone();
                let decided =
                    tokio::time::timeout(timeout, adapter.process_offer(offer)).await;
                match decided {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        warn!(offer = %offer_id, error = %e, "offer processing failed");
                        let _ = adapter
                            .driver
                            .decline_offer(&offer_id, OfferFilters::default())
                            .await;
                    }
                    Err(_) => {
                        warn!(offer = %offer_id, "offer processing timed out, declining");
                        let _ = adapter
                            .driver
                            .decline_offer(&offer_id, OfferFilters::default())
                            .await;
                    }
                }
            });
        }
    }

    /// Demand snapshot for the matcher: ready queue entries joined with
    /// the tracker's scheduled/placed instances.
    async fn demand_snapshot(&self) -> DriverResult<Vec<SpecDemand>> {
        let now = strider_core::now_millis();
        let ready = self.queue.ready(now).await;
        let mut demand = Vec::with_capacity(ready.len());
        for entry in ready {
            let instances = self.tracker.by_run_spec(&entry.spec.id).await?;
            let mut scheduled = Vec::new();
            let mut placed = Vec::new();
            for instance in instances {
                if instance.is_scheduled() && instance.goal() == Goal::Running {
                    scheduled.push(instance);
                } else if instance.is_active() {
                    placed.push(instance);
                }
                // Suspended instances (goal Stopped) neither demand
                // resources nor count for placement.
            }
            demand.push(SpecDemand {
                spec: entry.spec,
                scheduled,
                placed,
                cluster_pins: entry.cluster_pins,
            });
        }
        Ok(demand)
    }

    async fn process_offer(&self, offer: Offer) -> DriverResult<()> {
        let mut operations: Vec<LaunchOperation> = Vec::new();

        // Reservations whose owner is gone get cleaned up on sight.
        for reservation in &offer.reservations {
            let orphaned = match reservation.owner() {
                Some(owner) => !self
                    .tracker
                    .list()
                    .await?
                    .iter()
                    .any(|i| i.id.to_string() == owner),
                None => true,
            };
            if orphaned {
                warn!(offer = %offer.id, "releasing orphaned reservation");
                for volume_id in &reservation.volume_ids {
                    operations.push(LaunchOperation::DestroyVolume {
                        volume_id: volume_id.clone(),
                    });
                }
                operations.push(LaunchOperation::Unreserve {
                    resources: reservation.resources,
                    labels: reservation.labels.clone(),
                });
            }
        }

        let demand = self.demand_snapshot().await?;
        let matcher_config = MatcherConfig {
            max_instances_per_offer: self.config.max_instances_per_offer,
            local_region: self.local_region().await,
        };
        let results = match_offer(&offer, &demand, &matcher_config);

        let mut provisioned: Vec<Instance> = Vec::new();
        for result in &results {
            let run_spec_id = match result {
                OfferMatchResult::Match { run_spec_id, .. }
                | OfferMatchResult::NoMatch { run_spec_id, .. } => run_spec_id.clone(),
            };
            self.queue.notify_launch_attempt(&run_spec_id, result).await;

            let OfferMatchResult::Match { instances, .. } = result else {
                continue;
            };
            let Some(entry) = demand.iter().find(|d| d.spec.id == run_spec_id) else {
                continue;
            };
            let spec = &entry.spec;
            self.record_cluster_pins(spec, &offer).await;

            for matched in instances {
                let Some(instance) = entry
                    .scheduled
                    .iter()
                    .find(|i| i.id == matched.instance_id)
                else {
                    continue;
                };
                // Snapshot for the revert path: the record as the
                // matcher saw it, before reserve/provision touch it.
                provisioned.push(instance.clone());
                // Fresh resident launches reserve before they launch.
                if spec.is_resident() && !matched.existing_reservation {
                    let (reservation, reserve_ops) =
                        reserve_operations(spec, &instance.id, &offer.agent.agent_id);
                    self.tracker
                        .process(Op::Reserve {
                            instance_id: instance.id.clone(),
                            reservation,
                            now: strider_core::now_millis(),
                        })
                        .await?;
                    operations.extend(reserve_ops);
                }
                // Record intent before the accept goes out.
                let effect = self
                    .tracker
                    .process(Op::Provision {
                        instance_id: instance.id.clone(),
                        agent: offer.agent.clone(),
                        task_names: spec.workload.task_names(),
                        now: strider_core::now_millis(),
                    })
                    .await?;
                if let Effect::Update { instance, .. } = effect {
                    operations.extend(launch_operations(spec, &instance));
                }
            }
        }

        // A rescind that raced us voids the accept.
        if self.rescinded.lock().await.remove(&offer.id) {
            self.revert_all(provisioned).await;
            return Ok(());
        }

        if operations.is_empty() {
            self.driver
                .decline_offer(&offer.id, OfferFilters::default())
                .await?;
            return Ok(());
        }

        let accept = self
            .driver
            .accept_offers(
                std::slice::from_ref(&offer.id),
                operations,
                OfferFilters::default(),
            )
            .await;
        if let Err(e) = accept {
            // Send failed: the instances never launched; put them back.
            warn!(offer = %offer.id, error = %e, "accept failed, reverting provisioned instances");
            self.revert_all(provisioned).await;
            return Err(e);
        }
        debug!(offer = %offer.id, "offer accepted");
        Ok(())
    }

    /// Back to `Scheduled`, keeping the burned incarnation so the next
    /// launch mints fresh task ids.
    async fn revert_all(&self, snapshots: Vec<Instance>) {
        for mut snapshot in snapshots {
            snapshot.incarnation += 1;
            let _ = self
                .tracker
                .process(Op::RevertTo { instance: snapshot })
                .await;
        }
    }

    /// Persist CLUSTER pins on first placement against this offer.
    async fn record_cluster_pins(&self, spec: &RunSpec, offer: &Offer) {
        for constraint in &spec.constraints {
            if let strider_core::ConstraintOperator::Cluster { value } = &constraint.operator {
                if value.is_empty() {
                    if let Some(v) =
                        strider_matcher::field_value(&offer.agent, &constraint.field)
                    {
                        self.queue
                            .pin_cluster(&spec.id, constraint.field.to_string(), v)
                            .await;
                    }
                }
            }
        }
    }

    /// Suppress offers while nothing wants resources; revive otherwise.
    pub async fn sync_offer_interest(&self) -> DriverResult<()> {
        let wants = self.queue.has_demand().await;
        let mut suppressed = self.suppressed.lock().await;
        if wants && *suppressed {
            self.driver.revive_offers().await?;
            *suppressed = false;
            debug!("offers revived");
        } else if !wants && !*suppressed {
            self.driver.suppress_offers().await?;
            *suppressed = true;
            debug!("offers suppressed");
        }
        Ok(())
    }

    // ── Status updates ──────────────────────────────────────────────

    pub async fn status_update(&self, status: BrokerTaskStatus) -> DriverResult<()> {
        self.require_leader()?;
        let run_spec_id = status.task_id.instance_id.run_spec_id.clone();
        let task_state = status.state;
        let result = self
            .tracker
            .process(Op::BrokerUpdate {
                task_id: status.task_id.clone(),
                update: StatusUpdate {
                    state: status.state,
                    message: status.message,
                    network: status.network,
                    healthy: status.healthy,
                },
                now: status.timestamp,
            })
            .await;

        let effect = match result {
            Ok(effect) => effect,
            Err(TrackerError::NotFound(_)) => {
                // The broker knows a task we don't: kill it so the
                // cluster converges on our record.
                warn!(task = %status.task_id, "update for unknown task, killing");
                self.driver.kill_task(&status.task_id.to_string()).await?;
                return Ok(());
            }
            Err(TrackerError::Stopped) => {
                (self.crash)("instance tracker stopped");
                return Err(DriverError::Tracker(TrackerError::Stopped));
            }
            Err(e) => return Err(e.into()),
        };

        // Launch-queue signaling.
        match task_state {
            TaskState::Running => {
                self.queue
                    .on_task_running(&run_spec_id, status.timestamp)
                    .await;
            }
            TaskState::Failed | TaskState::Error => {
                self.queue
                    .on_task_failed(&run_spec_id, status.timestamp)
                    .await;
            }
            _ => {}
        }

        // Health bookkeeping: enough consecutive unhealthy reports and
        // the instance is killed; the relaunch follows the normal
        // failed-task path.
        if let Effect::Update { instance, .. } = &effect {
            if let Some(healthy) = status.healthy {
                let key = instance.id.to_string();
                let mut streaks = self.unhealthy_streaks.lock().await;
                if healthy {
                    streaks.remove(&key);
                } else {
                    let streak = streaks.entry(key.clone()).or_insert(0);
                    *streak += 1;
                    let limit = self
                        .find_spec(&run_spec_id)?
                        .and_then(|s| s.health_check.map(|h| h.max_consecutive_failures))
                        .unwrap_or(3);
                    if *streak >= limit {
                        streaks.remove(&key);
                        drop(streaks);
                        warn!(instance = %instance.id, "unhealthy beyond limit, killing");
                        self.bus.publish(Event::UnhealthyInstanceKillEvent {
                            instance_id: instance.id.to_string(),
                            run_spec_id: run_spec_id.clone(),
                        });
                        for task in instance.tasks.values() {
                            let _ = self.driver.kill_task(&task.id.to_string()).await;
                        }
                    }
                }
            }
        }

        // An instance bounced back to Scheduled with goal Running wants
        // to launch again.
        if let Effect::Update { instance, .. } = &effect {
            if instance.is_scheduled() && instance.goal() == Goal::Running {
                if let Some(spec) = self.find_spec(&run_spec_id)? {
                    self.queue.add(spec, 1).await;
                }
            }
        }
        // A decommissioned resident instance leaves a reservation
        // behind; the next offer carrying it is now an orphan sweep
        // (see process_offer) and issues the destroy + unreserve.
        if let Effect::Expunge { instance, .. } = &effect {
            if let Some(reservation) = &instance.reservation {
                debug!(
                    instance = %instance.id,
                    agent = %reservation.agent_id,
                    "reservation release pending next offer"
                );
            }
        }
        Ok(())
    }

    fn find_spec(&self, id: &strider_core::AbsolutePathId) -> DriverResult<Option<RunSpec>> {
        Ok(self
            .groups
            .root()?
            .and_then(|root| root.find_run_spec(id).cloned()))
    }

    // ── Agent / executor failures ───────────────────────────────────

    /// The broker lost an agent: everything on it goes unreachable.
    pub async fn agent_lost(&self, agent_id: &str) -> DriverResult<()> {
        self.require_leader()?;
        warn!(agent_id, "agent lost");
        for instance in self.tracker.list().await? {
            let on_agent = instance
                .agent
                .as_ref()
                .is_some_and(|a| a.agent_id == agent_id);
            if !on_agent || instance.tasks.is_empty() {
                continue;
            }
            for task in instance.tasks.values() {
                let _ = self
                    .tracker
                    .process(Op::BrokerUpdate {
                        task_id: task.id.clone(),
                        update: StatusUpdate {
                            state: TaskState::Unreachable,
                            message: "agent lost".to_string(),
                            network: NetworkInfo::default(),
                            healthy: None,
                        },
                        now: strider_core::now_millis(),
                    })
                    .await;
            }
        }
        Ok(())
    }

    pub async fn executor_lost(&self, agent_id: &str, executor_id: &str) {
        // Task-level updates follow; nothing to do beyond the record.
        debug!(agent_id, executor_id, "executor lost");
    }

    pub async fn framework_message(&self, agent_id: &str, payload: Vec<u8>) {
        self.bus.publish(Event::FrameworkMessageEvent {
            agent_id: agent_id.to_string(),
            payload,
        });
    }
}

/// Kills instances through the broker — the executor's kill arm.
pub struct BrokerKiller {
    driver: Arc<dyn BrokerDriver>,
}

impl BrokerKiller {
    pub fn new(driver: Arc<dyn BrokerDriver>) -> Self {
        Self { driver }
    }
}

#[async_trait]
impl InstanceKiller for BrokerKiller {
    async fn kill_instance(&self, instance: &Instance) {
        for task in instance.tasks.values() {
            if let Err(e) = self.driver.kill_task(&task.id.to_string()).await {
                warn!(task = %task.id, error = %e, "kill request failed");
            }
        }
    }
}
