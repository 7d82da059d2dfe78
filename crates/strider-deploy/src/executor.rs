//! The deployment executor.
//!
//! Runs one plan at a time per conflict group: a plan locks its
//! affected run-spec ids, steps execute in order, actions within a step
//! concurrently. Every action is idempotent against observed state, so
//! a fresh leader resumes by re-reading persisted plans and running
//! them again.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinSet;
use tracing::{debug, info, warn};

use strider_core::deployment::{DeploymentAction, DeploymentPlan};
use strider_core::instance::{Goal, Instance, InstanceId};
use strider_core::spec::RunSpec;
use strider_core::AbsolutePathId;
use strider_events::{Event, EventBus};
use strider_launch::LaunchQueue;
use strider_state::DeploymentRepository;
use strider_tracker::{InstanceTracker, Op};

use crate::error::{DeployError, DeployResult};
use crate::plan::{restart_batch, select_victims};

/// Issues kills for instances with live tasks. Implemented by the
/// scheduler adapter over the broker driver.
#[async_trait]
pub trait InstanceKiller: Send + Sync {
    async fn kill_instance(&self, instance: &Instance);
}

/// Where a plan stands.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeploymentStatus {
    Running,
    Finished,
    /// Terminal; the core never auto-rolls-back.
    Failed(String),
    /// Overridden by a forced plan.
    Cancelled,
}

/// Executor pacing.
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// How often gated waits re-read the tracker.
    pub poll_interval: Duration,
    /// Budget per step before the plan fails.
    pub step_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            poll_interval: Duration::from_millis(500),
            step_timeout: Duration::from_secs(600),
        }
    }
}

/// Drives plans. Cheap to clone; clones share locks and statuses.
#[derive(Clone)]
pub struct DeploymentExecutor {
    tracker: InstanceTracker,
    queue: LaunchQueue,
    bus: EventBus,
    repository: DeploymentRepository,
    killer: Arc<dyn InstanceKiller>,
    config: ExecutorConfig,
    /// Run-spec id → plan id holding the lock.
    locks: Arc<Mutex<HashMap<AbsolutePathId, String>>>,
    statuses: Arc<Mutex<HashMap<String, DeploymentStatus>>>,
    cancels: Arc<Mutex<HashMap<String, watch::Sender<bool>>>>,
    nonce: Arc<AtomicU64>,
}

impl DeploymentExecutor {
    pub fn new(
        tracker: InstanceTracker,
        queue: LaunchQueue,
        bus: EventBus,
        repository: DeploymentRepository,
        killer: Arc<dyn InstanceKiller>,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            tracker,
            queue,
            bus,
            repository,
            killer,
            config,
            locks: Arc::new(Mutex::new(HashMap::new())),
            statuses: Arc::new(Mutex::new(HashMap::new())),
            cancels: Arc::new(Mutex::new(HashMap::new())),
            nonce: Arc::new(AtomicU64::new(strider_core::now_millis())),
        }
    }

    /// Current status of a plan, if known to this leader.
    pub async fn status(&self, plan_id: &str) -> Option<DeploymentStatus> {
        self.statuses.lock().await.get(plan_id).cloned()
    }

    /// Persist and launch a plan. Conflicting plans reject unless
    /// `force`, which cancels the incumbents; their in-flight actions
    /// complete and this plan computes from observed state.
    pub async fn start(&self, plan: DeploymentPlan, force: bool) -> DeployResult<()> {
        let affected = plan.affected_run_spec_ids();
        {
            let mut locks = self.locks.lock().await;
            let mut incumbents: Vec<(AbsolutePathId, String)> = Vec::new();
            for id in &affected {
                if let Some(holder) = locks.get(id) {
                    if !force {
                        return Err(DeployError::Conflict {
                            holder: holder.clone(),
                            run_spec: id.to_string(),
                        });
                    }
                    incumbents.push((id.clone(), holder.clone()));
                }
            }
            for (_, holder) in &incumbents {
                self.cancel_locked(holder, &mut locks).await;
            }
            for id in &affected {
                locks.insert(id.clone(), plan.id.clone());
            }
        }

        // The plan is durable before any step runs.
        self.repository.put(&plan, plan.target_version)?;

        let (cancel_tx, cancel_rx) = watch::channel(false);
        self.cancels.lock().await.insert(plan.id.clone(), cancel_tx);
        self.statuses
            .lock()
            .await
            .insert(plan.id.clone(), DeploymentStatus::Running);

        let executor = self.clone();
        let plan_id = plan.id.clone();
        tokio::spawn(async move {
            if let Err(e) = executor.run(plan, cancel_rx).await {
                warn!(plan = %plan_id, error = %e, "deployment did not finish");
            }
        });
        Ok(())
    }

    /// Re-launch every persisted plan — the new leader's resume path.
    pub async fn resume_pending(&self) -> DeployResult<usize> {
        let plans = self.repository.all()?;
        let count = plans.len();
        for plan in plans {
            info!(plan = %plan.id, "resuming persisted deployment");
            self.start(plan, false).await?;
        }
        Ok(count)
    }

    async fn cancel_locked(
        &self,
        plan_id: &str,
        locks: &mut HashMap<AbsolutePathId, String>,
    ) {
        info!(plan = %plan_id, "cancelling deployment for forced override");
        if let Some(cancel) = self.cancels.lock().await.remove(plan_id) {
            let _ = cancel.send(true);
        }
        self.statuses
            .lock()
            .await
            .insert(plan_id.to_string(), DeploymentStatus::Cancelled);
        locks.retain(|_, holder| holder != plan_id);
        if let Err(e) = self.repository.delete(plan_id) {
            warn!(plan = %plan_id, error = %e, "failed to drop cancelled plan");
        }
    }

    async fn release_locks(&self, plan_id: &str) {
        self.locks
            .lock()
            .await
            .retain(|_, holder| holder != plan_id);
    }

    async fn run(&self, plan: DeploymentPlan, cancel: watch::Receiver<bool>) -> DeployResult<()> {
        let plan_id = plan.id.clone();
        for (index, step) in plan.steps.iter().enumerate() {
            if *cancel.borrow() {
                self.release_locks(&plan_id).await;
                return Err(DeployError::Cancelled(plan_id));
            }
            self.bus.publish(Event::DeploymentInfo {
                plan_id: plan_id.clone(),
                step: index,
            });

            let mut tasks: JoinSet<DeployResult<()>> = JoinSet::new();
            for action in step.actions.clone() {
                let executor = self.clone();
                let cancel = cancel.clone();
                tasks.spawn(async move { executor.execute_action(action, cancel).await });
            }
            let mut failure: Option<String> = None;
            while let Some(joined) = tasks.join_next().await {
                match joined {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        failure.get_or_insert(e.to_string());
                    }
                    Err(e) => {
                        failure.get_or_insert(format!("action panicked: {e}"));
                    }
                }
            }

            if let Some(reason) = failure {
                self.bus.publish(Event::DeploymentStepFailure {
                    plan_id: plan_id.clone(),
                    step: index,
                    reason: reason.clone(),
                });
                self.bus.publish(Event::DeploymentFailed {
                    plan_id: plan_id.clone(),
                    reason: reason.clone(),
                });
                self.statuses
                    .lock()
                    .await
                    .insert(plan_id.clone(), DeploymentStatus::Failed(reason.clone()));
                self.release_locks(&plan_id).await;
                return Err(DeployError::StepFailed {
                    plan_id,
                    step: index,
                    reason,
                });
            }
            self.bus.publish(Event::DeploymentStepSuccess {
                plan_id: plan_id.clone(),
                step: index,
            });
        }

        self.repository.delete(&plan_id)?;
        self.cancels.lock().await.remove(&plan_id);
        self.statuses
            .lock()
            .await
            .insert(plan_id.clone(), DeploymentStatus::Finished);
        self.release_locks(&plan_id).await;
        self.bus.publish(Event::DeploymentSuccess {
            plan_id: plan_id.clone(),
        });
        info!(plan = %plan_id, "deployment finished");
        Ok(())
    }

    async fn execute_action(
        &self,
        action: DeploymentAction,
        cancel: watch::Receiver<bool>,
    ) -> DeployResult<()> {
        match action {
            DeploymentAction::StartApplication { run_spec } => {
                let target = run_spec.instances as usize;
                self.ensure_scheduled(&run_spec, target).await?;
                self.wait_for_healthy(&run_spec, target, &cancel).await
            }
            DeploymentAction::ScaleApplication { run_spec, to } => {
                self.scale(&run_spec, to as usize, &cancel).await
            }
            DeploymentAction::RestartApplication { run_spec } => {
                self.restart(&run_spec, &cancel).await
            }
            DeploymentAction::StopApplication { run_spec } => {
                self.stop(&run_spec, &cancel).await
            }
        }
    }

    /// Create scheduled instances until `want` records exist.
    async fn ensure_scheduled(&self, spec: &RunSpec, want: usize) -> DeployResult<usize> {
        let existing = self.tracker.by_run_spec(&spec.id).await?;
        let missing = want.saturating_sub(existing.len());
        for _ in 0..missing {
            let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
            let instance = Instance::scheduled(
                InstanceId::new(spec.id.clone(), nonce),
                spec.version,
                strider_core::now_millis(),
            );
            self.tracker.process(Op::Schedule { instance }).await?;
        }
        if missing > 0 {
            self.queue.add(spec.clone(), missing as u32).await;
            debug!(spec = %spec.id, missing, "instances scheduled");
        }
        Ok(missing)
    }

    /// Wind victims down. Resident instances are suspended (record and
    /// reservation retained for re-launch); everything else is
    /// decommissioned and expunged on terminal.
    async fn wind_down(
        &self,
        spec: &RunSpec,
        victims: Vec<Instance>,
        goal: Goal,
    ) -> DeployResult<()> {
        let scheduled_victims = victims.iter().filter(|i| i.is_scheduled()).count() as u32;
        for victim in &victims {
            self.tracker
                .process(Op::SetGoal {
                    instance_id: victim.id.clone(),
                    goal,
                    now: strider_core::now_millis(),
                })
                .await?;
            if !victim.tasks.is_empty() {
                self.killer.kill_instance(victim).await;
            }
        }
        if scheduled_victims > 0 {
            self.queue.remove_demand(&spec.id, scheduled_victims).await;
        }
        Ok(())
    }

    async fn scale(
        &self,
        spec: &RunSpec,
        to: usize,
        cancel: &watch::Receiver<bool>,
    ) -> DeployResult<()> {
        let instances = self.tracker.by_run_spec(&spec.id).await?;
        let wanted: Vec<Instance> = instances
            .iter()
            .filter(|i| i.goal() == Goal::Running)
            .cloned()
            .collect();
        if wanted.len() > to {
            let goal = if spec.is_resident() {
                Goal::Stopped
            } else {
                Goal::Decommissioned
            };
            let victims = select_victims(wanted, usize::MAX, spec.kill_selection);
            let excess = victims.len() - to;
            self.wind_down(spec, victims.into_iter().take(excess).collect(), goal)
                .await?;
            self.wait_for(
                spec,
                cancel,
                |instances| {
                    instances
                        .iter()
                        .filter(|i| i.goal() == Goal::Running)
                        .count()
                        <= to
                        && instances.iter().all(|i| i.tasks.is_empty() || i.goal() == Goal::Running)
                },
                "scale-down drained",
            )
            .await
        } else {
            // Suspended resident instances come back before new ones
            // are minted.
            let stopped: Vec<Instance> = instances
                .iter()
                .filter(|i| i.goal() == Goal::Stopped)
                .take(to - wanted.len())
                .cloned()
                .collect();
            for instance in &stopped {
                self.tracker
                    .process(Op::SetGoal {
                        instance_id: instance.id.clone(),
                        goal: Goal::Running,
                        now: strider_core::now_millis(),
                    })
                    .await?;
            }
            if !stopped.is_empty() {
                self.queue.add(spec.clone(), stopped.len() as u32).await;
            }
            self.ensure_scheduled(spec, to).await?;
            self.wait_for_healthy(spec, to, cancel).await
        }
    }

    /// Capacity-gated replacement: launch new-version instances up to
    /// the over-capacity ceiling, kill old ones as the health floor
    /// allows, repeat until only healthy new-version instances remain.
    async fn restart(&self, spec: &RunSpec, cancel: &watch::Receiver<bool>) -> DeployResult<()> {
        let target = spec.instances as usize;
        let deadline = tokio::time::Instant::now() + self.config.step_timeout;

        loop {
            if *cancel.borrow() {
                return Err(DeployError::Cancelled(spec.id.to_string()));
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::StepFailed {
                    plan_id: String::new(),
                    step: 0,
                    reason: format!("restart of {} timed out", spec.id),
                });
            }

            let instances = self.tracker.by_run_spec(&spec.id).await?;
            let (new, old): (Vec<Instance>, Vec<Instance>) = instances
                .into_iter()
                .partition(|i| i.run_spec_version == spec.version);
            let new_running = new.iter().filter(|i| i.is_running_and_healthy()).count();
            let old_running = old.iter().filter(|i| i.is_running_and_healthy()).count();

            if old.is_empty() && new_running >= target {
                return Ok(());
            }

            let batch = restart_batch(
                &spec.upgrade,
                target,
                old.len(),
                old_running,
                new.len(),
                new_running,
            );
            if batch.kill_old > 0 {
                let victims = select_victims(old, batch.kill_old, spec.kill_selection);
                self.wind_down(spec, victims, Goal::Decommissioned).await?;
            }
            if batch.launch_new > 0 {
                for _ in 0..batch.launch_new {
                    let nonce = self.nonce.fetch_add(1, Ordering::Relaxed);
                    let instance = Instance::scheduled(
                        InstanceId::new(spec.id.clone(), nonce),
                        spec.version,
                        strider_core::now_millis(),
                    );
                    self.tracker.process(Op::Schedule { instance }).await?;
                }
                self.queue.add(spec.clone(), batch.launch_new as u32).await;
            }

            tokio::time::sleep(self.config.poll_interval).await;
        }
    }

    async fn stop(&self, spec: &RunSpec, cancel: &watch::Receiver<bool>) -> DeployResult<()> {
        let instances = self.tracker.by_run_spec(&spec.id).await?;
        self.wind_down(spec, instances, Goal::Decommissioned).await?;
        self.queue.purge(&spec.id).await;
        self.wait_for(spec, cancel, |instances| instances.is_empty(), "stop drained")
            .await
    }

    async fn wait_for_healthy(
        &self,
        spec: &RunSpec,
        target: usize,
        cancel: &watch::Receiver<bool>,
    ) -> DeployResult<()> {
        self.wait_for(
            spec,
            cancel,
            move |instances| {
                instances
                    .iter()
                    .filter(|i| i.is_running_and_healthy())
                    .count()
                    >= target
            },
            "capacity reached",
        )
        .await
    }

    async fn wait_for(
        &self,
        spec: &RunSpec,
        cancel: &watch::Receiver<bool>,
        satisfied: impl Fn(&[Instance]) -> bool,
        what: &str,
    ) -> DeployResult<()> {
        let deadline = tokio::time::Instant::now() + self.config.step_timeout;
        loop {
            if *cancel.borrow() {
                return Err(DeployError::Cancelled(spec.id.to_string()));
            }
            let instances = self.tracker.by_run_spec(&spec.id).await?;
            if satisfied(&instances) {
                debug!(spec = %spec.id, what, "wait satisfied");
                return Ok(());
            }
            if tokio::time::Instant::now() >= deadline {
                return Err(DeployError::StepFailed {
                    plan_id: String::new(),
                    step: 0,
                    reason: format!("waiting on {} for {what} timed out", spec.id),
                });
            }
            tokio::time::sleep(self.config.poll_interval).await;
        }
    }
}
