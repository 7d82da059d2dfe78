//! The deployment planner.
//!
//! Diffs the current root against the target root into added, removed,
//! changed and scaled specs, orders them along the dependency DAG, and
//! emits steps of mutually independent actions. Also home to the pure
//! batch math the executor leans on.

use std::collections::{BTreeMap, HashMap, HashSet};

use tracing::debug;

use strider_core::deployment::{DeploymentAction, DeploymentPlan, DeploymentStep};
use strider_core::group::RootGroup;
use strider_core::instance::Instance;
use strider_core::spec::{KillSelection, RunSpec, UpgradeStrategy};
use strider_core::AbsolutePathId;

/// How a spec differs between the two roots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SpecChange {
    Added,
    Removed,
    /// Content differs at the stable-hash level.
    Changed,
    /// Only the instance count differs.
    Scaled,
}

fn classify(
    original: &HashMap<AbsolutePathId, &RunSpec>,
    target: &HashMap<AbsolutePathId, &RunSpec>,
) -> BTreeMap<AbsolutePathId, SpecChange> {
    let mut changes = BTreeMap::new();
    for (id, spec) in target {
        match original.get(id) {
            None => {
                changes.insert(id.clone(), SpecChange::Added);
            }
            Some(old) => {
                if old.config_hash() != spec.config_hash() {
                    changes.insert(id.clone(), SpecChange::Changed);
                } else if old.instances != spec.instances {
                    changes.insert(id.clone(), SpecChange::Scaled);
                }
            }
        }
    }
    for id in original.keys() {
        if !target.contains_key(id) {
            changes.insert(id.clone(), SpecChange::Removed);
        }
    }
    changes
}

/// Dependency depth per affected spec: a spec deploys after everything
/// it depends on. Depth 0 deploys first.
fn dependency_levels(
    target: &RootGroup,
    affected: &BTreeMap<AbsolutePathId, SpecChange>,
) -> HashMap<AbsolutePathId, usize> {
    let edges = target.dependency_edges();
    let mut depends_on: HashMap<&AbsolutePathId, Vec<&AbsolutePathId>> = HashMap::new();
    for (from, to) in &edges {
        depends_on.entry(from).or_default().push(to);
    }

    fn depth_of<'a>(
        id: &'a AbsolutePathId,
        depends_on: &HashMap<&'a AbsolutePathId, Vec<&'a AbsolutePathId>>,
        memo: &mut HashMap<&'a AbsolutePathId, usize>,
        visiting: &mut HashSet<&'a AbsolutePathId>,
    ) -> usize {
        if let Some(depth) = memo.get(id) {
            return *depth;
        }
        // Validation guarantees a DAG; the guard only stops runaway
        // recursion on unvalidated input.
        if !visiting.insert(id) {
            return 0;
        }
        let depth = depends_on
            .get(id)
            .map(|deps| {
                deps.iter()
                    .map(|d| depth_of(d, depends_on, memo, visiting) + 1)
                    .max()
                    .unwrap_or(0)
            })
            .unwrap_or(0);
        visiting.remove(id);
        memo.insert(id, depth);
        depth
    }

    let mut memo = HashMap::new();
    let mut visiting = HashSet::new();
    affected
        .keys()
        .map(|id| {
            let depth = depth_of(id, &depends_on, &mut memo, &mut visiting);
            (id.clone(), depth)
        })
        .collect()
}

/// Compute the ordered plan moving `original` to `target`.
///
/// Steps run dependency level by dependency level; removals come last
/// so nothing depending on a removed spec outlives it unserved.
pub fn plan_deployment(id: String, original: &RootGroup, target: &RootGroup) -> DeploymentPlan {
    let original_specs = original.run_specs_by_id();
    let target_specs = target.run_specs_by_id();
    let changes = classify(&original_specs, &target_specs);
    let levels = dependency_levels(target, &changes);

    let mut by_level: BTreeMap<usize, Vec<DeploymentAction>> = BTreeMap::new();
    let mut removals: Vec<DeploymentAction> = Vec::new();

    for (spec_id, change) in &changes {
        match change {
            SpecChange::Removed => {
                removals.push(DeploymentAction::StopApplication {
                    run_spec: (*original_specs[spec_id]).clone(),
                });
            }
            SpecChange::Added => {
                let spec = (*target_specs[spec_id]).clone();
                by_level
                    .entry(levels[spec_id])
                    .or_default()
                    .push(DeploymentAction::StartApplication { run_spec: spec });
            }
            SpecChange::Changed => {
                let spec = (*target_specs[spec_id]).clone();
                by_level
                    .entry(levels[spec_id])
                    .or_default()
                    .push(DeploymentAction::RestartApplication { run_spec: spec });
            }
            SpecChange::Scaled => {
                let spec = (*target_specs[spec_id]).clone();
                let to = spec.instances;
                by_level
                    .entry(levels[spec_id])
                    .or_default()
                    .push(DeploymentAction::ScaleApplication { run_spec: spec, to });
            }
        }
    }

    let mut steps: Vec<DeploymentStep> = by_level
        .into_values()
        .map(|actions| DeploymentStep { actions })
        .collect();
    if !removals.is_empty() {
        steps.push(DeploymentStep { actions: removals });
    }

    debug!(
        plan = %id,
        steps = steps.len(),
        affected = changes.len(),
        "deployment planned"
    );
    DeploymentPlan {
        id,
        original_version: original.version,
        target_version: target.version,
        steps,
    }
}

// ── Batch math ──────────────────────────────────────────────────────

/// What a restart iteration may do, derived from the upgrade strategy
/// and the observed instance counts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RestartBatch {
    /// Old-version instances to kill now.
    pub kill_old: usize,
    /// New-version instances to schedule now.
    pub launch_new: usize,
}

/// One iteration of the capacity-gated replacement loop.
///
/// `target` is the demanded count, `old_running` / `new_running` are
/// running-and-healthy counts, `old_total` / `new_total` include
/// everything alive or scheduled.
pub fn restart_batch(
    strategy: &UpgradeStrategy,
    target: usize,
    old_total: usize,
    old_running: usize,
    new_total: usize,
    new_running: usize,
) -> RestartBatch {
    let min_healthy = (strategy.minimum_health_capacity * target as f64).ceil() as usize;
    let max_total = target + (strategy.maximum_over_capacity * target as f64).ceil() as usize;

    // Kill whatever old capacity is no longer needed to hold the floor.
    let healthy = old_running + new_running;
    let mut kill_old = healthy.saturating_sub(min_healthy).min(old_total);

    // Launch as many new instances as the ceiling leaves room for.
    let total_after_kill = old_total + new_total - kill_old;
    let room = max_total.saturating_sub(total_after_kill);
    let launch_new = room.min(target.saturating_sub(new_total));

    // Deadlock escape: nothing to launch for lack of room and nothing
    // killable by the floor — trade one old instance for progress.
    if launch_new == 0 && kill_old == 0 && new_total < target && old_total > 0 {
        kill_old = 1;
    }

    RestartBatch {
        kill_old,
        launch_new,
    }
}

/// Pick which instances to kill when scaling down.
pub fn select_victims(
    mut instances: Vec<Instance>,
    count: usize,
    selection: KillSelection,
) -> Vec<Instance> {
    // Scheduled instances that never launched are the cheapest victims.
    instances.sort_by_key(|i| {
        let age_key = i.state.active_since.unwrap_or(i.scheduled_at);
        match selection {
            KillSelection::YoungestFirst => u64::MAX - age_key,
            KillSelection::OldestFirst => age_key,
        }
    });
    instances.sort_by_key(|i| i.state.active_since.is_some());
    instances.truncate(count);
    instances
}
