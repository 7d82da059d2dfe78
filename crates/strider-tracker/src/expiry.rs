//! The unreachable reaper.
//!
//! A background ticker that walks the tracker's instances and applies
//! each run spec's unreachable strategy: promote `Unreachable` to
//! `UnreachableInactive` after `inactive_after`, expunge after
//! `expunge_after`. Resident specs usually disable this entirely.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use strider_core::instance::{Condition, Instance};
use strider_core::spec::UnreachableStrategy;
use strider_core::{AbsolutePathId, Timestamp};

use crate::error::TrackerResult;
use crate::tracker::InstanceTracker;
use crate::updater::Op;

/// Looks up the unreachable strategy for a run spec — usually backed by
/// the current root group.
pub type UnreachableStrategyResolver =
    Arc<dyn Fn(&AbsolutePathId) -> UnreachableStrategy + Send + Sync>;

/// Outcome of one sweep.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub promoted: usize,
    pub expunged: usize,
}

/// Periodically applies unreachable strategies.
pub struct UnreachableReaper {
    tracker: InstanceTracker,
    resolver: UnreachableStrategyResolver,
    tick: Duration,
}

impl UnreachableReaper {
    pub fn new(
        tracker: InstanceTracker,
        resolver: UnreachableStrategyResolver,
        tick: Duration,
    ) -> Self {
        Self {
            tracker,
            resolver,
            tick,
        }
    }

    /// Tick until shutdown.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        info!(tick = ?self.tick, "unreachable reaper started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(self.tick) => {
                    if let Err(e) = self.sweep(strider_core::now_millis()).await {
                        warn!(error = %e, "unreachable sweep failed");
                    }
                }
                _ = shutdown.changed() => {
                    debug!("unreachable reaper shutting down");
                    break;
                }
            }
        }
    }

    /// One pass over all instances at time `now`.
    pub async fn sweep(&self, now: Timestamp) -> TrackerResult<SweepStats> {
        let mut stats = SweepStats::default();
        for instance in self.tracker.list().await? {
            let condition = instance.condition();
            if condition != Condition::Unreachable && condition != Condition::UnreachableInactive {
                continue;
            }
            let UnreachableStrategy::Enabled {
                inactive_after_secs,
                expunge_after_secs,
            } = (self.resolver)(instance.run_spec_id())
            else {
                continue;
            };
            let Some(since) = unreachable_since(&instance) else {
                continue;
            };

            if now >= since + expunge_after_secs * 1000 {
                debug!(instance = %instance.id, "unreachable past expunge deadline");
                self.tracker
                    .process(Op::ForceExpunge {
                        instance_id: instance.id.clone(),
                    })
                    .await?;
                stats.expunged += 1;
            } else if condition == Condition::Unreachable
                && now >= since + inactive_after_secs * 1000
            {
                self.tracker
                    .process(Op::MarkUnreachableInactive {
                        instance_id: instance.id.clone(),
                        now,
                    })
                    .await?;
                stats.promoted += 1;
            }
        }
        Ok(stats)
    }
}

/// When the instance first became unreachable: the earliest unreachable
/// task status timestamp, which promotion does not touch.
fn unreachable_since(instance: &Instance) -> Option<Timestamp> {
    instance
        .tasks
        .values()
        .filter(|t| {
            matches!(
                t.status.condition,
                Condition::Unreachable | Condition::UnreachableInactive
            )
        })
        .map(|t| t.status.timestamp)
        .min()
        .or(Some(instance.state.since))
}
