//! The launch queue — per-spec backlog of instances needing resources.
//!
//! Each record tracks outstanding demand, the launch backoff, the
//! persisted CLUSTER pins, and a live fold of match statistics updated
//! on every launch attempt. Failures grow the delay geometrically;
//! an instance that stays running long enough resets it.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{debug, info};

use strider_core::spec::RunSpec;
use strider_core::{AbsolutePathId, Timestamp};
use strider_matcher::{NoMatchReason, OfferMatchResult};

/// An instance must run this long before its spec's backoff resets.
const STABLE_RUNNING_INTERVAL_SECS: u64 = 60;

/// Live match statistics for one spec.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueueStats {
    pub processed_offers: u64,
    pub matched_offers: u64,
    pub launched: u64,
    /// Primary no-match reasons seen, by count.
    pub no_match_reasons: HashMap<NoMatchReason, u64>,
    /// The most recent primary reason, if the last attempt failed.
    pub last_no_match: Option<NoMatchReason>,
}

/// Per-spec record.
#[derive(Debug, Clone)]
pub struct QueuedSpec {
    pub spec: RunSpec,
    /// Instances still needing resources.
    pub outstanding: u32,
    /// No launches before this deadline.
    pub backoff_until: Option<Timestamp>,
    current_delay_secs: f64,
    /// When a task of this spec last entered `Running`.
    running_since: Option<Timestamp>,
    /// Persisted CLUSTER pins (field name → pinned value).
    pub cluster_pins: HashMap<String, String>,
    pub stats: QueueStats,
}

impl QueuedSpec {
    fn new(spec: RunSpec) -> Self {
        let delay = spec.backoff.backoff_secs as f64;
        Self {
            spec,
            outstanding: 0,
            backoff_until: None,
            current_delay_secs: delay,
            running_since: None,
            cluster_pins: HashMap::new(),
            stats: QueueStats::default(),
        }
    }

    /// Ready to launch at `now`?
    pub fn is_ready(&self, now: Timestamp) -> bool {
        self.outstanding > 0 && self.backoff_until.is_none_or(|until| until <= now)
    }

    pub fn current_delay_secs(&self) -> f64 {
        self.current_delay_secs
    }
}

/// The queue. Cheap to clone; all clones share state.
#[derive(Clone, Default)]
pub struct LaunchQueue {
    entries: Arc<RwLock<HashMap<AbsolutePathId, QueuedSpec>>>,
}

impl LaunchQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add demand for a spec. Replaces the stored spec with the newer
    /// version so launches always use the latest content.
    pub async fn add(&self, spec: RunSpec, count: u32) {
        let mut entries = self.entries.write().await;
        let entry = entries
            .entry(spec.id.clone())
            .or_insert_with(|| QueuedSpec::new(spec.clone()));
        if spec.version >= entry.spec.version {
            entry.spec = spec;
        }
        entry.outstanding += count;
        debug!(spec = %entry.spec.id, outstanding = entry.outstanding, "demand added");
    }

    /// Take back demand, e.g. when scheduled instances are
    /// decommissioned before ever launching.
    pub async fn remove_demand(&self, id: &AbsolutePathId, count: u32) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.outstanding = entry.outstanding.saturating_sub(count);
        }
    }

    /// Drop a spec from the queue entirely.
    pub async fn purge(&self, id: &AbsolutePathId) {
        let removed = self.entries.write().await.remove(id).is_some();
        if removed {
            info!(spec = %id, "launch queue entry purged");
        }
    }

    /// Record the outcome of a launch attempt against one offer.
    pub async fn notify_launch_attempt(&self, id: &AbsolutePathId, result: &OfferMatchResult) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        entry.stats.processed_offers += 1;
        match result {
            OfferMatchResult::Match { instances, .. } => {
                entry.stats.matched_offers += 1;
                entry.stats.launched += instances.len() as u64;
                entry.stats.last_no_match = None;
                entry.outstanding = entry.outstanding.saturating_sub(instances.len() as u32);
            }
            OfferMatchResult::NoMatch { .. } => {
                if let Some(reason) = result.primary_reason() {
                    *entry.stats.no_match_reasons.entry(reason).or_insert(0) += 1;
                    entry.stats.last_no_match = Some(reason);
                }
            }
        }
    }

    /// A task of the spec failed: grow the backoff.
    pub async fn on_task_failed(&self, id: &AbsolutePathId, now: Timestamp) {
        let mut entries = self.entries.write().await;
        let Some(entry) = entries.get_mut(id) else {
            return;
        };
        let backoff = &entry.spec.backoff;
        entry.backoff_until = Some(now + (entry.current_delay_secs * 1000.0) as u64);
        entry.current_delay_secs = (entry.current_delay_secs * backoff.factor)
            .min(backoff.max_launch_delay_secs as f64);
        entry.running_since = None;
        debug!(
            spec = %id,
            delay_secs = entry.current_delay_secs,
            "launch backoff grown"
        );
    }

    /// A task of the spec entered `Running`.
    pub async fn on_task_running(&self, id: &AbsolutePathId, now: Timestamp) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.running_since.get_or_insert(now);
        }
    }

    /// Reset backoffs for specs that have been stably running. Called
    /// periodically alongside offer processing.
    pub async fn maintenance(&self, now: Timestamp) {
        let mut entries = self.entries.write().await;
        for entry in entries.values_mut() {
            if let Some(since) = entry.running_since {
                if now >= since + STABLE_RUNNING_INTERVAL_SECS * 1000 {
                    let base = entry.spec.backoff.backoff_secs as f64;
                    if entry.current_delay_secs > base {
                        debug!(spec = %entry.spec.id, "backoff reset after stable running");
                    }
                    entry.current_delay_secs = base;
                    entry.backoff_until = None;
                }
            }
        }
    }

    /// Record a CLUSTER pin learned from a first placement.
    pub async fn pin_cluster(&self, id: &AbsolutePathId, field: String, value: String) {
        let mut entries = self.entries.write().await;
        if let Some(entry) = entries.get_mut(id) {
            entry.cluster_pins.entry(field).or_insert(value);
        }
    }

    /// Specs ready to launch at `now`, with their records.
    pub async fn ready(&self, now: Timestamp) -> Vec<QueuedSpec> {
        let entries = self.entries.read().await;
        let mut ready: Vec<QueuedSpec> = entries
            .values()
            .filter(|e| e.is_ready(now))
            .cloned()
            .collect();
        ready.sort_by(|a, b| a.spec.id.cmp(&b.spec.id));
        ready
    }

    /// Whether any spec wants resources — the suppress/revive signal.
    pub async fn has_demand(&self) -> bool {
        self.entries
            .read()
            .await
            .values()
            .any(|e| e.outstanding > 0)
    }

    /// Snapshot of one spec's record.
    pub async fn get(&self, id: &AbsolutePathId) -> Option<QueuedSpec> {
        self.entries.read().await.get(id).cloned()
    }

    /// Snapshot of all statistics — the live fold consumers poll.
    pub async fn stats(&self) -> HashMap<AbsolutePathId, QueueStats> {
        self.entries
            .read()
            .await
            .iter()
            .map(|(id, e)| (id.clone(), e.stats.clone()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_core::instance::InstanceId;
    use strider_core::Resources;
    use strider_matcher::InstanceMatch;

    fn spec(id: &str) -> RunSpec {
        RunSpec::app(AbsolutePathId::parse(id).unwrap(), 1)
    }

    fn path(id: &str) -> AbsolutePathId {
        AbsolutePathId::parse(id).unwrap()
    }

    fn matched(id: &str, count: u64) -> OfferMatchResult {
        OfferMatchResult::Match {
            run_spec_id: path(id),
            instances: (0..count)
                .map(|n| InstanceMatch {
                    instance_id: InstanceId::new(path(id), n),
                    existing_reservation: false,
                })
                .collect(),
            consumed: Resources::default(),
        }
    }

    fn no_match(id: &str, reasons: Vec<NoMatchReason>) -> OfferMatchResult {
        OfferMatchResult::NoMatch {
            run_spec_id: path(id),
            offer_id: "offer-1".to_string(),
            reasons,
        }
    }

    #[tokio::test]
    async fn add_accumulates_demand() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 3).await;
        queue.add(spec("/svc"), 2).await;

        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.outstanding, 5);
        assert!(queue.has_demand().await);
    }

    #[tokio::test]
    async fn newer_spec_version_replaces() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 1).await;
        let mut newer = spec("/svc");
        newer.version = 99;
        newer.instances = 7;
        queue.add(newer, 0).await;

        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.spec.version, 99);
    }

    #[tokio::test]
    async fn match_decrements_outstanding() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 5).await;
        queue
            .notify_launch_attempt(&path("/svc"), &matched("/svc", 2))
            .await;

        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.outstanding, 3);
        assert_eq!(entry.stats.launched, 2);
        assert_eq!(entry.stats.matched_offers, 1);
    }

    #[tokio::test]
    async fn no_match_counts_primary_reason() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 1).await;
        queue
            .notify_launch_attempt(
                &path("/svc"),
                &no_match(
                    "/svc",
                    vec![
                        NoMatchReason::InsufficientMemory,
                        NoMatchReason::UnfulfilledRole,
                    ],
                ),
            )
            .await;

        let stats = queue.stats().await;
        let s = &stats[&path("/svc")];
        assert_eq!(s.last_no_match, Some(NoMatchReason::UnfulfilledRole));
        assert_eq!(s.no_match_reasons[&NoMatchReason::UnfulfilledRole], 1);
        assert!(!s.no_match_reasons.contains_key(&NoMatchReason::InsufficientMemory));
    }

    #[tokio::test]
    async fn backoff_grows_and_gates_readiness() {
        let queue = LaunchQueue::new();
        let mut s = spec("/svc");
        s.backoff.backoff_secs = 2;
        s.backoff.factor = 2.0;
        s.backoff.max_launch_delay_secs = 5;
        queue.add(s, 1).await;

        assert_eq!(queue.ready(1000).await.len(), 1);

        queue.on_task_failed(&path("/svc"), 1000).await;
        // Backed off for 2 s.
        assert!(queue.ready(1000).await.is_empty());
        assert!(queue.ready(2999).await.is_empty());
        assert_eq!(queue.ready(3000).await.len(), 1);

        // Delay doubled, capped at max.
        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.current_delay_secs(), 4.0);
        queue.on_task_failed(&path("/svc"), 3000).await;
        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.current_delay_secs(), 5.0);
    }

    #[tokio::test]
    async fn stable_running_resets_backoff() {
        let queue = LaunchQueue::new();
        let mut s = spec("/svc");
        s.backoff.backoff_secs = 1;
        s.backoff.factor = 3.0;
        queue.add(s, 1).await;

        queue.on_task_failed(&path("/svc"), 1000).await;
        queue.on_task_running(&path("/svc"), 2000).await;

        // Not yet stable.
        queue.maintenance(30_000).await;
        let entry = queue.get(&path("/svc")).await.unwrap();
        assert!(entry.current_delay_secs() > 1.0);

        // Stable for a minute.
        queue.maintenance(2000 + STABLE_RUNNING_INTERVAL_SECS * 1000).await;
        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.current_delay_secs(), 1.0);
        assert!(entry.backoff_until.is_none());
    }

    #[tokio::test]
    async fn purge_removes_entry() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 3).await;
        queue.purge(&path("/svc")).await;

        assert!(queue.get(&path("/svc")).await.is_none());
        assert!(!queue.has_demand().await);
    }

    #[tokio::test]
    async fn cluster_pin_sticks() {
        let queue = LaunchQueue::new();
        queue.add(spec("/svc"), 1).await;
        queue
            .pin_cluster(&path("/svc"), "hostname".to_string(), "h1".to_string())
            .await;
        // A second pin attempt does not overwrite the first.
        queue
            .pin_cluster(&path("/svc"), "hostname".to_string(), "h2".to_string())
            .await;

        let entry = queue.get(&path("/svc")).await.unwrap();
        assert_eq!(entry.cluster_pins["hostname"], "h1");
    }
}
