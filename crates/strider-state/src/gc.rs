//! Storage compaction.
//!
//! Every write leaves a version row behind; the compactor walks the key
//! space in bounded batches and trims each key to `max_versions`, oldest
//! first. Versions still referenced stay: the current pointer always,
//! and for the root group any version an in-flight deployment holds as
//! its original or target.

use std::collections::HashSet;

use tracing::{debug, info};

use crate::error::StateResult;
use crate::repository::{DeploymentRepository, GROUP_PREFIX};
use crate::store::KvStore;

/// Outcome of one compaction run.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CompactionStats {
    pub keys_scanned: usize,
    pub versions_removed: usize,
}

/// Batched version trimmer.
pub struct Compactor {
    store: KvStore,
    deployments: DeploymentRepository,
    max_versions: usize,
    scan_batch_size: usize,
    /// Resume point: the next run starts after this key.
    cursor: Option<String>,
}

impl Compactor {
    pub fn new(
        store: KvStore,
        deployments: DeploymentRepository,
        max_versions: usize,
        scan_batch_size: usize,
    ) -> Self {
        Self {
            store,
            deployments,
            max_versions: max_versions.max(1),
            scan_batch_size: scan_batch_size.max(1),
            cursor: None,
        }
    }

    /// Root versions pinned by in-flight deployments.
    fn pinned_root_versions(&self) -> StateResult<HashSet<u64>> {
        let mut pinned = HashSet::new();
        for plan in self.deployments.all()? {
            pinned.insert(plan.original_version);
            pinned.insert(plan.target_version);
        }
        Ok(pinned)
    }

    /// Scan up to one batch of keys and trim their version trails.
    /// Wraps around the key space; returns what was removed.
    pub fn run_once(&mut self) -> StateResult<CompactionStats> {
        let mut keys = self.store.ids("")?;
        keys.sort();
        if keys.is_empty() {
            return Ok(CompactionStats::default());
        }

        let start = match &self.cursor {
            Some(cursor) => keys.iter().position(|k| k > cursor).unwrap_or(0),
            None => 0,
        };
        let batch: Vec<String> = keys
            .iter()
            .cycle()
            .skip(start)
            .take(self.scan_batch_size.min(keys.len()))
            .cloned()
            .collect();

        let pinned_roots = self.pinned_root_versions()?;
        let mut stats = CompactionStats::default();

        for key in &batch {
            stats.keys_scanned += 1;
            let versions = self.store.versions(key)?;
            if versions.len() <= self.max_versions {
                continue;
            }
            let excess = versions.len() - self.max_versions;
            let is_root = key.starts_with(GROUP_PREFIX);
            let mut removed_for_key = 0;
            for version in versions.into_iter().take(excess) {
                if is_root && pinned_roots.contains(&version) {
                    continue;
                }
                if self.store.delete_version(key, version)? {
                    removed_for_key += 1;
                }
            }
            if removed_for_key > 0 {
                debug!(%key, removed = removed_for_key, "compacted version trail");
            }
            stats.versions_removed += removed_for_key;
        }

        self.cursor = batch.last().cloned();
        if stats.versions_removed > 0 {
            info!(
                keys = stats.keys_scanned,
                removed = stats.versions_removed,
                "storage compaction pass complete"
            );
        }
        Ok(stats)
    }
}
