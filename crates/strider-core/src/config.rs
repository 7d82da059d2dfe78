//! The recognized configuration surface.
//!
//! Every option the daemon exposes as a flag lands in [`SchedulerConfig`];
//! subsystems take what they need from it at wiring time.

use serde::{Deserialize, Serialize};

use crate::spec::TaskLostBehavior;

/// Scheduler-wide configuration with the documented defaults.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Upper bound on instances launched per (offer, run spec).
    pub max_instances_per_offer: u32,
    /// Budget for deciding on a single offer, in milliseconds. Offers not
    /// decided in time are declined.
    pub offer_matching_timeout_millis: u64,

    /// Capacity of the instance tracker's update mailbox.
    pub instance_tracker_update_queue_size: usize,
    /// How many distinct instance ids may have updates in flight at once.
    pub instance_tracker_num_parallel_updates: usize,
    /// Deadline for tracker queries, in milliseconds.
    pub instance_tracker_query_timeout_millis: u64,

    /// Initial launch backoff for specs that don't set their own.
    pub default_backoff_seconds: u64,
    /// Backoff multiplier applied per failure.
    pub default_backoff_factor: f64,
    /// Ceiling on the launch delay.
    pub max_launch_delay_seconds: u64,

    /// Upgrade-strategy defaults for specs that don't set their own.
    pub default_minimum_health_capacity: f64,
    pub default_maximum_over_capacity: f64,

    /// Resident relaunch escalation.
    pub residency_relaunch_escalation_timeout_seconds: u64,
    pub residency_task_lost_behavior: TaskLostBehavior,

    /// Unreachable-strategy defaults for non-resident specs.
    pub unreachable_inactive_after_seconds: u64,
    pub unreachable_expunge_after_seconds: u64,

    /// Versions retained per storage key before compaction trims.
    pub max_versions: usize,
    /// Keys scanned per compaction step.
    pub storage_compaction_scan_batch_size: usize,
    /// Seconds between compaction runs.
    pub storage_compaction_interval_seconds: u64,

    /// Seconds between reconciliation rounds, and the delay before the
    /// first one after election.
    pub reconciliation_interval_seconds: u64,
    pub reconciliation_initial_delay_seconds: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_instances_per_offer: 5,
            offer_matching_timeout_millis: 5_000,
            instance_tracker_update_queue_size: 1024,
            instance_tracker_num_parallel_updates: 16,
            instance_tracker_query_timeout_millis: 1_000,
            default_backoff_seconds: 1,
            default_backoff_factor: 1.15,
            max_launch_delay_seconds: 3600,
            default_minimum_health_capacity: 1.0,
            default_maximum_over_capacity: 1.0,
            residency_relaunch_escalation_timeout_seconds: 3600,
            residency_task_lost_behavior: TaskLostBehavior::WaitForever,
            unreachable_inactive_after_seconds: 300,
            unreachable_expunge_after_seconds: 600,
            max_versions: 50,
            storage_compaction_scan_batch_size: 64,
            storage_compaction_interval_seconds: 300,
            reconciliation_interval_seconds: 600,
            reconciliation_initial_delay_seconds: 15,
        }
    }
}
