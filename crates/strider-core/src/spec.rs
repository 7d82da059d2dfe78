//! Run specs — the declarative description of a workload.
//!
//! A [`RunSpec`] is either an app (single task per instance) or a pod
//! (coscheduled task group). Both share identity, resources, placement
//! constraints, upgrade/unreachable strategies, and volumes. Specs are
//! immutable values; a change produces a new spec at a new version.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

use crate::constraint::Constraint;
use crate::pathid::AbsolutePathId;
use crate::Timestamp;

/// Resource demand (or supply) in broker units: fractional cpus/gpus,
/// mem and disk in MiB.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize, Default)]
pub struct Resources {
    pub cpus: f64,
    pub mem: f64,
    pub disk: f64,
    pub gpus: f64,
}

impl Resources {
    pub fn new(cpus: f64, mem: f64, disk: f64, gpus: f64) -> Self {
        Self { cpus, mem, disk, gpus }
    }

    /// True when every dimension of `self` fits within `available`.
    pub fn fits_within(&self, available: &Resources) -> bool {
        self.cpus <= available.cpus
            && self.mem <= available.mem
            && self.disk <= available.disk
            && self.gpus <= available.gpus
    }

    pub fn plus(&self, other: &Resources) -> Resources {
        Resources {
            cpus: self.cpus + other.cpus,
            mem: self.mem + other.mem,
            disk: self.disk + other.disk,
            gpus: self.gpus + other.gpus,
        }
    }

    pub fn minus(&self, other: &Resources) -> Resources {
        Resources {
            cpus: (self.cpus - other.cpus).max(0.0),
            mem: (self.mem - other.mem).max(0.0),
            disk: (self.disk - other.disk).max(0.0),
            gpus: (self.gpus - other.gpus).max(0.0),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.cpus == 0.0 && self.mem == 0.0 && self.disk == 0.0 && self.gpus == 0.0
    }
}

/// Two ratios governing how many old/new instances may coexist during an
/// upgrade or restart.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct UpgradeStrategy {
    /// Fraction of the target count that must stay running and healthy.
    pub minimum_health_capacity: f64,
    /// Fraction of the target count that may be launched on top of it.
    pub maximum_over_capacity: f64,
}

impl Default for UpgradeStrategy {
    fn default() -> Self {
        Self {
            minimum_health_capacity: 1.0,
            maximum_over_capacity: 1.0,
        }
    }
}

/// What happens to instances on agents the broker reports unreachable.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "snake_case")]
pub enum UnreachableStrategy {
    /// Never react; the instance stays `Unreachable` until it comes back.
    Disabled,
    /// Demote to inactive after `inactive_after_secs`, expunge and
    /// replace after `expunge_after_secs`.
    Enabled {
        inactive_after_secs: u64,
        expunge_after_secs: u64,
    },
}

impl UnreachableStrategy {
    /// Resident specs keep their reservation pinned to the lost agent, so
    /// they default to `Disabled`; everything else reacts.
    pub fn default_for(resident: bool, inactive_after_secs: u64, expunge_after_secs: u64) -> Self {
        if resident {
            UnreachableStrategy::Disabled
        } else {
            UnreachableStrategy::Enabled {
                inactive_after_secs,
                expunge_after_secs,
            }
        }
    }
}

/// Which instances to kill first when scaling down.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KillSelection {
    #[default]
    YoungestFirst,
    OldestFirst,
}

/// Behavior when a resident task's agent is lost.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskLostBehavior {
    #[default]
    WaitForever,
    RelaunchAfterTimeout,
}

/// Residency marks a spec as stateful: its instances own reservations and
/// persistent volumes that survive task restarts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Residency {
    pub relaunch_escalation_timeout_secs: u64,
    pub task_lost_behavior: TaskLostBehavior,
}

/// Volume descriptors carried on the spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum VolumeSpec {
    /// Local disk bound to a reservation, preserved across restarts.
    Persistent { container_path: String, size_mib: u64 },
    /// Provider-managed volume attached at launch.
    External {
        name: String,
        container_path: String,
        provider: String,
    },
    /// Scratch space that dies with the task.
    Ephemeral { container_path: String, size_mib: u64 },
    /// Secret material projected into the container.
    Secret { secret: String, container_path: String },
    /// Host directory bind-mount.
    Host {
        host_path: String,
        container_path: String,
    },
}

impl VolumeSpec {
    pub fn is_persistent(&self) -> bool {
        matches!(self, VolumeSpec::Persistent { .. })
    }

    /// Disk the volume claims out of a reservation, if any.
    pub fn reserved_disk_mib(&self) -> u64 {
        match self {
            VolumeSpec::Persistent { size_mib, .. } => *size_mib,
            _ => 0,
        }
    }
}

/// Health-check parameters for a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthCheckSpec {
    pub grace_period_secs: u64,
    pub interval_secs: u64,
    pub timeout_secs: u64,
    pub max_consecutive_failures: u32,
}

impl Default for HealthCheckSpec {
    fn default() -> Self {
        Self {
            grace_period_secs: 300,
            interval_secs: 60,
            timeout_secs: 20,
            max_consecutive_failures: 3,
        }
    }
}

/// Launch backoff parameters.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct BackoffSpec {
    pub backoff_secs: u64,
    pub factor: f64,
    pub max_launch_delay_secs: u64,
}

impl Default for BackoffSpec {
    fn default() -> Self {
        Self {
            backoff_secs: 1,
            factor: 1.15,
            max_launch_delay_secs: 3600,
        }
    }
}

/// Container image reference. Commands may also run directly on the agent
/// without one.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContainerSpec {
    pub image: String,
    /// Whether the image is pulled fresh on every launch.
    pub force_pull: bool,
}

/// An artifact fetched onto the agent before launch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchUri {
    pub uri: String,
    pub extract: bool,
    pub executable: bool,
    pub cache: bool,
}

/// Single-task workload payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct AppSpec {
    pub cmd: Option<String>,
    pub args: Vec<String>,
    pub env: HashMap<String, String>,
}

/// One task of a pod.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodTaskSpec {
    pub name: String,
    pub resources: Resources,
    pub cmd: Option<String>,
}

/// Coscheduled task group payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PodSpec {
    pub tasks: Vec<PodTaskSpec>,
}

/// The two run-spec variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Workload {
    App(AppSpec),
    Pod(PodSpec),
}

impl Workload {
    /// Names of the tasks one instance of this spec runs. Apps run a
    /// single task named `app`.
    pub fn task_names(&self) -> Vec<String> {
        match self {
            Workload::App(_) => vec!["app".to_string()],
            Workload::Pod(pod) => pod.tasks.iter().map(|t| t.name.clone()).collect(),
        }
    }
}

/// A declarative description of a long-running workload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunSpec {
    pub id: AbsolutePathId,
    /// Version timestamp; bumped on every content change.
    pub version: Timestamp,
    pub instances: u32,
    pub resources: Resources,
    pub role: String,
    /// Which reservation roles of an offer this spec may consume.
    /// `*` matches unreserved resources.
    pub accepted_resource_roles: Vec<String>,
    pub container: Option<ContainerSpec>,
    pub fetch: Vec<FetchUri>,
    pub constraints: Vec<Constraint>,
    /// App-to-app ordering edges for deployment planning.
    pub dependencies: Vec<AbsolutePathId>,
    pub health_check: Option<HealthCheckSpec>,
    pub upgrade: UpgradeStrategy,
    pub unreachable: UnreachableStrategy,
    pub kill_selection: KillSelection,
    pub residency: Option<Residency>,
    pub volumes: Vec<VolumeSpec>,
    pub backoff: BackoffSpec,
    pub workload: Workload,
}

impl RunSpec {
    /// A minimal app spec, used pervasively in tests and as the base for
    /// builder-style mutation.
    pub fn app(id: AbsolutePathId, version: Timestamp) -> Self {
        Self {
            id,
            version,
            instances: 1,
            resources: Resources::new(1.0, 128.0, 0.0, 0.0),
            role: "*".to_string(),
            accepted_resource_roles: vec!["*".to_string()],
            container: None,
            fetch: Vec::new(),
            constraints: Vec::new(),
            dependencies: Vec::new(),
            health_check: None,
            upgrade: UpgradeStrategy::default(),
            unreachable: UnreachableStrategy::default_for(false, 300, 600),
            kill_selection: KillSelection::default(),
            residency: None,
            volumes: Vec::new(),
            backoff: BackoffSpec::default(),
            workload: Workload::App(AppSpec::default()),
        }
    }

    /// A spec is resident when it owns a reservation: explicit residency
    /// or any persistent volume.
    pub fn is_resident(&self) -> bool {
        self.residency.is_some() || self.volumes.iter().any(VolumeSpec::is_persistent)
    }

    /// Total persistent-volume disk this spec reserves per instance.
    pub fn persistent_volume_disk_mib(&self) -> u64 {
        self.volumes.iter().map(VolumeSpec::reserved_disk_mib).sum()
    }

    /// Resources one instance demands, including persistent-volume disk
    /// for resident specs.
    pub fn total_resources(&self) -> Resources {
        let mut r = self.resources;
        r.disk += self.persistent_volume_disk_mib() as f64;
        r
    }

    /// Stable content hash with `instances` and `version` masked: two
    /// specs that differ only in count or timestamp hash the same, which
    /// is how the deployment planner tells a scale from a change.
    pub fn config_hash(&self) -> String {
        let mut masked = self.clone();
        masked.instances = 0;
        masked.version = 0;
        let json = serde_json::to_vec(&masked).expect("spec serializes");
        let digest = Sha256::digest(&json);
        format!("{digest:x}")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(id: &str) -> RunSpec {
        RunSpec::app(AbsolutePathId::parse(id).unwrap(), 1000)
    }

    #[test]
    fn resources_fit_and_arithmetic() {
        let demand = Resources::new(0.5, 64.0, 0.0, 0.0);
        let offer = Resources::new(1.0, 128.0, 10.0, 0.0);
        assert!(demand.fits_within(&offer));
        assert!(!offer.fits_within(&demand));

        let left = offer.minus(&demand);
        assert_eq!(left.cpus, 0.5);
        assert_eq!(left.mem, 64.0);

        // Subtraction saturates at zero.
        let drained = demand.minus(&offer);
        assert!(drained.is_empty());
    }

    #[test]
    fn residency_from_persistent_volume() {
        let mut s = spec("/rt/write");
        assert!(!s.is_resident());
        s.volumes.push(VolumeSpec::Persistent {
            container_path: "pv".to_string(),
            size_mib: 2,
        });
        assert!(s.is_resident());
        assert_eq!(s.persistent_volume_disk_mib(), 2);
    }

    #[test]
    fn total_resources_include_volume_disk() {
        let mut s = spec("/rt/write");
        s.resources = Resources::new(0.001, 1.0, 1.0, 0.0);
        s.volumes.push(VolumeSpec::Persistent {
            container_path: "pv".to_string(),
            size_mib: 2,
        });
        let total = s.total_resources();
        assert_eq!(total.disk, 3.0);
        assert_eq!(total.mem, 1.0);
    }

    #[test]
    fn unreachable_default_split() {
        assert_eq!(
            UnreachableStrategy::default_for(true, 300, 600),
            UnreachableStrategy::Disabled
        );
        assert_eq!(
            UnreachableStrategy::default_for(false, 300, 600),
            UnreachableStrategy::Enabled {
                inactive_after_secs: 300,
                expunge_after_secs: 600
            }
        );
    }

    #[test]
    fn config_hash_masks_instances_and_version() {
        let mut a = spec("/svc");
        let mut b = spec("/svc");
        b.instances = 5;
        b.version = 9999;
        assert_eq!(a.config_hash(), b.config_hash());

        a.resources.cpus = 2.0;
        assert_ne!(a.config_hash(), b.config_hash());
    }

    #[test]
    fn pod_task_names() {
        let pod = Workload::Pod(PodSpec {
            tasks: vec![
                PodTaskSpec {
                    name: "web".to_string(),
                    resources: Resources::new(0.1, 32.0, 0.0, 0.0),
                    cmd: None,
                },
                PodTaskSpec {
                    name: "sidecar".to_string(),
                    resources: Resources::new(0.1, 16.0, 0.0, 0.0),
                    cmd: None,
                },
            ],
        });
        assert_eq!(pod.task_names(), vec!["web", "sidecar"]);
        assert_eq!(Workload::App(AppSpec::default()).task_names(), vec!["app"]);
    }

    #[test]
    fn serializes_roundtrip() {
        let mut s = spec("/prod/api");
        s.residency = Some(Residency {
            relaunch_escalation_timeout_secs: 3600,
            task_lost_behavior: TaskLostBehavior::RelaunchAfterTimeout,
        });
        let json = serde_json::to_string(&s).unwrap();
        let back: RunSpec = serde_json::from_str(&json).unwrap();
        assert_eq!(back, s);
    }
}
