//! Typed repositories over the versioned store.
//!
//! Four aggregates are persisted under distinct prefixes: the root group
//! (CAS-guarded), instance records, deployment plans, and the framework
//! id. Values are JSON, matching the store's byte columns.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tracing::debug;

use strider_core::deployment::DeploymentPlan;
use strider_core::group::RootGroup;
use strider_core::instance::{Instance, InstanceId};

use crate::error::{StateError, StateResult};
use crate::store::KvStore;

pub const GROUP_PREFIX: &str = "group:";
pub const INSTANCE_PREFIX: &str = "instance:";
pub const DEPLOYMENT_PREFIX: &str = "deployment:";
pub const FRAMEWORK_KEY: &str = "framework:id";

const ROOT_KEY: &str = "group:/";

fn encode<T: Serialize>(value: &T) -> StateResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| StateError::Serialize(e.to_string()))
}

fn decode<T: DeserializeOwned>(bytes: &[u8]) -> StateResult<T> {
    serde_json::from_slice(bytes).map_err(|e| StateError::Deserialize(e.to_string()))
}

// ── Root group ──────────────────────────────────────────────────────

/// The root group, updated only through compare-and-set against its
/// version timestamp.
#[derive(Clone)]
pub struct GroupRepository {
    store: KvStore,
}

impl GroupRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Persist a new root. `expected` is the version the caller read;
    /// `None` claims an empty store. Conflicts are retryable.
    pub fn store_root(&self, root: &RootGroup, expected: Option<u64>) -> StateResult<()> {
        let bytes = encode(root)?;
        self.store
            .store_cas(ROOT_KEY, root.version, &bytes, expected)?;
        debug!(version = root.version, "root group stored");
        Ok(())
    }

    /// The latest persisted root, if any.
    pub fn root(&self) -> StateResult<Option<RootGroup>> {
        match self.store.get(ROOT_KEY)? {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// All retained root versions, ascending.
    pub fn root_versions(&self) -> StateResult<Vec<u64>> {
        self.store.versions(ROOT_KEY)
    }

    /// A specific historical root.
    pub fn root_version(&self, version: u64) -> StateResult<Option<RootGroup>> {
        match self.store.get_version(ROOT_KEY, version)? {
            Some(bytes) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }
}

// ── Instances ───────────────────────────────────────────────────────

/// Instance records. Unversioned in practice — each write moves the
/// current pointer and compaction trims the trail.
#[derive(Clone)]
pub struct InstanceRepository {
    store: KvStore,
}

impl InstanceRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    fn key(id: &InstanceId) -> String {
        format!("{INSTANCE_PREFIX}{id}")
    }

    pub fn put(&self, instance: &Instance, version: u64) -> StateResult<()> {
        let bytes = encode(instance)?;
        self.store.store(&Self::key(&instance.id), version, &bytes)
    }

    pub fn get(&self, id: &InstanceId) -> StateResult<Option<Instance>> {
        match self.store.get(&Self::key(id))? {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &InstanceId) -> StateResult<bool> {
        self.store.delete(&Self::key(id))
    }

    /// All persisted instances.
    pub fn all(&self) -> StateResult<Vec<Instance>> {
        let mut out = Vec::new();
        for key in self.store.ids(INSTANCE_PREFIX)? {
            if let Some((_, bytes)) = self.store.get(&key)? {
                out.push(decode(&bytes)?);
            }
        }
        Ok(out)
    }
}

// ── Deployments ─────────────────────────────────────────────────────

/// In-flight deployment plans. A stored plan pins its original and
/// target root versions against garbage collection.
#[derive(Clone)]
pub struct DeploymentRepository {
    store: KvStore,
}

impl DeploymentRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    fn key(id: &str) -> String {
        format!("{DEPLOYMENT_PREFIX}{id}")
    }

    pub fn put(&self, plan: &DeploymentPlan, version: u64) -> StateResult<()> {
        let bytes = encode(plan)?;
        self.store.store(&Self::key(&plan.id), version, &bytes)
    }

    pub fn get(&self, id: &str) -> StateResult<Option<DeploymentPlan>> {
        match self.store.get(&Self::key(id))? {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    pub fn delete(&self, id: &str) -> StateResult<bool> {
        self.store.delete(&Self::key(id))
    }

    pub fn all(&self) -> StateResult<Vec<DeploymentPlan>> {
        let mut out = Vec::new();
        for key in self.store.ids(DEPLOYMENT_PREFIX)? {
            if let Some((_, bytes)) = self.store.get(&key)? {
                out.push(decode(&bytes)?);
            }
        }
        Ok(out)
    }
}

// ── Framework id ────────────────────────────────────────────────────

/// The framework id assigned by the broker at first registration.
#[derive(Clone)]
pub struct FrameworkIdRepository {
    store: KvStore,
}

impl FrameworkIdRepository {
    pub fn new(store: KvStore) -> Self {
        Self { store }
    }

    /// Idempotent: storing the id already present is a no-op.
    pub fn set(&self, framework_id: &str, version: u64) -> StateResult<()> {
        if self.get()?.as_deref() == Some(framework_id) {
            return Ok(());
        }
        let bytes = encode(&framework_id.to_string())?;
        self.store.store(FRAMEWORK_KEY, version, &bytes)
    }

    pub fn get(&self) -> StateResult<Option<String>> {
        match self.store.get(FRAMEWORK_KEY)? {
            Some((_, bytes)) => Ok(Some(decode(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Forget the framework id — used when the broker reports the
    /// framework removed, so the next leader registers fresh.
    pub fn clear(&self) -> StateResult<bool> {
        self.store.delete(FRAMEWORK_KEY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_core::group::Group;
    use strider_core::pathid::AbsolutePathId;
    use strider_core::spec::RunSpec;
    use strider_core::{DeploymentStep, Instance};

    fn store() -> KvStore {
        KvStore::open_in_memory().unwrap()
    }

    fn root_with(id: &str, version: u64) -> RootGroup {
        let mut root = Group::empty_root(version);
        root.put_run_spec(
            RunSpec::app(AbsolutePathId::parse(id).unwrap(), version),
            version,
        );
        root
    }

    fn instance(id: &str, nonce: u64) -> Instance {
        Instance::scheduled(
            InstanceId::new(AbsolutePathId::parse(id).unwrap(), nonce),
            1000,
            1000,
        )
    }

    #[test]
    fn root_roundtrip_and_versions() {
        let repo = GroupRepository::new(store());
        assert!(repo.root().unwrap().is_none());

        repo.store_root(&root_with("/a", 10), None).unwrap();
        repo.store_root(&root_with("/a", 20), Some(10)).unwrap();

        let root = repo.root().unwrap().unwrap();
        assert_eq!(root.version, 20);
        assert_eq!(repo.root_versions().unwrap(), vec![10, 20]);
        assert_eq!(repo.root_version(10).unwrap().unwrap().version, 10);
    }

    #[test]
    fn root_cas_conflict() {
        let repo = GroupRepository::new(store());
        repo.store_root(&root_with("/a", 10), None).unwrap();

        let err = repo
            .store_root(&root_with("/b", 30), Some(20))
            .unwrap_err();
        assert!(err.is_retryable());
        // Latest root unchanged.
        assert_eq!(repo.root().unwrap().unwrap().version, 10);
    }

    #[test]
    fn instance_crud() {
        let repo = InstanceRepository::new(store());
        let inst = instance("/svc", 1);

        repo.put(&inst, 1).unwrap();
        assert_eq!(repo.get(&inst.id).unwrap(), Some(inst.clone()));

        repo.put(&instance("/svc", 2), 1).unwrap();
        assert_eq!(repo.all().unwrap().len(), 2);

        assert!(repo.delete(&inst.id).unwrap());
        assert!(repo.get(&inst.id).unwrap().is_none());
        assert_eq!(repo.all().unwrap().len(), 1);
    }

    #[test]
    fn deployment_crud() {
        let repo = DeploymentRepository::new(store());
        let plan = DeploymentPlan {
            id: "plan-1".to_string(),
            original_version: 10,
            target_version: 20,
            steps: vec![DeploymentStep { actions: Vec::new() }],
        };

        repo.put(&plan, 20).unwrap();
        assert_eq!(repo.get("plan-1").unwrap(), Some(plan.clone()));
        assert_eq!(repo.all().unwrap().len(), 1);
        assert!(repo.delete("plan-1").unwrap());
        assert!(repo.get("plan-1").unwrap().is_none());
    }

    #[test]
    fn framework_id_lifecycle() {
        let repo = FrameworkIdRepository::new(store());
        assert!(repo.get().unwrap().is_none());

        repo.set("fw-123", 1).unwrap();
        assert_eq!(repo.get().unwrap().as_deref(), Some("fw-123"));

        // Idempotent re-set leaves a single version behind.
        repo.set("fw-123", 2).unwrap();
        assert_eq!(repo.get().unwrap().as_deref(), Some("fw-123"));

        assert!(repo.clear().unwrap());
        assert!(repo.get().unwrap().is_none());
    }
}
