//! Persistence for the Strider orchestrator.
//!
//! A versioned key-value store backed by redb, plus typed repositories
//! for the four persisted aggregates: the root group, instance records,
//! the framework id, and deployment plans. Writes are linearizable per
//! key; the root group additionally updates only through compare-and-set
//! against its version.

mod error;
mod gc;
mod repository;
mod store;
mod tables;

pub use error::{StateError, StateResult};
pub use gc::{CompactionStats, Compactor};
pub use repository::{
    DeploymentRepository, FrameworkIdRepository, GroupRepository, InstanceRepository,
};
pub use store::KvStore;
