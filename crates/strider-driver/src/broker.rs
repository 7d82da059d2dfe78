//! The outbound broker surface.
//!
//! The native client library is not part of the core; everything it
//! must be able to do for us is this trait. The daemon plugs in the
//! real client, tests plug in a recorder.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use strider_core::instance::{NetworkInfo, TaskId, TaskState};
use strider_core::Timestamp;
use strider_launch::LaunchOperation;

use crate::error::DriverResult;

/// Master identity and topology info delivered at registration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MasterInfo {
    pub url: String,
    pub domain: Option<DomainInfo>,
}

/// The master's fault domain; placement biases toward its region.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DomainInfo {
    pub region: String,
    pub zone: String,
}

/// A task status update as delivered by the broker client shim, already
/// mapped onto typed ids.
#[derive(Debug, Clone, PartialEq)]
pub struct BrokerTaskStatus {
    pub task_id: TaskId,
    pub state: TaskState,
    pub message: String,
    pub network: NetworkInfo,
    pub healthy: Option<bool>,
    pub agent_id: String,
    pub timestamp: Timestamp,
}

/// Offer filters attached to accepts and declines.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct OfferFilters {
    /// How long the broker should withhold re-offering these resources.
    pub refuse_seconds: f64,
}

impl Default for OfferFilters {
    fn default() -> Self {
        Self { refuse_seconds: 5.0 }
    }
}

/// Everything the core sends toward the broker.
#[async_trait]
pub trait BrokerDriver: Send + Sync {
    async fn accept_offers(
        &self,
        offer_ids: &[String],
        operations: Vec<LaunchOperation>,
        filters: OfferFilters,
    ) -> DriverResult<()>;

    async fn decline_offer(&self, offer_id: &str, filters: OfferFilters) -> DriverResult<()>;

    async fn kill_task(&self, task_id: &str) -> DriverResult<()>;

    /// Ask for explicit status of the given tasks; answers arrive as
    /// ordinary status updates.
    async fn reconcile_tasks(&self, task_ids: Vec<String>) -> DriverResult<()>;

    async fn revive_offers(&self) -> DriverResult<()>;

    async fn suppress_offers(&self) -> DriverResult<()>;

    /// Stop the driver. `failover = true` keeps the framework id alive
    /// at the master so a new leader can pick it up.
    async fn stop(&self, failover: bool) -> DriverResult<()>;
}
