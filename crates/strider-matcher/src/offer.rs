//! Offers — resource bundles agents put up for a short window.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use strider_core::instance::AgentInfo;
use strider_core::Resources;

/// Reserved resources carried in an offer, bound to an instance by
/// reservation labels.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OfferedReservation {
    pub resources: Resources,
    pub volume_ids: Vec<String>,
    pub labels: HashMap<String, String>,
}

impl OfferedReservation {
    pub fn owner(&self) -> Option<&str> {
        self.labels
            .get(strider_core::Reservation::INSTANCE_LABEL)
            .map(String::as_str)
    }
}

/// One offer from the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Offer {
    pub id: String,
    pub agent: AgentInfo,
    /// Unreserved resources.
    pub resources: Resources,
    /// Roles of the resources in this offer (`*` = unreserved).
    pub resource_roles: Vec<String>,
    /// Reservations the offer carries back to their owners.
    pub reservations: Vec<OfferedReservation>,
}

impl Offer {
    /// The reservation owned by the given instance id, if offered.
    pub fn reservation_for(&self, instance_id: &str) -> Option<&OfferedReservation> {
        self.reservations
            .iter()
            .find(|r| r.owner() == Some(instance_id))
    }
}
