//! Offer matching — which specs launch where.
//!
//! Given one offer and the current demand, decide which (spec, count) to
//! launch against it, or enumerate why not. The evaluator is pure: it
//! reads the offer, the placed instances, and the placement context, and
//! produces no side effects.

mod constraints;
mod matcher;
mod offer;

pub use constraints::{check_constraint, field_value, PlacementContext};
pub use matcher::{
    match_offer, InstanceMatch, MatcherConfig, NoMatchReason, OfferMatchResult, SpecDemand,
};
pub use offer::{Offer, OfferedReservation};
