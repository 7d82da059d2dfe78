//! The per-offer matcher.
//!
//! Walks the demand entries against one offer and decides, per spec, a
//! `Match` (which scheduled instances launch here) or a `NoMatch` with
//! enumerated reasons. Reasons are totally ordered by the funnel; the
//! primary reason of a `NoMatch` is the minimum — that is what the
//! launch-queue statistics aggregate.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use strider_core::constraint::{ConstraintField, ConstraintOperator};
use strider_core::instance::{Instance, InstanceId};
use strider_core::spec::RunSpec;
use strider_core::Resources;
use tracing::trace;

use crate::constraints::{check_constraint, PlacementContext};
use crate::offer::Offer;

/// Why a spec did not match an offer. Variant order IS the funnel
/// order; the primary reason of a no-match is the minimum.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub enum NoMatchReason {
    UnfulfilledRole,
    UnfulfilledConstraint,
    NoCorrespondingReservationFound,
    InsufficientCpus,
    InsufficientMemory,
    InsufficientDisk,
    InsufficientGpus,
    DeclinedScarceResources,
}

/// One scheduled instance the matcher placed on the offer.
#[derive(Debug, Clone, PartialEq)]
pub struct InstanceMatch {
    pub instance_id: InstanceId,
    /// Launch against an existing reservation instead of fresh resources.
    pub existing_reservation: bool,
}

/// Per-spec outcome for one offer.
#[derive(Debug, Clone, PartialEq)]
pub enum OfferMatchResult {
    Match {
        run_spec_id: strider_core::AbsolutePathId,
        instances: Vec<InstanceMatch>,
        /// Unreserved resources the match consumes.
        consumed: Resources,
    },
    NoMatch {
        run_spec_id: strider_core::AbsolutePathId,
        offer_id: String,
        reasons: Vec<NoMatchReason>,
    },
}

impl OfferMatchResult {
    pub fn is_match(&self) -> bool {
        matches!(self, OfferMatchResult::Match { .. })
    }

    /// The minimum reason by funnel order.
    pub fn primary_reason(&self) -> Option<NoMatchReason> {
        match self {
            OfferMatchResult::Match { .. } => None,
            OfferMatchResult::NoMatch { reasons, .. } => reasons.iter().copied().min(),
        }
    }
}

/// Demand for one spec: who is waiting and who is already placed.
#[derive(Debug, Clone)]
pub struct SpecDemand {
    pub spec: RunSpec,
    /// Instances awaiting resources (condition `Scheduled`).
    pub scheduled: Vec<Instance>,
    /// Active instances, for constraint evaluation.
    pub placed: Vec<Instance>,
    /// Persisted CLUSTER pins, keyed by constraint field name.
    pub cluster_pins: HashMap<String, String>,
}

/// Matcher knobs.
#[derive(Debug, Clone, Default)]
pub struct MatcherConfig {
    pub max_instances_per_offer: u32,
    /// The leader's region, learned at registration.
    pub local_region: Option<String>,
}

/// Whether the spec explicitly targets the given region through a
/// placement constraint.
fn targets_region(spec: &RunSpec, region: &str) -> bool {
    spec.constraints.iter().any(|c| {
        c.field == ConstraintField::Region
            && match &c.operator {
                ConstraintOperator::Cluster { value } => value == region,
                ConstraintOperator::Like { pattern } => {
                    regex::Regex::new(&format!("^(?:{pattern})$"))
                        .map(|re| re.is_match(region))
                        .unwrap_or(false)
                }
                _ => false,
            }
    })
}

fn insufficient_reasons(demand: &Resources, available: &Resources) -> Vec<NoMatchReason> {
    let mut reasons = Vec::new();
    if demand.cpus > available.cpus {
        reasons.push(NoMatchReason::InsufficientCpus);
    }
    if demand.mem > available.mem {
        reasons.push(NoMatchReason::InsufficientMemory);
    }
    if demand.disk > available.disk {
        reasons.push(NoMatchReason::InsufficientDisk);
    }
    if demand.gpus > available.gpus {
        reasons.push(NoMatchReason::InsufficientGpus);
    }
    reasons
}

/// Match one offer against the current demand. Entries are considered
/// in order; earlier entries consume resources first.
pub fn match_offer(
    offer: &Offer,
    demand: &[SpecDemand],
    config: &MatcherConfig,
) -> Vec<OfferMatchResult> {
    let mut remaining = offer.resources;
    let mut results = Vec::new();

    for entry in demand {
        if entry.scheduled.is_empty() {
            continue;
        }
        let spec = &entry.spec;

        // Offers from a remote region serve only specs that target that
        // region explicitly.
        if let (Some(local), Some(region)) = (&config.local_region, &offer.agent.region) {
            if region != local && !targets_region(spec, region) {
                results.push(OfferMatchResult::NoMatch {
                    run_spec_id: spec.id.clone(),
                    offer_id: offer.id.clone(),
                    reasons: vec![NoMatchReason::UnfulfilledConstraint],
                });
                continue;
            }
        }

        // Role gate: the spec must accept at least one of the offer's
        // resource roles.
        if !spec
            .accepted_resource_roles
            .iter()
            .any(|role| offer.resource_roles.contains(role))
        {
            results.push(OfferMatchResult::NoMatch {
                run_spec_id: spec.id.clone(),
                offer_id: offer.id.clone(),
                reasons: vec![NoMatchReason::UnfulfilledRole],
            });
            continue;
        }

        // Scarce resources are not burned on specs that don't ask for
        // them.
        if offer.resources.gpus > 0.0 && spec.resources.gpus == 0.0 {
            results.push(OfferMatchResult::NoMatch {
                run_spec_id: spec.id.clone(),
                offer_id: offer.id.clone(),
                reasons: vec![NoMatchReason::DeclinedScarceResources],
            });
            continue;
        }

        let before = remaining;
        let mut placed = entry.placed.clone();
        let mut matched = Vec::new();
        let mut reasons = Vec::new();

        for instance in &entry.scheduled {
            if matched.len() as u32 >= config.max_instances_per_offer {
                break;
            }

            let ctx = PlacementContext {
                placed: &placed,
                cluster_pins: &entry.cluster_pins,
            };
            if !spec
                .constraints
                .iter()
                .all(|c| check_constraint(c, &offer.agent, &ctx))
            {
                reasons.push(NoMatchReason::UnfulfilledConstraint);
                // Same agent, same verdict for every further instance.
                break;
            }

            if let Some(reservation) = &instance.reservation {
                // Resident re-launch: only this agent's offer carrying
                // the reservation will do.
                if reservation.agent_id != offer.agent.agent_id
                    || offer.reservation_for(&instance.id.to_string()).is_none()
                {
                    reasons.push(NoMatchReason::NoCorrespondingReservationFound);
                    continue;
                }
                matched.push(InstanceMatch {
                    instance_id: instance.id.clone(),
                    existing_reservation: true,
                });
            } else {
                // Fresh launch; resident specs additionally reserve
                // their persistent-volume disk.
                let needed = if spec.is_resident() {
                    spec.total_resources()
                } else {
                    spec.resources
                };
                let missing = insufficient_reasons(&needed, &remaining);
                if !missing.is_empty() {
                    reasons.extend(missing);
                    break;
                }
                remaining = remaining.minus(&needed);
                matched.push(InstanceMatch {
                    instance_id: instance.id.clone(),
                    existing_reservation: false,
                });
            }

            // Count this placement for subsequent constraint checks.
            let mut simulated = instance.clone();
            simulated.agent = Some(offer.agent.clone());
            placed.push(simulated);
        }

        trace!(
            spec = %spec.id,
            offer = %offer.id,
            matched = matched.len(),
            "offer evaluated"
        );

        if matched.is_empty() {
            results.push(OfferMatchResult::NoMatch {
                run_spec_id: spec.id.clone(),
                offer_id: offer.id.clone(),
                reasons,
            });
        } else {
            results.push(OfferMatchResult::Match {
                run_spec_id: spec.id.clone(),
                instances: matched,
                consumed: before.minus(&remaining),
            });
        }
    }

    results
}

#[cfg(test)]
mod tests {
    use super::*;
    use strider_core::instance::{AgentInfo, Reservation, ReservationState};
    use strider_core::spec::VolumeSpec;
    use strider_core::AbsolutePathId;

    fn agent(host: &str) -> AgentInfo {
        AgentInfo {
            agent_id: format!("agent-{host}"),
            host: host.to_string(),
            region: None,
            zone: None,
            attributes: HashMap::new(),
        }
    }

    fn offer(host: &str, resources: Resources) -> Offer {
        Offer {
            id: format!("offer-{host}"),
            agent: agent(host),
            resources,
            resource_roles: vec!["*".to_string()],
            reservations: Vec::new(),
        }
    }

    fn spec(id: &str) -> RunSpec {
        let mut s = RunSpec::app(AbsolutePathId::parse(id).unwrap(), 1);
        s.resources = Resources::new(1.0, 128.0, 0.0, 0.0);
        s
    }

    fn scheduled_instances(spec: &RunSpec, count: u64) -> Vec<Instance> {
        (0..count)
            .map(|n| Instance::scheduled(InstanceId::new(spec.id.clone(), n), spec.version, 1000))
            .collect()
    }

    fn demand(spec: RunSpec, count: u64) -> SpecDemand {
        let scheduled = scheduled_instances(&spec, count);
        SpecDemand {
            spec,
            scheduled,
            placed: Vec::new(),
            cluster_pins: HashMap::new(),
        }
    }

    fn config() -> MatcherConfig {
        MatcherConfig {
            max_instances_per_offer: 5,
            local_region: None,
        }
    }

    #[test]
    fn matches_up_to_offer_capacity() {
        let offer = offer("h1", Resources::new(2.5, 1024.0, 0.0, 0.0));
        let results = match_offer(&offer, &[demand(spec("/svc"), 5)], &config());

        match &results[0] {
            OfferMatchResult::Match {
                instances,
                consumed,
                ..
            } => {
                // 2.5 cpus fit two 1-cpu instances.
                assert_eq!(instances.len(), 2);
                assert_eq!(consumed.cpus, 2.0);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn max_instances_per_offer_caps_match() {
        let offer = offer("h1", Resources::new(100.0, 100_000.0, 0.0, 0.0));
        let results = match_offer(
            &offer,
            &[demand(spec("/svc"), 10)],
            &MatcherConfig {
                max_instances_per_offer: 3,
                local_region: None,
            },
        );

        match &results[0] {
            OfferMatchResult::Match { instances, .. } => assert_eq!(instances.len(), 3),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn insufficient_memory_reason() {
        let offer = offer("h1", Resources::new(4.0, 64.0, 0.0, 0.0));
        let results = match_offer(&offer, &[demand(spec("/svc"), 1)], &config());

        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::InsufficientMemory)
        );
    }

    #[test]
    fn role_mismatch_reason() {
        let mut offer = offer("h1", Resources::new(4.0, 1024.0, 0.0, 0.0));
        offer.resource_roles = vec!["prod".to_string()];
        let results = match_offer(&offer, &[demand(spec("/svc"), 1)], &config());

        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::UnfulfilledRole)
        );
    }

    #[test]
    fn funnel_order_picks_primary() {
        let result = OfferMatchResult::NoMatch {
            run_spec_id: AbsolutePathId::parse("/svc").unwrap(),
            offer_id: "offer-1".to_string(),
            reasons: vec![
                NoMatchReason::InsufficientMemory,
                NoMatchReason::UnfulfilledConstraint,
                NoMatchReason::InsufficientCpus,
            ],
        };
        assert_eq!(
            result.primary_reason(),
            Some(NoMatchReason::UnfulfilledConstraint)
        );
    }

    #[test]
    fn constraint_violation_reason() {
        let mut s = spec("/svc");
        s.constraints.push(strider_core::Constraint::unique_hostname());
        let mut d = demand(s, 1);
        // One instance already on h1.
        let mut occupied = d.scheduled[0].clone();
        occupied.agent = Some(agent("h1"));
        d.placed.push(occupied);

        let offer = offer("h1", Resources::new(4.0, 1024.0, 0.0, 0.0));
        let results = match_offer(&offer, &[d], &config());
        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::UnfulfilledConstraint)
        );
    }

    #[test]
    fn unique_constraint_limits_one_per_offer() {
        let mut s = spec("/svc");
        s.constraints.push(strider_core::Constraint::unique_hostname());
        let offer = offer("h1", Resources::new(100.0, 100_000.0, 0.0, 0.0));
        let results = match_offer(&offer, &[demand(s, 5)], &config());

        // The first placement occupies h1; the second violates UNIQUE.
        match &results[0] {
            OfferMatchResult::Match { instances, .. } => assert_eq!(instances.len(), 1),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn resident_spec_reserves_volume_disk() {
        let mut s = spec("/rt/write");
        s.resources = Resources::new(0.001, 1.0, 1.0, 0.0);
        s.volumes.push(VolumeSpec::Persistent {
            container_path: "pv".to_string(),
            size_mib: 2,
        });

        // Offer disk covers cmd disk but not the volume: 2.0 < 3.0.
        let small = offer("h1", Resources::new(1.0, 64.0, 2.0, 0.0));
        let results = match_offer(&small, &[demand(s.clone(), 1)], &config());
        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::InsufficientDisk)
        );

        let big = offer("h1", Resources::new(1.0, 64.0, 3.0, 0.0));
        let results = match_offer(&big, &[demand(s, 1)], &config());
        assert!(results[0].is_match());
    }

    #[test]
    fn reserved_instance_needs_its_reservation() {
        let s = spec("/rt/write");
        let mut d = demand(s, 1);
        d.scheduled[0].reservation = Some(Reservation {
            agent_id: "agent-h1".to_string(),
            state: ReservationState::Suspended,
            resources: Resources::new(0.001, 1.0, 3.0, 0.0),
            volume_ids: vec!["vol-1".to_string()],
            labels: HashMap::new(),
        });

        // Offer from another agent: no reservation there.
        let elsewhere = offer("h2", Resources::new(4.0, 1024.0, 100.0, 0.0));
        let results = match_offer(&elsewhere, &[d.clone()], &config());
        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::NoCorrespondingReservationFound)
        );

        // Offer from the right agent carrying the labeled reservation.
        let mut home = offer("h1", Resources::new(4.0, 1024.0, 100.0, 0.0));
        let mut labels = HashMap::new();
        labels.insert(
            Reservation::INSTANCE_LABEL.to_string(),
            d.scheduled[0].id.to_string(),
        );
        home.reservations.push(crate::offer::OfferedReservation {
            resources: Resources::new(0.001, 1.0, 3.0, 0.0),
            volume_ids: vec!["vol-1".to_string()],
            labels,
        });
        let results = match_offer(&home, &[d], &config());
        match &results[0] {
            OfferMatchResult::Match { instances, consumed, .. } => {
                assert!(instances[0].existing_reservation);
                // Reserved launches consume no unreserved resources.
                assert!(consumed.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn gpu_offer_declined_for_non_gpu_spec() {
        let offer = offer("h1", Resources::new(4.0, 1024.0, 0.0, 2.0));
        let results = match_offer(&offer, &[demand(spec("/svc"), 1)], &config());
        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::DeclinedScarceResources)
        );
    }

    #[test]
    fn remote_region_only_for_targeting_specs() {
        let mut offer = offer("h1", Resources::new(4.0, 1024.0, 0.0, 0.0));
        offer.agent.region = Some("east".to_string());
        let config = MatcherConfig {
            max_instances_per_offer: 5,
            local_region: Some("west".to_string()),
        };

        let plain = demand(spec("/svc"), 1);
        let results = match_offer(&offer, &[plain], &config);
        assert_eq!(
            results[0].primary_reason(),
            Some(NoMatchReason::UnfulfilledConstraint)
        );

        let mut targeting = spec("/east-svc");
        targeting.constraints.push(strider_core::Constraint::new(
            ConstraintField::Region,
            ConstraintOperator::Cluster {
                value: "east".to_string(),
            },
        ));
        let results = match_offer(&offer, &[demand(targeting, 1)], &config);
        assert!(results[0].is_match());
    }

    #[test]
    fn earlier_entries_consume_first() {
        let offer = offer("h1", Resources::new(1.5, 1024.0, 0.0, 0.0));
        let results = match_offer(
            &offer,
            &[demand(spec("/a"), 1), demand(spec("/b"), 1)],
            &config(),
        );

        assert!(results[0].is_match());
        assert_eq!(
            results[1].primary_reason(),
            Some(NoMatchReason::InsufficientCpus)
        );
    }

    #[test]
    fn entries_without_demand_are_skipped() {
        let offer = offer("h1", Resources::new(4.0, 1024.0, 0.0, 0.0));
        let results = match_offer(&offer, &[demand(spec("/idle"), 0)], &config());
        assert!(results.is_empty());
    }
}
