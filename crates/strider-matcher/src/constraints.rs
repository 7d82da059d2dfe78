//! Constraint evaluation.
//!
//! A pure function of (offer agent, placed instances, constraint). The
//! placement context additionally carries the CLUSTER pins: an empty
//! CLUSTER value pins to whatever agent matched first, and that pin is
//! state of the spec's placement, not of its instances.

use std::collections::HashMap;

use strider_core::constraint::{Constraint, ConstraintField, ConstraintOperator};
use strider_core::instance::{AgentInfo, Instance};

/// What the evaluator knows besides the offer.
#[derive(Debug)]
pub struct PlacementContext<'a> {
    /// Active instances of the spec under evaluation.
    pub placed: &'a [Instance],
    /// CLUSTER pins keyed by the constraint field's display name.
    pub cluster_pins: &'a HashMap<String, String>,
}

/// Read a constraint field off an agent.
pub fn field_value(agent: &AgentInfo, field: &ConstraintField) -> Option<String> {
    match field {
        ConstraintField::Hostname => Some(agent.host.clone()),
        ConstraintField::Region => agent.region.clone(),
        ConstraintField::Zone => agent.zone.clone(),
        ConstraintField::Attribute(name) => agent.attributes.get(name).cloned(),
    }
}

fn placed_values(placed: &[Instance], field: &ConstraintField) -> Vec<String> {
    placed
        .iter()
        .filter_map(|i| i.agent.as_ref())
        .filter_map(|a| field_value(a, field))
        .collect()
}

fn group_counts(placed: &[Instance], field: &ConstraintField) -> HashMap<String, usize> {
    let mut counts = HashMap::new();
    for value in placed_values(placed, field) {
        *counts.entry(value).or_insert(0) += 1;
    }
    counts
}

fn full_match(pattern: &str, value: &str) -> bool {
    match regex::Regex::new(&format!("^(?:{pattern})$")) {
        Ok(re) => re.is_match(value),
        // Validation rejects bad patterns up front; a pattern that still
        // slips through never matches.
        Err(_) => false,
    }
}

/// Evaluate one constraint against one offer.
pub fn check_constraint(
    constraint: &Constraint,
    agent: &AgentInfo,
    ctx: &PlacementContext<'_>,
) -> bool {
    let offer_value = field_value(agent, &constraint.field);

    match &constraint.operator {
        ConstraintOperator::Unique => match offer_value {
            Some(value) => !placed_values(ctx.placed, &constraint.field).contains(&value),
            None => false,
        },

        ConstraintOperator::Cluster { value } => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            if !value.is_empty() {
                return offer_value == *value;
            }
            // Empty value: pin to whatever matched first.
            if let Some(pinned) = ctx.cluster_pins.get(&constraint.field.to_string()) {
                return offer_value == *pinned;
            }
            match placed_values(ctx.placed, &constraint.field).first() {
                Some(first) => offer_value == *first,
                None => true,
            }
        }

        ConstraintOperator::GroupBy { min_groups } => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            let counts = group_counts(ctx.placed, &constraint.field);
            if !counts.contains_key(&offer_value) {
                // A new group always helps the spread.
                return true;
            }
            if let Some(min) = min_groups {
                if counts.len() < *min as usize {
                    // Still short of the demanded number of groups; only
                    // new groups are acceptable.
                    return false;
                }
            }
            let smallest = counts.values().copied().min().unwrap_or(0);
            counts[&offer_value] <= smallest
        }

        ConstraintOperator::Like { pattern } => match offer_value {
            Some(value) => full_match(pattern, &value),
            None => false,
        },

        ConstraintOperator::Unlike { pattern } => match offer_value {
            Some(value) => !full_match(pattern, &value),
            // A missing attribute cannot be "like" anything.
            None => true,
        },

        ConstraintOperator::MaxPer { limit } => {
            let Some(offer_value) = offer_value else {
                return false;
            };
            let counts = group_counts(ctx.placed, &constraint.field);
            counts.get(&offer_value).copied().unwrap_or(0) < *limit as usize
        }
    }
}
