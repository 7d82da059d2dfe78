//! Placement constraints.
//!
//! A constraint is `(field, operator)` where the field is the agent
//! hostname, its region or zone, or a named agent attribute. Evaluation
//! lives in the matcher; this module only defines the shape.

use serde::{Deserialize, Serialize};
use std::fmt;

/// What the constraint reads off an offer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "field", content = "name", rename_all = "snake_case")]
pub enum ConstraintField {
    Hostname,
    Region,
    Zone,
    Attribute(String),
}

impl fmt::Display for ConstraintField {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConstraintField::Hostname => f.write_str("hostname"),
            ConstraintField::Region => f.write_str("@region"),
            ConstraintField::Zone => f.write_str("@zone"),
            ConstraintField::Attribute(name) => f.write_str(name),
        }
    }
}

impl ConstraintField {
    /// Parse the external field spelling: `hostname`, `@region`, `@zone`,
    /// anything else is an attribute name.
    pub fn parse(raw: &str) -> Self {
        match raw {
            "hostname" => ConstraintField::Hostname,
            "@region" => ConstraintField::Region,
            "@zone" => ConstraintField::Zone,
            other => ConstraintField::Attribute(other.to_string()),
        }
    }
}

/// The constraint operators.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ConstraintOperator {
    /// No two instances share the field value.
    Unique,
    /// All instances share one value. Empty value pins to whatever agent
    /// matched first.
    Cluster { value: String },
    /// Distribute evenly across field values. `min_groups` of `None`
    /// means "as many groups as exist".
    GroupBy { min_groups: Option<u32> },
    /// Field value must match the regex.
    Like { pattern: String },
    /// Field value must not match the regex. A missing attribute counts
    /// as a non-match and is accepted.
    Unlike { pattern: String },
    /// At most `limit` instances per field value.
    MaxPer { limit: u32 },
}

/// A placement constraint on a run spec.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Constraint {
    pub field: ConstraintField,
    pub operator: ConstraintOperator,
}

impl Constraint {
    pub fn new(field: ConstraintField, operator: ConstraintOperator) -> Self {
        Self { field, operator }
    }

    pub fn unique_hostname() -> Self {
        Self::new(ConstraintField::Hostname, ConstraintOperator::Unique)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn field_parsing() {
        assert_eq!(ConstraintField::parse("hostname"), ConstraintField::Hostname);
        assert_eq!(ConstraintField::parse("@region"), ConstraintField::Region);
        assert_eq!(ConstraintField::parse("@zone"), ConstraintField::Zone);
        assert_eq!(
            ConstraintField::parse("rack"),
            ConstraintField::Attribute("rack".to_string())
        );
    }

    #[test]
    fn field_display_roundtrips() {
        for raw in ["hostname", "@region", "@zone", "rack"] {
            assert_eq!(ConstraintField::parse(raw).to_string(), raw);
        }
    }

    #[test]
    fn serializes_roundtrip() {
        let c = Constraint::new(
            ConstraintField::Attribute("rack".to_string()),
            ConstraintOperator::MaxPer { limit: 2 },
        );
        let json = serde_json::to_string(&c).unwrap();
        let back: Constraint = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
