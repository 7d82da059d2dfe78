//! Spec and group-tree validation.
//!
//! Malformed input is rejected here, before anything reaches storage or
//! the planner. Violations are collected rather than failing on the
//! first, so a caller sees everything wrong with a submission at once.

use thiserror::Error;

use crate::constraint::ConstraintOperator;
use crate::group::Group;
use crate::spec::{RunSpec, VolumeSpec, Workload};

/// One thing wrong with a submitted spec or tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Violation {
    /// The offending id or field path.
    pub path: String,
    pub error: String,
}

/// Malformed spec — reject input.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("validation failed: {}", format_violations(.0))]
    Invalid(Vec<Violation>),
}

impl ValidationError {
    pub fn single(violation: Violation) -> Self {
        ValidationError::Invalid(vec![violation])
    }

    pub fn violations(&self) -> &[Violation] {
        match self {
            ValidationError::Invalid(v) => v,
        }
    }
}

fn format_violations(violations: &[Violation]) -> String {
    violations
        .iter()
        .map(|v| format!("{}: {}", v.path, v.error))
        .collect::<Vec<_>>()
        .join("; ")
}

/// Validate a single run spec.
pub fn validate_run_spec(spec: &RunSpec) -> Result<(), ValidationError> {
    let mut violations = Vec::new();
    check_run_spec(spec, &mut violations);
    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Invalid(violations))
    }
}

/// Validate the whole tree: every spec, plus tree-level invariants
/// (dependency DAG, dependencies resolve).
pub fn validate_root(root: &Group) -> Result<(), ValidationError> {
    let mut violations = Vec::new();

    let specs = root.run_specs_by_id();
    for spec in specs.values() {
        check_run_spec(spec, &mut violations);
        for dep in &spec.dependencies {
            if !specs.contains_key(dep) {
                violations.push(Violation {
                    path: spec.id.to_string(),
                    error: format!("dependency {dep} does not exist"),
                });
            }
        }
    }

    if root.has_dependency_cycle() {
        violations.push(Violation {
            path: root.id.to_string(),
            error: "dependency graph has a cycle".to_string(),
        });
    }

    if violations.is_empty() {
        Ok(())
    } else {
        Err(ValidationError::Invalid(violations))
    }
}

fn check_run_spec(spec: &RunSpec, violations: &mut Vec<Violation>) {
    let path = spec.id.to_string();

    if spec.id.is_root() {
        violations.push(Violation {
            path: path.clone(),
            error: "run spec id must not be the root".to_string(),
        });
    }
    if spec.resources.cpus < 0.0
        || spec.resources.mem < 0.0
        || spec.resources.disk < 0.0
        || spec.resources.gpus < 0.0
    {
        violations.push(Violation {
            path: path.clone(),
            error: "resources must be non-negative".to_string(),
        });
    }
    if spec.role.is_empty() {
        violations.push(Violation {
            path: path.clone(),
            error: "role must not be empty".to_string(),
        });
    }

    let upgrade = &spec.upgrade;
    if !(0.0..=1.0).contains(&upgrade.minimum_health_capacity) {
        violations.push(Violation {
            path: path.clone(),
            error: "minimum_health_capacity must be within [0, 1]".to_string(),
        });
    }
    if upgrade.maximum_over_capacity < 0.0 {
        violations.push(Violation {
            path: path.clone(),
            error: "maximum_over_capacity must be non-negative".to_string(),
        });
    }

    for constraint in &spec.constraints {
        match &constraint.operator {
            ConstraintOperator::Like { pattern } | ConstraintOperator::Unlike { pattern } => {
                if let Err(e) = regex::Regex::new(pattern) {
                    violations.push(Violation {
                        path: path.clone(),
                        error: format!("invalid constraint regex {pattern:?}: {e}"),
                    });
                }
            }
            ConstraintOperator::MaxPer { limit } if *limit == 0 => {
                violations.push(Violation {
                    path: path.clone(),
                    error: "MAX_PER limit must be positive".to_string(),
                });
            }
            _ => {}
        }
    }

    for volume in &spec.volumes {
        if let VolumeSpec::Persistent { size_mib, .. } = volume {
            if *size_mib == 0 {
                violations.push(Violation {
                    path: path.clone(),
                    error: "persistent volume size must be positive".to_string(),
                });
            }
        }
    }

    if let Workload::Pod(pod) = &spec.workload {
        if pod.tasks.is_empty() {
            violations.push(Violation {
                path: path.clone(),
                error: "pod must declare at least one task".to_string(),
            });
        }
        let mut names: Vec<&str> = pod.tasks.iter().map(|t| t.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != pod.tasks.len() {
            violations.push(Violation {
                path,
                error: "pod task names must be unique".to_string(),
            });
        }
    }
}
