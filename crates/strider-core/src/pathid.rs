//! Absolute path identifiers for groups and run specs.
//!
//! Ids are slash-delimited and case-preserving: `/prod/db/postgres`.
//! The root group is `/`. Ids order lexicographically by segments, so a
//! group always sorts before its children.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::validation::{ValidationError, Violation};

/// An absolute, slash-delimited identifier. Always canonical: starts with
/// `/`, no trailing slash (except the root itself), no empty segments.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AbsolutePathId(String);

impl AbsolutePathId {
    /// The root id `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and canonicalize an id. Accepts `a/b`, `/a/b`, `/a/b/`.
    pub fn parse(raw: &str) -> Result<Self, ValidationError> {
        let trimmed = raw.trim();
        if trimmed.is_empty() || trimmed == "/" {
            return Ok(Self::root());
        }
        let mut segments = Vec::new();
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                continue;
            }
            if !is_valid_segment(segment) {
                return Err(ValidationError::single(Violation {
                    path: raw.to_string(),
                    error: format!("invalid path segment {segment:?}"),
                }));
            }
            segments.push(segment);
        }
        if segments.is_empty() {
            return Ok(Self::root());
        }
        Ok(Self(format!("/{}", segments.join("/"))))
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    /// Path segments, root has none.
    pub fn segments(&self) -> Vec<&str> {
        if self.is_root() {
            Vec::new()
        } else {
            self.0[1..].split('/').collect()
        }
    }

    /// The last segment, or `/` for the root.
    pub fn base(&self) -> &str {
        if self.is_root() {
            "/"
        } else {
            self.0.rsplit('/').next().unwrap_or("/")
        }
    }

    /// The enclosing group id. The root is its own parent.
    pub fn parent(&self) -> Self {
        if self.is_root() {
            return Self::root();
        }
        match self.0.rfind('/') {
            Some(0) | None => Self::root(),
            Some(idx) => Self(self.0[..idx].to_string()),
        }
    }

    /// Whether `self` lives under `ancestor` (or equals it).
    pub fn is_under(&self, ancestor: &AbsolutePathId) -> bool {
        if ancestor.is_root() {
            return true;
        }
        self == ancestor || self.0.starts_with(&format!("{}/", ancestor.0))
    }

    /// Append a child segment.
    pub fn child(&self, segment: &str) -> Self {
        if self.is_root() {
            Self(format!("/{segment}"))
        } else {
            Self(format!("{}/{segment}", self.0))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A flattened form safe for use in task ids and storage keys:
    /// `/prod/db` becomes `prod_db`.
    pub fn safe_path(&self) -> String {
        self.segments().join("_")
    }
}

impl fmt::Display for AbsolutePathId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !segment.starts_with('.')
        && segment
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | '_'))
}
