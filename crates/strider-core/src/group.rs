//! The group tree — nested groups of run specs with ordering edges.
//!
//! The root group is the sole top-level aggregate the planner diffs
//! against. Children are kept in ordered maps so traversal and hashing
//! are deterministic.

use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};

use crate::pathid::AbsolutePathId;
use crate::spec::RunSpec;
use crate::Timestamp;

/// A node of the group tree.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Group {
    pub id: AbsolutePathId,
    pub version: Timestamp,
    /// Ordering edges to sibling groups: everything in this group deploys
    /// after everything in each dependency.
    pub dependencies: Vec<AbsolutePathId>,
    pub groups: BTreeMap<AbsolutePathId, Group>,
    pub apps: BTreeMap<AbsolutePathId, RunSpec>,
}

/// The root of the tree.
pub type RootGroup = Group;

impl Group {
    pub fn empty(id: AbsolutePathId, version: Timestamp) -> Self {
        Self {
            id,
            version,
            dependencies: Vec::new(),
            groups: BTreeMap::new(),
            apps: BTreeMap::new(),
        }
    }

    pub fn empty_root(version: Timestamp) -> RootGroup {
        Self::empty(AbsolutePathId::root(), version)
    }

    /// All run specs in this subtree, in id order.
    pub fn transitive_run_specs(&self) -> Vec<&RunSpec> {
        let mut out: Vec<&RunSpec> = Vec::new();
        self.collect_specs(&mut out);
        out.sort_by(|a, b| a.id.cmp(&b.id));
        out
    }

    fn collect_specs<'a>(&'a self, out: &mut Vec<&'a RunSpec>) {
        out.extend(self.apps.values());
        for child in self.groups.values() {
            child.collect_specs(out);
        }
    }

    /// All run specs keyed by id.
    pub fn run_specs_by_id(&self) -> HashMap<AbsolutePathId, &RunSpec> {
        self.transitive_run_specs()
            .into_iter()
            .map(|s| (s.id.clone(), s))
            .collect()
    }

    pub fn find_run_spec(&self, id: &AbsolutePathId) -> Option<&RunSpec> {
        if let Some(spec) = self.apps.get(id) {
            return Some(spec);
        }
        self.groups.values().find_map(|g| {
            if id.is_under(&g.id) {
                g.find_run_spec(id)
            } else {
                None
            }
        })
    }

    pub fn find_group(&self, id: &AbsolutePathId) -> Option<&Group> {
        if &self.id == id {
            return Some(self);
        }
        self.groups.values().find_map(|g| {
            if id.is_under(&g.id) {
                g.find_group(id)
            } else {
                None
            }
        })
    }

    /// Insert or replace a run spec, creating intermediate groups as
    /// needed. Bumps the version of every group on the path.
    pub fn put_run_spec(&mut self, spec: RunSpec, version: Timestamp) {
        self.version = version;
        let parent = spec.id.parent();
        if parent == self.id {
            self.apps.insert(spec.id.clone(), spec);
            return;
        }
        // Descend one level toward the spec's parent group.
        let depth = self.id.segments().len();
        let next_segment = spec.id.segments()[depth].to_string();
        let child_id = self.id.child(&next_segment);
        let child = self
            .groups
            .entry(child_id.clone())
            .or_insert_with(|| Group::empty(child_id, version));
        child.put_run_spec(spec, version);
    }

    /// Remove a run spec by id. Returns the removed spec, pruning any
    /// groups left empty. Bumps versions on the path.
    pub fn remove_run_spec(&mut self, id: &AbsolutePathId, version: Timestamp) -> Option<RunSpec> {
        if let Some(spec) = self.apps.remove(id) {
            self.version = version;
            return Some(spec);
        }
        let mut removed = None;
        let mut emptied = None;
        for (child_id, child) in self.groups.iter_mut() {
            if id.is_under(child_id) {
                removed = child.remove_run_spec(id, version);
                if removed.is_some() && child.groups.is_empty() && child.apps.is_empty() {
                    emptied = Some(child_id.clone());
                }
                break;
            }
        }
        if removed.is_some() {
            self.version = version;
            if let Some(child_id) = emptied {
                self.groups.remove(&child_id);
            }
        }
        removed
    }

    /// Dependency edges between run-spec ids in this subtree: explicit
    /// app-to-app dependencies plus group-level edges expanded to every
    /// spec beneath them. An edge `a → b` means `a` depends on `b`.
    pub fn dependency_edges(&self) -> Vec<(AbsolutePathId, AbsolutePathId)> {
        let mut edges = Vec::new();
        let specs = self.run_specs_by_id();
        for spec in specs.values() {
            for dep in &spec.dependencies {
                edges.push((spec.id.clone(), dep.clone()));
            }
        }
        self.collect_group_edges(&specs, &mut edges);
        edges.sort();
        edges.dedup();
        edges
    }

    fn collect_group_edges(
        &self,
        specs: &HashMap<AbsolutePathId, &RunSpec>,
        edges: &mut Vec<(AbsolutePathId, AbsolutePathId)>,
    ) {
        for child in self.groups.values() {
            for dep in &child.dependencies {
                // Every spec under the child depends on every spec under
                // the dependency target.
                for from in specs.keys().filter(|id| id.is_under(&child.id)) {
                    for to in specs.keys().filter(|id| id.is_under(dep)) {
                        edges.push((from.clone(), to.clone()));
                    }
                }
            }
            child.collect_group_edges(specs, edges);
        }
    }

    /// True when the dependency graph over run specs has a cycle.
    pub fn has_dependency_cycle(&self) -> bool {
        let edges = self.dependency_edges();
        let mut adjacency: HashMap<&AbsolutePathId, Vec<&AbsolutePathId>> = HashMap::new();
        for (from, to) in &edges {
            adjacency.entry(from).or_default().push(to);
        }
        let mut visited: HashSet<&AbsolutePathId> = HashSet::new();
        let mut in_stack: HashSet<&AbsolutePathId> = HashSet::new();
        fn visit<'a>(
            node: &'a AbsolutePathId,
            adjacency: &HashMap<&'a AbsolutePathId, Vec<&'a AbsolutePathId>>,
            visited: &mut HashSet<&'a AbsolutePathId>,
            in_stack: &mut HashSet<&'a AbsolutePathId>,
        ) -> bool {
            if in_stack.contains(node) {
                return true;
            }
            if !visited.insert(node) {
                return false;
            }
            in_stack.insert(node);
            if let Some(next) = adjacency.get(node) {
                for n in next {
                    if visit(n, adjacency, visited, in_stack) {
                        return true;
                    }
                }
            }
            in_stack.remove(node);
            false
        }
        adjacency
            .keys()
            .copied()
            .collect::<Vec<_>>()
            .into_iter()
            .any(|n| visit(n, &adjacency, &mut visited, &mut in_stack))
    }
}
