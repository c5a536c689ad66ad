//! Task graph construction from the on-disk task folders.
//!
//! The builder is pure over the state store and cheap; the parallel executor
//! rebuilds the graph before every wave because tasks may split mid-run.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::OnceLock;

use anyhow::{Result, bail};
use regex::Regex;

use crate::errors::OrchestratorError;
use crate::store::StateStore;
use crate::util;

/// Scheduling status of a graph node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeStatus {
    Pending,
    Completed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct TaskNode {
    pub deps: Vec<String>,
    pub status: NodeStatus,
}

/// The dependency graph over task ids.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct TaskGraph {
    nodes: BTreeMap<String, TaskNode>,
}

impl TaskGraph {
    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&TaskNode> {
        self.nodes.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    /// All ids in ascending numeric order.
    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.nodes.keys().cloned().collect();
        ids.sort_by(|a, b| util::compare_ids(a, b));
        ids
    }

    pub fn is_completed(&self, id: &str) -> bool {
        self.nodes
            .get(id)
            .is_some_and(|n| n.status == NodeStatus::Completed)
    }

    pub fn mark_completed(&mut self, id: &str) {
        if let Some(node) = self.nodes.get_mut(id) {
            node.status = NodeStatus::Completed;
        }
    }

    pub fn all_completed(&self) -> bool {
        self.nodes
            .values()
            .all(|n| n.status == NodeStatus::Completed)
    }

    /// Pending tasks whose dependencies are all completed, in ascending id
    /// order. Dispatch order is therefore deterministic modulo completion
    /// timing.
    pub fn ready_set(&self) -> Vec<String> {
        self.ids()
            .into_iter()
            .filter(|id| {
                let node = &self.nodes[id];
                node.status == NodeStatus::Pending
                    && node.deps.iter().all(|dep| self.is_completed(dep))
            })
            .collect()
    }

    /// Tasks that transitively depend on `id` (and so become unreachable if
    /// `id` is terminally blocked).
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        let mut reached: BTreeSet<String> = BTreeSet::new();
        let mut frontier = vec![id.to_string()];
        while let Some(current) = frontier.pop() {
            for (other, node) in &self.nodes {
                if node.deps.contains(&current) && reached.insert(other.clone()) {
                    frontier.push(other.clone());
                }
            }
        }
        let mut out: Vec<String> = reached.into_iter().collect();
        out.sort_by(|a, b| util::compare_ids(a, b));
        out
    }
}

/// Result of a build: a usable graph, or the set of tasks still missing
/// their `@dependencies` line (dependency assignment must run first).
#[derive(Debug)]
pub enum GraphOutcome {
    Ready(TaskGraph),
    Incomplete { missing: Vec<String> },
}

impl GraphOutcome {
    pub fn graph(self) -> Option<TaskGraph> {
        match self {
            Self::Ready(graph) => Some(graph),
            Self::Incomplete { .. } => None,
        }
    }
}

fn deps_line_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*@dependencies\b[ \t]*(.*)$").unwrap())
}

/// Parse the value of a `@dependencies` declaration into task ids.
///
/// `none` and `[]` are equivalent to the empty list; brackets are optional;
/// separators are commas and/or whitespace.
pub fn parse_deps_value(value: &str) -> Vec<String> {
    let inner = value.trim().trim_start_matches('[').trim_end_matches(']');
    if inner.trim().eq_ignore_ascii_case("none") {
        return Vec::new();
    }
    let mut out = Vec::new();
    for token in inner.split([',', ' ', '\t']) {
        let token = token.trim();
        if token.is_empty() {
            continue;
        }
        if util::is_task_id(token) && !out.contains(&token.to_string()) {
            out.push(token.to_string());
        }
    }
    out
}

/// Extract the declared dependencies from a TASK.md, `None` when the file
/// carries no `@dependencies` line at all.
pub fn declared_deps(task_md: &str) -> Option<Vec<String>> {
    deps_line_re()
        .captures(task_md)
        .map(|c| parse_deps_value(&c[1]))
}

/// Build the task graph from the current state store.
pub fn build_graph(store: &StateStore) -> Result<GraphOutcome> {
    let ids = store.list_tasks()?;

    // Pass 1: declared dependencies per task.
    let mut declared: BTreeMap<String, Vec<String>> = BTreeMap::new();
    let mut missing: Vec<String> = Vec::new();
    for id in &ids {
        let content = store.read_task_file(id)?;
        match declared_deps(&content) {
            Some(deps) => {
                declared.insert(id.clone(), deps);
            }
            None => missing.push(id.clone()),
        }
    }
    if !missing.is_empty() {
        return Ok(GraphOutcome::Incomplete { missing });
    }

    let id_set: BTreeSet<&str> = ids.iter().map(String::as_str).collect();

    // Pass 2: resolve each task's dependency set.
    let mut nodes: BTreeMap<String, TaskNode> = BTreeMap::new();
    for id in &ids {
        let mut wanted: BTreeSet<String> = BTreeSet::new();

        // Own declarations plus those inherited from existing ancestors:
        // a dotted subtask carries its parent's prerequisites.
        wanted.extend(declared[id].iter().cloned());
        let mut ancestor = util::parent_id(id);
        while let Some(parent) = ancestor {
            if let Some(parent_deps) = declared.get(&parent) {
                wanted.extend(parent_deps.iter().cloned());
            }
            ancestor = util::parent_id(&parent);
        }

        let mut resolved: BTreeSet<String> = BTreeSet::new();
        for dep in wanted {
            if dep == *id || util::is_subtask_of(id, &dep) {
                // Self-references and ancestor references are dropped: the
                // ancestor edge already exists in the other direction.
                continue;
            }
            let dep_subtasks: Vec<&str> = ids
                .iter()
                .map(String::as_str)
                .filter(|t| util::is_subtask_of(t, &dep))
                .collect();
            if id_set.contains(dep.as_str()) {
                resolved.insert(dep.clone());
                resolved.extend(dep_subtasks.iter().map(|s| s.to_string()));
            } else if !dep_subtasks.is_empty() {
                // The dependency was split away; its subtasks stand in.
                resolved.extend(dep_subtasks.iter().map(|s| s.to_string()));
            } else {
                bail!(
                    "Unknown dependency '{}' declared by {}: no such task folder exists",
                    dep,
                    id
                );
            }
        }

        // A still-present parent is complete only once all of its subtasks
        // are: subtasks are implicit dependencies of the parent.
        for sub in store.subtasks_of(id)? {
            resolved.insert(sub);
        }
        resolved.remove(id);

        let mut deps: Vec<String> = resolved.into_iter().collect();
        deps.sort_by(|a, b| util::compare_ids(a, b));

        let status = if store.is_approved(id) {
            NodeStatus::Completed
        } else {
            NodeStatus::Pending
        };
        nodes.insert(id.clone(), TaskNode { deps, status });
    }

    let graph = TaskGraph { nodes };
    validate_acyclic(&graph)?;
    Ok(GraphOutcome::Ready(graph))
}

/// Kahn's algorithm; any unprocessed remainder is a cycle.
fn validate_acyclic(graph: &TaskGraph) -> Result<()> {
    let ids = graph.ids();
    let mut in_degree: BTreeMap<&str, usize> = ids
        .iter()
        .map(|id| (id.as_str(), graph.nodes[id].deps.len()))
        .collect();

    let mut queue: Vec<&str> = in_degree
        .iter()
        .filter(|(_, deg)| **deg == 0)
        .map(|(id, _)| *id)
        .collect();
    let mut processed = 0usize;

    while let Some(id) = queue.pop() {
        processed += 1;
        for (other, node) in &graph.nodes {
            if node.deps.iter().any(|d| d == id) {
                let deg = in_degree.get_mut(other.as_str()).unwrap();
                *deg -= 1;
                if *deg == 0 {
                    queue.push(other);
                }
            }
        }
    }

    if processed != graph.len() {
        let mut cycle_ids: Vec<String> = in_degree
            .into_iter()
            .filter(|(_, deg)| *deg > 0)
            .map(|(id, _)| id.to_string())
            .collect();
        cycle_ids.sort_by(|a, b| util::compare_ids(a, b));
        return Err(OrchestratorError::CycleDetected { ids: cycle_ids }.into());
    }
    Ok(())
}
