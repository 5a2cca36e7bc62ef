//! Dependency graph resolution and execution planning.
//!
//! Builds a directed graph from declared dependencies, validates it
//! (cycles, dangling references), and derives the execution order via
//! Kahn-style topological sorting. Steps at the same dependency depth form
//! a wave and may run concurrently; `partition_dispatch` further splits a
//! ready set into groups whose artifact footprints do not conflict.
//!
//! The graph works on [`DependencyNode`], a minimal (id, deps) view, so
//! the same planner serves workflow steps and epic units.

use std::collections::{HashMap, HashSet};

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;

use drover_types::workflow::StepDefinition;

use super::definition::DefinitionError;

// ---------------------------------------------------------------------------
// DependencyNode
// ---------------------------------------------------------------------------

/// A node in the dependency graph: an id plus the ids it depends on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyNode {
    pub id: String,
    pub deps: Vec<String>,
}

impl DependencyNode {
    pub fn new(id: impl Into<String>, deps: Vec<String>) -> Self {
        Self {
            id: id.into(),
            deps,
        }
    }
}

/// Resolve each step's `requires` entries into direct step dependencies.
///
/// A `requires` entry is either the id of another step (pure ordering) or
/// an artifact name, resolved through the map of artifact producers.
pub fn step_nodes(steps: &[StepDefinition]) -> Result<Vec<DependencyNode>, DefinitionError> {
    let step_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();

    let mut producers: HashMap<&str, &str> = HashMap::new();
    for step in steps {
        for artifact in &step.creates {
            producers.insert(artifact.as_str(), step.id.as_str());
        }
    }

    steps
        .iter()
        .map(|step| {
            let mut deps: Vec<String> = Vec::new();
            for requirement in &step.requires {
                let dep = if step_ids.contains(requirement.as_str()) {
                    requirement.as_str()
                } else if let Some(producer) = producers.get(requirement.as_str()) {
                    *producer
                } else {
                    return Err(DefinitionError::UnknownDependency(format!(
                        "step '{}' requires '{}', which no step creates",
                        step.id, requirement
                    )));
                };
                if dep == step.id {
                    return Err(DefinitionError::Invalid(format!(
                        "step '{}' requires its own output '{}'",
                        step.id, requirement
                    )));
                }
                if !deps.iter().any(|d| d == dep) {
                    deps.push(dep.to_string());
                }
            }
            Ok(DependencyNode::new(step.id.clone(), deps))
        })
        .collect()
}

// ---------------------------------------------------------------------------
// Execution planning
// ---------------------------------------------------------------------------

/// Build the wave-ordered execution plan for a set of nodes.
///
/// Validates the graph (unknown dependencies, cycles) and groups node ids
/// by dependency depth: wave `n` contains every node whose longest
/// dependency chain has length `n`. Nodes within a wave have no edges
/// between them and may run concurrently.
pub fn build_execution_plan(nodes: &[DependencyNode]) -> Result<Vec<Vec<String>>, DefinitionError> {
    if nodes.is_empty() {
        return Ok(Vec::new());
    }

    let id_to_idx: HashMap<&str, usize> = nodes
        .iter()
        .enumerate()
        .map(|(idx, node)| (node.id.as_str(), idx))
        .collect();

    let mut graph = DiGraph::<&str, ()>::new();
    let indices: Vec<_> = nodes
        .iter()
        .map(|node| graph.add_node(node.id.as_str()))
        .collect();

    for node in nodes {
        let dependent = indices[id_to_idx[node.id.as_str()]];
        for dep in &node.deps {
            let Some(&dep_idx) = id_to_idx.get(dep.as_str()) else {
                return Err(DefinitionError::UnknownDependency(format!(
                    "'{}' depends on unknown node '{}'",
                    node.id, dep
                )));
            };
            graph.add_edge(indices[dep_idx], dependent, ());
        }
    }

    let sorted = toposort(&graph, None).map_err(|cycle| {
        let node_id = graph[cycle.node_id()];
        DefinitionError::Cycle(format!("cycle detected involving '{node_id}'"))
    })?;

    // Depth = longest dependency chain; computed in topological order so
    // every dependency's depth is known before its dependents.
    let mut depth: HashMap<&str, usize> = HashMap::new();
    let mut max_depth = 0;
    for node_idx in sorted {
        let id = graph[node_idx];
        let node = &nodes[id_to_idx[id]];
        let d = node
            .deps
            .iter()
            .map(|dep| depth[dep.as_str()] + 1)
            .max()
            .unwrap_or(0);
        depth.insert(id, d);
        max_depth = max_depth.max(d);
    }

    let mut waves: Vec<Vec<String>> = vec![Vec::new(); max_depth + 1];
    for node in nodes {
        waves[depth[node.id.as_str()]].push(node.id.clone());
    }
    Ok(waves)
}

/// Validate the graph without materializing a plan.
pub fn validate_graph(nodes: &[DependencyNode]) -> Result<(), DefinitionError> {
    build_execution_plan(nodes).map(|_| ())
}

/// Nodes whose dependencies are all satisfied, in declaration order.
///
/// `pending` holds ids eligible to run; `completed` holds ids counted as
/// satisfied dependencies. The two sets are disjoint views the scheduler
/// recomputes each iteration, so a loopback rewind naturally re-readies
/// earlier nodes.
pub fn ready_nodes<'a>(
    nodes: &'a [DependencyNode],
    pending: &HashSet<&str>,
    completed: &HashSet<&str>,
) -> Vec<&'a DependencyNode> {
    nodes
        .iter()
        .filter(|node| pending.contains(node.id.as_str()))
        .filter(|node| node.deps.iter().all(|dep| completed.contains(dep.as_str())))
        .collect()
}

// ---------------------------------------------------------------------------
// Transitive closures
// ---------------------------------------------------------------------------

/// Every node `root` transitively depends on (upstream closure).
pub fn dependencies_of(nodes: &[DependencyNode], root: &str) -> HashSet<String> {
    let by_id: HashMap<&str, &DependencyNode> =
        nodes.iter().map(|n| (n.id.as_str(), n)).collect();

    let mut result = HashSet::new();
    let mut stack: Vec<&str> = match by_id.get(root) {
        Some(node) => node.deps.iter().map(String::as_str).collect(),
        None => return result,
    };
    while let Some(id) = stack.pop() {
        if result.insert(id.to_string())
            && let Some(node) = by_id.get(id)
        {
            stack.extend(node.deps.iter().map(String::as_str));
        }
    }
    result
}

/// Every node that transitively depends on `root` (downstream closure).
///
/// Loopback rewinds use this to reset the target and everything built on
/// top of it.
pub fn dependents_of(nodes: &[DependencyNode], root: &str) -> HashSet<String> {
    let mut reverse: HashMap<&str, Vec<&str>> = HashMap::new();
    for node in nodes {
        for dep in &node.deps {
            reverse.entry(dep.as_str()).or_default().push(node.id.as_str());
        }
    }

    let mut result = HashSet::new();
    let mut stack: Vec<&str> = reverse.get(root).cloned().unwrap_or_default();
    while let Some(id) = stack.pop() {
        if result.insert(id.to_string())
            && let Some(children) = reverse.get(id)
        {
            stack.extend(children.iter().copied());
        }
    }
    result
}

// ---------------------------------------------------------------------------
// Dispatch grouping
// ---------------------------------------------------------------------------

/// Split a ready set into dispatch groups that are safe to run together.
///
/// Two steps may share a group only when their artifact footprints do not
/// conflict (no shared `creates`, neither requires what the other creates)
/// and their `parallel_group` tags agree. Each step joins the first
/// compatible group, so the result is deterministic in declaration order.
pub fn partition_dispatch<'a>(ready: &[&'a StepDefinition]) -> Vec<Vec<&'a StepDefinition>> {
    let mut groups: Vec<Vec<&StepDefinition>> = Vec::new();

    for candidate in ready {
        let slot = groups
            .iter()
            .position(|group| group.iter().all(|member| compatible(member, candidate)));
        match slot {
            Some(idx) => groups[idx].push(candidate),
            None => groups.push(vec![candidate]),
        }
    }
    groups
}

fn compatible(a: &StepDefinition, b: &StepDefinition) -> bool {
    if a.parallel_group != b.parallel_group {
        return false;
    }
    let a_creates: HashSet<&str> = a.creates.iter().map(String::as_str).collect();
    let b_creates: HashSet<&str> = b.creates.iter().map(String::as_str).collect();
    if a_creates.intersection(&b_creates).next().is_some() {
        return false;
    }
    if a.requires.iter().any(|r| b_creates.contains(r.as_str())) {
        return false;
    }
    if b.requires.iter().any(|r| a_creates.contains(r.as_str())) {
        return false;
    }
    true
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
