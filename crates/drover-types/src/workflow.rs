//! Workflow definition types.
//!
//! A workflow is a named set of steps connected by artifact dependencies.
//! Definitions are declarative YAML documents: each step names a capability
//! tag, the artifacts it requires, and the artifacts it creates. The kernel
//! derives the execution order from those artifact edges, so a definition
//! never spells out an explicit step sequence.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Workflow definition
// ---------------------------------------------------------------------------

/// A complete workflow definition, parsed from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowDefinition {
    /// Unique workflow name (alphanumeric + hyphens).
    pub name: String,

    /// Human-readable description of what the workflow accomplishes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Definition version (semver).
    #[serde(default = "default_version")]
    pub version: String,

    /// Overall run timeout in seconds. `None` means no run-level timeout.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// The steps that make up this workflow.
    pub steps: Vec<StepDefinition>,

    /// Free-form metadata carried through to run records.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub metadata: HashMap<String, Value>,
}

fn default_version() -> String {
    "0.1.0".to_string()
}

// ---------------------------------------------------------------------------
// Step definition
// ---------------------------------------------------------------------------

/// A single step within a workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepDefinition {
    /// Step identifier, unique within the workflow.
    pub id: String,

    /// Capability tag naming the kind of work this step performs. The
    /// kernel resolves the tag against the executor registry at dispatch
    /// time; it never interprets the tag itself.
    pub capability: String,

    /// Names this step consumes. Each entry is either an artifact name
    /// created by an earlier step or the id of a step to order after.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Artifact names this step produces on success.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub creates: Vec<String>,

    /// Optional tag grouping steps that should dispatch together. Steps
    /// without a tag are grouped automatically from the dependency graph.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parallel_group: Option<String>,

    /// Optional quality gate evaluated after the step completes.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gate: Option<GateSpec>,

    /// Retry policy applied when the step fails. `None` means a single
    /// attempt with no retry.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry: Option<RetryPolicy>,

    /// Per-step timeout in seconds. Falls back to the engine default.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout_secs: Option<u64>,

    /// Opaque parameters forwarded to the executor unmodified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
}

// ---------------------------------------------------------------------------
// Retry policy
// ---------------------------------------------------------------------------

/// Bounded retry policy for a failing step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Maximum total attempts, counting the first execution.
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// When set, a failed attempt rewinds execution to this earlier step
    /// instead of re-running only the failing step.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub loopback_to: Option<String>,
}

fn default_max_attempts() -> u32 {
    3
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            loopback_to: None,
        }
    }
}

// ---------------------------------------------------------------------------
// Quality gates
// ---------------------------------------------------------------------------

/// A quality gate attached to a step.
///
/// After the step completes, the gate scores the metrics reported by the
/// executor. A failing gate rewinds execution to `loopback_to`, at most
/// `max_retries` times; exhausting the budget fails the run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateSpec {
    /// Display name for events and logs. Defaults to `<step id>-gate`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Metrics the gate inspects. Must be non-empty.
    pub metrics: Vec<MetricSpec>,

    /// Fraction of total metric weight that must pass for the gate to
    /// pass, in `[0.0, 1.0]`. Defaults to 1.0 (every metric must pass).
    #[serde(default = "default_pass_threshold")]
    pub pass_threshold: f64,

    /// Earlier step to rewind to when the gate fails.
    pub loopback_to: String,

    /// Maximum number of loopback rewinds before the run fails.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_pass_threshold() -> f64 {
    1.0
}

fn default_max_retries() -> u32 {
    2
}

impl GateSpec {
    /// Display name, falling back to `<step id>-gate`.
    pub fn display_name(&self, step_id: &str) -> String {
        match &self.name {
            Some(name) => name.clone(),
            None => format!("{step_id}-gate"),
        }
    }
}

/// A single metric inspected by a gate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricSpec {
    /// Metric name, matched against the executor's reported metrics.
    pub name: String,

    /// Minimum value for this metric to count as passing.
    pub threshold: f64,

    /// Relative weight of this metric in the gate score.
    #[serde(default = "default_weight")]
    pub weight: f64,

    /// When set, a reported value below this floor fails the whole gate
    /// regardless of the weighted score.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hard_floor: Option<f64>,
}

fn default_weight() -> f64 {
    1.0
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
