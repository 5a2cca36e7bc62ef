//! Run state: the durable snapshot of a single workflow execution.
//!
//! A `RunState` is the kernel's single source of truth for one run. It is
//! persisted after every status transition, so a crashed or restarted
//! process can resume a run from exactly where it stopped. Snapshot maps
//! use `BTreeMap` so serialized state is deterministic and diffable.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Snapshot schema version, bumped on incompatible layout changes.
pub const STATE_SCHEMA_VERSION: u32 = 1;

// ---------------------------------------------------------------------------
// Statuses
// ---------------------------------------------------------------------------

/// Lifecycle status of a whole run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Created but not yet driven.
    Pending,
    /// Actively dispatching or waiting on steps.
    Running,
    /// Cancellation requested; in-flight steps are draining.
    Cancelling,
    /// Every step completed or was skipped.
    Completed,
    /// A step or gate failed beyond its retry budget.
    Failed,
    /// Cancelled by an operator.
    Cancelled,
}

impl RunStatus {
    /// Terminal statuses never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

/// Lifecycle status of a single step within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Pending,
    Running,
    Completed,
    Failed,
    /// Never executed: an upstream step failed, or an operator skipped it.
    Skipped,
}

impl StepStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Skipped)
    }
}

/// How step work is carried out for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionMode {
    /// Steps run in-process through registered executors.
    Synchronous,
    /// Steps are handed to out-of-process collaborators via request
    /// markers; completion arrives through result markers.
    Monitored,
}

// ---------------------------------------------------------------------------
// Step records
// ---------------------------------------------------------------------------

/// Per-step bookkeeping within a run snapshot.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRecord {
    /// Current step status.
    pub status: StepStatus,

    /// Number of attempts made so far, counting the one in flight.
    pub attempts: u32,

    /// When the most recent attempt started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    /// When the step reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Metrics reported by the most recent attempt. Gates read these.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,

    /// Error or skip reason from the most recent attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepRecord {
    pub fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            attempts: 0,
            started_at: None,
            completed_at: None,
            metrics: BTreeMap::new(),
            error: None,
        }
    }
}

impl Default for StepRecord {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// What an artifact actually is.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ArtifactKind {
    /// A file path, usually inside the run's working directory.
    File { path: String },
    /// Inline textual content.
    Document { content: String },
    /// Arbitrary structured data.
    Value { value: Value },
}

/// A named artifact registered in the run's artifact registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactRecord {
    /// Artifact name, unique within the run.
    pub name: String,

    /// The artifact payload.
    pub kind: ArtifactKind,

    /// Id of the step that produced it.
    pub produced_by: String,

    /// Attempt number of the producing step.
    pub attempt: u32,

    /// When the artifact was registered.
    pub recorded_at: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Run snapshot
// ---------------------------------------------------------------------------

/// The durable snapshot of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    /// Snapshot schema version.
    pub schema_version: u32,

    /// Run identifier (UUIDv7, so ids sort by creation time).
    pub run_id: Uuid,

    /// Name of the workflow definition this run executes.
    pub workflow: String,

    /// Overall run status.
    pub status: RunStatus,

    /// How steps are executed for this run.
    pub mode: ExecutionMode,

    /// Per-step records, keyed by step id.
    pub steps: BTreeMap<String, StepRecord>,

    /// Artifact registry, keyed by artifact name.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub artifacts: BTreeMap<String, ArtifactRecord>,

    /// Loopback rewinds consumed per gated step id.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub gate_loopbacks: BTreeMap<String, u32>,

    /// Gated step ids whose gate has passed.
    #[serde(default, skip_serializing_if = "BTreeSet::is_empty")]
    pub gates_satisfied: BTreeSet<String>,

    /// Caller-supplied run inputs, sanitized before persistence.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inputs: Option<Value>,

    /// When the run was created.
    pub started_at: DateTime<Utc>,

    /// When the run reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure reason for failed runs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl RunState {
    /// Create a fresh pending snapshot with one pending record per step.
    pub fn new(
        run_id: Uuid,
        workflow: impl Into<String>,
        step_ids: impl IntoIterator<Item = String>,
        mode: ExecutionMode,
        inputs: Option<Value>,
    ) -> Self {
        let steps = step_ids
            .into_iter()
            .map(|id| (id, StepRecord::new()))
            .collect();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            run_id,
            workflow: workflow.into(),
            status: RunStatus::Pending,
            mode,
            steps,
            artifacts: BTreeMap::new(),
            gate_loopbacks: BTreeMap::new(),
            gates_satisfied: BTreeSet::new(),
            inputs,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn step(&self, id: &str) -> Option<&StepRecord> {
        self.steps.get(id)
    }

    pub fn step_mut(&mut self, id: &str) -> Option<&mut StepRecord> {
        self.steps.get_mut(id)
    }

    /// Ids of steps currently in `Completed` status.
    pub fn completed_step_ids(&self) -> BTreeSet<String> {
        self.steps
            .iter()
            .filter(|(_, record)| record.status == StepStatus::Completed)
            .map(|(id, _)| id.clone())
            .collect()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    pub fn has_running_steps(&self) -> bool {
        self.steps
            .values()
            .any(|record| record.status == StepStatus::Running)
    }
}

// ---------------------------------------------------------------------------
// Run history events
// ---------------------------------------------------------------------------

/// Kinds of entries in a run's append-only history log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunEventKind {
    RunStarted,
    RunResumed,
    StepStarted,
    StepCompleted,
    StepFailed,
    StepTimedOut,
    StepSkipped,
    GatePassed,
    GateLoopback,
    GateExhausted,
    StateWarning,
    RunCompleted,
    RunFailed,
    RunCancelling,
    RunCancelled,
}

/// One entry in a run's append-only history log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunEvent {
    /// When the event occurred.
    pub at: DateTime<Utc>,

    /// What happened.
    pub kind: RunEventKind,

    /// Step the event concerns, when step-scoped.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<String>,

    /// Free-form detail (error text, gate score, skip reason).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl RunEvent {
    pub fn new(kind: RunEventKind) -> Self {
        Self {
            at: Utc::now(),
            kind,
            step_id: None,
            detail: None,
        }
    }

    pub fn with_step(mut self, step_id: impl Into<String>) -> Self {
        self.step_id = Some(step_id.into());
        self
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
