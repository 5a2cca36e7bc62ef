//! Epic documents: ordered collections of unit-of-work workflows.
//!
//! An epic names several units of work, each backed by a workflow (inline
//! or referenced by path) and ordered by explicit `depends_on` edges. The
//! sequencer runs units one at a time in dependency order and halts the
//! sequence when a unit's run fails.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::run::{RunStatus, STATE_SCHEMA_VERSION, StepStatus};
use crate::workflow::WorkflowDefinition;

// ---------------------------------------------------------------------------
// Epic document
// ---------------------------------------------------------------------------

/// A parsed epic document.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EpicDocument {
    /// Epic name (alphanumeric + hyphens).
    pub name: String,

    /// Human-readable description.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// The units of work, in declaration order.
    pub units: Vec<UnitOfWork>,
}

/// One unit of work inside an epic.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitOfWork {
    /// Unit identifier, unique within the epic.
    pub id: String,

    /// Optional display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,

    /// Ids of units that must complete before this one starts.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,

    /// The workflow this unit executes.
    pub workflow: UnitWorkflow,
}

/// A unit's workflow: either a path to a definition file (resolved
/// relative to the epic document) or an inline definition.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum UnitWorkflow {
    Path(String),
    Inline(WorkflowDefinition),
}

// ---------------------------------------------------------------------------
// Sequence state
// ---------------------------------------------------------------------------

/// Durable snapshot of one epic sequence execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SequenceState {
    /// Snapshot schema version.
    pub schema_version: u32,

    /// Sequence identifier.
    pub sequence_id: Uuid,

    /// Name of the epic being executed.
    pub epic: String,

    /// Overall sequence status.
    pub status: RunStatus,

    /// Per-unit records, keyed by unit id.
    pub units: BTreeMap<String, UnitRecord>,

    /// When the sequence was created.
    pub started_at: DateTime<Utc>,

    /// When the sequence reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,

    /// Failure reason for halted sequences.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Bookkeeping for one unit within a sequence.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnitRecord {
    /// Unit status, reusing the step lifecycle.
    pub status: StepStatus,

    /// Id of the workflow run backing this unit, once started.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_id: Option<Uuid>,

    /// Error or skip reason.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl UnitRecord {
    pub fn new() -> Self {
        Self {
            status: StepStatus::Pending,
            run_id: None,
            error: None,
        }
    }
}

impl Default for UnitRecord {
    fn default() -> Self {
        Self::new()
    }
}

impl SequenceState {
    /// Create a fresh pending snapshot with one pending record per unit.
    pub fn new(
        sequence_id: Uuid,
        epic: impl Into<String>,
        unit_ids: impl IntoIterator<Item = String>,
    ) -> Self {
        let units = unit_ids
            .into_iter()
            .map(|id| (id, UnitRecord::new()))
            .collect();
        Self {
            schema_version: STATE_SCHEMA_VERSION,
            sequence_id,
            epic: epic.into(),
            status: RunStatus::Pending,
            units,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
