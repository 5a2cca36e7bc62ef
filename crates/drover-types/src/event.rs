//! Kernel events published on the in-process event bus.
//!
//! Every significant kernel transition emits a `KernelEvent`. Subscribers
//! (loggers, test harnesses, future control planes) observe runs without
//! touching the state store. Events are serializable so they can also be
//! forwarded over process boundaries.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// An event emitted by the workflow kernel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum KernelEvent {
    // -- Run lifecycle --
    RunStarted {
        run_id: Uuid,
        workflow: String,
    },
    RunResumed {
        run_id: Uuid,
        workflow: String,
    },
    RunCompleted {
        run_id: Uuid,
        workflow: String,
        duration_ms: u64,
        steps_completed: usize,
    },
    RunFailed {
        run_id: Uuid,
        workflow: String,
        error: String,
    },
    RunCancelled {
        run_id: Uuid,
        workflow: String,
    },

    // -- Step lifecycle --
    StepStarted {
        run_id: Uuid,
        step_id: String,
        capability: String,
        attempt: u32,
    },
    StepCompleted {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        duration_ms: u64,
    },
    StepFailed {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        error: String,
        will_retry: bool,
    },
    StepSkipped {
        run_id: Uuid,
        step_id: String,
        reason: String,
    },

    // -- Quality gates --
    GatePassed {
        run_id: Uuid,
        step_id: String,
        gate: String,
        score: f64,
    },
    GateLoopback {
        run_id: Uuid,
        gate: String,
        target: String,
        loopbacks_used: u32,
    },
    GateExhausted {
        run_id: Uuid,
        gate: String,
        reason: String,
    },

    // -- Completion monitor --
    MarkerObserved {
        run_id: Uuid,
        step_id: String,
        attempt: u32,
        success: bool,
    },

    // -- Epic sequences --
    SequenceStarted {
        sequence_id: Uuid,
        epic: String,
        units: usize,
    },
    UnitStarted {
        sequence_id: Uuid,
        unit_id: String,
        run_id: Uuid,
    },
    UnitCompleted {
        sequence_id: Uuid,
        unit_id: String,
        run_id: Uuid,
    },
    SequenceHalted {
        sequence_id: Uuid,
        unit_id: String,
        error: String,
    },
    SequenceCompleted {
        sequence_id: Uuid,
    },
}

impl KernelEvent {
    /// The run this event concerns, when run-scoped.
    pub fn run_id(&self) -> Option<Uuid> {
        match self {
            Self::RunStarted { run_id, .. }
            | Self::RunResumed { run_id, .. }
            | Self::RunCompleted { run_id, .. }
            | Self::RunFailed { run_id, .. }
            | Self::RunCancelled { run_id, .. }
            | Self::StepStarted { run_id, .. }
            | Self::StepCompleted { run_id, .. }
            | Self::StepFailed { run_id, .. }
            | Self::StepSkipped { run_id, .. }
            | Self::GatePassed { run_id, .. }
            | Self::GateLoopback { run_id, .. }
            | Self::GateExhausted { run_id, .. }
            | Self::MarkerObserved { run_id, .. }
            | Self::UnitStarted { run_id, .. }
            | Self::UnitCompleted { run_id, .. } => Some(*run_id),
            Self::SequenceStarted { .. }
            | Self::SequenceHalted { .. }
            | Self::SequenceCompleted { .. } => None,
        }
    }
}
