//! Epic sequencer: drives one workflow run per unit of work, in order.
//!
//! An epic document names several units, each backed by an inline workflow
//! definition or a path to one, with explicit cross-unit dependencies.
//! Ordering is delegated to the dependency resolver at unit granularity
//! and the resulting plan is flattened: units run strictly one at a time,
//! so a unit sees every upstream unit's run finished before it starts.
//!
//! A unit whose run ends anything other than completed halts the sequence;
//! the remaining units are recorded skipped rather than started. Gate
//! loopbacks inside a unit stay inside that unit's run.

use std::collections::{BTreeMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use uuid::Uuid;

use drover_types::epic::{EpicDocument, SequenceState, UnitWorkflow};
use drover_types::error::StateError;
use drover_types::event::KernelEvent;
use drover_types::run::{ExecutionMode, RunStatus, StepStatus};
use drover_types::workflow::WorkflowDefinition;

use crate::event::bus::EventBus;
use crate::repository::StateRepository;
use crate::workflow::dag::{self, DependencyNode};
use crate::workflow::definition::{DefinitionError, parse_workflow_yaml, validate_definition};
use crate::workflow::executor::{EngineError, WorkflowEngine};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Skip reason recorded on units never started because the sequence halted.
pub const SEQUENCE_HALTED_REASON: &str = "sequence halted";

// ---------------------------------------------------------------------------
// Parsing & validation
// ---------------------------------------------------------------------------

/// Parse an epic document from YAML and validate its structure.
pub fn parse_epic_yaml(yaml: &str) -> Result<EpicDocument, EpicError> {
    let document: EpicDocument =
        serde_yaml_ng::from_str(yaml).map_err(|e| EpicError::Parse(e.to_string()))?;
    validate_epic(&document)?;
    Ok(document)
}

/// Validate an epic document: naming, unit ids, inline workflows, and the
/// cross-unit dependency graph.
pub fn validate_epic(document: &EpicDocument) -> Result<(), EpicError> {
    if document.name.is_empty() {
        return Err(EpicError::Invalid("epic name cannot be empty".to_string()));
    }
    if !document
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(EpicError::Invalid(format!(
            "epic name '{}' may only contain alphanumerics and hyphens",
            document.name
        )));
    }
    if document.units.is_empty() {
        return Err(EpicError::Invalid(
            "epic must declare at least one unit".to_string(),
        ));
    }

    let mut seen: HashSet<&str> = HashSet::new();
    for unit in &document.units {
        if unit.id.is_empty() {
            return Err(EpicError::Invalid("unit id cannot be empty".to_string()));
        }
        if !unit
            .id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
        {
            return Err(EpicError::Invalid(format!(
                "unit id '{}' may only contain alphanumerics, hyphens, and underscores",
                unit.id
            )));
        }
        if !seen.insert(unit.id.as_str()) {
            return Err(EpicError::Invalid(format!(
                "duplicate unit id '{}'",
                unit.id
            )));
        }
        if let UnitWorkflow::Inline(definition) = &unit.workflow {
            validate_definition(definition, None).map_err(|source| EpicError::UnitWorkflow {
                unit: unit.id.clone(),
                source,
            })?;
        }
    }

    dag::validate_graph(&unit_nodes(document))?;
    Ok(())
}

/// Dependency nodes for the epic's units.
fn unit_nodes(document: &EpicDocument) -> Vec<DependencyNode> {
    document
        .units
        .iter()
        .map(|unit| DependencyNode::new(unit.id.clone(), unit.depends_on.clone()))
        .collect()
}

/// The order units run in: the unit-granularity wave plan, flattened.
///
/// Units never run concurrently, so waves only fix relative order; within
/// a wave, declaration order is kept.
pub fn execution_order(document: &EpicDocument) -> Result<Vec<String>, EpicError> {
    Ok(dag::build_execution_plan(&unit_nodes(document))?
        .into_iter()
        .flatten()
        .collect())
}

/// Resolve every unit's workflow before anything runs.
///
/// Path references are read relative to `base_dir` (the epic document's
/// directory) and validated on parse; inline definitions were already
/// validated with the document.
async fn resolve_workflows(
    document: &EpicDocument,
    base_dir: &Path,
) -> Result<BTreeMap<String, WorkflowDefinition>, EpicError> {
    let mut definitions = BTreeMap::new();
    for unit in &document.units {
        let definition = match &unit.workflow {
            UnitWorkflow::Inline(definition) => definition.clone(),
            UnitWorkflow::Path(path) => {
                let resolved = base_dir.join(path);
                let yaml = tokio::fs::read_to_string(&resolved).await.map_err(|source| {
                    EpicError::WorkflowRead {
                        unit: unit.id.clone(),
                        path: resolved.clone(),
                        source,
                    }
                })?;
                parse_workflow_yaml(&yaml).map_err(|source| EpicError::UnitWorkflow {
                    unit: unit.id.clone(),
                    source,
                })?
            }
        };
        definitions.insert(unit.id.clone(), definition);
    }
    Ok(definitions)
}

// ---------------------------------------------------------------------------
// EpicSequencer
// ---------------------------------------------------------------------------

/// Runs an epic's units one at a time through the workflow engine.
///
/// Shares the engine's state store so unit runs and sequence snapshots
/// land in the same place.
pub struct EpicSequencer<S: StateRepository> {
    engine: WorkflowEngine<S>,
    store: Arc<S>,
    events: EventBus,
}

impl<S: StateRepository> Clone for EpicSequencer<S> {
    fn clone(&self) -> Self {
        Self {
            engine: self.engine.clone(),
            store: Arc::clone(&self.store),
            events: self.events.clone(),
        }
    }
}

impl<S: StateRepository + 'static> EpicSequencer<S> {
    /// `store` must be the same repository the engine persists runs to.
    pub fn new(engine: WorkflowEngine<S>, store: Arc<S>) -> Self {
        let events = engine.event_bus().clone();
        Self {
            engine,
            store,
            events,
        }
    }

    pub fn engine(&self) -> &WorkflowEngine<S> {
        &self.engine
    }

    /// Validate the document, resolve every unit's workflow, persist a
    /// fresh sequence snapshot, and start driving units in order.
    ///
    /// Returns the sequence id immediately; units run on a spawned task.
    pub async fn start_units(
        &self,
        document: EpicDocument,
        base_dir: &Path,
        mode: ExecutionMode,
    ) -> Result<Uuid, EpicError> {
        validate_epic(&document)?;
        let definitions = resolve_workflows(&document, base_dir).await?;
        let order = execution_order(&document)?;

        let sequence_id = Uuid::now_v7();
        let state = SequenceState::new(sequence_id, document.name.clone(), order.iter().cloned());
        self.store.save_sequence(&state).await?;
        self.events.publish(KernelEvent::SequenceStarted {
            sequence_id,
            epic: document.name.clone(),
            units: order.len(),
        });
        tracing::info!(
            sequence_id = %sequence_id,
            epic = document.name.as_str(),
            units = order.len(),
            mode = ?mode,
            "starting epic sequence"
        );

        let sequencer = self.clone();
        tokio::spawn(async move {
            if let Err(error) = sequencer
                .drive_sequence(state, order, definitions, mode)
                .await
            {
                tracing::error!(
                    sequence_id = %sequence_id,
                    error = %error,
                    "sequence driver stopped with error"
                );
            }
        });
        Ok(sequence_id)
    }

    /// Current snapshot of a sequence.
    pub async fn status(&self, sequence_id: Uuid) -> Result<SequenceState, EpicError> {
        Ok(self.store.load_sequence(sequence_id).await?)
    }

    /// Block until the sequence reaches a terminal status and return its
    /// final snapshot.
    pub async fn wait(&self, sequence_id: Uuid) -> Result<SequenceState, EpicError> {
        loop {
            let state = self.store.load_sequence(sequence_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            tokio::time::sleep(Duration::from_millis(25)).await;
        }
    }

    /// Run units in plan order, halting on the first unit whose run does
    /// not complete. The sequencer is the single writer of its snapshot.
    async fn drive_sequence(
        &self,
        mut state: SequenceState,
        order: Vec<String>,
        mut definitions: BTreeMap<String, WorkflowDefinition>,
        mode: ExecutionMode,
    ) -> Result<(), EpicError> {
        let sequence_id = state.sequence_id;
        state.status = RunStatus::Running;
        self.store.save_sequence(&state).await?;

        let mut halted: Option<(String, String)> = None;
        for unit_id in &order {
            if halted.is_some() {
                if let Some(record) = state.units.get_mut(unit_id) {
                    record.status = StepStatus::Skipped;
                    record.error = Some(SEQUENCE_HALTED_REASON.to_string());
                }
                self.store.save_sequence(&state).await?;
                tracing::info!(
                    sequence_id = %sequence_id,
                    unit_id = unit_id.as_str(),
                    "unit skipped, sequence halted upstream"
                );
                continue;
            }

            let Some(definition) = definitions.remove(unit_id) else {
                let reason = "no resolved workflow".to_string();
                if let Some(record) = state.units.get_mut(unit_id) {
                    record.status = StepStatus::Failed;
                    record.error = Some(reason.clone());
                }
                self.store.save_sequence(&state).await?;
                halted = Some((unit_id.clone(), reason));
                continue;
            };

            let run_id = match self.engine.start(definition, None, mode).await {
                Ok(run_id) => run_id,
                Err(error) => {
                    let reason = error.to_string();
                    if let Some(record) = state.units.get_mut(unit_id) {
                        record.status = StepStatus::Failed;
                        record.error = Some(reason.clone());
                    }
                    self.store.save_sequence(&state).await?;
                    self.events.publish(KernelEvent::SequenceHalted {
                        sequence_id,
                        unit_id: unit_id.clone(),
                        error: reason.clone(),
                    });
                    tracing::warn!(
                        sequence_id = %sequence_id,
                        unit_id = unit_id.as_str(),
                        error = reason.as_str(),
                        "unit failed to start"
                    );
                    halted = Some((unit_id.clone(), reason));
                    continue;
                }
            };

            if let Some(record) = state.units.get_mut(unit_id) {
                record.status = StepStatus::Running;
                record.run_id = Some(run_id);
            }
            self.store.save_sequence(&state).await?;
            self.events.publish(KernelEvent::UnitStarted {
                sequence_id,
                unit_id: unit_id.clone(),
                run_id,
            });
            tracing::info!(
                sequence_id = %sequence_id,
                unit_id = unit_id.as_str(),
                run_id = %run_id,
                "unit started"
            );

            let failure = match self.engine.wait(run_id).await {
                Ok(run) if run.status == RunStatus::Completed => None,
                Ok(run) => Some(
                    run.error
                        .unwrap_or_else(|| format!("run ended with status {:?}", run.status)),
                ),
                Err(error) => Some(format!("waiting on unit run failed: {error}")),
            };

            match failure {
                None => {
                    if let Some(record) = state.units.get_mut(unit_id) {
                        record.status = StepStatus::Completed;
                    }
                    self.store.save_sequence(&state).await?;
                    self.events.publish(KernelEvent::UnitCompleted {
                        sequence_id,
                        unit_id: unit_id.clone(),
                        run_id,
                    });
                    tracing::info!(
                        sequence_id = %sequence_id,
                        unit_id = unit_id.as_str(),
                        run_id = %run_id,
                        "unit completed"
                    );
                }
                Some(reason) => {
                    if let Some(record) = state.units.get_mut(unit_id) {
                        record.status = StepStatus::Failed;
                        record.error = Some(reason.clone());
                    }
                    self.store.save_sequence(&state).await?;
                    self.events.publish(KernelEvent::SequenceHalted {
                        sequence_id,
                        unit_id: unit_id.clone(),
                        error: reason.clone(),
                    });
                    tracing::warn!(
                        sequence_id = %sequence_id,
                        unit_id = unit_id.as_str(),
                        run_id = %run_id,
                        error = reason.as_str(),
                        "unit failed, halting sequence"
                    );
                    halted = Some((unit_id.clone(), reason));
                }
            }
        }

        state.completed_at = Some(Utc::now());
        match halted {
            Some((unit_id, error)) => {
                state.status = RunStatus::Failed;
                state.error = Some(format!("unit '{unit_id}' failed: {error}"));
                self.store.save_sequence(&state).await?;
                tracing::warn!(
                    sequence_id = %sequence_id,
                    unit_id = unit_id.as_str(),
                    "sequence halted"
                );
            }
            None => {
                state.status = RunStatus::Completed;
                self.store.save_sequence(&state).await?;
                self.events
                    .publish(KernelEvent::SequenceCompleted { sequence_id });
                tracing::info!(sequence_id = %sequence_id, "sequence completed");
            }
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// EpicError
// ---------------------------------------------------------------------------

/// Errors surfaced while parsing or sequencing an epic.
#[derive(Debug, thiserror::Error)]
pub enum EpicError {
    /// The document is not valid YAML for an epic.
    #[error("epic parse error: {0}")]
    Parse(String),

    /// The document violates a structural rule.
    #[error("epic invalid: {0}")]
    Invalid(String),

    /// The cross-unit dependency graph is unresolvable.
    #[error("unit graph error: {0}")]
    Graph(#[from] DefinitionError),

    /// A unit's workflow definition is invalid.
    #[error("unit '{unit}' has an invalid workflow: {source}")]
    UnitWorkflow {
        unit: String,
        source: DefinitionError,
    },

    /// A unit's referenced workflow file could not be read.
    #[error("failed to read workflow for unit '{unit}' from {path}: {source}")]
    WorkflowRead {
        unit: String,
        path: PathBuf,
        source: std::io::Error,
    },

    /// State store error.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// Engine error while starting a unit's run.
    #[error("engine error: {0}")]
    Engine(#[from] EngineError),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
