//! Workflow definition parsing, validation, and file discovery.
//!
//! Definitions are YAML documents. Validation is strict and runs before a
//! definition ever reaches the scheduler: structural problems (duplicate
//! ids, dangling requirements, cycles, misconfigured gates) are rejected
//! here with [`DefinitionError`] rather than surfacing mid-run.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::path::Path;

use thiserror::Error;

use drover_types::workflow::{StepDefinition, WorkflowDefinition};

use super::dag;

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum DefinitionError {
    #[error("definition parse error: {0}")]
    Parse(String),

    #[error("definition invalid: {0}")]
    Invalid(String),

    #[error("dependency cycle: {0}")]
    Cycle(String),

    #[error("unknown dependency: {0}")]
    UnknownDependency(String),

    #[error("unknown capability: {0}")]
    UnknownCapability(String),

    #[error("definition io error: {0}")]
    Io(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

/// Parse a workflow definition from YAML and validate its structure.
///
/// Capability tags are not checked here; pass the registry's tags to
/// [`validate_definition`] for that.
pub fn parse_workflow_yaml(yaml: &str) -> Result<WorkflowDefinition, DefinitionError> {
    let definition: WorkflowDefinition =
        serde_yaml_ng::from_str(yaml).map_err(|e| DefinitionError::Parse(e.to_string()))?;
    validate_definition(&definition, None)?;
    Ok(definition)
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

/// Validate a workflow definition.
///
/// Checks, in order: naming, version, step ids, artifact declarations,
/// per-step policies (timeouts, retries, gates), capability tags when
/// `known_capabilities` is given, and finally the dependency graph
/// (dangling requirements, cycles).
pub fn validate_definition(
    definition: &WorkflowDefinition,
    known_capabilities: Option<&BTreeSet<String>>,
) -> Result<(), DefinitionError> {
    if definition.name.is_empty() {
        return Err(DefinitionError::Invalid(
            "workflow name cannot be empty".to_string(),
        ));
    }
    if !definition
        .name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(DefinitionError::Invalid(format!(
            "workflow name '{}' may only contain alphanumerics and hyphens",
            definition.name
        )));
    }
    if let Err(e) = semver::Version::parse(&definition.version) {
        return Err(DefinitionError::Invalid(format!(
            "version '{}' is not valid semver: {e}",
            definition.version
        )));
    }
    if definition.steps.is_empty() {
        return Err(DefinitionError::Invalid(
            "workflow must have at least one step".to_string(),
        ));
    }
    if let Some(timeout) = definition.timeout_secs
        && timeout == 0
    {
        return Err(DefinitionError::Invalid(
            "workflow timeout_secs must be greater than zero".to_string(),
        ));
    }

    let mut seen_ids = HashSet::new();
    for step in &definition.steps {
        if !is_valid_step_id(&step.id) {
            return Err(DefinitionError::Invalid(format!(
                "step id '{}' may only contain alphanumerics, hyphens, and underscores",
                step.id
            )));
        }
        if !seen_ids.insert(step.id.as_str()) {
            return Err(DefinitionError::Invalid(format!(
                "duplicate step id '{}'",
                step.id
            )));
        }
    }

    validate_artifacts(&definition.steps)?;

    for step in &definition.steps {
        validate_step_policies(definition, step)?;

        if let Some(known) = known_capabilities
            && !known.contains(&step.capability)
        {
            return Err(DefinitionError::UnknownCapability(format!(
                "step '{}' names capability '{}', which has no registered executor",
                step.id, step.capability
            )));
        }
    }

    let nodes = dag::step_nodes(&definition.steps)?;
    dag::validate_graph(&nodes)?;
    Ok(())
}

fn is_valid_step_id(id: &str) -> bool {
    !id.is_empty()
        && id
            .chars()
            .all(|c| c.is_alphanumeric() || c == '-' || c == '_')
}

/// Artifact names must have exactly one producer and must not collide
/// with step ids, so a `requires` entry is never ambiguous.
fn validate_artifacts(steps: &[StepDefinition]) -> Result<(), DefinitionError> {
    let step_ids: HashSet<&str> = steps.iter().map(|s| s.id.as_str()).collect();
    let mut producers: HashMap<&str, &str> = HashMap::new();

    for step in steps {
        for artifact in &step.creates {
            if artifact.is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "step '{}' declares an empty artifact name",
                    step.id
                )));
            }
            if step_ids.contains(artifact.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "artifact '{}' collides with a step id",
                    artifact
                )));
            }
            if let Some(previous) = producers.insert(artifact.as_str(), step.id.as_str()) {
                return Err(DefinitionError::Invalid(format!(
                    "artifact '{}' is created by both '{}' and '{}'",
                    artifact, previous, step.id
                )));
            }
        }
    }
    Ok(())
}

fn validate_step_policies(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
) -> Result<(), DefinitionError> {
    if let Some(timeout) = step.timeout_secs
        && timeout == 0
    {
        return Err(DefinitionError::Invalid(format!(
            "step '{}' timeout_secs must be greater than zero",
            step.id
        )));
    }

    if let Some(retry) = &step.retry {
        if retry.max_attempts == 0 {
            return Err(DefinitionError::Invalid(format!(
                "step '{}' retry max_attempts must be at least 1",
                step.id
            )));
        }
        if let Some(target) = &retry.loopback_to {
            validate_loopback_target(definition, step, target, "retry")?;
        }
    }

    if let Some(gate) = &step.gate {
        if gate.metrics.is_empty() {
            return Err(DefinitionError::Invalid(format!(
                "gate on step '{}' must inspect at least one metric",
                step.id
            )));
        }
        if !(0.0..=1.0).contains(&gate.pass_threshold) {
            return Err(DefinitionError::Invalid(format!(
                "gate on step '{}' has pass_threshold {} outside [0.0, 1.0]",
                step.id, gate.pass_threshold
            )));
        }
        for metric in &gate.metrics {
            if metric.name.is_empty() {
                return Err(DefinitionError::Invalid(format!(
                    "gate on step '{}' has a metric with an empty name",
                    step.id
                )));
            }
            if metric.weight <= 0.0 {
                return Err(DefinitionError::Invalid(format!(
                    "gate metric '{}' on step '{}' must have positive weight",
                    metric.name, step.id
                )));
            }
        }
        validate_loopback_target(definition, step, &gate.loopback_to, "gate")?;
    }

    Ok(())
}

/// A loopback target must be an existing step strictly upstream of the
/// step it rewinds from; otherwise the rewind could never unblock it.
fn validate_loopback_target(
    definition: &WorkflowDefinition,
    step: &StepDefinition,
    target: &str,
    what: &str,
) -> Result<(), DefinitionError> {
    if !definition.steps.iter().any(|s| s.id == target) {
        return Err(DefinitionError::UnknownDependency(format!(
            "{} on step '{}' loops back to unknown step '{}'",
            what, step.id, target
        )));
    }
    let nodes = dag::step_nodes(&definition.steps)?;
    if !dag::dependencies_of(&nodes, &step.id).contains(target) {
        return Err(DefinitionError::Invalid(format!(
            "{} on step '{}' loops back to '{}', which is not upstream of it",
            what, step.id, target
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// File operations
// ---------------------------------------------------------------------------

/// Load and validate a workflow definition from a YAML file.
pub fn load_workflow_file(path: &Path) -> Result<WorkflowDefinition, DefinitionError> {
    let yaml = std::fs::read_to_string(path)?;
    parse_workflow_yaml(&yaml)
}

/// Serialize a workflow definition to a YAML file, creating parent
/// directories as needed.
pub fn save_workflow_file(
    path: &Path,
    definition: &WorkflowDefinition,
) -> Result<(), DefinitionError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let yaml = serde_yaml_ng::to_string(definition)
        .map_err(|e| DefinitionError::Parse(e.to_string()))?;
    std::fs::write(path, yaml)?;
    Ok(())
}

/// Discover workflow definitions under a directory (non-recursive).
///
/// Files that fail to parse or validate are skipped with a warning so one
/// bad document does not hide the rest.
pub fn discover_workflows(dir: &Path) -> Result<Vec<WorkflowDefinition>, DefinitionError> {
    let mut workflows = Vec::new();
    if !dir.is_dir() {
        return Ok(workflows);
    }
    for entry in std::fs::read_dir(dir)? {
        let path = entry?.path();
        let is_yaml = path
            .extension()
            .is_some_and(|ext| ext == "yaml" || ext == "yml");
        if !is_yaml {
            continue;
        }
        match load_workflow_file(&path) {
            Ok(workflow) => workflows.push(workflow),
            Err(e) => {
                tracing::warn!(?path, error = %e, "skipping unparseable workflow file");
            }
        }
    }
    workflows.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(workflows)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
