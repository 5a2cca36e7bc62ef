//! Step executors: the boundary between the kernel and actual work.
//!
//! The kernel never interprets a step's capability tag. It resolves the tag
//! against an [`ExecutorRegistry`] and hands the executor a [`StepRequest`];
//! the executor returns a [`StepOutcome`] (or defers completion to an
//! out-of-process collaborator, see the `marker` module). Everything an
//! executor reports -- artifacts, metrics, failure detail -- flows back into
//! the run state through the scheduler.

pub mod marker;

use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::sync::Arc;

use dashmap::DashMap;
use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::oneshot;
use uuid::Uuid;

use drover_types::run::{ArtifactKind, ArtifactRecord};

// ---------------------------------------------------------------------------
// Request and outcome payloads
// ---------------------------------------------------------------------------

/// Everything an executor needs to perform one step attempt.
///
/// Serializable: in monitored mode this struct is written verbatim as the
/// request marker for out-of-process collaborators.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepRequest {
    pub run_id: Uuid,
    pub step_id: String,
    pub capability: String,
    /// 1-based attempt number.
    pub attempt: u32,
    /// Artifact names this step is expected to create.
    pub creates: Vec<String>,
    /// Resolved input artifacts, keyed by artifact name.
    pub artifacts: BTreeMap<String, ArtifactRecord>,
    /// Caller-supplied run inputs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub run_inputs: Option<Value>,
    /// Opaque step parameters from the definition.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub params: Option<Value>,
    /// Scratch directory private to this run.
    pub workdir: PathBuf,
}

/// Whether an attempt succeeded, as reported by the executor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failure,
}

/// An artifact produced by an attempt, before the scheduler stamps it with
/// provenance and registers it in the run state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ArtifactDraft {
    pub name: String,
    pub kind: ArtifactKind,
}

/// The reported result of one step attempt.
///
/// Serializable: in monitored mode collaborators write this struct as the
/// result marker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    pub status: OutcomeStatus,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub artifacts: Vec<ArtifactDraft>,
    /// Metrics for quality gates, e.g. `{"coverage": 0.93}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metrics: BTreeMap<String, f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl StepOutcome {
    pub fn success() -> Self {
        Self {
            status: OutcomeStatus::Success,
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            detail: None,
        }
    }

    pub fn failure(detail: impl Into<String>) -> Self {
        Self {
            status: OutcomeStatus::Failure,
            artifacts: Vec::new(),
            metrics: BTreeMap::new(),
            detail: Some(detail.into()),
        }
    }

    pub fn with_artifact(mut self, name: impl Into<String>, kind: ArtifactKind) -> Self {
        self.artifacts.push(ArtifactDraft {
            name: name.into(),
            kind,
        });
        self
    }

    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    pub fn is_success(&self) -> bool {
        self.status == OutcomeStatus::Success
    }
}

/// How an executor concluded an attempt.
#[derive(Debug)]
pub enum StepDisposition {
    /// The attempt finished in-process with the given outcome.
    Finished(StepOutcome),
    /// The attempt was handed to an out-of-process collaborator. The
    /// scheduler waits for the completion monitor to observe a result
    /// marker for this attempt.
    Deferred,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, Error)]
pub enum StepError {
    #[error("step execution failed: {0}")]
    Failed(String),

    #[error("step io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("step payload error: {0}")]
    Serialization(#[from] serde_json::Error),
}

// ---------------------------------------------------------------------------
// Executor trait and registry
// ---------------------------------------------------------------------------

/// An executor for one capability tag.
///
/// Returns boxed futures rather than RPITIT so executors can be stored
/// behind `dyn` in the registry.
pub trait StepExecutor: Send + Sync {
    /// Capability tag this executor services.
    fn capability(&self) -> &str;

    /// Perform one step attempt.
    fn run(&self, request: StepRequest) -> BoxFuture<'_, Result<StepDisposition, StepError>>;
}

/// Maps capability tags to executors.
///
/// Populated once at startup; the scheduler resolves every synchronous
/// dispatch through it.
#[derive(Default)]
pub struct ExecutorRegistry {
    executors: HashMap<String, Arc<dyn StepExecutor>>,
}

impl ExecutorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an executor under its capability tag, replacing any
    /// previous registration for that tag.
    pub fn register(&mut self, executor: Arc<dyn StepExecutor>) {
        self.executors
            .insert(executor.capability().to_string(), executor);
    }

    pub fn get(&self, capability: &str) -> Option<Arc<dyn StepExecutor>> {
        self.executors.get(capability).cloned()
    }

    /// The set of registered capability tags, for definition validation.
    pub fn capabilities(&self) -> std::collections::BTreeSet<String> {
        self.executors.keys().cloned().collect()
    }

    pub fn is_empty(&self) -> bool {
        self.executors.is_empty()
    }
}

impl std::fmt::Debug for ExecutorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutorRegistry")
            .field("capabilities", &self.capabilities())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Completion routing
// ---------------------------------------------------------------------------

/// Identifies one awaited attempt: (run, step, attempt).
pub type CompletionKey = (Uuid, String, u32);

/// Routes out-of-band completions to the scheduler tasks awaiting them.
///
/// The scheduler registers a waiter before deferring an attempt; the
/// completion monitor delivers the parsed result marker here. A delivery
/// with no registered waiter returns `false`, which tells the monitor to
/// reconcile the outcome directly into the state store instead.
#[derive(Clone, Default)]
pub struct CompletionRouter {
    waiters: Arc<DashMap<CompletionKey, oneshot::Sender<StepOutcome>>>,
}

impl CompletionRouter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a waiter for the given attempt, replacing any stale one.
    pub fn register(&self, key: CompletionKey) -> oneshot::Receiver<StepOutcome> {
        let (tx, rx) = oneshot::channel();
        self.waiters.insert(key, tx);
        rx
    }

    /// Drop the waiter for an attempt that will no longer be awaited.
    pub fn deregister(&self, key: &CompletionKey) {
        self.waiters.remove(key);
    }

    /// Deliver an outcome to the waiter for `key`.
    ///
    /// Returns `true` if a waiter accepted the outcome.
    pub fn deliver(&self, key: &CompletionKey, outcome: StepOutcome) -> bool {
        match self.waiters.remove(key) {
            Some((_, tx)) => tx.send(outcome).is_ok(),
            None => false,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.waiters.is_empty()
    }
}

impl std::fmt::Debug for CompletionRouter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionRouter")
            .field("waiting", &self.waiters.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    impl StepExecutor for EchoExecutor {
        fn capability(&self) -> &str {
            "echo"
        }

        fn run(&self, request: StepRequest) -> BoxFuture<'_, Result<StepDisposition, StepError>> {
            Box::pin(async move {
                let mut outcome = StepOutcome::success();
                for name in &request.creates {
                    outcome = outcome.with_artifact(
                        name.clone(),
                        ArtifactKind::Document {
                            content: format!("echo:{}", request.step_id),
                        },
                    );
                }
                Ok(StepDisposition::Finished(outcome))
            })
        }
    }

    fn sample_request() -> StepRequest {
        StepRequest {
            run_id: Uuid::now_v7(),
            step_id: "draft".to_string(),
            capability: "echo".to_string(),
            attempt: 1,
            creates: vec!["draft-doc".to_string()],
            artifacts: BTreeMap::new(),
            run_inputs: None,
            params: None,
            workdir: PathBuf::from("/tmp/scratch"),
        }
    }

    #[tokio::test]
    async fn registry_dispatches_by_capability() {
        let mut registry = ExecutorRegistry::new();
        registry.register(Arc::new(EchoExecutor));

        let executor = registry.get("echo").unwrap();
        let disposition = executor.run(sample_request()).await.unwrap();

        match disposition {
            StepDisposition::Finished(outcome) => {
                assert!(outcome.is_success());
                assert_eq!(outcome.artifacts.len(), 1);
                assert_eq!(outcome.artifacts[0].name, "draft-doc");
            }
            StepDisposition::Deferred => panic!("echo executor never defers"),
        }
    }

    #[test]
    fn registry_unknown_capability_is_none() {
        let registry = ExecutorRegistry::new();
        assert!(registry.get("missing").is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn outcome_builder_accumulates() {
        let outcome = StepOutcome::success()
            .with_metric("coverage", 0.93)
            .with_artifact(
                "report",
                ArtifactKind::File {
                    path: "out/report.md".to_string(),
                },
            );

        assert_eq!(outcome.metrics["coverage"], 0.93);
        assert_eq!(outcome.artifacts.len(), 1);
    }

    #[tokio::test]
    async fn router_delivers_to_registered_waiter() {
        let router = CompletionRouter::new();
        let key: CompletionKey = (Uuid::now_v7(), "draft".to_string(), 1);

        let rx = router.register(key.clone());
        assert!(router.deliver(&key, StepOutcome::success()));

        let outcome = rx.await.unwrap();
        assert!(outcome.is_success());
        assert!(router.is_empty());
    }

    #[test]
    fn router_delivery_without_waiter_returns_false() {
        let router = CompletionRouter::new();
        let key: CompletionKey = (Uuid::now_v7(), "draft".to_string(), 1);

        assert!(!router.deliver(&key, StepOutcome::success()));
    }

    #[test]
    fn request_marker_payload_roundtrip() {
        let request = sample_request();
        let json = serde_json::to_string(&request).unwrap();
        let parsed: StepRequest = serde_json::from_str(&json).unwrap();

        assert_eq!(parsed.step_id, "draft");
        assert_eq!(parsed.creates, vec!["draft-doc"]);
    }
}
