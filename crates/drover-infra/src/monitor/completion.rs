//! Completion monitor: the single consumer of result markers.
//!
//! Out-of-process collaborators signal a finished attempt by dropping a
//! `<step>.attempt-<n>.result.json` file into the run's marker directory.
//! The monitor sweeps those directories on an interval, woken early by a
//! debounced filesystem watcher and by schedulers that have just written
//! a request marker. Each settled result marker is routed to the waiting
//! scheduler when one is registered; otherwise the outcome is reconciled
//! straight into the run snapshot so a crashed driver's work is not lost.
//!
//! Consumed markers are renamed with a `.consumed` suffix, repeatedly
//! unparseable ones with `.invalid`, so a sweep never processes a marker
//! twice and operators can inspect what was rejected.

use std::collections::{HashMap, HashSet};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
// Use notify types re-exported through notify-debouncer-mini to avoid version conflicts.
// notify-debouncer-mini 0.5 depends on notify 7.x; the workspace also has notify 8.x,
// but we must use the same version the debouncer was compiled against.
use notify_debouncer_mini::notify::{RecommendedWatcher, RecursiveMode};
use notify_debouncer_mini::{DebounceEventResult, Debouncer, new_debouncer};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_core::config::EngineConfig;
use drover_core::event::EventBus;
use drover_core::executor::marker::{
    CONSUMED_MARKER_SUFFIX, INVALID_MARKER_SUFFIX, RESULT_MARKER_SUFFIX, parse_result_marker,
};
use drover_core::executor::{CompletionRouter, StepOutcome};
use drover_core::repository::{StateRepository, markers_dir, runs_root};
use drover_core::workflow::executor::WorkflowEngine;
use drover_types::error::StateError;
use drover_types::event::KernelEvent;
use drover_types::run::{ArtifactRecord, RunEvent, RunEventKind, StepStatus};

/// Result markers smaller than this are writes still in flight.
const MIN_MARKER_BYTES: u64 = 16;

/// Parse failures tolerated per marker before it is quarantined.
const MAX_PARSE_STRIKES: u32 = 3;

/// Debounce window for the filesystem watcher.
const WATCH_DEBOUNCE: Duration = Duration::from_millis(200);

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum MonitorError {
    #[error("monitor io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state error: {0}")]
    State(#[from] StateError),

    #[error("marker parse error: {0}")]
    Marker(String),

    #[error("watcher error: {0}")]
    Watcher(String),
}

// ---------------------------------------------------------------------------
// CompletionMonitor
// ---------------------------------------------------------------------------

/// Background sweeper for result markers.
///
/// One monitor serves every run under a state root. It is deliberately
/// stateless across sweeps -- everything it needs is re-derived from the
/// marker directories and the run snapshots, so restarting the monitor
/// (or the whole process) loses nothing.
pub struct CompletionMonitor<S: StateRepository> {
    store: Arc<S>,
    router: CompletionRouter,
    events: EventBus,
    wake: Arc<Notify>,
    state_root: PathBuf,
    poll_interval: Duration,
    settle_window: Duration,
}

impl<S: StateRepository + 'static> CompletionMonitor<S> {
    pub fn new(
        store: Arc<S>,
        router: CompletionRouter,
        events: EventBus,
        wake: Arc<Notify>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            router,
            events,
            wake,
            state_root: config.state_root.clone(),
            poll_interval: config.poll_interval(),
            settle_window: config.settle_window(),
        }
    }

    /// Wire a monitor to an engine's completion router, event bus, and
    /// wake notifier. The store must be the same repository the engine
    /// persists to.
    pub fn for_engine(store: Arc<S>, engine: &WorkflowEngine<S>) -> Self {
        Self::new(
            store,
            engine.completion_router(),
            engine.event_bus().clone(),
            engine.monitor_wake(),
            engine.config(),
        )
    }

    /// Start the sweep loop on a background task.
    pub fn spawn(self) -> MonitorHandle {
        let token = CancellationToken::new();
        let task_token = token.clone();
        let task = tokio::spawn(async move {
            self.run(task_token).await;
        });
        MonitorHandle {
            token,
            task: Some(task),
        }
    }

    async fn run(self, token: CancellationToken) {
        let mut strikes: HashMap<PathBuf, u32> = HashMap::new();
        let (fs_tx, mut fs_rx) = mpsc::channel::<()>(8);
        // Hold a sender so the channel never closes when the watcher is
        // absent; recv() must only fire on real filesystem events.
        let _fs_keepalive = fs_tx.clone();
        let _debouncer = match start_marker_watcher(&self.state_root, fs_tx) {
            Ok(debouncer) => Some(debouncer),
            Err(error) => {
                tracing::warn!(error = %error, "marker watcher unavailable, polling only");
                None
            }
        };
        tracing::info!(
            state_root = %self.state_root.display(),
            poll_ms = self.poll_interval.as_millis() as u64,
            watching = _debouncer.is_some(),
            "completion monitor started"
        );

        loop {
            tokio::select! {
                _ = token.cancelled() => break,
                _ = tokio::time::sleep(self.poll_interval) => {}
                _ = self.wake.notified() => {}
                _ = fs_rx.recv() => {}
            }
            if let Err(error) = self.sweep(&mut strikes).await {
                tracing::warn!(error = %error, "marker sweep failed");
            }
        }
        tracing::info!("completion monitor stopped");
    }

    /// One pass over every run's marker directory.
    async fn sweep(&self, strikes: &mut HashMap<PathBuf, u32>) -> Result<(), MonitorError> {
        let root = runs_root(&self.state_root);
        let mut runs = match tokio::fs::read_dir(&root).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = runs.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Ok(run_id) = Uuid::parse_str(name) else {
                continue;
            };
            if let Err(error) = self.sweep_run(run_id, strikes).await {
                tracing::warn!(run_id = %run_id, error = %error, "marker sweep failed for run");
            }
        }
        Ok(())
    }

    async fn sweep_run(
        &self,
        run_id: Uuid,
        strikes: &mut HashMap<PathBuf, u32>,
    ) -> Result<(), MonitorError> {
        let dir = markers_dir(&self.state_root, run_id);
        let mut entries = match tokio::fs::read_dir(&dir).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(()),
            Err(error) => return Err(error.into()),
        };
        while let Some(entry) = entries.next_entry().await? {
            let file_name = entry.file_name();
            let Some(file_name) = file_name.to_str() else {
                continue;
            };
            let Some((step_id, attempt)) = parse_result_marker(file_name) else {
                continue;
            };
            let path = entry.path();

            // Settling discipline: a marker still being written is left
            // for a later pass, never read torn.
            let Ok(meta) = entry.metadata().await else {
                continue;
            };
            if meta.len() < MIN_MARKER_BYTES {
                continue;
            }
            if let Ok(modified) = meta.modified()
                && let Ok(age) = modified.elapsed()
                && age < self.settle_window
            {
                continue;
            }

            let outcome = match read_outcome(&path).await {
                Ok(outcome) => {
                    strikes.remove(&path);
                    outcome
                }
                Err(error) => {
                    let count = strikes.entry(path.clone()).or_insert(0);
                    *count += 1;
                    if *count >= MAX_PARSE_STRIKES {
                        strikes.remove(&path);
                        tracing::warn!(
                            run_id = %run_id,
                            marker = %path.display(),
                            error = %error,
                            "marker unparseable after repeated reads, quarantining"
                        );
                        let invalid = with_name_suffix(&path, INVALID_MARKER_SUFFIX);
                        if let Err(rename_err) = tokio::fs::rename(&path, &invalid).await {
                            tracing::warn!(
                                marker = %path.display(),
                                error = %rename_err,
                                "failed to quarantine invalid marker"
                            );
                        }
                    } else {
                        tracing::debug!(
                            run_id = %run_id,
                            marker = %path.display(),
                            error = %error,
                            "marker not yet parseable, will retry"
                        );
                    }
                    continue;
                }
            };

            self.consume_marker(run_id, &step_id, attempt, outcome, &path)
                .await?;
        }
        Ok(())
    }

    /// Route one settled result marker: to the waiting scheduler when one
    /// is registered, otherwise reconciled directly into run state. Either
    /// way the marker file is renamed so it is never processed again.
    async fn consume_marker(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        outcome: StepOutcome,
        path: &Path,
    ) -> Result<(), MonitorError> {
        let success = outcome.is_success();
        let key = (run_id, step_id.to_string(), attempt);
        let delivered = self.router.deliver(&key, outcome.clone());
        let mut reconciled = false;
        if !delivered {
            reconciled = self.reconcile_orphan(run_id, step_id, attempt, outcome).await?;
        }

        let consumed = with_name_suffix(path, CONSUMED_MARKER_SUFFIX);
        if let Err(error) = tokio::fs::rename(path, &consumed).await {
            tracing::warn!(
                marker = %path.display(),
                error = %error,
                "failed to rename consumed result marker"
            );
        }
        if !delivered && !reconciled {
            tracing::debug!(
                run_id = %run_id,
                step_id,
                attempt,
                "stale result marker consumed without effect"
            );
        }

        self.events.publish(KernelEvent::MarkerObserved {
            run_id,
            step_id: step_id.to_string(),
            attempt,
            success,
        });
        tracing::info!(
            run_id = %run_id,
            step_id,
            attempt,
            success,
            delivered,
            reconciled,
            "result marker observed"
        );
        Ok(())
    }

    /// Apply an undelivered outcome straight to the run snapshot.
    ///
    /// Only an attempt the snapshot still shows as running is eligible;
    /// anything else is a stale or duplicate marker. Returns whether the
    /// outcome was applied.
    async fn reconcile_orphan(
        &self,
        run_id: Uuid,
        step_id: &str,
        attempt: u32,
        outcome: StepOutcome,
    ) -> Result<bool, MonitorError> {
        let mut success = outcome.is_success();
        let mut detail = outcome.detail.clone();

        // Same rule the scheduler applies: success without the declared
        // artifacts counts as failure.
        if success {
            match self.store.load_definition(run_id).await {
                Ok(definition) => {
                    if let Some(step) = definition.steps.iter().find(|step| step.id == step_id) {
                        let produced: HashSet<&str> =
                            outcome.artifacts.iter().map(|a| a.name.as_str()).collect();
                        let missing: Vec<&str> = step
                            .creates
                            .iter()
                            .map(String::as_str)
                            .filter(|name| !produced.contains(name))
                            .collect();
                        if !missing.is_empty() {
                            success = false;
                            detail = Some(format!(
                                "attempt succeeded without producing declared artifact(s): {}",
                                missing.join(", ")
                            ));
                        }
                    }
                }
                Err(StateError::RunNotFound(_)) => return Ok(false),
                Err(error) => return Err(error.into()),
            }
        }

        let step = step_id.to_string();
        let artifacts = outcome.artifacts;
        let metrics = outcome.metrics;
        let error_text = detail.unwrap_or_else(|| "collaborator reported failure".to_string());
        let record_error = error_text.clone();
        let recorded_at = Utc::now();
        let applied = match self
            .store
            .mutate_run(run_id, move |state| {
                let eligible = matches!(
                    state.step(&step),
                    Some(record)
                        if record.status == StepStatus::Running && record.attempts == attempt
                );
                if !eligible {
                    return None;
                }
                if success {
                    for draft in artifacts {
                        state.artifacts.insert(
                            draft.name.clone(),
                            ArtifactRecord {
                                name: draft.name,
                                kind: draft.kind,
                                produced_by: step.clone(),
                                attempt,
                                recorded_at,
                            },
                        );
                    }
                }
                let mut duration_ms = 0u64;
                if let Some(record) = state.step_mut(&step) {
                    duration_ms = record
                        .started_at
                        .map(|started| (recorded_at - started).num_milliseconds().max(0) as u64)
                        .unwrap_or(0);
                    record.completed_at = Some(recorded_at);
                    if success {
                        record.status = StepStatus::Completed;
                        record.metrics = metrics;
                        record.error = None;
                    } else {
                        record.status = StepStatus::Failed;
                        record.error = Some(record_error);
                    }
                }
                Some(duration_ms)
            })
            .await
        {
            Ok(applied) => applied,
            Err(StateError::RunNotFound(_)) => return Ok(false),
            Err(error) => return Err(error.into()),
        };
        let Some(duration_ms) = applied else {
            return Ok(false);
        };

        if success {
            self.store
                .append_event(
                    run_id,
                    &RunEvent::new(RunEventKind::StepCompleted)
                        .with_step(step_id)
                        .with_detail(format!("reconciled from result marker (attempt {attempt})")),
                )
                .await?;
            self.events.publish(KernelEvent::StepCompleted {
                run_id,
                step_id: step_id.to_string(),
                attempt,
                duration_ms,
            });
        } else {
            self.store
                .append_event(
                    run_id,
                    &RunEvent::new(RunEventKind::StepFailed)
                        .with_step(step_id)
                        .with_detail(&error_text),
                )
                .await?;
            self.events.publish(KernelEvent::StepFailed {
                run_id,
                step_id: step_id.to_string(),
                attempt,
                error: error_text.clone(),
                will_retry: false,
            });
        }
        tracing::info!(
            run_id = %run_id,
            step_id,
            attempt,
            success,
            "reconciled orphaned attempt from result marker"
        );
        Ok(true)
    }
}

// ---------------------------------------------------------------------------
// MonitorHandle
// ---------------------------------------------------------------------------

/// RAII handle for a spawned monitor. Dropping it stops the sweep loop.
pub struct MonitorHandle {
    token: CancellationToken,
    task: Option<JoinHandle<()>>,
}

impl MonitorHandle {
    /// Stop the monitor and wait for the sweep task to exit.
    pub async fn shutdown(mut self) {
        self.token.cancel();
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

/// Start a debounced watcher on the runs directory that nudges the sweep
/// loop whenever a result marker appears.
fn start_marker_watcher(
    state_root: &Path,
    tx: mpsc::Sender<()>,
) -> Result<Debouncer<RecommendedWatcher>, MonitorError> {
    let root = runs_root(state_root);
    std::fs::create_dir_all(&root)?;
    let mut debouncer = new_debouncer(WATCH_DEBOUNCE, move |result: DebounceEventResult| {
        if let Ok(events) = result
            && events.iter().any(|event| {
                event
                    .path
                    .file_name()
                    .and_then(|name| name.to_str())
                    .is_some_and(|name| name.ends_with(RESULT_MARKER_SUFFIX))
            })
        {
            // Non-blocking send -- a full channel already implies a
            // pending sweep.
            let _ = tx.try_send(());
        }
    })
    .map_err(|error| MonitorError::Watcher(error.to_string()))?;
    debouncer
        .watcher()
        .watch(&root, RecursiveMode::Recursive)
        .map_err(|error| MonitorError::Watcher(error.to_string()))?;
    Ok(debouncer)
}

async fn read_outcome(path: &Path) -> Result<StepOutcome, MonitorError> {
    let raw = tokio::fs::read(path).await?;
    serde_json::from_slice(&raw).map_err(|error| MonitorError::Marker(error.to_string()))
}

/// Append a suffix to a file name in place: `x.result.json` with
/// `.consumed` becomes `x.result.json.consumed`.
fn with_name_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|name| name.to_os_string())
        .unwrap_or_default();
    name.push(suffix);
    path.with_file_name(name)
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
