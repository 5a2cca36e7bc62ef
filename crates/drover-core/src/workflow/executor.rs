//! The workflow scheduler: readiness-driven dispatch with durable state.
//!
//! `WorkflowEngine` drives a run by recomputing the ready set from the
//! persisted snapshot on every iteration instead of walking a frozen wave
//! plan. That makes loopback rewinds trivial: a gate or retry that resets
//! earlier steps to pending simply re-readies them on the next pass.
//!
//! # Drive loop
//!
//! 1. Check the run's cancellation token.
//! 2. Settle owed gates on completed steps (pass, rewind, or exhaust).
//! 3. Recompute the ready set from step statuses and dependency edges.
//! 4. No pending steps left: conclude the run.
//! 5. Pending but nothing ready: cascade-skip steps whose upstream
//!    failed or was skipped.
//! 6. Dispatch the first conflict-free group via `JoinSet`, each attempt
//!    bounded by its step timeout and the global concurrency cap.
//! 7. Apply the joined outcomes to the snapshot and loop.
//!
//! Every transition is persisted before the loop moves on, so a crashed
//! process resumes from the last applied transition.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use serde_json::Value;
use tokio::sync::{Notify, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use drover_types::error::StateError;
use drover_types::event::KernelEvent;
use drover_types::run::{
    ArtifactKind, ArtifactRecord, ExecutionMode, RunEvent, RunEventKind, RunState, RunStatus,
    StepStatus,
};
use drover_types::workflow::{StepDefinition, WorkflowDefinition};

use crate::config::EngineConfig;
use crate::event::bus::EventBus;
use crate::executor::{
    CompletionRouter, ExecutorRegistry, StepDisposition, StepOutcome, StepRequest, marker,
};
use crate::repository::{StateRepository, markers_dir};

use super::context::{RunContext, sanitize_payload};
use super::dag;
use super::definition::{DefinitionError, validate_definition};
use super::gate::GateEvaluator;
use super::retry::{RetryDirective, RetryHandler};
use super::workspace::{RunWorkspace, WorkspaceManager};

// ---------------------------------------------------------------------------
// Constants
// ---------------------------------------------------------------------------

/// Skip reason recorded when an upstream step failed or was skipped.
pub const UPSTREAM_FAILURE_REASON: &str = "upstream failure";

/// Skip reason recorded on steps never reached because the run failed.
pub const RUN_ABORTED_REASON: &str = "run aborted";

/// Skip reason recorded when an operator skips a step.
pub const SKIPPED_BY_OPERATOR_REASON: &str = "skipped by operator";

// ---------------------------------------------------------------------------
// Internal drive types
// ---------------------------------------------------------------------------

/// Terminal outcome of a drive loop.
#[derive(Debug)]
enum DriveEnd {
    Completed,
    Failed(String),
    Cancelled,
}

/// Dependency graph and definition for one run, built once at drive start.
struct RunPlan<'a> {
    definition: &'a WorkflowDefinition,
    nodes: Vec<dag::DependencyNode>,
}

impl RunPlan<'_> {
    fn step(&self, id: &str) -> Option<&StepDefinition> {
        self.definition.steps.iter().find(|step| step.id == id)
    }
}

/// How one dispatched attempt ended.
#[derive(Debug)]
enum AttemptResult {
    /// The executor (or collaborator) reported an outcome.
    Outcome(StepOutcome),
    /// The executor errored before producing an outcome.
    Error(String),
    /// The attempt exceeded its step timeout.
    TimedOut(u64),
    /// Cancellation fired before the attempt was recorded; the step is
    /// still pending.
    CancelledBeforeStart,
    /// Cancellation fired while waiting on a deferred completion; the
    /// step goes back to pending for a later resume.
    CancelledWhileDeferred,
}

/// One joined dispatch task.
#[derive(Debug)]
struct StepCompletion {
    step_id: String,
    attempt: u32,
    elapsed_ms: u64,
    result: AttemptResult,
}

/// Bookkeeping for a gate-initiated rewind.
struct GateRewind<'a> {
    gated_step: &'a str,
    gate_name: &'a str,
    loopbacks_used: u32,
    max_retries: u32,
}

// ---------------------------------------------------------------------------
// WorkflowEngine
// ---------------------------------------------------------------------------

/// Schedules, retries, gates, and finalizes workflow runs.
///
/// Generic over `S: StateRepository` so the kernel can run against the
/// durable file store or an in-memory store in tests. Clones share all
/// internal structures; the engine is cheap to hand to spawned tasks.
pub struct WorkflowEngine<S: StateRepository> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    events: EventBus,
    config: Arc<EngineConfig>,
    workspaces: WorkspaceManager,
    router: CompletionRouter,
    /// Cancellation tokens for runs with an active driver, keyed by run id.
    cancel_tokens: Arc<DashMap<Uuid, CancellationToken>>,
    /// Per-run notifiers fired when a driver finalizes, for `wait`.
    done: Arc<DashMap<Uuid, Arc<Notify>>>,
    /// Nudges the completion monitor to sweep immediately.
    monitor_wake: Arc<Notify>,
    /// Global cap on concurrently executing step attempts.
    semaphore: Arc<Semaphore>,
}

impl<S: StateRepository> Clone for WorkflowEngine<S> {
    fn clone(&self) -> Self {
        Self {
            store: Arc::clone(&self.store),
            registry: Arc::clone(&self.registry),
            events: self.events.clone(),
            config: Arc::clone(&self.config),
            workspaces: self.workspaces.clone(),
            router: self.router.clone(),
            cancel_tokens: Arc::clone(&self.cancel_tokens),
            done: Arc::clone(&self.done),
            monitor_wake: Arc::clone(&self.monitor_wake),
            semaphore: Arc::clone(&self.semaphore),
        }
    }
}

impl<S: StateRepository + 'static> WorkflowEngine<S> {
    pub fn new(
        store: Arc<S>,
        registry: ExecutorRegistry,
        events: EventBus,
        config: EngineConfig,
    ) -> Self {
        let semaphore = Arc::new(Semaphore::new(config.max_parallel_steps.max(1)));
        let workspaces = WorkspaceManager::new(config.workspace_root.clone());
        Self {
            store,
            registry: Arc::new(registry),
            events,
            config: Arc::new(config),
            workspaces,
            router: CompletionRouter::new(),
            cancel_tokens: Arc::new(DashMap::new()),
            done: Arc::new(DashMap::new()),
            monitor_wake: Arc::new(Notify::new()),
            semaphore,
        }
    }

    pub fn event_bus(&self) -> &EventBus {
        &self.events
    }

    /// The router the completion monitor delivers result markers through.
    pub fn completion_router(&self) -> CompletionRouter {
        self.router.clone()
    }

    /// Notifier the completion monitor listens on for immediate sweeps.
    pub fn monitor_wake(&self) -> Arc<Notify> {
        Arc::clone(&self.monitor_wake)
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    // -- Control surface ----------------------------------------------------

    /// Validate a definition, persist a fresh run, and start driving it.
    ///
    /// Returns the run id immediately; the drive loop runs on a spawned
    /// task. In synchronous mode every capability must resolve against the
    /// registry; monitored-mode capabilities belong to out-of-process
    /// collaborators and are not checked.
    pub async fn start(
        &self,
        definition: WorkflowDefinition,
        inputs: Option<Value>,
        mode: ExecutionMode,
    ) -> Result<Uuid, EngineError> {
        let known = match mode {
            ExecutionMode::Synchronous => Some(self.registry.capabilities()),
            ExecutionMode::Monitored => None,
        };
        validate_definition(&definition, known.as_ref())?;

        let run_id = Uuid::now_v7();
        let inputs = inputs.map(|v| sanitize_payload(&v));
        let state = RunState::new(
            run_id,
            definition.name.clone(),
            definition.steps.iter().map(|step| step.id.clone()),
            mode,
            inputs,
        );
        self.store.create_run(&state).await?;
        self.store.save_definition(run_id, &definition).await?;
        self.store
            .append_event(run_id, &RunEvent::new(RunEventKind::RunStarted))
            .await?;
        self.events.publish(KernelEvent::RunStarted {
            run_id,
            workflow: definition.name.clone(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            mode = ?mode,
            steps = definition.steps.len(),
            "starting workflow run"
        );

        self.spawn_drive(run_id, definition);
        Ok(run_id)
    }

    /// Current snapshot of a run.
    pub async fn status(&self, run_id: Uuid) -> Result<RunState, EngineError> {
        Ok(self.store.load_run(run_id).await?)
    }

    /// Append-only history of a run.
    pub async fn history(&self, run_id: Uuid) -> Result<Vec<RunEvent>, EngineError> {
        Ok(self.store.load_history(run_id).await?)
    }

    /// Nudge an active run: the completion monitor sweeps immediately
    /// instead of waiting for its next poll tick.
    pub async fn advance(&self, run_id: Uuid) -> Result<(), EngineError> {
        let state = self.store.load_run(run_id).await?;
        if state.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                run_id,
                status: state.status,
            });
        }
        self.monitor_wake.notify_waiters();
        tracing::debug!(run_id = %run_id, "advance requested");
        Ok(())
    }

    /// Operator-initiated skip of a pending step.
    ///
    /// Only pending steps can be skipped; running or terminal steps
    /// conflict. Steps downstream of the skipped one are cascade-skipped
    /// by the scheduler once nothing else is runnable.
    pub async fn skip(&self, run_id: Uuid, step_id: &str) -> Result<(), EngineError> {
        let id = step_id.to_string();
        self.store
            .mutate_run(run_id, move |state| match state.step_mut(&id) {
                None => Err(EngineError::UnknownStep(id.clone())),
                Some(record) if record.status == StepStatus::Pending => {
                    record.status = StepStatus::Skipped;
                    record.error = Some(SKIPPED_BY_OPERATOR_REASON.to_string());
                    record.completed_at = Some(Utc::now());
                    Ok(())
                }
                Some(record) => Err(EngineError::SkipConflict {
                    step_id: id.clone(),
                    status: record.status,
                }),
            })
            .await??;
        self.store
            .append_event(
                run_id,
                &RunEvent::new(RunEventKind::StepSkipped)
                    .with_step(step_id)
                    .with_detail(SKIPPED_BY_OPERATOR_REASON),
            )
            .await?;
        self.events.publish(KernelEvent::StepSkipped {
            run_id,
            step_id: step_id.to_string(),
            reason: SKIPPED_BY_OPERATOR_REASON.to_string(),
        });
        tracing::info!(run_id = %run_id, step_id, "step skipped by operator");
        Ok(())
    }

    /// Resume an interrupted or failed run from its last durable snapshot.
    ///
    /// Interrupted (running), failed, and scheduler-skipped steps are reset
    /// to pending with their attempt counts preserved; completed steps and
    /// operator skips are kept. A reset failed step always gets one fresh
    /// attempt; its retry budget applies again only to further failures.
    pub async fn resume(&self, run_id: Uuid) -> Result<(), EngineError> {
        if self.cancel_tokens.contains_key(&run_id) {
            return Err(EngineError::AlreadyActive(run_id));
        }
        let state = self.store.load_last_state(run_id).await?;
        if matches!(state.status, RunStatus::Completed | RunStatus::Cancelled) {
            return Err(EngineError::AlreadyTerminal {
                run_id,
                status: state.status,
            });
        }
        let definition = self.store.load_definition(run_id).await?;

        let reset = self
            .store
            .mutate_run(run_id, |state| {
                let mut reset = 0usize;
                for record in state.steps.values_mut() {
                    let engine_skipped = record.status == StepStatus::Skipped
                        && matches!(
                            record.error.as_deref(),
                            Some(UPSTREAM_FAILURE_REASON | RUN_ABORTED_REASON)
                        );
                    if record.status == StepStatus::Running
                        || record.status == StepStatus::Failed
                        || engine_skipped
                    {
                        record.status = StepStatus::Pending;
                        record.started_at = None;
                        record.completed_at = None;
                        record.error = None;
                        record.metrics.clear();
                        reset += 1;
                    }
                }
                state.status = RunStatus::Running;
                state.completed_at = None;
                state.error = None;
                reset
            })
            .await?;

        self.store
            .append_event(
                run_id,
                &RunEvent::new(RunEventKind::RunResumed)
                    .with_detail(format!("reset {reset} step(s) to pending")),
            )
            .await?;
        self.events.publish(KernelEvent::RunResumed {
            run_id,
            workflow: definition.name.clone(),
        });
        tracing::info!(
            run_id = %run_id,
            workflow = definition.name.as_str(),
            reset,
            "resuming workflow run"
        );

        self.spawn_drive(run_id, definition);
        Ok(())
    }

    /// Request cancellation of a run.
    ///
    /// The run moves to `Cancelling`; in-flight attempts finish or time
    /// out, then the driver finalizes the run as `Cancelled`. A run with
    /// no active driver is finalized directly.
    pub async fn cancel(&self, run_id: Uuid) -> Result<(), EngineError> {
        let state = self.store.load_run(run_id).await?;
        if state.is_terminal() {
            return Err(EngineError::AlreadyTerminal {
                run_id,
                status: state.status,
            });
        }
        self.store
            .mutate_run(run_id, |state| {
                if !state.status.is_terminal() {
                    state.status = RunStatus::Cancelling;
                }
            })
            .await?;
        self.store
            .append_event(run_id, &RunEvent::new(RunEventKind::RunCancelling))
            .await?;
        tracing::info!(run_id = %run_id, "cancellation requested");

        let has_driver = match self.cancel_tokens.get(&run_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        };
        if !has_driver {
            // Nothing in flight; finalize on the caller's task. The guard
            // covers a driver that finalized between the load and here.
            let finalized = self
                .store
                .mutate_run(run_id, |state| {
                    if state.status.is_terminal() {
                        None
                    } else {
                        state.status = RunStatus::Cancelled;
                        state.completed_at = Some(Utc::now());
                        Some(state.workflow.clone())
                    }
                })
                .await?;
            if let Some(workflow) = finalized {
                self.store
                    .append_event(run_id, &RunEvent::new(RunEventKind::RunCancelled))
                    .await?;
                self.events
                    .publish(KernelEvent::RunCancelled { run_id, workflow });
                self.workspaces.acquire(run_id)?.release()?;
                tracing::info!(run_id = %run_id, "run cancelled without active driver");
            }
        }
        Ok(())
    }

    /// Block until the run reaches a terminal status and return its final
    /// snapshot.
    pub async fn wait(&self, run_id: Uuid) -> Result<RunState, EngineError> {
        loop {
            let state = self.store.load_run(run_id).await?;
            if state.is_terminal() {
                return Ok(state);
            }
            let notify = self
                .done
                .entry(run_id)
                .or_insert_with(|| Arc::new(Notify::new()))
                .clone();
            // Bounded wait so a missed notification degrades to polling.
            let _ = tokio::time::timeout(Duration::from_millis(200), notify.notified()).await;
        }
    }

    // -- Drive loop ---------------------------------------------------------

    fn spawn_drive(&self, run_id: Uuid, definition: WorkflowDefinition) {
        let engine = self.clone();
        let token = CancellationToken::new();
        self.cancel_tokens.insert(run_id, token.clone());

        tokio::spawn(async move {
            if let Err(error) = engine.drive(run_id, &definition, token).await {
                tracing::error!(run_id = %run_id, error = %error, "run driver stopped with error");
            }
            engine.cancel_tokens.remove(&run_id);
            if let Some(done) = engine.done.get(&run_id) {
                done.notify_waiters();
            }
            engine.done.remove(&run_id);
        });
    }

    async fn drive(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
        token: CancellationToken,
    ) -> Result<(), EngineError> {
        let state = self.store.load_run(run_id).await?;
        let mode = state.mode;
        let workspace = self.workspaces.acquire(run_id)?;
        let ctx = RunContext::new(
            run_id,
            definition.name.clone(),
            workspace.path().to_path_buf(),
            state.inputs.clone(),
        );
        let plan = RunPlan {
            definition,
            nodes: dag::step_nodes(&definition.steps)?,
        };

        self.store
            .mutate_run(run_id, |state| {
                if state.status == RunStatus::Pending {
                    state.status = RunStatus::Running;
                }
            })
            .await?;

        let run_start = Instant::now();
        let end = match definition.timeout_secs {
            Some(secs) => {
                let limit = Duration::from_secs(secs);
                match tokio::time::timeout(limit, self.drive_loop(&ctx, &plan, mode, &token)).await
                {
                    Ok(Ok(end)) => end,
                    Ok(Err(error)) => DriveEnd::Failed(format!("scheduler error: {error}")),
                    Err(_elapsed) => {
                        // In-flight tasks were dropped with the loop future;
                        // record their steps as failed.
                        self.store
                            .mutate_run(run_id, |state| {
                                for record in state.steps.values_mut() {
                                    if record.status == StepStatus::Running {
                                        record.status = StepStatus::Failed;
                                        record.error = Some("run timed out".to_string());
                                        record.completed_at = Some(Utc::now());
                                    }
                                }
                            })
                            .await?;
                        DriveEnd::Failed(format!("run timed out after {secs}s"))
                    }
                }
            }
            None => match self.drive_loop(&ctx, &plan, mode, &token).await {
                Ok(end) => end,
                Err(error) => DriveEnd::Failed(format!("scheduler error: {error}")),
            },
        };

        self.finalize(&ctx, end, workspace, run_start).await
    }

    async fn drive_loop(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        mode: ExecutionMode,
        token: &CancellationToken,
    ) -> Result<DriveEnd, EngineError> {
        loop {
            if token.is_cancelled() {
                return Ok(DriveEnd::Cancelled);
            }

            if let Some(end) = self.settle_gates(ctx, plan).await? {
                return Ok(end);
            }

            let state = self.store.load_run(ctx.run_id).await?;
            let pending: HashSet<&str> = state
                .steps
                .iter()
                .filter(|(_, record)| record.status == StepStatus::Pending)
                .map(|(id, _)| id.as_str())
                .collect();
            let satisfied: HashSet<&str> = state
                .steps
                .iter()
                .filter(|(id, record)| {
                    record.status == StepStatus::Completed && gate_cleared(plan, &state, id)
                })
                .map(|(id, _)| id.as_str())
                .collect();

            if pending.is_empty() {
                return Ok(conclude(&state));
            }

            let ready = dag::ready_nodes(&plan.nodes, &pending, &satisfied);
            if ready.is_empty() {
                let skipped = self.skip_unreachable(ctx, plan, &state).await?;
                if skipped == 0 {
                    let mut blocked: Vec<&str> = pending.into_iter().collect();
                    blocked.sort_unstable();
                    tracing::error!(
                        run_id = %ctx.run_id,
                        blocked = ?blocked,
                        "no runnable steps and nothing to skip"
                    );
                    return Ok(DriveEnd::Failed(format!(
                        "dependency deadlock: steps {blocked:?} are blocked with no failed upstream"
                    )));
                }
                continue;
            }

            let ready_defs: Vec<&StepDefinition> = ready
                .iter()
                .filter_map(|node| plan.step(&node.id))
                .collect();
            let groups = dag::partition_dispatch(&ready_defs);
            let Some(group) = groups.into_iter().next() else {
                continue;
            };

            if let Some(end) = self.dispatch_group(ctx, plan, mode, token, group).await? {
                return Ok(end);
            }
        }
    }

    /// Evaluate every owed gate until none is left or the run fails.
    ///
    /// Covers completions applied by this loop and completions reconciled
    /// out-of-band by the monitor. A rewind invalidates the snapshot, so
    /// the scan restarts after each action.
    async fn settle_gates(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
    ) -> Result<Option<DriveEnd>, EngineError> {
        loop {
            let state = self.store.load_run(ctx.run_id).await?;
            let mut acted = false;

            for step in &plan.definition.steps {
                let Some(gate) = &step.gate else { continue };
                let Some(record) = state.step(&step.id) else {
                    continue;
                };
                if record.status != StepStatus::Completed
                    || state.gates_satisfied.contains(&step.id)
                {
                    continue;
                }

                let decision = GateEvaluator::evaluate(gate, &record.metrics);
                let gate_name = gate.display_name(&step.id);

                if decision.passed() {
                    let id = step.id.clone();
                    self.store
                        .mutate_run(ctx.run_id, move |state| {
                            state.gates_satisfied.insert(id);
                        })
                        .await?;
                    self.store
                        .append_event(
                            ctx.run_id,
                            &RunEvent::new(RunEventKind::GatePassed)
                                .with_step(&step.id)
                                .with_detail(decision.summary()),
                        )
                        .await?;
                    self.events.publish(KernelEvent::GatePassed {
                        run_id: ctx.run_id,
                        step_id: step.id.clone(),
                        gate: gate_name.clone(),
                        score: decision.score(),
                    });
                    tracing::info!(
                        run_id = %ctx.run_id,
                        gate = gate_name.as_str(),
                        score = decision.score(),
                        "gate passed"
                    );
                    acted = true;
                    break;
                }

                let used = state.gate_loopbacks.get(&step.id).copied().unwrap_or(0);
                if used < gate.max_retries {
                    self.rewind(
                        ctx,
                        plan,
                        &gate.loopback_to,
                        Some(GateRewind {
                            gated_step: &step.id,
                            gate_name: &gate_name,
                            loopbacks_used: used,
                            max_retries: gate.max_retries,
                        }),
                    )
                    .await?;
                    acted = true;
                    break;
                }

                let reason = decision.summary();
                self.store
                    .append_event(
                        ctx.run_id,
                        &RunEvent::new(RunEventKind::GateExhausted)
                            .with_step(&step.id)
                            .with_detail(&reason),
                    )
                    .await?;
                self.events.publish(KernelEvent::GateExhausted {
                    run_id: ctx.run_id,
                    gate: gate_name.clone(),
                    reason: reason.clone(),
                });
                tracing::warn!(
                    run_id = %ctx.run_id,
                    gate = gate_name.as_str(),
                    loopbacks_used = used,
                    "gate exhausted"
                );
                return Ok(Some(DriveEnd::Failed(format!(
                    "gate '{gate_name}' exhausted its {} loopback(s): {reason}",
                    gate.max_retries
                ))));
            }

            if !acted {
                return Ok(None);
            }
        }
    }

    /// Reset `target` and everything downstream of it to pending.
    ///
    /// Attempt counts are preserved; statuses, timestamps, metrics,
    /// artifacts, and gate satisfaction of the reset span are cleared.
    async fn rewind(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        target: &str,
        gate: Option<GateRewind<'_>>,
    ) -> Result<(), EngineError> {
        let mut reset: HashSet<String> = dag::dependents_of(&plan.nodes, target);
        reset.insert(target.to_string());

        let reset_span = reset.clone();
        let gated = gate.as_ref().map(|g| g.gated_step.to_string());
        self.store
            .mutate_run(ctx.run_id, move |state| {
                for id in &reset_span {
                    if let Some(record) = state.step_mut(id) {
                        record.status = StepStatus::Pending;
                        record.started_at = None;
                        record.completed_at = None;
                        record.error = None;
                        record.metrics.clear();
                    }
                    state.gates_satisfied.remove(id);
                }
                state
                    .artifacts
                    .retain(|_, artifact| !reset_span.contains(&artifact.produced_by));
                if let Some(gated) = &gated {
                    *state.gate_loopbacks.entry(gated.clone()).or_insert(0) += 1;
                }
            })
            .await?;

        match gate {
            Some(gate) => {
                let used = gate.loopbacks_used + 1;
                self.store
                    .append_event(
                        ctx.run_id,
                        &RunEvent::new(RunEventKind::GateLoopback)
                            .with_step(gate.gated_step)
                            .with_detail(format!(
                                "rewound to '{target}' (loopback {used} of {})",
                                gate.max_retries
                            )),
                    )
                    .await?;
                self.events.publish(KernelEvent::GateLoopback {
                    run_id: ctx.run_id,
                    gate: gate.gate_name.to_string(),
                    target: target.to_string(),
                    loopbacks_used: used,
                });
                tracing::info!(
                    run_id = %ctx.run_id,
                    gate = gate.gate_name,
                    target,
                    loopbacks_used = used,
                    steps_reset = reset.len(),
                    "gate loopback rewind"
                );
            }
            None => {
                tracing::info!(
                    run_id = %ctx.run_id,
                    target,
                    steps_reset = reset.len(),
                    "retry loopback rewind"
                );
            }
        }
        Ok(())
    }

    /// Skip pending steps with a failed or skipped direct dependency.
    ///
    /// Runs only when nothing is ready, and one pass at a time: each pass
    /// skips direct dependents, and the loop re-enters until the cascade
    /// settles.
    async fn skip_unreachable(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        state: &RunState,
    ) -> Result<usize, EngineError> {
        let mut unreachable: Vec<String> = Vec::new();
        for node in &plan.nodes {
            let Some(record) = state.step(&node.id) else {
                continue;
            };
            if record.status != StepStatus::Pending {
                continue;
            }
            let blocked = node.deps.iter().any(|dep| {
                matches!(
                    state.step(dep).map(|r| r.status),
                    Some(StepStatus::Failed | StepStatus::Skipped)
                )
            });
            if blocked {
                unreachable.push(node.id.clone());
            }
        }

        for step_id in &unreachable {
            let id = step_id.clone();
            self.store
                .mutate_run(ctx.run_id, move |state| {
                    if let Some(record) = state.step_mut(&id)
                        && record.status == StepStatus::Pending
                    {
                        record.status = StepStatus::Skipped;
                        record.error = Some(UPSTREAM_FAILURE_REASON.to_string());
                        record.completed_at = Some(Utc::now());
                    }
                })
                .await?;
            self.store
                .append_event(
                    ctx.run_id,
                    &RunEvent::new(RunEventKind::StepSkipped)
                        .with_step(step_id)
                        .with_detail(UPSTREAM_FAILURE_REASON),
                )
                .await?;
            self.events.publish(KernelEvent::StepSkipped {
                run_id: ctx.run_id,
                step_id: step_id.clone(),
                reason: UPSTREAM_FAILURE_REASON.to_string(),
            });
            tracing::info!(
                run_id = %ctx.run_id,
                step_id = step_id.as_str(),
                "step skipped, upstream failed"
            );
        }
        Ok(unreachable.len())
    }

    // -- Dispatch -----------------------------------------------------------

    /// Spawn one conflict-free group, join every attempt, and apply the
    /// results in join order.
    async fn dispatch_group(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        mode: ExecutionMode,
        token: &CancellationToken,
        group: Vec<&StepDefinition>,
    ) -> Result<Option<DriveEnd>, EngineError> {
        let state = self.store.load_run(ctx.run_id).await?;

        // Resolve every request before spawning anything, so a resolution
        // fault aborts the run without leaving half a group in flight.
        let mut prepared: Vec<(StepDefinition, StepRequest)> = Vec::new();
        for step in &group {
            match build_request(ctx, &state, step) {
                Ok(request) => prepared.push(((*step).clone(), request)),
                Err(detail) => {
                    tracing::error!(
                        run_id = %ctx.run_id,
                        step_id = step.id.as_str(),
                        detail = detail.as_str(),
                        "dependency resolution fault"
                    );
                    return Ok(Some(DriveEnd::Failed(format!(
                        "internal dependency fault at step '{}': {detail}",
                        step.id
                    ))));
                }
            }
        }

        let mut join_set: JoinSet<StepCompletion> = JoinSet::new();
        for (step, mut request) in prepared {
            let engine = self.clone();
            let token = token.clone();
            let step_timeout = Duration::from_secs(
                step.timeout_secs
                    .unwrap_or(self.config.default_step_timeout_secs),
            );

            join_set.spawn(async move {
                let step_id = step.id.clone();
                let _permit = match engine.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => {
                        return StepCompletion {
                            step_id,
                            attempt: 0,
                            elapsed_ms: 0,
                            result: AttemptResult::Error("scheduler shutting down".to_string()),
                        };
                    }
                };
                if token.is_cancelled() {
                    return StepCompletion {
                        step_id,
                        attempt: 0,
                        elapsed_ms: 0,
                        result: AttemptResult::CancelledBeforeStart,
                    };
                }

                let attempt = match engine
                    .begin_attempt(request.run_id, &step_id, &step.capability)
                    .await
                {
                    Ok(attempt) => attempt,
                    Err(error) => {
                        return StepCompletion {
                            step_id,
                            attempt: 0,
                            elapsed_ms: 0,
                            result: AttemptResult::Error(format!("state error: {error}")),
                        };
                    }
                };
                request.attempt = attempt;

                let started = Instant::now();
                let result = match mode {
                    ExecutionMode::Synchronous => {
                        engine.run_sync_attempt(&request, step_timeout, &token).await
                    }
                    ExecutionMode::Monitored => {
                        engine.await_deferred(&request, step_timeout, &token).await
                    }
                };
                StepCompletion {
                    step_id,
                    attempt,
                    elapsed_ms: started.elapsed().as_millis() as u64,
                    result,
                }
            });
        }

        let mut completions: Vec<StepCompletion> = Vec::new();
        let mut end: Option<DriveEnd> = None;
        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok(completion) => completions.push(completion),
                Err(join_error) => {
                    tracing::error!(
                        run_id = %ctx.run_id,
                        error = %join_error,
                        "step task aborted"
                    );
                    if end.is_none() {
                        end = Some(DriveEnd::Failed(format!("step task aborted: {join_error}")));
                    }
                }
            }
        }

        // Apply after the whole group has joined, so a rewind never resets
        // a step whose task is still running.
        for completion in completions {
            if let Some(new_end) = self.apply_completion(ctx, plan, completion).await?
                && end.is_none()
            {
                end = Some(new_end);
            }
        }
        Ok(end)
    }

    /// Record the attempt start and publish the step-started event.
    async fn begin_attempt(
        &self,
        run_id: Uuid,
        step_id: &str,
        capability: &str,
    ) -> Result<u32, StateError> {
        let id = step_id.to_string();
        let attempt = self
            .store
            .mutate_run(run_id, move |state| match state.step_mut(&id) {
                Some(record) => {
                    record.status = StepStatus::Running;
                    record.attempts += 1;
                    record.started_at = Some(Utc::now());
                    record.error = None;
                    Ok(record.attempts)
                }
                None => Err(StateError::Conflict(format!(
                    "step '{id}' missing from run state"
                ))),
            })
            .await??;
        self.store
            .append_event(
                run_id,
                &RunEvent::new(RunEventKind::StepStarted)
                    .with_step(step_id)
                    .with_detail(format!("attempt {attempt}")),
            )
            .await?;
        self.events.publish(KernelEvent::StepStarted {
            run_id,
            step_id: step_id.to_string(),
            capability: capability.to_string(),
            attempt,
        });
        tracing::info!(run_id = %run_id, step_id, attempt, "step attempt started");
        Ok(attempt)
    }

    /// Run one attempt through the in-process registry.
    async fn run_sync_attempt(
        &self,
        request: &StepRequest,
        step_timeout: Duration,
        token: &CancellationToken,
    ) -> AttemptResult {
        let Some(executor) = self.registry.get(&request.capability) else {
            return AttemptResult::Error(format!(
                "no executor registered for capability '{}'",
                request.capability
            ));
        };
        match tokio::time::timeout(step_timeout, executor.run(request.clone())).await {
            Ok(Ok(StepDisposition::Finished(outcome))) => AttemptResult::Outcome(outcome),
            // An executor may hand its work to a collaborator mid-attempt;
            // the deferral gets a fresh timeout budget.
            Ok(Ok(StepDisposition::Deferred)) => {
                self.await_deferred(request, step_timeout, token).await
            }
            Ok(Err(error)) => AttemptResult::Error(error.to_string()),
            Err(_elapsed) => AttemptResult::TimedOut(step_timeout.as_secs()),
        }
    }

    /// Hand an attempt to an out-of-process collaborator and wait for the
    /// completion monitor to deliver its result marker.
    async fn await_deferred(
        &self,
        request: &StepRequest,
        step_timeout: Duration,
        token: &CancellationToken,
    ) -> AttemptResult {
        let key = (request.run_id, request.step_id.clone(), request.attempt);
        let rx = self.router.register(key.clone());

        let markers = markers_dir(&self.config.state_root, request.run_id);
        if let Err(error) = marker::write_request_marker(&markers, request).await {
            self.router.deregister(&key);
            return AttemptResult::Error(format!("failed to write request marker: {error}"));
        }
        tracing::info!(
            run_id = %request.run_id,
            step_id = request.step_id.as_str(),
            attempt = request.attempt,
            "request marker written, awaiting collaborator"
        );

        tokio::select! {
            outcome = rx => match outcome {
                Ok(outcome) => AttemptResult::Outcome(outcome),
                Err(_) => AttemptResult::Error("completion channel closed".to_string()),
            },
            _ = tokio::time::sleep(step_timeout) => {
                self.router.deregister(&key);
                AttemptResult::TimedOut(step_timeout.as_secs())
            }
            _ = token.cancelled() => {
                self.router.deregister(&key);
                AttemptResult::CancelledWhileDeferred
            }
        }
    }

    // -- Outcome application ------------------------------------------------

    async fn apply_completion(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        completion: StepCompletion,
    ) -> Result<Option<DriveEnd>, EngineError> {
        let StepCompletion {
            step_id,
            attempt,
            elapsed_ms,
            result,
        } = completion;
        let Some(step) = plan.step(&step_id) else {
            return Ok(Some(DriveEnd::Failed(format!(
                "unknown step '{step_id}' produced a completion"
            ))));
        };

        match result {
            AttemptResult::CancelledBeforeStart => Ok(None),
            AttemptResult::CancelledWhileDeferred => {
                let id = step_id.clone();
                self.store
                    .mutate_run(ctx.run_id, move |state| {
                        if let Some(record) = state.step_mut(&id) {
                            record.status = StepStatus::Pending;
                            record.started_at = None;
                        }
                    })
                    .await?;
                Ok(None)
            }
            AttemptResult::Outcome(outcome) => {
                if outcome.is_success() {
                    self.apply_success(ctx, plan, step, attempt, elapsed_ms, outcome)
                        .await
                } else {
                    let detail = outcome
                        .detail
                        .unwrap_or_else(|| "step reported failure".to_string());
                    self.apply_failure(ctx, plan, step, attempt, detail, false)
                        .await
                }
            }
            AttemptResult::Error(message) => {
                if attempt == 0 {
                    // The attempt was never recorded; this is a scheduler
                    // fault, not a step failure.
                    return Ok(Some(DriveEnd::Failed(format!(
                        "step '{step_id}' could not be dispatched: {message}"
                    ))));
                }
                self.apply_failure(ctx, plan, step, attempt, message, false)
                    .await
            }
            AttemptResult::TimedOut(secs) => {
                self.apply_failure(ctx, plan, step, attempt, format!("timed out after {secs}s"), true)
                    .await
            }
        }
    }

    /// Register artifacts, record metrics, and mark the step completed in
    /// one snapshot write. Gate evaluation happens on the next loop pass.
    async fn apply_success(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        step: &StepDefinition,
        attempt: u32,
        elapsed_ms: u64,
        outcome: StepOutcome,
    ) -> Result<Option<DriveEnd>, EngineError> {
        let run_id = ctx.run_id;

        let missing: Vec<String> = step
            .creates
            .iter()
            .filter(|name| !outcome.artifacts.iter().any(|a| &a.name == *name))
            .cloned()
            .collect();
        if !missing.is_empty() {
            let detail = format!(
                "attempt succeeded without producing declared artifact(s): {}",
                missing.join(", ")
            );
            return self
                .apply_failure(ctx, plan, step, attempt, detail, false)
                .await;
        }

        let step_id = step.id.clone();
        let declared: HashSet<String> = step.creates.iter().cloned().collect();
        let drafts = outcome.artifacts;
        let metrics = outcome.metrics;
        let artifact_count = drafts.len();
        let recorded_at = Utc::now();

        let clashed = self
            .store
            .mutate_run(run_id, move |state| {
                let mut clashed: Vec<String> = Vec::new();
                for draft in drafts {
                    // An undeclared extra must not stomp another step's output.
                    if !declared.contains(&draft.name)
                        && let Some(existing) = state.artifacts.get(&draft.name)
                        && existing.produced_by != step_id
                    {
                        clashed.push(draft.name);
                        continue;
                    }
                    let kind = match draft.kind {
                        ArtifactKind::Value { value } => ArtifactKind::Value {
                            value: sanitize_payload(&value),
                        },
                        other => other,
                    };
                    state.artifacts.insert(
                        draft.name.clone(),
                        ArtifactRecord {
                            name: draft.name,
                            kind,
                            produced_by: step_id.clone(),
                            attempt,
                            recorded_at,
                        },
                    );
                }
                if let Some(record) = state.step_mut(&step_id) {
                    record.status = StepStatus::Completed;
                    record.completed_at = Some(recorded_at);
                    record.metrics = metrics;
                    record.error = None;
                }
                clashed
            })
            .await?;
        for name in clashed {
            tracing::warn!(
                run_id = %run_id,
                artifact = name.as_str(),
                step_id = step.id.as_str(),
                "ignoring undeclared artifact clashing with another step's output"
            );
        }

        self.store
            .append_event(
                run_id,
                &RunEvent::new(RunEventKind::StepCompleted)
                    .with_step(&step.id)
                    .with_detail(format!("attempt {attempt}")),
            )
            .await?;
        self.events.publish(KernelEvent::StepCompleted {
            run_id,
            step_id: step.id.clone(),
            attempt,
            duration_ms: elapsed_ms,
        });
        tracing::info!(
            run_id = %run_id,
            step_id = step.id.as_str(),
            attempt,
            artifacts = artifact_count,
            "step completed"
        );
        Ok(None)
    }

    /// Record a failed attempt and act on the retry directive.
    async fn apply_failure(
        &self,
        ctx: &RunContext,
        plan: &RunPlan<'_>,
        step: &StepDefinition,
        attempt: u32,
        error: String,
        timed_out: bool,
    ) -> Result<Option<DriveEnd>, EngineError> {
        let run_id = ctx.run_id;
        let directive = RetryHandler::on_failure(step.retry.as_ref(), attempt);
        let will_retry = directive != RetryDirective::GiveUp;

        let step_id = step.id.clone();
        let recorded_error = error.clone();
        let requeue = directive == RetryDirective::Requeue;
        self.store
            .mutate_run(run_id, move |state| {
                if let Some(record) = state.step_mut(&step_id) {
                    record.error = Some(recorded_error);
                    record.metrics.clear();
                    if requeue {
                        record.status = StepStatus::Pending;
                    } else {
                        record.status = StepStatus::Failed;
                        record.completed_at = Some(Utc::now());
                    }
                }
            })
            .await?;

        let kind = if timed_out {
            RunEventKind::StepTimedOut
        } else {
            RunEventKind::StepFailed
        };
        self.store
            .append_event(
                run_id,
                &RunEvent::new(kind).with_step(&step.id).with_detail(&error),
            )
            .await?;
        self.events.publish(KernelEvent::StepFailed {
            run_id,
            step_id: step.id.clone(),
            attempt,
            error: error.clone(),
            will_retry,
        });
        tracing::warn!(
            run_id = %run_id,
            step_id = step.id.as_str(),
            attempt,
            will_retry,
            error = error.as_str(),
            "step attempt failed"
        );

        match directive {
            RetryDirective::Requeue => Ok(None),
            RetryDirective::Loopback { target } => {
                self.rewind(ctx, plan, &target, None).await?;
                Ok(None)
            }
            RetryDirective::GiveUp => Ok(Some(DriveEnd::Failed(format!(
                "step '{}' failed after {attempt} attempt(s): {error}",
                step.id
            )))),
        }
    }

    // -- Finalization -------------------------------------------------------

    async fn finalize(
        &self,
        ctx: &RunContext,
        end: DriveEnd,
        workspace: RunWorkspace,
        run_start: Instant,
    ) -> Result<(), EngineError> {
        let run_id = ctx.run_id;
        let (status, error) = match &end {
            DriveEnd::Completed => (RunStatus::Completed, None),
            DriveEnd::Failed(reason) => (RunStatus::Failed, Some(reason.clone())),
            DriveEnd::Cancelled => (RunStatus::Cancelled, None),
        };

        let mut aborted: Vec<String> = Vec::new();
        let state = self
            .store
            .mutate_run(run_id, |state| {
                if status == RunStatus::Failed {
                    for (id, record) in state.steps.iter_mut() {
                        if record.status == StepStatus::Pending {
                            record.status = StepStatus::Skipped;
                            record.error = Some(RUN_ABORTED_REASON.to_string());
                            record.completed_at = Some(Utc::now());
                            aborted.push(id.clone());
                        }
                    }
                }
                state.status = status;
                state.completed_at = Some(Utc::now());
                state.error = error.clone();
                state.clone()
            })
            .await?;

        for step_id in &aborted {
            self.store
                .append_event(
                    run_id,
                    &RunEvent::new(RunEventKind::StepSkipped)
                        .with_step(step_id)
                        .with_detail(RUN_ABORTED_REASON),
                )
                .await?;
            self.events.publish(KernelEvent::StepSkipped {
                run_id,
                step_id: step_id.clone(),
                reason: RUN_ABORTED_REASON.to_string(),
            });
        }

        let (kind, event) = match &end {
            DriveEnd::Completed => (
                RunEventKind::RunCompleted,
                KernelEvent::RunCompleted {
                    run_id,
                    workflow: ctx.workflow.clone(),
                    duration_ms: run_start.elapsed().as_millis() as u64,
                    steps_completed: state.completed_step_ids().len(),
                },
            ),
            DriveEnd::Failed(reason) => (
                RunEventKind::RunFailed,
                KernelEvent::RunFailed {
                    run_id,
                    workflow: ctx.workflow.clone(),
                    error: reason.clone(),
                },
            ),
            DriveEnd::Cancelled => (
                RunEventKind::RunCancelled,
                KernelEvent::RunCancelled {
                    run_id,
                    workflow: ctx.workflow.clone(),
                },
            ),
        };
        let mut record = RunEvent::new(kind);
        if let DriveEnd::Failed(reason) = &end {
            record = record.with_detail(reason.clone());
        }
        self.store.append_event(run_id, &record).await?;
        self.events.publish(event);

        workspace.release()?;
        tracing::info!(run_id = %run_id, status = ?status, "run finalized");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Free helpers
// ---------------------------------------------------------------------------

/// A completed step counts as a satisfied dependency only once its gate
/// (if any) has passed.
fn gate_cleared(plan: &RunPlan<'_>, state: &RunState, step_id: &str) -> bool {
    match plan.step(step_id).and_then(|step| step.gate.as_ref()) {
        Some(_) => state.gates_satisfied.contains(step_id),
        None => true,
    }
}

/// Terminal status for a run with no pending steps left.
fn conclude(state: &RunState) -> DriveEnd {
    let mut failed: Vec<&str> = state
        .steps
        .iter()
        .filter(|(_, record)| record.status == StepStatus::Failed)
        .map(|(id, _)| id.as_str())
        .collect();
    if failed.is_empty() {
        DriveEnd::Completed
    } else {
        failed.sort_unstable();
        DriveEnd::Failed(format!("step(s) failed: {}", failed.join(", ")))
    }
}

/// Resolve a step's requirements against the artifact registry.
///
/// A requirement naming a registered artifact attaches that artifact; a
/// requirement naming a step attaches everything that step produced. By
/// the time a step is ready both forms must resolve, so a miss here is a
/// scheduler fault.
fn build_request(
    ctx: &RunContext,
    state: &RunState,
    step: &StepDefinition,
) -> Result<StepRequest, String> {
    let mut artifacts: BTreeMap<String, ArtifactRecord> = BTreeMap::new();
    for requirement in &step.requires {
        if let Some(record) = state.artifacts.get(requirement) {
            artifacts.insert(requirement.clone(), record.clone());
            continue;
        }
        if state.steps.contains_key(requirement) {
            for (name, record) in &state.artifacts {
                if record.produced_by == *requirement {
                    artifacts.insert(name.clone(), record.clone());
                }
            }
            continue;
        }
        return Err(format!(
            "requirement '{requirement}' resolves to neither an artifact nor a step"
        ));
    }
    Ok(StepRequest {
        run_id: ctx.run_id,
        step_id: step.id.clone(),
        capability: step.capability.clone(),
        attempt: 0,
        creates: step.creates.clone(),
        artifacts,
        run_inputs: ctx.inputs.clone(),
        params: step.params.as_ref().map(sanitize_payload),
        workdir: ctx.workdir.clone(),
    })
}

// ---------------------------------------------------------------------------
// EngineError
// ---------------------------------------------------------------------------

/// Errors surfaced by the engine's control operations.
#[derive(Debug, thiserror::Error)]
pub enum EngineError {
    /// Definition failed validation (parse, graph, capability).
    #[error("definition error: {0}")]
    Definition(#[from] DefinitionError),

    /// State store error.
    #[error("state error: {0}")]
    State(#[from] StateError),

    /// The run already reached a terminal status.
    #[error("run {run_id} is already terminal ({status:?})")]
    AlreadyTerminal { run_id: Uuid, status: RunStatus },

    /// The run already has an active driver.
    #[error("run {0} already has an active driver")]
    AlreadyActive(Uuid),

    /// The step id does not exist in the run.
    #[error("unknown step '{0}'")]
    UnknownStep(String),

    /// The step is not in a skippable status.
    #[error("step '{step_id}' cannot be skipped while {status:?}")]
    SkipConflict { step_id: String, status: StepStatus },

    /// Workspace directory error.
    #[error("workspace error: {0}")]
    Workspace(#[from] std::io::Error),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    use futures_util::future::BoxFuture;

    use crate::executor::{StepError, StepExecutor};
    use crate::repository::state::memory::MemoryStateRepository;
    use crate::workflow::definition::parse_workflow_yaml;

    type Script = dyn Fn(&StepRequest) -> Result<StepDisposition, StepError> + Send + Sync;

    struct ScriptedExecutor {
        capability: String,
        script: Box<Script>,
    }

    impl StepExecutor for ScriptedExecutor {
        fn capability(&self) -> &str {
            &self.capability
        }

        fn run(&self, request: StepRequest) -> BoxFuture<'_, Result<StepDisposition, StepError>> {
            let result = (self.script)(&request);
            Box::pin(async move { result })
        }
    }

    struct SleepyExecutor {
        capability: String,
        delay: Duration,
    }

    impl StepExecutor for SleepyExecutor {
        fn capability(&self) -> &str {
            &self.capability
        }

        fn run(&self, request: StepRequest) -> BoxFuture<'_, Result<StepDisposition, StepError>> {
            let delay = self.delay;
            Box::pin(async move {
                tokio::time::sleep(delay).await;
                Ok(StepDisposition::Finished(echo_outcome(&request)))
            })
        }
    }

    fn echo_outcome(request: &StepRequest) -> StepOutcome {
        let mut outcome = StepOutcome::success();
        for name in &request.creates {
            outcome = outcome.with_artifact(
                name.clone(),
                ArtifactKind::Document {
                    content: format!("{}:{}", request.step_id, request.attempt),
                },
            );
        }
        outcome
    }

    fn scripted(
        capability: &str,
        script: impl Fn(&StepRequest) -> Result<StepDisposition, StepError> + Send + Sync + 'static,
    ) -> Arc<dyn StepExecutor> {
        Arc::new(ScriptedExecutor {
            capability: capability.to_string(),
            script: Box::new(script),
        })
    }

    fn echo(capability: &str) -> Arc<dyn StepExecutor> {
        scripted(capability, |request| {
            Ok(StepDisposition::Finished(echo_outcome(request)))
        })
    }

    fn engine_with_store(
        store: Arc<MemoryStateRepository>,
        executors: Vec<Arc<dyn StepExecutor>>,
        dir: &tempfile::TempDir,
    ) -> WorkflowEngine<MemoryStateRepository> {
        let config = EngineConfig {
            state_root: dir.path().join("state"),
            workspace_root: dir.path().join("workspaces"),
            ..EngineConfig::default()
        };
        let mut registry = ExecutorRegistry::new();
        for executor in executors {
            registry.register(executor);
        }
        WorkflowEngine::new(store, registry, EventBus::default(), config)
    }

    fn test_engine(
        executors: Vec<Arc<dyn StepExecutor>>,
    ) -> (WorkflowEngine<MemoryStateRepository>, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let engine = engine_with_store(Arc::new(MemoryStateRepository::new()), executors, &dir);
        (engine, dir)
    }

    fn linear_definition() -> WorkflowDefinition {
        parse_workflow_yaml(
            r#"
name: notes-pipeline
steps:
  - id: fetch
    capability: fetcher
    creates: [raw-notes]
  - id: summarize
    capability: writer
    requires: [fetch]
    creates: [summary]
"#,
        )
        .unwrap()
    }

    fn gated_definition() -> WorkflowDefinition {
        parse_workflow_yaml(
            r#"
name: gated-chain
steps:
  - id: plan
    capability: planner
    creates: [plan-doc]
  - id: draft
    capability: drafter
    requires: [plan-doc]
    creates: [draft-doc]
  - id: review
    capability: reviewer
    requires: [draft-doc]
    creates: [review-report]
    gate:
      name: review-gate
      metrics:
        - name: quality
          threshold: 0.9
      loopback_to: draft
      max_retries: 2
  - id: publish
    capability: publisher
    requires: [review-report]
    creates: [published-notes]
"#,
        )
        .unwrap()
    }

    fn reviewer_passing_from(attempt: u32) -> Arc<dyn StepExecutor> {
        scripted("reviewer", move |request| {
            let quality = if request.attempt >= attempt { 0.95 } else { 0.4 };
            Ok(StepDisposition::Finished(
                echo_outcome(request).with_metric("quality", quality),
            ))
        })
    }

    #[tokio::test]
    async fn linear_run_completes_and_registers_artifacts() {
        let writer = scripted("writer", |request| {
            if !request.artifacts.contains_key("raw-notes") {
                return Ok(StepDisposition::Finished(StepOutcome::failure(
                    "upstream artifact not attached",
                )));
            }
            Ok(StepDisposition::Finished(echo_outcome(request)))
        });
        let (engine, _dir) = test_engine(vec![echo("fetcher"), writer]);

        let run_id = engine
            .start(linear_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step("fetch").unwrap().attempts, 1);
        assert_eq!(state.step("summarize").unwrap().attempts, 1);
        assert!(state.artifacts.contains_key("raw-notes"));
        assert!(state.artifacts.contains_key("summary"));
        assert_eq!(state.artifacts["summary"].produced_by, "summarize");

        let history = engine.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::RunStarted)
        );
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::RunCompleted)
        );
    }

    #[tokio::test]
    async fn diamond_fan_out_completes() {
        let definition = parse_workflow_yaml(
            r#"
name: diamond
steps:
  - id: seed
    capability: echo
    creates: [seed-doc]
  - id: left
    capability: echo
    requires: [seed-doc]
    creates: [left-doc]
  - id: right
    capability: echo
    requires: [seed-doc]
    creates: [right-doc]
  - id: merge
    capability: echo
    requires: [left-doc, right-doc]
    creates: [merged]
"#,
        )
        .unwrap();
        let (engine, _dir) = test_engine(vec![echo("echo")]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.artifacts.len(), 4);
        assert!(
            state
                .steps
                .values()
                .all(|record| record.status == StepStatus::Completed && record.attempts == 1)
        );
    }

    #[tokio::test]
    async fn gate_loopback_rewinds_and_eventually_passes() {
        let (engine, _dir) = test_engine(vec![
            echo("planner"),
            echo("drafter"),
            reviewer_passing_from(3),
            echo("publisher"),
        ]);

        let run_id = engine
            .start(gated_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        // The rewound span re-ran twice; upstream of the loopback target
        // is untouched.
        assert_eq!(state.step("plan").unwrap().attempts, 1);
        assert_eq!(state.step("draft").unwrap().attempts, 3);
        assert_eq!(state.step("review").unwrap().attempts, 3);
        assert_eq!(state.step("publish").unwrap().attempts, 1);
        assert_eq!(state.gate_loopbacks.get("review"), Some(&2));
        assert!(state.gates_satisfied.contains("review"));
        assert!(state.artifacts.contains_key("published-notes"));

        let history = engine.history(run_id).await.unwrap();
        let loopbacks = history
            .iter()
            .filter(|event| event.kind == RunEventKind::GateLoopback)
            .count();
        assert_eq!(loopbacks, 2);
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::GatePassed)
        );
    }

    #[tokio::test]
    async fn gate_exhaustion_fails_run_and_skips_downstream() {
        let (engine, _dir) = test_engine(vec![
            echo("planner"),
            echo("drafter"),
            reviewer_passing_from(u32::MAX),
            echo("publisher"),
        ]);

        let run_id = engine
            .start(gated_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("review-gate"));
        assert_eq!(state.step("draft").unwrap().attempts, 3);
        assert_eq!(state.step("review").unwrap().attempts, 3);
        assert_eq!(state.step("publish").unwrap().status, StepStatus::Skipped);
        assert_eq!(state.gate_loopbacks.get("review"), Some(&2));

        let history = engine.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::GateExhausted)
        );
    }

    #[tokio::test]
    async fn flaky_step_requeues_until_success() {
        let definition = parse_workflow_yaml(
            r#"
name: flaky-fetch
steps:
  - id: fetch
    capability: flaky
    creates: [raw-notes]
    retry:
      max_attempts: 3
"#,
        )
        .unwrap();
        let flaky = scripted("flaky", |request| {
            if request.attempt < 2 {
                return Ok(StepDisposition::Finished(StepOutcome::failure(
                    "transient upstream error",
                )));
            }
            Ok(StepDisposition::Finished(echo_outcome(request)))
        });
        let (engine, _dir) = test_engine(vec![flaky]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step("fetch").unwrap().attempts, 2);

        let history = engine.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::StepFailed)
        );
    }

    #[tokio::test]
    async fn retry_exhaustion_fails_run() {
        let definition = parse_workflow_yaml(
            r#"
name: doomed
steps:
  - id: fetch
    capability: broken
    creates: [raw-notes]
    retry:
      max_attempts: 2
  - id: summarize
    capability: broken
    requires: [raw-notes]
    creates: [summary]
"#,
        )
        .unwrap();
        let broken = scripted("broken", |_| {
            Ok(StepDisposition::Finished(StepOutcome::failure(
                "permanently unavailable",
            )))
        });
        let (engine, _dir) = test_engine(vec![broken]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.step("fetch").unwrap().attempts, 2);
        assert_eq!(state.step("fetch").unwrap().status, StepStatus::Failed);
        assert_eq!(state.step("summarize").unwrap().status, StepStatus::Skipped);
        assert!(state.error.as_deref().unwrap().contains("2 attempt"));
    }

    #[tokio::test]
    async fn step_timeout_counts_as_failure() {
        let definition = parse_workflow_yaml(
            r#"
name: slow
timeout_secs: 30
steps:
  - id: crawl
    capability: crawler
    creates: [crawl-dump]
    timeout_secs: 1
"#,
        )
        .unwrap();
        let (engine, _dir) = test_engine(vec![Arc::new(SleepyExecutor {
            capability: "crawler".to_string(),
            delay: Duration::from_millis(1400),
        })]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("timed out"));

        let history = engine.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::StepTimedOut)
        );
    }

    #[tokio::test]
    async fn success_without_declared_artifacts_is_failure() {
        let definition = parse_workflow_yaml(
            r#"
name: hollow
steps:
  - id: produce
    capability: hollow
    creates: [the-goods]
"#,
        )
        .unwrap();
        let hollow = scripted("hollow", |_| {
            Ok(StepDisposition::Finished(StepOutcome::success()))
        });
        let (engine, _dir) = test_engine(vec![hollow]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Failed);
        assert!(state.error.as_deref().unwrap().contains("declared artifact"));
        assert!(state.artifacts.is_empty());
    }

    #[tokio::test]
    async fn cancel_stops_before_next_step() {
        let definition = parse_workflow_yaml(
            r#"
name: cancellable
steps:
  - id: first
    capability: slow
    creates: [first-doc]
  - id: second
    capability: slow
    requires: [first-doc]
    creates: [second-doc]
"#,
        )
        .unwrap();
        let (engine, _dir) = test_engine(vec![Arc::new(SleepyExecutor {
            capability: "slow".to_string(),
            delay: Duration::from_millis(400),
        })]);

        let run_id = engine
            .start(definition, None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;
        engine.cancel(run_id).await.unwrap();

        let state = engine.wait(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Cancelled);
        // The in-flight step drained to completion; the next one never started.
        assert_eq!(state.step("first").unwrap().status, StepStatus::Completed);
        assert_eq!(state.step("second").unwrap().status, StepStatus::Pending);

        let history = engine.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::RunCancelling)
        );
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::RunCancelled)
        );

        let err = engine.cancel(run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn resume_reruns_only_unfinished_steps() {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStateRepository::new());

        let failing_writer = scripted("writer", |_| {
            Ok(StepDisposition::Finished(StepOutcome::failure(
                "disk full",
            )))
        });
        let engine = engine_with_store(
            Arc::clone(&store),
            vec![echo("fetcher"), failing_writer],
            &dir,
        );
        let run_id = engine
            .start(linear_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        let state = engine.wait(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Failed);
        assert_eq!(state.step("fetch").unwrap().attempts, 1);

        // Same store, healthy executors: only the failed step re-runs.
        let healed = engine_with_store(
            Arc::clone(&store),
            vec![echo("fetcher"), echo("writer")],
            &dir,
        );
        healed.resume(run_id).await.unwrap();
        let state = healed.wait(run_id).await.unwrap();

        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step("fetch").unwrap().attempts, 1);
        assert_eq!(state.step("summarize").unwrap().attempts, 2);
        assert!(state.artifacts.contains_key("summary"));

        let history = healed.history(run_id).await.unwrap();
        assert!(
            history
                .iter()
                .any(|event| event.kind == RunEventKind::RunResumed)
        );
    }

    #[tokio::test]
    async fn resume_of_completed_run_is_rejected() {
        let (engine, _dir) = test_engine(vec![echo("fetcher"), echo("writer")]);
        let run_id = engine
            .start(linear_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        engine.wait(run_id).await.unwrap();

        let err = engine.resume(run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn unknown_capability_rejected_at_start() {
        let (engine, _dir) = test_engine(vec![echo("fetcher")]);

        let err = engine
            .start(linear_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("writer"));
    }

    #[tokio::test]
    async fn monitored_run_round_trips_request_marker() {
        let definition = parse_workflow_yaml(
            r#"
name: handoff
steps:
  - id: solo
    capability: human-writer
    creates: [longform]
"#,
        )
        .unwrap();
        // No executor registered: monitored capabilities live out of process.
        let (engine, dir) = test_engine(Vec::new());

        let run_id = engine
            .start(definition, None, ExecutionMode::Monitored)
            .await
            .unwrap();

        let marker_path = markers_dir(&dir.path().join("state"), run_id)
            .join(marker::request_marker_name("solo", 1));
        let mut waited = 0u64;
        while !marker_path.exists() {
            assert!(waited < 2_000, "request marker never appeared");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 10;
        }
        let raw = tokio::fs::read(&marker_path).await.unwrap();
        let request: StepRequest = serde_json::from_slice(&raw).unwrap();
        assert_eq!(request.step_id, "solo");
        assert_eq!(request.attempt, 1);
        assert_eq!(request.capability, "human-writer");

        engine.advance(run_id).await.unwrap();

        let outcome = StepOutcome::success()
            .with_artifact(
                "longform",
                ArtifactKind::File {
                    path: "out/longform.md".to_string(),
                },
            )
            .with_metric("word_count", 1800.0);
        let delivered = engine
            .completion_router()
            .deliver(&(run_id, "solo".to_string(), 1), outcome);
        assert!(delivered);

        let state = engine.wait(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert!(state.artifacts.contains_key("longform"));
        assert_eq!(state.step("solo").unwrap().metrics["word_count"], 1800.0);

        let err = engine.advance(run_id).await.unwrap_err();
        assert!(matches!(err, EngineError::AlreadyTerminal { .. }));
    }

    #[tokio::test]
    async fn operator_skip_prunes_pending_step() {
        let definition = parse_workflow_yaml(
            r#"
name: optional-tail
steps:
  - id: gather
    capability: human-writer
    creates: [notes]
  - id: publish
    capability: human-publisher
    requires: [notes]
    creates: [posted]
"#,
        )
        .unwrap();
        let (engine, dir) = test_engine(Vec::new());

        let run_id = engine
            .start(definition, None, ExecutionMode::Monitored)
            .await
            .unwrap();

        let marker_path = markers_dir(&dir.path().join("state"), run_id)
            .join(marker::request_marker_name("gather", 1));
        let mut waited = 0u64;
        while !marker_path.exists() {
            assert!(waited < 2_000, "request marker never appeared");
            tokio::time::sleep(Duration::from_millis(10)).await;
            waited += 10;
        }

        // The running step cannot be skipped; the pending one can.
        let err = engine.skip(run_id, "gather").await.unwrap_err();
        assert!(matches!(err, EngineError::SkipConflict { .. }));
        let err = engine.skip(run_id, "nonexistent").await.unwrap_err();
        assert!(matches!(err, EngineError::UnknownStep(_)));
        engine.skip(run_id, "publish").await.unwrap();

        let outcome = StepOutcome::success().with_artifact(
            "notes",
            ArtifactKind::Document {
                content: "field notes".to_string(),
            },
        );
        assert!(
            engine
                .completion_router()
                .deliver(&(run_id, "gather".to_string(), 1), outcome)
        );

        let state = engine.wait(run_id).await.unwrap();
        assert_eq!(state.status, RunStatus::Completed);
        assert_eq!(state.step("publish").unwrap().status, StepStatus::Skipped);
        assert_eq!(
            state.step("publish").unwrap().error.as_deref(),
            Some(SKIPPED_BY_OPERATOR_REASON)
        );
    }

    #[tokio::test]
    async fn kernel_events_published_on_bus() {
        let (engine, _dir) = test_engine(vec![echo("fetcher"), echo("writer")]);
        let mut events = engine.event_bus().subscribe();

        let run_id = engine
            .start(linear_definition(), None, ExecutionMode::Synchronous)
            .await
            .unwrap();
        engine.wait(run_id).await.unwrap();

        let mut saw_step_started = false;
        let mut saw_step_completed = false;
        loop {
            let event = tokio::time::timeout(Duration::from_secs(2), events.recv())
                .await
                .expect("event stream stalled")
                .expect("event channel closed");
            match event {
                KernelEvent::StepStarted { .. } => saw_step_started = true,
                KernelEvent::StepCompleted { .. } => saw_step_completed = true,
                KernelEvent::RunCompleted { steps_completed, .. } => {
                    assert_eq!(steps_completed, 2);
                    break;
                }
                _ => {}
            }
        }
        assert!(saw_step_started);
        assert!(saw_step_completed);
    }
}
