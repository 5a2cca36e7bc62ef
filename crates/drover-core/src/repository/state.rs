//! State repository trait: the kernel's only persistence seam.
//!
//! Uses RPITIT (native async fn in traits, Rust 2024 edition). The
//! file-backed implementation lives in `drover-infra`; a trivial in-memory
//! implementation lives here behind `#[cfg(test)]` for engine tests.
//!
//! Write discipline: all mutations of a run snapshot go through
//! [`StateRepository::mutate_run`], which implementations must serialize
//! per run. That single-writer rule is what makes artifact registration
//! and status transitions atomic with respect to concurrent readers.

use drover_types::epic::SequenceState;
use drover_types::error::StateError;
use drover_types::run::{RunEvent, RunState};
use drover_types::workflow::WorkflowDefinition;
use uuid::Uuid;

/// Durable storage for run snapshots, event history, pinned definitions,
/// and epic sequence state.
pub trait StateRepository: Send + Sync {
    /// Persist a brand-new run snapshot. Fails with [`StateError::Conflict`]
    /// if the run already exists.
    fn create_run(
        &self,
        state: &RunState,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Persist a full snapshot, replacing the previous one atomically.
    fn save_run(
        &self,
        state: &RunState,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Load the current snapshot. Implementations may serve a warm
    /// in-process copy when they are the single writer.
    fn load_run(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<RunState, StateError>> + Send;

    /// Load the last durable snapshot, bypassing any warm copy. Resume
    /// paths use this to reconstruct state after a restart.
    fn load_last_state(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<RunState, StateError>> + Send;

    /// Apply `f` to the snapshot under the run's write lock and persist
    /// the result. Returns whatever `f` returns.
    fn mutate_run<F, T>(
        &self,
        run_id: Uuid,
        f: F,
    ) -> impl std::future::Future<Output = Result<T, StateError>> + Send
    where
        F: FnOnce(&mut RunState) -> T + Send,
        T: Send;

    /// Append one event to the run's history log.
    fn append_event(
        &self,
        run_id: Uuid,
        event: &RunEvent,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Read the run's full history, oldest first.
    fn load_history(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<Vec<RunEvent>, StateError>> + Send;

    /// Ids of all known runs, oldest first.
    fn list_runs(&self) -> impl std::future::Future<Output = Result<Vec<Uuid>, StateError>> + Send;

    /// Remove a run entirely: snapshot, history, pinned definition, and
    /// markers. Fails with [`StateError::RunNotFound`] if absent.
    fn delete_run(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Pin the workflow definition a run executes, so resume does not
    /// depend on the original document still being around.
    fn save_definition(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Load the pinned definition for a run.
    fn load_definition(
        &self,
        run_id: Uuid,
    ) -> impl std::future::Future<Output = Result<WorkflowDefinition, StateError>> + Send;

    /// Persist an epic sequence snapshot.
    fn save_sequence(
        &self,
        state: &SequenceState,
    ) -> impl std::future::Future<Output = Result<(), StateError>> + Send;

    /// Load an epic sequence snapshot.
    fn load_sequence(
        &self,
        sequence_id: Uuid,
    ) -> impl std::future::Future<Output = Result<SequenceState, StateError>> + Send;
}

// ---------------------------------------------------------------------------
// In-memory implementation for tests
// ---------------------------------------------------------------------------

#[cfg(test)]
pub(crate) mod memory {
    use std::collections::HashMap;

    use tokio::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct Inner {
        runs: HashMap<Uuid, RunState>,
        history: HashMap<Uuid, Vec<RunEvent>>,
        definitions: HashMap<Uuid, WorkflowDefinition>,
        sequences: HashMap<Uuid, SequenceState>,
    }

    /// Hash-map-backed repository for engine tests. One coarse lock keeps
    /// the single-writer discipline trivially true.
    #[derive(Default)]
    pub(crate) struct MemoryStateRepository {
        inner: Mutex<Inner>,
    }

    impl MemoryStateRepository {
        pub(crate) fn new() -> Self {
            Self::default()
        }
    }

    impl StateRepository for MemoryStateRepository {
        async fn create_run(&self, state: &RunState) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            if inner.runs.contains_key(&state.run_id) {
                return Err(StateError::Conflict(format!(
                    "run {} already exists",
                    state.run_id
                )));
            }
            inner.runs.insert(state.run_id, state.clone());
            Ok(())
        }

        async fn save_run(&self, state: &RunState) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            inner.runs.insert(state.run_id, state.clone());
            Ok(())
        }

        async fn load_run(&self, run_id: Uuid) -> Result<RunState, StateError> {
            let inner = self.inner.lock().await;
            inner
                .runs
                .get(&run_id)
                .cloned()
                .ok_or(StateError::RunNotFound(run_id))
        }

        async fn load_last_state(&self, run_id: Uuid) -> Result<RunState, StateError> {
            self.load_run(run_id).await
        }

        async fn mutate_run<F, T>(&self, run_id: Uuid, f: F) -> Result<T, StateError>
        where
            F: FnOnce(&mut RunState) -> T + Send,
            T: Send,
        {
            let mut inner = self.inner.lock().await;
            let state = inner
                .runs
                .get_mut(&run_id)
                .ok_or(StateError::RunNotFound(run_id))?;
            Ok(f(state))
        }

        async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            inner.history.entry(run_id).or_default().push(event.clone());
            Ok(())
        }

        async fn load_history(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StateError> {
            let inner = self.inner.lock().await;
            Ok(inner.history.get(&run_id).cloned().unwrap_or_default())
        }

        async fn list_runs(&self) -> Result<Vec<Uuid>, StateError> {
            let inner = self.inner.lock().await;
            let mut ids: Vec<Uuid> = inner.runs.keys().copied().collect();
            ids.sort();
            Ok(ids)
        }

        async fn delete_run(&self, run_id: Uuid) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            if inner.runs.remove(&run_id).is_none() {
                return Err(StateError::RunNotFound(run_id));
            }
            inner.history.remove(&run_id);
            inner.definitions.remove(&run_id);
            Ok(())
        }

        async fn save_definition(
            &self,
            run_id: Uuid,
            definition: &WorkflowDefinition,
        ) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            inner.definitions.insert(run_id, definition.clone());
            Ok(())
        }

        async fn load_definition(&self, run_id: Uuid) -> Result<WorkflowDefinition, StateError> {
            let inner = self.inner.lock().await;
            inner
                .definitions
                .get(&run_id)
                .cloned()
                .ok_or(StateError::RunNotFound(run_id))
        }

        async fn save_sequence(&self, state: &SequenceState) -> Result<(), StateError> {
            let mut inner = self.inner.lock().await;
            inner.sequences.insert(state.sequence_id, state.clone());
            Ok(())
        }

        async fn load_sequence(&self, sequence_id: Uuid) -> Result<SequenceState, StateError> {
            let inner = self.inner.lock().await;
            inner
                .sequences
                .get(&sequence_id)
                .cloned()
                .ok_or(StateError::SequenceNotFound(sequence_id))
        }
    }
}

#[cfg(test)]
mod tests {
    use drover_types::run::{ExecutionMode, RunEventKind, RunStatus, StepStatus};

    use super::memory::MemoryStateRepository;
    use super::*;

    fn sample_state() -> RunState {
        RunState::new(
            Uuid::now_v7(),
            "sample",
            ["a".to_string(), "b".to_string()],
            ExecutionMode::Synchronous,
            None,
        )
    }

    #[tokio::test]
    async fn create_then_duplicate_conflicts() {
        let repo = MemoryStateRepository::new();
        let state = sample_state();

        repo.create_run(&state).await.unwrap();
        let err = repo.create_run(&state).await.unwrap_err();
        assert!(matches!(err, StateError::Conflict(_)));
    }

    #[tokio::test]
    async fn mutate_run_applies_under_lock_and_persists() {
        let repo = MemoryStateRepository::new();
        let state = sample_state();
        let run_id = state.run_id;
        repo.create_run(&state).await.unwrap();

        let attempts = repo
            .mutate_run(run_id, |state| {
                let record = state.step_mut("a").unwrap();
                record.status = StepStatus::Running;
                record.attempts += 1;
                record.attempts
            })
            .await
            .unwrap();
        assert_eq!(attempts, 1);

        let loaded = repo.load_run(run_id).await.unwrap();
        assert_eq!(loaded.step("a").unwrap().status, StepStatus::Running);
        assert_eq!(loaded.status, RunStatus::Pending);
    }

    #[tokio::test]
    async fn history_appends_in_order() {
        let repo = MemoryStateRepository::new();
        let state = sample_state();
        let run_id = state.run_id;
        repo.create_run(&state).await.unwrap();

        repo.append_event(run_id, &RunEvent::new(RunEventKind::RunStarted))
            .await
            .unwrap();
        repo.append_event(
            run_id,
            &RunEvent::new(RunEventKind::StepStarted).with_step("a"),
        )
        .await
        .unwrap();

        let history = repo.load_history(run_id).await.unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].kind, RunEventKind::RunStarted);
        assert_eq!(history[1].step_id.as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn missing_run_is_not_found() {
        let repo = MemoryStateRepository::new();
        let err = repo.load_run(Uuid::now_v7()).await.unwrap_err();
        assert!(matches!(err, StateError::RunNotFound(_)));
    }

    #[tokio::test]
    async fn delete_run_removes_snapshot_and_history() {
        let repo = MemoryStateRepository::new();
        let state = sample_state();
        let run_id = state.run_id;
        repo.create_run(&state).await.unwrap();
        repo.append_event(run_id, &RunEvent::new(RunEventKind::RunStarted))
            .await
            .unwrap();

        repo.delete_run(run_id).await.unwrap();

        assert!(matches!(
            repo.load_run(run_id).await.unwrap_err(),
            StateError::RunNotFound(_)
        ));
        assert!(repo.load_history(run_id).await.unwrap().is_empty());
        let err = repo.delete_run(run_id).await.unwrap_err();
        assert!(matches!(err, StateError::RunNotFound(_)));
    }
}
