//! File-backed state store implementation.
//!
//! Implements the `StateRepository` trait from `drover-core` with plain
//! files under `state_root`, using the shared layout helpers:
//!
//! ```text
//! <state_root>/
//!   runs/<run_id>/
//!     state.json        current snapshot (atomic replace)
//!     definition.yaml   workflow definition pinned at start
//!     history.jsonl     append-only event log
//!     markers/          collaborator request/result markers
//!   sequences/<sequence_id>.json
//! ```
//!
//! Write discipline: every snapshot replace goes through a sibling temp
//! file plus `rename`, so a crash leaves either the old or the new file,
//! never a torn one. Readers still have to cope with files written by
//! out-of-process collaborators, so every disk read is validated: a file
//! modified inside the settling window or implausibly small is
//! [`StateError::Unavailable`] (retried with backoff), while one that
//! fails parsing or schema checks is [`StateError::Corrupted`] and falls
//! back to the last known-good snapshot held in memory.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use uuid::Uuid;

use drover_core::config::EngineConfig;
use drover_core::repository::{StateRepository, markers_dir, run_dir, runs_root, sequences_root};
use drover_types::epic::SequenceState;
use drover_types::error::StateError;
use drover_types::run::{RunEvent, RunEventKind, RunState, STATE_SCHEMA_VERSION};
use drover_types::workflow::WorkflowDefinition;

/// Smallest byte count a serialized snapshot can plausibly have. Anything
/// under this is a write still in flight.
const MIN_SNAPSHOT_BYTES: u64 = 16;

/// Per-run lock pair. The snapshot lock serializes read-modify-write
/// cycles on `state.json`; the history lock serializes appends to
/// `history.jsonl`. They are separate so a snapshot holder can append a
/// warning without deadlocking on itself.
#[derive(Default)]
struct RunLocks {
    snapshot: Mutex<()>,
    history: Mutex<()>,
}

/// Durable state store backed by the local filesystem.
///
/// The store is the single writer for the files it manages, so reads are
/// served from a warm in-process copy when one exists. That copy doubles
/// as the last known-good snapshot: when a disk read comes back
/// corrupted, the cached state is returned instead and a
/// [`RunEventKind::StateWarning`] is appended to the run's history.
pub struct FileStateStore {
    state_root: PathBuf,
    settle_window: Duration,
    read_retry_attempts: u32,
    read_retry_backoff: Duration,
    cache: DashMap<Uuid, RunState>,
    locks: DashMap<Uuid, Arc<RunLocks>>,
}

impl FileStateStore {
    /// Create a store rooted at `state_root` with default read policy.
    pub fn new(state_root: impl Into<PathBuf>) -> Self {
        Self {
            state_root: state_root.into(),
            settle_window: Duration::from_millis(750),
            read_retry_attempts: 5,
            read_retry_backoff: Duration::from_millis(200),
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    /// Create a store whose root and read policy come from engine config.
    pub fn from_config(config: &EngineConfig) -> Self {
        Self {
            state_root: config.state_root.clone(),
            settle_window: config.settle_window(),
            read_retry_attempts: config.read_retry_attempts.max(1),
            read_retry_backoff: config.read_retry_backoff(),
            cache: DashMap::new(),
            locks: DashMap::new(),
        }
    }

    pub fn state_root(&self) -> &Path {
        &self.state_root
    }

    fn locks_for(&self, run_id: Uuid) -> Arc<RunLocks> {
        self.locks
            .entry(run_id)
            .or_insert_with(|| Arc::new(RunLocks::default()))
            .clone()
    }

    fn state_file(&self, run_id: Uuid) -> PathBuf {
        run_dir(&self.state_root, run_id).join("state.json")
    }

    fn history_file(&self, run_id: Uuid) -> PathBuf {
        run_dir(&self.state_root, run_id).join("history.jsonl")
    }

    fn definition_file(&self, run_id: Uuid) -> PathBuf {
        run_dir(&self.state_root, run_id).join("definition.yaml")
    }

    fn sequence_file(&self, sequence_id: Uuid) -> PathBuf {
        sequences_root(&self.state_root).join(format!("{sequence_id}.json"))
    }

    fn cached(&self, run_id: Uuid) -> Option<RunState> {
        self.cache.get(&run_id).map(|entry| entry.value().clone())
    }

    async fn write_snapshot(&self, state: &RunState) -> Result<(), StateError> {
        let payload = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.state_file(state.run_id), &payload).await?;
        Ok(())
    }

    /// One validated read of a snapshot from disk. Distinguishes
    /// transient unavailability from structural corruption.
    async fn read_snapshot_once(&self, run_id: Uuid) -> Result<RunState, StateError> {
        let path = self.state_file(run_id);
        let meta = match tokio::fs::metadata(&path).await {
            Ok(meta) => meta,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StateError::RunNotFound(run_id));
            }
            Err(error) => return Err(error.into()),
        };
        if meta.len() < MIN_SNAPSHOT_BYTES {
            return Err(StateError::Unavailable(format!(
                "snapshot {} is {} byte(s), write likely in flight",
                path.display(),
                meta.len()
            )));
        }
        if let Ok(modified) = meta.modified()
            && let Ok(age) = modified.elapsed()
            && age < self.settle_window
        {
            return Err(StateError::Unavailable(format!(
                "snapshot {} modified {}ms ago, still settling",
                path.display(),
                age.as_millis()
            )));
        }
        let raw = tokio::fs::read(&path).await?;
        let state: RunState = serde_json::from_slice(&raw)
            .map_err(|error| StateError::Corrupted(format!("snapshot {}: {error}", path.display())))?;
        if state.schema_version != STATE_SCHEMA_VERSION {
            return Err(StateError::Corrupted(format!(
                "snapshot {} has schema_version {}, this build expects {}",
                path.display(),
                state.schema_version,
                STATE_SCHEMA_VERSION
            )));
        }
        if state.run_id != run_id {
            return Err(StateError::Corrupted(format!(
                "snapshot {} belongs to run {}",
                path.display(),
                state.run_id
            )));
        }
        Ok(state)
    }

    /// Read a snapshot from disk, retrying transient failures with
    /// backoff up to the configured attempt budget.
    async fn read_snapshot(&self, run_id: Uuid) -> Result<RunState, StateError> {
        let mut attempt = 1u32;
        loop {
            match self.read_snapshot_once(run_id).await {
                Err(error) if error.is_transient() && attempt < self.read_retry_attempts => {
                    tracing::debug!(
                        run_id = %run_id,
                        attempt,
                        error = %error,
                        "snapshot not yet readable, backing off"
                    );
                    attempt += 1;
                    tokio::time::sleep(self.read_retry_backoff).await;
                }
                other => return other,
            }
        }
    }

    /// Disk read with the corruption fallback: a corrupted snapshot is
    /// replaced by the last known-good copy when one is cached, and the
    /// substitution is recorded in the run's history.
    async fn read_snapshot_with_fallback(&self, run_id: Uuid) -> Result<RunState, StateError> {
        match self.read_snapshot(run_id).await {
            Ok(state) => {
                self.cache.insert(run_id, state.clone());
                Ok(state)
            }
            Err(StateError::Corrupted(reason)) => {
                let Some(last_good) = self.cached(run_id) else {
                    return Err(StateError::Corrupted(reason));
                };
                tracing::warn!(
                    run_id = %run_id,
                    reason = reason.as_str(),
                    "snapshot corrupted, serving last known-good copy"
                );
                self.append_event_locked(
                    run_id,
                    &RunEvent::new(RunEventKind::StateWarning)
                        .with_detail(format!("corrupted snapshot, serving last known-good: {reason}")),
                )
                .await?;
                Ok(last_good)
            }
            Err(other) => Err(other),
        }
    }

    /// Append one history line under the run's history lock.
    async fn append_event_locked(&self, run_id: Uuid, event: &RunEvent) -> Result<(), StateError> {
        let locks = self.locks_for(run_id);
        let _guard = locks.history.lock().await;
        let path = self.history_file(run_id);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut line = serde_json::to_vec(event)?;
        line.push(b'\n');
        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await?;
        file.write_all(&line).await?;
        file.flush().await?;
        Ok(())
    }
}

impl StateRepository for FileStateStore {
    async fn create_run(&self, state: &RunState) -> Result<(), StateError> {
        let locks = self.locks_for(state.run_id);
        let _guard = locks.snapshot.lock().await;
        let path = self.state_file(state.run_id);
        if tokio::fs::try_exists(&path).await? {
            return Err(StateError::Conflict(format!(
                "run {} already exists",
                state.run_id
            )));
        }
        tokio::fs::create_dir_all(markers_dir(&self.state_root, state.run_id)).await?;
        self.write_snapshot(state).await?;
        self.cache.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn save_run(&self, state: &RunState) -> Result<(), StateError> {
        let locks = self.locks_for(state.run_id);
        let _guard = locks.snapshot.lock().await;
        self.write_snapshot(state).await?;
        self.cache.insert(state.run_id, state.clone());
        Ok(())
    }

    async fn load_run(&self, run_id: Uuid) -> Result<RunState, StateError> {
        if let Some(state) = self.cached(run_id) {
            return Ok(state);
        }
        self.read_snapshot_with_fallback(run_id).await
    }

    async fn load_last_state(&self, run_id: Uuid) -> Result<RunState, StateError> {
        self.read_snapshot_with_fallback(run_id).await
    }

    async fn mutate_run<F, T>(&self, run_id: Uuid, f: F) -> Result<T, StateError>
    where
        F: FnOnce(&mut RunState) -> T + Send,
        T: Send,
    {
        let locks = self.locks_for(run_id);
        let _guard = locks.snapshot.lock().await;
        let mut state = match self.cached(run_id) {
            Some(state) => state,
            None => self.read_snapshot_with_fallback(run_id).await?,
        };
        let out = f(&mut state);
        self.write_snapshot(&state).await?;
        self.cache.insert(run_id, state);
        Ok(out)
    }

    async fn append_event(&self, run_id: Uuid, event: &RunEvent) -> Result<(), StateError> {
        self.append_event_locked(run_id, event).await
    }

    async fn load_history(&self, run_id: Uuid) -> Result<Vec<RunEvent>, StateError> {
        let path = self.history_file(run_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut events = Vec::new();
        for (idx, line) in raw.lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RunEvent>(line) {
                Ok(event) => events.push(event),
                Err(error) => {
                    // A torn tail line after a crash is expected; skip it
                    // rather than losing the whole log.
                    tracing::warn!(
                        run_id = %run_id,
                        line = idx + 1,
                        error = %error,
                        "skipping unparseable history line"
                    );
                }
            }
        }
        Ok(events)
    }

    async fn list_runs(&self) -> Result<Vec<Uuid>, StateError> {
        let root = runs_root(&self.state_root);
        let mut dir = match tokio::fs::read_dir(&root).await {
            Ok(dir) => dir,
            Err(error) if error.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(error) => return Err(error.into()),
        };
        let mut ids = Vec::new();
        while let Some(entry) = dir.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            match Uuid::parse_str(name) {
                Ok(id) => ids.push(id),
                Err(_) => {
                    tracing::debug!(entry = name, "ignoring non-run entry in runs directory");
                }
            }
        }
        // v7 ids sort chronologically.
        ids.sort();
        Ok(ids)
    }

    async fn delete_run(&self, run_id: Uuid) -> Result<(), StateError> {
        let locks = self.locks_for(run_id);
        let _guard = locks.snapshot.lock().await;
        let dir = run_dir(&self.state_root, run_id);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StateError::RunNotFound(run_id));
            }
            Err(error) => return Err(error.into()),
        }
        self.cache.remove(&run_id);
        Ok(())
    }

    async fn save_definition(
        &self,
        run_id: Uuid,
        definition: &WorkflowDefinition,
    ) -> Result<(), StateError> {
        let yaml = serde_yaml_ng::to_string(definition)
            .map_err(|error| StateError::Io(std::io::Error::other(error)))?;
        write_atomic(&self.definition_file(run_id), yaml.as_bytes()).await?;
        Ok(())
    }

    async fn load_definition(&self, run_id: Uuid) -> Result<WorkflowDefinition, StateError> {
        let path = self.definition_file(run_id);
        let raw = match tokio::fs::read_to_string(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StateError::RunNotFound(run_id));
            }
            Err(error) => return Err(error.into()),
        };
        serde_yaml_ng::from_str(&raw)
            .map_err(|error| StateError::Corrupted(format!("definition {}: {error}", path.display())))
    }

    async fn save_sequence(&self, state: &SequenceState) -> Result<(), StateError> {
        let payload = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.sequence_file(state.sequence_id), &payload).await?;
        Ok(())
    }

    async fn load_sequence(&self, sequence_id: Uuid) -> Result<SequenceState, StateError> {
        let path = self.sequence_file(sequence_id);
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(error) if error.kind() == ErrorKind::NotFound => {
                return Err(StateError::SequenceNotFound(sequence_id));
            }
            Err(error) => return Err(error.into()),
        };
        serde_json::from_slice(&raw)
            .map_err(|error| StateError::Corrupted(format!("sequence {}: {error}", path.display())))
    }
}

/// Write `payload` to `path` through a sibling temp file and rename, so
/// concurrent readers see either the old or the new content.
async fn write_atomic(path: &Path, payload: &[u8]) -> Result<(), std::io::Error> {
    if let Some(parent) = path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut tmp_name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, path).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
