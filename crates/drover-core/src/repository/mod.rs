//! Repository traits for durable kernel state, plus the on-disk layout
//! shared by the state store and the completion monitor.
//!
//! Implementations live in `drover-infra`. The layout helpers are defined
//! here so every component derives paths the same way:
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

use std::path::{Path, PathBuf};

use uuid::Uuid;

pub mod state;

pub use state::StateRepository;

pub fn runs_root(state_root: &Path) -> PathBuf {
    state_root.join("runs")
}

pub fn run_dir(state_root: &Path, run_id: Uuid) -> PathBuf {
    runs_root(state_root).join(run_id.to_string())
}

pub fn markers_dir(state_root: &Path, run_id: Uuid) -> PathBuf {
    run_dir(state_root, run_id).join("markers")
}

pub fn sequences_root(state_root: &Path) -> PathBuf {
    state_root.join("sequences")
}
