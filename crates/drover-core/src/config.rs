//! Engine configuration, loaded from TOML.
//!
//! Everything has a default so a bare `EngineConfig::default()` works for
//! tests and embedded use; deployments override via a config file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// Default per-step timeout when a step does not declare its own.
pub const DEFAULT_STEP_TIMEOUT_SECS: u64 = 300;

/// Default cap on concurrently executing steps across all runs.
pub const DEFAULT_MAX_PARALLEL_STEPS: usize = 4;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Root of the durable state tree (runs, sequences, markers).
    #[serde(default = "default_state_root")]
    pub state_root: PathBuf,

    /// Root under which per-run scratch directories are created.
    #[serde(default = "default_workspace_root")]
    pub workspace_root: PathBuf,

    /// Per-step timeout applied when a step declares none.
    #[serde(default = "default_step_timeout")]
    pub default_step_timeout_secs: u64,

    /// Cap on concurrently executing steps across all runs.
    #[serde(default = "default_max_parallel")]
    pub max_parallel_steps: usize,

    /// Completion monitor sweep interval.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_ms: u64,

    /// Minimum age a state or marker file must reach before a reader
    /// trusts it; younger files count as still being written.
    #[serde(default = "default_settle_window")]
    pub settle_window_ms: u64,

    /// How many times a transient (unavailable) read is retried.
    #[serde(default = "default_read_retries")]
    pub read_retry_attempts: u32,

    /// Backoff between transient read retries.
    #[serde(default = "default_read_backoff")]
    pub read_retry_backoff_ms: u64,
}

fn default_state_root() -> PathBuf {
    PathBuf::from("./.drover/state")
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("./.drover/workspaces")
}

fn default_step_timeout() -> u64 {
    DEFAULT_STEP_TIMEOUT_SECS
}

fn default_max_parallel() -> usize {
    DEFAULT_MAX_PARALLEL_STEPS
}

fn default_poll_interval() -> u64 {
    500
}

fn default_settle_window() -> u64 {
    750
}

fn default_read_retries() -> u32 {
    5
}

fn default_read_backoff() -> u64 {
    200
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            state_root: default_state_root(),
            workspace_root: default_workspace_root(),
            default_step_timeout_secs: default_step_timeout(),
            max_parallel_steps: default_max_parallel(),
            poll_interval_ms: default_poll_interval(),
            settle_window_ms: default_settle_window(),
            read_retry_attempts: default_read_retries(),
            read_retry_backoff_ms: default_read_backoff(),
        }
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn settle_window(&self) -> Duration {
        Duration::from_millis(self.settle_window_ms)
    }

    pub fn read_retry_backoff(&self) -> Duration {
        Duration::from_millis(self.read_retry_backoff_ms)
    }
}

/// Load and validate an engine config from a TOML file.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("reading engine config from {}", path.display()))?;
    let config: EngineConfig = toml::from_str(&raw)
        .with_context(|| format!("parsing engine config {}", path.display()))?;

    if config.max_parallel_steps == 0 {
        bail!("max_parallel_steps must be at least 1");
    }
    if config.state_root == config.workspace_root {
        bail!("state_root and workspace_root must be distinct directories");
    }
    Ok(config)
}
