//! Per-run scratch directories.
//!
//! Every run gets a private working directory under the configured
//! workspace root. Executors and collaborators are pointed at it through
//! [`StepRequest::workdir`]; nothing in it is shared between runs. The
//! directory survives crashes (resume re-acquires it) and is removed only
//! when the run reaches a terminal status.
//!
//! [`StepRequest::workdir`]: crate::executor::StepRequest::workdir

use std::io;
use std::path::{Path, PathBuf};

use uuid::Uuid;

/// Creates and removes run-scoped scratch directories.
#[derive(Debug, Clone)]
pub struct WorkspaceManager {
    root: PathBuf,
}

impl WorkspaceManager {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Create (or re-open, on resume) the scratch directory for a run.
    pub fn acquire(&self, run_id: Uuid) -> io::Result<RunWorkspace> {
        let path = self.root.join(run_id.to_string());
        std::fs::create_dir_all(&path)?;
        Ok(RunWorkspace { path })
    }
}

/// A run's scratch directory.
///
/// Release is explicit: the scheduler calls [`RunWorkspace::release`]
/// when the run reaches a terminal status. Dropping without releasing
/// leaves the directory in place for a later resume.
#[derive(Debug)]
pub struct RunWorkspace {
    path: PathBuf,
}

impl RunWorkspace {
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Remove the directory and everything in it. Tolerates the
    /// directory already being gone.
    pub fn release(self) -> io::Result<()> {
        match std::fs::remove_dir_all(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_creates_run_directory() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path().join("workspaces"));
        let run_id = Uuid::now_v7();

        let workspace = manager.acquire(run_id).unwrap();
        assert!(workspace.path().is_dir());
        assert!(workspace.path().ends_with(run_id.to_string()));
    }

    #[test]
    fn acquire_is_idempotent_across_resume() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Uuid::now_v7();

        let first = manager.acquire(run_id).unwrap();
        std::fs::write(first.path().join("scratch.txt"), "partial").unwrap();

        // A second acquire sees the same directory and its contents.
        let second = manager.acquire(run_id).unwrap();
        assert!(second.path().join("scratch.txt").exists());
    }

    #[test]
    fn release_removes_directory_and_tolerates_absence() {
        let dir = tempfile::tempdir().unwrap();
        let manager = WorkspaceManager::new(dir.path());
        let run_id = Uuid::now_v7();

        let workspace = manager.acquire(run_id).unwrap();
        let path = workspace.path().to_path_buf();
        std::fs::write(path.join("out.md"), "done").unwrap();

        workspace.release().unwrap();
        assert!(!path.exists());

        // Releasing a workspace whose directory vanished is fine.
        let workspace = manager.acquire(run_id).unwrap();
        std::fs::remove_dir_all(workspace.path()).unwrap();
        workspace.release().unwrap();
    }
}
