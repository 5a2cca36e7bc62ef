//! Marker file protocol for out-of-process collaborators.
//!
//! In monitored mode the scheduler does not call an executor. It writes a
//! request marker into the run's marker directory and waits. A collaborator
//! (human or external tool) picks the request up, does the work, and writes
//! a result marker next to it. The completion monitor observes the result
//! and feeds it back into the kernel.
//!
//! Naming convention, one pair per attempt:
//!
//! ```text
//! <step_id>.attempt-<n>.request.json
//! <step_id>.attempt-<n>.result.json
//! ```
//!
//! Markers are written via temp-file-and-rename so observers never see a
//! partially written payload. Consumed result markers are renamed with a
//! `.consumed` suffix rather than deleted, preserving the audit trail.

use std::path::{Path, PathBuf};

use super::{StepError, StepRequest};

pub const REQUEST_MARKER_SUFFIX: &str = ".request.json";
pub const RESULT_MARKER_SUFFIX: &str = ".result.json";

/// Suffix appended to a result marker once its outcome has been applied.
pub const CONSUMED_MARKER_SUFFIX: &str = ".consumed";

/// Suffix appended to a result marker that repeatedly failed to parse.
pub const INVALID_MARKER_SUFFIX: &str = ".invalid";

/// File name of the request marker for one attempt.
pub fn request_marker_name(step_id: &str, attempt: u32) -> String {
    format!("{step_id}.attempt-{attempt}{REQUEST_MARKER_SUFFIX}")
}

/// File name of the result marker for one attempt.
pub fn result_marker_name(step_id: &str, attempt: u32) -> String {
    format!("{step_id}.attempt-{attempt}{RESULT_MARKER_SUFFIX}")
}

/// Parse `<step_id>.attempt-<n>.result.json` into `(step_id, attempt)`.
///
/// Returns `None` for anything that does not match the convention,
/// including consumed and invalidated markers.
pub fn parse_result_marker(file_name: &str) -> Option<(String, u32)> {
    let stem = file_name.strip_suffix(RESULT_MARKER_SUFFIX)?;
    let (step_id, attempt) = stem.rsplit_once(".attempt-")?;
    if step_id.is_empty() {
        return None;
    }
    let attempt: u32 = attempt.parse().ok()?;
    Some((step_id.to_string(), attempt))
}

/// Write a request marker atomically into `markers_dir`.
///
/// Creates the directory if needed. Returns the marker path.
pub async fn write_request_marker(
    markers_dir: &Path,
    request: &StepRequest,
) -> Result<PathBuf, StepError> {
    tokio::fs::create_dir_all(markers_dir).await?;

    let path = markers_dir.join(request_marker_name(&request.step_id, request.attempt));
    let payload = serde_json::to_vec_pretty(request)?;

    // Write to a temp file then rename so collaborators never observe a
    // partial request.
    let tmp = path.with_extension("json.tmp");
    tokio::fs::write(&tmp, payload).await?;
    tokio::fs::rename(&tmp, &path).await?;

    Ok(path)
}
