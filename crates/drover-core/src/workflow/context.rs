//! Run-scoped execution context and payload sanitizing.
//!
//! Collaborator payloads (run inputs, step params, structured artifact
//! values) are arbitrary JSON. Before any of it is persisted into a run
//! snapshot it passes through [`sanitize_payload`], which caps nesting
//! depth and total serialized size, substituting a placeholder where a
//! payload exceeds the caps. Snapshots stay small and serializable no
//! matter what a collaborator reports.

use std::path::PathBuf;

use serde_json::{Value, json};
use uuid::Uuid;

/// Maximum serialized size of a single persisted payload (1 MiB).
pub const MAX_PAYLOAD_BYTES: usize = 1024 * 1024;

/// Maximum nesting depth of a persisted payload.
pub const MAX_PAYLOAD_DEPTH: usize = 32;

// ---------------------------------------------------------------------------
// RunContext
// ---------------------------------------------------------------------------

/// Everything run-scoped the scheduler threads through step dispatch.
#[derive(Debug, Clone)]
pub struct RunContext {
    pub run_id: Uuid,
    pub workflow: String,
    /// Scratch directory private to this run.
    pub workdir: PathBuf,
    /// Caller-supplied inputs, already sanitized.
    pub inputs: Option<Value>,
}

impl RunContext {
    pub fn new(
        run_id: Uuid,
        workflow: impl Into<String>,
        workdir: PathBuf,
        inputs: Option<Value>,
    ) -> Self {
        Self {
            run_id,
            workflow: workflow.into(),
            workdir,
            inputs: inputs.map(|v| sanitize_payload(&v)),
        }
    }
}

// ---------------------------------------------------------------------------
// Payload sanitizing
// ---------------------------------------------------------------------------

/// Rebuild a payload with depth and size caps applied.
///
/// Subtrees nested deeper than [`MAX_PAYLOAD_DEPTH`] are replaced with a
/// `{"_truncated": true}` marker; a payload whose serialized form exceeds
/// [`MAX_PAYLOAD_BYTES`] is replaced wholesale with a marker recording the
/// original size.
pub fn sanitize_payload(value: &Value) -> Value {
    let capped = clamp_depth(value, 0);
    let size = serde_json::to_vec(&capped).map(|b| b.len()).unwrap_or(0);
    if size > MAX_PAYLOAD_BYTES {
        return json!({
            "_truncated": true,
            "reason": "size",
            "original_bytes": size,
        });
    }
    capped
}

fn clamp_depth(value: &Value, depth: usize) -> Value {
    if depth >= MAX_PAYLOAD_DEPTH {
        return json!({ "_truncated": true, "reason": "depth" });
    }
    match value {
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(k, v)| (k.clone(), clamp_depth(v, depth + 1)))
                .collect(),
        ),
        Value::Array(items) => Value::Array(
            items.iter().map(|v| clamp_depth(v, depth + 1)).collect(),
        ),
        scalar => scalar.clone(),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
