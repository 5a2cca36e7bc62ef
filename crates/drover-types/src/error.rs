//! Error taxonomy for the durable state store.
//!
//! The split between `Unavailable` and `Corrupted` matters: unavailable
//! state is transient (a writer mid-flight, a settling window not yet
//! elapsed) and callers retry with backoff, while corrupted state is
//! structural and callers fall back to the last known good snapshot.

use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum StateError {
    /// State exists but cannot be read right now. Transient; retry.
    #[error("state unavailable: {0}")]
    Unavailable(String),

    /// State was read but fails structural validation. Not retryable.
    #[error("state corrupted: {0}")]
    Corrupted(String),

    #[error("run not found: {0}")]
    RunNotFound(Uuid),

    #[error("sequence not found: {0}")]
    SequenceNotFound(Uuid),

    /// A write conflicts with existing state (e.g. duplicate run id).
    #[error("state conflict: {0}")]
    Conflict(String),

    #[error("state io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("state serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl StateError {
    /// Whether a caller may retry the operation after a short backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Unavailable(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(StateError::Unavailable("settling".into()).is_transient());
        assert!(!StateError::Corrupted("truncated".into()).is_transient());
        assert!(!StateError::RunNotFound(Uuid::now_v7()).is_transient());
    }

    #[test]
    fn test_display_messages() {
        let err = StateError::Corrupted("schema_version 9 unsupported".into());
        assert_eq!(
            err.to_string(),
            "state corrupted: schema_version 9 unsupported"
        );
    }
}
