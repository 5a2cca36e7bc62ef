//! Marker-directory monitoring for out-of-process collaborators.

pub mod completion;

pub use completion::{CompletionMonitor, MonitorHandle};
