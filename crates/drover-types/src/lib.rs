//! Shared domain types for the Drover workflow kernel.
//!
//! This crate defines the data model used across every other Drover crate:
//! workflow definitions, run state snapshots, epic documents, kernel events,
//! and the state-store error taxonomy. Zero infrastructure dependencies --
//! only serde, uuid, chrono, thiserror.

pub mod epic;
pub mod error;
pub mod event;
pub mod run;
pub mod workflow;
