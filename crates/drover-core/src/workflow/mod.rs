//! Workflow execution: definitions, planning, scheduling, and gates.
//!
//! - `context` -- run-scoped execution context and payload sanitizing
//! - `dag` -- dependency graph validation, wave planning, dispatch grouping
//! - `definition` -- YAML parsing and structural validation
//! - `executor` -- the workflow engine and its control surface
//! - `gate` -- quality gate scoring and loopback decisions
//! - `retry` -- bounded retry directives for failed steps
//! - `workspace` -- per-run scratch directories

pub mod context;
pub mod dag;
pub mod definition;
pub mod executor;
pub mod gate;
pub mod retry;
pub mod workspace;
