//! Infrastructure implementations for Drover.
//!
//! This crate supplies the concrete pieces the kernel in `drover-core`
//! stays abstract over:
//!
//! - [`state::FileStateStore`] -- the durable, crash-safe implementation
//!   of `StateRepository`, backed by plain JSON/YAML files so runs can
//!   be inspected (and resumed) with nothing but a text editor.
//! - [`monitor::CompletionMonitor`] -- the background task that watches
//!   run marker directories and feeds collaborator result markers back
//!   into waiting schedulers or, after a crash, directly into run state.

pub mod monitor;
pub mod state;
