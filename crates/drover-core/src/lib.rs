//! Core workflow kernel for Drover.
//!
//! This crate contains the engine that turns declarative workflow
//! definitions into durable, resumable runs: graph validation and wave
//! planning, concurrent step scheduling, quality gates with bounded
//! loopback, the executor registry, and the epic sequencer. Persistence
//! implementations live in `drover-infra`; this crate only defines the
//! repository traits it drives.

pub mod config;
pub mod epic;
pub mod event;
pub mod executor;
pub mod repository;
pub mod workflow;
