//! Observability for Drover: tracing subscriber setup and optional
//! OpenTelemetry trace export.
//!
//! Embedders call [`init_tracing`] once at startup and [`shutdown_tracing`]
//! before exit; everything else in the workspace just uses the `tracing`
//! macros.

pub mod tracing_setup;

pub use tracing_setup::{init_tracing, shutdown_tracing};
