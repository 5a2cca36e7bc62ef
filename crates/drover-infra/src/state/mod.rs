//! Durable run state on the local filesystem.

pub mod store;

pub use store::FileStateStore;
