//! Shared identifier types used across the workflow crates.

pub mod types;

pub use types::InstanceId;
