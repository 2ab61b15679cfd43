//! Testing utilities for dentalflow.
//!
//! This module provides:
//! - Deterministic meshes and a fully populated fake step registry
//! - Failing, counting and non-deterministic step definitions
//! - An in-memory mesh repository that records what it stored

mod fixtures;
mod mocks;

pub use crate::events::CollectingEventSink;
pub use fixtures::{fake_registry, grid_mesh};
pub use mocks::{counting_step, failing_step, scale_step, RecordingMeshRepository};
