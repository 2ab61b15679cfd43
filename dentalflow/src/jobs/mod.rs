//! Durable jobs and their state machine.
//!
//! This module provides:
//! - The [`JobStore`] trait with in-memory and SQLite backends
//! - [`JobStateMachine`], which owns every status transition
//! - [`JobSubmitter`] for validated, idempotent submission
//! - [`LivenessSweep`] for claims abandoned by crashed workers

mod liveness;
mod memory_store;
#[cfg(feature = "sqlite")]
mod sqlite_store;
mod state_machine;
mod store;
mod submission;

pub use liveness::{LivenessReport, LivenessSweep, HEARTBEAT_LOST};
pub use memory_store::InMemoryJobStore;
#[cfg(feature = "sqlite")]
pub use sqlite_store::SqliteJobStore;
pub use state_machine::{FailOutcome, JobStateMachine};
pub use store::{last_seen, InsertOutcome, JobFilter, JobStore};
pub use submission::JobSubmitter;
