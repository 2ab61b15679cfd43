//! Core domain model types for dentalflow.
//!
//! This module contains the fundamental types used throughout the engine:
//! - Job status enum and its transition table
//! - The job record, its submission builder, and identifiers
//! - The mesh value that flows through pipelines
//! - Per-step metrics and the explicit task outcome type

mod job;
mod mesh;
mod metrics;
mod outcome;
mod status;

pub use job::{Job, JobId, NewJob, PipelineRef, DEFAULT_MAX_RETRIES};
pub use mesh::{Mesh, MeshDecodeError};
pub use metrics::{CacheOutcome, StepMetrics};
pub use outcome::Outcome;
pub use status::JobStatus;
