//! # Dentalflow
//!
//! Job orchestration, pipeline execution and step caching for dental scan
//! processing.
//!
//! Dentalflow provides:
//!
//! - **Jobs**: a persistent record per unit of work with a guarded state
//!   machine, optimistic concurrency and ordered progress events
//! - **Workers**: a queue with delayed visibility, exponential backoff with
//!   jitter, time limits, heartbeats and a dead-letter channel
//! - **Pipelines**: versioned step sequences dispatched through a registry
//!   of geometry functions
//! - **Step caching**: content-addressed reuse of deterministic step
//!   outputs with TTL and grace-period eviction
//! - **Cancellation**: cooperative tokens checked at step boundaries
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use dentalflow::prelude::*;
//!
//! let machine = Arc::new(JobStateMachine::new(Arc::new(InMemoryJobStore::new())));
//! let executor = PipelineExecutor::new(Arc::new(registry), Arc::new(InMemoryCacheStore::new()));
//! let handlers = HandlerRegistry::new()
//!     .with(Arc::new(PipelineJobHandler::new(catalog.clone(), executor, meshes)))?;
//!
//! let ctx = Arc::new(WorkerContext::new(config, machine.clone(), broker.clone(), Arc::new(handlers)));
//! let pool = WorkerPool::start(ctx);
//!
//! let job = JobSubmitter::new(machine, catalog, registry, broker)
//!     .submit(NewJob::new(PIPELINE_JOB_TYPE).with_pipeline(pipeline).with_file_id("scan-17"))
//!     .await?;
//! ```

#![forbid(unsafe_code)]
#![warn(
    clippy::all,
    clippy::pedantic,
    missing_docs,
    rust_2018_idioms
)]
#![allow(
    clippy::module_name_repetitions,
    clippy::must_use_candidate,
    clippy::missing_errors_doc,
    clippy::missing_panics_doc,
    clippy::cast_precision_loss
)]

pub mod cache;
pub mod cancellation;
pub mod config;
pub mod core;
pub mod errors;
pub mod events;
pub mod jobs;
pub mod observability;
pub mod pipeline;
pub mod testing;
pub mod utils;
pub mod worker;

/// Prelude module for convenient imports
pub mod prelude {
    pub use crate::cache::{CacheStore, FsCacheStore, InMemoryCacheStore};
    pub use crate::cancellation::{CancellationRegistry, CancellationToken};
    pub use crate::config::EngineConfig;
    pub use crate::core::{Job, JobId, JobStatus, Mesh, NewJob, Outcome, PipelineRef, StepMetrics};
    pub use crate::errors::{
        ConfigurationError, DentalflowError, ErrorClass, JobError, PipelineError,
    };
    pub use crate::events::{EventSink, JobEvent, JobEventKind, LoggingEventSink, NoOpEventSink, ProgressHub};
    pub use crate::jobs::{InMemoryJobStore, JobStateMachine, JobStore, JobSubmitter};
    pub use crate::observability::init_tracing;
    pub use crate::pipeline::{
        AlgorithmKind, PipelineCatalog, PipelineConfig, PipelineExecutor, PipelineStepConfig,
        StepDefinition, StepKind, StepOutput, StepParams, StepRegistry,
    };
    pub use crate::utils::{now_utc, Timestamp};
    pub use crate::worker::{
        Broker, HandlerRegistry, InMemoryBroker, JobHandler, MeshRepository, PipelineJobHandler,
        RetryPolicy, WorkerContext, WorkerPool, PIPELINE_JOB_TYPE,
    };
}
