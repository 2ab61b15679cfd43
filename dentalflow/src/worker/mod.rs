//! Workers: the queue, retry policy, handlers and the execution loop.
//!
//! This module provides:
//! - The [`Broker`] trait and an in-memory broker with delayed visibility
//!   and a dead-letter channel
//! - [`RetryPolicy`] with exponential backoff and jitter
//! - [`JobHandler`] and the pipeline handler
//! - [`TaskExecutor`], which runs one attempt, and [`WorkerPool`]

mod broker;
mod context;
mod executor;
mod handler;
mod pool;
mod retry;

#[cfg(test)]
mod integration_tests;

pub use broker::{Broker, BrokerError, DeadLetter, InMemoryBroker, WorkItem};
pub use context::{JobContext, WorkerContext};
pub use executor::{settle_failure, TaskExecutor, TaskOutcome};
#[cfg(test)]
pub use handler::MockMeshRepository;
pub use handler::{HandlerRegistry, JobHandler, MeshRepository, PipelineJobHandler, PIPELINE_JOB_TYPE};
pub use pool::WorkerPool;
pub use retry::{BackoffStrategy, JitterStrategy, RetryDecision, RetryPolicy};
