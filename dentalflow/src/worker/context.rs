//! Explicit contexts handed to workers and handlers.

use std::sync::Arc;
use tracing::debug;

use super::{Broker, HandlerRegistry, RetryPolicy};
use crate::cancellation::{CancellationRegistry, CancellationToken};
use crate::config::EngineConfig;
use crate::core::{Job, JobId};
use crate::errors::JobError;
use crate::jobs::JobStateMachine;

/// Everything a worker needs, passed explicitly instead of living in
/// process-wide state.
#[derive(Clone)]
pub struct WorkerContext {
    settings: EngineConfig,
    machine: Arc<JobStateMachine>,
    broker: Arc<dyn Broker>,
    handlers: Arc<HandlerRegistry>,
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("settings", &self.settings)
            .field("handlers", &self.handlers)
            .finish_non_exhaustive()
    }
}

impl WorkerContext {
    /// Creates a context.
    #[must_use]
    pub fn new(
        settings: EngineConfig,
        machine: Arc<JobStateMachine>,
        broker: Arc<dyn Broker>,
        handlers: Arc<HandlerRegistry>,
    ) -> Self {
        Self {
            settings,
            machine,
            broker,
            handlers,
        }
    }

    /// Engine settings.
    #[must_use]
    pub fn settings(&self) -> &EngineConfig {
        &self.settings
    }

    /// The job state machine.
    #[must_use]
    pub fn machine(&self) -> &Arc<JobStateMachine> {
        &self.machine
    }

    /// The work queue.
    #[must_use]
    pub fn broker(&self) -> &Arc<dyn Broker> {
        &self.broker
    }

    /// Handlers by job type.
    #[must_use]
    pub fn handlers(&self) -> &HandlerRegistry {
        &self.handlers
    }

    /// Retry and backoff policy.
    #[must_use]
    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.settings.retry
    }

    /// Tokens of running jobs.
    #[must_use]
    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        self.machine.cancellations()
    }
}

/// Per-attempt view given to a [`super::JobHandler`].
#[derive(Debug, Clone)]
pub struct JobContext {
    job_id: JobId,
    correlation_id: String,
    token: Arc<CancellationToken>,
    machine: Arc<JobStateMachine>,
}

impl JobContext {
    /// Creates the context for an attempt at `job`.
    #[must_use]
    pub fn new(job: &Job, token: Arc<CancellationToken>, machine: Arc<JobStateMachine>) -> Self {
        Self {
            job_id: job.id,
            correlation_id: job.correlation_id.clone(),
            token,
            machine,
        }
    }

    /// The running job.
    #[must_use]
    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    /// Its correlation id.
    #[must_use]
    pub fn correlation_id(&self) -> &str {
        &self.correlation_id
    }

    /// Cancellation token of the attempt.
    #[must_use]
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Returns true once the attempt should stop.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Reports progress. Trips the token if the job left `processing`.
    pub async fn report_progress(&self, percent: i32) -> Result<(), JobError> {
        let result = self.machine.report_progress(self.job_id, percent).await;
        self.observe(result)
    }

    /// Refreshes the heartbeat. Trips the token if the job left
    /// `processing`.
    pub async fn heartbeat(&self) -> Result<(), JobError> {
        let result = self.machine.heartbeat(self.job_id).await;
        self.observe(result)
    }

    fn observe(&self, result: Result<Job, JobError>) -> Result<(), JobError> {
        match result {
            Ok(_) => Ok(()),
            Err(err @ JobError::InvalidTransition(_)) => {
                debug!(job_id = %self.job_id, error = %err, "Job left processing, stopping attempt");
                self.token.cancel(format!("job is no longer processing: {err}"));
                Err(err)
            }
            Err(err) => Err(err),
        }
    }
}
