//! Job submission.

use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use super::JobStateMachine;
use crate::core::{Job, NewJob};
use crate::errors::{ConfigurationError, DentalflowError};
use crate::pipeline::{PipelineCatalog, StepRegistry};
use crate::worker::{Broker, WorkItem};

/// Validates submissions, creates jobs and queues them.
///
/// Pipeline references are resolved against the catalog and checked
/// against the step registry, so a bad configuration is rejected here and
/// never reaches a worker.
#[derive(Clone)]
pub struct JobSubmitter {
    machine: Arc<JobStateMachine>,
    catalog: Arc<PipelineCatalog>,
    registry: Arc<StepRegistry>,
    broker: Arc<dyn Broker>,
}

impl std::fmt::Debug for JobSubmitter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobSubmitter").finish_non_exhaustive()
    }
}

impl JobSubmitter {
    /// Creates a submitter.
    #[must_use]
    pub fn new(
        machine: Arc<JobStateMachine>,
        catalog: Arc<PipelineCatalog>,
        registry: Arc<StepRegistry>,
        broker: Arc<dyn Broker>,
    ) -> Self {
        Self {
            machine,
            catalog,
            registry,
            broker,
        }
    }

    /// Submits a job.
    ///
    /// A repeated `request_key` returns the existing job without queueing
    /// it again.
    pub async fn submit(&self, new: NewJob) -> Result<Job, DentalflowError> {
        if let Some(pipeline) = &new.pipeline {
            let config = self.catalog.get(pipeline).ok_or_else(|| {
                ConfigurationError::new(format!("unknown pipeline {pipeline}")).with_field("pipeline")
            })?;
            self.registry.check_config(&config)?;
        }

        let outcome = self.machine.create_outcome(new).await?;
        if !outcome.is_inserted() {
            return Ok(outcome.into_job());
        }

        let job = outcome.into_job();
        self.broker
            .enqueue(WorkItem::from_job(&job), Duration::ZERO)
            .await
            .map_err(|err| DentalflowError::TransientInfrastructure(err.to_string()))?;
        info!(job_id = %job.id, priority = job.priority, "Job queued");
        Ok(job)
    }
}
