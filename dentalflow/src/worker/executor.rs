//! The task executor: one attempt at one queued job.

use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, info_span, warn, Instrument};

use super::{Broker, JobContext, RetryDecision, RetryPolicy, WorkItem, WorkerContext};
use crate::cancellation::CancellationToken;
use crate::core::{Job, JobId, JobStatus, Outcome};
use crate::errors::{DentalflowError, ErrorClass, JobError};
use crate::jobs::JobStateMachine;

/// What happened to a work item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    /// The job succeeded.
    Succeeded,
    /// The attempt failed and the job was requeued.
    Retrying {
        /// Visibility delay of the requeued item.
        delay: Duration,
    },
    /// Retries are exhausted; the item went to the dead-letter channel.
    DeadLettered,
    /// The job failed with a non-retryable error.
    Failed,
    /// The job was cancelled while running.
    Cancelled,
    /// The job could not be claimed; someone else has it or it is gone.
    Skipped,
}

fn transient(err: impl std::fmt::Display) -> DentalflowError {
    DentalflowError::TransientInfrastructure(err.to_string())
}

/// Fails a processing job and applies the retry policy.
///
/// A retryable failure with budget left is requeued after the policy's
/// backoff delay; once the budget is spent the item is dead-lettered and
/// the job stays `failed` with `retry_count == max_retries`.
pub async fn settle_failure(
    machine: &JobStateMachine,
    broker: &dyn Broker,
    policy: &RetryPolicy,
    id: JobId,
    message: &str,
    retryable: bool,
) -> Result<TaskOutcome, DentalflowError> {
    let failed = machine.fail(id, message, retryable).await?.job;
    let class = if retryable { ErrorClass::Transient } else { ErrorClass::Terminal };

    match policy.decide(class, failed.retry_count, failed.max_retries) {
        RetryDecision::Retry(delay) => {
            let job = machine.retry(id).await?;
            broker
                .enqueue(WorkItem::from_job(&job), delay)
                .await
                .map_err(transient)?;
            info!(
                retry_count = job.retry_count,
                delay_ms = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX),
                "Retry scheduled"
            );
            Ok(TaskOutcome::Retrying { delay })
        }
        RetryDecision::GiveUp => {
            broker
                .dead_letter(WorkItem::from_job(&failed), message.to_string())
                .await
                .map_err(transient)?;
            machine.record_dead_letter(&failed, message).await;
            Ok(TaskOutcome::DeadLettered)
        }
        RetryDecision::NotRetryable => {
            warn!(job_id = %id, error = %message, "Job failed permanently");
            Ok(TaskOutcome::Failed)
        }
    }
}

/// Claims queued jobs and runs their handlers.
#[derive(Debug, Clone)]
pub struct TaskExecutor {
    ctx: Arc<WorkerContext>,
}

impl TaskExecutor {
    /// Creates an executor over `ctx`.
    #[must_use]
    pub fn new(ctx: Arc<WorkerContext>) -> Self {
        Self { ctx }
    }

    /// Processes one work item end to end.
    ///
    /// Expected races (the job was claimed elsewhere, cancelled, or
    /// removed) are reported as outcomes; only infrastructure and
    /// invariant failures are returned as errors.
    pub async fn process(&self, item: WorkItem) -> Result<TaskOutcome, DentalflowError> {
        let span = info_span!(
            "job",
            job_id = %item.job_id,
            correlation_id = %item.correlation_id,
            job_type = %item.job_type
        );
        self.attempt(&item).instrument(span).await
    }

    async fn attempt(&self, item: &WorkItem) -> Result<TaskOutcome, DentalflowError> {
        let machine = self.ctx.machine();
        let job = match machine.claim(item.job_id).await {
            Ok(job) => job,
            Err(err @ (JobError::AlreadyClaimed { .. } | JobError::NotFound(_))) => {
                debug!(error = %err, "Skipping work item");
                return Ok(TaskOutcome::Skipped);
            }
            Err(err) => return Err(err.into()),
        };

        // only the claim owner touches the registry; duplicates never get here
        let cancellations = self.ctx.cancellations();
        let token = cancellations.register(job.id);
        let result = self.run_claimed(job, &token).await;
        cancellations.release(&item.job_id, &token);
        result
    }

    async fn run_claimed(&self, job: Job, token: &Arc<CancellationToken>) -> Result<TaskOutcome, DentalflowError> {
        let machine = self.ctx.machine();

        // a cancel committed between the claim and registration found no token
        let current = machine.get(job.id).await?;
        if current.status == JobStatus::Cancelled {
            token.cancel(current.error_message.unwrap_or_else(|| "cancelled".to_string()));
            info!("Job cancelled before the attempt started");
            return Ok(TaskOutcome::Cancelled);
        }

        let Some(handler) = self.ctx.handlers().get(&job.job_type) else {
            let message = format!("no handler registered for job type {}", job.job_type);
            return self.settle(job.id, &message, false).await;
        };

        let job_ctx = JobContext::new(&job, Arc::clone(token), Arc::clone(machine));
        let heartbeat = spawn_heartbeat(
            job_ctx.clone(),
            self.ctx.settings().worker.heartbeat_interval(),
        );
        let limit = self.ctx.settings().worker.task_time_limit();
        let result = tokio::time::timeout(limit, handler.handle(&job, &job_ctx)).await;
        heartbeat.abort();

        let outcome = result.unwrap_or_else(|_| {
            warn!(limit_secs = limit.as_secs(), "Job exceeded its time limit");
            token.cancel("time limit exceeded");
            Outcome::Retryable(format!("job exceeded its time limit of {}s", limit.as_secs()))
        });

        if token.is_cancelled() && machine.get(job.id).await?.status == JobStatus::Cancelled {
            info!("Job attempt stopped after cancellation");
            return Ok(TaskOutcome::Cancelled);
        }

        match outcome {
            Outcome::Ok(value) => match machine.complete(job.id, value).await {
                Ok(_) => Ok(TaskOutcome::Succeeded),
                Err(JobError::InvalidTransition(err)) if err.from == JobStatus::Cancelled => {
                    Ok(TaskOutcome::Cancelled)
                }
                Err(err) => Err(err.into()),
            },
            Outcome::Retryable(message) => self.settle(job.id, &message, true).await,
            Outcome::Fatal(message) => self.settle(job.id, &message, false).await,
        }
    }

    async fn settle(&self, id: JobId, message: &str, retryable: bool) -> Result<TaskOutcome, DentalflowError> {
        let result = settle_failure(
            self.ctx.machine(),
            self.ctx.broker().as_ref(),
            self.ctx.retry_policy(),
            id,
            message,
            retryable,
        )
        .await;
        match result {
            Err(DentalflowError::Job(JobError::InvalidTransition(err))) if err.from == JobStatus::Cancelled => {
                Ok(TaskOutcome::Cancelled)
            }
            other => other,
        }
    }
}

/// Refreshes the job's heartbeat every `interval` until aborted.
fn spawn_heartbeat(ctx: JobContext, interval: Duration) -> JoinHandle<()> {
    tokio::spawn(
        async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match ctx.heartbeat().await {
                    Ok(()) => {}
                    Err(JobError::InvalidTransition(_) | JobError::NotFound(_)) => break,
                    Err(err) => warn!(error = %err, "Heartbeat failed"),
                }
            }
        }
        .in_current_span(),
    )
}
