//! Recovery of jobs abandoned by crashed workers.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn, Instrument};

use super::{JobFilter, JobStateMachine};
use crate::cancellation::CancellationToken;
use crate::core::JobStatus;
use crate::errors::{DentalflowError, JobError};
use crate::utils::{now_utc, Timestamp};
use crate::worker::{settle_failure, Broker, RetryPolicy, TaskOutcome, WorkItem};

/// Failure message recorded on jobs whose worker went silent.
pub const HEARTBEAT_LOST: &str = "worker heartbeat lost";

/// Counts from one liveness pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LivenessReport {
    /// Processing jobs found without a recent heartbeat.
    pub stale: usize,
    /// Stale jobs put back in the queue.
    pub requeued: usize,
    /// Stale jobs that had no retries left.
    pub dead_lettered: usize,
    /// Failed jobs whose scheduled retry was never carried out.
    pub redriven: usize,
}

/// Finds stale claims and stuck retries and puts them back in the queue.
pub struct LivenessSweep {
    machine: Arc<JobStateMachine>,
    broker: Arc<dyn Broker>,
    policy: RetryPolicy,
    stale_after: Duration,
}

impl std::fmt::Debug for LivenessSweep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LivenessSweep")
            .field("stale_after", &self.stale_after)
            .finish_non_exhaustive()
    }
}

impl LivenessSweep {
    /// Creates a sweep.
    #[must_use]
    pub fn new(
        machine: Arc<JobStateMachine>,
        broker: Arc<dyn Broker>,
        policy: RetryPolicy,
        stale_after: Duration,
    ) -> Self {
        Self {
            machine,
            broker,
            policy,
            stale_after,
        }
    }

    fn cutoff(&self, now: Timestamp) -> Timestamp {
        ChronoDuration::from_std(self.stale_after)
            .ok()
            .and_then(|d| now.checked_sub_signed(d))
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }

    /// Runs one pass as of `now`.
    pub async fn run_once(&self, now: Timestamp) -> Result<LivenessReport, DentalflowError> {
        let cutoff = self.cutoff(now);
        let mut report = LivenessReport::default();

        let stale = self
            .machine
            .list(
                &JobFilter::new()
                    .with_status(JobStatus::Processing)
                    .with_last_seen_before(cutoff),
            )
            .await?;
        for job in stale {
            let outcome = settle_failure(
                &self.machine,
                self.broker.as_ref(),
                &self.policy,
                job.id,
                HEARTBEAT_LOST,
                true,
            )
            .await;
            match outcome {
                Ok(TaskOutcome::Retrying { .. }) => {
                    report.stale += 1;
                    report.requeued += 1;
                }
                Ok(TaskOutcome::DeadLettered) => {
                    report.stale += 1;
                    report.dead_lettered += 1;
                }
                Ok(_) => report.stale += 1,
                Err(DentalflowError::Job(JobError::InvalidTransition(_) | JobError::NotFound(_))) => {
                    debug!(job_id = %job.id, "Stale job moved on before the sweep reached it");
                }
                Err(err) => return Err(err),
            }
        }

        let stuck = self
            .machine
            .list(
                &JobFilter::new()
                    .with_status(JobStatus::Failed)
                    .with_retry_scheduled(true),
            )
            .await?;
        for job in stuck.into_iter().filter(|job| job.updated_at < cutoff) {
            match self.machine.retry(job.id).await {
                Ok(requeued) => {
                    self.broker
                        .enqueue(WorkItem::from_job(&requeued), Duration::ZERO)
                        .await
                        .map_err(|err| DentalflowError::TransientInfrastructure(err.to_string()))?;
                    report.redriven += 1;
                }
                Err(JobError::InvalidTransition(_) | JobError::RetryLimitExceeded { .. }) => {
                    debug!(job_id = %job.id, "Scheduled retry already handled");
                }
                Err(err) => return Err(err.into()),
            }
        }

        if report != LivenessReport::default() {
            info!(
                stale = report.stale,
                requeued = report.requeued,
                dead_lettered = report.dead_lettered,
                redriven = report.redriven,
                "Liveness sweep recovered jobs"
            );
        }
        Ok(report)
    }

    /// Runs [`Self::run_once`] every `interval` until `token` is cancelled.
    pub fn spawn(self: Arc<Self>, interval: Duration, token: Arc<CancellationToken>) -> JoinHandle<()> {
        let span = tracing::info_span!("liveness_sweep", interval_secs = interval.as_secs());
        tokio::spawn(
            async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                loop {
                    tokio::select! {
                        () = token.cancelled() => break,
                        _ = ticker.tick() => {}
                    }
                    if let Err(err) = self.run_once(now_utc()).await {
                        warn!(error = %err, "Liveness sweep failed");
                    }
                }
            }
            .instrument(span),
        )
    }
}
