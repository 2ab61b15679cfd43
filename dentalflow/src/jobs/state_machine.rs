//! Job state machine.
//!
//! Every operation loads the job, checks the transition, and writes the
//! result back with a compare-and-swap on `(id, version)`. A lost race
//! reloads and re-evaluates, so exactly one of several concurrent claims
//! succeeds and the others observe `processing`.

use futures::stream::{self, StreamExt};
use serde_json::Value;
use std::sync::Arc;
use tracing::{debug, error, info};

use super::{InsertOutcome, JobFilter, JobStore};
use crate::cancellation::CancellationRegistry;
use crate::core::{Job, JobId, JobStatus, NewJob};
use crate::errors::{ConfigurationError, InvalidTransition, JobError};
use crate::events::{EventSink, JobEvent, JobEventKind, NoOpEventSink, ProgressHub, ProgressStream};
use crate::utils::{now_utc, Timestamp};

/// Result of [`JobStateMachine::fail`].
#[derive(Debug, Clone, PartialEq)]
pub struct FailOutcome {
    /// The job after the transition.
    pub job: Job,
    /// True if the failure was retryable and budget remains.
    pub will_retry: bool,
}

enum Change {
    Applied,
    Unchanged,
}

/// Enforces legal job transitions and persists them.
pub struct JobStateMachine {
    store: Arc<dyn JobStore>,
    sink: Arc<dyn EventSink>,
    hub: Arc<ProgressHub>,
    cancellations: Arc<CancellationRegistry>,
}

impl std::fmt::Debug for JobStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobStateMachine")
            .field("hub", &self.hub)
            .field("cancellations", &self.cancellations)
            .finish_non_exhaustive()
    }
}

impl JobStateMachine {
    /// Creates a state machine over `store` with no event sink.
    #[must_use]
    pub fn new(store: Arc<dyn JobStore>) -> Self {
        Self {
            store,
            sink: Arc::new(NoOpEventSink),
            hub: Arc::new(ProgressHub::new()),
            cancellations: Arc::new(CancellationRegistry::new()),
        }
    }

    /// Sets the audit sink.
    #[must_use]
    pub fn with_event_sink(mut self, sink: Arc<dyn EventSink>) -> Self {
        self.sink = sink;
        self
    }

    /// Shares a progress hub.
    #[must_use]
    pub fn with_progress_hub(mut self, hub: Arc<ProgressHub>) -> Self {
        self.hub = hub;
        self
    }

    /// Shares a cancellation registry.
    #[must_use]
    pub fn with_cancellations(mut self, cancellations: Arc<CancellationRegistry>) -> Self {
        self.cancellations = cancellations;
        self
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<dyn JobStore> {
        &self.store
    }

    /// Tokens of running jobs.
    #[must_use]
    pub fn cancellations(&self) -> &Arc<CancellationRegistry> {
        &self.cancellations
    }

    /// Creates a pending job.
    pub async fn create(&self, new: NewJob) -> Result<Job, JobError> {
        Ok(self.create_outcome(new).await?.into_job())
    }

    /// Creates a pending job, reporting whether a job with the same request
    /// key already existed.
    pub async fn create_outcome(&self, new: NewJob) -> Result<InsertOutcome, JobError> {
        if new.job_type.trim().is_empty() {
            return Err(ConfigurationError::new("job_type must not be empty")
                .with_field("job_type")
                .into());
        }
        let outcome = self.store.insert(Job::from_new(new, now_utc())).await?;
        match &outcome {
            InsertOutcome::Inserted(job) => {
                info!(job_id = %job.id, job_type = %job.job_type, correlation_id = %job.correlation_id, "Job created");
                self.publish(JobEventKind::Created, job).await;
            }
            InsertOutcome::Existing(job) => {
                debug!(job_id = %job.id, "Request key already submitted, returning existing job");
            }
        }
        Ok(outcome)
    }

    /// Loads a job.
    pub async fn get(&self, id: JobId) -> Result<Job, JobError> {
        self.store.get(id).await?.ok_or(JobError::NotFound(id))
    }

    /// Lists jobs.
    pub async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, JobError> {
        Ok(self.store.list(filter).await?)
    }

    /// `pending -> processing`. Exactly one concurrent caller wins; the
    /// rest get [`JobError::AlreadyClaimed`].
    pub async fn claim(&self, id: JobId) -> Result<Job, JobError> {
        let job = self
            .transition(id, Some(JobEventKind::Claimed), |job, now| {
                if job.status != JobStatus::Pending {
                    return Err(JobError::AlreadyClaimed {
                        job_id: job.id,
                        status: job.status,
                    });
                }
                job.status = JobStatus::Processing;
                job.started_at = Some(now);
                job.heartbeat_at = Some(now);
                job.completed_at = None;
                Ok(Change::Applied)
            })
            .await?;
        info!(job_id = %id, attempt = job.retry_count, "Job claimed");
        Ok(job)
    }

    /// Records progress of a processing job.
    ///
    /// Values are clamped to 0..=100. Repeating the current value is a
    /// no-op; going backwards is rejected.
    pub async fn report_progress(&self, id: JobId, percent: i32) -> Result<Job, JobError> {
        let requested = u8::try_from(percent.clamp(0, 100)).unwrap_or(100);
        self.transition(id, Some(JobEventKind::Progress), |job, now| {
            require(job, JobStatus::Processing, "report_progress")?;
            if requested < job.progress {
                return Err(JobError::ProgressRegression {
                    job_id: job.id,
                    current: job.progress,
                    requested,
                });
            }
            if requested == job.progress {
                return Ok(Change::Unchanged);
            }
            job.progress = requested;
            job.heartbeat_at = Some(now);
            Ok(Change::Applied)
        })
        .await
    }

    /// Refreshes the liveness signal of a processing job.
    pub async fn heartbeat(&self, id: JobId) -> Result<Job, JobError> {
        self.transition(id, None, |job, now| {
            require(job, JobStatus::Processing, "heartbeat")?;
            job.heartbeat_at = Some(now);
            Ok(Change::Applied)
        })
        .await
    }

    /// `processing -> succeeded`.
    pub async fn complete(&self, id: JobId, result: Value) -> Result<Job, JobError> {
        let job = self
            .transition(id, Some(JobEventKind::Succeeded), |job, now| {
                require(job, JobStatus::Processing, "complete")?;
                job.status = JobStatus::Succeeded;
                job.progress = 100;
                job.result = Some(result.clone());
                job.error_message = None;
                job.retry_scheduled = false;
                job.completed_at = Some(now);
                Ok(Change::Applied)
            })
            .await?;
        info!(job_id = %id, "Job succeeded");
        Ok(job)
    }

    /// `processing -> failed`.
    ///
    /// `will_retry` is set when the failure is retryable and the job has
    /// retries left; the caller then requeues through [`Self::retry`].
    pub async fn fail(&self, id: JobId, error: impl Into<String>, retryable: bool) -> Result<FailOutcome, JobError> {
        let message = error.into();
        let job = self
            .transition(id, Some(JobEventKind::Failed), |job, now| {
                require(job, JobStatus::Processing, "fail")?;
                job.status = JobStatus::Failed;
                job.result = None;
                job.error_message = Some(message.clone());
                job.retry_scheduled = retryable && job.has_retries_left();
                job.completed_at = Some(now);
                Ok(Change::Applied)
            })
            .await?;
        let will_retry = job.retry_scheduled;
        info!(job_id = %id, retry_count = job.retry_count, will_retry, error = %message, "Job failed");
        Ok(FailOutcome { job, will_retry })
    }

    /// `failed -> pending`, consuming one retry.
    pub async fn retry(&self, id: JobId) -> Result<Job, JobError> {
        let job = self
            .transition(id, Some(JobEventKind::Requeued), |job, _now| {
                require(job, JobStatus::Failed, "retry")?;
                if !job.has_retries_left() {
                    return Err(JobError::RetryLimitExceeded {
                        job_id: job.id,
                        retry_count: job.retry_count,
                        max_retries: job.max_retries,
                    });
                }
                job.status = JobStatus::Pending;
                job.retry_count += 1;
                job.progress = 0;
                job.error_message = None;
                job.retry_scheduled = false;
                job.started_at = None;
                job.heartbeat_at = None;
                job.completed_at = None;
                Ok(Change::Applied)
            })
            .await?;
        info!(job_id = %id, retry_count = job.retry_count, "Job requeued");
        Ok(job)
    }

    /// `pending | processing -> cancelled`.
    ///
    /// A processing job's token is tripped; the worker stops at its next
    /// step boundary.
    pub async fn cancel(&self, id: JobId, reason: impl Into<String>) -> Result<Job, JobError> {
        let reason = reason.into();
        let job = self
            .transition(id, Some(JobEventKind::Cancelled), |job, now| {
                if !job.status.is_cancellable() {
                    return Err(invalid(job, "cancel"));
                }
                job.status = JobStatus::Cancelled;
                job.result = None;
                job.error_message = Some(reason.clone());
                job.retry_scheduled = false;
                job.completed_at = Some(now);
                Ok(Change::Applied)
            })
            .await?;
        if self.cancellations.cancel(&id, reason.clone()) {
            debug!(job_id = %id, "Tripped cancellation token of running job");
        }
        info!(job_id = %id, %reason, "Job cancelled");
        Ok(job)
    }

    /// Records that a job was routed to the dead-letter channel.
    pub async fn record_dead_letter(&self, job: &Job, reason: &str) {
        error!(
            job_id = %job.id,
            correlation_id = %job.correlation_id,
            retry_count = job.retry_count,
            %reason,
            "Job dead-lettered"
        );
        let event = JobEvent::from_job(JobEventKind::DeadLettered, job).with_message(reason);
        self.sink.emit(&event).await;
    }

    /// Streams the job's events in order, ending after the terminal one.
    ///
    /// A job that is already final yields a single snapshot.
    pub async fn subscribe(&self, id: JobId) -> Result<ProgressStream, JobError> {
        let receiver = self.hub.register(id);
        let job = match self.get(id).await {
            Ok(job) => job,
            Err(err) => {
                drop(receiver);
                self.hub.prune(id);
                return Err(err);
            }
        };
        if job.is_final() {
            drop(receiver);
            self.hub.prune(id);
            return Ok(stream::once(async move { JobEvent::snapshot(&job) }).boxed());
        }
        Ok(receiver.boxed())
    }

    async fn transition<F>(&self, id: JobId, kind: Option<JobEventKind>, mut apply: F) -> Result<Job, JobError>
    where
        F: FnMut(&mut Job, Timestamp) -> Result<Change, JobError> + Send,
    {
        loop {
            let current = self.get(id).await?;
            let mut next = current.clone();
            let now = now_utc();
            match apply(&mut next, now) {
                Ok(Change::Applied) => {}
                Ok(Change::Unchanged) => return Ok(current),
                Err(err) => {
                    if matches!(err, JobError::InvalidTransition(_)) {
                        error!(job_id = %id, error = %err, "Rejected job transition");
                    }
                    return Err(err);
                }
            }
            next.version = current.version + 1;
            next.updated_at = now;

            if self.store.compare_and_swap(current.version, &next).await? {
                if let Some(kind) = kind {
                    self.publish(kind, &next).await;
                }
                return Ok(next);
            }
            debug!(job_id = %id, version = current.version, "Lost update race, re-evaluating");
        }
    }

    async fn publish(&self, kind: JobEventKind, job: &Job) {
        let event = JobEvent::from_job(kind, job);
        self.sink.emit(&event).await;
        self.hub.publish(&event);
    }
}

fn invalid(job: &Job, operation: &'static str) -> JobError {
    InvalidTransition {
        job_id: job.id,
        from: job.status,
        operation,
    }
    .into()
}

fn require(job: &Job, status: JobStatus, operation: &'static str) -> Result<(), JobError> {
    if job.status == status {
        Ok(())
    } else {
        Err(invalid(job, operation))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::CollectingEventSink;
    use crate::jobs::InMemoryJobStore;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn machine() -> (JobStateMachine, Arc<CollectingEventSink>) {
        let sink = Arc::new(CollectingEventSink::new());
        let machine = JobStateMachine::new(Arc::new(InMemoryJobStore::new())).with_event_sink(sink.clone());
        (machine, sink)
    }

    async fn processing(machine: &JobStateMachine, new: NewJob) -> Job {
        let job = machine.create(new).await.unwrap();
        machine.claim(job.id).await.unwrap()
    }

    #[tokio::test]
    async fn test_happy_path() {
        let (machine, sink) = machine();
        let job = machine.create(NewJob::new("pipeline").with_priority(2)).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.version, 0);

        let job = machine.claim(job.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert!(job.started_at.is_some());

        machine.report_progress(job.id, 40).await.unwrap();
        let done = machine.complete(job.id, json!({"ok": true})).await.unwrap();
        assert_eq!(done.status, JobStatus::Succeeded);
        assert_eq!(done.progress, 100);
        assert_eq!(done.result, Some(json!({"ok": true})));
        assert!(done.error_message.is_none());
        assert_eq!(done.version, 3);

        assert_eq!(
            sink.kinds_for(job.id),
            vec![
                JobEventKind::Created,
                JobEventKind::Claimed,
                JobEventKind::Progress,
                JobEventKind::Succeeded
            ]
        );
        assert!(sink.events().iter().all(|e| e.correlation_id == job.correlation_id));
    }

    #[tokio::test]
    async fn test_empty_job_type_rejected() {
        let (machine, _) = machine();
        let err = machine.create(NewJob::new("  ")).await.unwrap_err();
        assert!(matches!(err, JobError::Configuration(_)));
    }

    #[tokio::test]
    async fn test_request_key_returns_existing() {
        let (machine, sink) = machine();
        let first = machine
            .create(NewJob::new("pipeline").with_request_key("k"))
            .await
            .unwrap();
        let outcome = machine
            .create_outcome(NewJob::new("pipeline").with_request_key("k"))
            .await
            .unwrap();
        assert!(!outcome.is_inserted());
        assert_eq!(outcome.into_job().id, first.id);
        assert_eq!(sink.len(), 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 8)]
    async fn test_concurrent_claim_exactly_one_wins() {
        let (machine, _) = machine();
        let machine = Arc::new(machine);
        let job = machine.create(NewJob::new("pipeline")).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..32 {
            let machine = Arc::clone(&machine);
            handles.push(tokio::spawn(async move { machine.claim(job.id).await }));
        }

        let mut won = 0;
        let mut already_claimed = 0;
        for handle in handles {
            match handle.await.unwrap() {
                Ok(_) => won += 1,
                Err(JobError::AlreadyClaimed { status, .. }) => {
                    assert_eq!(status, JobStatus::Processing);
                    already_claimed += 1;
                }
                Err(other) => panic!("unexpected error: {other}"),
            }
        }
        assert_eq!(won, 1);
        assert_eq!(already_claimed, 31);
    }

    #[tokio::test]
    async fn test_progress_monotonic_and_clamped() {
        let (machine, sink) = machine();
        let job = processing(&machine, NewJob::new("pipeline")).await;

        machine.report_progress(job.id, 10).await.unwrap();
        let err = machine.report_progress(job.id, 5).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::ProgressRegression { current: 10, requested: 5, .. }
        ));

        let before = sink.len();
        let same = machine.report_progress(job.id, 10).await.unwrap();
        assert_eq!(same.progress, 10);
        assert_eq!(sink.len(), before);

        let clamped = machine.report_progress(job.id, 250).await.unwrap();
        assert_eq!(clamped.progress, 100);
    }

    #[tokio::test]
    async fn test_progress_requires_processing() {
        let (machine, _) = machine();
        let job = machine.create(NewJob::new("pipeline")).await.unwrap();
        let err = machine.report_progress(job.id, 10).await.unwrap_err();
        assert!(matches!(err, JobError::InvalidTransition(_)));
    }

    #[tokio::test]
    async fn test_fail_and_retry_until_exhausted() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline").with_max_retries(1)).await;
        machine.report_progress(job.id, 30).await.unwrap();

        let first = machine.fail(job.id, "boom", true).await.unwrap();
        assert!(first.will_retry);
        assert_eq!(first.job.retry_count, 0);
        assert!(!first.job.is_final());

        let requeued = machine.retry(job.id).await.unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.progress, 0);
        assert!(requeued.error_message.is_none());

        machine.claim(job.id).await.unwrap();
        let second = machine.fail(job.id, "boom again", true).await.unwrap();
        assert!(!second.will_retry);
        assert_eq!(second.job.retry_count, 1);
        assert!(second.job.is_final());
        assert_eq!(second.job.error_message.as_deref(), Some("boom again"));

        let err = machine.retry(job.id).await.unwrap_err();
        assert!(matches!(
            err,
            JobError::RetryLimitExceeded { retry_count: 1, max_retries: 1, .. }
        ));
    }

    #[tokio::test]
    async fn test_non_retryable_failure_not_scheduled() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline")).await;
        let outcome = machine.fail(job.id, "bad config", false).await.unwrap();
        assert!(!outcome.will_retry);
        assert!(outcome.job.result.is_none());
    }

    #[tokio::test]
    async fn test_terminal_jobs_never_transition() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline")).await;
        machine.complete(job.id, json!(1)).await.unwrap();

        assert!(matches!(machine.claim(job.id).await, Err(JobError::AlreadyClaimed { .. })));
        assert!(matches!(machine.fail(job.id, "x", true).await, Err(JobError::InvalidTransition(_))));
        assert!(matches!(machine.cancel(job.id, "x").await, Err(JobError::InvalidTransition(_))));
        assert!(matches!(machine.retry(job.id).await, Err(JobError::InvalidTransition(_))));
        assert!(matches!(
            machine.complete(job.id, json!(2)).await,
            Err(JobError::InvalidTransition(_))
        ));
    }

    #[tokio::test]
    async fn test_cancel_trips_registered_token() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline")).await;
        let token = machine.cancellations().register(job.id);

        let cancelled = machine.cancel(job.id, "user request").await.unwrap();
        assert_eq!(cancelled.status, JobStatus::Cancelled);
        assert!(token.is_cancelled());
        assert_eq!(token.reason().as_deref(), Some("user request"));
        assert!(matches!(machine.heartbeat(job.id).await, Err(JobError::InvalidTransition(_))));
    }

    #[tokio::test]
    async fn test_cancel_pending() {
        let (machine, _) = machine();
        let job = machine.create(NewJob::new("pipeline")).await.unwrap();
        let cancelled = machine.cancel(job.id, "no longer needed").await.unwrap();
        assert!(cancelled.is_final());
        assert!(matches!(machine.claim(job.id).await, Err(JobError::AlreadyClaimed { .. })));
    }

    #[tokio::test]
    async fn test_unknown_job() {
        let (machine, _) = machine();
        let id = JobId::new();
        assert!(matches!(machine.get(id).await, Err(JobError::NotFound(_))));
        assert!(matches!(machine.claim(id).await, Err(JobError::NotFound(_))));
        assert!(machine.subscribe(id).await.is_err());
    }

    #[tokio::test]
    async fn test_subscribe_streams_until_terminal() {
        let (machine, _) = machine();
        let job = machine.create(NewJob::new("pipeline")).await.unwrap();
        let stream = machine.subscribe(job.id).await.unwrap();

        machine.claim(job.id).await.unwrap();
        machine.report_progress(job.id, 50).await.unwrap();
        machine.complete(job.id, json!("done")).await.unwrap();

        let events: Vec<JobEvent> = stream.collect().await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![JobEventKind::Claimed, JobEventKind::Progress, JobEventKind::Succeeded]
        );
        let progress: Vec<_> = events.iter().map(|e| e.progress).collect();
        assert_eq!(progress, vec![0, 50, 100]);
    }

    #[tokio::test]
    async fn test_subscribe_final_job_yields_snapshot() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline")).await;
        machine.complete(job.id, json!(null)).await.unwrap();

        let events: Vec<JobEvent> = machine.subscribe(job.id).await.unwrap().collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, JobEventKind::Snapshot);
        assert_eq!(events[0].status, JobStatus::Succeeded);
        assert!(events[0].terminal);
    }

    #[tokio::test]
    async fn test_subscribe_survives_retry() {
        let (machine, _) = machine();
        let job = processing(&machine, NewJob::new("pipeline").with_max_retries(1)).await;
        let stream = machine.subscribe(job.id).await.unwrap();

        machine.fail(job.id, "flaky", true).await.unwrap();
        machine.retry(job.id).await.unwrap();
        machine.claim(job.id).await.unwrap();
        machine.fail(job.id, "flaky", true).await.unwrap();

        let kinds: Vec<_> = stream.map(|e| e.kind).collect().await;
        assert_eq!(
            kinds,
            vec![
                JobEventKind::Failed,
                JobEventKind::Requeued,
                JobEventKind::Claimed,
                JobEventKind::Failed
            ]
        );
    }
}
