//! Per-job progress streams.

use dashmap::DashMap;
use futures::channel::mpsc::{unbounded, UnboundedReceiver, UnboundedSender};
use futures::stream::BoxStream;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::{Job, JobId, JobStatus};
use crate::utils::{now_utc, Timestamp};

/// What happened to a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobEventKind {
    /// Submitted in `pending`.
    Created,
    /// Claimed by a worker.
    Claimed,
    /// Progress advanced.
    Progress,
    /// Finished with a result.
    Succeeded,
    /// An attempt failed.
    Failed,
    /// Returned to `pending` for another attempt.
    Requeued,
    /// Cancelled on request.
    Cancelled,
    /// Routed to the dead-letter channel.
    DeadLettered,
    /// Current state, sent to late subscribers.
    Snapshot,
}

impl JobEventKind {
    /// Returns the wire name of the kind.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Created => "job.created",
            Self::Claimed => "job.claimed",
            Self::Progress => "job.progress",
            Self::Succeeded => "job.succeeded",
            Self::Failed => "job.failed",
            Self::Requeued => "job.requeued",
            Self::Cancelled => "job.cancelled",
            Self::DeadLettered => "job.dead_lettered",
            Self::Snapshot => "job.snapshot",
        }
    }
}

impl fmt::Display for JobEventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A progress or audit event for one job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    /// The job.
    pub job_id: JobId,
    /// Correlation id of the job.
    pub correlation_id: String,
    /// What happened.
    pub kind: JobEventKind,
    /// Status after the event.
    pub status: JobStatus,
    /// Progress after the event.
    pub progress: u8,
    /// Retries consumed.
    pub retry_count: u32,
    /// Job version after the event.
    pub version: u64,
    /// True if the job will not change again.
    pub terminal: bool,
    /// Error or reason text.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// When the event was produced.
    pub at: Timestamp,
}

impl JobEvent {
    /// Builds an event describing `job` after a transition.
    #[must_use]
    pub fn from_job(kind: JobEventKind, job: &Job) -> Self {
        Self {
            job_id: job.id,
            correlation_id: job.correlation_id.clone(),
            kind,
            status: job.status,
            progress: job.progress,
            retry_count: job.retry_count,
            version: job.version,
            terminal: job.is_final(),
            message: job.error_message.clone(),
            at: now_utc(),
        }
    }

    /// Builds a snapshot event for a late subscriber.
    #[must_use]
    pub fn snapshot(job: &Job) -> Self {
        Self::from_job(JobEventKind::Snapshot, job)
    }

    /// Sets the message.
    #[must_use]
    pub fn with_message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }
}

/// An ordered stream of events for one job.
pub type ProgressStream = BoxStream<'static, JobEvent>;

#[derive(Debug, Default)]
struct Channel {
    last_version: Option<u64>,
    senders: Vec<UnboundedSender<JobEvent>>,
}

/// Fans job events out to per-job subscribers.
///
/// Events older than the last one published for the same job are dropped,
/// so readers observe versions (and therefore progress) in non-decreasing
/// order. A terminal event closes every stream of its job.
#[derive(Debug, Default)]
pub struct ProgressHub {
    channels: DashMap<JobId, Channel>,
}

impl ProgressHub {
    /// Creates an empty hub.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a subscriber for `job_id`.
    pub fn register(&self, job_id: JobId) -> UnboundedReceiver<JobEvent> {
        let (tx, rx) = unbounded();
        self.channels.entry(job_id).or_default().senders.push(tx);
        rx
    }

    /// Delivers an event to the job's subscribers.
    pub fn publish(&self, event: &JobEvent) {
        let Some(mut channel) = self.channels.get_mut(&event.job_id) else {
            return;
        };
        if channel.last_version.is_some_and(|v| event.version < v) {
            return;
        }
        channel.last_version = Some(event.version);
        channel
            .senders
            .retain(|tx| tx.unbounded_send(event.clone()).is_ok());
        if event.terminal {
            channel.senders.clear();
        }
        drop(channel);
        self.prune(event.job_id);
    }

    /// Forgets the job's channel once no live subscriber remains.
    pub fn prune(&self, job_id: JobId) {
        self.channels
            .remove_if(&job_id, |_, ch| ch.senders.iter().all(UnboundedSender::is_closed));
    }

    /// Number of live subscribers for a job.
    #[must_use]
    pub fn subscriber_count(&self, job_id: JobId) -> usize {
        self.channels.get(&job_id).map_or(0, |ch| {
            ch.senders.iter().filter(|tx| !tx.is_closed()).count()
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::NewJob;
    use futures::StreamExt;

    fn job() -> Job {
        Job::from_new(NewJob::new("pipeline"), now_utc())
    }

    fn at_version(job: &Job, kind: JobEventKind, version: u64, progress: u8) -> JobEvent {
        let mut job = job.clone();
        job.version = version;
        job.progress = progress;
        JobEvent::from_job(kind, &job)
    }

    #[tokio::test]
    async fn test_stream_ends_after_terminal_event() {
        let hub = ProgressHub::new();
        let mut job = job();
        let rx = hub.register(job.id);

        hub.publish(&at_version(&job, JobEventKind::Claimed, 1, 0));
        hub.publish(&at_version(&job, JobEventKind::Progress, 2, 40));
        job.status = JobStatus::Succeeded;
        hub.publish(&at_version(&job, JobEventKind::Succeeded, 3, 100));

        let events: Vec<JobEvent> = rx.collect().await;
        let kinds: Vec<_> = events.iter().map(|e| e.kind).collect();
        assert_eq!(
            kinds,
            vec![JobEventKind::Claimed, JobEventKind::Progress, JobEventKind::Succeeded]
        );
        assert!(events[2].terminal);
        assert_eq!(hub.subscriber_count(job.id), 0);
    }

    #[tokio::test]
    async fn test_stale_events_dropped() {
        let hub = ProgressHub::new();
        let job = job();
        let mut rx = hub.register(job.id);

        hub.publish(&at_version(&job, JobEventKind::Progress, 5, 50));
        hub.publish(&at_version(&job, JobEventKind::Progress, 4, 40));
        hub.publish(&at_version(&job, JobEventKind::Progress, 6, 60));

        assert_eq!(rx.next().await.map(|e| e.progress), Some(50));
        assert_eq!(rx.next().await.map(|e| e.progress), Some(60));
    }

    #[test]
    fn test_events_for_other_jobs_ignored() {
        let hub = ProgressHub::new();
        let watched = job();
        let other = job();
        let _rx = hub.register(watched.id);

        hub.publish(&JobEvent::from_job(JobEventKind::Created, &other));
        assert_eq!(hub.subscriber_count(watched.id), 1);
        assert_eq!(hub.subscriber_count(other.id), 0);
    }

    #[test]
    fn test_prune_after_drop() {
        let hub = ProgressHub::new();
        let job = job();
        let rx = hub.register(job.id);
        drop(rx);
        hub.prune(job.id);
        assert_eq!(hub.subscriber_count(job.id), 0);
    }

    #[test]
    fn test_kind_names() {
        assert_eq!(JobEventKind::DeadLettered.to_string(), "job.dead_lettered");
        assert_eq!(
            serde_json::to_string(&JobEventKind::Requeued).unwrap(),
            "\"requeued\""
        );
    }
}
