//! Job store trait and query filter.

use async_trait::async_trait;

use crate::core::{Job, JobId, JobStatus};
use crate::errors::StoreError;
use crate::utils::Timestamp;

/// Result of inserting a job.
#[derive(Debug, Clone, PartialEq)]
pub enum InsertOutcome {
    /// The job was stored.
    Inserted(Job),
    /// A job with the same request key already exists; it is returned
    /// unchanged.
    Existing(Job),
}

impl InsertOutcome {
    /// The stored job, new or existing.
    #[must_use]
    pub fn into_job(self) -> Job {
        match self {
            Self::Inserted(job) | Self::Existing(job) => job,
        }
    }

    /// Returns true if a new job was created.
    #[must_use]
    pub fn is_inserted(&self) -> bool {
        matches!(self, Self::Inserted(_))
    }
}

/// Selects jobs for [`JobStore::list`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Only jobs with this status.
    pub status: Option<JobStatus>,
    /// Only jobs of this type.
    pub job_type: Option<String>,
    /// Only jobs whose `retry_scheduled` flag matches.
    pub retry_scheduled: Option<bool>,
    /// Only jobs whose last liveness signal is older than this.
    pub last_seen_before: Option<Timestamp>,
    /// At most this many jobs.
    pub limit: Option<usize>,
}

impl JobFilter {
    /// Matches every job.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts to a status.
    #[must_use]
    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    /// Restricts to a job type.
    #[must_use]
    pub fn with_job_type(mut self, job_type: impl Into<String>) -> Self {
        self.job_type = Some(job_type.into());
        self
    }

    /// Restricts on the retry flag.
    #[must_use]
    pub fn with_retry_scheduled(mut self, scheduled: bool) -> Self {
        self.retry_scheduled = Some(scheduled);
        self
    }

    /// Restricts to jobs not seen since `cutoff`.
    #[must_use]
    pub fn with_last_seen_before(mut self, cutoff: Timestamp) -> Self {
        self.last_seen_before = Some(cutoff);
        self
    }

    /// Caps the result size.
    #[must_use]
    pub fn with_limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }

    /// Returns true if `job` passes every condition.
    #[must_use]
    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |s| job.status == s)
            && self.job_type.as_deref().map_or(true, |t| job.job_type == t)
            && self.retry_scheduled.map_or(true, |r| job.retry_scheduled == r)
            && self
                .last_seen_before
                .map_or(true, |cutoff| last_seen(job) < cutoff)
    }

    /// Sorts by creation order and applies the limit.
    pub(crate) fn finish(&self, mut jobs: Vec<Job>) -> Vec<Job> {
        jobs.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        if let Some(limit) = self.limit {
            jobs.truncate(limit);
        }
        jobs
    }
}

/// Most recent sign of life: heartbeat, then claim time, then last update.
#[must_use]
pub fn last_seen(job: &Job) -> Timestamp {
    job.heartbeat_at
        .or(job.started_at)
        .unwrap_or(job.updated_at)
}

/// Durable record of jobs; the single source of truth for job state.
///
/// Every mutation goes through [`JobStore::compare_and_swap`], which only
/// succeeds if the stored version still equals `expected_version`.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Stores a new job. A job whose `request_key` is already taken is not
    /// stored; the existing one is returned instead.
    async fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError>;

    /// Loads a job.
    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Replaces the stored job if its version is still `expected_version`.
    ///
    /// Returns false when another writer got there first or the job does
    /// not exist.
    async fn compare_and_swap(&self, expected_version: u64, job: &Job) -> Result<bool, StoreError>;

    /// Jobs matching `filter`, oldest first.
    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;

    /// Looks a job up by its idempotency key.
    async fn find_by_request_key(&self, request_key: &str) -> Result<Option<Job>, StoreError>;
}
