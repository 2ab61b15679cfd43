//! The job record and its submission builder.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use super::JobStatus;
use crate::utils::{generate_correlation_id, generate_uuid_v7, Timestamp};

/// Retry budget used when a submission does not specify one.
pub const DEFAULT_MAX_RETRIES: u32 = 3;

/// Opaque job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a fresh, time-ordered id.
    #[must_use]
    pub fn new() -> Self {
        Self(generate_uuid_v7())
    }

    /// Wraps an existing UUID.
    #[must_use]
    pub fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the underlying UUID.
    #[must_use]
    pub fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// Reference to an immutable pipeline version.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PipelineRef {
    /// Pipeline name.
    pub name: String,
    /// Semantic version.
    pub version: String,
}

impl PipelineRef {
    /// Creates a new reference.
    #[must_use]
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl fmt::Display for PipelineRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// A submission request. Turned into a [`Job`] by the state machine.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NewJob {
    /// Tag identifying the requested operation.
    pub job_type: String,
    /// Higher runs sooner.
    #[serde(default)]
    pub priority: i32,
    /// Opaque case reference.
    #[serde(default)]
    pub case_id: Option<String>,
    /// Opaque file reference.
    #[serde(default)]
    pub file_id: Option<String>,
    /// Operation-specific payload.
    #[serde(default)]
    pub parameters: Value,
    /// Pipeline to run, for pipeline jobs.
    #[serde(default)]
    pub pipeline: Option<PipelineRef>,
    /// Retry budget.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Correlation id propagated from the caller. Generated when absent.
    #[serde(default)]
    pub correlation_id: Option<String>,
    /// Idempotency key; resubmitting it returns the existing job.
    #[serde(default)]
    pub request_key: Option<String>,
}

fn default_max_retries() -> u32 {
    DEFAULT_MAX_RETRIES
}

impl NewJob {
    /// Creates a submission for the given job type.
    #[must_use]
    pub fn new(job_type: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            priority: 0,
            case_id: None,
            file_id: None,
            parameters: Value::Null,
            pipeline: None,
            max_retries: DEFAULT_MAX_RETRIES,
            correlation_id: None,
            request_key: None,
        }
    }

    /// Sets the priority.
    #[must_use]
    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    /// Sets the case reference.
    #[must_use]
    pub fn with_case_id(mut self, case_id: impl Into<String>) -> Self {
        self.case_id = Some(case_id.into());
        self
    }

    /// Sets the file reference.
    #[must_use]
    pub fn with_file_id(mut self, file_id: impl Into<String>) -> Self {
        self.file_id = Some(file_id.into());
        self
    }

    /// Sets the operation payload.
    #[must_use]
    pub fn with_parameters(mut self, parameters: Value) -> Self {
        self.parameters = parameters;
        self
    }

    /// Binds the job to a pipeline version.
    #[must_use]
    pub fn with_pipeline(mut self, pipeline: PipelineRef) -> Self {
        self.pipeline = Some(pipeline);
        self
    }

    /// Sets the retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the correlation id.
    #[must_use]
    pub fn with_correlation_id(mut self, correlation_id: impl Into<String>) -> Self {
        self.correlation_id = Some(correlation_id.into());
        self
    }

    /// Sets the idempotency key.
    #[must_use]
    pub fn with_request_key(mut self, request_key: impl Into<String>) -> Self {
        self.request_key = Some(request_key.into());
        self
    }
}

/// A durable unit of background work.
///
/// Jobs are only mutated through [`crate::jobs::JobStateMachine`]. Every
/// mutation bumps [`Job::version`], which the stores use for conditional
/// updates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    /// Unique id.
    pub id: JobId,
    /// Tag identifying the requested operation.
    pub job_type: String,
    /// Current status.
    pub status: JobStatus,
    /// Opaque case reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Opaque file reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file_id: Option<String>,
    /// Higher runs sooner.
    pub priority: i32,
    /// Percent complete, 0 to 100.
    pub progress: u8,
    /// Retries performed so far.
    pub retry_count: u32,
    /// Retry budget.
    pub max_retries: u32,
    /// Correlation id.
    pub correlation_id: String,
    /// Operation-specific payload.
    #[serde(default)]
    pub parameters: Value,
    /// Pipeline to run, for pipeline jobs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pipeline: Option<PipelineRef>,
    /// Result payload, set on success.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    /// Error message, set on failure or cancellation.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Idempotency key.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_key: Option<String>,
    /// True while a failed job waits for its requeue.
    #[serde(default)]
    pub retry_scheduled: bool,
    /// Optimistic-concurrency counter.
    pub version: u64,
    /// Creation time.
    pub created_at: Timestamp,
    /// Last mutation time.
    pub updated_at: Timestamp,
    /// When the current attempt was claimed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<Timestamp>,
    /// When the job last reached a terminal status.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<Timestamp>,
    /// Last liveness signal from the owning worker.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub heartbeat_at: Option<Timestamp>,
}

impl Job {
    /// Builds a pending job from a submission.
    #[must_use]
    pub fn from_new(new: NewJob, now: Timestamp) -> Self {
        Self {
            id: JobId::new(),
            job_type: new.job_type,
            status: JobStatus::Pending,
            case_id: new.case_id,
            file_id: new.file_id,
            priority: new.priority,
            progress: 0,
            retry_count: 0,
            max_retries: new.max_retries,
            correlation_id: new.correlation_id.unwrap_or_else(generate_correlation_id),
            parameters: new.parameters,
            pipeline: new.pipeline,
            result: None,
            error_message: None,
            request_key: new.request_key,
            retry_scheduled: false,
            version: 0,
            created_at: now,
            updated_at: now,
            started_at: None,
            completed_at: None,
            heartbeat_at: None,
        }
    }

    /// Returns true if another retry is allowed.
    #[must_use]
    pub fn has_retries_left(&self) -> bool {
        self.retry_count < self.max_retries
    }

    /// Returns true if the job will never change again.
    ///
    /// Failed jobs are final once no retry is pending.
    #[must_use]
    pub fn is_final(&self) -> bool {
        match self.status {
            JobStatus::Succeeded | JobStatus::Cancelled => true,
            JobStatus::Failed => !self.retry_scheduled,
            JobStatus::Pending | JobStatus::Processing => false,
        }
    }
}
