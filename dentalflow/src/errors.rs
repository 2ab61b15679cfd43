//! Error types for the dentalflow engine.
//!
//! Each failure family has its own type so callers can match on what went
//! wrong. [`DentalflowError`] wraps all of them, and [`DentalflowError::class`]
//! reduces any error to the [`ErrorClass`] the task executor uses to pick a
//! retry policy.

use serde::{Deserialize, Serialize};
use std::fmt;
use thiserror::Error;

use crate::core::{JobId, JobStatus};
use crate::pipeline::{AlgorithmKind, StepKind};

/// How an error should be treated by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Worth retrying with backoff.
    Transient,
    /// Retrying cannot help; fail the job permanently.
    Terminal,
    /// State-machine misuse. Fatal and logged.
    Programming,
}

impl ErrorClass {
    /// Returns true if the error should follow the retry/backoff path.
    #[must_use]
    pub fn is_retryable(self) -> bool {
        matches!(self, Self::Transient)
    }
}

impl fmt::Display for ErrorClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Transient => write!(f, "transient"),
            Self::Terminal => write!(f, "terminal"),
            Self::Programming => write!(f, "programming"),
        }
    }
}

/// The umbrella error type for dentalflow operations.
#[derive(Debug, Error)]
pub enum DentalflowError {
    /// Invalid pipeline or step configuration.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// An algorithm failed inside a step.
    #[error(transparent)]
    StepExecution(#[from] StepExecutionError),

    /// Broker, cache or store unavailability.
    #[error("Transient infrastructure error: {0}")]
    TransientInfrastructure(String),

    /// State machine misuse.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// Stored cache artifact could not be read back.
    #[error(transparent)]
    CacheCorruption(#[from] CacheCorruptionError),

    /// Job store operation failed.
    #[error(transparent)]
    Job(#[from] JobError),

    /// Pipeline execution failed.
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    /// Engine settings could not be loaded.
    #[error(transparent)]
    Settings(#[from] SettingsError),
}

impl DentalflowError {
    /// Classifies the error for the retry policy.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) | Self::Settings(_) => ErrorClass::Terminal,
            Self::StepExecution(err) => err.class(),
            Self::TransientInfrastructure(_) | Self::CacheCorruption(_) => ErrorClass::Transient,
            Self::InvalidTransition(_) => ErrorClass::Programming,
            Self::Job(err) => err.class(),
            Self::Pipeline(err) => err.class(),
        }
    }
}

/// Invalid pipeline configuration or step parameters.
///
/// Raised at submission or registration time, never retried.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("Invalid configuration: {message}{}", location_suffix(.step.as_deref(), .field.as_deref()))]
pub struct ConfigurationError {
    /// Human-readable message.
    pub message: String,
    /// The step the error refers to, if any.
    pub step: Option<String>,
    /// The offending parameter or field, if any.
    pub field: Option<String>,
}

impl ConfigurationError {
    /// Creates a new configuration error.
    #[must_use]
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            step: None,
            field: None,
        }
    }

    /// Attaches the step the error refers to.
    #[must_use]
    pub fn with_step(mut self, step: impl Into<String>) -> Self {
        self.step = Some(step.into());
        self
    }

    /// Attaches the offending field.
    #[must_use]
    pub fn with_field(mut self, field: impl Into<String>) -> Self {
        self.field = Some(field.into());
        self
    }
}

fn location_suffix(step: Option<&str>, field: Option<&str>) -> String {
    match (step, field) {
        (Some(step), Some(field)) => format!(" (step: {step}, field: {field})"),
        (Some(step), None) => format!(" (step: {step})"),
        (None, Some(field)) => format!(" (field: {field})"),
        (None, None) => String::new(),
    }
}

/// A pipeline step failed.
#[derive(Debug, Clone, Error)]
#[error("Step {step_kind}/{algorithm_kind} failed: {cause}")]
pub struct StepExecutionError {
    /// The failing step.
    pub step_kind: StepKind,
    /// The algorithm the step was bound to.
    pub algorithm_kind: AlgorithmKind,
    /// Underlying cause.
    pub cause: String,
    /// Whether the job may be retried.
    pub retryable: bool,
}

impl StepExecutionError {
    /// Creates a retryable step failure.
    #[must_use]
    pub fn new(step_kind: StepKind, algorithm_kind: AlgorithmKind, cause: impl Into<String>) -> Self {
        Self {
            step_kind,
            algorithm_kind,
            cause: cause.into(),
            retryable: true,
        }
    }

    /// Marks the failure as fatal.
    #[must_use]
    pub fn fatal(mut self) -> Self {
        self.retryable = false;
        self
    }

    /// Classifies the failure.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        if self.retryable {
            ErrorClass::Transient
        } else {
            ErrorClass::Terminal
        }
    }
}

/// An operation was attempted from a state that does not allow it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Invalid transition for job {job_id}: cannot {operation} from {from}")]
pub struct InvalidTransition {
    /// The job.
    pub job_id: JobId,
    /// The status the job was in.
    pub from: JobStatus,
    /// The attempted operation.
    pub operation: &'static str,
}

/// A stored cache artifact is unreadable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Cache entry {key} is corrupt: {reason}")]
pub struct CacheCorruptionError {
    /// Cache key of the entry.
    pub key: String,
    /// What was wrong with it.
    pub reason: String,
}

impl CacheCorruptionError {
    /// Creates a new corruption error.
    #[must_use]
    pub fn new(key: impl Into<String>, reason: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            reason: reason.into(),
        }
    }
}

/// Errors raised by the job store backends.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    /// The backend could not be reached.
    #[error("Job store unavailable: {0}")]
    Unavailable(String),

    /// A record could not be encoded or decoded.
    #[error("Job store serialization error: {0}")]
    Serialization(String),

    /// Database-level failure.
    #[error("Job store database error: {0}")]
    Database(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(err.to_string())
    }
}

#[cfg(feature = "sqlite")]
impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                Self::Unavailable(err.to_string())
            }
            other => Self::Database(other.to_string()),
        }
    }
}

/// Errors raised by job state machine operations.
#[derive(Debug, Clone, Error)]
pub enum JobError {
    /// No job with the given id exists.
    #[error("Job not found: {0}")]
    NotFound(JobId),

    /// The job was not pending when a worker tried to claim it.
    #[error("Job {job_id} already claimed (status: {status})")]
    AlreadyClaimed {
        /// The job.
        job_id: JobId,
        /// Status observed at claim time.
        status: JobStatus,
    },

    /// The operation is not legal from the job's current status.
    #[error(transparent)]
    InvalidTransition(#[from] InvalidTransition),

    /// A progress report went backwards.
    #[error("Progress for job {job_id} cannot go from {current} to {requested}")]
    ProgressRegression {
        /// The job.
        job_id: JobId,
        /// Stored progress.
        current: u8,
        /// Rejected value.
        requested: u8,
    },

    /// The job has used up its retry budget.
    #[error("Job {job_id} exhausted its retries ({retry_count}/{max_retries})")]
    RetryLimitExceeded {
        /// The job.
        job_id: JobId,
        /// Retries already performed.
        retry_count: u32,
        /// Retry budget.
        max_retries: u32,
    },

    /// Submission was rejected.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// Backend failure.
    #[error(transparent)]
    Store(#[from] StoreError),
}

impl JobError {
    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Store(_) => ErrorClass::Transient,
            Self::Configuration(_) | Self::RetryLimitExceeded { .. } => ErrorClass::Terminal,
            Self::NotFound(_)
            | Self::AlreadyClaimed { .. }
            | Self::InvalidTransition(_)
            | Self::ProgressRegression { .. } => ErrorClass::Programming,
        }
    }
}

/// Errors raised by cache stores.
#[derive(Debug, Clone, Error)]
pub enum CacheError {
    /// Stored entry is unreadable.
    #[error(transparent)]
    Corrupt(#[from] CacheCorruptionError),

    /// The backing medium is unavailable.
    #[error("Cache unavailable: {0}")]
    Unavailable(String),

    /// The key is not a hex digest.
    #[error("Invalid cache key: {0}")]
    InvalidKey(String),
}

impl From<std::io::Error> for CacheError {
    fn from(err: std::io::Error) -> Self {
        Self::Unavailable(err.to_string())
    }
}

/// Errors raised by the pipeline executor.
#[derive(Debug, Clone, Error)]
pub enum PipelineError {
    /// The pipeline configuration is unusable.
    #[error(transparent)]
    Configuration(#[from] ConfigurationError),

    /// A step failed; prior step outputs are discarded.
    #[error(transparent)]
    Step(#[from] StepExecutionError),

    /// The cancellation token tripped at a step boundary.
    #[error("Pipeline cancelled after {completed_steps} step(s): {reason}")]
    Cancelled {
        /// Reason recorded on the token.
        reason: String,
        /// Steps finished before the boundary check.
        completed_steps: usize,
    },

    /// Cache infrastructure failed while reading an entry.
    #[error(transparent)]
    Cache(#[from] CacheError),
}

impl PipelineError {
    /// Classifies the error.
    #[must_use]
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Configuration(_) => ErrorClass::Terminal,
            Self::Step(err) => err.class(),
            Self::Cancelled { .. } => ErrorClass::Transient,
            Self::Cache(CacheError::InvalidKey(_)) => ErrorClass::Programming,
            Self::Cache(_) => ErrorClass::Transient,
        }
    }
}

/// Errors raised while loading [`crate::config::EngineConfig`].
#[derive(Debug, Error)]
pub enum SettingsError {
    /// The settings file could not be read.
    #[error("Failed to read settings: {0}")]
    Io(#[from] std::io::Error),

    /// The settings document is malformed.
    #[error("Failed to parse settings: {0}")]
    Parse(#[from] serde_json::Error),

    /// An environment override could not be parsed.
    #[error("Invalid value for {var}: {value}")]
    InvalidEnv {
        /// Variable name.
        var: String,
        /// Raw value.
        value: String,
    },

    /// The settings are inconsistent.
    #[error("Invalid settings: {0}")]
    Invalid(String),

    /// The tracing subscriber could not be installed.
    #[error("Failed to initialize logging: {0}")]
    Logging(String),
}
