//! Explicit task outcome type.

use crate::errors::{DentalflowError, ErrorClass};

/// Result of running a job's operation.
///
/// Handlers return this instead of raising, so the task executor can apply
/// retry policy by matching on the variant.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome<T> {
    /// The operation succeeded.
    Ok(T),
    /// The operation failed but may succeed on another attempt.
    Retryable(String),
    /// The operation failed permanently.
    Fatal(String),
}

impl<T> Outcome<T> {
    /// Classifies an error into a failed outcome.
    #[must_use]
    pub fn from_error(err: &DentalflowError) -> Self {
        match err.class() {
            ErrorClass::Transient => Self::Retryable(err.to_string()),
            ErrorClass::Terminal | ErrorClass::Programming => Self::Fatal(err.to_string()),
        }
    }

    /// Converts a result, classifying the error side.
    pub fn from_result<E>(result: Result<T, E>) -> Self
    where
        E: Into<DentalflowError>,
    {
        match result {
            Ok(value) => Self::Ok(value),
            Err(err) => Self::from_error(&err.into()),
        }
    }

    /// Returns true for [`Outcome::Ok`].
    #[must_use]
    pub fn is_ok(&self) -> bool {
        matches!(self, Self::Ok(_))
    }

    /// Returns the error message for failed outcomes.
    #[must_use]
    pub fn error(&self) -> Option<&str> {
        match self {
            Self::Ok(_) => None,
            Self::Retryable(msg) | Self::Fatal(msg) => Some(msg),
        }
    }

    /// Maps the success value.
    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Outcome<U> {
        match self {
            Self::Ok(value) => Outcome::Ok(f(value)),
            Self::Retryable(msg) => Outcome::Retryable(msg),
            Self::Fatal(msg) => Outcome::Fatal(msg),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::{ConfigurationError, StepExecutionError};
    use crate::pipeline::{AlgorithmKind, StepKind};

    #[test]
    fn test_from_result_classifies() {
        let ok: Outcome<u8> = Outcome::from_result(Ok::<_, DentalflowError>(1));
        assert_eq!(ok, Outcome::Ok(1));

        let step = StepExecutionError::new(StepKind::Denoise, AlgorithmKind::GaussianFilter, "x");
        let retry: Outcome<u8> = Outcome::from_result(Err(step));
        assert!(matches!(retry, Outcome::Retryable(_)));

        let fatal: Outcome<u8> = Outcome::from_result(Err(ConfigurationError::new("bad")));
        assert!(matches!(fatal, Outcome::Fatal(_)));
        assert_eq!(fatal.error(), Some("Invalid configuration: bad"));
    }

    #[test]
    fn test_map() {
        assert_eq!(Outcome::Ok(2).map(|v| v * 2), Outcome::Ok(4));
        let failed: Outcome<i32> = Outcome::Fatal("boom".into());
        assert_eq!(failed.map(|v| v * 2), Outcome::Fatal("boom".into()));
    }
}
