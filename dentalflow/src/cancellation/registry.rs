//! Per-job cancellation tokens.

use dashmap::DashMap;
use std::sync::Arc;

use super::CancellationToken;
use crate::core::JobId;

/// Maps running jobs to their cancellation tokens.
///
/// The task executor registers a token once it has claimed a job and
/// releases it when the attempt ends. Cancel requests from elsewhere trip
/// the token so the pipeline stops at its next step boundary.
#[derive(Debug, Default)]
pub struct CancellationRegistry {
    tokens: DashMap<JobId, Arc<CancellationToken>>,
}

impl CancellationRegistry {
    /// Creates an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a fresh token for the job, replacing any previous one.
    ///
    /// Only the attempt that owns the claim may register.
    pub fn register(&self, job_id: JobId) -> Arc<CancellationToken> {
        let token = Arc::new(CancellationToken::new());
        self.tokens.insert(job_id, Arc::clone(&token));
        token
    }

    /// Trips the job's token. Returns false if the job has no live token.
    pub fn cancel(&self, job_id: &JobId, reason: impl Into<String>) -> bool {
        match self.tokens.get(job_id) {
            Some(token) => {
                token.cancel(reason);
                true
            }
            None => false,
        }
    }

    /// Returns the job's token.
    #[must_use]
    pub fn get(&self, job_id: &JobId) -> Option<Arc<CancellationToken>> {
        self.tokens.get(job_id).map(|t| Arc::clone(t.value()))
    }

    /// Drops the job's token only if it is still `token`.
    ///
    /// An attempt that finishes after a newer attempt registered leaves the
    /// newer token in place.
    pub fn release(&self, job_id: &JobId, token: &Arc<CancellationToken>) -> bool {
        self.tokens
            .remove_if(job_id, |_, current| Arc::ptr_eq(current, token))
            .is_some()
    }

    /// Number of live tokens.
    #[must_use]
    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    /// Returns true if no tokens are live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }
}
