//! In-memory job store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use super::{InsertOutcome, JobFilter, JobStore};
use crate::core::{Job, JobId};
use crate::errors::StoreError;

/// A [`JobStore`] backed by concurrent maps.
///
/// Conditional updates are atomic per job under the map's shard lock.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: DashMap<JobId, Job>,
    request_keys: DashMap<String, JobId>,
}

impl InMemoryJobStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored jobs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    /// Returns true if no job is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    fn load(&self, id: JobId) -> Option<Job> {
        self.jobs.get(&id).map(|job| job.value().clone())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job: Job) -> Result<InsertOutcome, StoreError> {
        let Some(key) = job.request_key.clone() else {
            self.jobs.insert(job.id, job.clone());
            return Ok(InsertOutcome::Inserted(job));
        };

        match self.request_keys.entry(key) {
            Entry::Occupied(slot) => {
                let existing = self.load(*slot.get()).ok_or_else(|| {
                    StoreError::Database(format!("request key {} points at a missing job", slot.key()))
                })?;
                Ok(InsertOutcome::Existing(existing))
            }
            Entry::Vacant(slot) => {
                self.jobs.insert(job.id, job.clone());
                slot.insert(job.id);
                Ok(InsertOutcome::Inserted(job))
            }
        }
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self.load(id))
    }

    async fn compare_and_swap(&self, expected_version: u64, job: &Job) -> Result<bool, StoreError> {
        match self.jobs.get_mut(&job.id) {
            Some(mut current) if current.version == expected_version => {
                *current = job.clone();
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn list(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let jobs = self
            .jobs
            .iter()
            .filter(|job| filter.matches(job.value()))
            .map(|job| job.value().clone())
            .collect();
        Ok(filter.finish(jobs))
    }

    async fn find_by_request_key(&self, request_key: &str) -> Result<Option<Job>, StoreError> {
        Ok(self
            .request_keys
            .get(request_key)
            .and_then(|id| self.load(*id.value())))
    }
}
