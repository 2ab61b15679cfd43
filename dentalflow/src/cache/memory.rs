//! In-memory cache store.

use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::time::Duration;
use tracing::debug;

use super::{CacheArtifact, CacheEntry, CacheStats, CacheStore, HitCounters, PutOutcome, SweepReport};
use crate::errors::CacheError;
use crate::utils::{now_utc, Timestamp};

/// Cache store backed by a sharded concurrent map.
///
/// Per-key atomicity comes from the map's entry API; there is no global lock.
#[derive(Debug, Default)]
pub struct InMemoryCacheStore {
    entries: DashMap<String, CacheEntry>,
    counters: HitCounters,
}

impl InMemoryCacheStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, live or expired.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if nothing is stored.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl CacheStore for InMemoryCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = now_utc();
        let found = match self.entries.get_mut(key) {
            Some(mut entry) if !entry.is_expired_at(now) => {
                entry.touch(now);
                Some(entry.value().clone())
            }
            _ => None,
        };

        if found.is_some() {
            self.counters.hit();
        } else {
            self.counters.miss();
        }
        Ok(found)
    }

    async fn put(
        &self,
        key: &str,
        artifact: CacheArtifact,
        ttl: Duration,
    ) -> Result<PutOutcome, CacheError> {
        let now = now_utc();
        match self.entries.entry(key.to_string()) {
            Entry::Occupied(existing) if !existing.get().is_expired_at(now) => {
                debug!(key, "Cache put discarded, live entry exists");
                Ok(PutOutcome::Discarded)
            }
            Entry::Occupied(mut expired) => {
                expired.insert(CacheEntry::new(key, artifact, ttl, now));
                Ok(PutOutcome::Stored)
            }
            Entry::Vacant(slot) => {
                slot.insert(CacheEntry::new(key, artifact, ttl, now));
                Ok(PutOutcome::Stored)
            }
        }
    }

    async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        Ok(self.entries.remove(key).is_some())
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (hits, misses) = self.counters.snapshot();
        let bytes = self.entries.iter().map(|e| e.size_bytes()).sum();
        Ok(CacheStats {
            hits,
            misses,
            entries: self.entries.len() as u64,
            bytes,
        })
    }

    async fn sweep(&self, now: Timestamp, grace: Duration) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport {
            scanned: self.entries.len() as u64,
            ..SweepReport::default()
        };
        self.entries.retain(|_, entry| {
            if entry.is_evictable_at(now, grace) {
                report.removed += 1;
                report.bytes_freed += entry.size_bytes();
                false
            } else {
                true
            }
        });
        Ok(report)
    }
}
