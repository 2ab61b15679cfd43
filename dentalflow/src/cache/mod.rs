//! Content-addressable cache for step outputs.
//!
//! This module provides:
//! - The [`CacheStore`] trait and its entry/statistics types
//! - [`InMemoryCacheStore`], backed by a concurrent map
//! - [`FsCacheStore`], one self-describing file per key
//! - An eviction sweeper that honours a grace window past expiry

mod entry;
mod fs;
mod memory;
mod sweep;

pub use entry::{CacheArtifact, CacheEntry, CacheStats, PutOutcome, SweepReport};
pub use fs::FsCacheStore;
pub use memory::InMemoryCacheStore;
pub use sweep::{spawn_sweeper, SweepSettings};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use crate::errors::CacheError;
use crate::utils::Timestamp;

/// Storage for cached step artifacts.
///
/// Implementations must tolerate any number of concurrent callers. `put` is
/// first-writer-wins: once a live entry exists for a key, later writes are
/// discarded and reported as [`PutOutcome::Discarded`].
#[async_trait]
pub trait CacheStore: Send + Sync {
    /// Returns the live entry for `key`, recording the access.
    ///
    /// Expired entries are reported as absent.
    ///
    /// # Errors
    ///
    /// [`CacheError::Corrupt`] if the stored entry cannot be read back.
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError>;

    /// Stores an artifact unless a live entry already exists.
    async fn put(
        &self,
        key: &str,
        artifact: CacheArtifact,
        ttl: Duration,
    ) -> Result<PutOutcome, CacheError>;

    /// Removes an entry. Returns true if something was removed.
    async fn evict(&self, key: &str) -> Result<bool, CacheError>;

    /// Hit/miss counters and current footprint.
    async fn stats(&self) -> Result<CacheStats, CacheError>;

    /// Physically removes entries that are expired at `now` and have not
    /// been accessed within `grace`.
    async fn sweep(&self, now: Timestamp, grace: Duration) -> Result<SweepReport, CacheError>;
}

/// Hit and miss counters shared by the store implementations.
#[derive(Debug, Default)]
pub(crate) struct HitCounters {
    hits: AtomicU64,
    misses: AtomicU64,
}

impl HitCounters {
    pub(crate) fn hit(&self) {
        self.hits.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn miss(&self) {
        self.misses.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
