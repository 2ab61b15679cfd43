//! Cache entry, statistics and outcome types.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use crate::utils::Timestamp;

/// The cached payload of one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheArtifact {
    /// Encoded output mesh.
    pub bytes: Vec<u8>,
    /// Algorithm-reported metrics, replayed on a hit.
    #[serde(default)]
    pub metrics: BTreeMap<String, f64>,
}

impl CacheArtifact {
    /// Creates an artifact.
    #[must_use]
    pub fn new(bytes: Vec<u8>, metrics: BTreeMap<String, f64>) -> Self {
        Self { bytes, metrics }
    }
}

/// A stored artifact plus bookkeeping.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Cache key.
    pub key: String,
    /// Payload.
    pub artifact: CacheArtifact,
    /// When the entry was written.
    pub created_at: Timestamp,
    /// Lifetime from `created_at`.
    pub ttl: Duration,
    /// Number of reads that returned this entry.
    pub access_count: u64,
    /// Time of the most recent read.
    pub last_accessed_at: Option<Timestamp>,
}

impl CacheEntry {
    /// Creates a fresh entry.
    #[must_use]
    pub fn new(key: impl Into<String>, artifact: CacheArtifact, ttl: Duration, now: Timestamp) -> Self {
        Self {
            key: key.into(),
            artifact,
            created_at: now,
            ttl,
            access_count: 0,
            last_accessed_at: None,
        }
    }

    /// When the entry stops being served.
    #[must_use]
    pub fn expires_at(&self) -> Timestamp {
        offset(self.created_at, self.ttl)
    }

    /// Returns true if the entry is past its TTL at `now`.
    #[must_use]
    pub fn is_expired_at(&self, now: Timestamp) -> bool {
        now >= self.expires_at()
    }

    /// Most recent read, or creation time if never read.
    #[must_use]
    pub fn last_touched(&self) -> Timestamp {
        self.last_accessed_at.unwrap_or(self.created_at)
    }

    /// True if the sweep may physically remove the entry.
    #[must_use]
    pub fn is_evictable_at(&self, now: Timestamp, grace: Duration) -> bool {
        self.is_expired_at(now) && now >= offset(self.last_touched(), grace)
    }

    /// Records a read.
    pub fn touch(&mut self, now: Timestamp) {
        self.access_count += 1;
        self.last_accessed_at = Some(now);
    }

    /// Artifact size in bytes.
    #[must_use]
    pub fn size_bytes(&self) -> u64 {
        self.artifact.bytes.len() as u64
    }
}

/// `ts + duration`, saturating at the largest representable time.
pub(crate) fn offset(ts: Timestamp, duration: Duration) -> Timestamp {
    ChronoDuration::from_std(duration)
        .ok()
        .and_then(|d| ts.checked_add_signed(d))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

/// Result of a `put`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// This writer's artifact was stored.
    Stored,
    /// A live entry already existed; this writer's artifact was dropped.
    Discarded,
}

/// Cache counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Reads that returned a live entry.
    pub hits: u64,
    /// Reads that found nothing usable.
    pub misses: u64,
    /// Entries currently stored, live or not.
    pub entries: u64,
    /// Storage footprint in bytes.
    pub bytes: u64,
}

impl CacheStats {
    /// `hits / (hits + misses)`, or 0 with no reads.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// What a sweep removed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Entries examined.
    pub scanned: u64,
    /// Entries removed.
    pub removed: u64,
    /// Bytes released.
    pub bytes_freed: u64,
}
