//! Filesystem cache store.
//!
//! Layout under the root directory:
//!
//! ```text
//! <root>/<key[0..2]>/<key>.entry    entry document (JSON)
//! <root>/<key[0..2]>/<key>.access   access bookkeeping (JSON)
//! <root>/<key[0..2]>/<key>.lock     held while a stale entry is replaced
//! ```
//!
//! An entry is written to a temporary file and committed with a hard link,
//! which fails if the target exists. That makes the first committed writer
//! win without any lock. Replacing an expired or unreadable entry takes the
//! per-key lock file, so only one writer removes it and relinks.

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::{debug, warn};
use uuid::Uuid;

use super::{CacheArtifact, CacheEntry, CacheStats, CacheStore, HitCounters, PutOutcome, SweepReport};
use crate::errors::{CacheCorruptionError, CacheError};
use crate::utils::{now_utc, Timestamp};

const ENTRY_EXT: &str = "entry";
const ACCESS_EXT: &str = "access";
const LOCK_EXT: &str = "lock";

#[derive(Debug, Serialize, Deserialize)]
struct EntryDocument {
    key: String,
    created_at: Timestamp,
    ttl_ms: u64,
    size: u64,
    checksum: String,
    artifact: String,
    #[serde(default)]
    metrics: BTreeMap<String, f64>,
}

#[derive(Debug, Deserialize)]
struct StoredSize {
    size: u64,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct AccessRecord {
    access_count: u64,
    last_accessed_at: Option<Timestamp>,
}

/// Cache store that keeps one file per entry under a root directory.
#[derive(Debug)]
pub struct FsCacheStore {
    root: PathBuf,
    counters: HitCounters,
}

impl FsCacheStore {
    /// Opens (creating if needed) a store rooted at `root`.
    ///
    /// # Errors
    ///
    /// Fails if the directory cannot be created.
    pub async fn open(root: impl Into<PathBuf>) -> Result<Self, CacheError> {
        let root = root.into();
        tokio::fs::create_dir_all(&root).await?;
        Ok(Self {
            root,
            counters: HitCounters::default(),
        })
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    fn shard_dir(&self, key: &str) -> Result<PathBuf, CacheError> {
        if key.len() < 2 || !key.bytes().all(|b| b.is_ascii_hexdigit()) {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        Ok(self.root.join(&key[..2]))
    }

    fn entry_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        Ok(self.shard_dir(key)?.join(format!("{key}.{ENTRY_EXT}")))
    }

    fn access_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        Ok(self.shard_dir(key)?.join(format!("{key}.{ACCESS_EXT}")))
    }

    fn lock_path(&self, key: &str) -> Result<PathBuf, CacheError> {
        Ok(self.shard_dir(key)?.join(format!("{key}.{LOCK_EXT}")))
    }

    /// Reads and verifies an entry without touching access bookkeeping.
    async fn load(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let path = self.entry_path(key)?;
        let raw = match tokio::fs::read(&path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let access = self.read_access(key).await;
        decode_entry(key, &raw, access).map(Some)
    }

    async fn read_access(&self, key: &str) -> AccessRecord {
        let Ok(path) = self.access_path(key) else {
            return AccessRecord::default();
        };
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice(&raw).unwrap_or_default(),
            Err(_) => AccessRecord::default(),
        }
    }

    async fn record_access(&self, key: &str, entry: &CacheEntry) {
        let record = AccessRecord {
            access_count: entry.access_count,
            last_accessed_at: entry.last_accessed_at,
        };
        let result = async {
            let path = self.access_path(key)?;
            let tmp = path.with_extension(format!("{ACCESS_EXT}.{}.tmp", Uuid::new_v4().simple()));
            let body = serde_json::to_vec(&record)
                .map_err(|e| CacheError::Unavailable(e.to_string()))?;
            tokio::fs::write(&tmp, body).await?;
            tokio::fs::rename(&tmp, &path).await?;
            Ok::<_, CacheError>(())
        }
        .await;
        if let Err(e) = result {
            debug!(key, error = %e, "Failed to record cache access");
        }
    }

    async fn remove_files(&self, key: &str) -> Result<bool, CacheError> {
        let removed = match tokio::fs::remove_file(self.entry_path(key)?).await {
            Ok(()) => true,
            Err(e) if e.kind() == ErrorKind::NotFound => false,
            Err(e) => return Err(e.into()),
        };
        if let Err(e) = tokio::fs::remove_file(self.access_path(key)?).await {
            if e.kind() != ErrorKind::NotFound {
                return Err(e.into());
            }
        }
        Ok(removed)
    }

    /// Artifact size recorded in the entry document, 0 if unreadable.
    async fn stored_size(&self, key: &str) -> u64 {
        let Ok(path) = self.entry_path(key) else {
            return 0;
        };
        match tokio::fs::read(&path).await {
            Ok(raw) => serde_json::from_slice::<StoredSize>(&raw).map_or(0, |doc| doc.size),
            Err(_) => 0,
        }
    }

    /// Replaces an expired or unreadable entry with the temp file.
    ///
    /// Writers that find the replacement lock taken are discarded, so a
    /// single writer reports `Stored`.
    async fn replace_stale(
        &self,
        key: &str,
        tmp: &Path,
        final_path: &Path,
        now: Timestamp,
    ) -> Result<PutOutcome, CacheError> {
        let lock = self.lock_path(key)?;
        match tokio::fs::OpenOptions::new().write(true).create_new(true).open(&lock).await {
            Ok(_) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(key, "Cache put discarded, entry is being replaced");
                return Ok(PutOutcome::Discarded);
            }
            Err(e) => return Err(e.into()),
        }

        let result = self.swap_stale(key, tmp, final_path, now).await;
        if let Err(e) = tokio::fs::remove_file(&lock).await {
            warn!(path = %lock.display(), error = %e, "Failed to release cache replacement lock");
        }
        result
    }

    async fn swap_stale(
        &self,
        key: &str,
        tmp: &Path,
        final_path: &Path,
        now: Timestamp,
    ) -> Result<PutOutcome, CacheError> {
        // a previous lock holder may already have stored a fresh entry
        if let Ok(Some(existing)) = self.load(key).await {
            if !existing.is_expired_at(now) {
                debug!(key, "Cache put discarded, live entry exists");
                return Ok(PutOutcome::Discarded);
            }
        }
        match tokio::fs::remove_file(final_path).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        match tokio::fs::hard_link(tmp, final_path).await {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!(key, "Cache put discarded, another writer committed first");
                Ok(PutOutcome::Discarded)
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn entry_keys(&self) -> Result<Vec<String>, CacheError> {
        let mut keys = Vec::new();
        let mut shards = tokio::fs::read_dir(&self.root).await?;
        while let Some(shard) = shards.next_entry().await? {
            if !shard.file_type().await?.is_dir() {
                continue;
            }
            let mut files = tokio::fs::read_dir(shard.path()).await?;
            while let Some(file) = files.next_entry().await? {
                let path = file.path();
                if path.extension().and_then(|e| e.to_str()) != Some(ENTRY_EXT) {
                    continue;
                }
                if let Some(stem) = path.file_stem().and_then(|s| s.to_str()) {
                    keys.push(stem.to_string());
                }
            }
        }
        Ok(keys)
    }
}

fn checksum(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

fn decode_entry(key: &str, raw: &[u8], access: AccessRecord) -> Result<CacheEntry, CacheError> {
    let corrupt = |reason: String| CacheError::Corrupt(CacheCorruptionError::new(key, reason));

    let doc: EntryDocument =
        serde_json::from_slice(raw).map_err(|e| corrupt(format!("unreadable entry: {e}")))?;
    if doc.key != key {
        return Err(corrupt(format!("entry belongs to key {}", doc.key)));
    }
    let bytes = STANDARD
        .decode(doc.artifact.as_bytes())
        .map_err(|e| corrupt(format!("artifact is not base64: {e}")))?;
    if bytes.len() as u64 != doc.size || checksum(&bytes) != doc.checksum {
        return Err(corrupt("checksum mismatch".to_string()));
    }

    Ok(CacheEntry {
        key: doc.key,
        artifact: CacheArtifact::new(bytes, doc.metrics),
        created_at: doc.created_at,
        ttl: Duration::from_millis(doc.ttl_ms),
        access_count: access.access_count,
        last_accessed_at: access.last_accessed_at,
    })
}

fn encode_entry(entry: &CacheEntry) -> Result<Vec<u8>, CacheError> {
    let doc = EntryDocument {
        key: entry.key.clone(),
        created_at: entry.created_at,
        ttl_ms: u64::try_from(entry.ttl.as_millis()).unwrap_or(u64::MAX),
        size: entry.size_bytes(),
        checksum: checksum(&entry.artifact.bytes),
        artifact: STANDARD.encode(&entry.artifact.bytes),
        metrics: entry.artifact.metrics.clone(),
    };
    serde_json::to_vec(&doc).map_err(|e| CacheError::Unavailable(e.to_string()))
}

#[async_trait]
impl CacheStore for FsCacheStore {
    async fn get(&self, key: &str) -> Result<Option<CacheEntry>, CacheError> {
        let now = now_utc();
        let loaded = self.load(key).await;
        match loaded {
            Ok(Some(mut entry)) if !entry.is_expired_at(now) => {
                self.counters.hit();
                entry.touch(now);
                self.record_access(key, &entry).await;
                Ok(Some(entry))
            }
            Ok(_) => {
                self.counters.miss();
                Ok(None)
            }
            Err(e) => {
                self.counters.miss();
                Err(e)
            }
        }
    }

    async fn put(
        &self,
        key: &str,
        artifact: CacheArtifact,
        ttl: Duration,
    ) -> Result<PutOutcome, CacheError> {
        let final_path = self.entry_path(key)?;
        let dir = self.shard_dir(key)?;
        tokio::fs::create_dir_all(&dir).await?;

        let now = now_utc();
        let body = encode_entry(&CacheEntry::new(key, artifact, ttl, now))?;
        let tmp = dir.join(format!("{key}.{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &body).await?;

        let outcome = match tokio::fs::hard_link(&tmp, &final_path).await {
            Ok(()) => Ok(PutOutcome::Stored),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.load(key).await {
                Ok(Some(existing)) if !existing.is_expired_at(now) => {
                    debug!(key, "Cache put discarded, live entry exists");
                    Ok(PutOutcome::Discarded)
                }
                // Expired or unreadable: replace it.
                _ => self.replace_stale(key, &tmp, &final_path, now).await,
            },
            Err(e) => Err(e.into()),
        };

        if let Err(e) = tokio::fs::remove_file(&tmp).await {
            if e.kind() != ErrorKind::NotFound {
                warn!(path = %tmp.display(), error = %e, "Failed to remove temporary cache file");
            }
        }
        if matches!(outcome, Ok(PutOutcome::Stored)) {
            if let Ok(access) = self.access_path(key) {
                if let Err(e) = tokio::fs::remove_file(&access).await {
                    if e.kind() != ErrorKind::NotFound {
                        warn!(path = %access.display(), error = %e, "Failed to reset cache access record");
                    }
                }
            }
        }
        outcome
    }

    async fn evict(&self, key: &str) -> Result<bool, CacheError> {
        self.remove_files(key).await
    }

    async fn stats(&self) -> Result<CacheStats, CacheError> {
        let (hits, misses) = self.counters.snapshot();
        let keys = self.entry_keys().await?;
        let mut bytes = 0;
        for key in &keys {
            bytes += self.stored_size(key).await;
        }
        Ok(CacheStats {
            hits,
            misses,
            entries: keys.len() as u64,
            bytes,
        })
    }

    async fn sweep(&self, now: Timestamp, grace: Duration) -> Result<SweepReport, CacheError> {
        let mut report = SweepReport::default();
        for key in self.entry_keys().await? {
            report.scanned += 1;
            let (evict, size) = match self.load(&key).await {
                Ok(Some(entry)) => (entry.is_evictable_at(now, grace), entry.size_bytes()),
                Ok(None) => (false, 0),
                Err(CacheError::Corrupt(e)) => {
                    warn!(key = %key, reason = %e.reason, "Sweeping corrupt cache entry");
                    (true, self.stored_size(&key).await)
                }
                Err(e) => return Err(e),
            };
            if evict && self.remove_files(&key).await? {
                report.removed += 1;
                report.bytes_freed += size;
            }
        }
        Ok(report)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::InMemoryCacheStore;
    use chrono::Duration as ChronoDuration;
    use std::sync::Arc;

    const KEY: &str = "ab12cd34";

    fn artifact(byte: u8) -> CacheArtifact {
        let mut metrics = BTreeMap::new();
        metrics.insert("quality_score".to_string(), 0.9);
        CacheArtifact::new(vec![byte; 16], metrics)
    }

    async fn store() -> (tempfile::TempDir, FsCacheStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = FsCacheStore::open(dir.path().join("cache")).await.unwrap();
        (dir, store)
    }

    #[tokio::test]
    async fn test_put_then_get_replays_metrics() {
        let (_dir, store) = store().await;
        assert!(store.get(KEY).await.unwrap().is_none());

        let outcome = store.put(KEY, artifact(7), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);

        let entry = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(entry.artifact, artifact(7));
        assert_eq!(entry.access_count, 1);

        let entry = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(entry.access_count, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!((stats.hits, stats.misses, stats.entries), (2, 1, 1));
        assert!(stats.bytes > 0);
    }

    #[tokio::test]
    async fn test_stats_bytes_match_memory_store() {
        let (_dir, store) = store().await;
        let memory = InMemoryCacheStore::new();
        store.put(KEY, artifact(7), Duration::from_secs(60)).await.unwrap();
        memory.put(KEY, artifact(7), Duration::from_secs(60)).await.unwrap();

        let fs_stats = store.stats().await.unwrap();
        let memory_stats = memory.stats().await.unwrap();
        assert_eq!(fs_stats.bytes, 16);
        assert_eq!(fs_stats.bytes, memory_stats.bytes);
        assert_eq!(fs_stats.entries, memory_stats.entries);
    }

    #[tokio::test]
    async fn test_second_writer_discarded() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(1), Duration::from_secs(60)).await.unwrap();
        let outcome = store.put(KEY, artifact(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Discarded);
        assert_eq!(store.get(KEY).await.unwrap().unwrap().artifact, artifact(1));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_do_not_corrupt() {
        let (_dir, store) = store().await;
        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 0..8u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                store.put(KEY, artifact(i), Duration::from_secs(60)).await.unwrap()
            }));
        }
        let mut stored = 0;
        for handle in handles {
            if handle.await.unwrap() == PutOutcome::Stored {
                stored += 1;
            }
        }
        assert_eq!(stored, 1);
        assert!(store.get(KEY).await.unwrap().is_some());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_writers_replace_expired_entry_once() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(0), Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let store = Arc::new(store);
        let mut handles = Vec::new();
        for i in 1..=8u8 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let outcome = store.put(KEY, artifact(i), Duration::from_secs(60)).await.unwrap();
                (i, outcome)
            }));
        }
        let mut winners = Vec::new();
        for handle in handles {
            let (i, outcome) = handle.await.unwrap();
            if outcome == PutOutcome::Stored {
                winners.push(i);
            }
        }
        assert_eq!(winners.len(), 1);
        let entry = store.get(KEY).await.unwrap().unwrap();
        assert_eq!(entry.artifact, artifact(winners[0]));
        assert!(!store.lock_path(KEY).unwrap().exists());
    }

    #[tokio::test]
    async fn test_replaced_entry_starts_fresh_access_count() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(1), Duration::from_millis(1)).await.unwrap();
        tokio::fs::write(store.access_path(KEY).unwrap(), br#"{"access_count":5}"#)
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;

        let outcome = store.put(KEY, artifact(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert!(!store.access_path(KEY).unwrap().exists());
        assert_eq!(store.get(KEY).await.unwrap().unwrap().access_count, 1);
    }

    #[tokio::test]
    async fn test_tampered_entry_is_corrupt() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(1), Duration::from_secs(60)).await.unwrap();

        let path = store.entry_path(KEY).unwrap();
        let mut doc: EntryDocument =
            serde_json::from_slice(&tokio::fs::read(&path).await.unwrap()).unwrap();
        doc.artifact = STANDARD.encode([9u8; 16]);
        tokio::fs::write(&path, serde_json::to_vec(&doc).unwrap()).await.unwrap();

        let err = store.get(KEY).await.unwrap_err();
        assert!(matches!(err, CacheError::Corrupt(_)));

        tokio::fs::write(&path, b"{not json").await.unwrap();
        assert!(matches!(store.get(KEY).await, Err(CacheError::Corrupt(_))));

        assert!(store.evict(KEY).await.unwrap());
        assert!(store.get(KEY).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_corrupt_entry_is_replaced_by_put() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(1), Duration::from_secs(60)).await.unwrap();
        tokio::fs::write(store.entry_path(KEY).unwrap(), b"garbage").await.unwrap();

        let outcome = store.put(KEY, artifact(2), Duration::from_secs(60)).await.unwrap();
        assert_eq!(outcome, PutOutcome::Stored);
        assert_eq!(store.get(KEY).await.unwrap().unwrap().artifact, artifact(2));
    }

    #[tokio::test]
    async fn test_invalid_key_rejected() {
        let (_dir, store) = store().await;
        assert!(matches!(
            store.get("../etc/passwd").await,
            Err(CacheError::InvalidKey(_))
        ));
    }

    #[tokio::test]
    async fn test_sweep_removes_expired_and_corrupt() {
        let (_dir, store) = store().await;
        store.put(KEY, artifact(1), Duration::from_secs(1)).await.unwrap();
        store.put("ffee", artifact(2), Duration::from_secs(3600)).await.unwrap();
        store.put("0099", artifact(3), Duration::from_secs(3600)).await.unwrap();
        tokio::fs::write(store.entry_path("0099").unwrap(), b"garbage").await.unwrap();

        let later = now_utc() + ChronoDuration::seconds(30);
        let report = store.sweep(later, Duration::from_secs(10)).await.unwrap();
        assert_eq!(report.scanned, 3);
        assert_eq!(report.removed, 2);

        let stats = store.stats().await.unwrap();
        assert_eq!(stats.entries, 1);
    }
}
