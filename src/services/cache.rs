use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::RwLock;
use std::time::Duration;

use crate::core::fingerprint::Fingerprint;
use crate::core::quality::QualityMetrics;
use crate::core::record::PhotoIdentity;
use crate::error::EngineError;

/// One cached computation result. Valid only while the keyed identity
/// (size+mtime or content digest) is unchanged; the cache never re-reads
/// file contents to detect staleness.
///
/// Persisted as JSON under the identity's cache key. Field names are the
/// stable persistence format.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    #[serde(rename = "hash")]
    pub fingerprint: Fingerprint,
    pub quality: QualityMetrics,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub feature: Option<Vec<f32>>,
    /// Pixel dimensions, kept so cache hits can win keeper tie-breaks
    /// without re-decoding.
    #[serde(default, rename = "dims")]
    pub dimensions: Option<(u32, u32)>,
    /// Insertion time, milliseconds since the Unix epoch.
    #[serde(rename = "ts")]
    pub inserted_at_ms: i64,
}

impl CacheEntry {
    pub fn new(
        fingerprint: Fingerprint,
        quality: QualityMetrics,
        feature: Option<Vec<f32>>,
        dimensions: Option<(u32, u32)>,
    ) -> Self {
        Self {
            fingerprint,
            quality,
            feature,
            dimensions,
            inserted_at_ms: Utc::now().timestamp_millis(),
        }
    }
}

/// Process-wide fingerprint cache: a synchronized in-memory map with
/// best-effort sled persistence behind it.
///
/// A miss is never an error, only a signal to recompute; persistence
/// failures degrade to misses with a warning. Pruning and eviction are
/// explicit operations, invoked by the scheduler or a host-side trigger,
/// never automatic. Construct with [`FingerprintCache::in_memory`] in
/// tests to substitute a fake with identical behavior.
pub struct FingerprintCache {
    entries: RwLock<HashMap<String, CacheEntry>>,
    db: Option<sled::Db>,
}

impl FingerprintCache {
    /// Purely in-memory cache; nothing survives the process.
    pub fn in_memory() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
            db: None,
        }
    }

    /// Open (or create) the persistent cache at `path` and bulk-preload
    /// it into memory. Unreadable entries are skipped, not fatal.
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        let db = sled::open(path)?;

        let mut entries = HashMap::new();
        for item in db.iter() {
            let (key, value) = match item {
                Ok(kv) => kv,
                Err(e) => {
                    log::warn!("cache preload read error, skipping entry: {e}");
                    continue;
                }
            };
            let key = String::from_utf8_lossy(&key).to_string();
            match serde_json::from_slice::<CacheEntry>(&value) {
                Ok(entry) => {
                    entries.insert(key, entry);
                }
                Err(e) => {
                    log::warn!("cache entry for {key} is malformed, treating as miss: {e}");
                }
            }
        }
        log::info!("fingerprint cache preloaded {} entries", entries.len());

        Ok(Self {
            entries: RwLock::new(entries),
            db: Some(db),
        })
    }

    pub fn lookup(&self, identity: &PhotoIdentity) -> Option<CacheEntry> {
        let entries = self.entries.read().expect("cache lock poisoned");
        entries.get(&identity.cache_key()).cloned()
    }

    /// Insert or replace the entry for an identity (last-write-wins).
    pub fn store(&self, identity: &PhotoIdentity, entry: CacheEntry) {
        let key = identity.cache_key();
        self.persist(&key, &entry);
        let mut entries = self.entries.write().expect("cache lock poisoned");
        entries.insert(key, entry);
    }

    /// Drop entries older than `max_age`. Returns how many were removed.
    pub fn prune_older_than(&self, max_age: Duration) -> usize {
        let cutoff = Utc::now().timestamp_millis() - max_age.as_millis() as i64;
        let stale: Vec<String> = {
            let entries = self.entries.read().expect("cache lock poisoned");
            entries
                .iter()
                .filter(|(_, entry)| entry.inserted_at_ms < cutoff)
                .map(|(key, _)| key.clone())
                .collect()
        };
        self.remove_keys(&stale);
        stale.len()
    }

    /// Drop oldest entries until at most `max_entries` remain. Returns
    /// how many were removed.
    pub fn evict_over_capacity(&self, max_entries: usize) -> usize {
        let excess: Vec<String> = {
            let entries = self.entries.read().expect("cache lock poisoned");
            if entries.len() <= max_entries {
                return 0;
            }
            let mut by_age: Vec<(&String, i64)> = entries
                .iter()
                .map(|(key, entry)| (key, entry.inserted_at_ms))
                .collect();
            by_age.sort_by_key(|&(key, ts)| (ts, key.clone()));
            by_age
                .iter()
                .take(entries.len() - max_entries)
                .map(|(key, _)| (*key).clone())
                .collect()
        };
        self.remove_keys(&excess);
        excess.len()
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("cache lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Flush pending persistence writes to disk.
    pub fn flush(&self) -> Result<(), EngineError> {
        if let Some(db) = &self.db {
            db.flush()?;
        }
        Ok(())
    }

    fn persist(&self, key: &str, entry: &CacheEntry) {
        let Some(db) = &self.db else {
            return;
        };
        match serde_json::to_vec(entry) {
            Ok(bytes) => {
                if let Err(e) = db.insert(key, bytes) {
                    log::warn!("cache write for {key} failed: {e}");
                }
            }
            Err(e) => log::warn!("cache entry for {key} failed to serialize: {e}"),
        }
    }

    fn remove_keys(&self, keys: &[String]) {
        if keys.is_empty() {
            return;
        }
        let mut entries = self.entries.write().expect("cache lock poisoned");
        for key in keys {
            entries.remove(key);
            if let Some(db) = &self.db {
                if let Err(e) = db.remove(key.as_bytes()) {
                    log::warn!("cache removal for {key} failed: {e}");
                }
            }
        }
    }
}
