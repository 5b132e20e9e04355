//! Response cache: model responses keyed by canonical request hash.
//!
//! Lookups and inserts happen in memory and are safe from concurrent agent
//! tasks. The file is written once, by [`ResponseCache::save`], after all
//! tasks of a run have joined.

use super::{read_json, write_atomic, Cache};
use crate::config::CacheConfig;
use crate::error::CacheError;
use crate::llm::key::is_valid_key;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, RwLock};

pub const RESPONSE_CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ResponseCacheEntry {
    /// Serialized response; opaque to the cache.
    pub response: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheStats {
    pub total_entries: u64,
    pub expired_entries: u64,
    pub hits: u64,
    pub misses: u64,
    pub hit_rate: f64,
    pub total_size_bytes: u64,
    pub evictions: u64,
}

impl CacheStats {
    fn record_lookup(&mut self, hit: bool) {
        if hit {
            self.hits += 1;
        } else {
            self.misses += 1;
        }
        let lookups = self.hits + self.misses;
        self.hit_rate = if lookups == 0 {
            0.0
        } else {
            self.hits as f64 / lookups as f64
        };
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ResponseCacheFile {
    version: u32,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
    #[serde(default)]
    entries: BTreeMap<String, ResponseCacheEntry>,
    #[serde(default)]
    stats: CacheStats,
}

struct Store {
    created_at: DateTime<Utc>,
    entries: BTreeMap<String, ResponseCacheEntry>,
    dirty: bool,
}

pub struct ResponseCache {
    path: Option<PathBuf>,
    cache: Option<Cache>,
    ttl: Option<Duration>,
    max_entries: usize,
    store: RwLock<Store>,
    stats: Mutex<CacheStats>,
    /// Counters moved since the last save; entries may be untouched.
    stats_dirty: AtomicBool,
}

impl ResponseCache {
    /// Load the response cache for `root`. A missing, corrupt or
    /// outdated file yields an empty cache.
    pub fn load(root: &Path, config: &CacheConfig) -> Self {
        let cache = Cache::new(root);
        let path = cache.response_cache_path();
        let file = match read_json::<ResponseCacheFile>(&path) {
            Ok(Some(file)) if file.version == RESPONSE_CACHE_VERSION => Some(file),
            Ok(Some(file)) => {
                tracing::info!(
                    found = file.version,
                    expected = RESPONSE_CACHE_VERSION,
                    "response cache version changed; starting fresh"
                );
                None
            }
            Ok(None) => None,
            Err(err) => {
                tracing::warn!(error = %err, "response cache unreadable; starting fresh");
                None
            }
        };

        let mut this = Self::with_config(config);
        this.path = Some(path);
        this.cache = Some(cache);
        if let Some(file) = file {
            if let Ok(mut store) = this.store.write() {
                store.created_at = file.created_at;
                store.entries = file.entries;
            }
            if let Ok(mut stats) = this.stats.lock() {
                *stats = file.stats;
            }
            let pruned = this.prune_expired();
            if pruned > 0 {
                tracing::debug!(pruned, "dropped expired response cache entries");
            }
        }
        this
    }

    /// A cache that is never written to disk.
    pub fn in_memory(config: &CacheConfig) -> Self {
        Self::with_config(config)
    }

    fn with_config(config: &CacheConfig) -> Self {
        Self {
            path: None,
            cache: None,
            ttl: (config.response_ttl_hours > 0)
                .then(|| Duration::hours(config.response_ttl_hours)),
            max_entries: config.max_response_entries,
            store: RwLock::new(Store {
                created_at: Utc::now(),
                entries: BTreeMap::new(),
                dirty: false,
            }),
            stats: Mutex::new(CacheStats::default()),
            stats_dirty: AtomicBool::new(false),
        }
    }

    fn is_expired(&self, entry: &ResponseCacheEntry, now: DateTime<Utc>) -> bool {
        self.ttl
            .map(|ttl| now.signed_duration_since(entry.created_at) > ttl)
            .unwrap_or(false)
    }

    /// Look up `key`. Expired entries count as misses.
    pub fn get(&self, key: &str) -> Option<ResponseCacheEntry> {
        let now = Utc::now();
        let (entry, expired) = match self.store.read() {
            Ok(store) => match store.entries.get(key) {
                Some(entry) if self.is_expired(entry, now) => (None, true),
                Some(entry) => (Some(entry.clone()), false),
                None => (None, false),
            },
            Err(_) => (None, false),
        };

        if let Ok(mut stats) = self.stats.lock() {
            if expired {
                stats.expired_entries += 1;
            }
            stats.record_lookup(entry.is_some());
        }
        self.stats_dirty.store(true, Ordering::SeqCst);
        entry
    }

    /// Insert or wholesale replace the entry for `key`, evicting the oldest
    /// entries when over capacity.
    pub fn put(&self, key: &str, response: String) -> Result<(), CacheError> {
        if !is_valid_key(key) {
            return Err(CacheError::InvalidKey(key.to_string()));
        }
        let entry = ResponseCacheEntry {
            size_bytes: response.len() as u64,
            response,
            created_at: Utc::now(),
        };

        let mut store = self.store.write().map_err(|_| CacheError::Poisoned)?;
        store.entries.insert(key.to_string(), entry);
        store.dirty = true;

        let mut evicted = 0u64;
        if self.max_entries > 0 && store.entries.len() > self.max_entries {
            let excess = store.entries.len() - self.max_entries;
            let mut by_age: Vec<(DateTime<Utc>, String)> = store
                .entries
                .iter()
                .filter(|(k, _)| k.as_str() != key)
                .map(|(k, e)| (e.created_at, k.clone()))
                .collect();
            by_age.sort();
            for (_, old_key) in by_age.into_iter().take(excess) {
                store.entries.remove(&old_key);
                evicted += 1;
            }
        }

        let total_entries = store.entries.len() as u64;
        let total_size = store.entries.values().map(|e| e.size_bytes).sum();
        drop(store);

        if let Ok(mut stats) = self.stats.lock() {
            stats.total_entries = total_entries;
            stats.total_size_bytes = total_size;
            stats.evictions += evicted;
        }
        Ok(())
    }

    /// Remove expired entries; returns how many were removed.
    pub fn prune_expired(&self) -> usize {
        if self.ttl.is_none() {
            return 0;
        }
        let now = Utc::now();
        let Ok(mut store) = self.store.write() else {
            return 0;
        };
        let before = store.entries.len();
        store.entries.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - store.entries.len();
        if removed > 0 {
            store.dirty = true;
        }
        let total_entries = store.entries.len() as u64;
        let total_size = store.entries.values().map(|e| e.size_bytes).sum();
        drop(store);

        if let Ok(mut stats) = self.stats.lock() {
            stats.expired_entries += removed as u64;
            stats.total_entries = total_entries;
            stats.total_size_bytes = total_size;
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.store.read().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stats(&self) -> CacheStats {
        self.stats.lock().map(|s| s.clone()).unwrap_or_default()
    }

    /// Persist to disk if anything changed since the last save.
    pub fn save(&self) -> Result<(), CacheError> {
        let (Some(path), Some(cache)) = (&self.path, &self.cache) else {
            return Ok(());
        };

        let mut store = self.store.write().map_err(|_| CacheError::Poisoned)?;
        let stats_changed = self.stats_dirty.swap(false, Ordering::SeqCst);
        if !store.dirty && !stats_changed {
            return Ok(());
        }
        let file = ResponseCacheFile {
            version: RESPONSE_CACHE_VERSION,
            created_at: store.created_at,
            updated_at: Utc::now(),
            entries: store.entries.clone(),
            stats: self.stats(),
        };
        let written = serde_json::to_string(&file)
            .map_err(CacheError::from)
            .and_then(|content| {
                let _lock = cache.lock()?;
                write_atomic(path, &content)
            });
        if let Err(err) = written {
            self.stats_dirty.store(true, Ordering::SeqCst);
            return Err(err);
        }
        store.dirty = false;
        Ok(())
    }
}
