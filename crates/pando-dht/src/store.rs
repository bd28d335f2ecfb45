//! Local key/value storage for the overlay.
//!
//! A sharded map from textual key to JSON value with per-entry expiry.
//! List-valued entries merge as a bounded set union on re-store, so
//! concurrent holder announcements for the same chunk accumulate instead
//! of clobbering each other. Everything else overwrites.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::time::Duration;

use parking_lot::Mutex;
use tracing::debug;

use pando_core::Timestamp;

use crate::{DEFAULT_MAX_LIST_VALUE, DEFAULT_MAX_RECORDS, DEFAULT_TTL_SECS, MAX_TTL_SECS};

/// Number of shards; a small power of two keeps lock contention low.
const SHARD_COUNT: usize = 16;

/// Store configuration.
#[derive(Debug, Clone)]
pub struct DhtStoreConfig {
    /// Cap on the total number of records.
    pub max_records: usize,
    /// Default TTL applied when a request asks for zero.
    pub default_ttl: Duration,
    /// Cap on elements kept when merging list values.
    pub max_list_value: usize,
}

impl Default for DhtStoreConfig {
    fn default() -> Self {
        Self {
            max_records: DEFAULT_MAX_RECORDS,
            default_ttl: Duration::from_secs(DEFAULT_TTL_SECS),
            max_list_value: DEFAULT_MAX_LIST_VALUE,
        }
    }
}

#[derive(Debug, Clone)]
struct StoredValue {
    value: serde_json::Value,
    expires_at: Timestamp,
}

/// The sharded key/value store.
pub struct DhtStore {
    config: DhtStoreConfig,
    shards: Vec<Mutex<HashMap<String, StoredValue>>>,
}

impl DhtStore {
    /// Creates an empty store.
    pub fn new(config: DhtStoreConfig) -> Self {
        Self {
            config,
            shards: (0..SHARD_COUNT).map(|_| Mutex::new(HashMap::new())).collect(),
        }
    }

    fn shard(&self, key: &str) -> &Mutex<HashMap<String, StoredValue>> {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    /// Inserts a value under `key` with the given TTL.
    ///
    /// A zero TTL falls back to the default; requests above the ceiling are
    /// clamped. When both the live current value and the incoming one are
    /// JSON arrays the result is their set union (bounded), keeping the
    /// later expiry.
    pub fn insert(&self, key: &str, value: serde_json::Value, ttl: Duration) {
        let ttl = if ttl.is_zero() {
            self.config.default_ttl
        } else {
            ttl.min(Duration::from_secs(MAX_TTL_SECS))
        };
        let expires_at = Timestamp::now().plus(ttl);

        let mut shard = self.shard(key).lock();
        let merged = match shard.get(key) {
            Some(current) if !current.expires_at.is_expired() => {
                match (&current.value, &value) {
                    (serde_json::Value::Array(old), serde_json::Value::Array(new)) => {
                        let mut union = old.clone();
                        for item in new {
                            if !union.contains(item) {
                                union.push(item.clone());
                            }
                        }
                        union.truncate(self.config.max_list_value);
                        StoredValue {
                            value: serde_json::Value::Array(union),
                            expires_at: expires_at.max(current.expires_at),
                        }
                    }
                    _ => StoredValue { value, expires_at },
                }
            }
            _ => StoredValue { value, expires_at },
        };
        shard.insert(key.to_string(), merged);
        drop(shard);

        self.enforce_capacity();
    }

    /// Returns the live value under `key`.
    pub fn get(&self, key: &str) -> Option<serde_json::Value> {
        let shard = self.shard(key).lock();
        shard
            .get(key)
            .filter(|v| !v.expires_at.is_expired())
            .map(|v| v.value.clone())
    }

    /// Returns true if a live value exists under `key`.
    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    /// Total records, expired included until the next sweep.
    pub fn len(&self) -> usize {
        self.shards.iter().map(|s| s.lock().len()).sum()
    }

    /// Returns true if the store holds no records.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drops every expired record. Run from a dedicated periodic task.
    pub fn sweep(&self) -> usize {
        let mut dropped = 0;
        for shard in &self.shards {
            let mut shard = shard.lock();
            let before = shard.len();
            shard.retain(|_, v| !v.expires_at.is_expired());
            dropped += before - shard.len();
        }
        if dropped > 0 {
            debug!(dropped, "swept expired dht records");
        }
        dropped
    }

    /// Evicts soonest-expiring records while above capacity.
    fn enforce_capacity(&self) {
        let over = self.len().saturating_sub(self.config.max_records);
        if over == 0 {
            return;
        }
        // Collect (expiry, key) across shards and drop the `over` oldest.
        let mut entries: Vec<(Timestamp, String)> = Vec::new();
        for shard in &self.shards {
            for (k, v) in shard.lock().iter() {
                entries.push((v.expires_at, k.clone()));
            }
        }
        entries.sort();
        for (_, key) in entries.into_iter().take(over) {
            self.shard(&key).lock().remove(&key);
        }
    }
}
