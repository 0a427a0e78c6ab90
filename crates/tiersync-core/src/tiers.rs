//! Local and shared cache tiers with hit/miss accounting.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde::Serialize;

/// Errors raised by the shared tier.
#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("Shared cache connection error: {0}")]
    Connection(String),

    #[error("Shared cache command error: {0}")]
    Command(String),

    #[error("Cache value serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Network-accessible cache shared by every process.
///
/// Implementations provide their own concurrency guarantees; nothing in this
/// crate locks around them.
#[async_trait]
pub trait SharedCache: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError>;

    /// Store `value` under `key`. Shared entries always expire.
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError>;

    async fn delete(&self, key: &str) -> Result<(), CacheError>;
}

/// Per-process cache tier.
///
/// Entries have no TTL; they leave only through explicit invalidation or a
/// process restart. Reads share the lock, writes take it exclusively.
pub struct LocalCache<V> {
    entries: RwLock<HashMap<String, V>>,
}

impl<V: Clone> LocalCache<V> {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(HashMap::new()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.entries.read().get(key).cloned()
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.entries.write().insert(key.into(), value);
    }

    /// Remove `key`, returning whether it was present.
    pub fn delete(&self, key: &str) -> bool {
        self.entries.write().remove(key).is_some()
    }

    /// Cached keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.entries.read().keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Copy of every entry, sorted by key.
    pub fn snapshot(&self) -> Vec<(String, V)> {
        let mut entries: Vec<(String, V)> = self
            .entries
            .read()
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

impl<V: Clone> Default for LocalCache<V> {
    fn default() -> Self {
        Self::new()
    }
}

/// Monotonic counters across both tiers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    pub local_hits: u64,
    pub local_misses: u64,
    pub shared_hits: u64,
    pub shared_misses: u64,
    pub origin_queries: u64,
}

/// Owns the local tier and the handle to the shared tier, and keeps stats.
pub struct TierManager<V> {
    local: LocalCache<V>,
    shared: Arc<dyn SharedCache>,
    stats: RwLock<CacheStats>,
}

impl<V: Clone> TierManager<V> {
    pub fn new(shared: Arc<dyn SharedCache>) -> Self {
        Self {
            local: LocalCache::new(),
            shared,
            stats: RwLock::new(CacheStats::default()),
        }
    }

    pub fn get(&self, key: &str) -> Option<V> {
        self.local.get(key)
    }

    pub fn set(&self, key: impl Into<String>, value: V) {
        self.local.set(key, value);
    }

    pub fn delete(&self, key: &str) -> bool {
        self.local.delete(key)
    }

    pub fn local(&self) -> &LocalCache<V> {
        &self.local
    }

    pub fn shared(&self) -> &Arc<dyn SharedCache> {
        &self.shared
    }

    pub fn increment_local_hit(&self) {
        self.stats.write().local_hits += 1;
    }

    pub fn increment_local_miss(&self) {
        self.stats.write().local_misses += 1;
    }

    pub fn increment_shared_hit(&self) {
        self.stats.write().shared_hits += 1;
    }

    pub fn increment_shared_miss(&self) {
        self.stats.write().shared_misses += 1;
    }

    pub fn increment_origin_query(&self) {
        self.stats.write().origin_queries += 1;
    }

    /// Consistent snapshot of all counters.
    pub fn get_stats(&self) -> CacheStats {
        *self.stats.read()
    }

    pub fn reset_stats(&self) {
        *self.stats.write() = CacheStats::default();
    }
}
