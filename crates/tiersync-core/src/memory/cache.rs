use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::time::Instant;

use crate::tiers::{CacheError, SharedCache};

struct Stored {
    value: Vec<u8>,
    expires_at: Instant,
}

/// Map-backed shared tier. Expired entries are invisible to reads and are
/// purged lazily.
#[derive(Default)]
pub struct MemorySharedCache {
    entries: Mutex<HashMap<String, Stored>>,
    fail_reads: AtomicBool,
    fail_writes: AtomicBool,
    fail_deletes: AtomicBool,
}

impl MemorySharedCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `get` fail with a connection error.
    pub fn fail_reads(&self, fail: bool) {
        self.fail_reads.store(fail, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.fail_deletes.store(fail, Ordering::SeqCst);
    }

    /// Remaining time to live of `key`, if present.
    pub fn ttl(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        self.entries
            .lock()
            .get(key)
            .filter(|stored| stored.expires_at > now)
            .map(|stored| stored.expires_at - now)
    }

    /// Live keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let now = Instant::now();
        let mut keys: Vec<String> = self
            .entries
            .lock()
            .iter()
            .filter(|(_, stored)| stored.expires_at > now)
            .map(|(key, _)| key.clone())
            .collect();
        keys.sort();
        keys
    }

    fn check(flag: &AtomicBool, op: &str) -> Result<(), CacheError> {
        if flag.load(Ordering::SeqCst) {
            return Err(CacheError::Connection(format!("{op} refused")));
        }
        Ok(())
    }
}

#[async_trait]
impl SharedCache for MemorySharedCache {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        Self::check(&self.fail_reads, "GET")?;
        let mut entries = self.entries.lock();
        match entries.get(key) {
            Some(stored) if stored.expires_at > Instant::now() => Ok(Some(stored.value.clone())),
            Some(_) => {
                entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<(), CacheError> {
        Self::check(&self.fail_writes, "SET")?;
        self.entries.lock().insert(
            key.to_string(),
            Stored {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), CacheError> {
        Self::check(&self.fail_deletes, "DEL")?;
        self.entries.lock().remove(key);
        Ok(())
    }
}
