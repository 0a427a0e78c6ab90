//! Cache-aside reads and origin-only writes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::{debug, warn};

use crate::event_log::{EventLog, note};
use crate::keys::cache_key;
use crate::tiers::{CacheError, TierManager};

/// Default shared-tier TTL.
pub const DEFAULT_SHARED_TTL: Duration = Duration::from_secs(600);

/// Errors raised by the origin store.
#[derive(Debug, thiserror::Error)]
pub enum OriginError {
    #[error("Origin connection error: {0}")]
    Connection(String),

    #[error("Origin query error: {0}")]
    Query(String),

    #[error("Invalid record: {0}")]
    InvalidRecord(String),
}

/// The authoritative store.
///
/// Writes made here reach the caches only through the change stream.
#[async_trait]
pub trait OriginStore: Send + Sync {
    type Id: fmt::Display + Send + Sync;
    type Record: Clone + Serialize + DeserializeOwned + Send + Sync + 'static;

    /// Table name; also the cache key prefix.
    fn table(&self) -> &str;

    /// Point read by primary key.
    async fn fetch(&self, id: &Self::Id) -> Result<Option<Self::Record>, OriginError>;

    /// Insert or replace by primary key.
    async fn store(&self, record: &Self::Record) -> Result<(), OriginError>;
}

/// Tier a read was answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ReadSource {
    Local,
    Shared,
    Origin,
}

impl fmt::Display for ReadSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Local => f.write_str("local"),
            Self::Shared => f.write_str("shared"),
            Self::Origin => f.write_str("origin"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lookup<V> {
    pub value: V,
    pub source: ReadSource,
}

/// Read/write orchestrator over one origin table.
pub struct CacheAside<O: OriginStore + ?Sized> {
    tiers: Arc<TierManager<O::Record>>,
    origin: Arc<O>,
    shared_ttl: Duration,
    log: Option<EventLog>,
}

impl<O: OriginStore + ?Sized> CacheAside<O> {
    pub fn new(tiers: Arc<TierManager<O::Record>>, origin: Arc<O>) -> Self {
        Self {
            tiers,
            origin,
            shared_ttl: DEFAULT_SHARED_TTL,
            log: None,
        }
    }

    #[must_use]
    pub fn with_shared_ttl(mut self, ttl: Duration) -> Self {
        self.shared_ttl = ttl;
        self
    }

    #[must_use]
    pub fn with_event_log(mut self, log: EventLog) -> Self {
        self.log = Some(log);
        self
    }

    pub fn tiers(&self) -> &Arc<TierManager<O::Record>> {
        &self.tiers
    }

    pub fn origin(&self) -> &Arc<O> {
        &self.origin
    }

    /// Cache key of the record with `id`.
    pub fn cache_key(&self, id: &O::Id) -> String {
        cache_key(self.origin.table(), [id.to_string()])
    }

    /// Local tier, then shared tier, then origin; populating each tier on
    /// the way back.
    ///
    /// Returns `None` when the origin has no such record; nothing is cached
    /// in that case. Shared-tier failures are treated as misses.
    pub async fn read(&self, id: &O::Id) -> Result<Option<Lookup<O::Record>>, OriginError> {
        let key = self.cache_key(id);

        if let Some(value) = self.tiers.get(&key) {
            self.tiers.increment_local_hit();
            note(&self.log, "Cache HIT: local cache");
            return Ok(Some(Lookup {
                value,
                source: ReadSource::Local,
            }));
        }
        self.tiers.increment_local_miss();

        if let Some(value) = self.read_shared(&key).await {
            self.tiers.increment_shared_hit();
            note(&self.log, "Cache HIT: shared cache");
            self.tiers.set(key, value.clone());
            return Ok(Some(Lookup {
                value,
                source: ReadSource::Shared,
            }));
        }
        self.tiers.increment_shared_miss();

        self.tiers.increment_origin_query();
        note(&self.log, "Cache MISS: querying origin");
        let Some(value) = self.origin.fetch(id).await? else {
            debug!(key = %key, "Record not found in origin");
            return Ok(None);
        };

        if let Err(e) = self.populate_shared(&key, &value).await {
            warn!(key = %key, error = %e, "Failed to populate shared cache");
        }
        self.tiers.set(key, value.clone());
        note(&self.log, "Data cached to both shared and local cache");

        Ok(Some(Lookup {
            value,
            source: ReadSource::Origin,
        }))
    }

    /// Write to the origin only. The change stream takes care of the caches.
    pub async fn write(&self, record: &O::Record) -> Result<(), OriginError> {
        self.origin.store(record).await
    }

    async fn populate_shared(&self, key: &str, value: &O::Record) -> Result<(), CacheError> {
        let bytes = serde_json::to_vec(value)?;
        self.tiers.shared().set(key, bytes, self.shared_ttl).await
    }

    async fn read_shared(&self, key: &str) -> Option<O::Record> {
        let bytes = match self.tiers.shared().get(key).await {
            Ok(bytes) => bytes?,
            Err(e) => {
                warn!(key = %key, error = %e, "Shared cache read failed");
                return None;
            }
        };
        match serde_json::from_slice(&bytes) {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(key = %key, error = %e, "Discarding undecodable shared cache value");
                None
            }
        }
    }
}
