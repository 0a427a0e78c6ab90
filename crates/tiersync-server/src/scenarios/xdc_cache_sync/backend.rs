//! Collaborators of the cross-DC scenario.

use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use tiersync_core::memory::{MemoryBroker, MemoryChangeSource, MemoryOrigin, MemorySharedCache};
use tiersync_core::{BusSettings, ChangeSource, EventLog, InvalidationBus, OriginStore, SharedCache};
use tiersync_postgres::{
    PRODUCT_SCHEMA, PRODUCT_TABLE, PgChangeSource, PgPool, PostgresConfig, Product, ProductStore,
    install_change_trigger, install_notify_function,
};
use tiersync_redis::{RedisConfig, RedisInvalidationBus, RedisSharedCache};
use tracing::instrument;

use crate::scenario::ScenarioError;

pub type ProductOrigin = dyn OriginStore<Id = i64, Record = Product>;

/// Long-lived handles, opened once at startup.
pub struct Connections {
    pub origin: Arc<ProductOrigin>,
    pub shared: Arc<dyn SharedCache>,
}

/// Fresh change source and bus for one pipeline run.
pub struct PipelineParts {
    pub source: Arc<dyn ChangeSource>,
    pub bus: Arc<dyn InvalidationBus>,
}

#[async_trait]
pub trait XdcBackend: Send + Sync {
    fn describe(&self) -> &'static str;

    async fn connect(&self, log: &EventLog) -> Result<Connections, ScenarioError>;

    /// Only valid after a successful [`XdcBackend::connect`].
    async fn pipeline_parts(&self, settings: BusSettings) -> Result<PipelineParts, ScenarioError>;
}

// =============================================================================
// PostgreSQL + Redis
// =============================================================================

pub struct LiveBackend {
    postgres: PostgresConfig,
    redis: RedisConfig,
    pools: Mutex<Option<(PgPool, tiersync_redis::Pool)>>,
}

impl LiveBackend {
    pub fn new(postgres: PostgresConfig, redis: RedisConfig) -> Self {
        Self {
            postgres,
            redis,
            pools: Mutex::new(None),
        }
    }
}

#[async_trait]
impl XdcBackend for LiveBackend {
    fn describe(&self) -> &'static str {
        "live"
    }

    #[instrument(skip_all)]
    async fn connect(&self, log: &EventLog) -> Result<Connections, ScenarioError> {
        let pg = tiersync_postgres::create_pool(&self.postgres).await?;
        log.push("Connected to PostgreSQL successfully");

        let store = ProductStore::new(pg.clone());
        store.ensure_schema().await?;
        install_notify_function(&pg).await?;
        install_change_trigger(&pg, PRODUCT_SCHEMA, PRODUCT_TABLE, &["id"], &self.postgres.channel)
            .await?;
        log.push(format!(
            "Change trigger installed on {PRODUCT_TABLE} (channel {})",
            self.postgres.channel
        ));

        let redis = tiersync_redis::create_pool(&self.redis).await?;
        log.push("Connected to Redis successfully");

        *self.pools.lock() = Some((pg, redis.clone()));
        Ok(Connections {
            origin: Arc::new(store),
            shared: Arc::new(RedisSharedCache::new(redis)),
        })
    }

    async fn pipeline_parts(&self, settings: BusSettings) -> Result<PipelineParts, ScenarioError> {
        let (pg, redis) = self
            .pools
            .lock()
            .clone()
            .ok_or(ScenarioError::NotInitialized)?;
        Ok(PipelineParts {
            source: Arc::new(PgChangeSource::new(pg, &self.postgres.channel)),
            bus: Arc::new(RedisInvalidationBus::new(redis, &self.redis.url, settings)),
        })
    }
}

// =============================================================================
// In-process
// =============================================================================

/// Every collaborator in memory. Origin writes are fed to the change source
/// the way a database trigger would.
pub struct MemoryBackend {
    broker: MemoryBroker,
    source: Arc<MemoryChangeSource>,
    origin: Arc<MemoryOrigin<Product>>,
    shared: Arc<MemorySharedCache>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        let (source, feed) = MemoryChangeSource::new();
        Self {
            broker: MemoryBroker::new(),
            source: Arc::new(source),
            origin: Arc::new(MemoryOrigin::new(PRODUCT_SCHEMA, PRODUCT_TABLE, "id", feed)),
            shared: Arc::new(MemorySharedCache::new()),
        }
    }
}

impl Default for MemoryBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl XdcBackend for MemoryBackend {
    fn describe(&self) -> &'static str {
        "memory"
    }

    async fn connect(&self, log: &EventLog) -> Result<Connections, ScenarioError> {
        log.push("Using in-memory origin store, shared cache and bus");
        Ok(Connections {
            origin: Arc::clone(&self.origin) as Arc<ProductOrigin>,
            shared: Arc::clone(&self.shared) as Arc<dyn SharedCache>,
        })
    }

    async fn pipeline_parts(&self, settings: BusSettings) -> Result<PipelineParts, ScenarioError> {
        Ok(PipelineParts {
            source: Arc::clone(&self.source) as Arc<dyn ChangeSource>,
            bus: Arc::new(self.broker.bus(settings)),
        })
    }
}
