//! Cross-DC cache synchronization.
//!
//! Writes land on the origin; the change stream drives shared-tier deletes
//! and a broadcast that clears every process's local tier. The actions walk
//! through one read, one write and a second read that must miss both tiers.

mod backend;

pub use backend::{Connections, LiveBackend, MemoryBackend, PipelineParts, ProductOrigin, XdcBackend};

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::{Map, Value, json};
use tiersync_core::{
    CacheAside, ChangeStreamListener, EventLog, InvalidationPipeline, KeySpace, TierManager,
};
use tiersync_postgres::{PRODUCT_SCHEMA, PRODUCT_TABLE, Product};
use time::OffsetDateTime;
use time::format_description::well_known::Rfc3339;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::config::{AppConfig, Backend, BusConfig, ListenerConfig};
use crate::scenario::{Action, DashboardComponent, Scenario, ScenarioError};

pub const SCENARIO_ID: &str = "xdc_cache_sync";

/// Tunables taken from [`AppConfig`].
#[derive(Debug, Clone)]
pub struct XdcOptions {
    pub product_id: i64,
    pub settle_delay: Duration,
    pub shared_ttl: Duration,
    pub bus: BusConfig,
    pub listener: ListenerConfig,
}

impl XdcOptions {
    pub fn from_config(cfg: &AppConfig) -> Self {
        Self {
            product_id: cfg.scenario.test_product_id,
            settle_delay: cfg.scenario.settle_delay(),
            shared_ttl: cfg.cache.shared_ttl(),
            bus: cfg.bus.clone(),
            listener: cfg.listener.clone(),
        }
    }
}

impl Default for XdcOptions {
    fn default() -> Self {
        Self::from_config(&AppConfig::default())
    }
}

pub struct XdcCacheSync {
    backend: Arc<dyn XdcBackend>,
    options: XdcOptions,
    log: EventLog,
    aside: RwLock<Option<Arc<CacheAside<ProductOrigin>>>>,
    pipeline: Mutex<Option<InvalidationPipeline<Product>>>,
}

impl XdcCacheSync {
    pub fn new(backend: Arc<dyn XdcBackend>, options: XdcOptions) -> Self {
        Self {
            backend,
            options,
            log: EventLog::new(),
            aside: RwLock::new(None),
            pipeline: Mutex::new(None),
        }
    }

    /// Scenario with the backend selected by `scenario.backend`.
    pub fn from_config(cfg: &AppConfig) -> Self {
        let backend: Arc<dyn XdcBackend> = match cfg.scenario.backend {
            Backend::Live => Arc::new(LiveBackend::new(
                cfg.postgres.to_postgres_config(),
                cfg.redis.to_redis_config(),
            )),
            Backend::Memory => Arc::new(MemoryBackend::new()),
        };
        Self::new(backend, XdcOptions::from_config(cfg))
    }

    pub fn event_log(&self) -> &EventLog {
        &self.log
    }

    fn aside(&self) -> Result<Arc<CacheAside<ProductOrigin>>, ScenarioError> {
        self.aside.read().clone().ok_or(ScenarioError::NotInitialized)
    }

    fn fail<E: std::fmt::Display>(&self, what: &str, err: E) -> E {
        self.log.push(format!("{what}: {err}"));
        err
    }

    async fn pipeline_running(&self) -> bool {
        self.pipeline
            .lock()
            .await
            .as_ref()
            .is_some_and(InvalidationPipeline::is_running)
    }

    async fn start_pipeline(&self) -> Result<Value, ScenarioError> {
        let aside = self.aside()?;
        let mut slot = self.pipeline.lock().await;
        if slot.as_ref().is_some_and(InvalidationPipeline::is_running) {
            return Err(ScenarioError::AlreadyRunning);
        }

        self.log.push("Starting change stream listener...");
        let parts = self
            .backend
            .pipeline_parts(self.options.bus.settings(subscriber_id()))
            .await
            .map_err(|e| self.fail("Failed to prepare pipeline", e))?;

        let listener =
            ChangeStreamListener::with_capacity(parts.source, self.options.listener.queue_capacity)
                .with_reconnect_delay(self.options.listener.reconnect_delay());
        for (schema, table) in self.options.listener.table_filters() {
            listener.add_table_filter(&schema, &table);
        }

        let pipeline = InvalidationPipeline::new(
            listener,
            parts.bus,
            KeySpace::new().with_table(PRODUCT_SCHEMA, PRODUCT_TABLE, PRODUCT_TABLE),
            Arc::clone(aside.tiers()),
        )?
        .with_event_log(self.log.clone());

        pipeline
            .start()
            .await
            .map_err(|e| self.fail("Failed to start invalidation pipeline", e))?;
        *slot = Some(pipeline);

        Ok(json!("System initialized successfully"))
    }

    async fn read_first(&self) -> Result<Value, ScenarioError> {
        let aside = self.aside()?;
        let id = self.options.product_id;
        self.log.push("Creating/Reading test web_product data...");

        let existing = aside
            .origin()
            .fetch(&id)
            .await
            .map_err(|e| self.fail("Failed to look up test data", e))?;
        if existing.is_none() {
            aside
                .write(&seed_product(id))
                .await
                .map_err(|e| self.fail("Failed to create test data", e))?;
            self.log.push("Test data created in origin store");
            if self.pipeline_running().await {
                // Let the insert's invalidation pass before populating caches.
                tokio::time::sleep(self.options.settle_delay).await;
            }
        }

        self.read(&aside, id).await
    }

    async fn update_record(&self) -> Result<Value, ScenarioError> {
        let aside = self.aside()?;
        let id = self.options.product_id;
        self.log.push("Updating test product extra field...");

        let Some(mut product) = aside
            .origin()
            .fetch(&id)
            .await
            .map_err(|e| self.fail("Failed to load product", e))?
        else {
            let err = ScenarioError::NotFound(format!(
                "product {id} does not exist; run read_first first"
            ));
            return Err(self.fail("Failed to update product", err));
        };

        product.version += 1;
        product.extra = json!({
            "description": "Updated test data",
            "version": product.version,
            "timestamp": OffsetDateTime::now_utc().format(&Rfc3339).unwrap_or_default(),
        })
        .to_string();
        aside
            .write(&product)
            .await
            .map_err(|e| self.fail("Failed to update product", e))?;

        self.log
            .push("Product updated in origin store, change event should be emitted");
        self.log.push("Waiting for change event processing...");
        tokio::time::sleep(self.options.settle_delay).await;

        Ok(json!({
            "message": "Product updated, change event emitted",
            "version": product.version,
        }))
    }

    async fn read_second(&self) -> Result<Value, ScenarioError> {
        let aside = self.aside()?;
        self.log.push("Reading product after update...");
        self.read(&aside, self.options.product_id).await
    }

    async fn read(
        &self,
        aside: &CacheAside<ProductOrigin>,
        id: i64,
    ) -> Result<Value, ScenarioError> {
        let lookup = aside
            .read(&id)
            .await
            .map_err(|e| self.fail("Failed to read product", e))?
            .ok_or_else(|| ScenarioError::NotFound(format!("product {id} does not exist")))?;

        self.log.push(format!(
            "Product read from {} tier: id={}, version={}, extra={}",
            lookup.source, lookup.value.id, lookup.value.version, lookup.value.extra
        ));
        Ok(serde_json::to_value(lookup)?)
    }
}

fn seed_product(id: i64) -> Product {
    Product::new(id, "TEST_PRODUCT_001", "Test Product for XDC Cache Sync")
        .with_extra(r#"{"description": "Initial test data", "version": 1}"#)
}

/// Unique per process instance, so broadcast delivery reaches every process.
fn subscriber_id() -> String {
    let host = hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .unwrap_or_else(|| "tiersync".to_string());
    format!("{host}-{}", Uuid::new_v4().simple())
}

#[async_trait]
impl Scenario for XdcCacheSync {
    fn id(&self) -> &'static str {
        SCENARIO_ID
    }

    fn name(&self) -> &'static str {
        "Cross-DC Cache Synchronization"
    }

    fn category(&self) -> &'static str {
        "Distributed Systems"
    }

    fn problem_description(&self) -> &'static str {
        "In a multi-DC setup, writes happen in DC A but reads happen in DC B. When data is \
         updated in DC A, the shared and local caches in DC B stay stale until their TTL \
         expires, so services in DC B keep serving outdated data."
    }

    fn solution_description(&self) -> &'static str {
        "Capture row changes from the database change log, delete the shared cache entry, \
         and broadcast an invalidation message that every process uses to clear its local \
         cache. Staleness is bounded by pipeline latency instead of the TTL."
    }

    fn deep_dive_link(&self) -> &'static str {
        "https://github.com/alibaba/canal"
    }

    fn actions(&self) -> Vec<Action> {
        vec![
            Action {
                id: "initialize",
                name: "Initialize System",
                description: "Start the change stream listener, the change event processor and \
                              the invalidation bus consumer",
            },
            Action {
                id: "read_first",
                name: "Read First",
                description: "Create the test web_product row if missing and read it, filling \
                              the shared and local caches",
            },
            Action {
                id: "update_record",
                name: "Update Record",
                description: "Update the extra field of the test row; the change stream picks \
                              the mutation up and invalidates the caches",
            },
            Action {
                id: "read_second",
                name: "Read Second",
                description: "Read the test row again; expected to miss both caches and load \
                              the latest version from the origin store",
            },
        ]
    }

    fn dashboard_components(&self) -> Vec<DashboardComponent> {
        vec![
            DashboardComponent {
                id: "origin_record",
                name: "Origin Product Record",
                kind: "key_value",
            },
            DashboardComponent {
                id: "shared_cache",
                name: "Shared Cache",
                kind: "key_value",
            },
            DashboardComponent {
                id: "local_cache",
                name: "Local Cache",
                kind: "key_value",
            },
            DashboardComponent {
                id: "cache_stats",
                name: "Cache Statistics",
                kind: "key_value",
            },
            DashboardComponent {
                id: "logs",
                name: "Live Logs",
                kind: "log_stream",
            },
        ]
    }

    async fn initialize(&self) -> Result<(), ScenarioError> {
        if self.aside.read().is_some() {
            return Ok(());
        }
        let connections = self
            .backend
            .connect(&self.log)
            .await
            .map_err(|e| self.fail("Failed to connect", e))?;

        let tiers = Arc::new(TierManager::new(connections.shared));
        self.log.push("Local cache initialized");

        let aside = CacheAside::new(tiers, connections.origin)
            .with_shared_ttl(self.options.shared_ttl)
            .with_event_log(self.log.clone());
        *self.aside.write() = Some(Arc::new(aside));
        self.log.push(format!(
            "Cache manager initialized ({} backend)",
            self.backend.describe()
        ));
        Ok(())
    }

    async fn execute_action(
        &self,
        action_id: &str,
        _params: Option<Value>,
    ) -> Result<Value, ScenarioError> {
        match action_id {
            "initialize" => self.start_pipeline().await,
            "read_first" => self.read_first().await,
            "update_record" => self.update_record().await,
            "read_second" => self.read_second().await,
            other => Err(ScenarioError::UnknownAction(other.to_string())),
        }
    }

    async fn fetch_state(&self) -> Result<Map<String, Value>, ScenarioError> {
        let aside = self.aside()?;
        let id = self.options.product_id;
        let key = aside.cache_key(&id);

        let origin_record = match aside.origin().fetch(&id).await {
            Ok(Some(product)) => serde_json::to_value(product)?,
            Ok(None) => Value::Null,
            Err(e) => json!({ "error": e.to_string() }),
        };

        let shared_value = match aside.tiers().shared().get(&key).await {
            Ok(Some(bytes)) => serde_json::from_slice(&bytes)
                .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned())),
            Ok(None) => Value::Null,
            Err(e) => json!({ "error": e.to_string() }),
        };
        let mut shared_cache = Map::new();
        shared_cache.insert(key, shared_value);

        let mut local_cache = Map::new();
        for (key, product) in aside.tiers().local().snapshot() {
            local_cache.insert(key, serde_json::to_value(product)?);
        }

        let mut cache_stats = serde_json::to_value(aside.tiers().get_stats())?;
        {
            let pipeline = self.pipeline.lock().await;
            if let Value::Object(stats) = &mut cache_stats {
                stats.insert(
                    "pipeline_running".into(),
                    Value::Bool(pipeline.as_ref().is_some_and(InvalidationPipeline::is_running)),
                );
                stats.insert(
                    "pipeline".into(),
                    match pipeline.as_ref() {
                        Some(p) => serde_json::to_value(p.stats())?,
                        None => Value::Null,
                    },
                );
            }
        }

        let mut state = Map::new();
        state.insert("origin_record".into(), origin_record);
        state.insert("shared_cache".into(), Value::Object(shared_cache));
        state.insert("local_cache".into(), Value::Object(local_cache));
        state.insert("cache_stats".into(), cache_stats);
        state.insert("logs".into(), json!(self.log.entries()));
        Ok(state)
    }

    async fn shutdown(&self) {
        if let Some(pipeline) = self.pipeline.lock().await.as_ref() {
            pipeline.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scenario() -> XdcCacheSync {
        let options = XdcOptions {
            settle_delay: Duration::from_millis(200),
            ..Default::default()
        };
        XdcCacheSync::new(Arc::new(MemoryBackend::new()), options)
    }

    #[tokio::test]
    async fn test_walkthrough_second_read_comes_from_origin() {
        let scenario = scenario();
        scenario.initialize().await.unwrap();
        scenario.execute_action("initialize", None).await.unwrap();

        let first = scenario.execute_action("read_first", None).await.unwrap();
        assert_eq!(first["source"], "origin");
        assert_eq!(first["value"]["version"], 1);

        let again = scenario.execute_action("read_first", None).await.unwrap();
        assert_eq!(again["source"], "local");

        let updated = scenario.execute_action("update_record", None).await.unwrap();
        assert_eq!(updated["version"], 2);

        let state = scenario.fetch_state().await.unwrap();
        assert!(state["local_cache"].as_object().unwrap().is_empty());
        assert!(state["shared_cache"]["web_product:10001"].is_null());
        assert_eq!(state["origin_record"]["version"], 2);

        let second = scenario.execute_action("read_second", None).await.unwrap();
        assert_eq!(second["source"], "origin");
        assert_eq!(second["value"]["version"], 2);

        let state = scenario.fetch_state().await.unwrap();
        assert_eq!(state["cache_stats"]["origin_queries"], 2);
        assert_eq!(state["cache_stats"]["local_hits"], 1);
        assert_eq!(state["cache_stats"]["pipeline_running"], true);
        for component in scenario.dashboard_components() {
            assert!(state.contains_key(component.id), "missing {}", component.id);
        }
        assert!(!state["logs"].as_array().unwrap().is_empty());

        scenario.shutdown().await;
        let state = scenario.fetch_state().await.unwrap();
        assert_eq!(state["cache_stats"]["pipeline_running"], false);
    }

    #[tokio::test]
    async fn test_initialize_action_twice_is_an_error() {
        let scenario = scenario();
        scenario.initialize().await.unwrap();
        scenario.execute_action("initialize", None).await.unwrap();
        let err = scenario.execute_action("initialize", None).await.unwrap_err();
        assert!(matches!(err, ScenarioError::AlreadyRunning));
        scenario.shutdown().await;
    }

    #[tokio::test]
    async fn test_actions_require_initialize() {
        let scenario = scenario();
        assert!(matches!(
            scenario.execute_action("read_first", None).await,
            Err(ScenarioError::NotInitialized)
        ));
        assert!(matches!(
            scenario.fetch_state().await,
            Err(ScenarioError::NotInitialized)
        ));
    }

    #[tokio::test]
    async fn test_unknown_action_and_missing_record() {
        let scenario = scenario();
        scenario.initialize().await.unwrap();
        assert!(matches!(
            scenario.execute_action("explode", None).await,
            Err(ScenarioError::UnknownAction(ref id)) if id == "explode"
        ));
        assert!(matches!(
            scenario.execute_action("update_record", None).await,
            Err(ScenarioError::NotFound(_))
        ));
    }
}
