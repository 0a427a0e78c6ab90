//! Built-in scenarios.

pub mod xdc_cache_sync;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::registry::{RegistryError, ScenarioRegistry};

pub use xdc_cache_sync::XdcCacheSync;

/// Registry holding every built-in scenario, configured from `cfg`.
pub fn build_registry(cfg: &AppConfig) -> Result<ScenarioRegistry, RegistryError> {
    let mut registry = ScenarioRegistry::new();
    registry.register(Arc::new(XdcCacheSync::from_config(cfg)))?;
    Ok(registry)
}
