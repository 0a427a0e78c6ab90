//! Scenario registry, built once at startup and shared by reference.

use std::collections::BTreeMap;
use std::sync::Arc;

use tracing::info;

use crate::scenario::{Scenario, ScenarioError};

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("scenario with ID '{0}' is already registered")]
    Duplicate(String),

    #[error("failed to initialize scenario '{id}': {source}")]
    Initialize {
        id: String,
        #[source]
        source: ScenarioError,
    },
}

#[derive(Default)]
pub struct ScenarioRegistry {
    scenarios: BTreeMap<&'static str, Arc<dyn Scenario>>,
}

impl ScenarioRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, scenario: Arc<dyn Scenario>) -> Result<(), RegistryError> {
        let id = scenario.id();
        if self.scenarios.contains_key(id) {
            return Err(RegistryError::Duplicate(id.to_string()));
        }
        self.scenarios.insert(id, scenario);
        Ok(())
    }

    pub fn get(&self, id: &str) -> Option<Arc<dyn Scenario>> {
        self.scenarios.get(id).cloned()
    }

    /// Every scenario, ordered by id.
    pub fn list(&self) -> Vec<Arc<dyn Scenario>> {
        self.scenarios.values().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.scenarios.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scenarios.is_empty()
    }

    /// Initialize every scenario; the first failure aborts with its id.
    pub async fn initialize_all(&self) -> Result<(), RegistryError> {
        info!(count = self.scenarios.len(), "Initializing scenarios");
        for (id, scenario) in &self.scenarios {
            scenario
                .initialize()
                .await
                .map_err(|source| RegistryError::Initialize {
                    id: id.to_string(),
                    source,
                })?;
            info!(scenario = %id, "Scenario initialized");
        }
        Ok(())
    }

    pub async fn shutdown_all(&self) {
        for scenario in self.scenarios.values() {
            scenario.shutdown().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scenario::{Action, DashboardComponent};
    use async_trait::async_trait;
    use serde_json::{Map, Value};

    struct Fixed {
        id: &'static str,
        fail: bool,
    }

    #[async_trait]
    impl Scenario for Fixed {
        fn id(&self) -> &'static str {
            self.id
        }
        fn name(&self) -> &'static str {
            "Fixed"
        }
        fn category(&self) -> &'static str {
            "Test"
        }
        fn problem_description(&self) -> &'static str {
            ""
        }
        fn solution_description(&self) -> &'static str {
            ""
        }
        fn deep_dive_link(&self) -> &'static str {
            ""
        }
        fn actions(&self) -> Vec<Action> {
            Vec::new()
        }
        fn dashboard_components(&self) -> Vec<DashboardComponent> {
            Vec::new()
        }
        async fn initialize(&self) -> Result<(), ScenarioError> {
            if self.fail {
                return Err(ScenarioError::NotInitialized);
            }
            Ok(())
        }
        async fn execute_action(
            &self,
            action_id: &str,
            _params: Option<Value>,
        ) -> Result<Value, ScenarioError> {
            Err(ScenarioError::UnknownAction(action_id.to_string()))
        }
        async fn fetch_state(&self) -> Result<Map<String, Value>, ScenarioError> {
            Ok(Map::new())
        }
    }

    #[test]
    fn test_duplicate_registration_is_rejected() {
        let mut registry = ScenarioRegistry::new();
        registry
            .register(Arc::new(Fixed { id: "a", fail: false }))
            .unwrap();
        let err = registry
            .register(Arc::new(Fixed { id: "a", fail: false }))
            .unwrap_err();
        assert!(matches!(err, RegistryError::Duplicate(ref id) if id == "a"));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_list_is_ordered_by_id() {
        let mut registry = ScenarioRegistry::new();
        for id in ["b", "a", "c"] {
            registry.register(Arc::new(Fixed { id, fail: false })).unwrap();
        }
        let ids: Vec<_> = registry.list().iter().map(|s| s.id()).collect();
        assert_eq!(ids, ["a", "b", "c"]);
        assert!(registry.get("b").is_some());
        assert!(registry.get("z").is_none());
    }

    #[tokio::test]
    async fn test_initialize_all_names_failing_scenario() {
        let mut registry = ScenarioRegistry::new();
        registry.register(Arc::new(Fixed { id: "ok", fail: false })).unwrap();
        registry.register(Arc::new(Fixed { id: "broken", fail: true })).unwrap();

        let err = registry.initialize_all().await.unwrap_err();
        assert!(matches!(err, RegistryError::Initialize { ref id, .. } if id == "broken"));
    }
}
