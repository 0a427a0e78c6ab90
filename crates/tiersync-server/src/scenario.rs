//! Demonstration scenarios driven by the HTTP shell.
//!
//! Each scenario owns its own connections and state; the shell only calls
//! [`Scenario::initialize`] once at startup, then dispatches actions and
//! polls [`Scenario::fetch_state`].

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{Map, Value};
use tiersync_core::{BusError, CacheError, OriginError, PipelineError};
use tiersync_postgres::PostgresError;
use tiersync_redis::RedisError;

/// A user-triggerable step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Action {
    pub id: &'static str,
    pub name: &'static str,
    pub description: &'static str,
}

/// A piece of state shown on the dashboard; `id` matches a key of
/// [`Scenario::fetch_state`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DashboardComponent {
    pub id: &'static str,
    pub name: &'static str,
    /// e.g. `key_value`, `log_stream`
    #[serde(rename = "type")]
    pub kind: &'static str,
}

#[derive(Debug, thiserror::Error)]
pub enum ScenarioError {
    #[error("unknown action: {0}")]
    UnknownAction(String),

    #[error("scenario is not initialized")]
    NotInitialized,

    #[error("invalidation pipeline is already running")]
    AlreadyRunning,

    #[error("{0}")]
    NotFound(String),

    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error(transparent)]
    Origin(#[from] OriginError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error(transparent)]
    Bus(#[from] BusError),

    #[error(transparent)]
    Postgres(#[from] PostgresError),

    #[error(transparent)]
    Redis(#[from] RedisError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

#[async_trait]
pub trait Scenario: Send + Sync {
    fn id(&self) -> &'static str;
    fn name(&self) -> &'static str;
    fn category(&self) -> &'static str;
    fn problem_description(&self) -> &'static str;
    fn solution_description(&self) -> &'static str;
    fn deep_dive_link(&self) -> &'static str;
    fn actions(&self) -> Vec<Action>;
    fn dashboard_components(&self) -> Vec<DashboardComponent>;

    /// Connect collaborators. Called once at process start; a failure aborts
    /// startup.
    async fn initialize(&self) -> Result<(), ScenarioError>;

    async fn execute_action(
        &self,
        action_id: &str,
        params: Option<Value>,
    ) -> Result<Value, ScenarioError>;

    /// Current state keyed by dashboard component id.
    async fn fetch_state(&self) -> Result<Map<String, Value>, ScenarioError>;

    /// Stop background tasks.
    async fn shutdown(&self) {}
}

/// Listing entry.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioSummary {
    pub id: &'static str,
    pub title: &'static str,
    pub category: &'static str,
}

impl ScenarioSummary {
    pub fn of(scenario: &dyn Scenario) -> Self {
        Self {
            id: scenario.id(),
            title: scenario.name(),
            category: scenario.category(),
        }
    }
}

/// Full configuration of one scenario.
#[derive(Debug, Clone, Serialize)]
pub struct ScenarioDetail {
    pub id: &'static str,
    pub title: &'static str,
    pub category: &'static str,
    pub problem_description: &'static str,
    pub solution_description: &'static str,
    pub deep_dive_link: &'static str,
    pub actions: Vec<Action>,
    pub dashboard_components: Vec<DashboardComponent>,
}

impl ScenarioDetail {
    pub fn of(scenario: &dyn Scenario) -> Self {
        Self {
            id: scenario.id(),
            title: scenario.name(),
            category: scenario.category(),
            problem_description: scenario.problem_description(),
            solution_description: scenario.solution_description(),
            deep_dive_link: scenario.deep_dive_link(),
            actions: scenario.actions(),
            dashboard_components: scenario.dashboard_components(),
        }
    }
}
