//! Scenario endpoints.
//!
//! | Method | Path | |
//! |---|---|---|
//! | GET | `/api/scenarios` | summaries |
//! | GET | `/api/scenarios/{id}` | full configuration |
//! | POST | `/api/scenarios/{id}/actions/{action_id}` | run one action |
//! | GET | `/api/scenarios/{id}/state` | dashboard state |

use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::registry::ScenarioRegistry;
use crate::scenario::{Scenario, ScenarioDetail, ScenarioSummary};

pub type AppState = Arc<ScenarioRegistry>;

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn lookup(registry: &ScenarioRegistry, id: &str) -> Result<Arc<dyn Scenario>, Response> {
    registry
        .get(id)
        .ok_or_else(|| error(StatusCode::NOT_FOUND, "Scenario not found"))
}

pub async fn list_scenarios(State(registry): State<AppState>) -> impl IntoResponse {
    let summaries: Vec<ScenarioSummary> = registry
        .list()
        .iter()
        .map(|s| ScenarioSummary::of(s.as_ref()))
        .collect();
    Json(summaries)
}

pub async fn get_scenario(
    State(registry): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ScenarioDetail>, Response> {
    let scenario = lookup(&registry, &id)?;
    Ok(Json(ScenarioDetail::of(scenario.as_ref())))
}

pub async fn execute_action(
    State(registry): State<AppState>,
    Path((id, action_id)): Path<(String, String)>,
    body: Option<Json<Value>>,
) -> Result<Json<Value>, Response> {
    let scenario = lookup(&registry, &id)?;
    let params = body.map(|Json(v)| v);
    match scenario.execute_action(&action_id, params).await {
        Ok(result) => Ok(Json(json!({
            "status": "success",
            "message": "Action executed successfully.",
            "result": result,
        }))),
        Err(e) => {
            tracing::warn!(scenario = %id, action = %action_id, error = %e, "Scenario action failed");
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

pub async fn get_state(
    State(registry): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<Value>, Response> {
    let scenario = lookup(&registry, &id)?;
    scenario
        .fetch_state()
        .await
        .map(|state| Json(Value::Object(state)))
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
}
