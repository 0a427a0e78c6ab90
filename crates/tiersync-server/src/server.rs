use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json, Router,
    response::IntoResponse,
    routing::{get, post},
};
use serde_json::json;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::AppConfig;
use crate::registry::ScenarioRegistry;
use crate::routes::scenarios;

pub struct TiersyncServer {
    addr: SocketAddr,
    app: Router,
    registry: Arc<ScenarioRegistry>,
}

async fn health() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

pub fn build_app(registry: Arc<ScenarioRegistry>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/scenarios", get(scenarios::list_scenarios))
        .route("/api/scenarios/{id}", get(scenarios::get_scenario))
        .route(
            "/api/scenarios/{id}/actions/{action_id}",
            post(scenarios::execute_action),
        )
        .route("/api/scenarios/{id}/state", get(scenarios::get_state))
        .with_state(registry)
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
}

impl TiersyncServer {
    pub fn new(cfg: &AppConfig, registry: Arc<ScenarioRegistry>) -> Self {
        Self {
            addr: cfg.addr(),
            app: build_app(Arc::clone(&registry)),
            registry,
        }
    }

    /// Serve until Ctrl+C, then stop every scenario's background tasks.
    pub async fn run(self) -> anyhow::Result<()> {
        let listener = tokio::net::TcpListener::bind(self.addr).await?;
        tracing::info!("listening on {}", self.addr);
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown_signal())
            .await?;
        self.registry.shutdown_all().await;
        tracing::info!("scenarios stopped");
        Ok(())
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to install Ctrl+C handler, graceful shutdown disabled");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
