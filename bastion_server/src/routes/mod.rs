//! Route handlers for the Bastion server

pub mod admin;
pub mod events;
pub mod guard;

use crate::abuse::{BlockRepository, Guard};
use crate::config::Config;
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    middleware,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub guard: Guard,
}

impl AppState {
    pub fn new(config: Config, repo: Arc<dyn BlockRepository>) -> Self {
        let guard = Guard::new(repo, &config);
        Self {
            config: Arc::new(config),
            guard,
        }
    }
}

/// Build the full HTTP pipeline. Everything except `/health` passes the gate.
pub fn app(state: AppState) -> Router {
    let gated = Router::new()
        .nest("/api/admin", admin::router())
        .merge(events::router())
        .fallback(not_found)
        .layer(middleware::from_fn_with_state(state.clone(), guard::track_request))
        .layer(middleware::from_fn_with_state(state.clone(), guard::gate));

    Router::new()
        .route("/health", get(health_check))
        .merge(gated)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}

/// Bearer token check. An empty expected token disables the route.
pub(crate) fn bearer_matches(headers: &HeaderMap, expected: &str) -> bool {
    if expected.is_empty() {
        return false;
    }

    headers
        .get("Authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
        .map(|t| t == expected)
        .unwrap_or(false)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let store_status = match state.guard.store.ping().await {
        Ok(()) => "ok",
        Err(e) => {
            tracing::warn!("Health check store ping failed: {}", e);
            "error"
        }
    };

    let status = if store_status == "ok" {
        "healthy"
    } else {
        "degraded"
    };

    Json(serde_json::json!({
        "status": status,
        "store": store_status,
        "tracked": state.guard.scorer.tracked(),
    }))
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Not found" })),
    )
}
