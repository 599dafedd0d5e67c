//! Admin API for the block registry

use crate::error::GuardError;
use crate::routes::{bearer_matches, AppState};
use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use bastion_common::{constants, CreateBlockRequest, ListBlocksQuery, UnblockRequest};
use serde::Serialize;

/// Build the admin router (mounted under /api/admin)
pub fn router() -> Router<AppState> {
    Router::new()
        .route("/blocks", get(list_blocks).post(create_block))
        .route("/blocks/{identity}/unblock", post(unblock))
        .route("/stats", get(statistics))
        .route("/cleanup", post(cleanup))
        .route("/tracking/{identity}", get(tracking))
}

/// Validate admin token from the Authorization header
fn validate_admin(state: &AppState, headers: &HeaderMap) -> bool {
    bearer_matches(headers, &state.config.admin_token)
}

fn unauthorized() -> Response {
    (StatusCode::UNAUTHORIZED, "Unauthorized").into_response()
}

/// Acting admin, from X-Admin-User
fn actor(headers: &HeaderMap) -> String {
    headers
        .get(constants::ADMIN_USER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .unwrap_or("admin")
        .to_string()
}

fn respond<T: Serialize>(status: StatusCode, result: Result<T, GuardError>) -> Response {
    match result {
        Ok(body) => (status, Json(body)).into_response(),
        Err(e) => e.into_response(),
    }
}

async fn list_blocks(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ListBlocksQuery>,
) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    let result = state
        .guard
        .list_blocks(
            &query.filter(),
            query.page.unwrap_or(1),
            query.limit.unwrap_or(constants::DEFAULT_PAGE_LIMIT),
        )
        .await;
    respond(StatusCode::OK, result)
}

async fn create_block(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateBlockRequest>,
) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    let result = state
        .guard
        .block(
            &req.identity,
            req.kind,
            req.reason,
            &actor(&headers),
            req.expires_at,
            req.description,
        )
        .await;
    respond(StatusCode::CREATED, result)
}

async fn unblock(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identity): Path<String>,
    Json(req): Json<UnblockRequest>,
) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    let result = state
        .guard
        .unblock(&identity, &actor(&headers), &req.reason)
        .await;
    respond(StatusCode::OK, result)
}

async fn statistics(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }
    respond(StatusCode::OK, state.guard.statistics().await)
}

async fn cleanup(State(state): State<AppState>, headers: HeaderMap) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }
    respond(StatusCode::OK, state.guard.trigger_cleanup().await)
}

async fn tracking(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(identity): Path<String>,
) -> Response {
    if !validate_admin(&state, &headers) {
        return unauthorized();
    }

    match state.guard.tracking(&identity) {
        Ok(Some(snapshot)) => Json(snapshot).into_response(),
        Ok(None) => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({
                "error": format!("No fraud tracking for identity {}", identity)
            })),
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}
