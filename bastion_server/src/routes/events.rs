//! Collaborator event intake

use crate::routes::{bearer_matches, AppState};
use axum::{
    extract::State,
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
    Json, Router,
};
use bastion_common::ReportEventRequest;

pub fn router() -> Router<AppState> {
    Router::new().route("/api/events", post(report_event))
}

/// Queue a behavioral event for scoring
async fn report_event(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ReportEventRequest>,
) -> Response {
    if !bearer_matches(&headers, &state.config.service_token) {
        return (StatusCode::UNAUTHORIZED, "Unauthorized").into_response();
    }

    tracing::debug!("{} event reported for {}", req.event.kind(), req.identity);
    if let Err(e) = state.guard.report_event(&req.identity, req.event) {
        return e.into_response();
    }

    (
        StatusCode::ACCEPTED,
        Json(serde_json::json!({ "status": "accepted" })),
    )
        .into_response()
}
