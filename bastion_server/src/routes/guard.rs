//! Gate and request-event middleware

use crate::routes::AppState;
use axum::{
    body::{Body, Bytes},
    extract::{ConnectInfo, Request, State},
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use bastion_common::FraudEvent;
use futures_util::{stream, StreamExt};
use std::net::SocketAddr;

/// Largest request body buffered for scoring. Larger bodies pass through unscored.
pub const MAX_SCORED_BODY_BYTES: usize = 1024 * 1024;

/// Paths whose bodies are not client traffic and are never scored
const UNSCORED_PREFIXES: &[&str] = &["/api/admin", "/api/events"];

/// Resolved client identity, stored in request extensions by [`gate`]
#[derive(Debug, Clone)]
pub struct ClientIdentity(pub String);

/// Deny blocked identities before any handler runs
pub async fn gate(State(state): State<AppState>, mut request: Request, next: Next) -> Response {
    let peer = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| *addr);

    let (identity, decision) = state.guard.gate.gate_request(request.headers(), peer).await;

    if let Some(payload) = decision.denial() {
        return (StatusCode::FORBIDDEN, Json(payload)).into_response();
    }

    if let Some(identity) = identity {
        request.extensions_mut().insert(ClientIdentity(identity));
    }
    next.run(request).await
}

/// Report each allowed request to the fraud scorer without waiting on it
pub async fn track_request(State(state): State<AppState>, request: Request, next: Next) -> Response {
    let path = request.uri().path().to_string();
    let identity = request.extensions().get::<ClientIdentity>().cloned();

    let Some(ClientIdentity(identity)) = identity else {
        return next.run(request).await;
    };
    if UNSCORED_PREFIXES.iter().any(|prefix| path.starts_with(prefix)) {
        return next.run(request).await;
    }

    let (parts, body) = request.into_parts();
    let mut frames = body.into_data_stream();
    let mut buffered = Vec::new();
    let mut failure = None;
    let mut complete = false;
    while buffered.len() <= MAX_SCORED_BODY_BYTES {
        match frames.next().await {
            Some(Ok(chunk)) => buffered.extend_from_slice(&chunk),
            Some(Err(e)) => {
                failure = Some(e);
                break;
            }
            None => {
                complete = true;
                break;
            }
        }
    }
    let buffered = Bytes::from(buffered);

    if complete && buffered.len() <= MAX_SCORED_BODY_BYTES {
        state.guard.scorer.report(
            &identity,
            FraudEvent::Request {
                endpoint: path,
                body: String::from_utf8_lossy(&buffered).into_owned(),
            },
        );
        return next.run(Request::from_parts(parts, Body::from(buffered))).await;
    }

    // Replay what was read, then hand over the rest of the stream untouched
    match &failure {
        Some(e) => {
            tracing::debug!("Body from {} on {} unreadable, not scoring: {}", identity, path, e)
        }
        None => tracing::debug!(
            "Body from {} on {} exceeds {} bytes, not scoring",
            identity,
            path,
            MAX_SCORED_BODY_BYTES
        ),
    }
    let head = stream::iter(std::iter::once(Ok(buffered)).chain(failure.map(Err)));
    let body = Body::from_stream(head.chain(frames));
    next.run(Request::from_parts(parts, body)).await
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::abuse::MemoryBlockRepository;
    use crate::config::Config;
    use axum::{body::to_bytes, http::Method, middleware, routing::post, Router};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use std::time::Duration;
    use tower::ServiceExt;

    /// Gate and tracker in front of a handler that echoes the body length
    fn echo_app(state: AppState) -> Router {
        Router::new()
            .route(
                "/upload",
                post(|body: Body| async move {
                    match to_bytes(body, usize::MAX).await {
                        Ok(bytes) => bytes.len().to_string(),
                        Err(e) => format!("error: {}", e),
                    }
                }),
            )
            .layer(middleware::from_fn_with_state(state.clone(), track_request))
            .layer(middleware::from_fn_with_state(state.clone(), gate))
            .with_state(state)
    }

    fn state() -> AppState {
        AppState::new(Config::default(), Arc::new(MemoryBlockRepository::new()))
    }

    async fn upload(state: &AppState, body: Vec<u8>) -> (StatusCode, String) {
        let request = Request::builder()
            .method(Method::POST)
            .uri("/upload")
            .header("X-Forwarded-For", "198.51.100.40")
            .body(Body::from(body))
            .unwrap();
        let response = echo_app(state.clone()).oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8_lossy(&bytes).into_owned())
    }

    #[tokio::test]
    async fn test_small_body_is_scored_and_forwarded() {
        let state = state();
        let (status, body) = upload(&state, b"<script>alert(1)</script>".to_vec()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "25");

        let mut scored = false;
        for _ in 0..100 {
            if state.guard.scorer.snapshot("198.51.100.40").is_some_and(|s| s.requests == 1) {
                scored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scored);
    }

    #[tokio::test]
    async fn test_oversized_body_passes_through_unscored() {
        let state = state();
        let size = 2 * MAX_SCORED_BODY_BYTES + 17;
        let (status, body) = upload(&state, vec![b'a'; size]).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, size.to_string());
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(state.guard.scorer.snapshot("198.51.100.40").is_none());
    }

    #[tokio::test]
    async fn test_body_at_limit_is_scored() {
        let state = state();
        let (status, body) = upload(&state, vec![b'a'; MAX_SCORED_BODY_BYTES]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, MAX_SCORED_BODY_BYTES.to_string());

        let mut scored = false;
        for _ in 0..100 {
            if state.guard.scorer.snapshot("198.51.100.40").is_some() {
                scored = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(scored);
    }
}
