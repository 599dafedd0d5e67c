//! Error taxonomy for the abuse-mitigation core

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

#[derive(Debug, thiserror::Error)]
pub enum GuardError {
    /// An active block already exists for the identity
    #[error("Identity {0} is already blocked")]
    Conflict(String),

    /// No active block exists for the identity
    #[error("No active block for identity {0}")]
    NotFound(String),

    /// The block registry could not be reached
    #[error("Block store unavailable: {0}")]
    StoreUnavailable(String),

    /// No usable client identity on the request
    #[error("Could not resolve client identity")]
    UnresolvableIdentity,
}

impl GuardError {
    pub fn status(&self) -> StatusCode {
        match self {
            GuardError::Conflict(_) => StatusCode::CONFLICT,
            GuardError::NotFound(_) => StatusCode::NOT_FOUND,
            GuardError::StoreUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            GuardError::UnresolvableIdentity => StatusCode::BAD_REQUEST,
        }
    }
}

impl From<sqlx::Error> for GuardError {
    fn from(e: sqlx::Error) -> Self {
        GuardError::StoreUnavailable(e.to_string())
    }
}

impl IntoResponse for GuardError {
    fn into_response(self) -> Response {
        if let GuardError::StoreUnavailable(ref e) = self {
            tracing::error!("Store error on admin path: {}", e);
        }
        (
            self.status(),
            Json(serde_json::json!({ "error": self.to_string() })),
        )
            .into_response()
    }
}
