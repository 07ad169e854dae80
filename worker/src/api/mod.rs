//! HTTP routes for the chat worker.

use std::sync::Arc;

use agent_runtime::{ChatError, StoreError};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{middleware as axum_middleware, Json, Router};
use serde_json::json;
use tracing::error;

pub mod chat;
pub mod conversations;

use crate::middleware::require_user;
use crate::AppState;

/// Configure all API routes
pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/health", get(health_check))
        .route("/api/conversations", post(conversations::create_conversation))
        .route(
            "/api/conversations/{conversation_id}/messages",
            get(conversations::list_messages),
        )
        .route("/api/conversations/{conversation_id}/chat", post(chat::chat))
}

/// Routes with the identity middleware and state applied.
pub fn app(state: Arc<AppState>) -> Router {
    router()
        .layer(axum_middleware::from_fn(require_user))
        .with_state(state)
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": "worker",
        "version": env!("CARGO_PKG_VERSION")
    }))
}

#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    #[error("{0}")]
    BadRequest(String),

    #[error("{0}")]
    PayloadTooLarge(String),

    #[error("conversation not found")]
    NotFound,

    #[error("agent service unavailable")]
    Upstream(String),

    #[error("internal server error")]
    Internal(String),
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(_) => ApiError::NotFound,
            StoreError::Backend(message) => ApiError::Internal(message),
        }
    }
}

impl From<ChatError> for ApiError {
    fn from(err: ChatError) -> Self {
        match err {
            ChatError::InvalidState(message) => ApiError::BadRequest(message),
            ChatError::Store(store) => store.into(),
            ChatError::UnresolvableIdentity { .. } => ApiError::Upstream(err.to_string()),
            ChatError::AgentService(service) => ApiError::Upstream(service.to_string()),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::BadRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::PayloadTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Upstream(detail) => {
                error!(detail = %detail, "agent service failure");
                StatusCode::BAD_GATEWAY
            }
            ApiError::Internal(detail) => {
                error!(detail = %detail, "request failed");
                StatusCode::INTERNAL_SERVER_ERROR
            }
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}

/// Conversation ids are UUIDs; anything else is rejected before touching storage.
pub(crate) fn parse_conversation_id(raw: &str) -> Result<String, ApiError> {
    uuid::Uuid::parse_str(raw)
        .map(|id| id.to_string())
        .map_err(|_| ApiError::BadRequest("invalid conversation id".to_string()))
}
