use axum::{
    extract::Request,
    http::StatusCode,
    middleware::Next,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;

/// Set by the upstream auth layer.
pub const USER_ID_HEADER: &str = "x-user-id";

const MAX_USER_ID_LEN: usize = 256;

/// Authenticated caller, available to handlers as an extension.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CurrentUser(pub String);

/// Middleware: require a caller identity on everything except `/health`.
pub async fn require_user(mut req: Request, next: Next) -> Response {
    if req.uri().path() == "/health" {
        return next.run(req).await;
    }

    let user_id = req
        .headers()
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|id| !id.is_empty() && id.len() <= MAX_USER_ID_LEN)
        .map(str::to_string);

    match user_id {
        Some(user_id) => {
            req.extensions_mut().insert(CurrentUser(user_id));
            next.run(req).await
        }
        None => (
            StatusCode::UNAUTHORIZED,
            Json(json!({ "error": "not authenticated" })),
        )
            .into_response(),
    }
}
