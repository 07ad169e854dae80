//! Streaming chat endpoint.

use std::convert::Infallible;
use std::sync::Arc;

use agent_runtime::ChatTurn;
use axum::extract::{Path, State};
use axum::http::header;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::{Extension, Json};
use futures_util::{future, stream, StreamExt};
use shared_types::{ChatRequest, ChatStreamEvent};
use tracing::{info, warn};

use super::{parse_conversation_id, ApiError};
use crate::middleware::CurrentUser;
use crate::AppState;

pub const MAX_CONTENT_BYTES: usize = 512 * 1024;

const SECURITY_HEADERS: [(header::HeaderName, &str); 4] = [
    (header::X_CONTENT_TYPE_OPTIONS, "nosniff"),
    (header::CACHE_CONTROL, "no-store"),
    (header::X_FRAME_OPTIONS, "DENY"),
    (header::REFERRER_POLICY, "no-referrer"),
];

/// Answer one user message as a `text/event-stream` of [`ChatStreamEvent`]s.
///
/// Deltas arrive as `text-delta`; a clean end is `finish`, a model failure is
/// a single `error` with nothing after it. The reply is persisted even if the
/// client goes away mid-stream.
pub async fn chat(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(conversation_id): Path<String>,
    Json(req): Json<ChatRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    if req.content.trim().is_empty() {
        return Err(ApiError::BadRequest("content must not be empty".to_string()));
    }
    if req.content.len() > MAX_CONTENT_BYTES {
        return Err(ApiError::PayloadTooLarge(format!(
            "content must be at most {MAX_CONTENT_BYTES} bytes"
        )));
    }

    let response = state
        .chat
        .run(ChatTurn::new(conversation_id.clone(), user_id, req.content))
        .await?;
    info!(conversation_id = %conversation_id, agent_id = %response.agent_id(), "chat stream started");

    let events = response
        .map(move |item| match item {
            Ok(delta) => ChatStreamEvent::TextDelta { delta },
            Err(e) => {
                warn!(conversation_id = %conversation_id, error = %e, "chat stream failed");
                ChatStreamEvent::Error {
                    message: "The agent stopped responding. Please try again.".to_string(),
                }
            }
        })
        .chain(stream::once(future::ready(ChatStreamEvent::Finish)))
        .scan(false, |failed, event| {
            if *failed {
                return future::ready(None);
            }
            *failed = matches!(event, ChatStreamEvent::Error { .. });
            future::ready(Some(event))
        })
        .map(|event| Ok::<_, Infallible>(sse_event(&event)));

    Ok((
        SECURITY_HEADERS,
        Sse::new(events).keep_alive(KeepAlive::default()),
    ))
}

fn sse_event(event: &ChatStreamEvent) -> Event {
    Event::default()
        .json_data(event)
        .unwrap_or_else(|_| Event::default().data(r#"{"type":"error","message":"encoding failed"}"#))
}
