use std::sync::Arc;

use agent_runtime::ConversationKey;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use shared_types::CreateConversationRequest;

use super::{parse_conversation_id, ApiError};
use crate::middleware::CurrentUser;
use crate::AppState;

const MAX_TITLE_CHARS: usize = 500;

pub async fn create_conversation(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Json(req): Json<CreateConversationRequest>,
) -> Result<impl IntoResponse, ApiError> {
    if let Some(title) = &req.title {
        if title.chars().count() > MAX_TITLE_CHARS {
            return Err(ApiError::BadRequest(format!(
                "title must be at most {MAX_TITLE_CHARS} characters"
            )));
        }
    }

    let conversation = state
        .conversations
        .create(&user_id, req.title.as_deref())
        .await?;
    Ok((StatusCode::CREATED, Json(conversation)))
}

pub async fn list_messages(
    State(state): State<Arc<AppState>>,
    Extension(CurrentUser(user_id)): Extension<CurrentUser>,
    Path(conversation_id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    let conversation_id = parse_conversation_id(&conversation_id)?;
    let messages = state
        .conversations
        .list_messages(&ConversationKey::new(conversation_id, user_id))
        .await?;
    Ok(Json(messages))
}
