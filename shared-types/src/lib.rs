//! Shared types between the web client and the chat worker
//!
//! Serializable with serde for JSON over HTTP and server-sent events, and
//! exported to TypeScript with ts-rs for the web client.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ts_rs::TS;

pub const DEFAULT_CONVERSATION_TITLE: &str = "New Conversation";

// ============================================================================
// Conversations
// ============================================================================

/// A conversation owned by exactly one user.
///
/// `agent_id` starts out empty and is bound the first time an agent claim
/// succeeds. Once bound it never changes.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct Conversation {
    pub id: String,
    pub user_id: String,
    pub title: String,
    pub agent_id: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Conversation {
    pub fn is_bound(&self) -> bool {
        self.agent_id.is_some()
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct CreateConversationRequest {
    pub title: Option<String>,
}

// ============================================================================
// Messages
// ============================================================================

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[serde(rename_all = "lowercase")]
#[ts(export)]
pub enum MessageRole {
    User,
    Assistant,
    System,
}

impl MessageRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            MessageRole::User => "user",
            MessageRole::Assistant => "assistant",
            MessageRole::System => "system",
        }
    }
}

impl std::fmt::Display for MessageRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for MessageRole {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value {
            "user" => Ok(MessageRole::User),
            "assistant" => Ok(MessageRole::Assistant),
            "system" => Ok(MessageRole::System),
            other => Err(format!("unknown message role '{other}'")),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct Message {
    pub id: String,
    pub conversation_id: String,
    pub role: MessageRole,
    pub content: String,
    pub created_at: DateTime<Utc>,
}

// ============================================================================
// Tool providers
// ============================================================================

/// How the worker authenticates against a tool provider.
///
/// Unknown values fall back to [`AuthType::None`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, TS)]
#[ts(export)]
pub enum AuthType {
    #[serde(rename = "api_key")]
    ApiKey,
    #[serde(rename = "oauth")]
    OAuth,
    #[serde(rename = "none", other)]
    None,
}

impl std::fmt::Display for AuthType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            AuthType::ApiKey => write!(f, "api_key"),
            AuthType::OAuth => write!(f, "oauth"),
            AuthType::None => write!(f, "none"),
        }
    }
}

/// Static, per-deployment description of one tool provider.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[ts(export)]
pub struct ToolProviderConfig {
    pub id: String,
    pub name: String,
    pub url: String,
    pub auth_type: AuthType,
}

// ============================================================================
// Chat streaming
// ============================================================================

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
#[ts(export)]
pub struct ChatRequest {
    pub content: String,
}

/// One server-sent event on the chat stream.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, TS)]
#[serde(tag = "type", rename_all = "kebab-case")]
#[ts(export)]
pub enum ChatStreamEvent {
    TextDelta { delta: String },
    Error { message: String },
    Finish,
}

// ============================================================================
// Tests
// ============================================================================
