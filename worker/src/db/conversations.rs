//! SQLite conversation and message store.
//!
//! Every query is scoped by owner: a conversation that belongs to another
//! user reads as missing.

use agent_runtime::{AgentDirectory, ConversationKey, MessageStore, StoreError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use shared_types::{Conversation, Message, MessageRole, DEFAULT_CONVERSATION_TITLE};
use sqlx::SqlitePool;
use tracing::debug;
use uuid::Uuid;

use super::backend;

#[derive(Debug, Clone)]
pub struct SqliteConversationStore {
    pool: SqlitePool,
}

#[derive(sqlx::FromRow)]
struct ConversationRow {
    id: String,
    user_id: String,
    title: String,
    agent_id: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl From<ConversationRow> for Conversation {
    fn from(row: ConversationRow) -> Self {
        Conversation {
            id: row.id,
            user_id: row.user_id,
            title: row.title,
            agent_id: row.agent_id.filter(|id| !id.is_empty()),
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct MessageRow {
    id: String,
    conversation_id: String,
    role: String,
    content: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<MessageRow> for Message {
    type Error = StoreError;

    fn try_from(row: MessageRow) -> Result<Self, Self::Error> {
        Ok(Message {
            role: row.role.parse::<MessageRole>().map_err(StoreError::Backend)?,
            id: row.id,
            conversation_id: row.conversation_id,
            content: row.content,
            created_at: row.created_at,
        })
    }
}

impl SqliteConversationStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn create(
        &self,
        user_id: &str,
        title: Option<&str>,
    ) -> Result<Conversation, StoreError> {
        let now = Utc::now();
        let conversation = Conversation {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            title: title
                .map(str::trim)
                .filter(|t| !t.is_empty())
                .unwrap_or(DEFAULT_CONVERSATION_TITLE)
                .to_string(),
            agent_id: None,
            created_at: now,
            updated_at: now,
        };

        sqlx::query(
            "INSERT INTO conversations (id, user_id, title, agent_id, created_at, updated_at)
             VALUES (?, ?, ?, NULL, ?, ?)",
        )
        .bind(&conversation.id)
        .bind(&conversation.user_id)
        .bind(&conversation.title)
        .bind(conversation.created_at)
        .bind(conversation.updated_at)
        .execute(&self.pool)
        .await
        .map_err(backend)?;

        debug!(conversation_id = %conversation.id, "conversation created");
        Ok(conversation)
    }

    pub async fn get(&self, key: &ConversationKey) -> Result<Conversation, StoreError> {
        sqlx::query_as::<_, ConversationRow>(
            "SELECT id, user_id, title, agent_id, created_at, updated_at
             FROM conversations WHERE id = ? AND user_id = ?",
        )
        .bind(&key.conversation_id)
        .bind(&key.user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(backend)?
        .map(Conversation::from)
        .ok_or_else(not_found)
    }

    /// Messages oldest first.
    pub async fn list_messages(&self, key: &ConversationKey) -> Result<Vec<Message>, StoreError> {
        self.get(key).await?;
        sqlx::query_as::<_, MessageRow>(
            "SELECT id, conversation_id, role, content, created_at
             FROM messages WHERE conversation_id = ?
             ORDER BY created_at ASC, rowid ASC",
        )
        .bind(&key.conversation_id)
        .fetch_all(&self.pool)
        .await
        .map_err(backend)?
        .into_iter()
        .map(Message::try_from)
        .collect()
    }

    /// Insert a message and bump the conversation's `updated_at` atomically.
    pub async fn save_message(
        &self,
        key: &ConversationKey,
        role: MessageRole,
        content: &str,
    ) -> Result<Message, StoreError> {
        let now = Utc::now();
        let mut tx = self.pool.begin().await.map_err(backend)?;

        let touched = sqlx::query(
            "UPDATE conversations SET updated_at = ? WHERE id = ? AND user_id = ?",
        )
        .bind(now)
        .bind(&key.conversation_id)
        .bind(&key.user_id)
        .execute(&mut *tx)
        .await
        .map_err(backend)?
        .rows_affected();
        if touched == 0 {
            return Err(not_found());
        }

        let message = Message {
            id: Uuid::new_v4().to_string(),
            conversation_id: key.conversation_id.clone(),
            role,
            content: content.to_string(),
            created_at: now,
        };
        sqlx::query(
            "INSERT INTO messages (id, conversation_id, role, content, created_at)
             VALUES (?, ?, ?, ?, ?)",
        )
        .bind(&message.id)
        .bind(&message.conversation_id)
        .bind(message.role.as_str())
        .bind(&message.content)
        .bind(message.created_at)
        .execute(&mut *tx)
        .await
        .map_err(backend)?;

        tx.commit().await.map_err(backend)?;
        Ok(message)
    }
}

fn not_found() -> StoreError {
    StoreError::NotFound("Conversation".to_string())
}

#[async_trait]
impl AgentDirectory for SqliteConversationStore {
    async fn existing_agent_id(&self, key: &ConversationKey) -> Result<Option<String>, StoreError> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT agent_id FROM conversations WHERE id = ? AND user_id = ?")
                .bind(&key.conversation_id)
                .bind(&key.user_id)
                .fetch_optional(&self.pool)
                .await
                .map_err(backend)?;
        row.map(|(agent_id,)| agent_id).ok_or_else(not_found)
    }

    async fn claim_agent_id(
        &self,
        key: &ConversationKey,
        candidate: &str,
    ) -> Result<bool, StoreError> {
        // Empty string is treated like NULL so a half-written row can still be claimed.
        let claimed = sqlx::query(
            "UPDATE conversations SET agent_id = ?, updated_at = ?
             WHERE id = ? AND user_id = ? AND (agent_id IS NULL OR agent_id = '')",
        )
        .bind(candidate)
        .bind(Utc::now())
        .bind(&key.conversation_id)
        .bind(&key.user_id)
        .execute(&self.pool)
        .await
        .map_err(backend)?
        .rows_affected();
        Ok(claimed == 1)
    }
}

#[async_trait]
impl MessageStore for SqliteConversationStore {
    async fn save_user_message(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(), StoreError> {
        self.save_message(key, MessageRole::User, content)
            .await
            .map(|_| ())
    }

    async fn save_assistant_message(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(), StoreError> {
        self.save_message(key, MessageRole::Assistant, content)
            .await
            .map(|_| ())
    }
}
