//! Conversation persistence seams.
//!
//! The runtime never talks to a database directly. The worker implements
//! these traits on SQLite; [`crate::memory`] implements them in memory.

use async_trait::async_trait;

use crate::error::StoreError;

/// A conversation together with the user that owns it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ConversationKey {
    pub conversation_id: String,
    pub user_id: String,
}

impl ConversationKey {
    pub fn new(conversation_id: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            conversation_id: conversation_id.into(),
            user_id: user_id.into(),
        }
    }
}

impl std::fmt::Display for ConversationKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.conversation_id)
    }
}

/// Read and claim access to a conversation's agent binding.
#[async_trait]
pub trait AgentDirectory: Send + Sync {
    /// Current agent id, if one has been claimed.
    async fn existing_agent_id(&self, key: &ConversationKey) -> Result<Option<String>, StoreError>;

    /// Set the agent id only if it is still unset.
    ///
    /// Must be a single conditional write. Returns `true` iff this call set it.
    async fn claim_agent_id(&self, key: &ConversationKey, candidate: &str)
        -> Result<bool, StoreError>;

    /// Re-read after a lost claim.
    async fn winning_agent_id(&self, key: &ConversationKey) -> Result<Option<String>, StoreError> {
        self.existing_agent_id(key).await
    }
}

#[async_trait]
pub trait MessageStore: Send + Sync {
    async fn save_user_message(&self, key: &ConversationKey, content: &str)
        -> Result<(), StoreError>;

    async fn save_assistant_message(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(), StoreError>;
}
