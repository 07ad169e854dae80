//! In-memory conversation store.
//!
//! Used by tests and local development. The claim is a compare-and-set under
//! one lock, matching the conditional `UPDATE` of the SQLite store.

use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use shared_types::MessageRole;

use crate::error::StoreError;
use crate::store::{AgentDirectory, ConversationKey, MessageStore};

#[derive(Debug, Default)]
struct MemoryConversation {
    user_id: String,
    agent_id: Option<String>,
    messages: Vec<(MessageRole, String)>,
}

#[derive(Debug, Default)]
pub struct InMemoryConversationStore {
    conversations: Mutex<HashMap<String, MemoryConversation>>,
}

impl InMemoryConversationStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn create(&self, key: &ConversationKey) {
        self.insert(key, None);
    }

    /// Create a conversation that is already bound to `agent_id`.
    pub fn create_bound(&self, key: &ConversationKey, agent_id: &str) {
        self.insert(key, Some(agent_id.to_string()));
    }

    pub fn agent_id(&self, key: &ConversationKey) -> Option<String> {
        self.with_conversation(key, |c| c.agent_id.clone())
            .ok()
            .flatten()
    }

    pub fn messages(&self, key: &ConversationKey) -> Vec<(MessageRole, String)> {
        self.with_conversation(key, |c| c.messages.clone())
            .unwrap_or_default()
    }

    fn insert(&self, key: &ConversationKey, agent_id: Option<String>) {
        let mut conversations = self.lock();
        conversations.insert(
            key.conversation_id.clone(),
            MemoryConversation {
                user_id: key.user_id.clone(),
                agent_id,
                messages: Vec::new(),
            },
        );
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, MemoryConversation>> {
        // A poisoned lock only means another test thread panicked mid-update.
        self.conversations
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn with_conversation<T>(
        &self,
        key: &ConversationKey,
        f: impl FnOnce(&mut MemoryConversation) -> T,
    ) -> Result<T, StoreError> {
        let mut conversations = self.lock();
        match conversations.get_mut(&key.conversation_id) {
            Some(conversation) if conversation.user_id == key.user_id => Ok(f(conversation)),
            _ => Err(StoreError::NotFound("Conversation".to_string())),
        }
    }
}

#[async_trait]
impl AgentDirectory for InMemoryConversationStore {
    async fn existing_agent_id(&self, key: &ConversationKey) -> Result<Option<String>, StoreError> {
        self.with_conversation(key, |c| c.agent_id.clone().filter(|id| !id.is_empty()))
    }

    async fn claim_agent_id(
        &self,
        key: &ConversationKey,
        candidate: &str,
    ) -> Result<bool, StoreError> {
        self.with_conversation(key, |c| {
            if c.agent_id.as_deref().is_some_and(|id| !id.is_empty()) {
                return false;
            }
            c.agent_id = Some(candidate.to_string());
            true
        })
    }
}

#[async_trait]
impl MessageStore for InMemoryConversationStore {
    async fn save_user_message(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(), StoreError> {
        self.with_conversation(key, |c| {
            c.messages.push((MessageRole::User, content.to_string()))
        })
    }

    async fn save_assistant_message(
        &self,
        key: &ConversationKey,
        content: &str,
    ) -> Result<(), StoreError> {
        self.with_conversation(key, |c| {
            c.messages
                .push((MessageRole::Assistant, content.to_string()))
        })
    }
}
