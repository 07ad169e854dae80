use std::sync::Arc;

use agent_runtime::{
    AgentIdentityResolver, AgentService, BackgroundTasks, ChatStreamOrchestrator, ToolLoader,
};

use crate::db::SqliteConversationStore;

pub struct AppState {
    pub conversations: SqliteConversationStore,
    pub chat: ChatStreamOrchestrator,
    pub background: BackgroundTasks,
}

impl AppState {
    /// Wire the chat pipeline around one conversation store.
    pub fn new(
        conversations: SqliteConversationStore,
        agents: Arc<dyn AgentService>,
        tools: Arc<dyn ToolLoader>,
        background: BackgroundTasks,
    ) -> Self {
        let store = Arc::new(conversations.clone());
        let resolver =
            AgentIdentityResolver::new(store.clone(), Arc::clone(&agents), background.clone());
        let chat = ChatStreamOrchestrator::new(resolver, store, tools, agents, background.clone());
        Self {
            conversations,
            chat,
            background,
        }
    }
}
