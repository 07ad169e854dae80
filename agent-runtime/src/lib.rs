//! Agent runtime
//!
//! Resolves a conversation to its durable remote agent, streams the agent's
//! reply back to the caller while persisting it in the background, and
//! connects to the tool providers the agent may use.
//!
//! Everything outside this crate (storage, the agent service, tool
//! transports, the OAuth callback endpoint) is reached through traits.

pub mod agent;
pub mod background;
pub mod chat;
pub mod error;
pub mod identity;
pub mod memory;
pub mod store;
pub mod tools;

pub use agent::{AgentService, TextStream};
pub use background::{with_context, BackgroundTasks, ErrorSink, TracingErrorSink};
pub use chat::{ChatStreamOrchestrator, ChatTurn, ResponseStream};
pub use error::{
    AgentServiceError, BackgroundTaskFailed, BoxError, ChatError, OAuthError, StoreError,
    ToolError, TransportError,
};
pub use identity::AgentIdentityResolver;
pub use store::{AgentDirectory, ConversationKey, MessageStore};
pub use tools::{LoadedTools, ToolConnectionManager, ToolLoader, ToolSet};
