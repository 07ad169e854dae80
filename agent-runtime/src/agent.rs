use async_trait::async_trait;
use futures_util::stream::BoxStream;

use crate::error::AgentServiceError;
use crate::tools::ToolSet;

/// Text deltas from the model, in order.
pub type TextStream = BoxStream<'static, Result<String, AgentServiceError>>;

/// The remote service hosting durable agents.
#[async_trait]
pub trait AgentService: Send + Sync {
    /// Create a new agent record. Every call may create a distinct record,
    /// even for the same seed.
    async fn create_agent(&self, seed: &str) -> Result<String, AgentServiceError>;

    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError>;

    /// Start a streamed reply. `tools` is `None` when no tools are available.
    async fn stream_chat(
        &self,
        agent_id: &str,
        prompt: &str,
        tools: Option<&ToolSet>,
    ) -> Result<TextStream, AgentServiceError>;
}
