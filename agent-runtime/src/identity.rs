//! Agent identity resolution.
//!
//! Maps a conversation to exactly one remote agent without a global lock:
//! every resolver that finds the conversation unbound creates an agent and
//! tries to claim it with a conditional write. Losers delete their orphan in
//! the background and adopt the winner.

use std::sync::Arc;

use tracing::{debug, error, info};

use crate::agent::AgentService;
use crate::background::{with_context, BackgroundTasks};
use crate::error::{BoxError, ChatError};
use crate::store::{AgentDirectory, ConversationKey};

#[derive(Clone)]
pub struct AgentIdentityResolver {
    directory: Arc<dyn AgentDirectory>,
    agents: Arc<dyn AgentService>,
    background: BackgroundTasks,
}

impl AgentIdentityResolver {
    pub fn new(
        directory: Arc<dyn AgentDirectory>,
        agents: Arc<dyn AgentService>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            directory,
            agents,
            background,
        }
    }

    /// Return the agent bound to `key`, creating and claiming one if needed.
    ///
    /// Concurrent calls for the same conversation all return the same id.
    pub async fn resolve(
        &self,
        key: &ConversationKey,
        agent_seed: &str,
        error_context: Option<&str>,
    ) -> Result<String, ChatError> {
        if let Some(existing) = non_empty(self.directory.existing_agent_id(key).await?) {
            debug!(conversation_id = %key, agent_id = %existing, "agent already bound");
            return Ok(existing);
        }

        let candidate = self.agents.create_agent(agent_seed).await?;
        if self.directory.claim_agent_id(key, &candidate).await? {
            info!(conversation_id = %key, agent_id = %candidate, "agent claimed");
            return Ok(candidate);
        }

        debug!(
            conversation_id = %key,
            orphan_agent_id = %candidate,
            "lost agent claim race, deleting orphan"
        );
        let agents = Arc::clone(&self.agents);
        self.background.schedule(
            with_context("Failed to delete orphan agent", error_context),
            async move {
                agents
                    .delete_agent(&candidate)
                    .await
                    .map_err(BoxError::from)
            },
        );

        match non_empty(self.directory.winning_agent_id(key).await?) {
            Some(winner) => {
                debug!(conversation_id = %key, agent_id = %winner, "adopted winning agent");
                Ok(winner)
            }
            None => {
                error!(
                    conversation_id = %key,
                    "claim failed but no agent is bound; conditional write is broken"
                );
                Err(ChatError::UnresolvableIdentity {
                    conversation_id: key.conversation_id.clone(),
                })
            }
        }
    }
}

fn non_empty(agent_id: Option<String>) -> Option<String> {
    agent_id.filter(|id| !id.is_empty())
}
