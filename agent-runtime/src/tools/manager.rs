use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use shared_types::{AuthType, ToolProviderConfig};
use tracing::{debug, info, warn};

use super::oauth::{OAuthHandshake, OAuthProviderFactory};
use super::{
    api_key_name, CredentialVault, Credentials, LoadedTools, ToolCleanup, ToolClient,
    ToolDefinition, ToolHandle, ToolLoader, ToolProviderRegistry, ToolSet, ToolTransport,
};
use crate::error::ToolError;

/// Connects to every configured tool provider in parallel.
pub struct ToolConnectionManager {
    registry: Arc<dyn ToolProviderRegistry>,
    transport: Arc<dyn ToolTransport>,
    vault: Arc<dyn CredentialVault>,
    oauth_providers: Arc<dyn OAuthProviderFactory>,
    handshake: OAuthHandshake,
}

/// Result of one provider attempt. A client that connected but then failed
/// to list its tools is still returned so the cleanup closes it.
struct ProviderAttempt {
    client: Option<Arc<dyn ToolClient>>,
    tools: Result<Vec<ToolDefinition>, ToolError>,
}

impl ToolConnectionManager {
    pub fn new(
        registry: Arc<dyn ToolProviderRegistry>,
        transport: Arc<dyn ToolTransport>,
        vault: Arc<dyn CredentialVault>,
        oauth_providers: Arc<dyn OAuthProviderFactory>,
        handshake: OAuthHandshake,
    ) -> Self {
        Self {
            registry,
            transport,
            vault,
            oauth_providers,
            handshake,
        }
    }

    /// Open an authenticated connection to one provider.
    pub async fn connect_provider(
        &self,
        provider: &ToolProviderConfig,
    ) -> Result<Arc<dyn ToolClient>, ToolError> {
        match provider.auth_type {
            AuthType::ApiKey => {
                let key = self
                    .vault
                    .get_api_key(&api_key_name(&provider.id))
                    .await
                    .map_err(|err| ToolError::Vault {
                        provider: provider.name.clone(),
                        message: err.to_string(),
                    })?
                    .ok_or_else(|| ToolError::MissingApiKey {
                        provider: provider.name.clone(),
                    })?;
                self.transport
                    .connect(provider, Credentials::ApiKey(key))
                    .await
                    .map_err(|source| ToolError::ProviderConnectionFailed {
                        provider: provider.name.clone(),
                        source,
                    })
            }
            AuthType::OAuth => {
                let oauth = self.oauth_providers.for_provider(provider);
                self.handshake.connect(provider, oauth.as_ref()).await
            }
            AuthType::None => self
                .transport
                .connect(provider, Credentials::None)
                .await
                .map_err(|source| ToolError::ProviderConnectionFailed {
                    provider: provider.name.clone(),
                    source,
                }),
        }
    }

    async fn attempt(&self, provider: &ToolProviderConfig) -> ProviderAttempt {
        let client = match self.connect_provider(provider).await {
            Ok(client) => client,
            Err(err) => {
                return ProviderAttempt {
                    client: None,
                    tools: Err(err),
                }
            }
        };
        let tools = client
            .list_tools()
            .await
            .map_err(|source| ToolError::ProviderConnectionFailed {
                provider: provider.name.clone(),
                source,
            });
        ProviderAttempt {
            client: Some(client),
            tools,
        }
    }
}

#[async_trait]
impl ToolLoader for ToolConnectionManager {
    async fn load_tools(&self) -> LoadedTools {
        let providers = match self.registry.list_providers().await {
            Ok(providers) => providers,
            Err(err) => {
                warn!(error = %err, "failed to read tool providers, continuing without tools");
                return LoadedTools::empty();
            }
        };
        if providers.is_empty() {
            return LoadedTools::empty();
        }

        let attempts = join_all(providers.iter().map(|p| self.attempt(p))).await;

        let mut tools = ToolSet::new();
        let mut clients = Vec::new();
        for (provider, attempt) in providers.iter().zip(attempts) {
            if let Some(client) = attempt.client.as_ref() {
                clients.push((provider.name.clone(), Arc::clone(client)));
            }
            match (attempt.client, attempt.tools) {
                (Some(client), Ok(definitions)) => {
                    debug!(
                        provider = %provider.name,
                        tools = definitions.len(),
                        "tool provider connected"
                    );
                    for definition in definitions {
                        let handle = ToolHandle::new(&provider.id, definition, Arc::clone(&client));
                        if let Some(replaced) = tools.insert(handle) {
                            warn!(
                                tool = %replaced.name(),
                                replaced_provider = %replaced.provider_id(),
                                provider = %provider.id,
                                "tool name collision, later provider wins"
                            );
                        }
                    }
                }
                (_, Err(err)) => {
                    warn!(provider = %provider.name, error = %err, "Failed to connect to tool provider");
                }
                (None, Ok(_)) => {}
            }
        }

        info!(
            providers = providers.len(),
            connected = clients.len(),
            tools = tools.len(),
            "tool set loaded"
        );
        LoadedTools {
            tools,
            cleanup: ToolCleanup::new(clients),
        }
    }
}
