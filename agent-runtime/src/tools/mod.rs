//! Tool providers and the tool set handed to the model.
//!
//! A chat request connects to every configured provider, merges whatever
//! tools the reachable ones expose into a [`ToolSet`], and owns the matching
//! [`ToolCleanup`] until the reply has been streamed and persisted.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use futures_util::future::join_all;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use shared_types::ToolProviderConfig;
use tracing::warn;

use crate::error::{StoreError, TransportError};

mod manager;
pub mod oauth;

pub use manager::ToolConnectionManager;

/// Tool description as advertised by its provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "inputSchema", default)]
    pub input_schema: Value,
}

/// A live connection to one tool provider.
#[async_trait]
pub trait ToolClient: Send + Sync {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError>;

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError>;

    async fn close(&self) -> Result<(), TransportError>;
}

/// Credentials presented when opening a provider connection.
#[derive(Clone)]
pub enum Credentials {
    None,
    ApiKey(String),
    OAuth(oauth::TokenSet),
}

impl Credentials {
    /// Value for an `Authorization: Bearer` header, if any.
    pub fn bearer(&self) -> Option<&str> {
        match self {
            Credentials::None => None,
            Credentials::ApiKey(key) => Some(key),
            Credentials::OAuth(tokens) => Some(&tokens.access_token),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Credentials::None => write!(f, "Credentials::None"),
            Credentials::ApiKey(_) => write!(f, "Credentials::ApiKey(<redacted>)"),
            Credentials::OAuth(_) => write!(f, "Credentials::OAuth(<redacted>)"),
        }
    }
}

/// Opens connections to tool providers.
#[async_trait]
pub trait ToolTransport: Send + Sync {
    async fn connect(
        &self,
        provider: &ToolProviderConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn ToolClient>, TransportError>;
}

/// Static list of configured providers.
#[async_trait]
pub trait ToolProviderRegistry: Send + Sync {
    async fn list_providers(&self) -> Result<Vec<ToolProviderConfig>, StoreError>;
}

/// Secret storage for API-key providers.
#[async_trait]
pub trait CredentialVault: Send + Sync {
    async fn get_api_key(&self, name: &str) -> Result<Option<String>, StoreError>;
}

/// Vault entry name for a provider's API key.
pub fn api_key_name(provider_id: &str) -> String {
    format!("mcp:{provider_id}")
}

/// One callable tool, bound to the client that serves it.
#[derive(Clone)]
pub struct ToolHandle {
    provider_id: String,
    definition: ToolDefinition,
    client: Arc<dyn ToolClient>,
}

impl ToolHandle {
    pub fn new(
        provider_id: impl Into<String>,
        definition: ToolDefinition,
        client: Arc<dyn ToolClient>,
    ) -> Self {
        Self {
            provider_id: provider_id.into(),
            definition,
            client,
        }
    }

    pub fn name(&self) -> &str {
        &self.definition.name
    }

    pub fn provider_id(&self) -> &str {
        &self.provider_id
    }

    pub fn definition(&self) -> &ToolDefinition {
        &self.definition
    }

    pub async fn call(&self, arguments: Value) -> Result<Value, TransportError> {
        self.client.call_tool(&self.definition.name, arguments).await
    }
}

impl std::fmt::Debug for ToolHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolHandle")
            .field("provider_id", &self.provider_id)
            .field("name", &self.definition.name)
            .finish()
    }
}

/// Tools keyed by name.
#[derive(Debug, Clone, Default)]
pub struct ToolSet {
    tools: BTreeMap<String, ToolHandle>,
}

impl ToolSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert, returning the handle it replaced on a name collision.
    pub fn insert(&mut self, handle: ToolHandle) -> Option<ToolHandle> {
        self.tools.insert(handle.name().to_string(), handle)
    }

    pub fn get(&self, name: &str) -> Option<&ToolHandle> {
        self.tools.get(name)
    }

    pub fn is_empty(&self) -> bool {
        self.tools.is_empty()
    }

    pub fn len(&self) -> usize {
        self.tools.len()
    }

    pub fn names(&self) -> Vec<String> {
        self.tools.keys().cloned().collect()
    }

    pub fn definitions(&self) -> Vec<ToolDefinition> {
        self.tools.values().map(|h| h.definition.clone()).collect()
    }
}

/// Closes every connected client. Consumed by [`ToolCleanup::run`], so it can
/// only ever run once.
#[must_use = "tool clients stay open until the cleanup runs"]
pub struct ToolCleanup {
    clients: Vec<(String, Arc<dyn ToolClient>)>,
}

impl ToolCleanup {
    pub fn noop() -> Self {
        Self {
            clients: Vec::new(),
        }
    }

    pub(crate) fn new(clients: Vec<(String, Arc<dyn ToolClient>)>) -> Self {
        Self { clients }
    }

    pub fn len(&self) -> usize {
        self.clients.len()
    }

    pub fn is_empty(&self) -> bool {
        self.clients.is_empty()
    }

    /// Close all clients concurrently. One failed close never blocks another.
    pub async fn run(self) {
        let closes = self.clients.into_iter().map(|(provider, client)| async move {
            if let Err(err) = client.close().await {
                warn!(provider = %provider, error = %err, "failed to close tool client");
            }
        });
        join_all(closes).await;
    }
}

impl std::fmt::Debug for ToolCleanup {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToolCleanup")
            .field("clients", &self.clients.len())
            .finish()
    }
}

/// Tool set plus its cleanup, owned by one chat request.
#[derive(Debug)]
pub struct LoadedTools {
    pub tools: ToolSet,
    pub cleanup: ToolCleanup,
}

impl LoadedTools {
    pub fn empty() -> Self {
        Self {
            tools: ToolSet::new(),
            cleanup: ToolCleanup::noop(),
        }
    }
}

/// Produces the best-effort tool set for a chat request. Never fails; a
/// provider that cannot be reached just contributes no tools.
#[async_trait]
pub trait ToolLoader: Send + Sync {
    async fn load_tools(&self) -> LoadedTools;
}

/// Loader for deployments without tool providers.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoTools;

#[async_trait]
impl ToolLoader for NoTools {
    async fn load_tools(&self) -> LoadedTools {
        LoadedTools::empty()
    }
}
