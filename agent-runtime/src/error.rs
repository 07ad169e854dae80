use std::time::Duration;

pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Failure reported by a conversation/message store.
#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("{0} not found")]
    NotFound(String),

    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Failure talking to the remote agent service.
#[derive(Debug, Clone, thiserror::Error)]
pub enum AgentServiceError {
    #[error("agent service request failed: {0}")]
    Http(String),

    #[error("agent service returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("failed to decode agent service response: {0}")]
    Decode(String),

    #[error("agent stream failed: {0}")]
    Stream(String),
}

/// Errors that abort a chat request before any response is streamed.
#[derive(Debug, thiserror::Error)]
pub enum ChatError {
    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("failed to resolve agent for conversation {conversation_id}")]
    UnresolvableIdentity { conversation_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    AgentService(#[from] AgentServiceError),
}

/// Failure reported by a tool-provider transport.
#[derive(Debug, Clone, thiserror::Error)]
pub enum TransportError {
    /// The provider rejected the credentials (HTTP 401 or equivalent).
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    #[error("transport error: {0}")]
    Http(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

impl TransportError {
    pub fn is_unauthorized(&self) -> bool {
        matches!(self, TransportError::Unauthorized(_))
    }
}

#[derive(Debug, Clone, thiserror::Error)]
pub enum OAuthError {
    #[error("authorization server discovery failed: {0}")]
    Discovery(String),

    #[error("client registration failed: {0}")]
    Registration(String),

    #[error("token exchange failed: {0}")]
    TokenExchange(String),

    #[error("token storage failed: {0}")]
    Storage(String),

    #[error("callback listener failed: {0}")]
    Listener(String),

    #[error("no authorization in progress")]
    NotStarted,
}

/// Per-provider connection failure. Never aborts sibling providers.
#[derive(Debug, thiserror::Error)]
pub enum ToolError {
    #[error("no API key found for tool provider \"{provider}\"")]
    MissingApiKey { provider: String },

    #[error("credential lookup for \"{provider}\" failed: {message}")]
    Vault { provider: String, message: String },

    #[error("failed to connect to tool provider \"{provider}\": {source}")]
    ProviderConnectionFailed {
        provider: String,
        #[source]
        source: TransportError,
    },

    #[error("OAuth state mismatch for \"{provider}\", possible CSRF attempt")]
    CsrfStateMismatch { provider: String },

    #[error("OAuth authorization for \"{provider}\" timed out after {after:?}")]
    OAuthTimedOut { provider: String, after: Duration },

    #[error("OAuth authorization for \"{provider}\" failed: {message}")]
    OAuthRejected { provider: String, message: String },

    #[error("OAuth flow for \"{provider}\" failed: {source}")]
    OAuth {
        provider: String,
        #[source]
        source: OAuthError,
    },
}

/// Reported to the error sink when a scheduled task panics.
#[derive(Debug, thiserror::Error)]
#[error("background task '{label}' failed: {message}")]
pub struct BackgroundTaskFailed {
    pub label: String,
    pub message: String,
}
