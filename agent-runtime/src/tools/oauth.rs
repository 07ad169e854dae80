//! OAuth handshake for tool providers.
//!
//! ```text
//! Idle -> TryingCached -> Connected
//!              |
//!              v
//!      NeedsAuthorization -> AwaitingCallback -> Connected | Failed | TimedOut
//! ```
//!
//! Cached tokens are always tried first. Only an authorization failure on
//! that attempt starts the browser flow; any other error is returned as-is.
//! While waiting, the handshake races the callback listener against a timer.
//! The first outcome wins and the listener is torn down right away, so a
//! late callback can never be processed.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use chrono::{DateTime, Utc};
use rand::RngCore;
use serde::{Deserialize, Serialize};
use shared_types::ToolProviderConfig;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

use super::{Credentials, ToolClient, ToolTransport};
use crate::error::{OAuthError, ToolError, TransportError};

/// How long to wait for the user to finish authorizing in the browser.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(300);

/// Tokens are treated as expired this long before their stated expiry.
const EXPIRY_SKEW_SECS: i64 = 30;

#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TokenSet {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub expires_at: Option<DateTime<Utc>>,
    #[serde(default)]
    pub scope: Option<String>,
}

impl TokenSet {
    pub fn bearer(access_token: impl Into<String>) -> Self {
        Self {
            access_token: access_token.into(),
            refresh_token: None,
            expires_at: None,
            scope: None,
        }
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at <= now + chrono::Duration::seconds(EXPIRY_SKEW_SECS),
            None => false,
        }
    }
}

impl std::fmt::Debug for TokenSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TokenSet")
            .field("access_token", &"<redacted>")
            .field("has_refresh_token", &self.refresh_token.is_some())
            .field("expires_at", &self.expires_at)
            .finish()
    }
}

/// Per-provider OAuth client.
#[async_trait]
pub trait OAuthProvider: Send + Sync {
    /// Stored tokens, refreshed if they had expired. `None` when nothing usable
    /// is cached.
    async fn cached_tokens(&self) -> Result<Option<TokenSet>, OAuthError>;

    /// Send the user to the authorization page for this attempt.
    async fn begin_authorization(&self, redirect_uri: &str, state: &str)
        -> Result<(), OAuthError>;

    /// Trade an authorization code for tokens and remember them.
    async fn exchange_code(&self, code: &str) -> Result<TokenSet, OAuthError>;
}

pub trait OAuthProviderFactory: Send + Sync {
    fn for_provider(&self, provider: &ToolProviderConfig) -> Arc<dyn OAuthProvider>;
}

/// What the callback endpoint received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CallbackEvent {
    Code { code: String, state: String },
    Error(String),
}

/// A running callback endpoint.
///
/// Dropping or disposing the listener closes its event channel and signals
/// the endpoint to shut down. Teardown happens once.
pub struct CallbackListener {
    redirect_uri: String,
    events: mpsc::Receiver<CallbackEvent>,
    shutdown: Option<oneshot::Sender<()>>,
}

impl CallbackListener {
    pub fn new(
        redirect_uri: impl Into<String>,
        events: mpsc::Receiver<CallbackEvent>,
        shutdown: oneshot::Sender<()>,
    ) -> Self {
        Self {
            redirect_uri: redirect_uri.into(),
            events,
            shutdown: Some(shutdown),
        }
    }

    pub fn redirect_uri(&self) -> &str {
        &self.redirect_uri
    }

    pub async fn next_event(&mut self) -> Option<CallbackEvent> {
        self.events.recv().await
    }

    pub fn dispose(mut self) {
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            self.events.close();
            let _ = shutdown.send(());
        }
    }
}

impl Drop for CallbackListener {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl std::fmt::Debug for CallbackListener {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CallbackListener")
            .field("redirect_uri", &self.redirect_uri)
            .field("disposed", &self.shutdown.is_none())
            .finish()
    }
}

/// Platform primitive: start a local endpoint for one authorization attempt.
#[async_trait]
pub trait CallbackServer: Send + Sync {
    async fn start(&self, expected_state: &str) -> Result<CallbackListener, OAuthError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    TryingCached,
    NeedsAuthorization,
    AwaitingCallback,
    Connected,
    Failed,
    TimedOut,
}

enum CallbackOutcome {
    Code(String),
    StateMismatch,
    Rejected(String),
    TimedOut,
}

/// 32 random bytes, base64url without padding.
pub fn generate_state() -> String {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes)
}

#[derive(Clone)]
pub struct OAuthHandshake {
    transport: Arc<dyn ToolTransport>,
    callbacks: Arc<dyn CallbackServer>,
    timeout: Duration,
}

impl OAuthHandshake {
    pub fn new(transport: Arc<dyn ToolTransport>, callbacks: Arc<dyn CallbackServer>) -> Self {
        Self {
            transport,
            callbacks,
            timeout: DEFAULT_CALLBACK_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub async fn connect(
        &self,
        provider: &ToolProviderConfig,
        oauth: &dyn OAuthProvider,
    ) -> Result<Arc<dyn ToolClient>, ToolError> {
        let mut state = HandshakeState::Idle;
        let oauth_failed = |source: OAuthError| ToolError::OAuth {
            provider: provider.name.clone(),
            source,
        };
        let connect_failed = |source: TransportError| ToolError::ProviderConnectionFailed {
            provider: provider.name.clone(),
            source,
        };

        if let Some(tokens) = oauth.cached_tokens().await.map_err(oauth_failed)? {
            advance(&mut state, HandshakeState::TryingCached, provider);
            match self
                .transport
                .connect(provider, Credentials::OAuth(tokens))
                .await
            {
                Ok(client) => {
                    advance(&mut state, HandshakeState::Connected, provider);
                    return Ok(client);
                }
                Err(err) if err.is_unauthorized() => {
                    debug!(provider = %provider.name, "cached tokens rejected");
                }
                Err(err) => return Err(connect_failed(err)),
            }
        }
        advance(&mut state, HandshakeState::NeedsAuthorization, provider);

        let nonce = generate_state();
        let mut listener = self.callbacks.start(&nonce).await.map_err(oauth_failed)?;
        oauth
            .begin_authorization(listener.redirect_uri(), &nonce)
            .await
            .map_err(oauth_failed)?;
        advance(&mut state, HandshakeState::AwaitingCallback, provider);

        let outcome = self.await_callback(&mut listener, &nonce).await;
        listener.dispose();

        let code = match outcome {
            CallbackOutcome::Code(code) => code,
            CallbackOutcome::StateMismatch => {
                advance(&mut state, HandshakeState::Failed, provider);
                return Err(ToolError::CsrfStateMismatch {
                    provider: provider.name.clone(),
                });
            }
            CallbackOutcome::Rejected(message) => {
                advance(&mut state, HandshakeState::Failed, provider);
                return Err(ToolError::OAuthRejected {
                    provider: provider.name.clone(),
                    message,
                });
            }
            CallbackOutcome::TimedOut => {
                advance(&mut state, HandshakeState::TimedOut, provider);
                return Err(ToolError::OAuthTimedOut {
                    provider: provider.name.clone(),
                    after: self.timeout,
                });
            }
        };

        let tokens = oauth.exchange_code(&code).await.map_err(oauth_failed)?;
        let client = self
            .transport
            .connect(provider, Credentials::OAuth(tokens))
            .await
            .map_err(connect_failed)?;
        advance(&mut state, HandshakeState::Connected, provider);
        info!(provider = %provider.name, "tool provider authorized");
        Ok(client)
    }

    async fn await_callback(
        &self,
        listener: &mut CallbackListener,
        expected_state: &str,
    ) -> CallbackOutcome {
        tokio::select! {
            event = listener.next_event() => match event {
                Some(CallbackEvent::Code { code, state }) if state == expected_state => {
                    CallbackOutcome::Code(code)
                }
                Some(CallbackEvent::Code { .. }) => {
                    warn!("OAuth callback state does not match this attempt");
                    CallbackOutcome::StateMismatch
                }
                Some(CallbackEvent::Error(message)) => CallbackOutcome::Rejected(message),
                None => CallbackOutcome::Rejected("callback listener closed".to_string()),
            },
            _ = tokio::time::sleep(self.timeout) => CallbackOutcome::TimedOut,
        }
    }
}

fn advance(state: &mut HandshakeState, next: HandshakeState, provider: &ToolProviderConfig) {
    debug!(provider = %provider.name, from = ?*state, to = ?next, "oauth handshake");
    *state = next;
}
