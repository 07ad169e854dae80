//! OAuth 2.1 client for tool providers.
//!
//! Authorization-server metadata discovery, dynamic client registration,
//! PKCE (S256), code exchange and refresh. Clients and tokens are persisted
//! per provider in [`SqliteTokenStore`].

use std::sync::{Arc, Mutex};

use agent_runtime::tools::oauth::{OAuthProvider, OAuthProviderFactory, TokenSet};
use agent_runtime::OAuthError;
use async_trait::async_trait;
use base64::Engine;
use chrono::Utc;
use rand::RngCore;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use shared_types::ToolProviderConfig;
use tracing::{debug, info, warn};
use url::Url;

use crate::token_store::{RegisteredClient, SqliteTokenStore};

/// Endpoints of an authorization server.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerMetadata {
    pub authorization_endpoint: String,
    pub token_endpoint: String,
    #[serde(default)]
    pub registration_endpoint: Option<String>,
}

impl ServerMetadata {
    /// Conventional endpoints on the provider's origin, used when discovery fails.
    fn fallback(origin: &Url) -> Result<Self, OAuthError> {
        let join = |path: &str| {
            origin
                .join(path)
                .map(String::from)
                .map_err(|e| OAuthError::Discovery(e.to_string()))
        };
        Ok(Self {
            authorization_endpoint: join("/authorize")?,
            token_endpoint: join("/token")?,
            registration_endpoint: Some(join("/register")?),
        })
    }
}

/// Hands the authorization URL to the user.
pub trait AuthorizationPrompt: Send + Sync {
    fn open(&self, provider: &ToolProviderConfig, url: &Url);
}

/// Log the URL for the operator to open.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogPrompt;

impl AuthorizationPrompt for LogPrompt {
    fn open(&self, provider: &ToolProviderConfig, url: &Url) {
        info!(provider = %provider.name, url = %url, "authorize tool provider in a browser");
    }
}

/// Open the system browser, falling back to logging.
#[derive(Debug, Default, Clone, Copy)]
pub struct BrowserPrompt;

impl AuthorizationPrompt for BrowserPrompt {
    fn open(&self, provider: &ToolProviderConfig, url: &Url) {
        let opener = if cfg!(target_os = "macos") {
            std::process::Command::new("open").arg(url.as_str()).spawn()
        } else if cfg!(target_os = "windows") {
            std::process::Command::new("cmd")
                .args(["/C", "start", "", url.as_str()])
                .spawn()
        } else {
            std::process::Command::new("xdg-open").arg(url.as_str()).spawn()
        };
        if let Err(e) = opener {
            warn!(error = %e, "failed to open browser");
            LogPrompt.open(provider, url);
        }
    }
}

#[derive(Deserialize)]
struct RegistrationResponse {
    client_id: String,
    #[serde(default)]
    client_secret: Option<String>,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
    #[serde(default)]
    scope: Option<String>,
}

impl From<TokenResponse> for TokenSet {
    fn from(response: TokenResponse) -> Self {
        TokenSet {
            access_token: response.access_token,
            refresh_token: response.refresh_token,
            expires_at: response
                .expires_in
                .map(|secs| Utc::now() + chrono::Duration::seconds(secs)),
            scope: response.scope,
        }
    }
}

/// State carried from `begin_authorization` to `exchange_code`.
struct PendingAuthorization {
    metadata: ServerMetadata,
    client: RegisteredClient,
    verifier: String,
}

pub struct HttpOAuthProvider {
    provider: ToolProviderConfig,
    http: reqwest::Client,
    store: SqliteTokenStore,
    prompt: Arc<dyn AuthorizationPrompt>,
    client_name: String,
    pending: Mutex<Option<PendingAuthorization>>,
}

impl HttpOAuthProvider {
    pub fn new(
        provider: ToolProviderConfig,
        http: reqwest::Client,
        store: SqliteTokenStore,
        prompt: Arc<dyn AuthorizationPrompt>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            provider,
            http,
            store,
            prompt,
            client_name: client_name.into(),
            pending: Mutex::new(None),
        }
    }

    /// Fetch `/.well-known/oauth-authorization-server` from the provider's origin.
    pub async fn discover(&self) -> Result<ServerMetadata, OAuthError> {
        let origin = origin_of(&self.provider.url)?;
        let well_known = origin
            .join("/.well-known/oauth-authorization-server")
            .map_err(|e| OAuthError::Discovery(e.to_string()))?;

        match self.http.get(well_known.clone()).send().await {
            Ok(response) if response.status().is_success() => response
                .json::<ServerMetadata>()
                .await
                .map_err(|e| OAuthError::Discovery(format!("invalid metadata: {e}"))),
            Ok(response) => {
                debug!(
                    provider = %self.provider.id,
                    status = %response.status(),
                    "no authorization server metadata, using default endpoints"
                );
                ServerMetadata::fallback(&origin)
            }
            Err(e) => Err(OAuthError::Discovery(format!("{well_known}: {e}"))),
        }
    }

    /// Reuse the stored registration when it matches `redirect_uri`, otherwise register.
    async fn ensure_client(
        &self,
        metadata: &ServerMetadata,
        redirect_uri: &str,
    ) -> Result<RegisteredClient, OAuthError> {
        let stored = self.store.load_client(&self.provider.id).await?;
        if let Some(client) = stored.as_ref().filter(|c| c.redirect_uri == redirect_uri) {
            return Ok(client.clone());
        }
        let Some(endpoint) = metadata.registration_endpoint.as_deref() else {
            return stored.ok_or_else(|| {
                OAuthError::Registration("server does not support dynamic registration".to_string())
            });
        };

        let response = self
            .http
            .post(endpoint)
            .json(&json!({
                "client_name": self.client_name,
                "redirect_uris": [redirect_uri],
                "grant_types": ["authorization_code", "refresh_token"],
                "response_types": ["code"],
                "token_endpoint_auth_method": "none",
            }))
            .send()
            .await
            .map_err(|e| OAuthError::Registration(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::Registration(format!("{status}: {body}")));
        }
        let registered: RegistrationResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::Registration(e.to_string()))?;

        let client = RegisteredClient {
            client_id: registered.client_id,
            client_secret: registered.client_secret,
            redirect_uri: redirect_uri.to_string(),
        };
        self.store.save_client(&self.provider.id, &client).await?;
        info!(provider = %self.provider.id, "oauth client registered");
        Ok(client)
    }

    async fn request_tokens(
        &self,
        token_endpoint: &str,
        form: &[(&str, &str)],
    ) -> Result<TokenSet, OAuthError> {
        let response = self
            .http
            .post(token_endpoint)
            .form(form)
            .send()
            .await
            .map_err(|e| OAuthError::TokenExchange(e.to_string()))?;
        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(OAuthError::TokenExchange(format!("{status}: {body}")));
        }
        let tokens: TokenResponse = response
            .json()
            .await
            .map_err(|e| OAuthError::TokenExchange(format!("invalid token response: {e}")))?;
        Ok(tokens.into())
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenSet, OAuthError> {
        let metadata = self.discover().await?;
        let client = self
            .store
            .load_client(&self.provider.id)
            .await?
            .ok_or_else(|| OAuthError::Registration("no registered client".to_string()))?;

        let mut form = vec![
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("client_id", client.client_id.as_str()),
        ];
        if let Some(secret) = client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        let mut tokens = self.request_tokens(&metadata.token_endpoint, &form).await?;
        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(refresh_token.to_string());
        }
        self.store.save_tokens(&self.provider.id, &tokens).await?;
        Ok(tokens)
    }

    fn authorization_url(
        &self,
        metadata: &ServerMetadata,
        client: &RegisteredClient,
        state: &str,
        challenge: &str,
    ) -> Result<Url, OAuthError> {
        let mut url = Url::parse(&metadata.authorization_endpoint)
            .map_err(|e| OAuthError::Discovery(format!("invalid authorization endpoint: {e}")))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &client.client_id)
            .append_pair("redirect_uri", &client.redirect_uri)
            .append_pair("state", state)
            .append_pair("code_challenge", challenge)
            .append_pair("code_challenge_method", "S256")
            .append_pair("resource", &self.provider.url);
        Ok(url)
    }

    fn pending(&self) -> std::sync::MutexGuard<'_, Option<PendingAuthorization>> {
        self.pending
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[async_trait]
impl OAuthProvider for HttpOAuthProvider {
    async fn cached_tokens(&self) -> Result<Option<TokenSet>, OAuthError> {
        let Some(tokens) = self.store.load_tokens(&self.provider.id).await? else {
            return Ok(None);
        };
        if !tokens.is_expired(Utc::now()) {
            return Ok(Some(tokens));
        }
        let Some(refresh_token) = tokens.refresh_token.as_deref() else {
            debug!(provider = %self.provider.id, "cached tokens expired");
            return Ok(None);
        };
        match self.refresh(refresh_token).await {
            Ok(refreshed) => {
                debug!(provider = %self.provider.id, "oauth tokens refreshed");
                Ok(Some(refreshed))
            }
            Err(e) => {
                warn!(provider = %self.provider.id, error = %e, "token refresh failed");
                Ok(None)
            }
        }
    }

    async fn begin_authorization(&self, redirect_uri: &str, state: &str) -> Result<(), OAuthError> {
        let metadata = self.discover().await?;
        let client = self.ensure_client(&metadata, redirect_uri).await?;
        let (verifier, challenge) = pkce_pair();
        let url = self.authorization_url(&metadata, &client, state, &challenge)?;

        *self.pending() = Some(PendingAuthorization {
            metadata,
            client,
            verifier,
        });
        self.prompt.open(&self.provider, &url);
        Ok(())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, OAuthError> {
        let pending = self.pending().take().ok_or(OAuthError::NotStarted)?;

        let mut form = vec![
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", pending.client.redirect_uri.as_str()),
            ("client_id", pending.client.client_id.as_str()),
            ("code_verifier", pending.verifier.as_str()),
        ];
        if let Some(secret) = pending.client.client_secret.as_deref() {
            form.push(("client_secret", secret));
        }
        let tokens = self
            .request_tokens(&pending.metadata.token_endpoint, &form)
            .await?;
        self.store.save_tokens(&self.provider.id, &tokens).await?;
        Ok(tokens)
    }
}

/// Builds one [`HttpOAuthProvider`] per connection attempt.
#[derive(Clone)]
pub struct HttpOAuthProviderFactory {
    http: reqwest::Client,
    store: SqliteTokenStore,
    prompt: Arc<dyn AuthorizationPrompt>,
    client_name: String,
}

impl HttpOAuthProviderFactory {
    pub fn new(
        http: reqwest::Client,
        store: SqliteTokenStore,
        prompt: Arc<dyn AuthorizationPrompt>,
        client_name: impl Into<String>,
    ) -> Self {
        Self {
            http,
            store,
            prompt,
            client_name: client_name.into(),
        }
    }
}

impl OAuthProviderFactory for HttpOAuthProviderFactory {
    fn for_provider(&self, provider: &ToolProviderConfig) -> Arc<dyn OAuthProvider> {
        Arc::new(HttpOAuthProvider::new(
            provider.clone(),
            self.http.clone(),
            self.store.clone(),
            Arc::clone(&self.prompt),
            self.client_name.clone(),
        ))
    }
}

fn origin_of(provider_url: &str) -> Result<Url, OAuthError> {
    let url = Url::parse(provider_url)
        .map_err(|e| OAuthError::Discovery(format!("invalid provider url: {e}")))?;
    url.join("/")
        .map_err(|e| OAuthError::Discovery(e.to_string()))
}

/// PKCE verifier and its S256 challenge.
pub fn pkce_pair() -> (String, String) {
    let mut bytes = [0u8; 32];
    rand::rng().fill_bytes(&mut bytes);
    let verifier = base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(bytes);
    let challenge = pkce_challenge(&verifier);
    (verifier, challenge)
}

pub fn pkce_challenge(verifier: &str) -> String {
    base64::engine::general_purpose::URL_SAFE_NO_PAD.encode(Sha256::digest(verifier.as_bytes()))
}
