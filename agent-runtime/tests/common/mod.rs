//! Fakes for the runtime's external collaborators.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_runtime::background::ErrorSink;
use agent_runtime::tools::oauth::{
    CallbackEvent, CallbackListener, CallbackServer, OAuthProvider, OAuthProviderFactory,
    TokenSet,
};
use agent_runtime::tools::{
    CredentialVault, Credentials, ToolClient, ToolDefinition, ToolProviderRegistry, ToolSet,
    ToolTransport,
};
use agent_runtime::{
    AgentService, AgentServiceError, OAuthError, StoreError, TextStream, TransportError,
};
use async_trait::async_trait;
use futures_util::StreamExt;
use serde_json::{json, Value};
use shared_types::{AuthType, ToolProviderConfig};
use tokio::sync::{mpsc, oneshot, Barrier};

// ============================================================================
// Error sink
// ============================================================================

#[derive(Default)]
pub struct RecordingSink {
    pub reports: Mutex<Vec<(String, String)>>,
}

impl RecordingSink {
    pub fn messages(&self) -> Vec<String> {
        self.reports
            .lock()
            .unwrap()
            .iter()
            .map(|(message, _)| message.clone())
            .collect()
    }
}

impl ErrorSink for RecordingSink {
    fn report(&self, message: &str, error: &(dyn std::error::Error + 'static)) {
        self.reports
            .lock()
            .unwrap()
            .push((message.to_string(), error.to_string()));
    }
}

// ============================================================================
// Agent service
// ============================================================================

#[derive(Debug, Clone)]
pub struct StreamCall {
    pub agent_id: String,
    pub prompt: String,
    pub tools: Option<Vec<String>>,
}

#[derive(Default)]
pub struct FakeAgentService {
    next_id: AtomicUsize,
    pub created: Mutex<Vec<String>>,
    pub deleted: Mutex<Vec<String>>,
    pub stream_calls: Mutex<Vec<StreamCall>>,
    create_barrier: Option<Barrier>,
    script: Vec<Result<String, AgentServiceError>>,
    fail_create: bool,
    fail_delete: bool,
    fail_stream_open: bool,
    hang_stream_open: bool,
}

impl FakeAgentService {
    pub fn new() -> Self {
        Self::default()
    }

    /// Hold every `create_agent` call until `n` callers have arrived, so that
    /// all of them observe an unbound conversation first.
    pub fn with_create_barrier(mut self, n: usize) -> Self {
        self.create_barrier = Some(Barrier::new(n));
        self
    }

    pub fn with_reply(mut self, deltas: &[&str]) -> Self {
        self.script = deltas.iter().map(|d| Ok(d.to_string())).collect();
        self
    }

    pub fn with_script(mut self, script: Vec<Result<String, AgentServiceError>>) -> Self {
        self.script = script;
        self
    }

    pub fn failing_create(mut self) -> Self {
        self.fail_create = true;
        self
    }

    pub fn failing_delete(mut self) -> Self {
        self.fail_delete = true;
        self
    }

    pub fn failing_stream_open(mut self) -> Self {
        self.fail_stream_open = true;
        self
    }

    /// `stream_chat` never returns, as if the model endpoint stopped answering.
    pub fn hanging_stream_open(mut self) -> Self {
        self.hang_stream_open = true;
        self
    }

    pub fn created(&self) -> Vec<String> {
        self.created.lock().unwrap().clone()
    }

    pub fn deleted(&self) -> Vec<String> {
        self.deleted.lock().unwrap().clone()
    }

    pub fn stream_calls(&self) -> Vec<StreamCall> {
        self.stream_calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl AgentService for FakeAgentService {
    async fn create_agent(&self, _seed: &str) -> Result<String, AgentServiceError> {
        if self.fail_create {
            return Err(AgentServiceError::Status {
                status: 503,
                body: "agent service unavailable".to_string(),
            });
        }
        if let Some(barrier) = &self.create_barrier {
            barrier.wait().await;
        }
        let id = format!("agent-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.created.lock().unwrap().push(id.clone());
        Ok(id)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        self.deleted.lock().unwrap().push(agent_id.to_string());
        if self.fail_delete {
            return Err(AgentServiceError::Http("connection reset".to_string()));
        }
        Ok(())
    }

    async fn stream_chat(
        &self,
        agent_id: &str,
        prompt: &str,
        tools: Option<&ToolSet>,
    ) -> Result<TextStream, AgentServiceError> {
        self.stream_calls.lock().unwrap().push(StreamCall {
            agent_id: agent_id.to_string(),
            prompt: prompt.to_string(),
            tools: tools.map(ToolSet::names),
        });
        if self.hang_stream_open {
            std::future::pending::<()>().await;
        }
        if self.fail_stream_open {
            return Err(AgentServiceError::Status {
                status: 500,
                body: "stream refused".to_string(),
            });
        }
        Ok(futures_util::stream::iter(self.script.clone()).boxed())
    }
}

// ============================================================================
// Tool providers
// ============================================================================

pub fn provider(id: &str, auth_type: AuthType) -> ToolProviderConfig {
    ToolProviderConfig {
        id: id.to_string(),
        name: format!("{id} server"),
        url: format!("https://{id}.example/mcp"),
        auth_type,
    }
}

pub fn tool(name: &str) -> ToolDefinition {
    ToolDefinition {
        name: name.to_string(),
        description: Some(format!("{name} tool")),
        input_schema: json!({"type": "object"}),
    }
}

pub struct StaticRegistry(pub Vec<ToolProviderConfig>);

#[async_trait]
impl ToolProviderRegistry for StaticRegistry {
    async fn list_providers(&self) -> Result<Vec<ToolProviderConfig>, StoreError> {
        Ok(self.0.clone())
    }
}

#[derive(Default)]
pub struct MapVault(pub HashMap<String, String>);

#[async_trait]
impl CredentialVault for MapVault {
    async fn get_api_key(&self, name: &str) -> Result<Option<String>, StoreError> {
        Ok(self.0.get(name).cloned())
    }
}

#[derive(Clone)]
pub enum Behaviour {
    /// Connect with any credentials and expose these tools.
    Tools(Vec<&'static str>),
    /// Refuse every connection attempt with this error.
    Refuse(TransportError),
    /// Accept only this bearer token; anything else is unauthorized.
    RequireToken(&'static str, Vec<&'static str>),
    /// Connect, but fail to list tools.
    ListFails,
    /// Connect and list, but fail to close.
    CloseFails(Vec<&'static str>),
}

#[derive(Default)]
pub struct FakeTransport {
    behaviours: HashMap<String, Behaviour>,
    /// (provider id, bearer token) per connection attempt.
    pub connects: Mutex<Vec<(String, Option<String>)>>,
    /// Provider ids whose clients had `close` called.
    pub closed: Arc<Mutex<Vec<String>>>,
}

impl FakeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, provider_id: &str, behaviour: Behaviour) -> Self {
        self.behaviours.insert(provider_id.to_string(), behaviour);
        self
    }

    pub fn connects(&self) -> Vec<(String, Option<String>)> {
        self.connects.lock().unwrap().clone()
    }

    pub fn closed(&self) -> Vec<String> {
        let mut closed = self.closed.lock().unwrap().clone();
        closed.sort();
        closed
    }
}

#[async_trait]
impl ToolTransport for FakeTransport {
    async fn connect(
        &self,
        provider: &ToolProviderConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn ToolClient>, TransportError> {
        let bearer = credentials.bearer().map(str::to_string);
        self.connects
            .lock()
            .unwrap()
            .push((provider.id.clone(), bearer.clone()));

        let behaviour = self
            .behaviours
            .get(&provider.id)
            .cloned()
            .unwrap_or(Behaviour::Tools(Vec::new()));
        let client = |tools: Vec<&'static str>, list_fails: bool, close_fails: bool| {
            Arc::new(FakeToolClient {
                provider_id: provider.id.clone(),
                tools: tools.into_iter().map(tool).collect(),
                list_fails,
                close_fails,
                closed: Arc::clone(&self.closed),
            }) as Arc<dyn ToolClient>
        };

        match behaviour {
            Behaviour::Tools(tools) => Ok(client(tools, false, false)),
            Behaviour::Refuse(err) => Err(err),
            Behaviour::RequireToken(expected, tools) => {
                if bearer.as_deref() == Some(expected) {
                    Ok(client(tools, false, false))
                } else {
                    Err(TransportError::Unauthorized("invalid_token".to_string()))
                }
            }
            Behaviour::ListFails => Ok(client(Vec::new(), true, false)),
            Behaviour::CloseFails(tools) => Ok(client(tools, false, true)),
        }
    }
}

pub struct FakeToolClient {
    provider_id: String,
    tools: Vec<ToolDefinition>,
    list_fails: bool,
    close_fails: bool,
    closed: Arc<Mutex<Vec<String>>>,
}

#[async_trait]
impl ToolClient for FakeToolClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        if self.list_fails {
            return Err(TransportError::Protocol("tools/list not supported".to_string()));
        }
        Ok(self.tools.clone())
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        Ok(json!({ "provider": self.provider_id, "tool": name, "arguments": arguments }))
    }

    async fn close(&self) -> Result<(), TransportError> {
        self.closed.lock().unwrap().push(self.provider_id.clone());
        if self.close_fails {
            return Err(TransportError::Http("socket already closed".to_string()));
        }
        Ok(())
    }
}

// ============================================================================
// OAuth
// ============================================================================

pub struct FakeOAuthProvider {
    cached: Option<TokenSet>,
    issued: TokenSet,
    /// (redirect uri, state) per authorization attempt.
    pub authorizations: Mutex<Vec<(String, String)>>,
    pub exchanged: Mutex<Vec<String>>,
}

impl FakeOAuthProvider {
    pub fn new(cached: Option<&str>, issued: &str) -> Self {
        Self {
            cached: cached.map(TokenSet::bearer),
            issued: TokenSet::bearer(issued),
            authorizations: Mutex::new(Vec::new()),
            exchanged: Mutex::new(Vec::new()),
        }
    }

    pub fn exchanged(&self) -> Vec<String> {
        self.exchanged.lock().unwrap().clone()
    }

    pub fn authorizations(&self) -> Vec<(String, String)> {
        self.authorizations.lock().unwrap().clone()
    }
}

#[async_trait]
impl OAuthProvider for FakeOAuthProvider {
    async fn cached_tokens(&self) -> Result<Option<TokenSet>, OAuthError> {
        Ok(self.cached.clone())
    }

    async fn begin_authorization(
        &self,
        redirect_uri: &str,
        state: &str,
    ) -> Result<(), OAuthError> {
        self.authorizations
            .lock()
            .unwrap()
            .push((redirect_uri.to_string(), state.to_string()));
        Ok(())
    }

    async fn exchange_code(&self, code: &str) -> Result<TokenSet, OAuthError> {
        self.exchanged.lock().unwrap().push(code.to_string());
        Ok(self.issued.clone())
    }
}

pub struct SharedOAuthFactory(pub Arc<FakeOAuthProvider>);

impl OAuthProviderFactory for SharedOAuthFactory {
    fn for_provider(&self, _provider: &ToolProviderConfig) -> Arc<dyn OAuthProvider> {
        self.0.clone()
    }
}

#[derive(Clone)]
pub enum CallbackScript {
    /// Deliver this code with the expected state.
    Code(&'static str),
    /// Deliver a code with a forged state.
    WrongState,
    /// Deliver an error.
    Error(&'static str),
    /// Deliver nothing.
    Silent,
}

pub struct FakeCallbackServer {
    script: CallbackScript,
    pub starts: AtomicUsize,
    /// Sender kept after the scripted event so tests can attempt a late callback.
    pub sender: Mutex<Option<mpsc::Sender<CallbackEvent>>>,
    pub shutdowns: Mutex<Vec<oneshot::Receiver<()>>>,
}

impl FakeCallbackServer {
    pub fn new(script: CallbackScript) -> Self {
        Self {
            script,
            starts: AtomicUsize::new(0),
            sender: Mutex::new(None),
            shutdowns: Mutex::new(Vec::new()),
        }
    }

    pub fn starts(&self) -> usize {
        self.starts.load(Ordering::SeqCst)
    }

    /// True once every started listener has been torn down.
    pub fn all_disposed(&self) -> bool {
        self.shutdowns
            .lock()
            .unwrap()
            .iter_mut()
            .all(|rx| rx.try_recv().is_ok())
    }
}

#[async_trait]
impl CallbackServer for FakeCallbackServer {
    async fn start(&self, expected_state: &str) -> Result<CallbackListener, OAuthError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = mpsc::channel(1);
        let event = match &self.script {
            CallbackScript::Code(code) => Some(CallbackEvent::Code {
                code: code.to_string(),
                state: expected_state.to_string(),
            }),
            CallbackScript::WrongState => Some(CallbackEvent::Code {
                code: "stolen-code".to_string(),
                state: "forged-state".to_string(),
            }),
            CallbackScript::Error(message) => Some(CallbackEvent::Error(message.to_string())),
            CallbackScript::Silent => None,
        };
        if let Some(event) = event {
            tx.try_send(event)
                .map_err(|e| OAuthError::Listener(e.to_string()))?;
        }
        *self.sender.lock().unwrap() = Some(tx);

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        self.shutdowns.lock().unwrap().push(shutdown_rx);
        Ok(CallbackListener::new(
            "http://127.0.0.1:4567/oauth/callback",
            rx,
            shutdown_tx,
        ))
    }
}
