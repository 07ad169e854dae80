//! Streamable-HTTP MCP transport.
//!
//! One JSON-RPC request per POST. Servers may answer with plain JSON or with
//! an SSE body carrying the response frame; both are accepted. The session
//! id handed out on `initialize` is echoed on every later request.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_runtime::tools::{Credentials, ToolClient, ToolDefinition, ToolTransport};
use agent_runtime::TransportError;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use shared_types::ToolProviderConfig;
use tracing::debug;

use crate::sse::SseDecoder;

pub const PROTOCOL_VERSION: &str = "2025-03-26";
const SESSION_HEADER: &str = "mcp-session-id";

/// Opens MCP sessions over HTTP.
#[derive(Clone)]
pub struct McpHttpTransport {
    http: reqwest::Client,
    client_name: String,
}

impl McpHttpTransport {
    pub fn new(client_name: impl Into<String>, timeout: Duration) -> Result<Self, TransportError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TransportError::Http(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            http,
            client_name: client_name.into(),
        })
    }
}

#[async_trait]
impl ToolTransport for McpHttpTransport {
    async fn connect(
        &self,
        provider: &ToolProviderConfig,
        credentials: Credentials,
    ) -> Result<Arc<dyn ToolClient>, TransportError> {
        let client = McpHttpClient {
            http: self.http.clone(),
            endpoint: provider.url.clone(),
            bearer: credentials.bearer().map(str::to_string),
            session_id: Mutex::new(None),
            next_id: AtomicI64::new(1),
        };

        let init = client
            .send_request(
                "initialize",
                Some(json!({
                    "protocolVersion": PROTOCOL_VERSION,
                    "capabilities": {},
                    "clientInfo": {
                        "name": self.client_name,
                        "version": env!("CARGO_PKG_VERSION"),
                    },
                })),
            )
            .await?;
        debug!(
            provider = %provider.id,
            server = ?init.get("serverInfo").and_then(|s| s.get("name")),
            "mcp session initialized"
        );
        client
            .send_notification("notifications/initialized", None)
            .await?;

        Ok(Arc::new(client))
    }
}

#[derive(Serialize)]
struct JsonRpcRequest<'a> {
    jsonrpc: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    id: Option<i64>,
    method: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    params: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcResponse {
    #[serde(default)]
    id: Option<Value>,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<JsonRpcErrorBody>,
}

#[derive(Debug, Deserialize)]
struct JsonRpcErrorBody {
    code: i64,
    message: String,
}

#[derive(Deserialize)]
struct ListToolsResult {
    #[serde(default)]
    tools: Vec<ToolDefinition>,
    #[serde(rename = "nextCursor", default)]
    next_cursor: Option<String>,
}

pub struct McpHttpClient {
    http: reqwest::Client,
    endpoint: String,
    bearer: Option<String>,
    session_id: Mutex<Option<String>>,
    next_id: AtomicI64,
}

impl McpHttpClient {
    fn session_id(&self) -> Option<String> {
        self.session_id
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    fn remember_session(&self, headers: &HeaderMap) {
        if let Some(id) = headers.get(SESSION_HEADER).and_then(|v| v.to_str().ok()) {
            *self
                .session_id
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner()) = Some(id.to_string());
        }
    }

    fn post(&self, body: &JsonRpcRequest<'_>) -> reqwest::RequestBuilder {
        let mut request = self
            .http
            .post(&self.endpoint)
            .header(ACCEPT, "application/json, text/event-stream")
            .json(body);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        if let Some(session) = self.session_id() {
            request = request.header(SESSION_HEADER, session);
        }
        request
    }

    async fn send(&self, body: &JsonRpcRequest<'_>) -> Result<reqwest::Response, TransportError> {
        let response = self
            .post(body)
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("HTTP request failed: {e}")))?;

        let status = response.status();
        if status == StatusCode::UNAUTHORIZED {
            let challenge = response
                .headers()
                .get(WWW_AUTHENTICATE)
                .and_then(|v| v.to_str().ok())
                .unwrap_or("Bearer")
                .to_string();
            return Err(TransportError::Unauthorized(challenge));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(TransportError::Http(format!("HTTP error: {status} - {body}")));
        }
        self.remember_session(response.headers());
        Ok(response)
    }

    async fn send_request(&self, method: &str, params: Option<Value>) -> Result<Value, TransportError> {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let response = self
            .send(&JsonRpcRequest {
                jsonrpc: "2.0",
                id: Some(id),
                method,
                params,
            })
            .await?;

        let content_type = response
            .headers()
            .get(CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        let body = response
            .text()
            .await
            .map_err(|e| TransportError::Http(format!("Failed to read response: {e}")))?;
        decode_reply(&content_type, &body, id)
    }

    async fn send_notification(&self, method: &str, params: Option<Value>) -> Result<(), TransportError> {
        self.send(&JsonRpcRequest {
            jsonrpc: "2.0",
            id: None,
            method,
            params,
        })
        .await
        .map(|_| ())
    }
}

/// Extract the result for request `id` from a JSON or SSE reply body.
fn decode_reply(content_type: &str, body: &str, id: i64) -> Result<Value, TransportError> {
    let response = if content_type.starts_with("text/event-stream") {
        SseDecoder::decode_all(body)
            .into_iter()
            .filter_map(|data| serde_json::from_str::<JsonRpcResponse>(&data).ok())
            .find(|r| r.id.as_ref().and_then(Value::as_i64) == Some(id))
            .ok_or_else(|| {
                TransportError::Protocol(format!("no response for request {id} in event stream"))
            })?
    } else {
        serde_json::from_str::<JsonRpcResponse>(body)
            .map_err(|e| TransportError::Protocol(format!("Failed to parse JSON response: {e}")))?
    };

    match (response.result, response.error) {
        (_, Some(error)) => Err(TransportError::Protocol(format!(
            "MCP error {}: {}",
            error.code, error.message
        ))),
        (Some(result), None) => Ok(result),
        (None, None) => Err(TransportError::Protocol(
            "response has neither result nor error".to_string(),
        )),
    }
}

#[async_trait]
impl ToolClient for McpHttpClient {
    async fn list_tools(&self) -> Result<Vec<ToolDefinition>, TransportError> {
        let mut tools = Vec::new();
        let mut cursor: Option<String> = None;
        loop {
            let params = cursor.take().map(|c| json!({ "cursor": c }));
            let page: ListToolsResult = serde_json::from_value(
                self.send_request("tools/list", params).await?,
            )
            .map_err(|e| TransportError::Protocol(format!("invalid tools/list result: {e}")))?;
            tools.extend(page.tools);
            match page.next_cursor {
                Some(next) if !next.is_empty() => cursor = Some(next),
                _ => return Ok(tools),
            }
        }
    }

    async fn call_tool(&self, name: &str, arguments: Value) -> Result<Value, TransportError> {
        self.send_request(
            "tools/call",
            Some(json!({ "name": name, "arguments": arguments })),
        )
        .await
    }

    async fn close(&self) -> Result<(), TransportError> {
        let Some(session) = self.session_id() else {
            return Ok(());
        };
        let mut request = self.http.delete(&self.endpoint).header(SESSION_HEADER, session);
        if let Some(token) = &self.bearer {
            request = request.bearer_auth(token);
        }
        let response = request
            .send()
            .await
            .map_err(|e| TransportError::Http(format!("HTTP request failed: {e}")))?;
        // Servers without session termination answer 405.
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::METHOD_NOT_ALLOWED | StatusCode::NOT_FOUND => Ok(()),
            status => Err(TransportError::Http(format!("session close failed: {status}"))),
        }
    }
}
