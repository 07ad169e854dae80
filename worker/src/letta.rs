//! Letta-compatible agent service client.
//!
//! Agents are durable on the service side; the worker only creates them,
//! deletes orphans and streams replies.

use std::collections::VecDeque;
use std::pin::Pin;
use std::time::Duration;

use agent_runtime::tools::ToolSet;
use agent_runtime::{AgentService, AgentServiceError, TextStream};
use async_trait::async_trait;
use axum::body::Bytes;
use futures_util::{Stream, StreamExt};
use reqwest::StatusCode;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{debug, warn};

use crate::sse::SseDecoder;

#[derive(Debug, Clone)]
pub struct LettaConfig {
    pub base_url: String,
    pub api_key: String,
    pub model: Option<String>,
    pub embedding: Option<String>,
    pub timeout: Duration,
}

#[derive(Clone)]
pub struct LettaClient {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
    model: Option<String>,
    embedding: Option<String>,
}

#[derive(Deserialize)]
struct CreatedAgent {
    id: String,
}

impl LettaClient {
    pub fn new(config: LettaConfig) -> Result<Self, AgentServiceError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| AgentServiceError::Http(format!("failed to build HTTP client: {e}")))?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key: config.api_key,
            model: config.model,
            embedding: config.embedding,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn create_body(&self, seed: &str) -> Value {
        let mut body = json!({
            "name": agent_name(seed),
            "tags": [seed],
            "include_base_tools": true,
        });
        if let Some(model) = &self.model {
            body["model"] = json!(model);
        }
        if let Some(embedding) = &self.embedding {
            body["embedding"] = json!(embedding);
        }
        body
    }
}

/// Agent names are derived from the seed so they are traceable on the service.
fn agent_name(seed: &str) -> String {
    format!("nosis-{seed}")
}

async fn error_for_status(response: reqwest::Response) -> AgentServiceError {
    let status = response.status().as_u16();
    let body = response.text().await.unwrap_or_default();
    AgentServiceError::Status { status, body }
}

fn http_error(err: reqwest::Error) -> AgentServiceError {
    AgentServiceError::Http(err.to_string())
}

#[async_trait]
impl AgentService for LettaClient {
    async fn create_agent(&self, seed: &str) -> Result<String, AgentServiceError> {
        let response = self
            .http
            .post(self.url("/v1/agents"))
            .bearer_auth(&self.api_key)
            .json(&self.create_body(seed))
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }
        let created: CreatedAgent = response
            .json()
            .await
            .map_err(|e| AgentServiceError::Decode(e.to_string()))?;
        debug!(agent_id = %created.id, seed, "agent created");
        Ok(created.id)
    }

    async fn delete_agent(&self, agent_id: &str) -> Result<(), AgentServiceError> {
        let response = self
            .http
            .delete(self.url(&format!("/v1/agents/{agent_id}")))
            .bearer_auth(&self.api_key)
            .send()
            .await
            .map_err(http_error)?;
        match response.status() {
            status if status.is_success() => Ok(()),
            StatusCode::NOT_FOUND => {
                debug!(agent_id, "agent already gone");
                Ok(())
            }
            _ => Err(error_for_status(response).await),
        }
    }

    async fn stream_chat(
        &self,
        agent_id: &str,
        prompt: &str,
        tools: Option<&ToolSet>,
    ) -> Result<TextStream, AgentServiceError> {
        let mut body = json!({
            "messages": [{ "role": "user", "content": prompt }],
            "stream_tokens": true,
        });
        if let Some(tools) = tools.filter(|t| !t.is_empty()) {
            body["client_tools"] = Value::Array(
                tools
                    .definitions()
                    .into_iter()
                    .map(|d| {
                        json!({
                            "name": d.name,
                            "description": d.description,
                            "parameters": d.input_schema,
                        })
                    })
                    .collect(),
            );
        }

        let response = self
            .http
            .post(self.url(&format!("/v1/agents/{agent_id}/messages/stream")))
            .bearer_auth(&self.api_key)
            .header(reqwest::header::ACCEPT, "text/event-stream")
            .json(&body)
            .send()
            .await
            .map_err(http_error)?;
        if !response.status().is_success() {
            return Err(error_for_status(response).await);
        }
        Ok(text_deltas(response.bytes_stream()))
    }
}

/// One decoded stream frame.
#[derive(Debug, PartialEq, Eq)]
enum Frame {
    Delta(String),
    Done,
    Failed(String),
    Skip,
}

#[derive(Deserialize)]
struct StreamMessage {
    #[serde(default)]
    message_type: Option<String>,
    #[serde(default)]
    content: Option<Value>,
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    error: Option<Value>,
}

fn parse_frame(data: &str) -> Frame {
    if data.trim() == "[DONE]" {
        return Frame::Done;
    }
    let message: StreamMessage = match serde_json::from_str(data) {
        Ok(message) => message,
        Err(e) => {
            warn!(error = %e, "skipping undecodable agent stream frame");
            return Frame::Skip;
        }
    };

    if let Some(error) = message.error {
        return Frame::Failed(error_text(&error));
    }
    match message.message_type.as_deref() {
        Some("assistant_message") => match message.content.as_ref().map(content_text) {
            Some(text) if !text.is_empty() => Frame::Delta(text),
            _ => Frame::Skip,
        },
        Some("error_message") => Frame::Failed(
            message
                .message
                .or_else(|| message.content.as_ref().map(content_text))
                .unwrap_or_else(|| "agent reported an error".to_string()),
        ),
        _ => Frame::Skip,
    }
}

/// Content is either a string or a list of `{ "type": "text", "text": ... }` parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(text) => text.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|part| part.get("text").and_then(Value::as_str))
            .collect(),
        _ => String::new(),
    }
}

fn error_text(error: &Value) -> String {
    match error {
        Value::String(text) => text.clone(),
        other => other
            .get("message")
            .and_then(Value::as_str)
            .map(str::to_string)
            .unwrap_or_else(|| other.to_string()),
    }
}

struct DeltaState<S> {
    body: Pin<Box<S>>,
    decoder: SseDecoder,
    pending: VecDeque<String>,
    finished: bool,
}

/// Turn an SSE byte stream into assistant text deltas.
///
/// Ends on `[DONE]` or end of body. A transport or service error ends the
/// stream after yielding one `Err`.
pub fn text_deltas<S, E>(body: S) -> TextStream
where
    S: Stream<Item = Result<Bytes, E>> + Send + 'static,
    E: std::fmt::Display + Send,
{
    let state = DeltaState {
        body: Box::pin(body),
        decoder: SseDecoder::new(),
        pending: VecDeque::new(),
        finished: false,
    };
    futures_util::stream::unfold(state, |mut s| async move {
        loop {
            if let Some(data) = s.pending.pop_front() {
                match parse_frame(&data) {
                    Frame::Delta(text) => return Some((Ok(text), s)),
                    Frame::Skip => continue,
                    Frame::Done => return None,
                    Frame::Failed(message) => {
                        s.pending.clear();
                        s.finished = true;
                        return Some((Err(AgentServiceError::Stream(message)), s));
                    }
                }
            }
            if s.finished {
                return None;
            }
            match s.body.next().await {
                Some(Ok(chunk)) => s.pending.extend(s.decoder.feed(&chunk)),
                Some(Err(e)) => {
                    s.finished = true;
                    return Some((Err(AgentServiceError::Stream(e.to_string())), s));
                }
                None => {
                    s.finished = true;
                    s.pending.extend(s.decoder.finish());
                }
            }
        }
    })
    .boxed()
}
