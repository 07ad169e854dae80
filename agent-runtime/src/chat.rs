//! Streaming chat orchestration.
//!
//! The caller gets a [`ResponseStream`] as soon as the model stream is open.
//! A background task owns the model stream from then on: it forwards each
//! delta to the caller, accumulates the full text, persists the assistant
//! message and finally closes the tool clients. A caller that disconnects
//! only stops receiving deltas; the background task still runs to the end.
//!
//! Tool clients are closed exactly once on every path out of a turn,
//! including a dropped request future and a panicking background task.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use futures_util::{Stream, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::agent::{AgentService, TextStream};
use crate::background::{with_context, BackgroundTasks, ErrorSink};
use crate::error::{AgentServiceError, BoxError, ChatError};
use crate::identity::AgentIdentityResolver;
use crate::store::{ConversationKey, MessageStore};
use crate::tools::{LoadedTools, ToolCleanup, ToolLoader, ToolSet};

const DEFAULT_CHANNEL_CAPACITY: usize = 64;

/// One user message to answer.
#[derive(Debug, Clone)]
pub struct ChatTurn {
    pub conversation_id: String,
    pub user_id: String,
    pub content: String,
    /// Appended to background error reports, e.g. the conversation id.
    pub error_context: Option<String>,
}

impl ChatTurn {
    pub fn new(
        conversation_id: impl Into<String>,
        user_id: impl Into<String>,
        content: impl Into<String>,
    ) -> Self {
        let conversation_id = conversation_id.into();
        Self {
            error_context: Some(conversation_id.clone()),
            conversation_id,
            user_id: user_id.into(),
            content: content.into(),
        }
    }

    pub fn key(&self) -> ConversationKey {
        ConversationKey::new(&self.conversation_id, &self.user_id)
    }
}

/// Live model output for the caller.
///
/// Ends after the last delta, or after a single `Err` if the model stream
/// failed mid-flight.
#[derive(Debug)]
pub struct ResponseStream {
    agent_id: String,
    rx: mpsc::Receiver<Result<String, AgentServiceError>>,
}

impl ResponseStream {
    pub fn agent_id(&self) -> &str {
        &self.agent_id
    }
}

impl Stream for ResponseStream {
    type Item = Result<String, AgentServiceError>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

pub struct ChatStreamOrchestrator {
    resolver: AgentIdentityResolver,
    messages: Arc<dyn MessageStore>,
    tools: Arc<dyn ToolLoader>,
    agents: Arc<dyn AgentService>,
    background: BackgroundTasks,
    channel_capacity: usize,
}

impl ChatStreamOrchestrator {
    pub fn new(
        resolver: AgentIdentityResolver,
        messages: Arc<dyn MessageStore>,
        tools: Arc<dyn ToolLoader>,
        agents: Arc<dyn AgentService>,
        background: BackgroundTasks,
    ) -> Self {
        Self {
            resolver,
            messages,
            tools,
            agents,
            background,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
        }
    }

    pub fn with_channel_capacity(mut self, capacity: usize) -> Self {
        self.channel_capacity = capacity.max(1);
        self
    }

    /// Answer `turn` with a live stream.
    ///
    /// Fails before anything is streamed if the agent cannot be resolved, the
    /// user message cannot be saved, or the model stream cannot be opened.
    pub async fn run(&self, turn: ChatTurn) -> Result<ResponseStream, ChatError> {
        if turn.content.trim().is_empty() {
            return Err(ChatError::InvalidState(
                "message content must not be empty".to_string(),
            ));
        }
        let key = turn.key();
        let context = turn.error_context.clone();

        let agent_id = self
            .resolver
            .resolve(&key, &turn.conversation_id, context.as_deref())
            .await?;

        let (saved, loaded) = tokio::join!(
            self.messages.save_user_message(&key, &turn.content),
            self.tools.load_tools(),
        );
        let LoadedTools { tools, cleanup } = loaded;
        let cleanup = ReleaseOnDrop::new(cleanup, &self.background, context.clone());
        saved?;

        let offered = (!tools.is_empty()).then_some(&tools);
        let stream = self
            .agents
            .stream_chat(&agent_id, &turn.content, offered)
            .await?;
        debug!(
            conversation_id = %key,
            agent_id = %agent_id,
            tools = tools.len(),
            "model stream opened"
        );

        let (tx, rx) = mpsc::channel(self.channel_capacity);
        let pump = StreamPump {
            stream,
            tx,
            messages: Arc::clone(&self.messages),
            sink: Arc::clone(self.background.sink()),
            key,
            context: context.clone(),
            tools,
            cleanup,
        };
        self.background.schedule(
            with_context("Failed to save assistant message", context.as_deref()),
            pump.run(),
        );

        Ok(ResponseStream { agent_id, rx })
    }
}

/// Holds a turn's [`ToolCleanup`] until it is run in place.
///
/// Dropping the guard while it still holds the cleanup schedules it on the
/// background tasks, so an early return, a cancelled request and an
/// unwinding pump all close the clients.
struct ReleaseOnDrop {
    cleanup: Option<ToolCleanup>,
    background: BackgroundTasks,
    context: Option<String>,
}

impl ReleaseOnDrop {
    fn new(cleanup: ToolCleanup, background: &BackgroundTasks, context: Option<String>) -> Self {
        Self {
            cleanup: Some(cleanup),
            background: background.clone(),
            context,
        }
    }

    async fn run(mut self) {
        if let Some(cleanup) = self.cleanup.take() {
            cleanup.run().await;
        }
    }
}

impl Drop for ReleaseOnDrop {
    fn drop(&mut self) {
        let Some(cleanup) = self.cleanup.take() else {
            return;
        };
        if cleanup.is_empty() {
            return;
        }
        if tokio::runtime::Handle::try_current().is_err() {
            warn!(clients = cleanup.len(), "no runtime left to close tool clients");
            return;
        }
        self.background.schedule(
            with_context("Failed to close tools", self.context.as_deref()),
            async move {
                cleanup.run().await;
                Ok(())
            },
        );
    }
}

/// Background half of a chat request. Owns the tool set once scheduled.
struct StreamPump {
    stream: TextStream,
    tx: mpsc::Sender<Result<String, AgentServiceError>>,
    messages: Arc<dyn MessageStore>,
    sink: Arc<dyn ErrorSink>,
    key: ConversationKey,
    context: Option<String>,
    tools: ToolSet,
    cleanup: ReleaseOnDrop,
}

impl StreamPump {
    async fn run(self) -> Result<(), BoxError> {
        let StreamPump {
            mut stream,
            tx,
            messages,
            sink,
            key,
            context,
            tools,
            cleanup,
        } = self;

        let mut text = String::new();
        let mut caller_attached = true;
        let mut failed = false;
        while let Some(item) = stream.next().await {
            match item {
                Ok(delta) => {
                    text.push_str(&delta);
                    if caller_attached && tx.send(Ok(delta)).await.is_err() {
                        debug!(conversation_id = %key, "caller went away, draining model stream");
                        caller_attached = false;
                    }
                }
                Err(err) => {
                    sink.report(&with_context("Agent stream error", context.as_deref()), &err);
                    if caller_attached {
                        let _ = tx.send(Err(err)).await;
                    }
                    failed = true;
                    break;
                }
            }
        }
        drop(tx);

        let saved = if failed {
            warn!(conversation_id = %key, "model stream failed, assistant reply not saved");
            Ok(())
        } else if text.trim().is_empty() {
            debug!(conversation_id = %key, "empty assistant reply, nothing to save");
            Ok(())
        } else {
            messages
                .save_assistant_message(&key, &text)
                .await
                .map_err(BoxError::from)
        };

        cleanup.run().await;
        drop(tools);
        saved
    }
}
