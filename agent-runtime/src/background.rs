//! Supervised fire-and-forget work.
//!
//! Tasks scheduled here belong to a process-owned [`TaskTracker`], not to the
//! request that scheduled them, so they keep running after the response has
//! been delivered or the client has gone away. Failures never travel back to
//! the caller of [`BackgroundTasks::schedule`]; they go to the [`ErrorSink`].

use std::any::Any;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use tokio_util::task::TaskTracker;

use crate::error::{BackgroundTaskFailed, BoxError};

/// Destination for errors raised by background work.
pub trait ErrorSink: Send + Sync {
    fn report(&self, message: &str, error: &(dyn std::error::Error + 'static));
}

/// Default sink: log through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingErrorSink;

impl ErrorSink for TracingErrorSink {
    fn report(&self, message: &str, error: &(dyn std::error::Error + 'static)) {
        tracing::error!(error = %error, "{message}");
    }
}

/// Append the caller's error-context tag, e.g. `"Failed to save [conv-1]"`.
pub fn with_context(message: &str, context: Option<&str>) -> String {
    match context {
        Some(tag) if !tag.is_empty() => format!("{message} [{tag}]"),
        _ => message.to_string(),
    }
}

#[derive(Clone)]
pub struct BackgroundTasks {
    tracker: TaskTracker,
    sink: Arc<dyn ErrorSink>,
}

impl BackgroundTasks {
    pub fn new(sink: Arc<dyn ErrorSink>) -> Self {
        Self {
            tracker: TaskTracker::new(),
            sink,
        }
    }

    pub fn sink(&self) -> &Arc<dyn ErrorSink> {
        &self.sink
    }

    /// Run `task` to completion on the process task group.
    ///
    /// Never blocks. An `Err` or a panic inside the task is reported to the
    /// sink with `label` as the message.
    pub fn schedule<F>(&self, label: impl Into<String>, task: F)
    where
        F: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let label = label.into();
        let sink = Arc::clone(&self.sink);
        self.tracker.spawn(async move {
            match AssertUnwindSafe(task).catch_unwind().await {
                Ok(Ok(())) => tracing::trace!(task = %label, "background task finished"),
                Ok(Err(err)) => sink.report(&label, &*err),
                Err(panic) => {
                    let failure = BackgroundTaskFailed {
                        label: label.clone(),
                        message: panic_message(panic.as_ref()),
                    };
                    sink.report(&label, &failure);
                }
            }
        });
    }

    /// Number of scheduled tasks that have not finished yet.
    pub fn pending(&self) -> usize {
        self.tracker.len()
    }

    /// Wait for every task scheduled so far, then keep accepting new ones.
    pub async fn drain(&self) {
        self.tracker.close();
        self.tracker.wait().await;
        self.tracker.reopen();
    }

    /// Wait for everything in flight. Used on process shutdown.
    pub async fn shutdown(&self) {
        let pending = self.tracker.len();
        if pending > 0 {
            tracing::info!(pending, "waiting for background tasks");
        }
        self.tracker.close();
        self.tracker.wait().await;
    }
}

impl std::fmt::Debug for BackgroundTasks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackgroundTasks")
            .field("pending", &self.tracker.len())
            .finish()
    }
}

fn panic_message(panic: &(dyn Any + Send)) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else {
        "task panicked".to_string()
    }
}
