//! Loopback endpoint that receives the OAuth redirect.

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_runtime::tools::oauth::{CallbackEvent, CallbackListener, CallbackServer};
use agent_runtime::OAuthError;
use async_trait::async_trait;
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{Html, IntoResponse};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info, warn};

pub const CALLBACK_PATH: &str = "/oauth/callback";

/// Extra lifetime past the application timer before the server stops itself.
const LIFETIME_GRACE: Duration = Duration::from_secs(30);

/// Starts one short-lived axum server per authorization attempt.
#[derive(Debug, Clone)]
pub struct LoopbackCallbackServer {
    host: IpAddr,
    lifetime_cap: Duration,
}

impl LoopbackCallbackServer {
    pub fn new(host: IpAddr, authorization_timeout: Duration) -> Self {
        Self {
            host,
            lifetime_cap: authorization_timeout + LIFETIME_GRACE,
        }
    }

    pub fn lifetime_cap(&self) -> Duration {
        self.lifetime_cap
    }
}

impl Default for LoopbackCallbackServer {
    fn default() -> Self {
        Self::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            agent_runtime::tools::oauth::DEFAULT_CALLBACK_TIMEOUT,
        )
    }
}

#[derive(Clone)]
struct CallbackState {
    // Taken by the first callback; later hits find it empty.
    events: Arc<Mutex<Option<mpsc::Sender<CallbackEvent>>>>,
}

#[derive(Debug, Deserialize)]
struct CallbackQuery {
    code: Option<String>,
    state: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

impl CallbackQuery {
    fn into_event(self) -> CallbackEvent {
        if let Some(error) = self.error {
            return CallbackEvent::Error(match self.error_description {
                Some(description) => format!("{error}: {description}"),
                None => error,
            });
        }
        match self.code {
            Some(code) => CallbackEvent::Code {
                code,
                state: self.state.unwrap_or_default(),
            },
            None => CallbackEvent::Error("callback carried no authorization code".to_string()),
        }
    }
}

async fn handle_callback(
    State(state): State<CallbackState>,
    Query(query): Query<CallbackQuery>,
) -> impl IntoResponse {
    let sender = state
        .events
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
        .take();
    let Some(sender) = sender else {
        debug!("duplicate oauth callback ignored");
        return (StatusCode::GONE, Html(page("This authorization link was already used.")));
    };

    let event = query.into_event();
    let failed = matches!(event, CallbackEvent::Error(_));
    if sender.try_send(event).is_err() {
        return (StatusCode::GONE, Html(page("This authorization attempt has expired.")));
    }
    if failed {
        (StatusCode::BAD_REQUEST, Html(page("Authorization failed. You can close this window.")))
    } else {
        (StatusCode::OK, Html(page("Authorization complete. You can close this window.")))
    }
}

fn page(message: &str) -> String {
    format!(
        "<!doctype html><html><head><meta charset=\"utf-8\"><title>Nosis</title></head>\
         <body><p>{message}</p></body></html>"
    )
}

#[async_trait]
impl CallbackServer for LoopbackCallbackServer {
    async fn start(&self, _expected_state: &str) -> Result<CallbackListener, OAuthError> {
        let listener = TcpListener::bind(SocketAddr::new(self.host, 0))
            .await
            .map_err(|e| OAuthError::Listener(format!("bind failed: {e}")))?;
        let addr = listener
            .local_addr()
            .map_err(|e| OAuthError::Listener(e.to_string()))?;
        let redirect_uri = format!("http://{addr}{CALLBACK_PATH}");

        let (events_tx, events_rx) = mpsc::channel(1);
        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let app = Router::new()
            .route(CALLBACK_PATH, get(handle_callback))
            .with_state(CallbackState {
                events: Arc::new(Mutex::new(Some(events_tx))),
            });

        let cap = self.lifetime_cap;
        tokio::spawn(async move {
            let stop = async move {
                tokio::select! {
                    _ = shutdown_rx => {}
                    _ = tokio::time::sleep(cap) => {
                        warn!(%addr, "oauth callback server reached its lifetime cap");
                    }
                }
            };
            if let Err(e) = axum::serve(listener, app).with_graceful_shutdown(stop).await {
                warn!(%addr, error = %e, "oauth callback server failed");
            }
            debug!(%addr, "oauth callback server stopped");
        });

        info!(redirect_uri = %redirect_uri, "oauth callback server listening");
        Ok(CallbackListener::new(redirect_uri, events_rx, shutdown_tx))
    }
}
