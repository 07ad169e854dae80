use std::sync::Arc;
use std::time::Duration;

use agent_runtime::tools::oauth::OAuthHandshake;
use agent_runtime::{BackgroundTasks, ToolConnectionManager, TracingErrorSink};
use axum::http::{header, HeaderValue, Method};
use tower_http::cors::{AllowOrigin, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use worker::config::Config;
use worker::letta::{LettaClient, LettaConfig};
use worker::mcp::McpHttpTransport;
use worker::middleware::USER_ID_HEADER;
use worker::oauth::{AuthorizationPrompt, BrowserPrompt, HttpOAuthProviderFactory, LogPrompt};
use worker::oauth_callback::LoopbackCallbackServer;
use worker::providers::TomlProviderRegistry;
use worker::token_store::{self, SqliteTokenStore};
use worker::vault::EnvCredentialVault;
use worker::{api, db, AppState};

const TOOL_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| {
                "worker=debug,agent_runtime=debug,tower_http=info".into()
            }),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    info!(port = config.port, "worker starting");

    // Database
    let db = db::connect(&config.database_url).await?;
    let conversations = db::SqliteConversationStore::new(db.clone());
    let tokens = SqliteTokenStore::new(db.clone());

    // Spawn expired-token cleanup every hour.
    tokio::spawn(token_store::run_expired_token_cleanup(
        tokens.clone(),
        Duration::from_secs(3600),
    ));

    let background = BackgroundTasks::new(Arc::new(TracingErrorSink));

    // Agent service
    let agents = Arc::new(LettaClient::new(LettaConfig {
        base_url: config.letta_base_url.clone(),
        api_key: config.letta_api_key.clone(),
        model: config.letta_model.clone(),
        embedding: config.letta_embedding.clone(),
        timeout: config.agent_stream_timeout,
    })?);

    // Tool providers
    let transport = Arc::new(McpHttpTransport::new(
        config.oauth_client_name.clone(),
        TOOL_REQUEST_TIMEOUT,
    )?);
    let prompt: Arc<dyn AuthorizationPrompt> = if config.oauth_open_browser {
        Arc::new(BrowserPrompt)
    } else {
        Arc::new(LogPrompt)
    };
    let oauth_providers = Arc::new(HttpOAuthProviderFactory::new(
        reqwest::Client::builder()
            .timeout(TOOL_REQUEST_TIMEOUT)
            .build()?,
        tokens,
        prompt,
        config.oauth_client_name.clone(),
    ));
    let callbacks = Arc::new(LoopbackCallbackServer::new(
        config.oauth_callback_host,
        config.oauth_callback_timeout,
    ));
    let handshake = OAuthHandshake::new(transport.clone(), callbacks)
        .with_timeout(config.oauth_callback_timeout);
    let tools = Arc::new(ToolConnectionManager::new(
        Arc::new(TomlProviderRegistry::new(config.tool_providers_file.clone())),
        transport,
        Arc::new(EnvCredentialVault),
        oauth_providers,
        handshake,
    ));

    let state = Arc::new(AppState::new(
        conversations,
        agents,
        tools,
        background.clone(),
    ));

    let allowed_origins: Vec<HeaderValue> = config
        .cors_allowed_origins
        .iter()
        .filter_map(|origin| match HeaderValue::from_str(origin) {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    let cors = CorsLayer::new()
        .allow_origin(AllowOrigin::list(allowed_origins))
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([
            header::CONTENT_TYPE,
            header::ACCEPT,
            header::AUTHORIZATION,
            header::HeaderName::from_static(USER_ID_HEADER),
        ])
        .max_age(Duration::from_secs(3600));

    let app = api::app(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http());

    let addr = format!("0.0.0.0:{}", config.port);
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(pending = background.pending(), "draining background tasks");
    background.shutdown().await;
    info!("worker stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    info!("shutdown signal received");
}
