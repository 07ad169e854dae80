//! OAuth + MCP integration tests against a loopback authorization server.
//!
//! One mock origin serves discovery, registration, the token endpoint and a
//! streamable-HTTP MCP endpoint that only accepts issued access tokens.

mod common;

use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use agent_runtime::tools::oauth::{CallbackServer, OAuthHandshake, OAuthProvider, TokenSet};
use agent_runtime::tools::{Credentials, ToolTransport};
use agent_runtime::TransportError;
use axum::extract::State;
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use serde_json::{json, Value};
use shared_types::{AuthType, ToolProviderConfig};
use url::Url;

use worker::mcp::McpHttpTransport;
use worker::oauth::{pkce_challenge, AuthorizationPrompt, HttpOAuthProvider};
use worker::oauth_callback::LoopbackCallbackServer;
use worker::token_store::{RegisteredClient, SqliteTokenStore};

const ISSUED: &str = "fresh-token";
const REFRESHED: &str = "refreshed-token";

#[derive(Clone, Default)]
struct MockServer {
    base: String,
    token_requests: Arc<Mutex<Vec<HashMap<String, String>>>>,
    registrations: Arc<Mutex<usize>>,
    closed_sessions: Arc<Mutex<Vec<String>>>,
}

async fn metadata(State(s): State<MockServer>) -> Json<Value> {
    Json(json!({
        "issuer": s.base,
        "authorization_endpoint": format!("{}/authorize", s.base),
        "token_endpoint": format!("{}/token", s.base),
        "registration_endpoint": format!("{}/register", s.base),
    }))
}

async fn register(State(s): State<MockServer>, Json(body): Json<Value>) -> Response {
    assert_eq!(body["token_endpoint_auth_method"], "none");
    *s.registrations.lock().unwrap() += 1;
    (StatusCode::CREATED, Json(json!({ "client_id": "client-1" }))).into_response()
}

async fn token(State(s): State<MockServer>, Form(form): Form<HashMap<String, String>>) -> Response {
    s.token_requests.lock().unwrap().push(form.clone());
    match form.get("grant_type").map(String::as_str) {
        Some("authorization_code") if form.get("code").map(String::as_str) == Some("good-code") => {
            Json(json!({
                "access_token": ISSUED,
                "refresh_token": "rt-1",
                "expires_in": 3600,
                "token_type": "Bearer",
            }))
            .into_response()
        }
        Some("refresh_token") if form.get("refresh_token").map(String::as_str) == Some("rt-1") => {
            Json(json!({ "access_token": REFRESHED, "expires_in": 3600 })).into_response()
        }
        _ => (StatusCode::BAD_REQUEST, Json(json!({ "error": "invalid_grant" }))).into_response(),
    }
}

async fn mcp(headers: HeaderMap, Json(body): Json<Value>) -> Response {
    let authorized = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .map(|v| v == format!("Bearer {ISSUED}") || v == format!("Bearer {REFRESHED}"))
        .unwrap_or(false);
    if !authorized {
        return (
            StatusCode::UNAUTHORIZED,
            [(header::WWW_AUTHENTICATE, "Bearer error=\"invalid_token\"")],
        )
            .into_response();
    }

    let id = body["id"].clone();
    match body["method"].as_str().unwrap_or_default() {
        "initialize" => (
            [("mcp-session-id", "session-1")],
            Json(json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": {
                    "protocolVersion": "2025-03-26",
                    "capabilities": { "tools": {} },
                    "serverInfo": { "name": "mock", "version": "1" }
                }
            })),
        )
            .into_response(),
        "notifications/initialized" => StatusCode::ACCEPTED.into_response(),
        "tools/list" => {
            assert_eq!(headers["mcp-session-id"], "session-1");
            // Second page is delivered as an SSE frame.
            if body["params"]["cursor"] == "page-2" {
                let frame = json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": { "tools": [{ "name": "create_issue", "inputSchema": { "type": "object" } }] }
                });
                (
                    [(header::CONTENT_TYPE, "text/event-stream")],
                    format!("event: message\ndata: {frame}\n\n"),
                )
                    .into_response()
            } else {
                Json(json!({
                    "jsonrpc": "2.0",
                    "id": id,
                    "result": {
                        "tools": [{ "name": "search", "description": "Search issues", "inputSchema": { "type": "object" } }],
                        "nextCursor": "page-2"
                    }
                }))
                .into_response()
            }
        }
        "tools/call" => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "result": { "content": [{ "type": "text", "text": format!("searched {}", body["params"]["arguments"]["q"]) }] }
        }))
        .into_response(),
        other => Json(json!({
            "jsonrpc": "2.0",
            "id": id,
            "error": { "code": -32601, "message": format!("unknown method {other}") }
        }))
        .into_response(),
    }
}

async fn close_session(State(s): State<MockServer>, headers: HeaderMap) -> StatusCode {
    if let Some(session) = headers.get("mcp-session-id").and_then(|v| v.to_str().ok()) {
        s.closed_sessions.lock().unwrap().push(session.to_string());
    }
    StatusCode::NO_CONTENT
}

async fn spawn_mock_server() -> MockServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr: SocketAddr = listener.local_addr().unwrap();
    let server = MockServer {
        base: format!("http://{addr}"),
        ..Default::default()
    };
    let app = Router::new()
        .route("/.well-known/oauth-authorization-server", get(metadata))
        .route("/register", post(register))
        .route("/token", post(token))
        .route("/mcp", post(mcp).delete(close_session))
        .with_state(server.clone());
    tokio::spawn(async move { axum::serve(listener, app).await.unwrap() });
    server
}

/// Plays the user: follows the authorization URL straight to the redirect
/// with a valid code.
#[derive(Default)]
struct ApprovingBrowser {
    opened: Mutex<Vec<Url>>,
}

impl AuthorizationPrompt for ApprovingBrowser {
    fn open(&self, _provider: &ToolProviderConfig, url: &Url) {
        self.opened.lock().unwrap().push(url.clone());
        let params: HashMap<String, String> = url.query_pairs().into_owned().collect();
        let redirect = params["redirect_uri"].clone();
        let state = params["state"].clone();
        tokio::spawn(async move {
            reqwest::get(format!("{redirect}?code=good-code&state={state}"))
                .await
                .unwrap();
        });
    }
}

fn provider(server: &MockServer) -> ToolProviderConfig {
    ToolProviderConfig {
        id: "linear".to_string(),
        name: "Linear".to_string(),
        url: format!("{}/mcp", server.base),
        auth_type: AuthType::OAuth,
    }
}

fn transport() -> Arc<McpHttpTransport> {
    Arc::new(McpHttpTransport::new("Nosis", Duration::from_secs(5)).unwrap())
}

#[tokio::test]
async fn test_browser_flow_connects_with_issued_token() {
    let server = spawn_mock_server().await;
    let (pool, _dir) = common::test_pool().await;
    let store = SqliteTokenStore::new(pool);
    let browser = Arc::new(ApprovingBrowser::default());
    let oauth = HttpOAuthProvider::new(
        provider(&server),
        reqwest::Client::new(),
        store.clone(),
        browser.clone(),
        "Nosis",
    );
    let handshake = OAuthHandshake::new(
        transport(),
        Arc::new(LoopbackCallbackServer::new(
            IpAddr::V4(Ipv4Addr::LOCALHOST),
            Duration::from_secs(10),
        )),
    )
    .with_timeout(Duration::from_secs(10));

    let client = handshake.connect(&provider(&server), &oauth).await.unwrap();

    let names: Vec<String> = client
        .list_tools()
        .await
        .unwrap()
        .into_iter()
        .map(|t| t.name)
        .collect();
    assert_eq!(names, vec!["search", "create_issue"]);
    let result = client.call_tool("search", json!({ "q": "bug" })).await.unwrap();
    assert_eq!(result["content"][0]["text"], "searched \"bug\"");
    client.close().await.unwrap();
    assert_eq!(*server.closed_sessions.lock().unwrap(), vec!["session-1"]);

    // PKCE: the verifier sent to the token endpoint matches the advertised challenge.
    let opened = browser.opened.lock().unwrap().clone();
    assert_eq!(opened.len(), 1);
    let params: HashMap<String, String> = opened[0].query_pairs().into_owned().collect();
    assert_eq!(params["code_challenge_method"], "S256");
    let exchange = server.token_requests.lock().unwrap()[0].clone();
    assert_eq!(exchange["grant_type"], "authorization_code");
    assert_eq!(pkce_challenge(&exchange["code_verifier"]), params["code_challenge"]);
    assert_eq!(exchange["redirect_uri"], params["redirect_uri"]);

    let saved = store.load_tokens("linear").await.unwrap().unwrap();
    assert_eq!(saved.access_token, ISSUED);
    let registered = store.load_client("linear").await.unwrap().unwrap();
    assert_eq!(registered.client_id, "client-1");
    assert_eq!(registered.redirect_uri, params["redirect_uri"]);
}

#[tokio::test]
async fn test_expired_tokens_are_refreshed_without_browser() {
    let server = spawn_mock_server().await;
    let (pool, _dir) = common::test_pool().await;
    let store = SqliteTokenStore::new(pool);
    store
        .save_client(
            "linear",
            &RegisteredClient {
                client_id: "client-1".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:9/oauth/callback".to_string(),
            },
        )
        .await
        .unwrap();
    store
        .save_tokens(
            "linear",
            &TokenSet {
                access_token: "stale".to_string(),
                refresh_token: Some("rt-1".to_string()),
                expires_at: Some(chrono::Utc::now() - chrono::Duration::minutes(5)),
                scope: None,
            },
        )
        .await
        .unwrap();
    let browser = Arc::new(ApprovingBrowser::default());
    let oauth = HttpOAuthProvider::new(
        provider(&server),
        reqwest::Client::new(),
        store.clone(),
        browser.clone(),
        "Nosis",
    );

    let tokens = oauth.cached_tokens().await.unwrap().unwrap();

    assert_eq!(tokens.access_token, REFRESHED);
    // The rotated response carried no refresh token; the old one is kept.
    assert_eq!(tokens.refresh_token.as_deref(), Some("rt-1"));
    let saved = store.load_tokens("linear").await.unwrap().unwrap();
    assert_eq!(saved.access_token, REFRESHED);
    assert!(browser.opened.lock().unwrap().is_empty());
    assert_eq!(*server.registrations.lock().unwrap(), 0);
}

#[tokio::test]
async fn test_failed_refresh_reads_as_no_cached_tokens() {
    let server = spawn_mock_server().await;
    let (pool, _dir) = common::test_pool().await;
    let store = SqliteTokenStore::new(pool);
    store
        .save_client(
            "linear",
            &RegisteredClient {
                client_id: "client-1".to_string(),
                client_secret: None,
                redirect_uri: "http://127.0.0.1:9/oauth/callback".to_string(),
            },
        )
        .await
        .unwrap();
    store
        .save_tokens(
            "linear",
            &TokenSet {
                access_token: "stale".to_string(),
                refresh_token: Some("revoked".to_string()),
                expires_at: Some(chrono::Utc::now() - chrono::Duration::minutes(5)),
                scope: None,
            },
        )
        .await
        .unwrap();
    let oauth = HttpOAuthProvider::new(
        provider(&server),
        reqwest::Client::new(),
        store,
        Arc::new(ApprovingBrowser::default()),
        "Nosis",
    );

    assert!(oauth.cached_tokens().await.unwrap().is_none());
}

#[tokio::test]
async fn test_exchange_without_authorization_is_rejected() {
    let server = spawn_mock_server().await;
    let (pool, _dir) = common::test_pool().await;
    let oauth = HttpOAuthProvider::new(
        provider(&server),
        reqwest::Client::new(),
        SqliteTokenStore::new(pool),
        Arc::new(ApprovingBrowser::default()),
        "Nosis",
    );

    let err = oauth.exchange_code("good-code").await.unwrap_err();
    assert!(matches!(err, agent_runtime::OAuthError::NotStarted));
}

#[tokio::test]
async fn test_mcp_transport_classifies_401_as_unauthorized() {
    let server = spawn_mock_server().await;

    let err = transport()
        .connect(&provider(&server), Credentials::ApiKey("wrong".to_string()))
        .await
        .err()
        .unwrap();

    assert!(matches!(err, TransportError::Unauthorized(ref c) if c.contains("invalid_token")));
}

#[tokio::test]
async fn test_callback_server_forwards_first_callback_only() {
    let server = LoopbackCallbackServer::default();
    let mut listener = server.start("expected").await.unwrap();
    let redirect = listener.redirect_uri().to_string();
    assert!(redirect.starts_with("http://127.0.0.1:"));
    assert!(redirect.ends_with("/oauth/callback"));

    let first = reqwest::get(format!("{redirect}?code=abc&state=expected"))
        .await
        .unwrap();
    assert_eq!(first.status(), reqwest::StatusCode::OK);
    let second = reqwest::get(format!("{redirect}?code=def&state=expected"))
        .await
        .unwrap();
    assert_eq!(second.status(), reqwest::StatusCode::GONE);

    assert_eq!(
        listener.next_event().await,
        Some(agent_runtime::tools::oauth::CallbackEvent::Code {
            code: "abc".to_string(),
            state: "expected".to_string(),
        })
    );
    listener.dispose();

    // The server stops accepting connections once the listener is disposed.
    let mut stopped = false;
    for _ in 0..50 {
        if reqwest::get(&redirect).await.is_err() {
            stopped = true;
            break;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(stopped, "callback server still running after dispose");
}

#[tokio::test]
async fn test_callback_server_reports_provider_error() {
    let server = LoopbackCallbackServer::default();
    let mut listener = server.start("expected").await.unwrap();
    let redirect = listener.redirect_uri().to_string();

    let response = reqwest::get(format!(
        "{redirect}?error=access_denied&error_description=User%20declined"
    ))
    .await
    .unwrap();

    assert_eq!(response.status(), reqwest::StatusCode::BAD_REQUEST);
    assert_eq!(
        listener.next_event().await,
        Some(agent_runtime::tools::oauth::CallbackEvent::Error(
            "access_denied: User declined".to_string()
        ))
    );
}
