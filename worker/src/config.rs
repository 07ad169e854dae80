use std::net::IpAddr;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Clone)]
pub struct Config {
    /// Port the worker listens on
    pub port: u16,
    /// SQLite database for conversations, messages and OAuth state
    pub database_url: String,
    /// Base URL of the Letta-compatible agent service
    pub letta_base_url: String,
    pub letta_api_key: String,
    /// Model handle for newly created agents (service default when unset)
    pub letta_model: Option<String>,
    /// Embedding handle for newly created agents (service default when unset)
    pub letta_embedding: Option<String>,
    /// Upper bound on one streamed agent reply
    pub agent_stream_timeout: Duration,
    /// TOML file listing the tool providers
    pub tool_providers_file: PathBuf,
    /// Interface the OAuth callback listener binds to
    pub oauth_callback_host: IpAddr,
    /// How long a user has to finish authorizing a tool provider
    pub oauth_callback_timeout: Duration,
    /// Client name sent during dynamic client registration
    pub oauth_client_name: String,
    /// Open the system browser for authorization instead of only logging the URL
    pub oauth_open_browser: bool,
    /// Browser origins allowed by CORS
    pub cors_allowed_origins: Vec<String>,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            port: env_parse("WORKER_PORT", 8787)?,
            database_url: env_str("WORKER_DATABASE_URL", "sqlite:./data/worker.db"),
            letta_base_url: env_str("LETTA_BASE_URL", "https://api.letta.com"),
            letta_api_key: env_required("LETTA_API_KEY")?,
            letta_model: env_opt("LETTA_MODEL"),
            letta_embedding: env_opt("LETTA_EMBEDDING"),
            agent_stream_timeout: Duration::from_secs(env_parse(
                "AGENT_STREAM_TIMEOUT_SECS",
                300,
            )?),
            tool_providers_file: PathBuf::from(env_str(
                "TOOL_PROVIDERS_FILE",
                "./tool-providers.toml",
            )),
            oauth_callback_host: env_parse("OAUTH_CALLBACK_HOST", IpAddr::from([127, 0, 0, 1]))?,
            oauth_callback_timeout: Duration::from_secs(env_parse(
                "OAUTH_CALLBACK_TIMEOUT_SECS",
                300,
            )?),
            oauth_client_name: env_str("OAUTH_CLIENT_NAME", "Nosis"),
            oauth_open_browser: env_parse("OAUTH_OPEN_BROWSER", false)?,
            cors_allowed_origins: env_csv("CORS_ALLOWED_ORIGINS", &["http://localhost:3000"]),
        })
    }
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("port", &self.port)
            .field("database_url", &self.database_url)
            .field("letta_base_url", &self.letta_base_url)
            .field("letta_api_key", &"<redacted>")
            .field("letta_model", &self.letta_model)
            .field("agent_stream_timeout", &self.agent_stream_timeout)
            .field("tool_providers_file", &self.tool_providers_file)
            .field("oauth_callback_host", &self.oauth_callback_host)
            .field("oauth_callback_timeout", &self.oauth_callback_timeout)
            .field("oauth_open_browser", &self.oauth_open_browser)
            .field("cors_allowed_origins", &self.cors_allowed_origins)
            .finish()
    }
}

fn env_str(key: &str, default: &str) -> String {
    std::env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    std::env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_required(key: &str) -> anyhow::Result<String> {
    env_opt(key).ok_or_else(|| anyhow::anyhow!("Missing required env var {key}"))
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .trim()
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}

fn env_csv(key: &str, default: &[&str]) -> Vec<String> {
    match std::env::var(key) {
        Ok(raw) => raw
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(ToString::to_string)
            .collect(),
        Err(_) => default.iter().map(|s| (*s).to_string()).collect(),
    }
}
