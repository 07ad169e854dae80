use std::path::PathBuf;

use agent_runtime::tools::ToolProviderRegistry;
use agent_runtime::StoreError;
use async_trait::async_trait;
use serde::Deserialize;
use shared_types::ToolProviderConfig;
use tracing::{debug, warn};

/// Tool providers listed in a TOML file:
///
/// ```toml
/// [[providers]]
/// id = "linear"
/// name = "Linear"
/// url = "https://mcp.linear.app/mcp"
/// auth_type = "oauth"
/// ```
///
/// The file is read on every call so edits apply to the next chat turn.
#[derive(Debug, Clone)]
pub struct TomlProviderRegistry {
    path: PathBuf,
}

#[derive(Debug, Default, Deserialize)]
struct ProvidersFile {
    #[serde(default)]
    providers: Vec<ToolProviderConfig>,
}

impl TomlProviderRegistry {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn parse(contents: &str) -> Result<Vec<ToolProviderConfig>, StoreError> {
        let file: ProvidersFile = toml::from_str(contents)
            .map_err(|e| StoreError::Backend(format!("invalid tool provider file: {e}")))?;

        Ok(file
            .providers
            .into_iter()
            .filter(|p| match url::Url::parse(&p.url) {
                Ok(url) if matches!(url.scheme(), "http" | "https") => true,
                _ => {
                    warn!(provider = %p.id, url = %p.url, "skipping tool provider with invalid url");
                    false
                }
            })
            .collect())
    }
}

#[async_trait]
impl ToolProviderRegistry for TomlProviderRegistry {
    async fn list_providers(&self) -> Result<Vec<ToolProviderConfig>, StoreError> {
        let contents = match tokio::fs::read_to_string(&self.path).await {
            Ok(contents) => contents,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no tool provider file");
                return Ok(Vec::new());
            }
            Err(e) => {
                return Err(StoreError::Backend(format!(
                    "failed to read {}: {e}",
                    self.path.display()
                )))
            }
        };
        Self::parse(&contents)
    }
}
