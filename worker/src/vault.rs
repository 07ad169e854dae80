use agent_runtime::tools::CredentialVault;
use agent_runtime::StoreError;
use async_trait::async_trait;

const PROVIDER_PREFIX: &str = "mcp:";
const ENV_PREFIX: &str = "MCP_API_KEY_";

/// Reads provider API keys from the process environment.
///
/// `mcp:linear` resolves to `MCP_API_KEY_LINEAR`, `mcp:my-server` to
/// `MCP_API_KEY_MY_SERVER`. Empty values count as missing.
#[derive(Debug, Default, Clone, Copy)]
pub struct EnvCredentialVault;

/// Environment variable holding the secret for vault entry `name`.
pub fn env_var_name(name: &str) -> String {
    let id = name.strip_prefix(PROVIDER_PREFIX).unwrap_or(name);
    let suffix: String = id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() {
                c.to_ascii_uppercase()
            } else {
                '_'
            }
        })
        .collect();
    format!("{ENV_PREFIX}{suffix}")
}

#[async_trait]
impl CredentialVault for EnvCredentialVault {
    async fn get_api_key(&self, name: &str) -> Result<Option<String>, StoreError> {
        match std::env::var(env_var_name(name)) {
            Ok(value) if !value.trim().is_empty() => Ok(Some(value.trim().to_string())),
            Ok(_) | Err(std::env::VarError::NotPresent) => Ok(None),
            Err(e) => Err(StoreError::Backend(format!("{}: {e}", env_var_name(name)))),
        }
    }
}
