use std::time::Duration;

use agent_runtime::tools::oauth::TokenSet;
use agent_runtime::OAuthError;
use chrono::{DateTime, Utc};
use sqlx::SqlitePool;
use tracing::{debug, error};

/// Client credentials obtained through dynamic registration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegisteredClient {
    pub client_id: String,
    pub client_secret: Option<String>,
    pub redirect_uri: String,
}

/// SQLite-backed OAuth state, keyed by tool provider id.
///
/// Schema lives in `migrations/0002_oauth.sql`:
/// ```sql
/// oauth_clients (provider_id PK, client_id, client_secret, redirect_uri, created_at)
/// oauth_tokens  (provider_id PK, access_token, refresh_token, expires_at, scope, updated_at)
/// ```
/// Timestamps are Unix seconds.
#[derive(Debug, Clone)]
pub struct SqliteTokenStore {
    pool: SqlitePool,
}

fn storage(err: sqlx::Error) -> OAuthError {
    OAuthError::Storage(err.to_string())
}

impl SqliteTokenStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    pub async fn load_tokens(&self, provider_id: &str) -> Result<Option<TokenSet>, OAuthError> {
        let row: Option<(String, Option<String>, Option<i64>, Option<String>)> = sqlx::query_as(
            "SELECT access_token, refresh_token, expires_at, scope
             FROM oauth_tokens WHERE provider_id = ?",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(|(access_token, refresh_token, expires_at, scope)| TokenSet {
            access_token,
            refresh_token,
            expires_at: expires_at.and_then(|ts| DateTime::<Utc>::from_timestamp(ts, 0)),
            scope,
        }))
    }

    pub async fn save_tokens(&self, provider_id: &str, tokens: &TokenSet) -> Result<(), OAuthError> {
        sqlx::query(
            "INSERT INTO oauth_tokens (provider_id, access_token, refresh_token, expires_at, scope, updated_at)
             VALUES (?, ?, ?, ?, ?, ?)
             ON CONFLICT(provider_id) DO UPDATE SET
                access_token = excluded.access_token,
                refresh_token = COALESCE(excluded.refresh_token, oauth_tokens.refresh_token),
                expires_at = excluded.expires_at,
                scope = excluded.scope,
                updated_at = excluded.updated_at",
        )
        .bind(provider_id)
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(tokens.expires_at.map(|t| t.timestamp()))
        .bind(&tokens.scope)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage)?;

        debug!(provider = %provider_id, "oauth tokens saved");
        Ok(())
    }

    pub async fn delete_tokens(&self, provider_id: &str) -> Result<(), OAuthError> {
        sqlx::query("DELETE FROM oauth_tokens WHERE provider_id = ?")
            .bind(provider_id)
            .execute(&self.pool)
            .await
            .map_err(storage)?;
        Ok(())
    }

    pub async fn load_client(
        &self,
        provider_id: &str,
    ) -> Result<Option<RegisteredClient>, OAuthError> {
        let row: Option<(String, Option<String>, String)> = sqlx::query_as(
            "SELECT client_id, client_secret, redirect_uri FROM oauth_clients WHERE provider_id = ?",
        )
        .bind(provider_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(storage)?;

        Ok(row.map(|(client_id, client_secret, redirect_uri)| RegisteredClient {
            client_id,
            client_secret,
            redirect_uri,
        }))
    }

    pub async fn save_client(
        &self,
        provider_id: &str,
        client: &RegisteredClient,
    ) -> Result<(), OAuthError> {
        sqlx::query(
            "INSERT INTO oauth_clients (provider_id, client_id, client_secret, redirect_uri, created_at)
             VALUES (?, ?, ?, ?, ?)
             ON CONFLICT(provider_id) DO UPDATE SET
                client_id = excluded.client_id,
                client_secret = excluded.client_secret,
                redirect_uri = excluded.redirect_uri,
                created_at = excluded.created_at",
        )
        .bind(provider_id)
        .bind(&client.client_id)
        .bind(&client.client_secret)
        .bind(&client.redirect_uri)
        .bind(Utc::now().timestamp())
        .execute(&self.pool)
        .await
        .map_err(storage)?;
        Ok(())
    }

    /// Delete expired tokens that cannot be refreshed.
    pub async fn delete_expired(&self) -> Result<u64, OAuthError> {
        let now = Utc::now().timestamp();
        let deleted = sqlx::query(
            "DELETE FROM oauth_tokens
             WHERE refresh_token IS NULL AND expires_at IS NOT NULL AND expires_at <= ?",
        )
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(storage)?
        .rows_affected();
        Ok(deleted)
    }
}

/// Background task: delete dead tokens every `period`.
pub async fn run_expired_token_cleanup(store: SqliteTokenStore, period: Duration) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // first tick is immediate; skip it
    loop {
        interval.tick().await;
        match store.delete_expired().await {
            Ok(0) => {}
            Ok(deleted) => debug!(deleted, "expired oauth tokens removed"),
            Err(e) => error!("oauth token cleanup failed: {e}"),
        }
    }
}
