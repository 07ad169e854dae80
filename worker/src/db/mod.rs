use agent_runtime::StoreError;
use sqlx::SqlitePool;

pub mod conversations;

pub use conversations::SqliteConversationStore;

pub async fn connect(database_url: &str) -> anyhow::Result<SqlitePool> {
    // Accepts both "sqlite:./worker.db" and a bare path.
    let file_path = database_url.strip_prefix("sqlite:").unwrap_or(database_url);

    let abs_path = std::env::current_dir()?.join(file_path);
    if let Some(parent) = abs_path.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }

    let pool = sqlx::SqlitePool::connect_with(
        sqlx::sqlite::SqliteConnectOptions::new()
            .filename(&abs_path)
            .create_if_missing(true)
            .foreign_keys(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(std::time::Duration::from_secs(5)),
    )
    .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    Ok(pool)
}

pub(crate) fn backend(err: sqlx::Error) -> StoreError {
    StoreError::Backend(err.to_string())
}
