#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use agent_runtime::tools::ToolSet;
use agent_runtime::{AgentService, AgentServiceError, TextStream};
use async_trait::async_trait;
use futures_util::StreamExt;
use sqlx::SqlitePool;

/// Fresh migrated database in a temp dir. Keep the `TempDir` alive.
pub async fn test_pool() -> (SqlitePool, tempfile::TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp directory");
    let url = format!("sqlite:{}", temp_dir.path().join("worker.db").display());
    let pool = worker::db::connect(&url)
        .await
        .expect("Failed to open database");
    (pool, temp_dir)
}

/// Agent service that streams a fixed script of deltas.
pub struct ScriptedAgents {
    script: Vec<Result<String, AgentServiceError>>,
    created: AtomicUsize,
    pub prompts: Mutex<Vec<(String, String)>>,
}

impl ScriptedAgents {
    pub fn replying(deltas: &[&str]) -> Self {
        Self::with_script(deltas.iter().map(|d| Ok(d.to_string())).collect())
    }

    pub fn with_script(script: Vec<Result<String, AgentServiceError>>) -> Self {
        Self {
            script,
            created: AtomicUsize::new(0),
            prompts: Mutex::new(Vec::new()),
        }
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl AgentService for ScriptedAgents {
    async fn create_agent(&self, _seed: &str) -> Result<String, AgentServiceError> {
        let n = self.created.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(format!("agent-{n}"))
    }

    async fn delete_agent(&self, _agent_id: &str) -> Result<(), AgentServiceError> {
        Ok(())
    }

    async fn stream_chat(
        &self,
        agent_id: &str,
        prompt: &str,
        _tools: Option<&ToolSet>,
    ) -> Result<TextStream, AgentServiceError> {
        self.prompts
            .lock()
            .unwrap()
            .push((agent_id.to_string(), prompt.to_string()));
        Ok(futures_util::stream::iter(self.script.clone()).boxed())
    }
}
