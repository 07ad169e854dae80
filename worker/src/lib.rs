//! Chat worker: conversation storage, streamed agent replies and
//! tool-provider connections behind a small axum API.

pub mod api;
pub mod config;
pub mod db;
pub mod letta;
pub mod mcp;
pub mod middleware;
pub mod oauth;
pub mod oauth_callback;
pub mod providers;
pub mod sse;
pub mod state;
pub mod token_store;
pub mod vault;

pub use state::AppState;
