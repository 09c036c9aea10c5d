//! app-issue-tracker - An issue-tracking control plane that drives a CLI coding agent.
//!
//! Issues live on disk in one folder per status. A background processor admits
//! open issues to the agent under a concurrency budget, parks rate-limited runs
//! in `waiting`, and every transition is streamed to WebSocket subscribers.

pub mod agents;
pub mod api;
pub mod app;
pub mod cli;
pub mod commands;
pub mod config;
pub mod events;
pub mod lifecycle;
pub mod models;
pub mod processor;
pub mod storage;


/// Library-level error type.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("Issue not found: {0}")]
    NotFound(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Agent timed out after {0}s")]
    Timeout(u64),

    #[error("Agent rate limited: {0}")]
    RateLimited(String),

    #[error("Agent reached its max turns limit")]
    MaxTurnsExceeded,

    #[error("{0}")]
    Other(String),
}

/// Result type alias for tracker operations.
pub type Result<T> = std::result::Result<T, Error>;
