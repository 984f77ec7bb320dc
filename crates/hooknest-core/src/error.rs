//! Error types for hooknest-core

use std::path::PathBuf;
use thiserror::Error;

/// Result type for hooknest-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error types for hooknest-core
#[derive(Debug, Error)]
pub enum Error {
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config not found. Searched: {searched:?}")]
    ConfigNotFound { searched: Vec<PathBuf> },

    #[error("Failed to parse config at {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("Webhook not found: {0}")]
    WebhookNotFound(String),

    #[error("Invalid argument: {0}")]
    InvalidArgument(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Rate limiter error: {0}")]
    RateLimiter(String),

    #[error("Script error: {0}")]
    Script(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}
