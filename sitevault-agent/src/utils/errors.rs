//! Error types for the sitevault agent.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AgentError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error(transparent)]
    Core(#[from] sitevault_core::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Agent responded with {status}: {message}")]
    Remote { status: u16, message: String },

    #[error("Server error: {0}")]
    Server(String),
}

pub type Result<T> = std::result::Result<T, AgentError>;
