//! Sitevault agent: configuration, HTTP API and process lifecycle around
//! the `sitevault-core` backup and restore pipeline.

pub mod api;
pub mod client;
pub mod config;
pub mod daemon;
pub mod utils;

pub use config::AgentConfig;
pub use utils::{AgentError, Result};
