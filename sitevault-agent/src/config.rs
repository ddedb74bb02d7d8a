//! Configuration management for the sitevault agent.
//!
//! Sources, lowest priority first: built-in defaults, the TOML file,
//! `.env`, then `SITEVAULT__SECTION__KEY` environment variables.

use serde::{Deserialize, Serialize};
use sitevault_core::Settings;
use std::path::Path;

use crate::utils::Result;

const ENV_PREFIX: &str = "SITEVAULT";
const DEFAULT_CONFIG_NAME: &str = "sitevault";

/// Agent configuration: the core settings plus the agent's own sections.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(flatten)]
    pub settings: Settings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            port: default_port(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    9990
}

fn default_log_level() -> String {
    "info".to_string()
}

impl AgentConfig {
    /// Load configuration. An explicit `path` must exist; otherwise
    /// `sitevault.toml` in the working directory is used when present.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let _ = dotenvy::dotenv();

        let file = match path {
            Some(path) => config::File::from(path).required(true),
            None => config::File::with_name(DEFAULT_CONFIG_NAME).required(false),
        };

        let config: AgentConfig = config::Config::builder()
            .add_source(file)
            .add_source(
                config::Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?
            .try_deserialize()?;

        Ok(config)
    }

    /// Address the HTTP API listens on.
    pub fn listen_addr(&self) -> String {
        format!("{}:{}", self.server.bind, self.server.port)
    }

    /// Base URL a local client uses to reach the running agent.
    pub fn local_url(&self) -> String {
        let host = match self.server.bind.as_str() {
            "0.0.0.0" | "::" => "127.0.0.1",
            other => other,
        };
        format!("http://{}:{}", host, self.server.port)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sitevault_core::archive::ArchiveFormat;
    use std::fs;
    use std::path::PathBuf;
    use tempfile::TempDir;

    #[test]
    fn test_load_from_toml_file() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("agent.toml");
        fs::write(
            &path,
            r#"
[server]
port = 8123

[logging]
level = "debug"

[site]
id = "shop"
root = "/srv/shop"

[storage]
region = "us-east-1"
bucket = "backups"
access_key = "AK"
secret_key = "SK"
path_style = true

[backup]
format = "tar.gz"
exclude = ["*/cache/*"]
keep_local = 3
"#,
        )
        .unwrap();

        let config = AgentConfig::load(Some(&path)).unwrap();
        assert_eq!(config.server.port, 8123);
        assert_eq!(config.server.bind, "127.0.0.1");
        assert_eq!(config.logging.level, "debug");
        assert_eq!(config.settings.site_id(), "shop");
        assert_eq!(config.settings.site.root, PathBuf::from("/srv/shop"));
        assert!(config.settings.storage.path_style);
        assert_eq!(config.settings.backup.format, ArchiveFormat::TarGz);
        assert_eq!(config.settings.backup.exclude, vec!["*/cache/*".to_string()]);
        assert_eq!(config.settings.backup.keep_local, 3);
        assert!(config.settings.validate_storage().is_ok());
    }

    #[test]
    fn test_missing_explicit_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(AgentConfig::load(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_defaults() {
        let config = AgentConfig::default();
        assert_eq!(config.listen_addr(), "127.0.0.1:9990");
        assert_eq!(config.local_url(), "http://127.0.0.1:9990");
        assert_eq!(config.settings.backup.keep_local, 1);
    }

    #[test]
    fn test_local_url_for_wildcard_bind() {
        let mut config = AgentConfig::default();
        config.server.bind = "0.0.0.0".to_string();
        config.server.port = 7000;
        assert_eq!(config.local_url(), "http://127.0.0.1:7000");
    }
}
