//! Settings consumed by the backup and restore managers.
//!
//! Loading (files, environment) is the agent's job; this module only owns
//! the shape, the defaults and validation.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::archive::ArchiveFormat;
use crate::utils::hasher::sha256_bytes;
use crate::utils::{Error, Result};

/// Files at or below this size go up in a single request.
pub const SINGLE_PUT_LIMIT: u64 = 5 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub site: SiteSettings,
    #[serde(default)]
    pub paths: PathSettings,
    #[serde(default)]
    pub storage: StorageSettings,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub retention: RetentionSettings,
    #[serde(default)]
    pub restore: RestoreSettings,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteSettings {
    /// Used in remote keys; defaults to a host-derived id.
    #[serde(default)]
    pub id: Option<String>,

    #[serde(default)]
    pub url: Option<String>,

    /// Application root directory.
    #[serde(default = "default_root")]
    pub root: PathBuf,

    /// Content directory, relative to the root. Content-only restores copy into it.
    #[serde(default = "default_content_dir")]
    pub content_dir: PathBuf,

    #[serde(default)]
    pub app_version: Option<String>,

    /// Config file kept one level above the root, picked up by full backups.
    #[serde(default)]
    pub config_above_root: Option<String>,
}

impl Default for SiteSettings {
    fn default() -> Self {
        Self {
            id: None,
            url: None,
            root: default_root(),
            content_dir: default_content_dir(),
            app_version: None,
            config_above_root: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PathSettings {
    /// Working storage: `work/`, `archives/`, `restore/`, `logs/`.
    #[serde(default = "default_scratch_dir")]
    pub scratch_dir: PathBuf,

    /// SQLite database of the application.
    #[serde(default)]
    pub database: Option<PathBuf>,
}

impl Default for PathSettings {
    fn default() -> Self {
        Self {
            scratch_dir: default_scratch_dir(),
            database: None,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default)]
    pub endpoint: Option<String>,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub bucket: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
    /// Path-style addressing, needed by most non-AWS providers.
    #[serde(default)]
    pub path_style: bool,
    /// Overrides the `backups/<site-id>/` key prefix.
    #[serde(default)]
    pub prefix: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupSettings {
    #[serde(default)]
    pub format: ArchiveFormat,

    /// Roots for `files` and `incremental` backups, relative to the site root.
    #[serde(default)]
    pub include: Vec<String>,

    #[serde(default = "default_exclude")]
    pub exclude: Vec<String>,

    /// Added to every `files` and `incremental` backup.
    #[serde(default)]
    pub always_include: Vec<String>,

    #[serde(default = "default_keep_local")]
    pub keep_local: usize,

    #[serde(default = "default_part_size")]
    pub part_size: u64,

    #[serde(default = "default_true")]
    pub upload: bool,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            format: ArchiveFormat::default(),
            include: Vec::new(),
            exclude: default_exclude(),
            always_include: Vec::new(),
            keep_local: default_keep_local(),
            part_size: default_part_size(),
            upload: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetentionSettings {
    /// Off unless set.
    #[serde(default)]
    pub remote_keep_last: Option<usize>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreSettings {
    /// Directory names that identify an application root.
    #[serde(default = "default_root_markers")]
    pub root_markers: Vec<String>,

    /// Paths (relative to the site root) the tool is installed in.
    #[serde(default)]
    pub self_paths: Vec<String>,
}

impl Default for RestoreSettings {
    fn default() -> Self {
        Self {
            root_markers: default_root_markers(),
            self_paths: Vec::new(),
        }
    }
}

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_content_dir() -> PathBuf {
    PathBuf::from("content")
}

fn default_scratch_dir() -> PathBuf {
    PathBuf::from("./sitevault-data")
}

fn default_exclude() -> Vec<String> {
    vec!["cache".to_string(), "node_modules".to_string()]
}

fn default_keep_local() -> usize {
    1
}

fn default_part_size() -> u64 {
    16 * 1024 * 1024
}

fn default_true() -> bool {
    true
}

fn default_root_markers() -> Vec<String> {
    vec!["content".to_string()]
}

impl Settings {
    pub fn site_id(&self) -> String {
        if let Some(id) = self.site.id.as_deref().filter(|s| !s.trim().is_empty()) {
            return sanitize_id(id);
        }
        if let Some(url) = self.site.url.as_deref() {
            return sha256_bytes(url.as_bytes())[..12].to_string();
        }
        hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .map(|h| sanitize_id(&h))
            .unwrap_or_else(|| "default".to_string())
    }

    /// Key prefix for this site's objects, always ending in `/`.
    pub fn remote_prefix(&self) -> String {
        match self.storage.prefix.as_deref() {
            Some(p) if !p.trim_matches('/').is_empty() => format!("{}/", p.trim_matches('/')),
            _ => format!("backups/{}/", self.site_id()),
        }
    }

    pub fn scratch(&self) -> &Path {
        &self.paths.scratch_dir
    }

    pub fn work_dir(&self) -> PathBuf {
        self.paths.scratch_dir.join("work")
    }

    pub fn archives_dir(&self) -> PathBuf {
        self.paths.scratch_dir.join("archives")
    }

    pub fn restore_dir(&self) -> PathBuf {
        self.paths.scratch_dir.join("restore")
    }

    pub fn logs_dir(&self) -> PathBuf {
        self.paths.scratch_dir.join("logs")
    }

    pub fn state_file(&self) -> PathBuf {
        self.paths.scratch_dir.join("state.json")
    }

    pub fn progress_file(&self) -> PathBuf {
        self.paths.scratch_dir.join("progress.json")
    }

    pub fn content_root(&self) -> PathBuf {
        self.site.root.join(&self.site.content_dir)
    }

    pub fn database_path(&self) -> Result<&Path> {
        self.paths
            .database
            .as_deref()
            .ok_or_else(|| Error::Configuration("paths.database is not set".to_string()))
    }

    /// Checked before any storage call is made.
    pub fn validate_storage(&self) -> Result<()> {
        let s = &self.storage;
        let mut missing = Vec::new();
        if s.bucket.trim().is_empty() {
            missing.push("storage.bucket");
        }
        if s.access_key.trim().is_empty() {
            missing.push("storage.access_key");
        }
        if s.secret_key.trim().is_empty() {
            missing.push("storage.secret_key");
        }
        if s.endpoint.is_none() && s.region.is_none() {
            missing.push("storage.endpoint or storage.region");
        }
        if !missing.is_empty() {
            return Err(Error::Configuration(format!(
                "missing {}",
                missing.join(", ")
            )));
        }
        if let Some(endpoint) = s.endpoint.as_deref() {
            if !endpoint.starts_with("http://") && !endpoint.starts_with("https://") {
                return Err(Error::Configuration(format!(
                    "storage.endpoint must be an http(s) URL, got {endpoint}"
                )));
            }
        }
        if self.backup.part_size < SINGLE_PUT_LIMIT {
            return Err(Error::Configuration(format!(
                "backup.part_size must be at least {SINGLE_PUT_LIMIT} bytes"
            )));
        }
        Ok(())
    }
}

fn sanitize_id(raw: &str) -> String {
    raw.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c.to_ascii_lowercase()
            } else {
                '-'
            }
        })
        .collect()
}
