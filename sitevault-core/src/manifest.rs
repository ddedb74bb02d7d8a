//! Metadata record that travels with every archive.
//!
//! Written locally as `<archive>.manifest.json` and remotely as
//! `manifest-<stamp>.json`. The hash is always computed from the archive
//! on disk, never copied from elsewhere.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs;
use std::path::Path;
use std::str::FromStr;

use crate::utils::hasher::sha256_file;
use crate::utils::{Error, Result};

pub const MANIFEST_VERSION: u32 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackupKind {
    Full,
    Db,
    Files,
    Incremental,
}

impl BackupKind {
    pub fn as_str(self) -> &'static str {
        match self {
            BackupKind::Full => "full",
            BackupKind::Db => "db",
            BackupKind::Files => "files",
            BackupKind::Incremental => "incremental",
        }
    }

    pub fn includes_database(self) -> bool {
        matches!(self, BackupKind::Full | BackupKind::Db | BackupKind::Incremental)
    }
}

impl fmt::Display for BackupKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for BackupKind {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "full" => Ok(BackupKind::Full),
            "db" | "database" => Ok(BackupKind::Db),
            "files" => Ok(BackupKind::Files),
            "incremental" => Ok(BackupKind::Incremental),
            other => Err(Error::Configuration(format!("unknown backup type: {other}"))),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Encryption {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cipher: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub version: u32,
    pub site: String,
    #[serde(default)]
    pub app_version: Option<String>,
    #[serde(rename = "type")]
    pub backup_type: BackupKind,
    pub time: DateTime<Utc>,
    /// File name of the archive, not a path.
    pub archive: String,
    pub archive_sha256: String,
    #[serde(default)]
    pub encryption: Encryption,
    pub total_files: u64,
    pub total_bytes: u64,
}

impl Manifest {
    pub fn to_json(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec_pretty(self)?)
    }

    pub fn from_json(bytes: &[u8]) -> Result<Self> {
        Ok(serde_json::from_slice(bytes)?)
    }

    /// Write next to the archive, via a temp file so readers never see half of it.
    pub fn write_to(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, self.to_json()?)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        Self::from_json(&fs::read(path)?)
    }

    /// Recompute the archive hash and compare it with the recorded one.
    pub fn verify_file(&self, archive: &Path) -> Result<()> {
        let actual = sha256_file(archive)?;
        if actual.eq_ignore_ascii_case(&self.archive_sha256) {
            Ok(())
        } else {
            Err(Error::integrity(&self.archive_sha256, &actual))
        }
    }
}
