//! Backup, archive, object-storage transfer and restore for content-managed sites.
//!
//! [`backup::BackupManager`] and [`restore::RestoreManager`] drive the
//! pipelines; every stage reports into a [`status::JobContext`].

pub mod archive;
pub mod backup;
pub mod config;
pub mod database;
pub mod fs;
pub mod manifest;
pub mod migration;
pub mod restore;
pub mod status;
pub mod storage;
pub mod transfer;
pub mod utils;

pub use backup::{BackupManager, BackupResult};
pub use config::Settings;
pub use manifest::{BackupKind, Manifest};
pub use restore::{RestoreManager, RestoreMode, RestoreOptions, RestoreReport, RestoreSource};
pub use status::JobContext;
pub use utils::{Error, Result};
