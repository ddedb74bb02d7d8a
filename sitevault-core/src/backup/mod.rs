//! Backup job orchestration.
//!
//! One run goes through these stages, each behind a job-control check:
//!
//! | Stage          | Percent  |
//! |----------------|----------|
//! | Queued         | 5        |
//! | Preparing      | 10       |
//! | Dumping DB     | 20 - 35  |
//! | Archiving      | 40 - 69  |
//! | Upload Pending | 70       |
//! | Uploading      | 80 - 94  |
//! | Verifying      | 95       |
//! | Complete       | 100      |
//!
//! The archive is built as `work/<name>.partial` and only moved into
//! `archives/` once the post-archive check has passed.

pub mod retention;
pub mod state;

pub use retention::{local_archives, prune_local, prune_remote, remote_archives, LocalArchive};
pub use state::BackupState;

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{info, warn};
use uuid::Uuid;

use crate::archive::{ArchiveBuilder, ArchiveFormat, ArchiveSummary, BuildOptions};
use crate::config::Settings;
use crate::database::{self, DumpSummary};
use crate::fs::ExcludeSet;
use crate::manifest::{BackupKind, Encryption, Manifest, MANIFEST_VERSION};
use crate::status::JobContext;
use crate::storage::keys::{archive_name, local_manifest_name, manifest_name, object_key};
use crate::storage::{ObjectInfo, ObjectMetadata, ObjectStore};
use crate::transfer::Uploader;
use crate::utils::{Error, Result};

/// Downloads left in `restore/` longer than this are purged.
const STALE_RESTORE_AGE: Duration = Duration::from_secs(6 * 60 * 60);
const DUMP_FILE_NAME: &str = "database.sql";
const DEFAULT_LINK_TTL: Duration = Duration::from_secs(60 * 60);

/// One planned backup run.
#[derive(Debug, Clone)]
pub struct BackupJob {
    pub job_id: String,
    pub kind: BackupKind,
    pub upload: bool,
    pub time: DateTime<Utc>,
    pub format: ArchiveFormat,
    pub archive_name: String,
    pub roots: Vec<PathBuf>,
    pub modified_since: Option<SystemTime>,
    pub partial_path: PathBuf,
    pub dump_path: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct BackupResult {
    pub job_id: String,
    pub kind: BackupKind,
    pub archive: PathBuf,
    pub manifest: PathBuf,
    pub sha256: String,
    pub total_files: u64,
    pub total_bytes: u64,
    pub skipped_files: u64,
    pub archive_size: u64,
    pub remote_key: Option<String>,
    pub pruned_local: usize,
    pub pruned_remote: usize,
    pub duration_secs: u64,
}

pub struct BackupManager {
    settings: Settings,
    store: Option<Arc<dyn ObjectStore>>,
    uploader_retry_delay: Option<Duration>,
}

impl BackupManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
            uploader_retry_delay: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.uploader_retry_delay = Some(delay);
        self
    }

    pub fn settings(&self) -> &Settings {
        &self.settings
    }

    /// Run a backup of `kind`. Interrupts and failures are recorded on the
    /// progress record before being returned.
    pub async fn run(&self, kind: BackupKind, upload: bool, ctx: &JobContext) -> Result<BackupResult> {
        let started = Instant::now();
        let job_id = Uuid::new_v4().to_string();
        ctx.progress.begin(&job_id);
        ctx.progress.update(5, "Queued");
        ctx.log.info(
            "backup_started",
            json!({ "job_id": job_id, "type": kind, "upload": upload }),
        );

        let job = match self.plan(job_id, kind, upload) {
            Ok(job) => job,
            Err(e) => {
                ctx.report_failure("backup_failed", &e);
                return Err(e);
            }
        };

        match self.execute(&job, ctx, started).await {
            Ok(result) => Ok(result),
            Err(e) => {
                discard_work_files(&job);
                if e.is_interrupt() {
                    info!("Backup {} stopped: {}", job.job_id, e);
                }
                ctx.report_failure("backup_failed", &e);
                Err(e)
            }
        }
    }

    fn plan(&self, job_id: String, kind: BackupKind, upload: bool) -> Result<BackupJob> {
        if upload {
            self.settings.validate_storage()?;
            self.store()?;
        }
        if kind.includes_database() {
            self.settings.database_path()?;
        }

        let time = Utc::now();
        let format = self.settings.backup.format;
        let archive_name = archive_name(kind.as_str(), time, format);
        let partial_path = self
            .settings
            .work_dir()
            .join(format!("{archive_name}.partial"));
        let dump_path = kind
            .includes_database()
            .then(|| self.settings.work_dir().join(DUMP_FILE_NAME));

        let modified_since = match kind {
            BackupKind::Incremental => BackupState::load(&self.settings.state_file())
                .last_backup
                .map(SystemTime::from),
            _ => None,
        };

        Ok(BackupJob {
            job_id,
            kind,
            upload,
            time,
            format,
            archive_name,
            roots: self.resolve_roots(kind)?,
            modified_since,
            partial_path,
            dump_path,
        })
    }

    /// File roots for `kind`, canonicalized where they exist.
    pub fn resolve_roots(&self, kind: BackupKind) -> Result<Vec<PathBuf>> {
        let site = &self.settings.site;
        let backup = &self.settings.backup;
        let mut roots = Vec::new();

        match kind {
            BackupKind::Db => {}
            BackupKind::Full => {
                roots.push(site.root.clone());
                if let Some(name) = site.config_above_root.as_deref() {
                    let root = site.root.canonicalize()?;
                    if let Some(parent) = root.parent() {
                        let config = parent.join(name);
                        if config.is_file() {
                            roots.push(config);
                        }
                    }
                }
            }
            BackupKind::Files | BackupKind::Incremental => {
                if backup.include.is_empty() {
                    roots.push(self.settings.content_root());
                }
                for rel in backup.include.iter().chain(backup.always_include.iter()) {
                    let path = site.root.join(rel.trim_start_matches('/'));
                    if !roots.contains(&path) {
                        roots.push(path);
                    }
                }
            }
        }

        Ok(roots
            .into_iter()
            .map(|p| p.canonicalize().unwrap_or(p))
            .collect())
    }

    async fn execute(&self, job: &BackupJob, ctx: &JobContext, started: Instant) -> Result<BackupResult> {
        ctx.checkpoint()?;
        ctx.progress.update(10, "Preparing");
        self.prepare_scratch(ctx)?;

        let mut roots = job.roots.clone();
        if let Some(dump_path) = &job.dump_path {
            ctx.checkpoint()?;
            let dump = self.dump(dump_path, ctx).await?;
            info!(
                "Dumped {} tables ({} rows) to {}",
                dump.tables,
                dump.rows,
                dump.path.display()
            );
            roots.push(dump_path.clone());
        }

        ctx.checkpoint()?;
        let summary = self.archive(job, roots, ctx).await?;

        // An interrupt here must leave nothing in archives/.
        ctx.checkpoint()?;
        let archives_dir = self.settings.archives_dir();
        fs::create_dir_all(&archives_dir)?;
        let archive_path = archives_dir.join(&job.archive_name);
        fs::rename(&job.partial_path, &archive_path)?;

        let manifest = self.manifest_for(job, &summary);
        let manifest_path = archives_dir.join(local_manifest_name(&job.archive_name));
        manifest.write_to(&manifest_path)?;
        ctx.progress.update(69, "Manifest Written");
        ctx.log.info(
            "manifest_written",
            json!({ "path": manifest_path.display().to_string(), "sha256": manifest.archive_sha256 }),
        );

        ctx.checkpoint()?;
        ctx.progress.update(70, "Upload Pending");

        let mut remote_key = None;
        let mut pruned_remote = 0;
        if job.upload {
            let store = self.store()?;
            let key = self
                .upload(store.clone(), &archive_path, &manifest, job, ctx)
                .await?;

            ctx.progress.update(95, "Verifying");
            verify_remote_size(store.as_ref(), &key, summary.archive_size).await?;
            ctx.log.info("upload_verified", json!({ "key": key }));

            if let Some(keep) = self.settings.retention.remote_keep_last {
                match self.prune_remote(keep).await {
                    Ok(deleted) => pruned_remote = deleted.len(),
                    Err(e) => ctx.log.warn(
                        "remote_prune_failed",
                        json!({ "kind": e.kind(), "message": e.to_string() }),
                    ),
                }
            }
            remote_key = Some(key);
        }

        if let Some(dump_path) = &job.dump_path {
            remove_if_exists(dump_path)?;
        }
        let pruned_local = prune_local(&archives_dir, self.settings.backup.keep_local)?.len();
        BackupState {
            last_backup: Some(job.time),
            last_archive: Some(job.archive_name.clone()),
        }
        .save(&self.settings.state_file())?;

        let result = BackupResult {
            job_id: job.job_id.clone(),
            kind: job.kind,
            archive: archive_path,
            manifest: manifest_path,
            sha256: summary.sha256,
            total_files: summary.files,
            total_bytes: summary.bytes,
            skipped_files: summary.skipped,
            archive_size: summary.archive_size,
            remote_key,
            pruned_local,
            pruned_remote,
            duration_secs: started.elapsed().as_secs(),
        };

        ctx.progress.update(100, "Complete");
        ctx.log.info(
            "backup_finished",
            json!({
                "job_id": result.job_id,
                "archive": job.archive_name,
                "files": result.total_files,
                "bytes": result.total_bytes,
                "skipped": result.skipped_files,
                "remote_key": result.remote_key,
                "duration_secs": result.duration_secs,
            }),
        );
        Ok(result)
    }

    /// Create the scratch layout, empty `work/` and drop stale restore downloads.
    fn prepare_scratch(&self, ctx: &JobContext) -> Result<()> {
        let work = self.settings.work_dir();
        if work.exists() {
            fs::remove_dir_all(&work)?;
        }
        for dir in [
            work,
            self.settings.archives_dir(),
            self.settings.restore_dir(),
            self.settings.logs_dir(),
        ] {
            fs::create_dir_all(dir)?;
        }

        let purged = purge_older_than(&self.settings.restore_dir(), STALE_RESTORE_AGE)?;
        if purged > 0 {
            ctx.log.info("restore_area_purged", json!({ "entries": purged }));
        }
        Ok(())
    }

    async fn dump(&self, dump_path: &Path, ctx: &JobContext) -> Result<DumpSummary> {
        let db_path = self.settings.database_path()?.to_path_buf();
        let output = dump_path.to_path_buf();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || database::dump_file(&db_path, &output, &ctx)).await?
    }

    async fn archive(&self, job: &BackupJob, roots: Vec<PathBuf>, ctx: &JobContext) -> Result<ArchiveSummary> {
        let exclude = ExcludeSet::new(&self.settings.backup.exclude)?;
        let builder = ArchiveBuilder::new(job.format, exclude);
        let options = BuildOptions {
            modified_since: job.modified_since,
            self_exclusions: vec![self.settings.scratch().to_path_buf()],
            ..BuildOptions::default()
        };
        let output = job.partial_path.clone();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || builder.build(&roots, &output, &options, &ctx)).await?
    }

    fn manifest_for(&self, job: &BackupJob, summary: &ArchiveSummary) -> Manifest {
        Manifest {
            version: MANIFEST_VERSION,
            site: self.settings.site_id(),
            app_version: self.settings.site.app_version.clone(),
            backup_type: job.kind,
            time: job.time,
            archive: job.archive_name.clone(),
            archive_sha256: summary.sha256.clone(),
            encryption: Encryption::default(),
            total_files: summary.files,
            total_bytes: summary.bytes,
        }
    }

    async fn upload(
        &self,
        store: Arc<dyn ObjectStore>,
        archive_path: &Path,
        manifest: &Manifest,
        job: &BackupJob,
        ctx: &JobContext,
    ) -> Result<String> {
        let prefix = self.settings.remote_prefix();
        let key = object_key(&prefix, &job.archive_name);

        let mut uploader = Uploader::new(store.clone(), self.settings.backup.part_size);
        if let Some(delay) = self.uploader_retry_delay {
            uploader = uploader.with_retry_delay(delay);
        }
        let meta = ObjectMetadata::new(job.format.content_type(), Some(manifest.archive_sha256.clone()));
        uploader.upload_file(archive_path, &key, &meta, ctx).await?;

        let manifest_key = object_key(&prefix, &manifest_name(job.time));
        store
            .put_object(
                &manifest_key,
                manifest.to_json()?.into(),
                &ObjectMetadata::new("application/json", None),
            )
            .await?;
        ctx.log.info("manifest_uploaded", json!({ "key": manifest_key }));
        Ok(key)
    }

    fn store(&self) -> Result<Arc<dyn ObjectStore>> {
        self.store
            .clone()
            .ok_or_else(|| Error::Configuration("object storage is not configured".to_string()))
    }

    /// Delete all but the newest `keep` local archives.
    pub fn prune_local(&self, keep: usize) -> Result<Vec<PathBuf>> {
        Ok(prune_local(&self.settings.archives_dir(), keep)?)
    }

    pub async fn prune_remote(&self, keep: usize) -> Result<Vec<String>> {
        let store = self.store()?;
        prune_remote(store.as_ref(), &self.settings.remote_prefix(), keep).await
    }

    /// Remote archives of this site, newest first.
    pub async fn list_remote(&self) -> Result<Vec<ObjectInfo>> {
        let store = self.store()?;
        remote_archives(store.as_ref(), &self.settings.remote_prefix()).await
    }

    pub async fn check_connection(&self) -> Result<()> {
        self.settings.validate_storage()?;
        self.store()?.check_connection().await
    }

    /// Presigned GET for an archive of this site.
    pub async fn download_link(&self, key: &str, expires_in: Option<Duration>) -> Result<String> {
        let prefix = self.settings.remote_prefix();
        if !key.starts_with(&prefix) {
            return Err(Error::Configuration(format!(
                "{key} is not under this site's prefix {prefix}"
            )));
        }
        self.store()?
            .presign_get(key, expires_in.unwrap_or(DEFAULT_LINK_TTL))
            .await
    }
}

async fn verify_remote_size(store: &dyn ObjectStore, key: &str, expected: u64) -> Result<()> {
    match store.head_object(key).await? {
        Some(info) if info.size == expected => Ok(()),
        Some(info) => Err(Error::Transfer(format!(
            "remote size of {key} is {}, expected {expected}",
            info.size
        ))),
        None => Err(Error::Transfer(format!("{key} is missing after upload"))),
    }
}

fn discard_work_files(job: &BackupJob) {
    let paths = std::iter::once(&job.partial_path).chain(job.dump_path.iter());
    for path in paths {
        if let Err(e) = remove_if_exists(path) {
            warn!("Failed to remove {}: {}", path.display(), e);
        }
    }
}

fn remove_if_exists(path: &Path) -> io::Result<()> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != io::ErrorKind::NotFound => Err(e),
        _ => Ok(()),
    }
}

/// Remove entries of `dir` last modified more than `age` ago.
fn purge_older_than(dir: &Path, age: Duration) -> io::Result<usize> {
    let Some(cutoff) = SystemTime::now().checked_sub(age) else {
        return Ok(0);
    };
    let mut purged = 0;
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let meta = entry.metadata()?;
        let stale = meta.modified().map(|m| m < cutoff).unwrap_or(false);
        if !stale {
            continue;
        }
        if meta.is_dir() {
            fs::remove_dir_all(entry.path())?;
        } else {
            fs::remove_file(entry.path())?;
        }
        purged += 1;
    }
    Ok(purged)
}
