//! Restore job orchestration.
//!
//! | Stage              | Percent  |
//! |--------------------|----------|
//! | Downloading        | 5 - 13   |
//! | Verifying Download | 14       |
//! | Preparing          | 20       |
//! | Extracting         | 20 - 35  |
//! | Restoring Database | 45 - 55  |
//! | Restoring Files    | 65 - 84  |
//! | Rewriting URLs     | 85       |
//! | Finalizing         | 95       |
//! | Complete           | 100      |
//!
//! A dry run stops after locating the application root and reports what
//! would be copied and imported.

pub mod copy;
pub mod session;

pub use copy::{contained_join, CopyPlan, CopySummary, TreeCopier, RESTORING_FILES};
pub use session::RestoreSession;

use serde::{Deserialize, Serialize};
use serde_json::json;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;
use walkdir::WalkDir;

use crate::archive::{self, DetectedType};
use crate::config::Settings;
use crate::database::{self, ImportMode, ImportSummary};
use crate::fs::ExcludeSet;
use crate::manifest::Manifest;
use crate::migration::{self, MigrationSummary};
use crate::status::JobContext;
use crate::storage::keys::local_manifest_name;
use crate::storage::ObjectStore;
use crate::transfer::download::VERIFYING_PERCENT;
use crate::transfer::{download_url, Downloader};
use crate::utils::{Error, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreSource {
    Local { path: PathBuf },
    Remote { key: String },
    Url { url: String },
}

impl RestoreSource {
    /// Loggable description; URLs lose their query string.
    pub fn label(&self) -> String {
        match self {
            RestoreSource::Local { path } => format!("local:{}", path.display()),
            RestoreSource::Remote { key } => format!("remote:{key}"),
            RestoreSource::Url { url } => format!("url:{}", url.split('?').next().unwrap_or(url)),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RestoreMode {
    /// Copy only the content directory.
    #[default]
    Content,
    /// Replace the whole application tree.
    FullSite,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UrlRewrite {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RestoreOptions {
    #[serde(default)]
    pub mode: RestoreMode,
    #[serde(default)]
    pub dry_run: bool,
    /// Never overwrite the tool's own installed paths.
    #[serde(default = "default_true")]
    pub preserve_self: bool,
    #[serde(default)]
    pub migrate: Option<UrlRewrite>,
    #[serde(default)]
    pub import_mode: ImportMode,
}

impl Default for RestoreOptions {
    fn default() -> Self {
        Self {
            mode: RestoreMode::default(),
            dry_run: false,
            preserve_self: true,
            migrate: None,
            import_mode: ImportMode::default(),
        }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize)]
pub struct RestoreReport {
    pub job_id: String,
    pub dry_run: bool,
    pub detected: DetectedType,
    /// Application root inside the archive, relative to the extraction dir.
    pub archive_root: Option<PathBuf>,
    pub sql_files: Vec<String>,
    pub plan: CopyPlan,
    pub copied: Option<CopySummary>,
    pub database: Option<ImportSummary>,
    pub migration: Option<MigrationSummary>,
}

pub struct RestoreManager {
    settings: Settings,
    store: Option<Arc<dyn ObjectStore>>,
}

impl RestoreManager {
    pub fn new(settings: Settings) -> Self {
        Self {
            settings,
            store: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn ObjectStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub async fn restore(
        &self,
        source: RestoreSource,
        options: RestoreOptions,
        ctx: &JobContext,
    ) -> Result<RestoreReport> {
        let job_id = Uuid::new_v4().to_string();
        ctx.progress.begin(&job_id);
        ctx.log.info(
            "restore_started",
            json!({
                "job_id": job_id,
                "source": source.label(),
                "mode": options.mode,
                "dry_run": options.dry_run,
            }),
        );

        match self.execute(job_id, &source, &options, ctx).await {
            Ok(report) => Ok(report),
            Err(e) => {
                ctx.report_failure("restore_failed", &e);
                Err(e)
            }
        }
    }

    async fn execute(
        &self,
        job_id: String,
        source: &RestoreSource,
        options: &RestoreOptions,
        ctx: &JobContext,
    ) -> Result<RestoreReport> {
        if !options.dry_run && options.migrate.is_some() {
            self.settings.database_path()?;
        }

        let mut session = RestoreSession::new(
            &self.settings.restore_dir(),
            self.settings.scratch(),
            self.protected_paths(options),
        )?;
        let archive_path = self.acquire(source, &mut session, ctx).await?;

        ctx.checkpoint()?;
        ctx.progress.update(20, "Preparing");
        let extract_dir = session.extract_dir().to_path_buf();
        let extracted = {
            let (archive_path, extract_dir, ctx) = (archive_path.clone(), extract_dir.clone(), ctx.clone());
            tokio::task::spawn_blocking(move || archive::extract(&archive_path, &extract_dir, &ctx))
                .await??
        };

        ctx.checkpoint()?;
        let root = locate_root(&extract_dir, &self.settings.restore.root_markers);
        if let Some(root) = &root {
            session.set_root(root.clone());
        }
        let (copy_source, copy_dest) = self.copy_endpoints(options.mode, root.as_deref(), &extract_dir)?;
        let sql_files = find_sql_files(&extract_dir);
        ctx.log.info(
            "restore_root_located",
            json!({
                "root": root.as_ref().map(|r| r.display().to_string()),
                "sql_files": sql_files.len(),
                "entries": extracted.entries,
                "rejected": extracted.rejected,
            }),
        );

        let mut report = RestoreReport {
            job_id,
            dry_run: options.dry_run,
            detected: extracted.detected,
            archive_root: root
                .as_ref()
                .and_then(|r| r.strip_prefix(&extract_dir).ok())
                .map(Path::to_path_buf),
            sql_files: sql_files
                .iter()
                .filter_map(|p| p.strip_prefix(&extract_dir).ok())
                .map(|p| p.display().to_string())
                .collect(),
            plan: CopyPlan::default(),
            copied: None,
            database: None,
            migration: None,
        };

        if options.dry_run {
            report.plan = TreeCopier::new(&copy_source, &copy_dest, session.protected(), &sql_files).plan();
            ctx.progress.update(100, "Complete");
            ctx.log.info(
                "restore_dry_run",
                json!({ "files": report.plan.files, "bytes": report.plan.bytes, "sql_files": report.sql_files }),
            );
            return Ok(report);
        }

        if !sql_files.is_empty() {
            ctx.checkpoint()?;
            report.database = Some(self.import(&sql_files, options.import_mode, ctx).await?);
        } else {
            ctx.log.info("restore_db_skipped", json!({ "reason": "no sql file in archive" }));
        }

        ctx.checkpoint()?;
        let copied = {
            let protected = session.protected().clone();
            let (src, dest, sql, ctx) = (copy_source, copy_dest, sql_files, ctx.clone());
            tokio::task::spawn_blocking(move || {
                let copier = TreeCopier::new(&src, &dest, &protected, &sql);
                let plan = copier.plan();
                copier.copy(&ctx).map(|summary| (plan, summary))
            })
            .await??
        };
        report.plan = copied.0;
        report.copied = Some(copied.1);

        if let Some(rewrite) = &options.migrate {
            ctx.checkpoint()?;
            ctx.progress.update(85, "Rewriting URLs");
            report.migration = Some(self.rewrite_urls(rewrite, ctx).await?);
        }

        ctx.progress.update(95, "Finalizing");
        drop(session);

        ctx.progress.update(100, "Complete");
        ctx.log.info(
            "restore_finished",
            json!({
                "job_id": report.job_id,
                "files": report.copied.as_ref().map(|c| c.files),
                "sql_failed": report.database.as_ref().map(|d| d.failed),
                "values_updated": report.migration.as_ref().map(|m| m.values_updated),
            }),
        );
        Ok(report)
    }

    /// Local path of the archive to restore, downloading it first if needed.
    async fn acquire(
        &self,
        source: &RestoreSource,
        session: &mut RestoreSession,
        ctx: &JobContext,
    ) -> Result<PathBuf> {
        match source {
            RestoreSource::Local { path } => {
                if !path.is_file() {
                    return Err(Error::Configuration(format!(
                        "archive {} does not exist",
                        path.display()
                    )));
                }
                let manifest_path = path
                    .file_name()
                    .map(|n| path.with_file_name(local_manifest_name(&n.to_string_lossy())));
                if let Some(manifest_path) = manifest_path.filter(|p| p.is_file()) {
                    ctx.progress.update(VERIFYING_PERCENT, "Verifying Download");
                    let manifest = Manifest::read_from(&manifest_path)?;
                    let archive = path.clone();
                    tokio::task::spawn_blocking(move || manifest.verify_file(&archive)).await??;
                    ctx.log.info("local_archive_verified", json!({ "path": path.display().to_string() }));
                }
                Ok(path.clone())
            }
            RestoreSource::Remote { key } => {
                let store = self
                    .store
                    .clone()
                    .ok_or_else(|| Error::Configuration("object storage is not configured".to_string()))?;
                let name = key.rsplit('/').next().unwrap_or(key);
                let dest = self.settings.restore_dir().join(name);
                session.set_downloaded(dest.clone());
                Downloader::new(store).download_verified(key, &dest, ctx).await?;
                Ok(dest)
            }
            RestoreSource::Url { url } => {
                let dest = self
                    .settings
                    .restore_dir()
                    .join(format!("download-{}.archive", Uuid::new_v4()));
                session.set_downloaded(dest.clone());
                download_url(url, &dest, ctx).await?;
                ctx.progress.update(VERIFYING_PERCENT, "Verifying Download");
                ctx.log.warn(
                    "download_unverified",
                    json!({ "reason": "no manifest available for a direct url" }),
                );
                Ok(dest)
            }
        }
    }

    /// Scratch area always, the tool's own paths unless disabled.
    fn protected_paths(&self, options: &RestoreOptions) -> ExcludeSet {
        let mut paths = vec![self.settings.scratch().to_path_buf()];
        if options.preserve_self {
            paths.extend(
                self.settings
                    .restore
                    .self_paths
                    .iter()
                    .map(|p| self.settings.site.root.join(p.trim_start_matches('/'))),
            );
        }
        ExcludeSet::default().with_absolute(paths)
    }

    fn copy_endpoints(
        &self,
        mode: RestoreMode,
        root: Option<&Path>,
        extract_dir: &Path,
    ) -> Result<(PathBuf, PathBuf)> {
        match (mode, root) {
            (RestoreMode::FullSite, Some(root)) => Ok((root.to_path_buf(), self.settings.site.root.clone())),
            (RestoreMode::FullSite, None) => Err(Error::Extraction(format!(
                "no application root (a directory containing one of {:?}) in the archive",
                self.settings.restore.root_markers
            ))),
            (RestoreMode::Content, Some(root)) => Ok((
                root.join(&self.settings.site.content_dir),
                self.settings.content_root(),
            )),
            (RestoreMode::Content, None) => Ok((extract_dir.to_path_buf(), self.settings.content_root())),
        }
    }

    async fn import(&self, sql_files: &[PathBuf], mode: ImportMode, ctx: &JobContext) -> Result<ImportSummary> {
        let db_path = self.settings.database_path()?.to_path_buf();
        let files = sql_files.to_vec();
        let ctx = ctx.clone();
        tokio::task::spawn_blocking(move || {
            let mut conn = database::open(&db_path)?;
            let mut total = ImportSummary::default();
            for file in &files {
                let summary = database::import_file(&mut conn, file, mode, &ctx)?;
                total.executed += summary.executed;
                total.failed += summary.failed;
            }
            Ok(total)
        })
        .await?
    }

    async fn rewrite_urls(&self, rewrite: &UrlRewrite, ctx: &JobContext) -> Result<MigrationSummary> {
        let db_path = self.settings.database_path()?.to_path_buf();
        let (from, to, ctx) = (rewrite.from.clone(), rewrite.to.clone(), ctx.clone());
        tokio::task::spawn_blocking(move || migration::migrate_file(&db_path, &from, &to, &ctx)).await?
    }
}

/// The extraction dir itself or one directory below it, whichever holds a
/// marker directory.
pub fn locate_root(extract_dir: &Path, markers: &[String]) -> Option<PathBuf> {
    let has_marker = |dir: &Path| markers.iter().any(|m| dir.join(m).is_dir());
    if has_marker(extract_dir) {
        return Some(extract_dir.to_path_buf());
    }
    let mut candidates: Vec<PathBuf> = fs::read_dir(extract_dir)
        .ok()?
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
        .map(|e| e.path())
        .filter(|p| has_marker(p))
        .collect();
    candidates.sort();
    candidates.into_iter().next()
}

/// `*.sql` files at most two levels into the extracted tree, sorted.
pub fn find_sql_files(extract_dir: &Path) -> Vec<PathBuf> {
    let mut files: Vec<PathBuf> = WalkDir::new(extract_dir)
        .max_depth(2)
        .follow_links(false)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext.eq_ignore_ascii_case("sql"))
                .unwrap_or(false)
        })
        .map(|e| e.into_path())
        .collect();
    files.sort();
    files
}
