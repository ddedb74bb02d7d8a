//! sitevault - site backup, restore and migration.
//!
//! Every job can be run once from the command line or through the HTTP API
//! started by `sitevault serve`.

use anyhow::{Context, Result};
use clap::{ArgGroup, Parser, Subcommand, ValueEnum};
use serde::Serialize;
use sitevault_agent::api::{self, AppState};
use sitevault_agent::client::AgentClient;
use sitevault_agent::daemon::ShutdownCoordinator;
use sitevault_agent::{utils, AgentConfig};
use sitevault_core::database::ImportMode;
use sitevault_core::manifest::BackupKind;
use sitevault_core::restore::UrlRewrite;
use sitevault_core::status::{ControlAction, EventLog, JobControl, LogLevel, ProgressStore};
use sitevault_core::storage::{ObjectStore, S3Store};
use sitevault_core::transfer::format_bytes;
use sitevault_core::{
    migration, BackupManager, JobContext, RestoreManager, RestoreMode, RestoreOptions,
    RestoreSource, Settings,
};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to configuration file (defaults to ./sitevault.toml when present)
    #[arg(short, long, value_name = "FILE", global = true)]
    config: Option<PathBuf>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP API
    Serve {
        /// Port to listen on (overrides config)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Create a backup archive and, unless disabled, upload it
    Backup {
        /// full, db, files or incremental
        #[arg(short = 't', long = "type", default_value = "full")]
        kind: BackupKind,

        /// Keep the archive local only
        #[arg(long)]
        no_upload: bool,
    },

    /// Restore from a local archive, a remote key or a URL
    #[command(group(ArgGroup::new("source").required(true).args(["file", "key", "url"])))]
    Restore {
        #[arg(long)]
        file: Option<PathBuf>,

        #[arg(long)]
        key: Option<String>,

        #[arg(long)]
        url: Option<String>,

        #[arg(long, value_enum, default_value_t = ModeArg::Content)]
        mode: ModeArg,

        /// Report what would change without touching anything
        #[arg(long)]
        dry_run: bool,

        /// Allow overwriting the tool's own installed paths
        #[arg(long)]
        no_preserve_self: bool,

        /// Rewrite this URL in the restored database
        #[arg(long, requires = "migrate_to")]
        migrate_from: Option<String>,

        #[arg(long, requires = "migrate_from")]
        migrate_to: Option<String>,

        /// Import the SQL in one transaction; the first failure rolls back
        #[arg(long)]
        transactional: bool,
    },

    /// Search/replace a string across the site database
    Migrate {
        #[arg(long)]
        from: String,

        #[arg(long)]
        to: String,
    },

    /// Delete all but the newest local archives
    PruneLocal {
        /// Defaults to backup.keep_local
        #[arg(long)]
        keep: Option<usize>,
    },

    /// List remote archives of this site
    List,

    /// Print a presigned download link for a remote archive
    Link {
        key: String,

        /// Link lifetime in seconds
        #[arg(long)]
        expires: Option<u64>,
    },

    /// Show the current progress record
    Status {
        /// Ask the running agent instead of reading the snapshot file
        #[arg(long)]
        remote: bool,
    },

    /// Show the newest event log entries
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,

        /// Minimum level: debug, info, warn or error
        #[arg(long)]
        level: Option<LogLevel>,
    },

    /// Pause, resume or cancel the job running in the agent
    Control {
        #[arg(value_enum)]
        action: ActionArg,

        /// Agent base URL (defaults to the configured listen address)
        #[arg(long)]
        url: Option<String>,
    },
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ModeArg {
    Content,
    FullSite,
}

impl From<ModeArg> for RestoreMode {
    fn from(mode: ModeArg) -> Self {
        match mode {
            ModeArg::Content => RestoreMode::Content,
            ModeArg::FullSite => RestoreMode::FullSite,
        }
    }
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum ActionArg {
    Pause,
    Resume,
    Cancel,
}

impl From<ActionArg> for ControlAction {
    fn from(action: ActionArg) -> Self {
        match action {
            ActionArg::Pause => ControlAction::Pause,
            ActionArg::Resume => ControlAction::Resume,
            ActionArg::Cancel => ControlAction::Cancel,
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config = AgentConfig::load(cli.config.as_deref()).context("Failed to load configuration")?;

    let log_level = cli.log_level.as_deref().unwrap_or(&config.logging.level);
    utils::logger::init(log_level)?;

    match cli.command {
        Command::Serve { port } => serve(config, port).await,
        Command::Backup { kind, no_upload } => {
            let settings = config.settings;
            let upload = settings.backup.upload && !no_upload;
            let ctx = job_context(&settings)?;
            let mut manager = BackupManager::new(settings.clone());
            if let Some(store) = build_store(&settings)? {
                manager = manager.with_store(store);
            }
            print_json(&manager.run(kind, upload, &ctx).await?)
        }
        Command::Restore {
            file,
            key,
            url,
            mode,
            dry_run,
            no_preserve_self,
            migrate_from,
            migrate_to,
            transactional,
        } => {
            let source = match (file, key, url) {
                (Some(path), _, _) => RestoreSource::Local { path },
                (_, Some(key), _) => RestoreSource::Remote { key },
                (_, _, Some(url)) => RestoreSource::Url { url },
                _ => anyhow::bail!("one of --file, --key or --url is required"),
            };
            let options = RestoreOptions {
                mode: mode.into(),
                dry_run,
                preserve_self: !no_preserve_self,
                migrate: migrate_from
                    .zip(migrate_to)
                    .map(|(from, to)| UrlRewrite { from, to }),
                import_mode: if transactional {
                    ImportMode::Transactional
                } else {
                    ImportMode::BestEffort
                },
            };

            let settings = config.settings;
            let ctx = job_context(&settings)?;
            let mut manager = RestoreManager::new(settings.clone());
            if let Some(store) = build_store(&settings)? {
                manager = manager.with_store(store);
            }
            print_json(&manager.restore(source, options, &ctx).await?)
        }
        Command::Migrate { from, to } => {
            let settings = config.settings;
            let db_path = settings.database_path()?.to_path_buf();
            let ctx = job_context(&settings)?;
            print_json(&migration::run_job(&db_path, &from, &to, &ctx).await?)
        }
        Command::PruneLocal { keep } => {
            let settings = config.settings;
            let keep = keep.unwrap_or(settings.backup.keep_local);
            let removed = BackupManager::new(settings).prune_local(keep)?;
            for path in &removed {
                println!("removed {}", path.display());
            }
            Ok(())
        }
        Command::List => {
            let manager = remote_manager(config.settings)?;
            for object in manager.list_remote().await? {
                let modified = object
                    .last_modified
                    .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                    .unwrap_or_default();
                println!("{:<20} {:>10}  {}", modified, format_bytes(object.size), object.key);
            }
            Ok(())
        }
        Command::Link { key, expires } => {
            let manager = remote_manager(config.settings)?;
            let url = manager
                .download_link(&key, expires.map(Duration::from_secs))
                .await?;
            println!("{url}");
            Ok(())
        }
        Command::Status { remote } => {
            if remote {
                let client = AgentClient::new(config.local_url())?;
                print_json(&client.progress().await?)
            } else {
                match ProgressStore::read_snapshot(&config.settings.progress_file())? {
                    Some(record) => print_json(&record),
                    None => {
                        println!("no job has run yet");
                        Ok(())
                    }
                }
            }
        }
        Command::Logs { lines, level } => {
            let log = EventLog::open(config.settings.logs_dir())?;
            for entry in log.tail_entries(lines, level) {
                println!("{}", serde_json::to_string(&entry)?);
            }
            Ok(())
        }
        Command::Control { action, url } => {
            let client = AgentClient::new(url.unwrap_or_else(|| config.local_url()))?;
            print_json(&client.control(action.into()).await?)
        }
    }
}

async fn serve(mut config: AgentConfig, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    api::health::init_start_time();

    let settings = config.settings.clone();
    tracing::info!(
        "Starting sitevault agent v{} (site: {})",
        env!("CARGO_PKG_VERSION"),
        settings.site_id()
    );

    let store = build_store(&settings)?;
    if store.is_none() {
        tracing::warn!("Object storage is not configured; uploads and remote restores are disabled");
    }
    let ctx = JobContext::new(
        EventLog::open(settings.logs_dir())?,
        ProgressStore::with_snapshot(settings.progress_file()),
        JobControl::new(),
    );
    let state = AppState::new(settings, store, ctx);
    let app = api::create_router(state.clone());

    let listener = tokio::net::TcpListener::bind(config.listen_addr())
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr()))?;
    tracing::info!("Listening on http://{}", listener.local_addr()?);

    let coordinator = ShutdownCoordinator::default();
    let server = axum::serve(listener, app).with_graceful_shutdown(coordinator.token().cancelled_owned());
    let server_handle = tokio::spawn(async move { server.await });

    coordinator.wait_for_signal().await;
    coordinator.drain(&state.jobs, &state.ctx.control).await;
    coordinator.trigger();

    match tokio::time::timeout(Duration::from_secs(5), server_handle).await {
        Ok(Ok(Ok(()))) => tracing::info!("Server shutdown complete"),
        Ok(Ok(Err(e))) => tracing::error!("Server error during shutdown: {}", e),
        Ok(Err(e)) => tracing::error!("Server task panicked: {}", e),
        Err(_) => tracing::warn!("Server shutdown timeout, forcing exit"),
    }

    Ok(())
}

/// `None` when no bucket is configured; a half-filled storage section is an error.
fn build_store(settings: &Settings) -> Result<Option<Arc<dyn ObjectStore>>> {
    if settings.storage.bucket.trim().is_empty() {
        return Ok(None);
    }
    settings.validate_storage()?;
    let store = S3Store::from_settings(&settings.storage)?;
    Ok(Some(Arc::new(store)))
}

fn remote_manager(settings: Settings) -> Result<BackupManager> {
    let store = build_store(&settings)?
        .context("Object storage is not configured (storage.bucket is empty)")?;
    Ok(BackupManager::new(settings).with_store(store))
}

/// Context for a one-shot CLI job: file-backed log and progress snapshot,
/// cancelled cooperatively on Ctrl+C.
fn job_context(settings: &Settings) -> Result<JobContext> {
    let control = JobControl::new();
    let ctx = JobContext::new(
        EventLog::open(settings.logs_dir())?,
        ProgressStore::with_snapshot(settings.progress_file()),
        control.clone(),
    );

    ctx.progress.subscribe(|record| {
        tracing::info!("{:>3}% {}", record.percent, record.stage);
    });

    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::warn!("Interrupted, cancelling at the next stage boundary");
            control.request_cancel();
        }
    });

    Ok(ctx)
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}
