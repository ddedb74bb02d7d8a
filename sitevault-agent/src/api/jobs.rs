//! Endpoints that start long-running jobs.
//!
//! Jobs run as spawned tasks that outlive the request. The request only
//! claims the single-job slot and answers 202; pollers follow `/progress`.

use axum::extract::State;
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use sitevault_core::manifest::BackupKind;
use sitevault_core::migration;
use sitevault_core::{RestoreOptions, RestoreSource};
use std::future::Future;
use tracing::{error, info};

use super::{ApiError, AppState};

#[derive(Debug, Serialize)]
pub struct JobStarted {
    pub status: &'static str,
    pub operation: &'static str,
}

type Started = (StatusCode, Json<JobStarted>);

/// Claim the job slot and run `job` in the background.
pub fn spawn_job<F, T>(state: &AppState, operation: &'static str, job: F) -> Result<Started, ApiError>
where
    F: Future<Output = sitevault_core::Result<T>> + Send + 'static,
    T: Send + 'static,
{
    let guard = state.jobs.try_begin(operation).map_err(|running| {
        ApiError::Conflict(format!(
            "a {} job is already running (started {})",
            running.operation, running.started_at
        ))
    })?;
    // A leftover pause or cancel belongs to the previous job
    state.ctx.control.resume();

    tokio::spawn(async move {
        let _guard = guard;
        match job.await {
            Ok(_) => info!("{} job finished", operation),
            Err(e) if e.is_interrupt() => info!("{} job stopped: {}", operation, e),
            Err(e) => error!("{} job failed: {}", operation, e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(JobStarted {
            status: "started",
            operation,
        }),
    ))
}

#[derive(Debug, Deserialize)]
pub struct BackupRequest {
    #[serde(rename = "type", default = "default_kind")]
    pub kind: BackupKind,
    /// Falls back to `backup.upload` from the configuration.
    #[serde(default)]
    pub upload: Option<bool>,
}

fn default_kind() -> BackupKind {
    BackupKind::Full
}

/// POST /backup
pub async fn start_backup(
    State(state): State<AppState>,
    Json(body): Json<BackupRequest>,
) -> Result<Started, ApiError> {
    let upload = body.upload.unwrap_or(state.settings.backup.upload);
    if upload {
        state.settings.validate_storage()?;
        state.require_store()?;
    }

    let manager = state.backup_manager();
    let ctx = state.ctx.clone();
    spawn_job(&state, "backup", async move {
        manager.run(body.kind, upload, &ctx).await
    })
}

#[derive(Debug, Deserialize)]
pub struct RestoreRequest {
    pub source: RestoreSource,
    #[serde(flatten)]
    pub options: RestoreOptions,
}

/// POST /restore
pub async fn start_restore(
    State(state): State<AppState>,
    Json(body): Json<RestoreRequest>,
) -> Result<Started, ApiError> {
    if matches!(body.source, RestoreSource::Remote { .. }) {
        state.require_store()?;
    }

    let manager = state.restore_manager();
    let ctx = state.ctx.clone();
    spawn_job(&state, "restore", async move {
        manager.restore(body.source, body.options, &ctx).await
    })
}

#[derive(Debug, Deserialize)]
pub struct MigrateRequest {
    pub from: String,
    pub to: String,
}

/// POST /migrate
pub async fn start_migration(
    State(state): State<AppState>,
    Json(body): Json<MigrateRequest>,
) -> Result<Started, ApiError> {
    if body.from.is_empty() {
        return Err(ApiError::BadRequest("from must not be empty".into()));
    }
    let db_path = state.settings.database_path()?.to_path_buf();

    let ctx = state.ctx.clone();
    spawn_job(&state, "migrate", async move {
        migration::run_job(&db_path, &body.from, &body.to, &ctx).await
    })
}
