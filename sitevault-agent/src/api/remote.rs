//! Archive listing, download links and retention.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use sitevault_core::storage::ObjectInfo;
use std::time::Duration;

use super::{ApiError, AppState};

/// GET /backups
pub async fn list_backups(State(state): State<AppState>) -> Result<Json<Vec<ObjectInfo>>, ApiError> {
    state.require_store()?;
    let archives = state.backup_manager().list_remote().await?;
    Ok(Json(archives))
}

#[derive(Debug, Deserialize)]
pub struct LinkQuery {
    pub key: String,
    pub expires_secs: Option<u64>,
}

/// GET /backups/link?key=
pub async fn download_link(
    State(state): State<AppState>,
    Query(query): Query<LinkQuery>,
) -> Result<Json<Value>, ApiError> {
    let store = state
        .store
        .clone()
        .ok_or_else(|| ApiError::ServiceUnavailable("object storage is not configured".into()))?;
    let key = query.key.trim_start_matches('/');

    // Rejects keys outside this site's prefix before anything is looked up
    let url = state
        .backup_manager()
        .download_link(key, query.expires_secs.map(Duration::from_secs))
        .await?;
    if store.head_object(key).await?.is_none() {
        return Err(ApiError::NotFound(format!("{key} does not exist")));
    }
    Ok(Json(json!({ "key": key, "url": url })))
}

#[derive(Debug, Deserialize)]
pub struct PruneRequest {
    /// Defaults to `backup.keep_local`.
    pub keep: Option<usize>,
    /// Also prune remote archives, keeping `retention.remote_keep_last`.
    #[serde(default)]
    pub remote: bool,
}

#[derive(Debug, Serialize)]
pub struct PruneResponse {
    pub removed_local: Vec<String>,
    pub removed_remote: Vec<String>,
}

/// POST /prune
pub async fn prune(
    State(state): State<AppState>,
    Json(body): Json<PruneRequest>,
) -> Result<Json<PruneResponse>, ApiError> {
    let remote_keep = if body.remote {
        state.require_store()?;
        Some(state.settings.retention.remote_keep_last.ok_or_else(|| {
            ApiError::BadRequest("retention.remote_keep_last is not set".into())
        })?)
    } else {
        None
    };

    let _guard = state.jobs.try_begin("prune").map_err(|running| {
        ApiError::Conflict(format!("a {} job is already running", running.operation))
    })?;

    let keep = body.keep.unwrap_or(state.settings.backup.keep_local);
    let manager = state.backup_manager();
    let removed = {
        let manager = state.backup_manager();
        tokio::task::spawn_blocking(move || manager.prune_local(keep)).await??
    };

    let removed_remote = match remote_keep {
        Some(keep) => manager.prune_remote(keep).await?,
        None => Vec::new(),
    };

    Ok(Json(PruneResponse {
        removed_local: removed.iter().map(|p| p.display().to_string()).collect(),
        removed_remote,
    }))
}
