//! Progress, log tail and job control endpoints.

use axum::extract::{Query, State};
use axum::Json;
use serde::{Deserialize, Serialize};
use sitevault_core::status::{ControlAction, ControlFlag, LogEntry, LogLevel, ProgressRecord};

use super::{ApiError, AppState, RunningJob};

const DEFAULT_LOG_LINES: usize = 100;
const MAX_LOG_LINES: usize = 5000;

/// GET /progress
pub async fn progress(State(state): State<AppState>) -> Json<ProgressRecord> {
    Json(state.ctx.progress.current())
}

#[derive(Debug, Deserialize)]
pub struct LogsQuery {
    pub lines: Option<usize>,
    pub level: Option<String>,
}

/// GET /logs?lines=&level=
pub async fn logs(
    State(state): State<AppState>,
    Query(query): Query<LogsQuery>,
) -> Result<Json<Vec<LogEntry>>, ApiError> {
    let level = query
        .level
        .as_deref()
        .map(str::parse::<LogLevel>)
        .transpose()
        .map_err(ApiError::BadRequest)?;
    let lines = query.lines.unwrap_or(DEFAULT_LOG_LINES).min(MAX_LOG_LINES);

    let log = state.ctx.log.clone();
    let entries = tokio::task::spawn_blocking(move || log.tail_entries(lines, level)).await?;
    Ok(Json(entries))
}

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub action: ControlAction,
}

#[derive(Debug, Serialize)]
pub struct ControlResponse {
    pub flag: ControlFlag,
    pub running_job: Option<RunningJob>,
}

/// POST /control
pub async fn control(
    State(state): State<AppState>,
    Json(body): Json<ControlRequest>,
) -> Json<ControlResponse> {
    state.ctx.control.apply(body.action);
    tracing::info!("Control request: {:?}", body.action);
    Json(ControlResponse {
        flag: state.ctx.control.flag(),
        running_job: state.jobs.current(),
    })
}
