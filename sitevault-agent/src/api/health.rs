//! Health check endpoints.

use axum::extract::State;
use axum::{response::IntoResponse, Json};
use serde_json::json;
use std::sync::OnceLock;
use std::time::Instant;

use super::AppState;

static START_TIME: OnceLock<Instant> = OnceLock::new();

pub fn init_start_time() {
    START_TIME.get_or_init(Instant::now);
}

/// GET /health
pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let uptime = START_TIME.get().map(|t| t.elapsed().as_secs()).unwrap_or(0);

    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "uptime_secs": uptime,
        "site_id": state.settings.site_id(),
        "storage_configured": state.store.is_some(),
        "running_job": state.jobs.current(),
        "control": state.ctx.control.flag(),
    }))
}

/// GET /version
pub async fn version() -> impl IntoResponse {
    Json(json!({
        "version": env!("CARGO_PKG_VERSION"),
        "formats": ["zip", "tar.gz"],
    }))
}
