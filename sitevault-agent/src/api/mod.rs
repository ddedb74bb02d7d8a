//! HTTP API of the agent.

pub mod error;
pub mod health;
pub mod job_tracker;
pub mod jobs;
pub mod remote;
pub mod status;

pub use error::ApiError;
pub use job_tracker::{JobGuard, JobTracker, RunningJob};

use axum::{
    routing::{get, post},
    Router,
};
use sitevault_core::storage::ObjectStore;
use sitevault_core::{BackupManager, JobContext, RestoreManager, Settings};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub store: Option<Arc<dyn ObjectStore>>,
    /// One log, progress record and control handle for whichever job runs.
    pub ctx: JobContext,
    pub jobs: JobTracker,
}

impl AppState {
    pub fn new(settings: Settings, store: Option<Arc<dyn ObjectStore>>, ctx: JobContext) -> Self {
        Self {
            settings: Arc::new(settings),
            store,
            ctx,
            jobs: JobTracker::new(),
        }
    }

    pub fn backup_manager(&self) -> BackupManager {
        let manager = BackupManager::new(self.settings.as_ref().clone());
        match &self.store {
            Some(store) => manager.with_store(store.clone()),
            None => manager,
        }
    }

    pub fn restore_manager(&self) -> RestoreManager {
        let manager = RestoreManager::new(self.settings.as_ref().clone());
        match &self.store {
            Some(store) => manager.with_store(store.clone()),
            None => manager,
        }
    }

    pub fn require_store(&self) -> Result<(), ApiError> {
        match self.store {
            Some(_) => Ok(()),
            None => Err(ApiError::ServiceUnavailable(
                "object storage is not configured".into(),
            )),
        }
    }
}

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health::health))
        .route("/version", get(health::version))
        .route("/progress", get(status::progress))
        .route("/logs", get(status::logs))
        .route("/control", post(status::control))
        .route("/backup", post(jobs::start_backup))
        .route("/restore", post(jobs::start_restore))
        .route("/migrate", post(jobs::start_migration))
        .route("/prune", post(remote::prune))
        .route("/backups", get(remote::list_backups))
        .route("/backups/link", get(remote::download_link))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}
