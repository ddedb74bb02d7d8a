//! HTTP API tests against a live listener.

use serde_json::{json, Value};
use sitevault_agent::api::{self, AppState};
use sitevault_agent::client::AgentClient;
use sitevault_core::status::{ControlAction, ControlFlag, EventLog, JobControl, ProgressStore};
use sitevault_core::storage::{MemoryStore, ObjectStore};
use sitevault_core::{JobContext, Settings};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

fn settings_for(dir: &Path) -> Settings {
    let mut settings = Settings::default();
    settings.site.id = Some("api-test".to_string());
    settings.site.root = dir.join("site");
    settings.paths.scratch_dir = dir.join("scratch");
    settings.backup.upload = false;
    fs::create_dir_all(settings.content_root()).unwrap();
    fs::write(settings.content_root().join("post.txt"), b"hello").unwrap();
    settings
}

fn state_for(settings: Settings, store: Option<Arc<dyn ObjectStore>>) -> AppState {
    let ctx = JobContext::new(
        EventLog::open(settings.logs_dir()).unwrap(),
        ProgressStore::new(),
        JobControl::new(),
    );
    AppState::new(settings, store, ctx)
}

async fn serve(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(std::future::IntoFuture::into_future(axum::serve(
        listener,
        api::create_router(state),
    )));
    format!("http://{addr}")
}

async fn wait_idle(state: &AppState) {
    for _ in 0..300 {
        if !state.jobs.is_busy() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    panic!("job did not finish");
}

#[tokio::test(flavor = "multi_thread")]
async fn health_reports_idle_agent() {
    let dir = TempDir::new().unwrap();
    let base = serve(state_for(settings_for(dir.path()), None)).await;

    let resp = reqwest::get(format!("{base}/health")).await.unwrap();
    assert_eq!(resp.status(), 200);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["status"], "ok");
    assert_eq!(body["site_id"], "api-test");
    assert_eq!(body["storage_configured"], false);
    assert!(body["running_job"].is_null());
}

#[tokio::test(flavor = "multi_thread")]
async fn backup_runs_in_background() {
    let dir = TempDir::new().unwrap();
    let settings = settings_for(dir.path());
    let archives = settings.archives_dir();
    let state = state_for(settings, None);
    let base = serve(state.clone()).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/backup"))
        .json(&json!({ "type": "files", "upload": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 202);
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["operation"], "backup");

    wait_idle(&state).await;

    let progress: Value = reqwest::get(format!("{base}/progress"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(progress["stage"], "Complete");
    assert_eq!(progress["percent"], 100);
    assert_eq!(fs::read_dir(&archives).unwrap().count(), 2); // archive + manifest

    let logs: Vec<Value> = reqwest::get(format!("{base}/logs?lines=500&level=info"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(logs.iter().any(|e| e["event"] == "backup_finished"));
}

#[tokio::test(flavor = "multi_thread")]
async fn upload_without_storage_is_rejected() {
    let dir = TempDir::new().unwrap();
    let base = serve(state_for(settings_for(dir.path()), None)).await;

    let resp = reqwest::Client::new()
        .post(format!("{base}/backup"))
        .json(&json!({ "type": "files", "upload": true }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 400);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("storage.bucket"));
}

#[tokio::test(flavor = "multi_thread")]
async fn second_job_conflicts() {
    let dir = TempDir::new().unwrap();
    let state = state_for(settings_for(dir.path()), None);
    let base = serve(state.clone()).await;
    let _guard = state.jobs.try_begin("restore").unwrap();

    let resp = reqwest::Client::new()
        .post(format!("{base}/backup"))
        .json(&json!({ "type": "files", "upload": false }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 409);
    let body: Value = resp.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains("restore"));
}

#[tokio::test(flavor = "multi_thread")]
async fn logs_reject_unknown_level() {
    let dir = TempDir::new().unwrap();
    let base = serve(state_for(settings_for(dir.path()), None)).await;

    let resp = reqwest::get(format!("{base}/logs?level=loud")).await.unwrap();
    assert_eq!(resp.status(), 400);
}

#[tokio::test(flavor = "multi_thread")]
async fn control_through_client() {
    let dir = TempDir::new().unwrap();
    let state = state_for(settings_for(dir.path()), None);
    let base = serve(state.clone()).await;
    let client = AgentClient::new(base).unwrap();

    let answer = client.control(ControlAction::Pause).await.unwrap();
    assert_eq!(answer["flag"], "pause_requested");
    assert_eq!(state.ctx.control.flag(), ControlFlag::PauseRequested);

    client.control(ControlAction::Resume).await.unwrap();
    assert_eq!(state.ctx.control.flag(), ControlFlag::None);

    assert_eq!(client.progress().await.unwrap().stage, "Idle");
}

#[tokio::test(flavor = "multi_thread")]
async fn remote_endpoints_need_storage() {
    let dir = TempDir::new().unwrap();
    let base = serve(state_for(settings_for(dir.path()), None)).await;

    let resp = reqwest::get(format!("{base}/backups")).await.unwrap();
    assert_eq!(resp.status(), 503);
}

#[tokio::test(flavor = "multi_thread")]
async fn download_links_stay_inside_site_prefix() {
    let dir = TempDir::new().unwrap();
    let store: Arc<dyn ObjectStore> = Arc::new(MemoryStore::new());
    let base = serve(state_for(settings_for(dir.path()), Some(store))).await;

    let listed: Vec<Value> = reqwest::get(format!("{base}/backups"))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert!(listed.is_empty());

    let foreign = reqwest::get(format!("{base}/backups/link?key=backups/other/backup-full.zip"))
        .await
        .unwrap();
    assert_eq!(foreign.status(), 400);

    let missing = reqwest::get(format!(
        "{base}/backups/link?key=backups/api-test/backup-full-missing.zip"
    ))
    .await
    .unwrap();
    assert_eq!(missing.status(), 404);
}
