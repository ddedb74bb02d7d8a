//! Archive download with content-addressed verification.

use futures_util::{StreamExt, TryStreamExt};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use tokio::io::AsyncWriteExt;

use super::progress::format_bytes;
use super::progress_stream::ProgressStream;
use crate::manifest::Manifest;
use crate::status::{JobContext, PhaseRange, ProgressCounters, ProgressStore};
use crate::storage::keys::manifest_key_for;
use crate::storage::{ByteProgress, ObjectStore};
use crate::utils::hasher::sha256_file;
use crate::utils::{Error, Result};

pub const DOWNLOADING: PhaseRange = PhaseRange::new(5, 13);
pub const VERIFYING_PERCENT: u8 = 14;
const STAGE: &str = "Downloading";

#[derive(Debug, Clone)]
pub struct DownloadReport {
    pub path: PathBuf,
    pub size: u64,
    pub manifest: Manifest,
}

pub struct Downloader {
    store: Arc<dyn ObjectStore>,
}

impl Downloader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// The manifest stored next to `archive_key`.
    pub async fn fetch_manifest(&self, archive_key: &str) -> Result<Manifest> {
        let manifest_key = manifest_key_for(archive_key).ok_or_else(|| {
            Error::integrity(
                format!("manifest for {archive_key}"),
                "key does not follow backup-<kind>-<stamp> naming",
            )
        })?;
        let body = self
            .store
            .get_object(&manifest_key)
            .await?
            .ok_or_else(|| Error::integrity(format!("manifest {manifest_key}"), "missing"))?;
        Manifest::from_json(&body)
    }

    /// Download `key` to `dest` and check it against its manifest.
    ///
    /// A file that fails verification is removed before the error returns.
    pub async fn download_verified(
        &self,
        key: &str,
        dest: &Path,
        ctx: &JobContext,
    ) -> Result<DownloadReport> {
        let manifest = self.fetch_manifest(key).await?;
        ctx.log.info(
            "download_started",
            json!({ "key": key, "dest": dest.display().to_string() }),
        );

        let size = self
            .store
            .download_to_file(key, dest, Some(byte_progress(ctx.progress.clone())))
            .await?;
        ctx.log.info(
            "download_finished",
            json!({ "key": key, "size": format_bytes(size) }),
        );

        ctx.progress.update(VERIFYING_PERCENT, "Verifying Download");
        if let Err(e) = verify_file(dest, &manifest.archive_sha256).await {
            ctx.log.error(
                "download_verify_failed",
                json!({ "key": key, "error": e.to_string() }),
            );
            let _ = tokio::fs::remove_file(dest).await;
            return Err(e);
        }

        Ok(DownloadReport {
            path: dest.to_path_buf(),
            size,
            manifest,
        })
    }
}

/// Stream an HTTP(S) URL to `dest`. No manifest is available for a bare URL.
pub async fn download_url(url: &str, dest: &Path, ctx: &JobContext) -> Result<u64> {
    if !url.starts_with("http://") && !url.starts_with("https://") {
        return Err(Error::Configuration(format!("not an http(s) url: {url}")));
    }

    let response = reqwest::Client::new()
        .get(url)
        .send()
        .await
        .map_err(|e| Error::Transfer(e.to_string()))?;
    if !response.status().is_success() {
        return Err(Error::Transfer(format!("HTTP {}: {}", response.status(), url)));
    }
    let total = response.content_length().unwrap_or(0);

    if let Some(parent) = dest.parent() {
        tokio::fs::create_dir_all(parent).await?;
    }
    let mut file = tokio::fs::File::create(dest).await?;

    let progress = byte_progress(ctx.progress.clone());
    let mut stream = ProgressStream::new(
        Box::pin(response.bytes_stream().map_err(|e| Error::Transfer(e.to_string()))),
        Arc::new(move |done| progress(done, total)),
    );
    while let Some(chunk) = stream.next().await {
        file.write_all(&chunk?).await?;
    }
    file.flush().await?;

    let written = stream.bytes_transferred();
    ctx.log.info(
        "download_finished",
        json!({ "url": redact_query(url), "size": format_bytes(written) }),
    );
    Ok(written)
}

/// Hash on a blocking thread; `Integrity` on mismatch.
pub async fn verify_file(path: &Path, expected: &str) -> Result<()> {
    let owned = path.to_path_buf();
    let actual = tokio::task::spawn_blocking(move || sha256_file(&owned)).await??;
    if actual.eq_ignore_ascii_case(expected) {
        Ok(())
    } else {
        Err(Error::integrity(expected, actual))
    }
}

/// Maps `(done, total)` bytes onto the download range, writing only on percent change.
fn byte_progress(progress: ProgressStore) -> ByteProgress {
    let last = AtomicU8::new(u8::MAX);
    Arc::new(move |done, total| {
        let percent = DOWNLOADING.at(done, total);
        if last.swap(percent, Ordering::Relaxed) != percent {
            progress.update_with(
                percent,
                STAGE,
                Some(ProgressCounters {
                    items_processed: 0,
                    items_total: 1,
                    bytes_processed: done,
                    bytes_total: total,
                }),
                None,
            );
        }
    })
}

/// Presigned URLs carry credentials in the query string.
fn redact_query(url: &str) -> &str {
    url.split('?').next().unwrap_or(url)
}
