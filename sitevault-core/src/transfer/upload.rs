//! Archive upload: one request for small files, multipart otherwise.

use serde_json::json;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use super::progress::{format_bytes, format_duration, format_speed, RateMeter};
use crate::config::SINGLE_PUT_LIMIT;
use crate::status::{JobContext, PhaseRange, ProgressCounters};
use crate::storage::{FileWindow, ObjectMetadata, ObjectStore, UploadedPart};
use crate::utils::{Error, Result};

pub const UPLOADING: PhaseRange = PhaseRange::new(80, 94);
pub const MAX_PART_ATTEMPTS: u32 = 3;
const STAGE: &str = "Uploading";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub number: i32,
    pub offset: u64,
    pub len: u64,
}

/// Split `size` bytes into `ceil(size / part_size)` consecutive parts.
pub fn plan_parts(size: u64, part_size: u64) -> Vec<PartPlan> {
    let part_size = part_size.max(1);
    let mut parts = Vec::new();
    let mut offset = 0;
    let mut number = 1;
    while offset < size {
        let len = part_size.min(size - offset);
        parts.push(PartPlan {
            number,
            offset,
            len,
        });
        offset += len;
        number += 1;
    }
    parts
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadReport {
    pub key: String,
    pub size: u64,
    /// 0 for a single put.
    pub parts: usize,
}

pub struct Uploader {
    store: Arc<dyn ObjectStore>,
    part_size: u64,
    retry_delay: Duration,
}

impl Uploader {
    pub fn new(store: Arc<dyn ObjectStore>, part_size: u64) -> Self {
        Self {
            store,
            part_size,
            retry_delay: Duration::from_millis(500),
        }
    }

    /// Base delay between part attempts; grows linearly per attempt.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub async fn upload_file(
        &self,
        path: &Path,
        key: &str,
        meta: &ObjectMetadata,
        ctx: &JobContext,
    ) -> Result<UploadReport> {
        let size = tokio::fs::metadata(path).await?.len();
        ctx.log.info(
            "upload_started",
            json!({
                "key": key,
                "size": size,
                "provider": self.store.provider_name(),
            }),
        );

        let report = if size <= SINGLE_PUT_LIMIT {
            self.store
                .put_file(key, &FileWindow::whole(path, size), meta)
                .await?;
            report_bytes(ctx, size, size, 1, 1);
            UploadReport {
                key: key.to_string(),
                size,
                parts: 0,
            }
        } else {
            self.upload_multipart(path, key, size, meta, ctx).await?
        };

        ctx.log.info(
            "upload_finished",
            json!({ "key": key, "size": format_bytes(size), "parts": report.parts }),
        );
        Ok(report)
    }

    async fn upload_multipart(
        &self,
        path: &Path,
        key: &str,
        size: u64,
        meta: &ObjectMetadata,
        ctx: &JobContext,
    ) -> Result<UploadReport> {
        let plan = plan_parts(size, self.part_size);
        let upload_id = self.store.create_multipart_upload(key, meta).await?;

        match self.send_parts(path, key, &upload_id, &plan, size, ctx).await {
            Ok(parts) => {
                if let Err(e) = self
                    .store
                    .complete_multipart_upload(key, &upload_id, &parts)
                    .await
                {
                    self.abort(key, &upload_id, ctx).await;
                    return Err(e);
                }
                Ok(UploadReport {
                    key: key.to_string(),
                    size,
                    parts: parts.len(),
                })
            }
            Err(e) => {
                self.abort(key, &upload_id, ctx).await;
                Err(e)
            }
        }
    }

    async fn send_parts(
        &self,
        path: &Path,
        key: &str,
        upload_id: &str,
        plan: &[PartPlan],
        size: u64,
        ctx: &JobContext,
    ) -> Result<Vec<UploadedPart>> {
        let mut parts = Vec::with_capacity(plan.len());
        let mut sent = 0u64;
        let mut meter = RateMeter::new(size);

        for part in plan {
            let window = FileWindow {
                path: path.to_path_buf(),
                offset: part.offset,
                len: part.len,
            };
            let uploaded = self
                .send_part_with_retry(key, upload_id, part.number, &window, ctx)
                .await?;
            parts.push(uploaded);

            sent += part.len;
            let rate = meter.record(sent);
            report_bytes(ctx, sent, size, parts.len() as u64, plan.len() as u64);
            ctx.log.debug(
                "upload_part_done",
                json!({
                    "part": part.number,
                    "of": plan.len(),
                    "speed": format_speed(rate),
                    "eta": meter.eta_secs().map(format_duration),
                }),
            );
        }
        Ok(parts)
    }

    async fn send_part_with_retry(
        &self,
        key: &str,
        upload_id: &str,
        number: i32,
        window: &FileWindow,
        ctx: &JobContext,
    ) -> Result<UploadedPart> {
        let mut attempt = 1;
        loop {
            match self.store.upload_part(key, upload_id, number, window).await {
                Ok(part) => return Ok(part),
                Err(e) if attempt < MAX_PART_ATTEMPTS => {
                    ctx.log.warn(
                        "upload_part_retry",
                        json!({ "part": number, "attempt": attempt, "error": e.to_string() }),
                    );
                    tokio::time::sleep(self.retry_delay * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    return Err(Error::Transfer(format!(
                        "part {number} failed after {MAX_PART_ATTEMPTS} attempts: {e}"
                    )))
                }
            }
        }
    }

    async fn abort(&self, key: &str, upload_id: &str, ctx: &JobContext) {
        match self.store.abort_multipart_upload(key, upload_id).await {
            Ok(()) => ctx
                .log
                .warn("upload_aborted", json!({ "key": key, "upload_id": upload_id })),
            Err(e) => ctx.log.error(
                "upload_abort_failed",
                json!({ "key": key, "upload_id": upload_id, "error": e.to_string() }),
            ),
        }
    }
}

fn report_bytes(ctx: &JobContext, sent: u64, total: u64, items: u64, items_total: u64) {
    ctx.progress.update_with(
        UPLOADING.at(sent, total),
        STAGE,
        Some(ProgressCounters {
            items_processed: items,
            items_total,
            bytes_processed: sent,
            bytes_total: total,
        }),
        None,
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MemoryStore;
    use crate::utils::hasher::sha256_bytes;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    #[test]
    fn test_plan_parts_edges() {
        let p = 8 * MIB;
        assert!(plan_parts(0, p).is_empty());
        assert_eq!(plan_parts(p - 1, p).len(), 1);
        assert_eq!(plan_parts(p, p).len(), 1);

        let plan = plan_parts(p + 1, p);
        assert_eq!(plan.len(), 2);
        assert_eq!(plan[1], PartPlan { number: 2, offset: p, len: 1 });

        let total: u64 = plan_parts(10 * p + 3, p).iter().map(|x| x.len).sum();
        assert_eq!(total, 10 * p + 3);
    }

    fn payload(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_multipart_reassembles_byte_equal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("archive.zip");
        let data = payload((6 * MIB + 17) as usize);
        std::fs::write(&path, &data).unwrap();

        let store = MemoryStore::new();
        let uploader = Uploader::new(Arc::new(store.clone()), 5 * MIB)
            .with_retry_delay(Duration::ZERO);
        let ctx = JobContext::detached();
        let report = uploader
            .upload_file(&path, "k/archive.zip", &ObjectMetadata::new("application/zip", None), &ctx)
            .await
            .unwrap();

        assert_eq!(report.parts, 2);
        let stored = store.object("k/archive.zip").unwrap();
        assert_eq!(sha256_bytes(&stored.data), sha256_bytes(&data));
        assert_eq!(stored.meta.content_type, "application/zip");
        assert_eq!(ctx.progress.current().percent, UPLOADING.end);
    }

    #[tokio::test]
    async fn test_small_file_uses_single_put() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("small.zip");
        std::fs::write(&path, b"tiny").unwrap();

        let store = MemoryStore::new();
        let uploader = Uploader::new(Arc::new(store.clone()), 16 * MIB);
        let report = uploader
            .upload_file(&path, "small.zip", &ObjectMetadata::default(), &JobContext::detached())
            .await
            .unwrap();
        assert_eq!(report.parts, 0);
        assert_eq!(store.object("small.zip").unwrap().data, "tiny");
    }

    #[tokio::test]
    async fn test_part_is_retried_then_succeeds() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, payload((5 * MIB + 1) as usize)).unwrap();

        let store = MemoryStore::new();
        store.fail_part(2, 2);
        let uploader = Uploader::new(Arc::new(store.clone()), 5 * MIB)
            .with_retry_delay(Duration::ZERO);
        uploader
            .upload_file(&path, "a.bin", &ObjectMetadata::default(), &JobContext::detached())
            .await
            .unwrap();
        assert_eq!(store.part_attempts(2), 3);
        assert!(store.object("a.bin").is_some());
    }

    #[tokio::test]
    async fn test_exhausted_retries_abort_the_upload() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("a.bin");
        std::fs::write(&path, payload((5 * MIB + 1) as usize)).unwrap();

        let store = MemoryStore::new();
        store.fail_part(1, 10);
        let uploader = Uploader::new(Arc::new(store.clone()), 5 * MIB)
            .with_retry_delay(Duration::ZERO);
        let err = uploader
            .upload_file(&path, "a.bin", &ObjectMetadata::default(), &JobContext::detached())
            .await
            .unwrap_err();

        assert!(matches!(err, Error::Transfer(_)));
        assert_eq!(store.part_attempts(1), MAX_PART_ATTEMPTS);
        assert_eq!(store.pending_uploads(), 0);
        assert_eq!(store.aborted_uploads(), 1);
        assert!(store.object("a.bin").is_none());
    }
}
