//! S3-compatible object storage.
//!
//! [`ObjectStore`] is the seam the uploader, downloader and managers talk
//! to. [`S3Store`] is the production implementation and [`MemoryStore`]
//! an in-process one for tests and offline runs.

pub mod keys;
pub mod memory;
pub mod s3;

pub use memory::MemoryStore;
pub use s3::S3Store;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

use crate::utils::Result;

/// `(bytes_done, bytes_total)`
pub type ByteProgress = Arc<dyn Fn(u64, u64) + Send + Sync>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ObjectInfo {
    pub key: String,
    pub size: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub etag: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObjectMetadata {
    pub content_type: String,
    pub sha256: Option<String>,
}

impl ObjectMetadata {
    pub fn new(content_type: &str, sha256: Option<String>) -> Self {
        Self {
            content_type: content_type.to_string(),
            sha256,
        }
    }
}

/// A byte range of a local file, opened fresh on every read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileWindow {
    pub path: PathBuf,
    pub offset: u64,
    pub len: u64,
}

impl FileWindow {
    pub fn whole(path: &Path, len: u64) -> Self {
        Self {
            path: path.to_path_buf(),
            offset: 0,
            len,
        }
    }

    pub async fn read_to_bytes(&self) -> std::io::Result<Bytes> {
        let mut file = tokio::fs::File::open(&self.path).await?;
        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut buf = Vec::with_capacity(self.len as usize);
        file.take(self.len).read_to_end(&mut buf).await?;
        if (buf.len() as u64) != self.len {
            return Err(std::io::Error::new(
                std::io::ErrorKind::UnexpectedEof,
                format!(
                    "{}: expected {} bytes at offset {}, read {}",
                    self.path.display(),
                    self.len,
                    self.offset,
                    buf.len()
                ),
            ));
        }
        Ok(Bytes::from(buf))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadedPart {
    pub part_number: i32,
    pub etag: String,
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
    fn provider_name(&self) -> &'static str;

    /// Head-bucket style reachability and credentials check.
    async fn check_connection(&self) -> Result<()>;

    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()>;

    /// Single-request upload of a file range.
    async fn put_file(&self, key: &str, window: &FileWindow, meta: &ObjectMetadata) -> Result<()>;

    async fn create_multipart_upload(&self, key: &str, meta: &ObjectMetadata) -> Result<String>;

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        window: &FileWindow,
    ) -> Result<UploadedPart>;

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()>;

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get_object(&self, key: &str) -> Result<Option<Bytes>>;

    /// Stream an object to `dest`, returning the bytes written.
    async fn download_to_file(
        &self,
        key: &str,
        dest: &Path,
        progress: Option<ByteProgress>,
    ) -> Result<u64>;

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>>;

    /// Every object under `prefix`, following continuation tokens.
    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>>;

    async fn delete_object(&self, key: &str) -> Result<()>;

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String>;
}
