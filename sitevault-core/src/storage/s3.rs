//! S3-compatible storage (AWS S3, MinIO, R2, ...).

use async_trait::async_trait;
use aws_sdk_s3::config::{Credentials, Region};
use aws_sdk_s3::error::DisplayErrorContext;
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::{ByteStream, Length};
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use bytes::Bytes;
use chrono::DateTime;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncWriteExt;

use super::{ByteProgress, FileWindow, ObjectInfo, ObjectMetadata, ObjectStore, UploadedPart};
use crate::config::StorageSettings;
use crate::utils::{Error, Result};

const DEFAULT_REGION: &str = "us-east-1";
const SHA256_META: &str = "sha256";

pub struct S3Store {
    client: Client,
    bucket: String,
}

fn transfer_err<E>(what: &str, err: E) -> Error
where
    E: std::error::Error,
{
    Error::Transfer(format!("{what}: {}", DisplayErrorContext(&err)))
}

impl S3Store {
    /// Settings must already have passed `Settings::validate_storage`.
    pub fn from_settings(settings: &StorageSettings) -> Result<Self> {
        if settings.bucket.trim().is_empty() {
            return Err(Error::Configuration("storage.bucket is empty".to_string()));
        }

        let credentials = Credentials::new(
            &settings.access_key,
            &settings.secret_key,
            None,
            None,
            "sitevault",
        );
        let region = settings
            .region
            .clone()
            .unwrap_or_else(|| DEFAULT_REGION.to_string());

        let mut builder = aws_sdk_s3::Config::builder()
            .credentials_provider(credentials)
            .region(Region::new(region))
            .force_path_style(settings.path_style)
            .behavior_version_latest();
        if let Some(endpoint) = settings.endpoint.as_deref() {
            builder = builder.endpoint_url(endpoint);
        }

        Ok(Self {
            client: Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
        })
    }

    async fn window_body(window: &FileWindow) -> Result<ByteStream> {
        ByteStream::read_from()
            .path(&window.path)
            .offset(window.offset)
            .length(Length::Exact(window.len))
            .build()
            .await
            .map_err(|e| transfer_err("open upload body", e))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    fn provider_name(&self) -> &'static str {
        "s3"
    }

    async fn check_connection(&self) -> Result<()> {
        self.client
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map_err(|e| transfer_err("head bucket", e))?;
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()> {
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&meta.content_type)
            .content_length(body.len() as i64)
            .body(ByteStream::from(body));
        if let Some(sha) = &meta.sha256 {
            request = request.metadata(SHA256_META, sha);
        }
        request
            .send()
            .await
            .map_err(|e| transfer_err("put object", e))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, window: &FileWindow, meta: &ObjectMetadata) -> Result<()> {
        let body = Self::window_body(window).await?;
        let mut request = self
            .client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&meta.content_type)
            .content_length(window.len as i64)
            .body(body);
        if let Some(sha) = &meta.sha256 {
            request = request.metadata(SHA256_META, sha);
        }
        request
            .send()
            .await
            .map_err(|e| transfer_err("put object", e))?;
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, meta: &ObjectMetadata) -> Result<String> {
        let mut request = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(&meta.content_type);
        if let Some(sha) = &meta.sha256 {
            request = request.metadata(SHA256_META, sha);
        }
        let output = request
            .send()
            .await
            .map_err(|e| transfer_err("create multipart upload", e))?;
        output
            .upload_id()
            .map(str::to_string)
            .ok_or_else(|| Error::Transfer("multipart upload returned no upload id".to_string()))
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        window: &FileWindow,
    ) -> Result<UploadedPart> {
        let body = Self::window_body(window).await?;
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(part_number)
            .content_length(window.len as i64)
            .body(body)
            .send()
            .await
            .map_err(|e| transfer_err(&format!("upload part {part_number}"), e))?;
        let etag = output
            .e_tag()
            .ok_or_else(|| Error::Transfer(format!("part {part_number} returned no ETag")))?;
        Ok(UploadedPart {
            part_number,
            etag: etag.to_string(),
        })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let completed = parts
            .iter()
            .map(|p| {
                CompletedPart::builder()
                    .part_number(p.part_number)
                    .e_tag(&p.etag)
                    .build()
            })
            .collect::<Vec<_>>();
        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(
                CompletedMultipartUpload::builder()
                    .set_parts(Some(completed))
                    .build(),
            )
            .send()
            .await
            .map_err(|e| transfer_err("complete multipart upload", e))?;
        Ok(())
    }

    async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| transfer_err("abort multipart upload", e))?;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => {
                let data = output
                    .body
                    .collect()
                    .await
                    .map_err(|e| transfer_err("read object body", e))?;
                Ok(Some(data.into_bytes()))
            }
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_no_such_key() {
                    Ok(None)
                } else {
                    Err(transfer_err("get object", service_error))
                }
            }
        }
    }

    async fn download_to_file(
        &self,
        key: &str,
        dest: &Path,
        progress: Option<ByteProgress>,
    ) -> Result<u64> {
        let output = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transfer_err("get object", e))?;
        let total = output.content_length().unwrap_or(0).max(0) as u64;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let mut file = tokio::fs::File::create(dest).await?;
        let mut body = output.body;
        let mut written = 0u64;
        if let Some(cb) = progress.as_ref() {
            cb(0, total);
        }

        while let Some(chunk) = body
            .try_next()
            .await
            .map_err(|e| transfer_err("read object body", e))?
        {
            file.write_all(&chunk).await?;
            written += chunk.len() as u64;
            if let Some(cb) = progress.as_ref() {
                cb(written, total);
            }
        }
        file.flush().await?;
        file.sync_all().await?;
        Ok(written)
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;
        match result {
            Ok(output) => Ok(Some(ObjectInfo {
                key: key.to_string(),
                size: output.content_length().unwrap_or(0).max(0) as u64,
                last_modified: output
                    .last_modified()
                    .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                etag: output.e_tag().map(str::to_string),
            })),
            Err(e) => {
                let service_error = e.into_service_error();
                if service_error.is_not_found() {
                    Ok(None)
                } else {
                    Err(transfer_err("head object", service_error))
                }
            }
        }
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects = Vec::new();
        let mut continuation: Option<String> = None;

        loop {
            let mut request = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix);
            if let Some(token) = continuation.take() {
                request = request.continuation_token(token);
            }
            let output = request
                .send()
                .await
                .map_err(|e| transfer_err("list objects", e))?;

            for object in output.contents() {
                let Some(key) = object.key() else { continue };
                if key.ends_with('/') {
                    continue;
                }
                objects.push(ObjectInfo {
                    key: key.to_string(),
                    size: object.size().unwrap_or(0).max(0) as u64,
                    last_modified: object
                        .last_modified()
                        .and_then(|dt| DateTime::from_timestamp(dt.secs(), dt.subsec_nanos())),
                    etag: object.e_tag().map(str::to_string),
                });
            }

            if output.is_truncated().unwrap_or(false) {
                match output.next_continuation_token() {
                    Some(token) => continuation = Some(token.to_string()),
                    None => break,
                }
            } else {
                break;
            }
        }

        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| transfer_err("delete object", e))?;
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        let config = PresigningConfig::expires_in(expires_in)
            .map_err(|e| Error::Configuration(format!("invalid link lifetime: {e}")))?;
        let request = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(config)
            .await
            .map_err(|e| transfer_err("presign get object", e))?;
        Ok(request.uri().to_string())
    }
}
