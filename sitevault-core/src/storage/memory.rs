//! In-process object store.
//!
//! Behaves like a bucket for the operations the pipeline uses and can be
//! told to fail specific multipart parts.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use uuid::Uuid;

use super::{ByteProgress, FileWindow, ObjectInfo, ObjectMetadata, ObjectStore, UploadedPart};
use crate::utils::hasher::sha256_bytes;
use crate::utils::{Error, Result};

#[derive(Debug, Clone)]
pub struct StoredObject {
    pub data: Bytes,
    pub meta: ObjectMetadata,
    pub last_modified: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct PendingUpload {
    key: String,
    meta: ObjectMetadata,
    parts: BTreeMap<i32, Bytes>,
}

#[derive(Debug, Default)]
struct State {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    /// part number -> failures still to inject
    failing_parts: HashMap<i32, u32>,
    part_attempts: HashMap<i32, u32>,
    aborted: u32,
    deletes_fail: bool,
}

#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|p| p.into_inner())
    }

    /// Make the next `times` attempts at `part_number` fail.
    pub fn fail_part(&self, part_number: i32, times: u32) {
        self.lock().failing_parts.insert(part_number, times);
    }

    pub fn fail_deletes(&self, fail: bool) {
        self.lock().deletes_fail = fail;
    }

    pub fn part_attempts(&self, part_number: i32) -> u32 {
        self.lock().part_attempts.get(&part_number).copied().unwrap_or(0)
    }

    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    pub fn aborted_uploads(&self) -> u32 {
        self.lock().aborted
    }

    pub fn object(&self, key: &str) -> Option<StoredObject> {
        self.lock().objects.get(key).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().objects.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Store an object with an explicit modification time.
    pub fn insert_at(&self, key: &str, data: impl Into<Bytes>, last_modified: DateTime<Utc>) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data: data.into(),
                meta: ObjectMetadata::default(),
                last_modified,
            },
        );
    }

    fn store(&self, key: &str, data: Bytes, meta: &ObjectMetadata) {
        self.lock().objects.insert(
            key.to_string(),
            StoredObject {
                data,
                meta: meta.clone(),
                last_modified: Utc::now(),
            },
        );
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    fn provider_name(&self) -> &'static str {
        "memory"
    }

    async fn check_connection(&self) -> Result<()> {
        Ok(())
    }

    async fn put_object(&self, key: &str, body: Bytes, meta: &ObjectMetadata) -> Result<()> {
        self.store(key, body, meta);
        Ok(())
    }

    async fn put_file(&self, key: &str, window: &FileWindow, meta: &ObjectMetadata) -> Result<()> {
        let body = window.read_to_bytes().await?;
        self.store(key, body, meta);
        Ok(())
    }

    async fn create_multipart_upload(&self, key: &str, meta: &ObjectMetadata) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                key: key.to_string(),
                meta: meta.clone(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_part(
        &self,
        key: &str,
        upload_id: &str,
        part_number: i32,
        window: &FileWindow,
    ) -> Result<UploadedPart> {
        {
            let mut state = self.lock();
            *state.part_attempts.entry(part_number).or_default() += 1;
            if let Some(remaining) = state.failing_parts.get_mut(&part_number) {
                if *remaining > 0 {
                    *remaining -= 1;
                    return Err(Error::Transfer(format!(
                        "injected failure for part {part_number}"
                    )));
                }
            }
        }

        let body = window.read_to_bytes().await?;
        let etag = format!("\"{}\"", &sha256_bytes(&body)[..32]);

        let mut state = self.lock();
        let upload = state
            .uploads
            .get_mut(upload_id)
            .filter(|u| u.key == key)
            .ok_or_else(|| Error::Transfer(format!("no such upload {upload_id}")))?;
        upload.parts.insert(part_number, body);
        Ok(UploadedPart { part_number, etag })
    }

    async fn complete_multipart_upload(
        &self,
        key: &str,
        upload_id: &str,
        parts: &[UploadedPart],
    ) -> Result<()> {
        let upload = self
            .lock()
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Error::Transfer(format!("no such upload {upload_id}")))?;

        let mut data = BytesMut::new();
        for part in parts {
            let chunk = upload.parts.get(&part.part_number).ok_or_else(|| {
                Error::Transfer(format!("part {} was never uploaded", part.part_number))
            })?;
            data.extend_from_slice(chunk);
        }
        self.store(key, data.freeze(), &upload.meta);
        Ok(())
    }

    async fn abort_multipart_upload(&self, _key: &str, upload_id: &str) -> Result<()> {
        let mut state = self.lock();
        state.uploads.remove(upload_id);
        state.aborted += 1;
        Ok(())
    }

    async fn get_object(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.lock().objects.get(key).map(|o| o.data.clone()))
    }

    async fn download_to_file(
        &self,
        key: &str,
        dest: &Path,
        progress: Option<ByteProgress>,
    ) -> Result<u64> {
        let data = self
            .get_object(key)
            .await?
            .ok_or_else(|| Error::Transfer(format!("object {key} not found")))?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let total = data.len() as u64;
        if let Some(cb) = progress.as_ref() {
            cb(0, total);
        }
        tokio::fs::write(dest, &data).await?;
        if let Some(cb) = progress.as_ref() {
            cb(total, total);
        }
        Ok(total)
    }

    async fn head_object(&self, key: &str) -> Result<Option<ObjectInfo>> {
        Ok(self.lock().objects.get(key).map(|o| ObjectInfo {
            key: key.to_string(),
            size: o.data.len() as u64,
            last_modified: Some(o.last_modified),
            etag: None,
        }))
    }

    async fn list_objects(&self, prefix: &str) -> Result<Vec<ObjectInfo>> {
        let mut objects: Vec<ObjectInfo> = self
            .lock()
            .objects
            .iter()
            .filter(|(k, _)| k.starts_with(prefix))
            .map(|(k, o)| ObjectInfo {
                key: k.clone(),
                size: o.data.len() as u64,
                last_modified: Some(o.last_modified),
                etag: None,
            })
            .collect();
        objects.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(objects)
    }

    async fn delete_object(&self, key: &str) -> Result<()> {
        let mut state = self.lock();
        if state.deletes_fail {
            return Err(Error::Transfer(format!("delete of {key} refused")));
        }
        state.objects.remove(key);
        Ok(())
    }

    async fn presign_get(&self, key: &str, expires_in: Duration) -> Result<String> {
        Ok(format!("memory:///{key}?expires={}", expires_in.as_secs()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_put_get_head_delete() {
        let store = MemoryStore::new();
        let meta = ObjectMetadata::new("application/json", None);
        store
            .put_object("a/b.json", Bytes::from_static(b"{}"), &meta)
            .await
            .unwrap();

        assert_eq!(store.get_object("a/b.json").await.unwrap().unwrap(), "{}");
        assert_eq!(store.head_object("a/b.json").await.unwrap().unwrap().size, 2);
        assert_eq!(store.list_objects("a/").await.unwrap().len(), 1);
        assert!(store.list_objects("z/").await.unwrap().is_empty());

        store.delete_object("a/b.json").await.unwrap();
        assert!(store.get_object("a/b.json").await.unwrap().is_none());
        assert!(store.head_object("a/b.json").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_injected_part_failure() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("f");
        std::fs::write(&path, b"abcdef").unwrap();
        let store = MemoryStore::new();
        store.fail_part(1, 1);

        let id = store
            .create_multipart_upload("k", &ObjectMetadata::default())
            .await
            .unwrap();
        let window = FileWindow::whole(&path, 6);
        assert!(store.upload_part("k", &id, 1, &window).await.is_err());
        let part = store.upload_part("k", &id, 1, &window).await.unwrap();
        assert_eq!(store.part_attempts(1), 2);

        store.complete_multipart_upload("k", &id, &[part]).await.unwrap();
        assert_eq!(store.object("k").unwrap().data, "abcdef");
        assert_eq!(store.pending_uploads(), 0);
    }
}
