//! Keep-last-N pruning of local and remote archives.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::storage::keys::{local_manifest_name, manifest_key_for, parse_archive_key};
use crate::storage::{ObjectInfo, ObjectStore};
use crate::utils::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalArchive {
    pub path: PathBuf,
    pub name: String,
    pub stamp: String,
}

/// Archives in `dir`, newest first. Other files are ignored.
pub fn local_archives(dir: &Path) -> io::Result<Vec<LocalArchive>> {
    let mut archives = Vec::new();
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(archives),
        Err(e) => return Err(e),
    };
    for entry in entries {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        if let Some((_, _, stamp)) = parse_archive_key(&name) {
            archives.push(LocalArchive {
                stamp: stamp.to_string(),
                path: entry.path(),
                name,
            });
        }
    }
    archives.sort_by(|a, b| b.stamp.cmp(&a.stamp).then_with(|| b.name.cmp(&a.name)));
    Ok(archives)
}

/// Delete all but the newest `keep` archives and their manifests.
pub fn prune_local(dir: &Path, keep: usize) -> io::Result<Vec<PathBuf>> {
    let mut removed = Vec::new();
    for archive in local_archives(dir)?.into_iter().skip(keep) {
        fs::remove_file(&archive.path)?;
        let manifest = dir.join(local_manifest_name(&archive.name));
        if manifest.exists() {
            fs::remove_file(&manifest)?;
        }
        tracing::info!("Pruned local archive {}", archive.name);
        removed.push(archive.path);
    }
    Ok(removed)
}

/// Archive objects under `prefix`, newest first.
pub async fn remote_archives(store: &dyn ObjectStore, prefix: &str) -> Result<Vec<ObjectInfo>> {
    let mut archives: Vec<(String, ObjectInfo)> = store
        .list_objects(prefix)
        .await?
        .into_iter()
        .filter_map(|o| {
            let stamp = parse_archive_key(&o.key)?.2.to_string();
            Some((stamp, o))
        })
        .collect();
    archives.sort_by(|a, b| b.0.cmp(&a.0).then_with(|| b.1.key.cmp(&a.1.key)));
    Ok(archives.into_iter().map(|(_, o)| o).collect())
}

/// Delete all but the newest `keep` remote archives and their manifests.
pub async fn prune_remote(store: &dyn ObjectStore, prefix: &str, keep: usize) -> Result<Vec<String>> {
    let mut deleted = Vec::new();
    for archive in remote_archives(store, prefix).await?.into_iter().skip(keep) {
        store.delete_object(&archive.key).await?;
        if let Some(manifest_key) = manifest_key_for(&archive.key) {
            store.delete_object(&manifest_key).await?;
        }
        tracing::info!("Pruned remote archive {}", archive.key);
        deleted.push(archive.key);
    }
    Ok(deleted)
}
