//! Per-restore scratch state, removed when the session is dropped.

use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::fs::ExcludeSet;
use crate::utils::Result;

pub struct RestoreSession {
    extract_dir: TempDir,
    scratch: PathBuf,
    downloaded: Option<PathBuf>,
    protected: ExcludeSet,
    root: Option<PathBuf>,
}

impl RestoreSession {
    /// `restore_dir` holds the extraction directory; `scratch` bounds what
    /// the session may delete on drop.
    pub fn new(restore_dir: &Path, scratch: &Path, protected: ExcludeSet) -> Result<Self> {
        fs::create_dir_all(restore_dir)?;
        let extract_dir = tempfile::Builder::new()
            .prefix("extract-")
            .tempdir_in(restore_dir)?;
        Ok(Self {
            extract_dir,
            scratch: scratch.canonicalize().unwrap_or_else(|_| scratch.to_path_buf()),
            downloaded: None,
            protected,
            root: None,
        })
    }

    pub fn extract_dir(&self) -> &Path {
        self.extract_dir.path()
    }

    /// Mark an archive this session fetched; it is removed on drop.
    pub fn set_downloaded(&mut self, path: PathBuf) {
        self.downloaded = Some(path);
    }

    pub fn downloaded(&self) -> Option<&Path> {
        self.downloaded.as_deref()
    }

    /// Destination paths the restore must never write to.
    pub fn protected(&self) -> &ExcludeSet {
        &self.protected
    }

    pub fn set_root(&mut self, root: PathBuf) {
        self.root = Some(root);
    }

    pub fn root(&self) -> Option<&Path> {
        self.root.as_deref()
    }
}

impl Drop for RestoreSession {
    fn drop(&mut self) {
        let Some(path) = self.downloaded.take() else {
            return;
        };
        let inside_scratch = path
            .canonicalize()
            .map(|p| p.starts_with(&self.scratch))
            .unwrap_or(false);
        if inside_scratch {
            if let Err(e) = fs::remove_file(&path) {
                tracing::warn!("Failed to remove downloaded archive {}: {}", path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_removes_extract_dir_and_scratch_download() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        let restore = scratch.join("restore");

        let mut session = RestoreSession::new(&restore, &scratch, ExcludeSet::default()).unwrap();
        let extract = session.extract_dir().to_path_buf();
        let download = restore.join("a.zip");
        fs::write(&download, b"zip").unwrap();
        session.set_downloaded(download.clone());
        assert!(extract.is_dir());

        drop(session);
        assert!(!extract.exists());
        assert!(!download.exists());
    }

    #[test]
    fn test_drop_keeps_files_outside_scratch() {
        let dir = TempDir::new().unwrap();
        let scratch = dir.path().join("scratch");
        let outside = dir.path().join("user-archive.zip");
        fs::write(&outside, b"zip").unwrap();

        let mut session =
            RestoreSession::new(&scratch.join("restore"), &scratch, ExcludeSet::default()).unwrap();
        session.set_downloaded(outside.clone());
        drop(session);
        assert!(outside.exists());
    }
}
