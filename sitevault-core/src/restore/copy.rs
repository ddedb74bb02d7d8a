//! Copies an extracted tree over the live site.

use serde::Serialize;
use serde_json::json;
use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::fs::ExcludeSet;
use crate::status::{JobContext, PhaseRange, ProgressCounters};
use crate::utils::{Error, Result};

pub const RESTORING_FILES: PhaseRange = PhaseRange::new(65, 84);
const STAGE: &str = "Restoring Files";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopySummary {
    pub files: u64,
    pub bytes: u64,
    /// Symlinks, protected destinations and unreadable entries.
    pub skipped: u64,
}

/// What a copy would do, computed without touching the destination.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CopyPlan {
    pub files: u64,
    pub bytes: u64,
}

pub struct TreeCopier<'a> {
    source: &'a Path,
    dest: PathBuf,
    protected: &'a ExcludeSet,
    skip_sources: &'a [PathBuf],
}

impl<'a> TreeCopier<'a> {
    /// `protected` holds absolute destination paths that are never written.
    pub fn new(
        source: &'a Path,
        dest: &Path,
        protected: &'a ExcludeSet,
        skip_sources: &'a [PathBuf],
    ) -> Self {
        Self {
            source,
            dest: dest.canonicalize().unwrap_or_else(|_| dest.to_path_buf()),
            protected,
            skip_sources,
        }
    }

    /// Does not touch the destination.
    pub fn plan(&self) -> CopyPlan {
        let mut plan = CopyPlan::default();
        self.for_each_file(|_, _, meta| {
            plan.files += 1;
            plan.bytes += meta.len();
        });
        plan
    }

    /// Blocking.
    pub fn copy(&self, ctx: &JobContext) -> Result<CopySummary> {
        fs::create_dir_all(&self.dest)?;
        let plan = self.plan();
        let mut summary = CopySummary::default();
        let mut last_percent = None;
        let mut failure: Option<Error> = None;

        ctx.log.info(
            "copy_started",
            json!({
                "source": self.source.display().to_string(),
                "dest": self.dest.display().to_string(),
                "files": plan.files,
                "bytes": plan.bytes,
            }),
        );

        let skipped = self.for_each_file(|src, dest, meta| {
            if failure.is_some() {
                return;
            }
            if let Some(link) = linked_ancestor(&self.dest, dest) {
                summary.skipped += 1;
                ctx.log.warn(
                    "file_skipped",
                    json!({
                        "path": dest.display().to_string(),
                        "error": format!("{} is a symlink", link.display()),
                    }),
                );
                return;
            }
            match copy_file(src, dest) {
                Ok(()) => {
                    summary.files += 1;
                    summary.bytes += meta.len();
                }
                Err(e) if e.kind() == io::ErrorKind::PermissionDenied => {
                    summary.skipped += 1;
                    ctx.log.warn(
                        "file_skipped",
                        json!({ "path": dest.display().to_string(), "error": e.to_string() }),
                    );
                }
                Err(e) => failure = Some(e.into()),
            }

            let percent = RESTORING_FILES.at(summary.bytes, plan.bytes);
            if last_percent != Some(percent) {
                last_percent = Some(percent);
                ctx.progress.update_with(
                    percent,
                    STAGE,
                    Some(ProgressCounters {
                        items_processed: summary.files,
                        items_total: plan.files,
                        bytes_processed: summary.bytes,
                        bytes_total: plan.bytes,
                    }),
                    None,
                );
            }
        });
        if let Some(e) = failure {
            return Err(e);
        }
        summary.skipped += skipped;

        ctx.progress.update(RESTORING_FILES.end, STAGE);
        ctx.log.info(
            "copy_finished",
            json!({ "files": summary.files, "bytes": summary.bytes, "skipped": summary.skipped }),
        );
        Ok(summary)
    }

    /// Visits every copyable file as `(source, destination, metadata)` and
    /// returns how many entries were skipped.
    fn for_each_file<F>(&self, mut visit: F) -> u64
    where
        F: FnMut(&Path, &Path, &fs::Metadata),
    {
        let mut skipped = 0;
        let mut walker = WalkDir::new(self.source).follow_links(false).into_iter();

        while let Some(entry) = walker.next() {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!("Skipping unreadable entry: {}", e);
                    skipped += 1;
                    continue;
                }
            };
            if entry.depth() == 0 {
                continue;
            }
            if entry.path_is_symlink() {
                skipped += 1;
                continue;
            }

            let Some(dest) = self.destination(entry.path()) else {
                skipped += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            };
            if self.protected.is_self_path(&dest)
                || self.skip_sources.iter().any(|s| s == entry.path())
            {
                skipped += 1;
                if entry.file_type().is_dir() {
                    walker.skip_current_dir();
                }
                continue;
            }

            if entry.file_type().is_file() {
                match entry.metadata() {
                    Ok(meta) => visit(entry.path(), &dest, &meta),
                    Err(_) => skipped += 1,
                }
            }
        }
        skipped
    }

    /// Destination for `src`, or `None` if it would leave the destination root.
    fn destination(&self, src: &Path) -> Option<PathBuf> {
        let rel = src.strip_prefix(self.source).ok()?;
        contained_join(&self.dest, rel)
    }
}

/// `root.join(rel)` when `rel` only has normal components.
pub fn contained_join(root: &Path, rel: &Path) -> Option<PathBuf> {
    let mut out = root.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(part) => out.push(part),
            Component::CurDir => {}
            _ => return None,
        }
    }
    out.starts_with(root).then_some(out)
}

/// First directory between `root` and `dest` that is a symlink. Existing
/// links in the destination are never followed by a restore.
fn linked_ancestor(root: &Path, dest: &Path) -> Option<PathBuf> {
    let rel = dest.parent()?.strip_prefix(root).ok()?;
    let mut current = root.to_path_buf();
    for component in rel.components() {
        current.push(component);
        match fs::symlink_metadata(&current) {
            Ok(meta) if meta.file_type().is_symlink() => return Some(current),
            Ok(_) => {}
            // nothing further down exists yet
            Err(_) => return None,
        }
    }
    None
}

fn copy_file(src: &Path, dest: &Path) -> io::Result<()> {
    if let Some(parent) = dest.parent() {
        fs::create_dir_all(parent)?;
    }
    // Never write through a link planted in the destination.
    if let Ok(meta) = fs::symlink_metadata(dest) {
        if meta.file_type().is_symlink() {
            fs::remove_file(dest)?;
        }
    }
    fs::copy(src, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn tree(dir: &Path) {
        fs::create_dir_all(dir.join("content/uploads")).unwrap();
        fs::create_dir_all(dir.join("tool/bin")).unwrap();
        fs::write(dir.join("index.php"), b"<?php new").unwrap();
        fs::write(dir.join("content/uploads/a.jpg"), vec![1u8; 100]).unwrap();
        fs::write(dir.join("tool/bin/run"), b"new tool").unwrap();
    }

    #[test]
    fn test_copy_respects_protected_paths() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        tree(src.path());
        fs::create_dir_all(dest.path().join("tool/bin")).unwrap();
        fs::write(dest.path().join("tool/bin/run"), b"old tool").unwrap();

        let protected = ExcludeSet::default().with_absolute(vec![dest.path().join("tool")]);
        let copier = TreeCopier::new(src.path(), dest.path(), &protected, &[]);
        assert_eq!(copier.plan(), CopyPlan { files: 2, bytes: 109 });

        let summary = copier.copy(&JobContext::detached()).unwrap();
        assert_eq!(summary.files, 2);
        assert_eq!(fs::read(dest.path().join("index.php")).unwrap(), b"<?php new");
        assert_eq!(fs::read(dest.path().join("tool/bin/run")).unwrap(), b"old tool");
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinks_are_not_followed() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let secret = TempDir::new().unwrap();
        fs::write(secret.path().join("passwd"), b"secret").unwrap();
        std::os::unix::fs::symlink(secret.path().join("passwd"), src.path().join("link")).unwrap();
        fs::write(src.path().join("real.txt"), b"ok").unwrap();

        let protected = ExcludeSet::default();
        let summary = TreeCopier::new(src.path(), dest.path(), &protected, &[])
            .copy(&JobContext::detached())
            .unwrap();
        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!dest.path().join("link").exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_destination_dir_is_not_written_through() {
        let src = TempDir::new().unwrap();
        let dest = TempDir::new().unwrap();
        let outside = TempDir::new().unwrap();
        fs::create_dir_all(src.path().join("uploads/2024")).unwrap();
        fs::write(src.path().join("uploads/2024/evil.txt"), b"payload").unwrap();
        fs::write(src.path().join("index.php"), b"ok").unwrap();
        std::os::unix::fs::symlink(outside.path(), dest.path().join("uploads")).unwrap();

        let protected = ExcludeSet::default();
        let ctx = JobContext::detached();
        let summary = TreeCopier::new(src.path(), dest.path(), &protected, &[])
            .copy(&ctx)
            .unwrap();

        assert_eq!(summary.files, 1);
        assert_eq!(summary.skipped, 1);
        assert!(!outside.path().join("2024").exists());
        assert_eq!(fs::read(dest.path().join("index.php")).unwrap(), b"ok");
    }

    #[test]
    fn test_linked_ancestor_stops_at_missing_dirs() {
        let dest = TempDir::new().unwrap();
        fs::create_dir_all(dest.path().join("a")).unwrap();
        assert_eq!(linked_ancestor(dest.path(), &dest.path().join("a/b/c/file")), None);
        assert_eq!(linked_ancestor(dest.path(), &dest.path().join("file")), None);
    }

    #[test]
    fn test_contained_join_rejects_escapes() {
        let root = Path::new("/srv/site");
        assert_eq!(
            contained_join(root, Path::new("a/./b")),
            Some(PathBuf::from("/srv/site/a/b"))
        );
        assert_eq!(contained_join(root, Path::new("../etc/passwd")), None);
        assert_eq!(contained_join(root, Path::new("/etc/passwd")), None);
    }
}
