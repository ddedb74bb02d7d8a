//! Directory traversal for archive building.
//!
//! Excluded directories are pruned instead of walked, and an optional
//! modification cutoff keeps only files changed at or after it.

use std::path::{Path, PathBuf};
use std::time::SystemTime;
use walkdir::{DirEntry, WalkDir};

use super::exclude::ExcludeSet;

/// What a walk keeps and how it treats links.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Descend into linked directories and archive link targets
    pub follow_links: bool,

    /// Exclusion rules, evaluated against the path relative to the root
    pub exclude: ExcludeSet,

    /// Keep only files whose mtime is at or after this instant
    pub modified_since: Option<SystemTime>,
}

/// One regular file (or resolved file link) kept by a walk.
#[derive(Debug, Clone)]
pub struct FileInfo {
    pub path: PathBuf,

    /// Relative path from the root; the file name when the root is a file
    pub relative_path: PathBuf,

    pub size: u64,

    pub modified: Option<SystemTime>,

    pub is_symlink: bool,
}

impl FileInfo {
    /// Links are measured through their target. Dangling links and links
    /// to directories yield `None`.
    fn from_entry(entry: &DirEntry, relative_path: PathBuf) -> std::io::Result<Option<Self>> {
        let own = entry.metadata()?;
        let path = entry.path().to_path_buf();
        let is_symlink = own.is_symlink();

        let metadata = if is_symlink {
            match std::fs::metadata(&path) {
                Ok(resolved) if resolved.is_dir() => return Ok(None),
                Ok(resolved) => resolved,
                Err(_) => return Ok(None),
            }
        } else {
            own
        };

        Ok(Some(Self {
            path,
            relative_path,
            size: metadata.len(),
            modified: metadata.modified().ok(),
            is_symlink,
        }))
    }
}

/// Walk totals, used to scale progress before the real pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkTotals {
    pub files: u64,
    pub bytes: u64,
}

/// Collect every kept file under `root`.
pub fn walk_directory(root: &Path, options: &WalkOptions) -> std::io::Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    walk_directory_with_callback(root, options, |file| files.push(file.clone()))?;
    Ok(files)
}

/// Visit every kept file under `root` in walk order.
///
/// Unreadable entries below the root are logged and skipped; only a root
/// that cannot be read is an error.
pub fn walk_directory_with_callback<F>(
    root: &Path,
    options: &WalkOptions,
    mut callback: F,
) -> std::io::Result<()>
where
    F: FnMut(&FileInfo),
{
    let root_meta = std::fs::metadata(root)?;
    let root_is_file = root_meta.is_file();

    let walker = WalkDir::new(root)
        .follow_links(options.follow_links)
        .into_iter()
        .filter_entry(|entry| {
            // Roots are named explicitly and always walked.
            if entry.depth() == 0 {
                return true;
            }
            let rel = entry.path().strip_prefix(root).unwrap_or(entry.path());
            !options.exclude.excludes(entry.path(), rel)
        });

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) if e.depth() == 0 => return Err(e.into()),
            Err(e) => {
                tracing::warn!("Skipping unreadable entry: {}", e);
                continue;
            }
        };

        if entry.file_type().is_dir() {
            continue;
        }

        let relative_path = if root_is_file {
            match root.file_name() {
                Some(name) => PathBuf::from(name),
                None => continue,
            }
        } else {
            entry
                .path()
                .strip_prefix(root)
                .unwrap_or(entry.path())
                .to_path_buf()
        };

        if root_is_file && options.exclude.is_excluded(&relative_path) {
            continue;
        }

        let file_info = match FileInfo::from_entry(&entry, relative_path) {
            Ok(Some(info)) => info,
            Ok(None) => continue,
            Err(e) => {
                tracing::warn!("Skipping {}: {}", entry.path().display(), e);
                continue;
            }
        };

        if let Some(cutoff) = options.modified_since {
            match file_info.modified {
                Some(mtime) if mtime >= cutoff => {}
                _ => continue,
            }
        }

        callback(&file_info);
    }

    Ok(())
}

/// Count files and bytes across several roots with the same filters.
pub fn scan_totals(roots: &[PathBuf], options: &WalkOptions) -> std::io::Result<WalkTotals> {
    let mut totals = WalkTotals::default();
    for root in roots {
        walk_directory_with_callback(root, options, |file| {
            totals.files += 1;
            totals.bytes += file.size;
        })?;
    }
    Ok(totals)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::time::Duration;
    use tempfile::TempDir;

    fn options(patterns: &[&str]) -> WalkOptions {
        WalkOptions {
            exclude: ExcludeSet::new(patterns).unwrap(),
            ..WalkOptions::default()
        }
    }

    #[test]
    fn test_walk_empty_directory() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        assert_eq!(files.len(), 0);
        Ok(())
    }

    #[test]
    fn test_walk_with_subdirectories() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::create_dir(temp_dir.path().join("subdir"))?;
        fs::write(temp_dir.path().join("file1.txt"), b"content1")?;
        fs::write(temp_dir.path().join("subdir/file2.txt"), b"content2")?;

        let mut files = walk_directory(temp_dir.path(), &WalkOptions::default())?;
        files.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));
        assert_eq!(files.len(), 2);
        assert_eq!(files[1].relative_path, Path::new("subdir/file2.txt"));

        Ok(())
    }

    #[test]
    fn test_excluded_directory_is_pruned() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        fs::create_dir_all(temp_dir.path().join("content/cache/deep"))?;
        fs::write(temp_dir.path().join("content/cache/deep/x.html"), b"x")?;
        fs::write(temp_dir.path().join("content/page.html"), b"page")?;

        let files = walk_directory(temp_dir.path(), &options(&["cache"]))?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, Path::new("content/page.html"));
        Ok(())
    }

    #[test]
    fn test_self_exclusion_skips_working_storage() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let data = temp_dir.path().join("sitevault-data");
        fs::create_dir_all(data.join("work"))?;
        fs::write(data.join("work/partial.zip"), b"zip")?;
        fs::write(temp_dir.path().join("index.php"), b"<?php")?;

        let opts = WalkOptions {
            exclude: ExcludeSet::default().with_absolute(vec![data]),
            ..WalkOptions::default()
        };
        let files = walk_directory(temp_dir.path(), &opts)?;
        assert_eq!(files.len(), 1);
        Ok(())
    }

    #[test]
    fn test_file_root_uses_file_name() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let file = temp_dir.path().join("config.php");
        fs::write(&file, b"<?php")?;

        let files = walk_directory(&file, &WalkOptions::default())?;
        assert_eq!(files.len(), 1);
        assert_eq!(files[0].relative_path, Path::new("config.php"));
        Ok(())
    }

    #[test]
    fn test_modified_since_is_inclusive() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;
        let path = temp_dir.path().join("a.txt");
        fs::write(&path, b"a")?;
        let mtime = fs::metadata(&path)?.modified()?;

        let mut opts = WalkOptions::default();
        opts.modified_since = Some(mtime);
        assert_eq!(walk_directory(temp_dir.path(), &opts)?.len(), 1);

        opts.modified_since = Some(mtime + Duration::from_secs(1));
        assert_eq!(walk_directory(temp_dir.path(), &opts)?.len(), 0);
        Ok(())
    }

    #[test]
    fn test_scan_totals() -> std::io::Result<()> {
        let temp_dir = TempDir::new()?;

        fs::write(temp_dir.path().join("file1.txt"), b"12345")?;
        fs::write(temp_dir.path().join("file2.txt"), b"1234567")?;

        let totals = scan_totals(&[temp_dir.path().to_path_buf()], &WalkOptions::default())?;
        assert_eq!(totals, WalkTotals { files: 2, bytes: 12 });

        Ok(())
    }

    #[test]
    fn test_missing_root_is_an_error() {
        let temp_dir = TempDir::new().unwrap();
        let result = walk_directory(&temp_dir.path().join("nope"), &WalkOptions::default());
        assert!(result.is_err());
    }
}
