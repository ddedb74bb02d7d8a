//! Writes backup roots into a zip or tar.gz container.

use flate2::write::GzEncoder;
use flate2::Compression;
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, BufWriter, Read, Seek};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use zip::write::FileOptions;
use zip::{CompressionMethod, ZipWriter};

use super::ArchiveFormat;
use crate::fs::{scan_totals, walk_directory_with_callback, ExcludeSet, FileInfo, WalkOptions};
use crate::status::{JobContext, PhaseRange, ProgressCounters};
use crate::utils::hasher::sha256_file;
use crate::utils::{Error, Result};

pub const ARCHIVING: PhaseRange = PhaseRange::new(40, 69);
const STAGE: &str = "Archiving";

#[derive(Debug, Clone)]
pub struct BuildOptions {
    /// Incremental cutoff, inclusive.
    pub modified_since: Option<SystemTime>,
    /// Absolute paths never archived (the tool's own storage).
    pub self_exclusions: Vec<PathBuf>,
    pub phase: PhaseRange,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            modified_since: None,
            self_exclusions: Vec::new(),
            phase: ARCHIVING,
        }
    }
}

#[derive(Debug, Clone)]
pub struct ArchiveSummary {
    pub path: PathBuf,
    pub format: ArchiveFormat,
    pub files: u64,
    pub bytes: u64,
    pub skipped: u64,
    /// Size of the container itself.
    pub archive_size: u64,
    pub sha256: String,
}

pub struct ArchiveBuilder {
    format: ArchiveFormat,
    exclude: ExcludeSet,
}

impl ArchiveBuilder {
    pub fn new(format: ArchiveFormat, exclude: ExcludeSet) -> Self {
        Self { format, exclude }
    }

    /// Blocking; run it on a blocking thread.
    pub fn build(
        &self,
        roots: &[PathBuf],
        output: &Path,
        options: &BuildOptions,
        ctx: &JobContext,
    ) -> Result<ArchiveSummary> {
        let walk = WalkOptions {
            follow_links: false,
            exclude: self
                .exclude
                .clone()
                .with_absolute(options.self_exclusions.iter().cloned()),
            modified_since: options.modified_since,
        };

        let mut roots_present = Vec::new();
        for root in roots {
            if root.exists() {
                roots_present.push(root.clone());
            } else {
                ctx.log
                    .warn("root_missing", json!({ "path": root.display().to_string() }));
            }
        }

        let totals = scan_totals(&roots_present, &walk)?;
        ctx.log.info(
            "archive_started",
            json!({
                "format": self.format.extension(),
                "files": totals.files,
                "bytes": totals.bytes,
                "output": output.display().to_string(),
            }),
        );

        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = File::create(output).map_err(|e| {
            Error::Archive(format!("cannot create {}: {}", output.display(), e))
        })?;
        let mut writer = ContainerWriter::new(self.format, file);
        let spool_dir = output
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));

        let mut tracker = Tracker {
            ctx,
            phase: options.phase,
            total_files: totals.files,
            total_bytes: totals.bytes,
            files: 0,
            bytes: 0,
            skipped: 0,
            last_percent: None,
        };
        tracker.emit();

        for root in &roots_present {
            let prefix = root_entry_prefix(root)?;
            let mut failure: Option<Error> = None;

            walk_directory_with_callback(root, &walk, |info| {
                if failure.is_some() {
                    return;
                }
                let added = add_file(&mut writer, &mut tracker, spool_dir, prefix.as_deref(), info);
                if let Err(e) = added {
                    failure = Some(e);
                }
            })?;

            if let Some(e) = failure {
                return Err(e);
            }
        }

        writer.finish()?;

        let archive_size = fs::metadata(output)?.len();
        let sha256 = sha256_file(output)?;
        let archived_bytes = tracker.bytes.min(tracker.total_bytes);
        tracker.bytes = tracker.total_bytes;
        tracker.emit();

        ctx.log.info(
            "archive_finished",
            json!({
                "files": tracker.files,
                "bytes": archived_bytes,
                "skipped": tracker.skipped,
                "size": archive_size,
                "sha256": sha256,
            }),
        );

        Ok(ArchiveSummary {
            path: output.to_path_buf(),
            format: self.format,
            files: tracker.files,
            bytes: archived_bytes,
            skipped: tracker.skipped,
            archive_size,
            sha256,
        })
    }
}

/// `None` for a file root, which is stored under its own name.
fn root_entry_prefix(root: &Path) -> Result<Option<String>> {
    if root.is_file() {
        return Ok(None);
    }
    let named = match root.file_name() {
        Some(name) => name.to_string_lossy().into_owned(),
        None => root
            .canonicalize()?
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string()),
    };
    Ok(Some(named))
}

fn entry_name(prefix: Option<&str>, rel: &Path) -> String {
    let rel = rel
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect::<Vec<_>>()
        .join("/");
    match prefix {
        Some(prefix) => format!("{prefix}/{rel}"),
        None => rel,
    }
}

/// Files up to this size are staged in memory, larger ones in a temp file
/// next to the archive.
const SPOOL_IN_MEMORY: usize = 8 * 1024 * 1024;

fn add_file(
    writer: &mut ContainerWriter,
    tracker: &mut Tracker<'_>,
    spool_dir: &Path,
    prefix: Option<&str>,
    info: &FileInfo,
) -> Result<()> {
    let name = entry_name(prefix, &info.relative_path);
    let file = match File::open(&info.path) {
        Ok(file) => file,
        Err(e) => {
            tracker.skip(&info.path, &e);
            return Ok(());
        }
    };

    let mtime = info
        .modified
        .and_then(|m| m.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs())
        .unwrap_or(0);
    add_entry(writer, tracker, spool_dir, &info.path, &name, file, mtime)
}

/// Reads `source` completely before anything reaches the container, so a
/// read failure skips the file and the entry size is the size actually read.
fn add_entry(
    writer: &mut ContainerWriter,
    tracker: &mut Tracker<'_>,
    spool_dir: &Path,
    path: &Path,
    name: &str,
    source: impl Read,
    mtime: u64,
) -> Result<()> {
    let mut spool = tempfile::spooled_tempfile_in(SPOOL_IN_MEMORY, spool_dir);
    let mut reader = CountingReader {
        inner: source,
        tracker: &mut *tracker,
    };
    let size = match io::copy(&mut reader, &mut spool) {
        Ok(size) => size,
        Err(e) => {
            tracker.skip(path, &e);
            return Ok(());
        }
    };
    spool.rewind()?;

    writer.append(name, &mut spool, size, mtime)?;
    tracker.files += 1;
    tracker.maybe_emit();
    Ok(())
}

struct Tracker<'a> {
    ctx: &'a JobContext,
    phase: PhaseRange,
    total_files: u64,
    total_bytes: u64,
    files: u64,
    bytes: u64,
    skipped: u64,
    last_percent: Option<u8>,
}

impl Tracker<'_> {
    fn advance(&mut self, n: u64) {
        self.bytes += n;
        self.maybe_emit();
    }

    fn percent(&self) -> u8 {
        self.phase.at(self.bytes.min(self.total_bytes), self.total_bytes)
    }

    /// Report only when a new percentage point is crossed.
    fn maybe_emit(&mut self) {
        if self.last_percent != Some(self.percent()) {
            self.emit();
        }
    }

    fn emit(&mut self) {
        let percent = self.percent();
        self.last_percent = Some(percent);
        self.ctx.progress.update_with(
            percent,
            STAGE,
            Some(ProgressCounters {
                items_processed: self.files,
                items_total: self.total_files,
                bytes_processed: self.bytes.min(self.total_bytes),
                bytes_total: self.total_bytes,
            }),
            None,
        );
    }

    fn skip(&mut self, path: &Path, err: &io::Error) {
        self.skipped += 1;
        self.ctx.log.warn(
            "file_skipped",
            json!({ "path": path.display().to_string(), "error": err.to_string() }),
        );
    }
}

struct CountingReader<'a, 'b, R> {
    inner: R,
    tracker: &'a mut Tracker<'b>,
}

impl<R: Read> Read for CountingReader<'_, '_, R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.tracker.advance(n as u64);
        Ok(n)
    }
}

enum ContainerWriter {
    Zip(ZipWriter<BufWriter<File>>),
    TarGz(tar::Builder<GzEncoder<BufWriter<File>>>),
}

impl ContainerWriter {
    fn new(format: ArchiveFormat, file: File) -> Self {
        let out = BufWriter::new(file);
        match format {
            ArchiveFormat::Zip => ContainerWriter::Zip(ZipWriter::new(out)),
            ArchiveFormat::TarGz => {
                ContainerWriter::TarGz(tar::Builder::new(GzEncoder::new(
                    out,
                    Compression::default(),
                )))
            }
        }
    }

    fn append(&mut self, name: &str, reader: &mut dyn Read, size: u64, mtime: u64) -> Result<()> {
        match self {
            ContainerWriter::Zip(zip) => {
                let options = FileOptions::default()
                    .compression_method(CompressionMethod::Deflated)
                    .large_file(size >= u32::MAX as u64);
                zip.start_file(name, options)?;
                io::copy(reader, zip)?;
            }
            ContainerWriter::TarGz(tar) => {
                let mut header = tar::Header::new_gnu();
                header.set_size(size);
                header.set_mode(0o644);
                header.set_mtime(mtime);
                header.set_entry_type(tar::EntryType::Regular);
                tar.append_data(&mut header, name, reader.take(size))?;
            }
        }
        Ok(())
    }

    fn finish(self) -> Result<()> {
        let out = match self {
            ContainerWriter::Zip(mut zip) => zip.finish()?,
            ContainerWriter::TarGz(tar) => tar.into_inner()?.finish()?,
        };
        let file = out
            .into_inner()
            .map_err(|e| Error::Archive(format!("flush failed: {}", e.error())))?;
        file.sync_all()?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::{extract, sniff, DetectedType};
    use crate::status::{EventLog, JobControl, ProgressStore};
    use tempfile::TempDir;

    fn site(dir: &Path) -> PathBuf {
        let root = dir.join("site");
        fs::create_dir_all(root.join("content/cache")).unwrap();
        fs::create_dir_all(root.join("content/uploads")).unwrap();
        fs::write(root.join("index.php"), b"<?php echo 1;").unwrap();
        fs::write(root.join("content/uploads/a.txt"), vec![b'a'; 4096]).unwrap();
        fs::write(root.join("content/cache/c.html"), b"cached").unwrap();
        root
    }

    fn build(format: ArchiveFormat, patterns: &[&str]) -> (TempDir, ArchiveSummary, JobContext) {
        let dir = TempDir::new().unwrap();
        let root = site(dir.path());
        let out = dir.path().join(format!("out.{}", format.extension()));
        let ctx = JobContext::detached();
        let builder = ArchiveBuilder::new(format, ExcludeSet::new(patterns).unwrap());
        let summary = builder
            .build(&[root], &out, &BuildOptions::default(), &ctx)
            .unwrap();
        (dir, summary, ctx)
    }

    #[test]
    fn test_zip_hash_matches_file() {
        let (_dir, summary, _) = build(ArchiveFormat::Zip, &["cache"]);
        assert_eq!(summary.files, 2);
        assert_eq!(summary.skipped, 0);
        assert_eq!(summary.sha256, sha256_file(&summary.path).unwrap());
        assert_eq!(sniff(&summary.path).unwrap(), DetectedType::Zip);
    }

    #[test]
    fn test_tar_gz_entries_are_prefixed_with_root_name() {
        let (dir, summary, _) = build(ArchiveFormat::TarGz, &["cache"]);
        assert_eq!(sniff(&summary.path).unwrap(), DetectedType::TarGz);

        let dest = dir.path().join("x");
        extract(&summary.path, &dest, &JobContext::detached()).unwrap();
        assert!(dest.join("site/index.php").is_file());
        assert!(dest.join("site/content/uploads/a.txt").is_file());
        assert!(!dest.join("site/content/cache").exists());
    }

    #[test]
    fn test_progress_ends_at_phase_end() {
        let (_dir, summary, ctx) = build(ArchiveFormat::Zip, &[]);
        let p = ctx.progress.current();
        assert_eq!(p.percent, ARCHIVING.end);
        assert_eq!(p.stage, STAGE);
        let counters = p.counters.unwrap();
        assert_eq!(counters.items_processed, summary.files);
        assert_eq!(counters.bytes_total, summary.bytes);
    }

    #[test]
    fn test_file_root_is_stored_by_name() {
        let dir = TempDir::new().unwrap();
        let dump = dir.path().join("database.sql");
        fs::write(&dump, b"CREATE TABLE t(x);").unwrap();
        let out = dir.path().join("db.zip");

        let builder = ArchiveBuilder::new(ArchiveFormat::Zip, ExcludeSet::default());
        builder
            .build(&[dump], &out, &BuildOptions::default(), &JobContext::detached())
            .unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        assert_eq!(zip.by_index(0).unwrap().name(), "database.sql");
    }

    #[test]
    fn test_missing_output_dir_parent_is_created() {
        let dir = TempDir::new().unwrap();
        let root = site(dir.path());
        let out = dir.path().join("a/b/c/out.zip");
        let builder = ArchiveBuilder::new(ArchiveFormat::Zip, ExcludeSet::default());
        let summary = builder
            .build(&[root], &out, &BuildOptions::default(), &JobContext::detached())
            .unwrap();
        assert!(summary.path.is_file());
    }

    /// Yields `good` bytes, then fails.
    struct FailingReader {
        good: usize,
    }

    impl Read for FailingReader {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            if self.good == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "device went away"));
            }
            let n = self.good.min(buf.len());
            buf[..n].fill(b'x');
            self.good -= n;
            Ok(n)
        }
    }

    #[test]
    fn test_read_failure_mid_file_skips_entry_and_keeps_tar_intact() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.tar.gz");
        let ctx = JobContext::detached();
        let mut writer = ContainerWriter::new(ArchiveFormat::TarGz, File::create(&out).unwrap());
        let mut tracker = Tracker {
            ctx: &ctx,
            phase: PhaseRange::new(40, 69),
            total_files: 3,
            total_bytes: 10_000,
            files: 0,
            bytes: 0,
            skipped: 0,
            last_percent: None,
        };

        let spool = dir.path();
        let broken = FailingReader { good: 4096 };
        add_entry(&mut writer, &mut tracker, spool, Path::new("broken.bin"), "site/broken.bin", broken, 0)
            .unwrap();
        add_entry(&mut writer, &mut tracker, spool, Path::new("first.txt"), "site/first.txt", &b"hello"[..], 0)
            .unwrap();
        add_entry(&mut writer, &mut tracker, spool, Path::new("second.txt"), "site/second.txt", &b"world!"[..], 0)
            .unwrap();
        writer.finish().unwrap();

        assert_eq!(tracker.files, 2);
        assert_eq!(tracker.skipped, 1);

        let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(File::open(&out).unwrap()));
        let mut seen = Vec::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().display().to_string();
            let mut body = String::new();
            entry.read_to_string(&mut body).unwrap();
            seen.push((name, body));
        }
        assert_eq!(
            seen,
            vec![
                ("site/first.txt".to_string(), "hello".to_string()),
                ("site/second.txt".to_string(), "world!".to_string()),
            ]
        );
    }

    #[test]
    fn test_read_failure_mid_file_is_skipped_in_zip() {
        let dir = TempDir::new().unwrap();
        let out = dir.path().join("out.zip");
        let ctx = JobContext::new(
            EventLog::open(dir.path().join("logs")).unwrap(),
            ProgressStore::new(),
            JobControl::new(),
        );
        let mut writer = ContainerWriter::new(ArchiveFormat::Zip, File::create(&out).unwrap());
        let mut tracker = Tracker {
            ctx: &ctx,
            phase: PhaseRange::new(40, 69),
            total_files: 2,
            total_bytes: 100,
            files: 0,
            bytes: 0,
            skipped: 0,
            last_percent: None,
        };

        let spool = dir.path();
        let broken = FailingReader { good: 10 };
        add_entry(&mut writer, &mut tracker, spool, Path::new("a"), "a", broken, 0).unwrap();
        add_entry(&mut writer, &mut tracker, spool, Path::new("b"), "b", &b"kept"[..], 0).unwrap();
        writer.finish().unwrap();

        let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
        assert_eq!(zip.len(), 1);
        let mut body = String::new();
        zip.by_name("b").unwrap().read_to_string(&mut body).unwrap();
        assert_eq!(body, "kept");
        assert_eq!(
            ctx.log.tail_entries(10, None).iter().filter(|e| e.event == "file_skipped").count(),
            1
        );
    }

    #[cfg(unix)]
    #[test]
    fn test_unreadable_file_is_skipped() {
        use std::os::unix::fs::PermissionsExt;

        let dir = TempDir::new().unwrap();
        let root = site(dir.path());
        let locked = root.join("locked.txt");
        fs::write(&locked, b"secret").unwrap();
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o000)).unwrap();
        if File::open(&locked).is_ok() {
            // running as root, permissions are not enforced
            return;
        }

        let out = dir.path().join("out.zip");
        let builder = ArchiveBuilder::new(ArchiveFormat::Zip, ExcludeSet::default());
        let summary = builder
            .build(&[root], &out, &BuildOptions::default(), &JobContext::detached())
            .unwrap();
        assert_eq!(summary.skipped, 1);
        assert_eq!(summary.files, 3);
    }

    mod exclusion_props {
        use super::*;
        use proptest::prelude::*;
        use std::collections::BTreeSet;

        const DIRS: [&str; 4] = ["a", "b", "cache", "logs"];
        const FILES: [&str; 3] = ["f.txt", "g.log", "h"];
        const PATTERNS: [&str; 4] = ["cache", "logs", "*.log", "a/b"];

        fn file_path() -> impl Strategy<Value = String> {
            (
                prop::collection::vec(prop::sample::select(DIRS.to_vec()), 0..3),
                prop::sample::select(FILES.to_vec()),
            )
                .prop_map(|(dirs, file)| {
                    let mut parts: Vec<&str> = dirs;
                    parts.push(file);
                    parts.join("/")
                })
        }

        /// Written out per pattern so the expectation does not go through
        /// `ExcludeSet` itself.
        fn expected_kept(rel: &str, patterns: &[&str]) -> bool {
            let parts: Vec<&str> = rel.split('/').collect();
            !patterns.iter().any(|p| match *p {
                "*.log" => rel.ends_with(".log"),
                "a/b" => parts.len() > 2 && parts[0] == "a" && parts[1] == "b",
                segment => parts.contains(&segment),
            })
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(32))]

            #[test]
            fn prop_zip_holds_exactly_the_unexcluded_files(
                files in prop::collection::btree_set(file_path(), 1..12),
                patterns in prop::sample::subsequence(PATTERNS.to_vec(), 0..=PATTERNS.len()),
            ) {
                let dir = TempDir::new().unwrap();
                let root = dir.path().join("site");
                for rel in &files {
                    let path = root.join(rel);
                    fs::create_dir_all(path.parent().unwrap()).unwrap();
                    fs::write(&path, rel.as_bytes()).unwrap();
                }

                let out = dir.path().join("out.zip");
                let builder =
                    ArchiveBuilder::new(ArchiveFormat::Zip, ExcludeSet::new(&patterns).unwrap());
                builder
                    .build(&[root], &out, &BuildOptions::default(), &JobContext::detached())
                    .unwrap();

                let mut zip = zip::ZipArchive::new(File::open(&out).unwrap()).unwrap();
                let mut entries = BTreeSet::new();
                for i in 0..zip.len() {
                    let name = zip.by_index(i).unwrap().name().to_string();
                    if !name.ends_with('/') {
                        entries.insert(name.trim_start_matches("site/").to_string());
                    }
                }

                let expected: BTreeSet<String> = files
                    .iter()
                    .filter(|rel| expected_kept(rel, &patterns))
                    .cloned()
                    .collect();
                prop_assert_eq!(entries, expected);
            }
        }
    }
}
