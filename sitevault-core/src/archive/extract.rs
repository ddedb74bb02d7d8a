//! Unpacks an archive whose type is detected from its content.

use flate2::read::GzDecoder;
use serde_json::json;
use std::fs::{self, File};
use std::io::{self, Read};
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use zip::ZipArchive;

use super::{sniff, DetectedType};
use crate::status::{JobContext, PhaseRange};
use crate::utils::{Error, Result};

pub const EXTRACTING: PhaseRange = PhaseRange::new(20, 35);
const STAGE: &str = "Extracting";

#[derive(Debug, Clone)]
pub struct ExtractSummary {
    pub detected: DetectedType,
    pub entries: u64,
    /// Entries refused because they would land outside the destination.
    pub rejected: u64,
}

/// Blocking. Entries that would escape `dest` are refused and counted.
pub fn extract(archive: &Path, dest: &Path, ctx: &JobContext) -> Result<ExtractSummary> {
    let detected = sniff(archive)?;
    fs::create_dir_all(dest)?;
    ctx.log.info(
        "extract_started",
        json!({ "archive": archive.display().to_string(), "type": format!("{detected:?}") }),
    );

    let summary = match detected {
        DetectedType::Zip => extract_zip(archive, dest, ctx)?,
        DetectedType::TarGz | DetectedType::Tar => extract_tar(archive, dest, detected, ctx)?,
    };

    ctx.progress.update(EXTRACTING.end, STAGE);
    ctx.log.info(
        "extract_finished",
        json!({ "entries": summary.entries, "rejected": summary.rejected }),
    );
    Ok(summary)
}

fn extract_zip(archive: &Path, dest: &Path, ctx: &JobContext) -> Result<ExtractSummary> {
    let file = File::open(archive)?;
    let mut zip = ZipArchive::new(file).map_err(|e| Error::Extraction(e.to_string()))?;
    let total = zip.len() as u64;
    let mut summary = ExtractSummary {
        detected: DetectedType::Zip,
        entries: 0,
        rejected: 0,
    };

    for i in 0..zip.len() {
        let mut entry = zip
            .by_index(i)
            .map_err(|e| Error::Extraction(e.to_string()))?;
        let Some(rel) = entry.enclosed_name().map(|p| p.to_path_buf()) else {
            summary.rejected += 1;
            ctx.log
                .warn("entry_rejected", json!({ "name": entry.name().to_string() }));
            continue;
        };

        let out = dest.join(rel);
        if entry.is_dir() {
            fs::create_dir_all(&out)?;
        } else {
            if let Some(parent) = out.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut target = File::create(&out)?;
            io::copy(&mut entry, &mut target)
                .map_err(|e| Error::Extraction(format!("{}: {}", entry.name(), e)))?;

            #[cfg(unix)]
            if let Some(mode) = entry.unix_mode() {
                use std::os::unix::fs::PermissionsExt;
                fs::set_permissions(&out, fs::Permissions::from_mode(mode & 0o777))?;
            }
        }

        summary.entries += 1;
        ctx.progress
            .update(EXTRACTING.at(i as u64 + 1, total), STAGE);
    }

    Ok(summary)
}

fn extract_tar(
    archive: &Path,
    dest: &Path,
    detected: DetectedType,
    ctx: &JobContext,
) -> Result<ExtractSummary> {
    let file = File::open(archive)?;
    let total = file.metadata()?.len();
    let consumed = Arc::new(AtomicU64::new(0));
    let counted = ConsumedReader {
        inner: file,
        consumed: Arc::clone(&consumed),
    };
    let reader: Box<dyn Read> = match detected {
        DetectedType::TarGz => Box::new(GzDecoder::new(counted)),
        _ => Box::new(counted),
    };

    let mut tar = tar::Archive::new(reader);
    let mut summary = ExtractSummary {
        detected,
        entries: 0,
        rejected: 0,
    };
    let mut last_percent = None;

    let entries = tar
        .entries()
        .map_err(|e| Error::Extraction(e.to_string()))?;
    for entry in entries {
        let mut entry = entry.map_err(|e| Error::Extraction(e.to_string()))?;
        let unpacked = entry
            .unpack_in(dest)
            .map_err(|e| Error::Extraction(e.to_string()))?;
        if unpacked {
            summary.entries += 1;
        } else {
            summary.rejected += 1;
            let name = entry
                .path()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            ctx.log.warn("entry_rejected", json!({ "name": name }));
        }

        let percent = EXTRACTING.at(consumed.load(Ordering::Relaxed), total);
        if last_percent != Some(percent) {
            last_percent = Some(percent);
            ctx.progress.update(percent, STAGE);
        }
    }

    Ok(summary)
}

/// Counts compressed bytes read so progress can follow the input file.
struct ConsumedReader<R> {
    inner: R,
    consumed: Arc<AtomicU64>,
}

impl<R: Read> Read for ConsumedReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.consumed.fetch_add(n as u64, Ordering::Relaxed);
        Ok(n)
    }
}
