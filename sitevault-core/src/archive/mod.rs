//! Archive containers: building, type detection and extraction.

pub mod builder;
pub mod extract;

pub use builder::{ArchiveBuilder, ArchiveSummary, BuildOptions};
pub use extract::{extract, ExtractSummary};

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;

use crate::utils::{Error, Result};

/// Container written by backups.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ArchiveFormat {
    #[default]
    #[serde(rename = "zip")]
    Zip,
    #[serde(rename = "tar.gz", alias = "targz", alias = "tgz")]
    TarGz,
}

impl ArchiveFormat {
    pub fn extension(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "zip",
            ArchiveFormat::TarGz => "tar.gz",
        }
    }

    pub fn content_type(self) -> &'static str {
        match self {
            ArchiveFormat::Zip => "application/zip",
            ArchiveFormat::TarGz => "application/gzip",
        }
    }
}

impl fmt::Display for ArchiveFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.extension())
    }
}

/// What an archive on disk actually is, judged by its first bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectedType {
    Zip,
    TarGz,
    Tar,
}

const ZIP_LOCAL: &[u8] = b"PK\x03\x04";
const ZIP_EMPTY: &[u8] = b"PK\x05\x06";
const GZIP: &[u8] = &[0x1f, 0x8b];
const USTAR_OFFSET: usize = 257;

pub fn sniff(path: &Path) -> Result<DetectedType> {
    let mut head = Vec::with_capacity(512);
    File::open(path)?.take(512).read_to_end(&mut head)?;
    sniff_bytes(&head).ok_or_else(|| {
        Error::Extraction(format!(
            "{} is not a zip or tar archive",
            path.display()
        ))
    })
}

pub fn sniff_bytes(head: &[u8]) -> Option<DetectedType> {
    if head.starts_with(ZIP_LOCAL) || head.starts_with(ZIP_EMPTY) {
        return Some(DetectedType::Zip);
    }
    if head.starts_with(GZIP) {
        return Some(DetectedType::TarGz);
    }
    if head.len() >= USTAR_OFFSET + 5 && &head[USTAR_OFFSET..USTAR_OFFSET + 5] == b"ustar" {
        return Some(DetectedType::Tar);
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sniff_magic_bytes() {
        assert_eq!(sniff_bytes(b"PK\x03\x04rest"), Some(DetectedType::Zip));
        assert_eq!(sniff_bytes(b"PK\x05\x06"), Some(DetectedType::Zip));
        assert_eq!(sniff_bytes(&[0x1f, 0x8b, 0x08]), Some(DetectedType::TarGz));

        let mut tar = vec![0u8; 512];
        tar[257..262].copy_from_slice(b"ustar");
        assert_eq!(sniff_bytes(&tar), Some(DetectedType::Tar));

        assert_eq!(sniff_bytes(b"<html>"), None);
        assert_eq!(sniff_bytes(b""), None);
    }

    #[test]
    fn test_format_serde_names() {
        let f: ArchiveFormat = serde_json::from_str("\"tar.gz\"").unwrap();
        assert_eq!(f, ArchiveFormat::TarGz);
        assert_eq!(serde_json::to_string(&ArchiveFormat::Zip).unwrap(), "\"zip\"");
        assert_eq!(ArchiveFormat::TarGz.extension(), "tar.gz");
    }
}
