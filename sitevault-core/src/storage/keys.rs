//! Object and file naming.
//!
//! Archives are `backup-<kind>-<YYYYMMDD-HHMMSS>.<ext>`; the remote
//! manifest shares the stamp (`manifest-<stamp>.json`) and the local one
//! sits next to the archive as `<archive>.manifest.json`.

use chrono::{DateTime, Utc};

use crate::archive::ArchiveFormat;

const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";
const STAMP_LEN: usize = 15;

pub fn stamp(time: DateTime<Utc>) -> String {
    time.format(STAMP_FORMAT).to_string()
}

pub fn archive_name(kind: &str, time: DateTime<Utc>, format: ArchiveFormat) -> String {
    format!("backup-{}-{}.{}", kind, stamp(time), format.extension())
}

pub fn manifest_name(time: DateTime<Utc>) -> String {
    format!("manifest-{}.json", stamp(time))
}

pub fn local_manifest_name(archive_name: &str) -> String {
    format!("{archive_name}.manifest.json")
}

pub fn object_key(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        return name.to_string();
    }
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

/// `<prefix>/backup-<kind>-<stamp>.<ext>` → `(prefix, kind, stamp)`.
pub fn parse_archive_key(key: &str) -> Option<(&str, &str, &str)> {
    let (prefix, name) = match key.rfind('/') {
        Some(i) => (&key[..i], &key[i + 1..]),
        None => ("", key),
    };
    let rest = name.strip_prefix("backup-")?;
    let base = rest
        .strip_suffix(".tar.gz")
        .or_else(|| rest.strip_suffix(".zip"))?;
    if base.len() < STAMP_LEN + 2 {
        return None;
    }
    let (kind, stamp) = base.split_at(base.len() - STAMP_LEN);
    let kind = kind.strip_suffix('-')?;
    if kind.is_empty() || !is_stamp(stamp) {
        return None;
    }
    Some((prefix, kind, stamp))
}

/// Remote manifest key that belongs to an archive key.
pub fn manifest_key_for(archive_key: &str) -> Option<String> {
    let (prefix, _, stamp) = parse_archive_key(archive_key)?;
    Some(object_key(prefix, &format!("manifest-{stamp}.json")))
}

fn is_stamp(s: &str) -> bool {
    s.len() == STAMP_LEN
        && s.bytes().enumerate().all(|(i, b)| {
            if i == 8 {
                b == b'-'
            } else {
                b.is_ascii_digit()
            }
        })
}
