//! The single "current progress" record read by pollers.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

/// Sub-range of the 0-100 job scale assigned to one stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PhaseRange {
    pub start: u8,
    pub end: u8,
}

impl PhaseRange {
    pub const fn new(start: u8, end: u8) -> Self {
        Self { start, end }
    }

    /// Percent for `done` out of `total`, floored. An empty total maps to `end`.
    pub fn at(&self, done: u64, total: u64) -> u8 {
        if total == 0 {
            return self.end;
        }
        let span = self.end.saturating_sub(self.start) as u64;
        let offset = (span * done.min(total)) / total;
        self.start.saturating_add(offset as u8).min(self.end)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub items_processed: u64,
    pub items_total: u64,
    pub bytes_processed: u64,
    pub bytes_total: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressRecord {
    pub percent: u8,
    pub stage: String,
    #[serde(rename = "ts")]
    pub timestamp: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub job_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub counters: Option<ProgressCounters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl Default for ProgressRecord {
    fn default() -> Self {
        Self {
            percent: 0,
            stage: "Idle".to_string(),
            timestamp: Utc::now(),
            job_id: None,
            counters: None,
            detail: None,
        }
    }
}

type Observer = Arc<dyn Fn(&ProgressRecord) + Send + Sync>;

/// Shared handle to the progress record. Latest write wins.
#[derive(Clone, Default)]
pub struct ProgressStore {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    record: RwLock<ProgressRecord>,
    snapshot: Option<PathBuf>,
    observers: RwLock<Vec<Observer>>,
}

impl ProgressStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mirror every update to a JSON file so other processes can poll it.
    pub fn with_snapshot(path: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                snapshot: Some(path.into()),
                ..Inner::default()
            }),
        }
    }

    /// Read a snapshot written by another process.
    pub fn read_snapshot(path: &Path) -> io::Result<Option<ProgressRecord>> {
        match fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Called synchronously after every change.
    pub fn subscribe<F>(&self, observer: F)
    where
        F: Fn(&ProgressRecord) + Send + Sync + 'static,
    {
        self.inner
            .observers
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .push(Arc::new(observer));
    }

    pub fn current(&self) -> ProgressRecord {
        self.inner
            .record
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone()
    }

    /// Start a new job at 0%.
    pub fn begin(&self, job_id: &str) {
        self.replace(ProgressRecord {
            percent: 0,
            stage: "Starting".to_string(),
            timestamp: Utc::now(),
            job_id: Some(job_id.to_string()),
            counters: None,
            detail: None,
        });
    }

    pub fn update(&self, percent: u8, stage: &str) {
        self.update_with(percent, stage, None, None);
    }

    /// Never moves the percent backwards within a job.
    pub fn update_with(
        &self,
        percent: u8,
        stage: &str,
        counters: Option<ProgressCounters>,
        detail: Option<String>,
    ) {
        let record = {
            let mut record = self.inner.record.write().unwrap_or_else(|p| p.into_inner());
            record.percent = percent.min(100).max(record.percent);
            record.stage = stage.to_string();
            record.timestamp = Utc::now();
            record.counters = counters;
            record.detail = detail;
            record.clone()
        };
        self.publish(&record);
    }

    /// The one sanctioned way to lower the percent: relabel as paused and
    /// drop to `marker` if past it. Never raises.
    pub fn mark_paused(&self, marker: u8) {
        let record = {
            let mut record = self.inner.record.write().unwrap_or_else(|p| p.into_inner());
            record.percent = record.percent.min(marker);
            record.stage = "Paused".to_string();
            record.timestamp = Utc::now();
            record.clone()
        };
        self.publish(&record);
    }

    /// Keep the percent reached, relabel the stage.
    pub fn fail(&self, reason: &str) {
        let record = {
            let mut record = self.inner.record.write().unwrap_or_else(|p| p.into_inner());
            record.stage = "Failed".to_string();
            record.detail = Some(reason.to_string());
            record.timestamp = Utc::now();
            record.clone()
        };
        self.publish(&record);
    }

    fn replace(&self, new: ProgressRecord) {
        {
            let mut record = self.inner.record.write().unwrap_or_else(|p| p.into_inner());
            *record = new.clone();
        }
        self.publish(&new);
    }

    fn publish(&self, record: &ProgressRecord) {
        if let Some(path) = &self.inner.snapshot {
            if let Err(e) = write_snapshot(path, record) {
                tracing::warn!("Failed to write progress snapshot {}: {}", path.display(), e);
            }
        }

        let observers: Vec<Observer> = self
            .inner
            .observers
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .clone();
        for observer in observers {
            observer(record);
        }
    }
}

fn write_snapshot(path: &Path, record: &ProgressRecord) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let tmp = path.with_extension("json.tmp");
    let bytes = serde_json::to_vec(record).map_err(|e| io::Error::new(io::ErrorKind::Other, e))?;
    fs::write(&tmp, bytes)?;
    fs::rename(tmp, path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    #[test]
    fn test_phase_range_mapping() {
        let range = PhaseRange::new(40, 70);
        assert_eq!(range.at(0, 100), 40);
        assert_eq!(range.at(50, 100), 55);
        assert_eq!(range.at(100, 100), 70);
        assert_eq!(range.at(200, 100), 70);
        assert_eq!(range.at(0, 0), 70);
    }

    #[test]
    fn test_progress_roundtrip() {
        let store = ProgressStore::new();
        store.begin("job-1");
        store.update(42, "Testing");

        let p = store.current();
        assert_eq!(p.percent, 42);
        assert_eq!(p.stage, "Testing");
        assert_eq!(p.job_id.as_deref(), Some("job-1"));
    }

    #[test]
    fn test_percent_is_monotonic_within_job() {
        let store = ProgressStore::new();
        store.begin("job");
        store.update(40, "Archiving");
        store.update(20, "Late update");
        assert_eq!(store.current().percent, 40);
        assert_eq!(store.current().stage, "Late update");

        store.update(250, "Overflow");
        assert_eq!(store.current().percent, 100);
    }

    #[test]
    fn test_pause_marker_may_lower_percent() {
        let store = ProgressStore::new();
        store.begin("job");
        store.update(70, "Upload Pending");
        store.mark_paused(50);
        assert_eq!(store.current().percent, 50);
        assert_eq!(store.current().stage, "Paused");

        store.begin("next");
        assert_eq!(store.current().percent, 0);
    }

    #[test]
    fn test_early_pause_keeps_percent() {
        let store = ProgressStore::new();
        store.begin("job");
        store.update(20, "Dumping Database");
        store.mark_paused(50);
        assert_eq!(store.current().percent, 20);
        assert_eq!(store.current().stage, "Paused");
    }

    #[test]
    fn test_observers_see_every_update() {
        let store = ProgressStore::new();
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);
        store.subscribe(move |_| {
            seen_clone.fetch_add(1, Ordering::SeqCst);
        });

        store.begin("job");
        store.update(5, "Queued");
        store.update(10, "Preparing");
        assert_eq!(seen.load(Ordering::SeqCst), 3);
    }

    #[test]
    fn test_snapshot_file_is_readable() -> io::Result<()> {
        let dir = TempDir::new()?;
        let path = dir.path().join("progress.json");
        let store = ProgressStore::with_snapshot(&path);

        assert!(ProgressStore::read_snapshot(&path)?.is_none());
        store.begin("job");
        store.update_with(
            33,
            "Archiving",
            Some(ProgressCounters {
                items_processed: 1,
                items_total: 3,
                bytes_processed: 10,
                bytes_total: 30,
            }),
            None,
        );

        let snap = ProgressStore::read_snapshot(&path)?.unwrap();
        assert_eq!(snap.percent, 33);
        assert_eq!(snap.counters.unwrap().items_total, 3);
        Ok(())
    }
}
