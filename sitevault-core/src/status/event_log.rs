//! Append-only structured event log.
//!
//! Every event is written as one JSON line to a daily file
//! (`events-YYYY-MM-DD.log`) and mirrored to `tracing`. Secret-looking
//! context fields are redacted before anything leaves the process.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs::{self, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::{Arc, Mutex};

const REDACTED: &str = "***redacted***";
const SECRET_KEYS: &[&str] = &["access_key", "secret_key", "authorization", "password", "token"];
const FILE_PREFIX: &str = "events-";
const FILE_SUFFIX: &str = ".log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

impl FromStr for LogLevel {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "debug" => Ok(LogLevel::Debug),
            "info" => Ok(LogLevel::Info),
            "warn" | "warning" => Ok(LogLevel::Warn),
            "error" => Ok(LogLevel::Error),
            other => Err(format!("unknown log level: {other}")),
        }
    }
}

/// One line of the event log.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogEntry {
    pub ts: DateTime<Utc>,
    pub level: LogLevel,
    pub event: String,
    #[serde(default)]
    pub context: Value,
}

/// Cloneable handle to the event log.
#[derive(Clone)]
pub struct EventLog {
    inner: Arc<Inner>,
}

struct Inner {
    dir: Option<PathBuf>,
    write_lock: Mutex<()>,
}

impl EventLog {
    /// Log into `dir`, creating it if needed.
    pub fn open(dir: impl Into<PathBuf>) -> io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            inner: Arc::new(Inner {
                dir: Some(dir),
                write_lock: Mutex::new(()),
            }),
        })
    }

    /// A log that only mirrors to `tracing`; `tail` always returns nothing.
    pub fn tracing_only() -> Self {
        Self {
            inner: Arc::new(Inner {
                dir: None,
                write_lock: Mutex::new(()),
            }),
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.inner.dir.as_deref()
    }

    pub fn debug(&self, event: &str, context: Value) {
        self.write(LogLevel::Debug, event, context);
    }

    pub fn info(&self, event: &str, context: Value) {
        self.write(LogLevel::Info, event, context);
    }

    pub fn warn(&self, event: &str, context: Value) {
        self.write(LogLevel::Warn, event, context);
    }

    pub fn error(&self, event: &str, context: Value) {
        self.write(LogLevel::Error, event, context);
    }

    pub fn write(&self, level: LogLevel, event: &str, context: Value) {
        let entry = LogEntry {
            ts: Utc::now(),
            level,
            event: event.to_string(),
            context: redact(context),
        };

        let context_str = entry.context.to_string();
        match level {
            LogLevel::Debug => tracing::debug!(event, context = %context_str),
            LogLevel::Info => tracing::info!(event, context = %context_str),
            LogLevel::Warn => tracing::warn!(event, context = %context_str),
            LogLevel::Error => tracing::error!(event, context = %context_str),
        }

        let Some(dir) = self.inner.dir.as_ref() else {
            return;
        };

        let line = match serde_json::to_string(&entry) {
            Ok(line) => line,
            Err(e) => {
                tracing::warn!("Failed to encode log entry {}: {}", event, e);
                return;
            }
        };

        let _guard = self
            .inner
            .write_lock
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        let path = dir.join(file_name_for(entry.ts));
        let result = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .and_then(|mut file| writeln!(file, "{line}"));
        if let Err(e) = result {
            tracing::warn!("Failed to append to event log {}: {}", path.display(), e);
        }
    }

    /// Last `lines` raw lines of today's log, or of the newest log file.
    pub fn tail(&self, lines: usize) -> Vec<String> {
        let Some(file) = self.latest_log_file() else {
            return Vec::new();
        };
        let content = match fs::read_to_string(&file) {
            Ok(c) => c,
            Err(e) => {
                tracing::warn!("Failed to read event log {}: {}", file.display(), e);
                return Vec::new();
            }
        };
        let all: Vec<&str> = content.lines().collect();
        let start = all.len().saturating_sub(lines);
        all[start..].iter().map(|l| l.to_string()).collect()
    }

    /// Like [`tail`](Self::tail) but keeps only lines at `level`.
    ///
    /// The window is taken first and filtered second, so fewer than
    /// `lines` entries may come back.
    pub fn tail_filtered(&self, lines: usize, level: Option<LogLevel>) -> Vec<String> {
        let rows = self.tail(lines.max(1));
        let Some(level) = level else {
            return rows;
        };
        rows.into_iter()
            .filter(|row| {
                serde_json::from_str::<LogEntry>(row)
                    .map(|entry| entry.level == level)
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Parsed variant of [`tail_filtered`](Self::tail_filtered); malformed lines are dropped.
    pub fn tail_entries(&self, lines: usize, level: Option<LogLevel>) -> Vec<LogEntry> {
        self.tail_filtered(lines, level)
            .iter()
            .filter_map(|row| serde_json::from_str(row).ok())
            .collect()
    }

    pub fn latest_log_file(&self) -> Option<PathBuf> {
        let dir = self.inner.dir.as_ref()?;
        let today = dir.join(file_name_for(Utc::now()));
        if today.exists() {
            return Some(today);
        }

        let mut candidates: Vec<PathBuf> = fs::read_dir(dir)
            .ok()?
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .map(|n| {
                        let n = n.to_string_lossy();
                        n.starts_with(FILE_PREFIX) && n.ends_with(FILE_SUFFIX)
                    })
                    .unwrap_or(false)
            })
            .collect();
        candidates.sort();
        candidates.pop()
    }
}

fn file_name_for(ts: DateTime<Utc>) -> String {
    format!("{}{}{}", FILE_PREFIX, ts.format("%Y-%m-%d"), FILE_SUFFIX)
}

/// Replace secret-looking fields at any depth.
pub fn redact(value: Value) -> Value {
    match value {
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| {
                    if SECRET_KEYS.iter().any(|s| s.eq_ignore_ascii_case(&k)) {
                        (k, Value::String(REDACTED.to_string()))
                    } else {
                        (k, redact(v))
                    }
                })
                .collect(),
        ),
        Value::Array(items) => Value::Array(items.into_iter().map(redact).collect()),
        other => other,
    }
}
