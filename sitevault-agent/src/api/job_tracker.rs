//! Single-job lock shared by the API and shutdown handling.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RunningJob {
    pub operation: String,
    pub started_at: DateTime<Utc>,
}

/// At most one job runs at a time; a second start is refused.
#[derive(Clone, Default)]
pub struct JobTracker {
    slot: Arc<Mutex<Option<RunningJob>>>,
}

/// Holds the lock for a running job; dropping it frees the slot.
#[must_use]
#[derive(Debug)]
pub struct JobGuard {
    slot: Arc<Mutex<Option<RunningJob>>>,
}

impl JobTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Claim the slot for `operation`, or return the job holding it.
    pub fn try_begin(&self, operation: &str) -> Result<JobGuard, RunningJob> {
        let mut slot = self.slot.lock().unwrap_or_else(|p| p.into_inner());
        if let Some(running) = slot.as_ref() {
            return Err(running.clone());
        }
        *slot = Some(RunningJob {
            operation: operation.to_string(),
            started_at: Utc::now(),
        });
        Ok(JobGuard {
            slot: self.slot.clone(),
        })
    }

    pub fn current(&self) -> Option<RunningJob> {
        self.slot.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn is_busy(&self) -> bool {
        self.current().is_some()
    }
}

impl Drop for JobGuard {
    fn drop(&mut self) {
        *self.slot.lock().unwrap_or_else(|p| p.into_inner()) = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_job_is_refused() {
        let tracker = JobTracker::new();
        let guard = tracker.try_begin("backup").unwrap();

        let running = tracker.try_begin("restore").unwrap_err();
        assert_eq!(running.operation, "backup");
        assert!(tracker.is_busy());

        drop(guard);
        assert!(!tracker.is_busy());
        assert!(tracker.try_begin("restore").is_ok());
    }

    #[test]
    fn test_clones_share_the_slot() {
        let tracker = JobTracker::new();
        let other = tracker.clone();
        let _guard = tracker.try_begin("migrate").unwrap();
        assert_eq!(other.current().map(|j| j.operation), Some("migrate".to_string()));
    }
}
