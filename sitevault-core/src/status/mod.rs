//! Logging, progress and job control shared by the managers.

pub mod control;
pub mod event_log;
pub mod progress;

pub use control::{ControlAction, ControlFlag, JobControl};
pub use event_log::{EventLog, LogEntry, LogLevel};
pub use progress::{PhaseRange, ProgressCounters, ProgressRecord, ProgressStore};

use serde_json::json;

use crate::utils::{Error, Interrupt, Result};

/// Progress shown while a job sits paused, unless it had not got that far.
pub const PAUSED_PERCENT: u8 = 50;

/// Everything a running job reports into and is steered by.
#[derive(Clone)]
pub struct JobContext {
    pub log: EventLog,
    pub progress: ProgressStore,
    pub control: JobControl,
}

impl JobContext {
    pub fn new(log: EventLog, progress: ProgressStore, control: JobControl) -> Self {
        Self {
            log,
            progress,
            control,
        }
    }

    /// Context with no log directory, fresh progress and control.
    pub fn detached() -> Self {
        Self::new(EventLog::tracing_only(), ProgressStore::new(), JobControl::new())
    }

    /// Stage-boundary job control check.
    pub fn checkpoint(&self) -> Result<()> {
        match self.control.check() {
            None => Ok(()),
            Some(Interrupt::Cancelled) => {
                self.log.info("job_cancelled", json!({}));
                Err(Error::Interrupted(Interrupt::Cancelled))
            }
            Some(Interrupt::Paused) => {
                self.log.info("job_paused", json!({}));
                self.progress.mark_paused(PAUSED_PERCENT);
                Err(Error::Interrupted(Interrupt::Paused))
            }
        }
    }

    /// Record the terminal state of a failed or interrupted job.
    pub fn report_failure(&self, event: &str, err: &Error) {
        match err {
            Error::Interrupted(Interrupt::Paused) => {}
            Error::Interrupted(Interrupt::Cancelled) => {
                self.progress.fail("Cancelled");
            }
            other => {
                self.log.error(
                    event,
                    json!({ "kind": other.kind(), "message": other.to_string() }),
                );
                self.progress.fail(&other.to_string());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_checkpoint_pause_marks_progress() {
        let ctx = JobContext::detached();
        ctx.progress.begin("job");
        ctx.progress.update(70, "Upload Pending");
        ctx.control.request_pause();

        let err = ctx.checkpoint().unwrap_err();
        assert!(err.is_interrupt());
        assert_eq!(ctx.progress.current().percent, PAUSED_PERCENT);
        assert_eq!(ctx.progress.current().stage, "Paused");
        assert_eq!(ctx.control.flag(), ControlFlag::PauseRequested);
    }

    #[test]
    fn test_pause_before_marker_does_not_raise_percent() {
        let ctx = JobContext::detached();
        ctx.progress.begin("job");
        ctx.progress.update(10, "Preparing");
        ctx.control.request_pause();

        assert!(ctx.checkpoint().unwrap_err().is_interrupt());
        assert_eq!(ctx.progress.current().percent, 10);
        assert_eq!(ctx.progress.current().stage, "Paused");
    }

    #[test]
    fn test_checkpoint_cancel_clears_flag() {
        let ctx = JobContext::detached();
        ctx.control.request_cancel();
        assert!(matches!(
            ctx.checkpoint(),
            Err(Error::Interrupted(Interrupt::Cancelled))
        ));
        assert!(ctx.checkpoint().is_ok());
    }
}
