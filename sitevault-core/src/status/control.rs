//! Cooperative pause/cancel signalling.
//!
//! The flag is only looked at between stages. A cancel is cleared once a
//! job honours it; a pause stays set until someone resumes, so pollers
//! keep seeing the job as paused.

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use crate::utils::Interrupt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ControlFlag {
    None,
    PauseRequested,
    CancelRequested,
}

impl ControlFlag {
    fn from_u8(v: u8) -> Self {
        match v {
            1 => ControlFlag::PauseRequested,
            2 => ControlFlag::CancelRequested,
            _ => ControlFlag::None,
        }
    }

    fn as_u8(self) -> u8 {
        match self {
            ControlFlag::None => 0,
            ControlFlag::PauseRequested => 1,
            ControlFlag::CancelRequested => 2,
        }
    }
}

/// Requests accepted by the job control API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlAction {
    Pause,
    Resume,
    Cancel,
}

#[derive(Debug, Clone, Default)]
pub struct JobControl {
    flag: Arc<AtomicU8>,
}

impl JobControl {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn flag(&self) -> ControlFlag {
        ControlFlag::from_u8(self.flag.load(Ordering::SeqCst))
    }

    pub fn request_pause(&self) {
        self.set(ControlFlag::PauseRequested);
    }

    pub fn request_cancel(&self) {
        self.set(ControlFlag::CancelRequested);
    }

    /// Clears any pending request. Resuming means re-running the job.
    pub fn resume(&self) {
        self.set(ControlFlag::None);
    }

    pub fn apply(&self, action: ControlAction) {
        match action {
            ControlAction::Pause => self.request_pause(),
            ControlAction::Resume => self.resume(),
            ControlAction::Cancel => self.request_cancel(),
        }
    }

    /// Poll at a stage boundary.
    pub fn check(&self) -> Option<Interrupt> {
        match self.flag() {
            ControlFlag::None => None,
            ControlFlag::PauseRequested => Some(Interrupt::Paused),
            ControlFlag::CancelRequested => {
                // Only clear if nobody changed it in between
                let _ = self.flag.compare_exchange(
                    ControlFlag::CancelRequested.as_u8(),
                    ControlFlag::None.as_u8(),
                    Ordering::SeqCst,
                    Ordering::SeqCst,
                );
                Some(Interrupt::Cancelled)
            }
        }
    }

    fn set(&self, flag: ControlFlag) {
        self.flag.store(flag.as_u8(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_request_passes() {
        let control = JobControl::new();
        assert_eq!(control.check(), None);
        assert_eq!(control.flag(), ControlFlag::None);
    }

    #[test]
    fn test_cancel_is_cleared_when_honoured() {
        let control = JobControl::new();
        control.request_cancel();
        assert_eq!(control.check(), Some(Interrupt::Cancelled));
        assert_eq!(control.flag(), ControlFlag::None);
        assert_eq!(control.check(), None);
    }

    #[test]
    fn test_pause_stays_set_until_resume() {
        let control = JobControl::new();
        control.apply(ControlAction::Pause);
        assert_eq!(control.check(), Some(Interrupt::Paused));
        assert_eq!(control.check(), Some(Interrupt::Paused));

        control.apply(ControlAction::Resume);
        assert_eq!(control.check(), None);
    }

    #[test]
    fn test_clones_share_the_flag() {
        let control = JobControl::new();
        let remote = control.clone();
        remote.request_cancel();
        assert_eq!(control.flag(), ControlFlag::CancelRequested);
    }
}
