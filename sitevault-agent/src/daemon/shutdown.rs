//! Graceful shutdown handling for SIGTERM and SIGINT.
//!
//! A running job is asked to cancel and given a grace period to reach its
//! next stage boundary before the process exits.

use std::time::Duration;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::api::JobTracker;
use sitevault_core::status::JobControl;

const POLL_INTERVAL: Duration = Duration::from_millis(200);

pub struct ShutdownCoordinator {
    token: CancellationToken,
    grace: Duration,
}

impl ShutdownCoordinator {
    pub fn new(grace: Duration) -> Self {
        Self {
            token: CancellationToken::new(),
            grace,
        }
    }

    /// Cancelled once [`trigger`](Self::trigger) is called.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Wait for SIGTERM or SIGINT.
    pub async fn wait_for_signal(&self) {
        let ctrl_c = async {
            if let Err(e) = signal::ctrl_c().await {
                warn!("Failed to listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        };

        #[cfg(unix)]
        let terminate = async {
            match signal::unix::signal(signal::unix::SignalKind::terminate()) {
                Ok(mut stream) => {
                    stream.recv().await;
                }
                Err(e) => {
                    warn!("Failed to install SIGTERM handler: {}", e);
                    std::future::pending::<()>().await;
                }
            }
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                info!("Received SIGINT (Ctrl+C), initiating graceful shutdown...");
            }
            _ = terminate => {
                info!("Received SIGTERM, initiating graceful shutdown...");
            }
        }
    }

    pub fn trigger(&self) {
        self.token.cancel();
    }

    /// Cancel the running job, if any, and wait for it to stop.
    /// Returns `false` if it was still running when the grace period ran out.
    pub async fn drain(&self, jobs: &JobTracker, control: &JobControl) -> bool {
        let Some(running) = jobs.current() else {
            return true;
        };
        info!("Cancelling running {} job before exit", running.operation);
        control.request_cancel();

        let deadline = tokio::time::Instant::now() + self.grace;
        while tokio::time::Instant::now() < deadline {
            if !jobs.is_busy() {
                info!("Graceful shutdown complete");
                return true;
            }
            tokio::time::sleep(POLL_INTERVAL).await;
        }
        warn!(
            "{} job did not stop within {:?}, exiting anyway",
            running.operation, self.grace
        );
        false
    }
}

impl Default for ShutdownCoordinator {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_trigger_cancels_token() {
        let coordinator = ShutdownCoordinator::default();
        let token = coordinator.token();

        let handle = tokio::spawn(async move {
            token.cancelled().await;
        });

        coordinator.trigger();
        handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_drain_without_job_returns_immediately() {
        let coordinator = ShutdownCoordinator::new(Duration::from_millis(10));
        let control = JobControl::new();
        assert!(coordinator.drain(&JobTracker::new(), &control).await);
        assert_eq!(control.flag(), sitevault_core::status::ControlFlag::None);
    }

    #[tokio::test]
    async fn test_drain_cancels_and_waits_for_job() {
        let coordinator = ShutdownCoordinator::new(Duration::from_secs(5));
        let jobs = JobTracker::new();
        let control = JobControl::new();
        let guard = jobs.try_begin("backup").unwrap();

        let watcher = control.clone();
        tokio::spawn(async move {
            while watcher.check().is_none() {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
            drop(guard);
        });

        assert!(coordinator.drain(&jobs, &control).await);
        assert!(!jobs.is_busy());
    }
}
