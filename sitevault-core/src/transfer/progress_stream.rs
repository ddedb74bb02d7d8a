//! Stream wrapper reporting bytes as they flow through.

use bytes::Bytes;
use futures_util::Stream;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tokio::time::{Duration, Instant};

/// Called with the cumulative byte count.
pub type ProgressCallback = Arc<dyn Fn(u64) + Send + Sync>;

/// Counts bytes of an `Ok(Bytes)` stream, reporting at most once per interval
/// and once more at the end.
pub struct ProgressStream<S> {
    inner: S,
    seen: u64,
    last_emit: Instant,
    interval: Duration,
    on_progress: ProgressCallback,
}

impl<S> ProgressStream<S> {
    pub fn new(inner: S, on_progress: ProgressCallback) -> Self {
        Self {
            inner,
            seen: 0,
            last_emit: Instant::now(),
            interval: Duration::from_millis(250),
            on_progress,
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    pub fn bytes_transferred(&self) -> u64 {
        self.seen
    }
}

impl<S, E> Stream for ProgressStream<S>
where
    S: Stream<Item = Result<Bytes, E>> + Unpin,
{
    type Item = Result<Bytes, E>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let polled = Pin::new(&mut self.inner).poll_next(cx);
        match &polled {
            Poll::Ready(Some(Ok(chunk))) => {
                self.seen += chunk.len() as u64;
                if self.last_emit.elapsed() >= self.interval {
                    (self.on_progress)(self.seen);
                    self.last_emit = Instant::now();
                }
            }
            Poll::Ready(None) => (self.on_progress)(self.seen),
            _ => {}
        }
        polled
    }
}
