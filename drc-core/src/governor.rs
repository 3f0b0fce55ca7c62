// ABOUTME: Local ordering primitives: a strict one-at-a-time serial queue and a flood governor.
// ABOUTME: The broker gives no ordering guarantees, so daemons impose their own with these.

use futures_util::FutureExt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

type Job = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Runs submitted async operations one at a time, in submission order.
///
/// Cloning yields another handle onto the same queue. The worker task stops
/// once every handle is dropped and the backlog has drained.
#[derive(Clone)]
pub struct SerialQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl SerialQueue {
    /// Create a queue. Must be called from within a tokio runtime.
    pub fn new() -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        tokio::spawn(async move {
            while let Some(job) = rx.recv().await {
                if AssertUnwindSafe(job).catch_unwind().await.is_err() {
                    tracing::error!("Serial queue operation panicked; continuing with next");
                }
            }
            tracing::trace!("Serial queue drained and closed");
        });
        Self { tx }
    }

    /// Enqueue `op`; the receiver yields its output once it has run.
    pub fn push<F, T>(&self, op: F) -> oneshot::Receiver<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = done_tx.send(op.await);
        });
        if self.tx.send(job).is_err() {
            tracing::warn!("Serial queue worker is gone; dropping operation");
        }
        done_rx
    }

    /// Enqueue `op` and wait for its output.
    pub async fn run<F, T>(&self, op: F) -> anyhow::Result<T>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        self.push(op)
            .await
            .map_err(|_| anyhow::anyhow!("Serial queue operation was dropped before completing"))
    }
}

impl Default for SerialQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of a [`FloodGovernor::run`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FloodReport {
    pub completed: usize,
    pub failed: usize,
    /// Operations never started because the governor was stopped.
    pub skipped: usize,
}

/// Runs operations strictly sequentially, spacing their starts by at least `delay`.
///
/// Used to stay under a remote service's rate limit, e.g. joining many chat
/// channels right after connecting.
#[derive(Debug, Clone)]
pub struct FloodGovernor {
    delay: Duration,
    stop: CancellationToken,
}

impl FloodGovernor {
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            stop: CancellationToken::new(),
        }
    }

    pub fn delay(&self) -> Duration {
        self.delay
    }

    /// Stop the current and any future run before the next operation starts.
    pub fn stop(&self) {
        self.stop.cancel();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_cancelled()
    }

    /// Run every operation in order. A failing operation is logged and the
    /// remainder still run.
    pub async fn run<I, F>(&self, ops: I) -> FloodReport
    where
        I: IntoIterator<Item = F>,
        F: Future<Output = anyhow::Result<()>>,
    {
        let mut report = FloodReport::default();
        let mut last_start: Option<Instant> = None;
        let mut ops = ops.into_iter().enumerate();

        while let Some((index, op)) = ops.next() {
            let stopped = match last_start {
                _ if self.stop.is_cancelled() => true,
                Some(prev) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(prev + self.delay) => false,
                        _ = self.stop.cancelled() => true,
                    }
                }
                None => false,
            };
            if stopped {
                report.skipped = 1 + ops.count();
                tracing::info!(skipped = report.skipped, "Flood governor stopped");
                break;
            }

            last_start = Some(Instant::now());
            match op.await {
                Ok(()) => report.completed += 1,
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(index, error = %e, "Flood-governed operation failed");
                }
            }
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[tokio::test]
    async fn test_serial_queue_runs_in_submission_order() {
        let queue = SerialQueue::new();
        let log = Arc::new(Mutex::new(Vec::new()));

        let mut waits = Vec::new();
        for i in 0..5u64 {
            let log = Arc::clone(&log);
            waits.push(queue.push(async move {
                log.lock().unwrap().push(format!("start {i}"));
                // Earlier jobs sleep longer; they still must finish first.
                tokio::time::sleep(Duration::from_millis(10 * (5 - i))).await;
                log.lock().unwrap().push(format!("end {i}"));
                i
            }));
        }
        for (i, wait) in waits.into_iter().enumerate() {
            assert_eq!(wait.await.unwrap(), i as u64);
        }

        let log = log.lock().unwrap();
        let expected: Vec<String> = (0..5)
            .flat_map(|i| [format!("start {i}"), format!("end {i}")])
            .collect();
        assert_eq!(*log, expected);
    }

    #[tokio::test]
    async fn test_serial_queue_survives_panicking_job() {
        let queue = SerialQueue::new();
        let failed = queue.push(async { panic!("boom") });
        assert!(failed.await.is_err());
        assert_eq!(queue.run(async { 5 }).await.unwrap(), 5);
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_governor_spacing_and_failures() {
        let governor = FloodGovernor::new(Duration::from_millis(500));
        let starts = Arc::new(Mutex::new(Vec::new()));

        let ops: Vec<_> = (0..4)
            .map(|i| {
                let starts = Arc::clone(&starts);
                async move {
                    starts.lock().unwrap().push(Instant::now());
                    if i == 1 {
                        anyhow::bail!("join #channel{i} refused");
                    }
                    Ok(())
                }
            })
            .collect();

        let report = governor.run(ops).await;
        assert_eq!(
            report,
            FloodReport {
                completed: 3,
                failed: 1,
                skipped: 0
            }
        );

        let starts = starts.lock().unwrap();
        assert_eq!(starts.len(), 4);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(500));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_flood_governor_stop() {
        let governor = FloodGovernor::new(Duration::from_secs(10));
        let stopper = governor.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(15)).await;
            stopper.stop();
        });

        let ops: Vec<_> = (0..5).map(|_| async { Ok(()) }).collect();
        let report = governor.run(ops).await;
        assert_eq!(report.completed, 2);
        assert_eq!(report.skipped, 3);
        assert!(governor.is_stopped());
    }
}
