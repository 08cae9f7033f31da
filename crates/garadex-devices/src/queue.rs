//! Single-concurrency command queue.
//!
//! Every outbound instruction and every poll request for a device passes
//! through one of these, so the physical device never sees overlapping
//! commands. Units run strictly FIFO, one at a time, with a minimum
//! interval between starts and a hard per-unit timeout.
//!
//! The queue is an explicit worker task: an unbounded pending list, a
//! single active slot, and a timer-based interval gate.

use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

/// Errors surfaced by [`CommandQueue::submit`].
#[derive(Debug, thiserror::Error)]
pub enum QueueError {
    /// The unit of work did not complete within the queue's hard bound.
    /// The busy flag still clears and the next unit proceeds normally.
    #[error("unit of work timed out after {0:?}")]
    Timeout(Duration),

    /// The queue worker has shut down.
    #[error("queue is closed")]
    Closed,
}

type Job = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Interval-throttled, timeout-bounded, concurrency-1 execution channel.
///
/// Dropping the queue stops the worker after the pending units drain from
/// the channel; [`CommandQueue::shutdown`] stops it immediately and fails
/// any unit still in flight with [`QueueError::Closed`].
pub struct CommandQueue {
    tx: mpsc::UnboundedSender<Job>,
    depth: Arc<AtomicUsize>,
    busy: Arc<AtomicBool>,
    timeout: Duration,
    worker: tokio::task::JoinHandle<()>,
}

impl CommandQueue {
    /// Create a queue with the given minimum start spacing and per-unit
    /// timeout, and spawn its worker task.
    pub fn new(interval: Duration, timeout: Duration) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let depth = Arc::new(AtomicUsize::new(0));
        let busy = Arc::new(AtomicBool::new(false));

        let worker_depth = depth.clone();
        let worker_busy = busy.clone();
        let worker = tokio::spawn(async move {
            let mut last_start: Option<Instant> = None;
            while let Some(job) = rx.recv().await {
                if let Some(prev) = last_start {
                    tokio::time::sleep_until(prev + interval).await;
                }
                last_start = Some(Instant::now());

                // A unit that overruns is abandoned, not awaited further;
                // its submitter observes the dropped result channel.
                let _ = tokio::time::timeout(timeout, job).await;

                if worker_depth.fetch_sub(1, Ordering::AcqRel) == 1 {
                    worker_busy.store(false, Ordering::Release);
                }
            }
        });

        Self {
            tx,
            depth,
            busy,
            timeout,
            worker,
        }
    }

    /// Stop the worker without draining. Pending and in-flight units fail
    /// with [`QueueError::Closed`], as do later submissions.
    pub fn shutdown(&self) {
        self.worker.abort();
    }

    /// Submit a unit of work and wait for its result.
    ///
    /// Units are accepted concurrently and ordered FIFO; completion is
    /// asynchronous. A unit that exceeds the queue timeout fails with
    /// [`QueueError::Timeout`].
    pub async fn submit<T, F>(&self, unit: F) -> Result<T, QueueError>
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (result_tx, result_rx) = oneshot::channel();
        let job: Job = Box::pin(async move {
            let _ = result_tx.send(unit.await);
        });

        self.depth.fetch_add(1, Ordering::AcqRel);
        self.busy.store(true, Ordering::Release);
        if self.tx.send(job).is_err() {
            if self.depth.fetch_sub(1, Ordering::AcqRel) == 1 {
                self.busy.store(false, Ordering::Release);
            }
            return Err(QueueError::Closed);
        }

        match result_rx.await {
            Ok(value) => Ok(value),
            // The worker drops a unit's result channel either because the
            // unit overran its timeout or because the worker itself went
            // away with the unit still owed a result.
            Err(_) if self.tx.is_closed() => Err(QueueError::Closed),
            Err(_) => Err(QueueError::Timeout(self.timeout)),
        }
    }

    /// Whether the queue currently holds or is draining a unit of work.
    /// Clears exactly when the queue returns to idle.
    pub fn busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    /// Number of units pending or running.
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::Mutex;

    #[tokio::test(start_paused = true)]
    async fn test_five_units_run_sequentially_spaced() {
        let queue = Arc::new(CommandQueue::new(
            Duration::from_millis(250),
            Duration::from_secs(10),
        ));
        let starts: Arc<Mutex<Vec<Instant>>> = Arc::new(Mutex::new(Vec::new()));
        let in_flight = Arc::new(AtomicUsize::new(0));
        let overlapped = Arc::new(AtomicBool::new(false));

        let mut handles = Vec::new();
        for i in 0..5usize {
            let queue = queue.clone();
            let starts = starts.clone();
            let in_flight = in_flight.clone();
            let overlapped = overlapped.clone();
            handles.push(tokio::spawn(async move {
                queue
                    .submit(async move {
                        if in_flight.fetch_add(1, Ordering::SeqCst) != 0 {
                            overlapped.store(true, Ordering::SeqCst);
                        }
                        starts.lock().await.push(Instant::now());
                        tokio::time::sleep(Duration::from_millis(50)).await;
                        in_flight.fetch_sub(1, Ordering::SeqCst);
                        i
                    })
                    .await
            }));
        }

        let mut results = Vec::new();
        for handle in handles {
            results.push(handle.await.unwrap().unwrap());
        }
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert!(!overlapped.load(Ordering::SeqCst));

        let starts = starts.lock().await;
        assert_eq!(starts.len(), 5);
        for pair in starts.windows(2) {
            assert!(pair[1] - pair[0] >= Duration::from_millis(250));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_unit_timeout_is_hard_failure() {
        let queue = CommandQueue::new(Duration::from_millis(250), Duration::from_secs(10));

        let result = queue
            .submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await;
        assert!(matches!(result, Err(QueueError::Timeout(_))));

        // The queue keeps working after a timeout.
        let value = queue.submit(async { 7 }).await.unwrap();
        assert_eq!(value, 7);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shutdown_fails_in_flight_unit_as_closed() {
        let queue = Arc::new(CommandQueue::new(
            Duration::from_millis(250),
            Duration::from_secs(10),
        ));

        let q = queue.clone();
        let handle = tokio::spawn(async move {
            q.submit(async {
                tokio::time::sleep(Duration::from_secs(60)).await;
            })
            .await
        });

        // Let the worker pick the unit up, then tear it down mid-flight.
        tokio::time::sleep(Duration::from_millis(10)).await;
        queue.shutdown();
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(handle.await.unwrap(), Err(QueueError::Closed)));

        // Later submissions fail the same way, not as a timeout.
        let late = queue.submit(async { 7 }).await;
        assert!(matches!(late, Err(QueueError::Closed)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_busy_flag_clears_at_idle() {
        let queue = Arc::new(CommandQueue::new(
            Duration::from_millis(250),
            Duration::from_secs(10),
        ));
        assert!(!queue.busy());

        let q = queue.clone();
        let handle = tokio::spawn(async move {
            q.submit(async {
                tokio::time::sleep(Duration::from_millis(100)).await;
            })
            .await
        });

        // Let the worker pick the unit up.
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(queue.busy());

        handle.await.unwrap().unwrap();
        assert!(!queue.busy());
        assert_eq!(queue.depth(), 0);
    }
}
