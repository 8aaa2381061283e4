//! Background thread that keeps an [`InMemoryTaskQueue`] delivering.

use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use super::InMemoryTaskQueue;

/// Counters from task delivery.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct DeliveryStats {
    pub delivered: usize,
    pub retried: usize,
    pub dropped: usize,
    pub polls: usize,
}

impl DeliveryStats {
    pub fn merge(&mut self, other: &DeliveryStats) {
        self.delivered += other.delivered;
        self.retried += other.retried;
        self.dropped += other.dropped;
        self.polls += other.polls;
    }
}

/// Handle to a running queue worker.
///
/// ## Example
///
/// ```
/// use relay_outbox::queue::{InMemoryTaskQueue, Task, TaskQueue};
/// use std::time::Duration;
///
/// let queue = InMemoryTaskQueue::default();
/// let worker = queue.spawn_worker(Duration::from_millis(10));
/// queue.enqueue(Task::new("abc", "/outbox/abc")).unwrap();
///
/// let stats = worker.stop();
/// assert!(stats.polls >= 1);
/// ```
pub struct QueueWorker {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<DeliveryStats>>,
}

impl InMemoryTaskQueue {
    /// Spawn a thread that calls `run_pending` every `poll_interval`.
    pub fn spawn_worker(&self, poll_interval: Duration) -> QueueWorker {
        let (stop_tx, stop_rx) = channel();
        let queue = self.clone();

        let handle = thread::spawn(move || {
            let mut stats = DeliveryStats::default();
            loop {
                stats.merge(&queue.run_pending());

                match stop_rx.recv_timeout(poll_interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
            }
            tracing::debug!(delivered = stats.delivered, dropped = stats.dropped, "queue worker stopped");
            stats
        });

        QueueWorker {
            stop_tx,
            handle: Some(handle),
        }
    }
}

impl QueueWorker {
    /// Signal the worker to stop and wait for it to finish.
    pub fn stop(mut self) -> DeliveryStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => DeliveryStats::default(),
        }
    }

    /// Signal the worker to stop without waiting.
    pub fn signal_stop(&self) {
        let _ = self.stop_tx.send(());
    }
}

impl Drop for QueueWorker {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
