//! Reconciliation sweep for envelopes whose trigger never fired.
//!
//! A crash between commit and enqueue, or a trigger that ran out of
//! attempts, leaves an envelope with `Published = false` and nothing
//! scheduled for it. The sweep finds those and flushes their topics.

use std::collections::BTreeSet;
use std::sync::mpsc::{channel, RecvTimeoutError, Sender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use chrono::Utc;

use super::{Outbox, OutboxError};

/// Counters from sweeping.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepStats {
    pub sweeps: usize,
    pub topics_flushed: usize,
    pub published: usize,
    pub failures: usize,
}

impl SweepStats {
    fn merge(&mut self, other: &SweepStats) {
        self.sweeps += other.sweeps;
        self.topics_flushed += other.topics_flushed;
        self.published += other.published;
        self.failures += other.failures;
    }
}

pub struct Sweeper {
    outbox: Arc<Outbox>,
    grace: Duration,
}

impl Sweeper {
    /// Envelopes younger than `grace` are left to their own trigger.
    pub fn new(outbox: Arc<Outbox>, grace: Duration) -> Self {
        Self { outbox, grace }
    }

    /// One pass: flush every topic holding a stranded envelope.
    ///
    /// A topic that fails to flush is counted and skipped; the other topics
    /// are still flushed.
    pub fn sweep(&self) -> Result<SweepStats, OutboxError> {
        let mut stats = SweepStats {
            sweeps: 1,
            ..SweepStats::default()
        };

        let grace = chrono::Duration::from_std(self.grace).unwrap_or_else(|_| chrono::Duration::zero());
        let cutoff = Utc::now() - grace;
        let topics: BTreeSet<String> = self
            .outbox
            .all_pending()?
            .into_iter()
            .filter(|envelope| envelope.created_at <= cutoff)
            .map(|envelope| envelope.topic)
            .collect();

        for topic in topics {
            match self.outbox.flush(&topic) {
                Ok(report) => {
                    stats.topics_flushed += 1;
                    stats.published += report.count();
                }
                Err(err) => {
                    tracing::warn!(topic = %topic, error = %err, "sweep failed to flush topic");
                    stats.failures += 1;
                }
            }
        }

        if stats.published > 0 {
            tracing::info!(
                topics = stats.topics_flushed,
                published = stats.published,
                "sweep republished stranded envelopes"
            );
        }
        Ok(stats)
    }

    /// Run [`Sweeper::sweep`] on a background thread every `interval`.
    pub fn spawn(self, interval: Duration) -> SweeperThread {
        SweeperThread::spawn(self, interval)
    }
}

/// Handle to a running sweeper.
pub struct SweeperThread {
    stop_tx: Sender<()>,
    handle: Option<JoinHandle<SweepStats>>,
}

impl SweeperThread {
    pub fn spawn(sweeper: Sweeper, interval: Duration) -> Self {
        let (stop_tx, stop_rx) = channel();

        let handle = thread::spawn(move || {
            let mut stats = SweepStats::default();
            loop {
                match stop_rx.recv_timeout(interval) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }

                match sweeper.sweep() {
                    Ok(round) => stats.merge(&round),
                    Err(err) => {
                        tracing::error!(error = %err, "sweep failed");
                        stats.sweeps += 1;
                        stats.failures += 1;
                    }
                }
            }
            stats
        });

        Self {
            stop_tx,
            handle: Some(handle),
        }
    }

    /// Signal the sweeper to stop and wait for it to finish.
    pub fn stop(mut self) -> SweepStats {
        let _ = self.stop_tx.send(());
        match self.handle.take() {
            Some(handle) => handle.join().unwrap_or_default(),
            None => SweepStats::default(),
        }
    }
}

impl Drop for SweeperThread {
    fn drop(&mut self) {
        let _ = self.stop_tx.send(());
    }
}
