//! In-process task queue with deduplication, delay, and retry.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::time::{Duration, Instant};

use super::worker::DeliveryStats;
use super::{AttemptInfo, QueueError, Task, TaskQueue, TaskTarget};
use crate::store::RetryPolicy;

#[derive(Clone, Debug)]
pub struct QueueSettings {
    /// How long a delivered UID keeps suppressing new enqueues.
    pub dedup_window: Duration,
    /// Attempt budget and backoff between failed deliveries.
    pub retry: RetryPolicy,
}

impl Default for QueueSettings {
    fn default() -> Self {
        Self {
            dedup_window: Duration::from_secs(60 * 60),
            retry: RetryPolicy {
                max_attempts: 5,
                initial_delay: Duration::from_millis(100),
                max_delay: Duration::from_secs(10),
                multiplier: 2.0,
                jitter: Duration::from_millis(50),
            },
        }
    }
}

struct Pending {
    task: Task,
    due: Instant,
    /// Deliveries already attempted.
    attempts: u32,
}

#[derive(Default)]
struct QueueState {
    pending: BTreeMap<String, Pending>,
    seen: HashMap<String, Instant>,
    in_progress: HashMap<String, AttemptInfo>,
}

struct Inner {
    state: Mutex<QueueState>,
    target: RwLock<Option<Arc<dyn TaskTarget>>>,
    settings: QueueSettings,
}

/// Task queue that lives in this process.
///
/// Delivery happens when [`InMemoryTaskQueue::run_pending`] is called, either
/// directly or from a [`super::QueueWorker`]. The target is bound after
/// construction so it may hold a reference back to whatever enqueues tasks.
/// Clone-friendly via Arc.
#[derive(Clone)]
pub struct InMemoryTaskQueue {
    inner: Arc<Inner>,
}

impl Default for InMemoryTaskQueue {
    fn default() -> Self {
        Self::new(QueueSettings::default())
    }
}

impl InMemoryTaskQueue {
    pub fn new(settings: QueueSettings) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(QueueState::default()),
                target: RwLock::new(None),
                settings,
            }),
        }
    }

    pub fn settings(&self) -> &QueueSettings {
        &self.inner.settings
    }

    /// Bind the target that receives deliveries, replacing any previous one.
    pub fn set_target(&self, target: Arc<dyn TaskTarget>) -> Result<(), QueueError> {
        let mut slot = self
            .inner
            .target
            .write()
            .map_err(|_| QueueError::Unavailable("target lock poisoned".into()))?;
        *slot = Some(target);
        Ok(())
    }

    /// Number of tasks waiting for delivery, due or not.
    pub fn pending_len(&self) -> usize {
        self.lock().map(|state| state.pending.len()).unwrap_or(0)
    }

    /// UIDs waiting for delivery.
    pub fn pending_uids(&self) -> Vec<String> {
        self.lock()
            .map(|state| state.pending.keys().cloned().collect())
            .unwrap_or_default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, QueueState>, QueueError> {
        self.inner
            .state
            .lock()
            .map_err(|_| QueueError::Unavailable("queue state lock poisoned".into()))
    }

    fn max_attempts(&self, task: &Task) -> u32 {
        task.max_attempts
            .unwrap_or(self.inner.settings.retry.max_attempts)
            .max(1)
    }

    /// Deliver every task that is due now, once.
    ///
    /// Failed tasks are rescheduled with backoff until their attempt budget
    /// is spent, then dropped.
    pub fn run_pending(&self) -> DeliveryStats {
        let mut stats = DeliveryStats {
            polls: 1,
            ..DeliveryStats::default()
        };

        let target = match self.inner.target.read() {
            Ok(slot) => slot.clone(),
            Err(_) => {
                tracing::error!("task queue target lock poisoned");
                return stats;
            }
        };
        let Some(target) = target else {
            tracing::warn!(pending = self.pending_len(), "task queue has no target bound");
            return stats;
        };

        let due = match self.take_due(Instant::now()) {
            Ok(due) => due,
            Err(err) => {
                tracing::error!(error = %err, "failed to collect due tasks");
                return stats;
            }
        };

        for mut pending in due {
            let uid = pending.task.uid.clone();
            let info = AttemptInfo {
                attempt: pending.attempts + 1,
                max_attempts: self.max_attempts(&pending.task),
            };
            if let Ok(mut state) = self.lock() {
                state.in_progress.insert(uid.clone(), info);
            }

            let result = target.deliver(&pending.task);

            let Ok(mut state) = self.lock() else {
                tracing::error!(uid = %uid, "queue state lock poisoned after delivery");
                continue;
            };
            state.in_progress.remove(&uid);
            match result {
                Ok(()) => {
                    tracing::debug!(uid = %uid, attempt = info.attempt, "task delivered");
                    stats.delivered += 1;
                }
                Err(err) if info.is_last() => {
                    tracing::error!(
                        uid = %uid,
                        attempt = info.attempt,
                        error = %err,
                        "task delivery failed on last attempt, dropping"
                    );
                    stats.dropped += 1;
                }
                Err(err) => {
                    let backoff = self.inner.settings.retry.delay_after(info.attempt);
                    tracing::warn!(
                        uid = %uid,
                        attempt = info.attempt,
                        max_attempts = info.max_attempts,
                        error = %err,
                        ?backoff,
                        "task delivery failed, will retry"
                    );
                    pending.attempts = info.attempt;
                    pending.due = Instant::now() + backoff;
                    state.pending.insert(uid, pending);
                    stats.retried += 1;
                }
            }
        }

        stats
    }

    /// Call [`Self::run_pending`] until no task is due.
    ///
    /// Tasks scheduled in the future are left alone.
    pub fn drain(&self) -> DeliveryStats {
        let mut total = DeliveryStats::default();
        loop {
            let round = self.run_pending();
            let progressed = round.delivered + round.retried + round.dropped > 0;
            total.merge(&round);
            if !progressed {
                return total;
            }
        }
    }

    fn take_due(&self, now: Instant) -> Result<Vec<Pending>, QueueError> {
        let mut state = self.lock()?;
        let mut due_uids: Vec<(Instant, String)> = state
            .pending
            .iter()
            .filter(|(_, pending)| pending.due <= now)
            .map(|(uid, pending)| (pending.due, uid.clone()))
            .collect();
        due_uids.sort();

        Ok(due_uids
            .into_iter()
            .filter_map(|(_, uid)| state.pending.remove(&uid))
            .collect())
    }
}

impl TaskQueue for InMemoryTaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        task.validate()?;

        let now = Instant::now();
        let window = self.inner.settings.dedup_window;
        let mut state = self.lock()?;
        state
            .seen
            .retain(|_, first_seen| now.saturating_duration_since(*first_seen) < window);

        if state.pending.contains_key(&task.uid) || state.seen.contains_key(&task.uid) {
            tracing::debug!(uid = %task.uid, "duplicate task ignored");
            return Ok(());
        }

        tracing::debug!(uid = %task.uid, path = %task.target_path, delay = ?task.delay, "task enqueued");
        state.seen.insert(task.uid.clone(), now);
        let due = now + task.delay;
        state.pending.insert(
            task.uid.clone(),
            Pending {
                task,
                due,
                attempts: 0,
            },
        );
        Ok(())
    }

    fn attempt_info(&self, uid: &str) -> AttemptInfo {
        let Ok(state) = self.lock() else {
            return AttemptInfo::default();
        };
        if let Some(info) = state.in_progress.get(uid) {
            return *info;
        }
        state
            .pending
            .get(uid)
            .map(|pending| AttemptInfo {
                attempt: pending.attempts,
                max_attempts: self.max_attempts(&pending.task),
            })
            .unwrap_or_default()
    }
}
