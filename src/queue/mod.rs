//! Delivery Trigger - deduplicated, delayed, retried task invocation.
//!
//! The outbox enqueues one task per envelope, keyed by the envelope UID and
//! aimed at `/outbox/{uid}`. A queue delivers each task to a [`TaskTarget`]
//! at least once, retrying failed deliveries, and treats a second enqueue of
//! a known UID as a successful no-op.

#[cfg(feature = "http")]
mod http;
mod in_memory;
mod worker;

use std::time::Duration;

use thiserror::Error;

#[cfg(feature = "http")]
pub use http::HttpTarget;
pub use in_memory::{InMemoryTaskQueue, QueueSettings};
pub use worker::{DeliveryStats, QueueWorker};

/// A unit of deferred work.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Task {
    /// Deduplication key.
    pub uid: String,
    /// Path of the callback, starting with `/`.
    pub target_path: String,
    pub payload: Vec<u8>,
    /// Delay before the first delivery.
    pub delay: Duration,
    /// Overrides the queue's attempt budget for this task.
    pub max_attempts: Option<u32>,
}

impl Task {
    pub fn new(uid: impl Into<String>, target_path: impl Into<String>) -> Self {
        Self {
            uid: uid.into(),
            target_path: target_path.into(),
            payload: Vec::new(),
            delay: Duration::ZERO,
            max_attempts: None,
        }
    }

    pub fn with_payload(mut self, payload: Vec<u8>) -> Self {
        self.payload = payload;
        self
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = Some(max_attempts);
        self
    }

    pub fn validate(&self) -> Result<(), QueueError> {
        if self.uid.is_empty() {
            return Err(QueueError::invalid(&self.uid, "empty uid"));
        }
        if !self.target_path.starts_with('/') {
            return Err(QueueError::invalid(
                &self.uid,
                format!("target path {:?} must start with '/'", self.target_path),
            ));
        }
        if self.max_attempts == Some(0) {
            return Err(QueueError::invalid(&self.uid, "max_attempts must be at least 1"));
        }
        Ok(())
    }
}

/// Where a delivery stands in its retry budget.
///
/// `attempt` is 1-based for a delivery in progress. Zero means unknown.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct AttemptInfo {
    pub attempt: u32,
    pub max_attempts: u32,
}

impl AttemptInfo {
    /// True when a failure now means the queue gives up on the task.
    pub fn is_last(&self) -> bool {
        self.max_attempts > 0 && self.attempt >= self.max_attempts
    }
}

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("invalid task {uid:?}: {reason}")]
    InvalidTask { uid: String, reason: String },

    #[error("task queue unavailable: {0}")]
    Unavailable(String),
}

impl QueueError {
    fn invalid(uid: &str, reason: impl Into<String>) -> Self {
        QueueError::InvalidTask {
            uid: uid.to_string(),
            reason: reason.into(),
        }
    }
}

/// A failed delivery; the queue will retry it if attempts remain.
#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("{path} rejected delivery: {reason}")]
    Rejected { path: String, reason: String },

    #[error("transport error delivering {path}: {reason}")]
    Transport { path: String, reason: String },
}

impl DeliveryError {
    pub fn rejected(path: impl Into<String>, reason: impl ToString) -> Self {
        DeliveryError::Rejected {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Accepts tasks for later delivery.
pub trait TaskQueue: Send + Sync {
    /// Submit a task. A UID already pending or seen within the dedup window
    /// is accepted without scheduling a second delivery.
    fn enqueue(&self, task: Task) -> Result<(), QueueError>;

    /// Attempt counters for the task currently being delivered under `uid`.
    fn attempt_info(&self, uid: &str) -> AttemptInfo;
}

/// Receives delivered tasks.
pub trait TaskTarget: Send + Sync {
    fn deliver(&self, task: &Task) -> Result<(), DeliveryError>;
}

impl<F> TaskTarget for F
where
    F: Fn(&Task) -> Result<(), DeliveryError> + Send + Sync,
{
    fn deliver(&self, task: &Task) -> Result<(), DeliveryError> {
        self(task)
    }
}

/// Queue that drops every task. Nothing is ever delivered.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoopTaskQueue;

impl TaskQueue for NoopTaskQueue {
    fn enqueue(&self, task: Task) -> Result<(), QueueError> {
        task.validate()?;
        tracing::debug!(uid = %task.uid, path = %task.target_path, "noop queue discarded task");
        Ok(())
    }

    fn attempt_info(&self, _uid: &str) -> AttemptInfo {
        AttemptInfo::default()
    }
}
