//! Outbox Publisher - durable intent first, asynchronous delivery after.
//!
//! ```text
//! business transaction ──► Outbox::publish(tx, topic, event)
//!                             ├─ tx.put(Envelope)          (commits with the caller)
//!                             └─ queue.enqueue(/outbox/uid) (best effort)
//!
//! task fires ──► Outbox::handle_trigger(uid) ──► Outbox::flush(topic)
//!                                                 for each unpublished envelope, oldest first:
//!                                                   bus.publish(envelope)  then  mark Published
//!
//! Sweeper ──► unpublished envelopes older than a grace period ──► flush their topics
//! ```
//!
//! Delivery is at least once. A crash between publishing and marking sends
//! the envelope again on the next flush.

mod callback;
mod sweeper;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::bus::{Message, PublishError, Publisher};
use crate::envelope::{DomainEvent, Envelope, EnvelopeError};
use crate::queue::{Task, TaskQueue};
use crate::store::{Direction, FilterOp, Query, Store, StoreError, StoreExt, Tx};

pub use callback::OutboxCallback;
pub use sweeper::{SweepStats, Sweeper, SweeperThread};

/// Route prefix the delivery trigger calls back on.
pub const TRIGGER_PATH_PREFIX: &str = "/outbox/";

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Envelope(#[from] EnvelopeError),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// The bus refused an envelope. Envelopes published before it in the
    /// same flush stay marked.
    #[error("failed to publish envelope {uid} after {published} published: {source}")]
    Publish {
        uid: String,
        published: usize,
        #[source]
        source: PublishError,
    },

    #[error("topic must not be empty")]
    EmptyTopic,

    /// The triggered envelope is not visible yet. Its transaction may still
    /// be running, so the trigger should be delivered again.
    #[error("envelope {uid} not found on attempt {attempt} of {max_attempts}")]
    EnvelopeNotVisible {
        uid: String,
        attempt: u32,
        max_attempts: u32,
    },
}

#[derive(Clone, Debug)]
pub struct OutboxSettings {
    /// Delay before the first trigger delivery, so the caller's own response
    /// completes first.
    pub trigger_delay: Duration,
    /// Upper bound on envelopes sent by one flush. `None` sends all.
    pub flush_limit: Option<usize>,
}

impl Default for OutboxSettings {
    fn default() -> Self {
        Self {
            trigger_delay: Duration::from_secs(3),
            flush_limit: None,
        }
    }
}

/// Envelopes one flush delivered.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FlushReport {
    pub topic: String,
    /// UIDs published, in publish order.
    pub published: Vec<String>,
}

impl FlushReport {
    fn new(topic: &str) -> Self {
        Self {
            topic: topic.to_string(),
            published: Vec::new(),
        }
    }

    pub fn count(&self) -> usize {
        self.published.len()
    }
}

/// The transactional outbox.
pub struct Outbox {
    store: Arc<dyn Store>,
    bus: Arc<dyn Publisher>,
    queue: Arc<dyn TaskQueue>,
    settings: OutboxSettings,
}

impl Outbox {
    pub fn new(store: Arc<dyn Store>, bus: Arc<dyn Publisher>, queue: Arc<dyn TaskQueue>) -> Self {
        Self {
            store,
            bus,
            queue,
            settings: OutboxSettings::default(),
        }
    }

    pub fn with_settings(mut self, settings: OutboxSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn settings(&self) -> &OutboxSettings {
        &self.settings
    }

    pub fn store(&self) -> &Arc<dyn Store> {
        &self.store
    }

    /// Record `event` for `topic` inside the caller's transaction.
    ///
    /// The envelope commits or rolls back together with whatever else `tx`
    /// writes. Scheduling the trigger is best effort: a failure is logged and
    /// the sweep picks the envelope up later.
    ///
    /// ```
    /// use relay_outbox::bus::InMemoryBus;
    /// use relay_outbox::queue::NoopTaskQueue;
    /// use relay_outbox::store::{InMemoryStore, StoreExt};
    /// use relay_outbox::{DomainEvent, Outbox, OutboxError};
    /// use serde::Serialize;
    /// use std::sync::Arc;
    ///
    /// #[derive(Serialize)]
    /// struct BasketCreated { uid: String }
    ///
    /// impl DomainEvent for BasketCreated {
    ///     const EVENT_TYPE_NAME: &'static str = "basket.created";
    ///     fn aggregate_name(&self) -> String { self.uid.clone() }
    /// }
    ///
    /// let store = Arc::new(InMemoryStore::new());
    /// let bus = Arc::new(InMemoryBus::new());
    /// let outbox = Outbox::new(store.clone(), bus.clone(), Arc::new(NoopTaskQueue));
    ///
    /// store
    ///     .transaction(|tx| -> Result<(), OutboxError> {
    ///         outbox.publish(tx, "basket", &BasketCreated { uid: "123".into() })?;
    ///         Ok(())
    ///     })
    ///     .unwrap();
    ///
    /// let report = outbox.flush("basket").unwrap();
    /// assert_eq!(report.count(), 1);
    /// assert_eq!(bus.len(), 1);
    /// ```
    pub fn publish<E: DomainEvent>(
        &self,
        tx: &mut Tx<'_>,
        topic: &str,
        event: &E,
    ) -> Result<Envelope, OutboxError> {
        if topic.is_empty() {
            return Err(OutboxError::EmptyTopic);
        }

        let envelope = Envelope::wrap(topic, event)?;
        tx.put(&envelope.uid, &envelope)?;

        let task = Task::new(
            envelope.uid.clone(),
            format!("{}{}", TRIGGER_PATH_PREFIX, envelope.uid),
        )
        .with_delay(self.settings.trigger_delay);
        if let Err(err) = self.queue.enqueue(task) {
            tracing::warn!(
                uid = %envelope.uid,
                topic = %topic,
                error = %err,
                "failed to schedule outbox trigger, leaving envelope for the sweep"
            );
        }

        tracing::debug!(
            uid = %envelope.uid,
            topic = %topic,
            event_type = %envelope.event_type_name,
            aggregate = %envelope.aggregate_uid,
            "envelope recorded"
        );
        Ok(envelope)
    }

    /// Unpublished envelopes of `topic`, oldest first.
    pub fn pending(&self, topic: &str) -> Result<Vec<Envelope>, OutboxError> {
        let mut query = Query::new()
            .filter(Envelope::FIELD_PUBLISHED, FilterOp::Eq, false)
            .filter(Envelope::FIELD_TOPIC, FilterOp::Eq, topic)
            .order_by(Envelope::FIELD_CREATED_AT, Direction::Asc);
        if let Some(limit) = self.settings.flush_limit {
            query = query.limit(limit);
        }
        Ok(self.store.query::<Envelope>(&query)?)
    }

    /// Every unpublished envelope, oldest first.
    pub fn all_pending(&self) -> Result<Vec<Envelope>, OutboxError> {
        let query = Query::new()
            .filter(Envelope::FIELD_PUBLISHED, FilterOp::Eq, false)
            .order_by(Envelope::FIELD_CREATED_AT, Direction::Asc);
        Ok(self.store.query::<Envelope>(&query)?)
    }

    /// Send every unpublished envelope of `topic` to the bus, oldest first,
    /// marking each one published after the bus accepts it.
    ///
    /// No transaction is held open while the bus is called. On a bus failure
    /// the flush stops; envelopes already sent stay marked and the rest wait
    /// for the next trigger or sweep.
    pub fn flush(&self, topic: &str) -> Result<FlushReport, OutboxError> {
        let pending = self.pending(topic)?;
        let mut report = FlushReport::new(topic);

        for envelope in pending {
            let message = message_for(&envelope)?;
            if let Err(source) = self.bus.publish(message) {
                tracing::warn!(
                    uid = %envelope.uid,
                    topic = %topic,
                    published = report.count(),
                    error = %source,
                    "bus rejected envelope, stopping flush"
                );
                return Err(OutboxError::Publish {
                    uid: envelope.uid,
                    published: report.count(),
                    source,
                });
            }

            self.mark_published(&envelope.uid)?;
            report.published.push(envelope.uid);
        }

        if report.count() > 0 {
            tracing::info!(topic = %topic, published = report.count(), "outbox flushed");
        }
        Ok(report)
    }

    fn mark_published(&self, uid: &str) -> Result<(), OutboxError> {
        self.store.transaction(|tx| -> Result<(), StoreError> {
            let mut envelope = tx.require::<Envelope>(uid)?;
            if envelope.published {
                return Ok(());
            }
            envelope.published = true;
            tx.put(uid, &envelope)
        })?;
        Ok(())
    }

    /// Handle a trigger for envelope `uid`.
    ///
    /// The envelope's whole topic is flushed. A missing envelope either
    /// belongs to a transaction that has not committed yet (a long transaction
    /// or one retrying on conflict) or to one that rolled back. While the
    /// queue has attempts left this returns
    /// [`OutboxError::EnvelopeNotVisible`] so the trigger is delivered again.
    /// On the last attempt, or when the queue cannot tell, it is a no-op
    /// returning `Ok(None)`.
    pub fn handle_trigger(&self, uid: &str) -> Result<Option<FlushReport>, OutboxError> {
        let Some(envelope) = self.store.get::<Envelope>(uid)? else {
            let attempt = self.queue.attempt_info(uid);
            if attempt.max_attempts == 0 || attempt.is_last() {
                tracing::debug!(uid = %uid, attempt = attempt.attempt, "trigger for unknown envelope ignored");
                return Ok(None);
            }
            tracing::debug!(
                uid = %uid,
                attempt = attempt.attempt,
                max_attempts = attempt.max_attempts,
                "triggered envelope not visible yet"
            );
            return Err(OutboxError::EnvelopeNotVisible {
                uid: uid.to_string(),
                attempt: attempt.attempt,
                max_attempts: attempt.max_attempts,
            });
        };

        match self.flush(&envelope.topic) {
            Ok(report) => Ok(Some(report)),
            Err(err) => {
                let attempt = self.queue.attempt_info(uid);
                if attempt.is_last() {
                    tracing::error!(
                        uid = %uid,
                        topic = %envelope.topic,
                        attempt = attempt.attempt,
                        error = %err,
                        "outbox flush failed on final trigger attempt, leaving envelope for the sweep"
                    );
                } else {
                    tracing::warn!(
                        uid = %uid,
                        topic = %envelope.topic,
                        attempt = attempt.attempt,
                        max_attempts = attempt.max_attempts,
                        error = %err,
                        "outbox flush failed"
                    );
                }
                Err(err)
            }
        }
    }
}

fn message_for(envelope: &Envelope) -> Result<Message, OutboxError> {
    Ok(Message::new(&envelope.uid, &envelope.topic, envelope.to_bytes()?)
        .with_attribute("event_type", &envelope.event_type_name)
        .with_attribute("aggregate_uid", &envelope.aggregate_uid))
}
