//! In-memory bus for tests and single-process deployments.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::{Duration, Instant};

use super::{Message, PublishError, Publisher, Subscriber};

fn poisoned<T>(_: PoisonError<T>) -> PublishError {
    PublishError::ConnectionFailed("in-memory bus lock poisoned".into())
}

/// Append-only, thread-safe message log.
///
/// Cloning shares the log. Consumers read through [`InMemoryBus::subscribe`],
/// each subscription keeping its own position.
///
/// ## Example
///
/// ```
/// use relay_outbox::bus::{InMemoryBus, Message, Publisher, Subscriber};
///
/// let bus = InMemoryBus::new();
/// let basket = bus.subscribe("basket");
///
/// bus.publish(Message::new("m-1", "basket", b"{}".to_vec())).unwrap();
/// bus.publish(Message::new("m-2", "payment", b"{}".to_vec())).unwrap();
///
/// assert_eq!(bus.len(), 2);
/// assert_eq!(basket.poll(10).unwrap().unwrap().id, "m-1");
/// assert!(basket.poll(10).unwrap().is_none());
/// ```
#[derive(Clone, Default)]
pub struct InMemoryBus {
    log: Arc<RwLock<Vec<Message>>>,
}

impl InMemoryBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// All messages in publish order.
    pub fn messages(&self) -> Vec<Message> {
        self.log
            .read()
            .map(|log| log.clone())
            .unwrap_or_default()
    }

    /// Messages published on `topic`, in publish order.
    pub fn messages_for(&self, topic: &str) -> Vec<Message> {
        self.log
            .read()
            .map(|log| log.iter().filter(|m| m.topic == topic).cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.log.read().map(|log| log.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Independent consumer of one topic, starting at the beginning of the log.
    pub fn subscribe(&self, topic: impl Into<String>) -> BusSubscription {
        BusSubscription::new(Arc::clone(&self.log), Some(topic.into()))
    }

    /// Independent consumer of every topic.
    pub fn subscribe_all(&self) -> BusSubscription {
        BusSubscription::new(Arc::clone(&self.log), None)
    }
}

impl Publisher for InMemoryBus {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        tracing::debug!(id = %message.id, topic = %message.topic, "bus publish");
        self.log.write().map_err(poisoned)?.push(message);
        Ok(())
    }

    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        self.log.write().map_err(poisoned)?.extend(messages);
        Ok(())
    }
}

/// A reader over an [`InMemoryBus`] with its own position.
///
/// Polled messages stay in flight until acked. A nack puts the message back
/// so the next poll returns it again.
pub struct BusSubscription {
    log: Arc<RwLock<Vec<Message>>>,
    topic: Option<String>,
    position: Mutex<usize>,
    redeliver: Mutex<VecDeque<Message>>,
    in_flight: Mutex<HashMap<String, Message>>,
    acked: Mutex<Vec<String>>,
}

impl BusSubscription {
    fn new(log: Arc<RwLock<Vec<Message>>>, topic: Option<String>) -> Self {
        Self {
            log,
            topic,
            position: Mutex::new(0),
            redeliver: Mutex::new(VecDeque::new()),
            in_flight: Mutex::new(HashMap::new()),
            acked: Mutex::new(Vec::new()),
        }
    }

    pub fn topic(&self) -> Option<&str> {
        self.topic.as_deref()
    }

    /// IDs acknowledged so far.
    pub fn acknowledged(&self) -> Vec<String> {
        self.acked
            .lock()
            .map(|acked| acked.clone())
            .unwrap_or_default()
    }

    fn matches(&self, message: &Message) -> bool {
        self.topic
            .as_deref()
            .map_or(true, |topic| message.topic == topic)
    }

    fn next(&self) -> Result<Option<Message>, PublishError> {
        if let Some(message) = self.redeliver.lock().map_err(poisoned)?.pop_front() {
            return Ok(Some(message));
        }

        let log = self.log.read().map_err(poisoned)?;
        let mut position = self.position.lock().map_err(poisoned)?;
        while *position < log.len() {
            let message = &log[*position];
            *position += 1;
            if self.matches(message) {
                return Ok(Some(message.clone()));
            }
        }
        Ok(None)
    }
}

impl Subscriber for BusSubscription {
    fn poll(&self, timeout_ms: u64) -> Result<Option<Message>, PublishError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);

        loop {
            if let Some(message) = self.next()? {
                self.in_flight
                    .lock()
                    .map_err(poisoned)?
                    .insert(message.id.clone(), message.clone());
                return Ok(Some(message));
            }

            if Instant::now() >= deadline {
                return Ok(None);
            }
            std::thread::sleep(Duration::from_millis(1));
        }
    }

    fn ack(&self, message_id: &str) -> Result<(), PublishError> {
        self.in_flight.lock().map_err(poisoned)?.remove(message_id);
        self.acked
            .lock()
            .map_err(poisoned)?
            .push(message_id.to_string());
        Ok(())
    }

    fn nack(&self, message_id: &str, reason: &str) -> Result<(), PublishError> {
        let message = self.in_flight.lock().map_err(poisoned)?.remove(message_id);
        match message {
            Some(message) => {
                tracing::debug!(id = %message_id, reason, "message nacked, redelivering");
                self.redeliver.lock().map_err(poisoned)?.push_back(message);
                Ok(())
            }
            None => Err(PublishError::Rejected(format!(
                "message {} is not in flight",
                message_id
            ))),
        }
    }
}
