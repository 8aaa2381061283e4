//! Core publisher traits for the message bus.

use std::collections::BTreeMap;
use std::error::Error;

use thiserror::Error;

/// A message carried by the bus.
///
/// The outbox uses the envelope UID as `id`, so consumers can deduplicate.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Message {
    /// Unique identifier for this message
    pub id: String,
    /// Topic the message is published on
    pub topic: String,
    /// Serialized body (the envelope JSON when sent by the outbox)
    pub data: Vec<u8>,
    /// Free-form attributes (event type, aggregate, ...)
    pub attributes: BTreeMap<String, String>,
}

impl Message {
    pub fn new(id: impl Into<String>, topic: impl Into<String>, data: Vec<u8>) -> Self {
        Self {
            id: id.into(),
            topic: topic.into(),
            data,
            attributes: BTreeMap::new(),
        }
    }

    /// Add an attribute to the message.
    pub fn with_attribute(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.attributes.insert(key.into(), value.into());
        self
    }

    pub fn attribute(&self, key: &str) -> Option<&str> {
        self.attributes.get(key).map(String::as_str)
    }

    /// Get the body as a string (if valid UTF-8).
    pub fn data_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.data).ok()
    }
}

/// Error type for publish operations.
#[derive(Debug, Error)]
pub enum PublishError {
    /// Connection to the bus failed
    #[error("connection failed: {0}")]
    ConnectionFailed(String),
    /// Serialization of the message failed
    #[error("serialization failed: {0}")]
    SerializationFailed(String),
    /// The bus or an endpoint rejected the message
    #[error("message rejected: {0}")]
    Rejected(String),
    /// Timeout waiting for acknowledgment
    #[error("publish timeout")]
    Timeout,
    #[error("publish error: {0}")]
    Other(#[source] Box<dyn Error + Send + Sync>),
}

/// Trait for publishing messages to a bus.
pub trait Publisher: Send + Sync {
    /// Publish a single message. `Ok` means the bus accepted it.
    fn publish(&self, message: Message) -> Result<(), PublishError>;

    /// Publish several messages, in order.
    ///
    /// Default implementation publishes sequentially and stops at the first
    /// failure.
    fn publish_batch(&self, messages: Vec<Message>) -> Result<(), PublishError> {
        for message in messages {
            self.publish(message)?;
        }
        Ok(())
    }
}

/// Pull-based consumption of a bus.
pub trait Subscriber: Send + Sync {
    /// Poll for the next message, blocking until one is available or timeout.
    fn poll(&self, timeout_ms: u64) -> Result<Option<Message>, PublishError>;

    /// Acknowledge that a message has been processed.
    fn ack(&self, message_id: &str) -> Result<(), PublishError>;

    /// Reject a message so it is delivered again.
    fn nack(&self, message_id: &str, reason: &str) -> Result<(), PublishError>;
}
