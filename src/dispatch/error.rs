//! Error types for inbound envelope handling.

use thiserror::Error;

use crate::bus::PublishError;
use crate::store::StoreError;

/// Error returned by an event handler.
#[derive(Debug, Error)]
pub enum HandlerError {
    /// The aggregate the event refers to does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Business logic refused the event.
    #[error("rejected: {0}")]
    Rejected(String),

    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("handler error: {0}")]
    Other(String),
}

impl HandlerError {
    /// Map this error to an HTTP-style status code.
    pub fn status_code(&self) -> u16 {
        match self {
            HandlerError::NotFound(_) => 404,
            HandlerError::Rejected(_) => 422,
            HandlerError::Store(err) if err.is_conflict() => 409,
            HandlerError::Store(StoreError::ConflictRetriesExhausted { .. }) => 409,
            HandlerError::Store(_) => 500,
            HandlerError::Other(_) => 500,
        }
    }
}

/// Why an inbound envelope was not handled.
#[derive(Debug, Error)]
pub enum DispatchError {
    /// The body is not an envelope (or not a push request around one), or the
    /// payload does not decode as the registered event type.
    #[error("invalid envelope: {0}")]
    InvalidEnvelope(String),

    #[error("envelope for topic {actual:?} delivered to {expected:?} dispatcher")]
    TopicMismatch { expected: String, actual: String },

    /// No handler is registered for the event type.
    #[error("event type {event_type_name:?} not implemented on topic {topic:?}")]
    NotImplemented {
        topic: String,
        event_type_name: String,
    },

    #[error("handler for {event_type_name} failed on envelope {uid}: {source}")]
    Handler {
        event_type_name: String,
        uid: String,
        #[source]
        source: HandlerError,
    },
}

impl DispatchError {
    pub fn status_code(&self) -> u16 {
        match self {
            DispatchError::InvalidEnvelope(_) => 400,
            DispatchError::TopicMismatch { .. } => 400,
            DispatchError::NotImplemented { .. } => 501,
            DispatchError::Handler { source, .. } => source.status_code(),
        }
    }

    /// Whether sending the same envelope again can succeed.
    ///
    /// Only handler failures qualify. A malformed envelope, a wrong topic, or
    /// an unknown event type fails the same way on every redelivery.
    pub fn is_retryable(&self) -> bool {
        matches!(self, DispatchError::Handler { .. })
    }
}

impl From<DispatchError> for PublishError {
    fn from(err: DispatchError) -> Self {
        PublishError::Rejected(err.to_string())
    }
}
