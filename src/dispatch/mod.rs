//! Event Dispatcher - inbound envelopes routed to typed handlers.
//!
//! A [`Dispatcher`] serves one topic. Handlers are registered per event type
//! and receive the decoded event together with its envelope; the envelope
//! UID is the idempotency key (see [`consume_once`]).
//!
//! ## Example
//!
//! ```
//! use relay_outbox::dispatch::{Dispatcher, HandlerError};
//! use relay_outbox::{DomainEvent, Envelope};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct BasketCreated {
//!     uid: String,
//! }
//!
//! impl DomainEvent for BasketCreated {
//!     const EVENT_TYPE_NAME: &'static str = "basket.created";
//!     fn aggregate_name(&self) -> String {
//!         self.uid.clone()
//!     }
//! }
//!
//! let dispatcher = Dispatcher::new("basket").on(|_envelope: &Envelope, event: BasketCreated| {
//!     assert_eq!(event.uid, "123");
//!     Ok::<_, HandlerError>(())
//! });
//!
//! let envelope = Envelope::wrap("basket", &BasketCreated { uid: "123".into() }).unwrap();
//! dispatcher.dispatch(&envelope.to_bytes().unwrap()).unwrap();
//! ```

mod consume;
mod error;

use std::collections::HashMap;

use serde::de::DeserializeOwned;

use crate::bus::{PublishError, PushEndpoint, PushRequest};
use crate::envelope::{DomainEvent, Envelope};

pub use consume::{consume_once, ProcessedEnvelope};
pub use error::{DispatchError, HandlerError};

type Handler = Box<dyn Fn(&Envelope) -> Result<(), DispatchError> + Send + Sync>;

/// Routes envelopes of one topic to the handler registered for their event
/// type.
pub struct Dispatcher {
    topic: String,
    handlers: HashMap<&'static str, Handler>,
}

impl Dispatcher {
    pub fn new(topic: impl Into<String>) -> Self {
        Self {
            topic: topic.into(),
            handlers: HashMap::new(),
        }
    }

    /// Register the handler for `E`. A later registration for the same event
    /// type replaces the earlier one.
    pub fn on<E, F>(mut self, handler: F) -> Self
    where
        E: DomainEvent + DeserializeOwned + 'static,
        F: Fn(&Envelope, E) -> Result<(), HandlerError> + Send + Sync + 'static,
    {
        let handle = move |envelope: &Envelope| -> Result<(), DispatchError> {
            let event: E = envelope
                .decode_payload()
                .map_err(|e| DispatchError::InvalidEnvelope(e.to_string()))?;
            handler(envelope, event).map_err(|source| DispatchError::Handler {
                event_type_name: E::EVENT_TYPE_NAME.to_string(),
                uid: envelope.uid.clone(),
                source,
            })
        };
        self.handlers.insert(E::EVENT_TYPE_NAME, Box::new(handle));
        self
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Registered event type names, sorted.
    pub fn event_types(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.handlers.keys().copied().collect();
        names.sort_unstable();
        names
    }

    /// Decode a raw envelope and hand it to its handler.
    pub fn dispatch(&self, raw: &[u8]) -> Result<(), DispatchError> {
        let envelope =
            Envelope::from_bytes(raw).map_err(|e| DispatchError::InvalidEnvelope(e.to_string()))?;
        self.dispatch_envelope(&envelope)
    }

    pub fn dispatch_envelope(&self, envelope: &Envelope) -> Result<(), DispatchError> {
        if envelope.topic != self.topic {
            return Err(DispatchError::TopicMismatch {
                expected: self.topic.clone(),
                actual: envelope.topic.clone(),
            });
        }

        let handler = self
            .handlers
            .get(envelope.event_type_name.as_str())
            .ok_or_else(|| DispatchError::NotImplemented {
                topic: self.topic.clone(),
                event_type_name: envelope.event_type_name.clone(),
            })?;

        tracing::debug!(
            uid = %envelope.uid,
            topic = %envelope.topic,
            event_type = %envelope.event_type_name,
            "dispatching envelope"
        );
        handler(envelope)
    }

    /// Unwrap a push delivery body and dispatch the envelope inside it.
    pub fn dispatch_push(&self, body: &[u8]) -> Result<(), DispatchError> {
        let request =
            PushRequest::from_json(body).map_err(|e| DispatchError::InvalidEnvelope(e.to_string()))?;
        self.dispatch_request(&request)
    }

    fn dispatch_request(&self, request: &PushRequest) -> Result<(), DispatchError> {
        let data = request
            .data()
            .map_err(|e| DispatchError::InvalidEnvelope(e.to_string()))?;
        self.dispatch(&data)
    }
}

/// In-process push delivery.
///
/// Envelopes that can never be handled (malformed, wrong topic, unknown
/// event type) are logged and acknowledged so they do not block the topic.
/// Handler failures are returned, and the outbox sends the envelope again.
impl PushEndpoint for Dispatcher {
    fn deliver(&self, request: &PushRequest) -> Result<(), PublishError> {
        match self.dispatch_request(request) {
            Ok(()) => Ok(()),
            Err(err) if err.is_retryable() => Err(err.into()),
            Err(err) => {
                tracing::warn!(
                    topic = %self.topic,
                    id = %request.message.message_id,
                    error = %err,
                    "dropping undeliverable envelope"
                );
                Ok(())
            }
        }
    }
}
