//! Event Envelope - durable, checksum-identified wrapper around a domain event.
//!
//! The envelope UID is derived from content, not generated: wrapping the same
//! event for the same topic twice yields the same UID, whatever the clock
//! says. That UID is the idempotency key for the store, the task queue, the
//! bus message id, and consumers.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::{DateTime, Utc};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

use crate::store::Record;

/// Contract a domain event fulfils to travel through the outbox.
///
/// ```
/// use relay_outbox::DomainEvent;
/// use serde::Serialize;
///
/// #[derive(Serialize)]
/// struct CheckoutStarted {
///     basket_uid: String,
/// }
///
/// impl DomainEvent for CheckoutStarted {
///     const EVENT_TYPE_NAME: &'static str = "checkout.started";
///
///     fn aggregate_name(&self) -> String {
///         self.basket_uid.clone()
///     }
/// }
/// ```
pub trait DomainEvent: Serialize {
    /// Stable discriminator, e.g. `"checkout.started"`.
    const EVENT_TYPE_NAME: &'static str;

    /// Correlation key of the aggregate this event belongs to.
    fn aggregate_name(&self) -> String;

    fn event_type_name(&self) -> &'static str {
        Self::EVENT_TYPE_NAME
    }
}

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("failed to encode {what}: {source}")]
    Encode {
        what: &'static str,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to decode envelope: {0}")]
    Decode(#[source] serde_json::Error),

    #[error("failed to decode {event_type_name} payload: {source}")]
    Payload {
        event_type_name: String,
        #[source]
        source: serde_json::Error,
    },
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct Envelope {
    #[serde(rename = "UID")]
    pub uid: String,
    pub created_at: DateTime<Utc>,
    pub topic: String,
    #[serde(rename = "AggregateUID")]
    pub aggregate_uid: String,
    pub event_type_name: String,
    #[serde(with = "payload_serde")]
    pub event_payload: Vec<u8>,
    pub published: bool,
}

/// Field names as stored, for use in queries.
impl Envelope {
    pub const FIELD_CREATED_AT: &'static str = "CreatedAt";
    pub const FIELD_TOPIC: &'static str = "Topic";
    pub const FIELD_AGGREGATE_UID: &'static str = "AggregateUID";
    pub const FIELD_PUBLISHED: &'static str = "Published";
}

impl Record for Envelope {
    const KIND: &'static str = "OutboxEnvelope";
}

/// The part of an envelope that identifies it. Field order is fixed, which
/// keeps the JSON encoding canonical.
#[derive(Serialize)]
#[serde(rename_all = "PascalCase")]
struct ChecksumView<'a> {
    topic: &'a str,
    #[serde(rename = "AggregateUID")]
    aggregate_uid: &'a str,
    event_type_name: &'a str,
    #[serde(with = "payload_serde")]
    event_payload: &'a Vec<u8>,
    published: bool,
}

mod payload_serde {
    use base64::{engine::general_purpose::STANDARD, Engine};
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S>(payload: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        STANDARD.encode(payload).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Vec<u8>, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s: String = String::deserialize(deserializer)?;
        STANDARD.decode(&s).map_err(serde::de::Error::custom)
    }
}

impl Envelope {
    /// Wrap `event` for `topic`.
    ///
    /// The UID is computed before `created_at` is set, so it does not depend
    /// on the time of the call.
    pub fn wrap<E: DomainEvent>(topic: &str, event: &E) -> Result<Self, EnvelopeError> {
        let event_payload = serde_json::to_vec(event).map_err(|source| EnvelopeError::Encode {
            what: "event payload",
            source,
        })?;

        let mut envelope = Envelope {
            uid: String::new(),
            created_at: DateTime::<Utc>::UNIX_EPOCH,
            topic: topic.to_string(),
            aggregate_uid: event.aggregate_name(),
            event_type_name: event.event_type_name().to_string(),
            event_payload,
            published: false,
        };
        envelope.uid = envelope.checksum()?;
        envelope.created_at = Utc::now();
        Ok(envelope)
    }

    /// SHA-256 of the canonical encoding without UID and timestamp,
    /// base64-url encoded without padding.
    pub fn checksum(&self) -> Result<String, EnvelopeError> {
        let view = ChecksumView {
            topic: &self.topic,
            aggregate_uid: &self.aggregate_uid,
            event_type_name: &self.event_type_name,
            event_payload: &self.event_payload,
            published: self.published,
        };
        let canonical = serde_json::to_vec(&view).map_err(|source| EnvelopeError::Encode {
            what: "envelope checksum view",
            source,
        })?;
        Ok(URL_SAFE_NO_PAD.encode(Sha256::digest(&canonical)))
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, EnvelopeError> {
        serde_json::to_vec(self).map_err(|source| EnvelopeError::Encode {
            what: "envelope",
            source,
        })
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, EnvelopeError> {
        serde_json::from_slice(bytes).map_err(EnvelopeError::Decode)
    }

    /// Decode the event body.
    pub fn decode_payload<E: DeserializeOwned>(&self) -> Result<E, EnvelopeError> {
        serde_json::from_slice(&self.event_payload).map_err(|source| EnvelopeError::Payload {
            event_type_name: self.event_type_name.clone(),
            source,
        })
    }

    pub fn payload_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.event_payload).ok()
    }
}
