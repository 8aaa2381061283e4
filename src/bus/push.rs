//! Push delivery: wraps messages in the transport envelope used by push
//! subscriptions and delivers them to endpoints.

use std::collections::BTreeMap;
use std::sync::Arc;

use base64::{engine::general_purpose::STANDARD, Engine};
use serde::{Deserialize, Serialize};

use super::{Message, PublishError, Publisher};

/// Body of a push delivery.
///
/// ```json
/// {"message": {"data": "<base64>", "message_id": "...", "attributes": {}}, "subscription": "..."}
/// ```
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushRequest {
    pub message: PushMessage,
    #[serde(default)]
    pub subscription: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PushMessage {
    /// Standard base64 of the message body.
    pub data: String,
    #[serde(default)]
    pub message_id: String,
    #[serde(default)]
    pub attributes: BTreeMap<String, String>,
}

impl PushRequest {
    pub fn new(message: &Message, subscription: impl Into<String>) -> Self {
        Self {
            message: PushMessage {
                data: STANDARD.encode(&message.data),
                message_id: message.id.clone(),
                attributes: message.attributes.clone(),
            },
            subscription: subscription.into(),
        }
    }

    pub fn from_json(body: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(body)
    }

    pub fn to_json(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Decoded message body.
    pub fn data(&self) -> Result<Vec<u8>, base64::DecodeError> {
        STANDARD.decode(&self.message.data)
    }
}

/// Something a push subscription delivers to.
pub trait PushEndpoint: Send + Sync {
    fn deliver(&self, request: &PushRequest) -> Result<(), PublishError>;
}

impl<F> PushEndpoint for F
where
    F: Fn(&PushRequest) -> Result<(), PublishError> + Send + Sync,
{
    fn deliver(&self, request: &PushRequest) -> Result<(), PublishError> {
        self(request)
    }
}

/// Publisher that pushes every message to its endpoints as a [`PushRequest`].
///
/// An endpoint is registered for a topic; messages on other topics are not
/// sent to it. The first failing endpoint fails the publish, so the outbox
/// will send the message again later.
#[derive(Clone, Default)]
pub struct PushPublisher {
    endpoints: Vec<(String, Arc<dyn PushEndpoint>)>,
}

impl PushPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `endpoint` for messages on `topic`.
    pub fn with_endpoint(mut self, topic: impl Into<String>, endpoint: Arc<dyn PushEndpoint>) -> Self {
        self.endpoints.push((topic.into(), endpoint));
        self
    }

    pub fn topics(&self) -> Vec<&str> {
        self.endpoints.iter().map(|(topic, _)| topic.as_str()).collect()
    }
}

impl Publisher for PushPublisher {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        let mut delivered = 0;
        for (topic, endpoint) in &self.endpoints {
            if *topic != message.topic {
                continue;
            }
            let request = PushRequest::new(&message, format!("{}-push", topic));
            endpoint.deliver(&request)?;
            delivered += 1;
        }

        if delivered == 0 {
            tracing::warn!(id = %message.id, topic = %message.topic, "no push endpoint for topic");
        }
        Ok(())
    }
}

/// Endpoint that POSTs the push request as JSON to a URL.
#[cfg(feature = "http")]
pub struct HttpPushEndpoint {
    url: String,
    client: reqwest::blocking::Client,
}

#[cfg(feature = "http")]
impl HttpPushEndpoint {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: reqwest::blocking::Client::new(),
        }
    }
}

#[cfg(feature = "http")]
impl PushEndpoint for HttpPushEndpoint {
    fn deliver(&self, request: &PushRequest) -> Result<(), PublishError> {
        let response = self
            .client
            .post(&self.url)
            .json(request)
            .send()
            .map_err(|e| PublishError::ConnectionFailed(format!("{}: {}", self.url, e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(PublishError::Rejected(format!("{} returned {}", self.url, status)));
        }

        let body = response.text().unwrap_or_default();
        if body != crate::ACCEPTED {
            tracing::warn!(
                url = %self.url,
                id = %request.message.message_id,
                response = %body,
                "push endpoint did not accept message"
            );
        }
        Ok(())
    }
}
