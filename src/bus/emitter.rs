use std::sync::{Arc, Mutex};

use event_emitter_rs::EventEmitter;

use super::{Message, PublishError, Publisher};

/// Publisher that hands every message to an in-process [`EventEmitter`].
///
/// The message body is emitted as a string under the message topic.
/// Listeners run on the emitter's own threads.
#[derive(Clone)]
pub struct EmitterPublisher {
    emitter: Arc<Mutex<EventEmitter>>,
}

impl EmitterPublisher {
    pub fn new() -> Self {
        Self {
            emitter: Arc::new(Mutex::new(EventEmitter::new())),
        }
    }

    /// Register a listener for messages on `topic`.
    pub fn on<F>(&self, topic: &str, listener: F) -> Result<(), PublishError>
    where
        F: Fn(String) + Send + Sync + 'static,
    {
        self.emitter
            .lock()
            .map_err(|_| PublishError::ConnectionFailed("emitter lock poisoned".into()))?
            .on(topic, listener);
        Ok(())
    }
}

impl Default for EmitterPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl Publisher for EmitterPublisher {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        let body = String::from_utf8(message.data)
            .map_err(|e| PublishError::SerializationFailed(e.to_string()))?;
        self.emitter
            .lock()
            .map_err(|_| PublishError::ConnectionFailed("emitter lock poisoned".into()))?
            .emit(&message.topic, body);
        Ok(())
    }
}
