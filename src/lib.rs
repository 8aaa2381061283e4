//! Transactional outbox: record domain events atomically with state changes,
//! deliver them to a message bus at least once, and dispatch them to typed
//! handlers on the consuming side.

mod backend;
pub mod bus;
pub mod config;
pub mod dispatch;
mod envelope;
#[cfg(feature = "http")]
pub mod http;
pub mod outbox;
pub mod queue;
pub mod store;

pub use backend::{BackendError, Infrastructure, Workers};
pub use config::{Backend, Config, ConfigError};
pub use dispatch::{consume_once, DispatchError, Dispatcher, HandlerError};
pub use envelope::{DomainEvent, Envelope, EnvelopeError};
pub use outbox::{FlushReport, Outbox, OutboxCallback, OutboxError, OutboxSettings, Sweeper};
pub use store::{InMemoryStore, OptimisticStore, Store, StoreError, StoreExt, Tx};

/// Body a consumer webhook replies with when it handled a push delivery.
pub const ACCEPTED: &str = "OK";

// Re-export the EventEmitter from the event_emitter_rs crate
#[cfg(feature = "emitter")]
pub use event_emitter_rs::EventEmitter;
