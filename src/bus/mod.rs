//! Message Bus - where the outbox forwards envelopes.
//!
//! ```text
//!        Outbox::flush
//!              │ Message { id = envelope UID, data = envelope JSON }
//!              ▼
//! ┌──────────────────────────────────────────────┐
//! │                Publisher trait               │
//! │      publish(message) / publish_batch()      │
//! └──────────────────────────────────────────────┘
//!        │                 │                 │
//!        ▼                 ▼                 ▼
//! ┌─────────────┐  ┌───────────────┐  ┌──────────────────┐
//! │ InMemoryBus │  │ PushPublisher │  │ EmitterPublisher │
//! │ (+ pull     │  │ (PushRequest  │  │ (feature         │
//! │  Subscriber)│  │  to endpoints)│  │  "emitter")      │
//! └─────────────┘  └───────────────┘  └──────────────────┘
//! ```
//!
//! Delivery is at least once: consumers must tolerate the same message id
//! more than once.

#[cfg(feature = "emitter")]
mod emitter;
mod in_memory;
mod publisher;
mod push;

#[cfg(feature = "emitter")]
pub use emitter::EmitterPublisher;
pub use in_memory::{BusSubscription, InMemoryBus};
pub use publisher::{Message, PublishError, Publisher, Subscriber};
#[cfg(feature = "http")]
pub use push::HttpPushEndpoint;
pub use push::{PushEndpoint, PushMessage, PushPublisher, PushRequest};
