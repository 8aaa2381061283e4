//! Outbox integration tests.

mod support;
mod delivery;
mod scenario;

#[cfg(feature = "http")]
mod http;
