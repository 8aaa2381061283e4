//! Test domain: a shop basket, its events, and infrastructure doubles.

#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use relay_outbox::bus::{InMemoryBus, Message, PublishError, Publisher};
use relay_outbox::outbox::{OutboxCallback, OutboxSettings};
use relay_outbox::queue::{InMemoryTaskQueue, QueueSettings};
use relay_outbox::store::{InMemoryStore, Record, RetryPolicy, Store, StoreError, Transaction, TransactionFn};
use relay_outbox::{DomainEvent, Outbox};
use serde::{Deserialize, Serialize};

// =============================================================================
// Domain
// =============================================================================

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct Basket {
    pub uid: String,
    pub items: Vec<String>,
}

impl Record for Basket {
    const KIND: &'static str = "Basket";
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct BasketCreated {
    pub uid: String,
}

impl DomainEvent for BasketCreated {
    const EVENT_TYPE_NAME: &'static str = "basket.created";

    fn aggregate_name(&self) -> String {
        self.uid.clone()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct ItemAdded {
    pub basket_uid: String,
    pub sku: String,
}

impl DomainEvent for ItemAdded {
    const EVENT_TYPE_NAME: &'static str = "basket.item_added";

    fn aggregate_name(&self) -> String {
        self.basket_uid.clone()
    }
}

#[derive(Serialize, Deserialize, Clone, Debug, PartialEq)]
pub struct CheckoutStarted {
    pub basket_uid: String,
}

impl DomainEvent for CheckoutStarted {
    const EVENT_TYPE_NAME: &'static str = "checkout.started";

    fn aggregate_name(&self) -> String {
        self.basket_uid.clone()
    }
}

/// Consumer-side read model counting items per basket.
#[derive(Serialize, Deserialize, Clone, Debug, PartialEq, Default)]
pub struct BasketSummary {
    pub item_count: u32,
}

impl Record for BasketSummary {
    const KIND: &'static str = "BasketSummary";
}

pub fn item(basket_uid: &str, sku: &str) -> ItemAdded {
    ItemAdded {
        basket_uid: basket_uid.into(),
        sku: sku.into(),
    }
}

// =============================================================================
// Harness
// =============================================================================

/// Store, bus, queue, and outbox wired the in-process way, with triggers
/// due immediately and retries without backoff.
pub struct Harness {
    pub store: Arc<dyn Store>,
    pub bus: Arc<dyn Publisher>,
    pub queue: InMemoryTaskQueue,
    pub outbox: Arc<Outbox>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with(Arc::new(InMemoryStore::new()), Arc::new(InMemoryBus::new()))
    }

    pub fn with(store: Arc<dyn Store>, bus: Arc<dyn Publisher>) -> Self {
        Self::with_attempts(store, bus, 3)
    }

    pub fn with_attempts(store: Arc<dyn Store>, bus: Arc<dyn Publisher>, max_attempts: u32) -> Self {
        let queue = InMemoryTaskQueue::new(QueueSettings {
            retry: RetryPolicy::immediate(max_attempts),
            ..QueueSettings::default()
        });
        let outbox = Arc::new(
            Outbox::new(Arc::clone(&store), Arc::clone(&bus), Arc::new(queue.clone())).with_settings(
                OutboxSettings {
                    trigger_delay: std::time::Duration::ZERO,
                    ..OutboxSettings::default()
                },
            ),
        );
        queue
            .set_target(Arc::new(OutboxCallback::new(&outbox)))
            .unwrap();
        Self {
            store,
            bus,
            queue,
            outbox,
        }
    }
}

// =============================================================================
// Doubles
// =============================================================================

/// Publisher that forwards to an [`InMemoryBus`] but can be told to fail.
#[derive(Clone, Default)]
pub struct FlakyBus {
    pub inner: InMemoryBus,
    fail_remaining: Arc<AtomicUsize>,
    fail_after: Arc<Mutex<Option<usize>>>,
}

impl FlakyBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail the next `n` publishes.
    pub fn fail_next(&self, n: usize) {
        self.fail_remaining.store(n, Ordering::SeqCst);
    }

    /// Accept `n` more publishes, then fail every one after that.
    pub fn fail_after(&self, n: usize) {
        *self.fail_after.lock().unwrap() = Some(n);
    }

    pub fn heal(&self) {
        self.fail_remaining.store(0, Ordering::SeqCst);
        *self.fail_after.lock().unwrap() = None;
    }
}

impl Publisher for FlakyBus {
    fn publish(&self, message: Message) -> Result<(), PublishError> {
        {
            let mut after = self.fail_after.lock().unwrap();
            match *after {
                Some(0) => return Err(PublishError::ConnectionFailed("bus down".into())),
                Some(n) => *after = Some(n - 1),
                None => {}
            }
        }
        let failing = self
            .fail_remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            return Err(PublishError::Timeout);
        }
        self.inner.publish(message)
    }
}

/// Store wrapper that can lose the commit of transactions that wrote.
///
/// The transaction function runs to completion, then the commit is
/// reported as failed and every write is discarded.
#[derive(Clone, Default)]
pub struct LossyStore {
    pub inner: InMemoryStore,
    lose_writes: Arc<AtomicUsize>,
    pub lost: Arc<AtomicUsize>,
}

impl LossyStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn lose_next_writes(&self, n: usize) {
        self.lose_writes.store(n, Ordering::SeqCst);
    }
}

struct WriteTracking<'a> {
    inner: &'a mut dyn Transaction,
    wrote: bool,
}

impl Transaction for WriteTracking<'_> {
    fn get(&mut self, kind: &str, uid: &str) -> Result<Option<Vec<u8>>, StoreError> {
        self.inner.get(kind, uid)
    }

    fn put(&mut self, kind: &str, uid: &str, bytes: Vec<u8>) -> Result<(), StoreError> {
        self.wrote = true;
        self.inner.put(kind, uid, bytes)
    }

    fn scan(&mut self, kind: &str) -> Result<Vec<(String, Vec<u8>)>, StoreError> {
        self.inner.scan(kind)
    }
}

impl Store for LossyStore {
    fn run_in_transaction(&self, f: &mut TransactionFn<'_>) -> Result<(), StoreError> {
        self.inner.run_in_transaction(&mut |raw: &mut dyn Transaction| {
            let mut tracking = WriteTracking { inner: raw, wrote: false };
            f(&mut tracking)?;
            let lose = tracking.wrote
                && self
                    .lose_writes
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
            if lose {
                self.lost.fetch_add(1, Ordering::SeqCst);
                return Err(StoreError::Storage("commit lost".into()));
            }
            Ok(())
        })
    }
}
