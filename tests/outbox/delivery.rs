//! At-least-once delivery, ordering, and recovery.

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use relay_outbox::bus::InMemoryBus;
use relay_outbox::queue::{Task, TaskQueue};
use relay_outbox::store::{InMemoryStore, StoreError, StoreExt};
use relay_outbox::{Envelope, OutboxError, Sweeper};

use crate::support::{item, BasketCreated, FlakyBus, Harness, LossyStore};

#[test]
fn lost_mark_republishes_same_envelope() {
    let store = Arc::new(LossyStore::new());
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(store.clone(), bus.clone());

    let envelope = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "1".into() }))
        .unwrap();

    store.lose_next_writes(1);
    let err = harness.outbox.flush("basket").unwrap_err();
    assert!(matches!(err, OutboxError::Store(StoreError::Storage(_))));
    assert_eq!(bus.len(), 1);
    assert_eq!(harness.outbox.pending("basket").unwrap().len(), 1);

    let report = harness.outbox.flush("basket").unwrap();
    assert_eq!(report.published, vec![envelope.uid.clone()]);

    let ids: Vec<String> = bus.messages().into_iter().map(|m| m.id).collect();
    assert_eq!(ids, vec![envelope.uid.clone(), envelope.uid]);
    assert!(harness.outbox.pending("basket").unwrap().is_empty());
}

#[test]
fn bus_failure_keeps_earlier_envelopes_marked() {
    let bus = Arc::new(FlakyBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    let mut uids = Vec::new();
    for sku in ["a", "b", "c"] {
        let envelope = harness
            .store
            .transaction(|tx| harness.outbox.publish(tx, "basket", &item("b-1", sku)))
            .unwrap();
        uids.push(envelope.uid);
        thread::sleep(Duration::from_millis(2));
    }

    bus.fail_after(1);
    match harness.outbox.flush("basket").unwrap_err() {
        OutboxError::Publish { uid, published, .. } => {
            assert_eq!(published, 1);
            assert_eq!(uid, uids[1]);
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert_eq!(harness.outbox.pending("basket").unwrap().len(), 2);

    bus.heal();
    let report = harness.outbox.flush("basket").unwrap();
    assert_eq!(report.published, uids[1..].to_vec());

    let sent: Vec<String> = bus.inner.messages().into_iter().map(|m| m.id).collect();
    assert_eq!(sent, uids);
}

#[test]
fn envelopes_leave_in_creation_order() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    for sku in ["first", "second", "third"] {
        harness
            .store
            .transaction(|tx| harness.outbox.publish(tx, "basket", &item("b-1", sku)))
            .unwrap();
        thread::sleep(Duration::from_millis(2));
    }

    harness.outbox.flush("basket").unwrap();

    let skus: Vec<String> = bus
        .messages()
        .iter()
        .map(|m| {
            let envelope = Envelope::from_bytes(&m.data).unwrap();
            envelope.decode_payload::<crate::support::ItemAdded>().unwrap().sku
        })
        .collect();
    assert_eq!(skus, vec!["first", "second", "third"]);
}

#[test]
fn duplicate_trigger_is_delivered_once() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    let envelope = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "7".into() }))
        .unwrap();
    harness
        .queue
        .enqueue(Task::new(envelope.uid.clone(), format!("/outbox/{}", envelope.uid)))
        .unwrap();
    assert_eq!(harness.queue.pending_len(), 1);

    let stats = harness.queue.drain();
    assert_eq!(stats.delivered, 1);
    assert_eq!(bus.len(), 1);
}

#[test]
fn identical_event_yields_one_envelope() {
    let harness = Harness::new();

    let first = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "5".into() }))
        .unwrap();
    let second = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "5".into() }))
        .unwrap();

    assert_eq!(first.uid, second.uid);
    assert_eq!(harness.outbox.pending("basket").unwrap().len(), 1);
}

#[test]
fn sweep_recovers_after_triggers_give_up() {
    let bus = Arc::new(FlakyBus::new());
    let harness = Harness::with_attempts(Arc::new(InMemoryStore::new()), bus.clone(), 2);

    harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "3".into() }))
        .unwrap();

    bus.fail_next(10);
    let stats = harness.queue.drain();
    assert_eq!(stats.retried, 1);
    assert_eq!(stats.dropped, 1);
    assert_eq!(harness.queue.pending_len(), 0);
    assert_eq!(harness.outbox.pending("basket").unwrap().len(), 1);

    bus.heal();
    let sweeper = Sweeper::new(Arc::clone(&harness.outbox), Duration::ZERO);
    let swept = sweeper.sweep().unwrap();
    assert_eq!(swept.topics_flushed, 1);
    assert_eq!(swept.published, 1);
    assert_eq!(bus.inner.len(), 1);

    let again = sweeper.sweep().unwrap();
    assert_eq!(again.published, 0);
}

#[test]
fn sweep_leaves_fresh_envelopes_to_their_trigger() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "4".into() }))
        .unwrap();

    let stats = Sweeper::new(Arc::clone(&harness.outbox), Duration::from_secs(3600))
        .sweep()
        .unwrap();
    assert_eq!(stats.topics_flushed, 0);
    assert!(bus.is_empty());
}

#[test]
fn background_worker_delivers_triggers() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    let worker = harness.queue.spawn_worker(Duration::from_millis(5));
    harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "8".into() }))
        .unwrap();

    for _ in 0..200 {
        if !bus.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(5));
    }
    let stats = worker.stop();

    assert_eq!(bus.len(), 1);
    assert_eq!(stats.delivered, 1);
}
