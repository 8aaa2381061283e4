//! End-to-end: a basket is created, its event travels to a consumer.

use std::sync::Arc;

use relay_outbox::bus::{InMemoryBus, PushPublisher};
use relay_outbox::dispatch::{consume_once, Dispatcher, HandlerError};
use relay_outbox::store::{InMemoryStore, StoreExt};
use relay_outbox::{Envelope, OutboxError};

use crate::support::{item, Basket, BasketCreated, BasketSummary, Harness, ItemAdded};

#[test]
fn basket_created_is_recorded_then_flushed() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    harness
        .store
        .transaction(|tx| -> Result<(), OutboxError> {
            tx.put(
                "123",
                &Basket {
                    uid: "123".into(),
                    items: vec![],
                },
            )?;
            harness
                .outbox
                .publish(tx, "basket", &BasketCreated { uid: "123".into() })?;
            Ok(())
        })
        .unwrap();

    let pending = harness.outbox.pending("basket").unwrap();
    assert_eq!(pending.len(), 1);
    assert_eq!(pending[0].aggregate_uid, "123");
    assert_eq!(pending[0].event_type_name, "basket.created");
    assert!(!pending[0].published);
    assert!(bus.is_empty());

    let report = harness.outbox.flush("basket").unwrap();
    assert_eq!(report.published, vec![pending[0].uid.clone()]);

    let stored = harness.store.get::<Envelope>(&pending[0].uid).unwrap().unwrap();
    assert!(stored.published);

    let messages = bus.messages();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].id, pending[0].uid);
    let sent = Envelope::from_bytes(&messages[0].data).unwrap();
    assert_eq!(sent.decode_payload::<BasketCreated>().unwrap().uid, "123");
}

#[test]
fn trigger_queue_drives_delivery() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());

    harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "9".into() }))
        .unwrap();
    assert_eq!(harness.queue.pending_len(), 1);

    let stats = harness.queue.drain();

    assert_eq!(stats.delivered, 1);
    assert_eq!(bus.len(), 1);
    assert!(harness.outbox.pending("basket").unwrap().is_empty());
}

#[test]
fn pushed_events_update_consumer_read_model_once() {
    let consumer_store = Arc::new(InMemoryStore::new());
    let projection_store = Arc::clone(&consumer_store);
    let dispatcher = Dispatcher::new("basket").on(move |envelope: &Envelope, event: ItemAdded| {
        consume_once(projection_store.as_ref(), envelope, |tx| {
            let mut summary = tx
                .get::<BasketSummary>(&event.basket_uid)?
                .unwrap_or_default();
            summary.item_count += 1;
            tx.put(&event.basket_uid, &summary)?;
            Ok(())
        })
        .map(|_| ())
    });

    let push = PushPublisher::new().with_endpoint("basket", Arc::new(dispatcher));
    let harness = Harness::with(Arc::new(InMemoryStore::new()), Arc::new(push));

    for sku in ["mug", "tea"] {
        harness
            .store
            .transaction(|tx| harness.outbox.publish(tx, "basket", &item("b-1", sku)))
            .unwrap();
    }
    harness.queue.drain();

    let summary = consumer_store.get::<BasketSummary>("b-1").unwrap().unwrap();
    assert_eq!(summary.item_count, 2);

    // Redelivering the same envelope is absorbed by the consumer.
    let envelope = Envelope::wrap("basket", &item("b-1", "mug")).unwrap();
    let replay_store = Arc::clone(&consumer_store);
    let replay = Dispatcher::new("basket").on(move |envelope: &Envelope, _event: ItemAdded| {
        consume_once(replay_store.as_ref(), envelope, |_| {
            Err(HandlerError::Other("must not run".into()))
        })
        .map(|_| ())
    });
    replay.dispatch_envelope(&envelope).unwrap();
    assert_eq!(
        consumer_store.get::<BasketSummary>("b-1").unwrap().unwrap().item_count,
        2
    );
}
