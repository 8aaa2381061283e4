//! HTTP surface: trigger callback, consumer webhook, health.

use std::sync::Arc;

use relay_outbox::bus::{InMemoryBus, Message, PushPublisher, PushRequest, Publisher, HttpPushEndpoint};
use relay_outbox::dispatch::{consume_once, Dispatcher, HandlerError};
use relay_outbox::http::{router, AppState, ACCEPTED};
use relay_outbox::queue::{HttpTarget, InMemoryTaskQueue, QueueSettings, Task, TaskQueue};
use relay_outbox::store::{InMemoryStore, RetryPolicy, StoreError, StoreExt};
use relay_outbox::{Envelope, OutboxError};
use serde_json::Value;

use crate::support::{item, BasketCreated, BasketSummary, FlakyBus, Harness, ItemAdded};

async fn spawn_server(state: AppState) -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router(state)).await.unwrap();
    });
    format!("http://{}", addr)
}

fn summary_dispatcher(store: &Arc<InMemoryStore>) -> Dispatcher {
    let store = Arc::clone(store);
    Dispatcher::new("basket").on(move |envelope: &Envelope, event: ItemAdded| {
        consume_once(store.as_ref(), envelope, |tx| {
            let mut summary = tx
                .get::<BasketSummary>(&event.basket_uid)?
                .unwrap_or_default();
            summary.item_count += 1;
            tx.put(&event.basket_uid, &summary)?;
            Ok(())
        })
        .map(|_| ())
    })
}

fn push_body(envelope: &Envelope) -> Vec<u8> {
    let message = Message::new(&envelope.uid, &envelope.topic, envelope.to_bytes().unwrap());
    PushRequest::new(&message, "basket-push").to_json().unwrap()
}

#[tokio::test]
async fn health_lists_served_topics() {
    let harness = Harness::new();
    let consumer = Arc::new(InMemoryStore::new());
    let state = AppState::new(Arc::clone(&harness.outbox)).with_dispatcher(summary_dispatcher(&consumer));
    let base = spawn_server(state).await;

    let body: Value = reqwest::get(format!("{}/health", base))
        .await
        .unwrap()
        .json()
        .await
        .unwrap();

    assert_eq!(body["ok"], true);
    assert_eq!(body["topics"], serde_json::json!(["basket"]));
}

#[tokio::test]
async fn trigger_callback_flushes_topic() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());
    let envelope = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "1".into() }))
        .unwrap();
    let base = spawn_server(AppState::new(Arc::clone(&harness.outbox))).await;

    let response = reqwest::Client::new()
        .put(format!("{}/outbox/{}", base, envelope.uid))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();

    assert_eq!(body["status"], "ok");
    assert_eq!(body["uid"], envelope.uid.as_str());
    assert_eq!(body["published"], 1);
    assert_eq!(bus.len(), 1);
}

#[tokio::test]
async fn trigger_for_unknown_envelope_succeeds_empty() {
    let harness = Harness::new();
    let base = spawn_server(AppState::new(Arc::clone(&harness.outbox))).await;

    let response = reqwest::Client::new()
        .post(format!("{}/outbox/rolled-back", base))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 200);
    let body: Value = response.json().await.unwrap();
    assert_eq!(body["published"], 0);
}

#[tokio::test]
async fn failed_flush_asks_for_retry() {
    let bus = Arc::new(FlakyBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());
    let envelope = harness
        .store
        .transaction(|tx| harness.outbox.publish(tx, "basket", &BasketCreated { uid: "2".into() }))
        .unwrap();
    let base = spawn_server(AppState::new(Arc::clone(&harness.outbox))).await;

    bus.fail_next(1);
    let response = reqwest::Client::new()
        .put(format!("{}/outbox/{}", base, envelope.uid))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    let body: Value = response.json().await.unwrap();
    assert!(body["error"].as_str().unwrap().contains(&envelope.uid));
    assert_eq!(harness.outbox.pending("basket").unwrap().len(), 1);
}

#[tokio::test]
async fn webhook_acknowledges_handled_events() {
    let harness = Harness::new();
    let consumer = Arc::new(InMemoryStore::new());
    let state = AppState::new(Arc::clone(&harness.outbox)).with_dispatcher(summary_dispatcher(&consumer));
    let base = spawn_server(state).await;
    let client = reqwest::Client::new();

    let envelope = Envelope::wrap("basket", &item("b-1", "mug")).unwrap();
    let response = client
        .post(format!("{}/api/basket/event", base))
        .body(push_body(&envelope))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    assert_eq!(response.text().await.unwrap(), ACCEPTED);

    // Not handled: still 200 so the push is not retried, with the reason.
    let unknown = Envelope::wrap("basket", &BasketCreated { uid: "b-1".into() }).unwrap();
    let response = client
        .post(format!("{}/api/basket/event", base))
        .body(push_body(&unknown))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 200);
    let text = response.text().await.unwrap();
    assert_ne!(text, ACCEPTED);
    assert!(text.contains("basket.created"));

    let response = client
        .post(format!("{}/api/payment/event", base))
        .body(push_body(&envelope))
        .send()
        .await
        .unwrap();
    assert_eq!(response.status(), 404);

    let summary = consumer.get::<BasketSummary>("b-1").unwrap().unwrap();
    assert_eq!(summary.item_count, 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn producer_and_consumer_talk_over_http() {
    let bus = Arc::new(InMemoryBus::new());
    let harness = Harness::with(Arc::new(InMemoryStore::new()), bus.clone());
    let consumer = Arc::new(InMemoryStore::new());
    let state = AppState::new(Arc::clone(&harness.outbox)).with_dispatcher(summary_dispatcher(&consumer));
    let base = spawn_server(state).await;

    let uids: Vec<String> = ["mug", "tea"]
        .iter()
        .map(|sku| {
            harness
                .store
                .transaction(|tx| harness.outbox.publish(tx, "basket", &item("b-7", sku)))
                .unwrap()
                .uid
        })
        .collect();

    // Blocking clients are built, used, and dropped off the async workers.
    let pushed = tokio::task::spawn_blocking(move || {
        let callbacks = InMemoryTaskQueue::new(QueueSettings {
            retry: RetryPolicy::immediate(2),
            ..QueueSettings::default()
        });
        callbacks
            .set_target(Arc::new(HttpTarget::new(base.as_str()).unwrap()))
            .unwrap();
        for uid in &uids {
            callbacks
                .enqueue(Task::new(uid.clone(), format!("/outbox/{}", uid)))
                .unwrap();
        }
        let stats = callbacks.drain();
        assert_eq!(stats.delivered, 2);

        let push = PushPublisher::new().with_endpoint(
            "basket",
            Arc::new(HttpPushEndpoint::new(format!("{}/api/basket/event", base))),
        );
        push.publish_batch(bus.messages()).unwrap();
        bus.len()
    })
    .await
    .unwrap();

    assert_eq!(pushed, 2);
    assert!(harness.outbox.all_pending().unwrap().is_empty());
    let summary = consumer.get::<BasketSummary>("b-7").unwrap().unwrap();
    assert_eq!(summary.item_count, 2);
}

fn unavailable_dispatcher() -> Dispatcher {
    Dispatcher::new("basket").on(|_: &Envelope, _: ItemAdded| {
        Err(HandlerError::Store(StoreError::Storage("read model offline".into())))
    })
}

#[tokio::test]
async fn webhook_reports_handler_failure_as_error_status() {
    let harness = Harness::new();
    let state = AppState::new(Arc::clone(&harness.outbox)).with_dispatcher(unavailable_dispatcher());
    let base = spawn_server(state).await;

    let envelope = Envelope::wrap("basket", &item("b-3", "mug")).unwrap();
    let response = reqwest::Client::new()
        .post(format!("{}/api/basket/event", base))
        .body(push_body(&envelope))
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), 500);
    assert!(response.text().await.unwrap().contains("read model offline"));
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn failed_remote_handler_keeps_envelope_pending() {
    let receiver = Harness::new();
    let state = AppState::new(Arc::clone(&receiver.outbox)).with_dispatcher(unavailable_dispatcher());
    let base = spawn_server(state).await;

    let pending = tokio::task::spawn_blocking(move || {
        let push = PushPublisher::new().with_endpoint(
            "basket",
            Arc::new(HttpPushEndpoint::new(format!("{}/api/basket/event", base))),
        );
        let producer = Harness::with(Arc::new(InMemoryStore::new()), Arc::new(push));
        producer
            .store
            .transaction(|tx| producer.outbox.publish(tx, "basket", &item("b-4", "tea")))
            .unwrap();

        let err = producer.outbox.flush("basket").unwrap_err();
        assert!(matches!(err, OutboxError::Publish { published: 0, .. }));
        producer.outbox.pending("basket").unwrap().len()
    })
    .await
    .unwrap();

    assert_eq!(pending, 1);
}
