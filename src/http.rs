//! HTTP surface for the outbox: trigger callback, consumer webhook, health.
//!
//! Requires the `http` feature. Uses axum for routing; blocking outbox and
//! dispatcher work runs on `spawn_blocking`.
//!
//! ## Routes
//!
//! - `PUT|POST /outbox/:uid`: trigger callback. 200 with
//!   `{"status":"ok","uid":..,"published":n}`, or 500 with `{"error":..}` so
//!   the task queue retries.
//! - `POST /api/:service/event`: push delivery for the dispatcher registered
//!   under `:service`. Replies [`ACCEPTED`] when handled. A failing handler
//!   answers with its error's status code so the sender retries. Envelopes
//!   that can never be handled get 200 with the error text. Unknown service
//!   is 404.
//! - `GET /health`: `{"ok":true,"topics":[..]}`.

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use serde_json::json;

pub use crate::ACCEPTED;
use crate::dispatch::Dispatcher;
use crate::outbox::Outbox;

/// Shared state behind the router.
#[derive(Clone)]
pub struct AppState {
    outbox: Arc<Outbox>,
    dispatchers: HashMap<String, Arc<Dispatcher>>,
}

impl AppState {
    pub fn new(outbox: Arc<Outbox>) -> Self {
        Self {
            outbox,
            dispatchers: HashMap::new(),
        }
    }

    /// Serve `dispatcher` at `/api/{topic}/event`.
    pub fn with_dispatcher(mut self, dispatcher: Dispatcher) -> Self {
        self.dispatchers
            .insert(dispatcher.topic().to_string(), Arc::new(dispatcher));
        self
    }

    fn topics(&self) -> Vec<&str> {
        let mut topics: Vec<&str> = self.dispatchers.keys().map(String::as_str).collect();
        topics.sort_unstable();
        topics
    }
}

/// Build an axum `Router` over `state`.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_handler))
        .route("/outbox/:uid", put(trigger_handler).post(trigger_handler))
        .route("/api/:service/event", post(event_handler))
        .with_state(state)
}

/// Serve at the given address (e.g. `"0.0.0.0:8080"`).
pub async fn serve(state: AppState, addr: &str) -> Result<(), std::io::Error> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "outbox http listening");
    axum::serve(listener, app).await
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({ "ok": true, "topics": state.topics() }))
}

async fn trigger_handler(State(state): State<AppState>, Path(uid): Path<String>) -> Response {
    let outbox = Arc::clone(&state.outbox);
    let trigger_uid = uid.clone();
    let result = tokio::task::spawn_blocking(move || outbox.handle_trigger(&trigger_uid)).await;

    match result {
        Ok(Ok(report)) => {
            let published = report.map(|r| r.count()).unwrap_or(0);
            (
                StatusCode::OK,
                Json(json!({ "status": "ok", "uid": uid, "published": published })),
            )
                .into_response()
        }
        Ok(Err(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": err.to_string() })),
        )
            .into_response(),
        Err(err) => {
            tracing::error!(uid = %uid, error = %err, "trigger handler panicked");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({ "error": "internal error" })),
            )
                .into_response()
        }
    }
}

async fn event_handler(
    State(state): State<AppState>,
    Path(service): Path<String>,
    body: Bytes,
) -> Response {
    let Some(dispatcher) = state.dispatchers.get(&service).cloned() else {
        return (StatusCode::NOT_FOUND, format!("unknown service: {}", service)).into_response();
    };

    let result = tokio::task::spawn_blocking(move || dispatcher.dispatch_push(&body)).await;
    match result {
        Ok(Ok(())) => (StatusCode::OK, ACCEPTED).into_response(),
        Ok(Err(err)) if err.is_retryable() => {
            let status = StatusCode::from_u16(err.status_code())
                .unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
            tracing::warn!(service = %service, status = %status, error = %err, "event handler failed");
            (status, err.to_string()).into_response()
        }
        Ok(Err(err)) => {
            tracing::warn!(service = %service, error = %err, "event not handled");
            (StatusCode::OK, err.to_string()).into_response()
        }
        Err(err) => {
            tracing::error!(service = %service, error = %err, "event handler panicked");
            (StatusCode::INTERNAL_SERVER_ERROR, "internal error".to_string()).into_response()
        }
    }
}
