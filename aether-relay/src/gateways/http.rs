//! HTTP surface: REST publish, SSE streaming, JSON WebSocket, health and
//! metrics.
//!
//! Subscriptions created over REST live in the same registry as every
//! other surface; the SSE stream polls the subscription's bounded outbox
//! directly, so the drop-oldest policy and counters apply unchanged.

use std::convert::Infallible;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aether_types::{Filter, Message};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{Path, Query, State};
use axum::http::header::CONTENT_TYPE;
use axum::http::StatusCode;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use dashmap::DashMap;
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{event_from_value, handle_steady_message, FrameSender};
use crate::dispatch::Subscription;
use crate::relay::{PublishError, Relay};

/// Shared state for the HTTP surface.
#[derive(Clone)]
pub struct HttpState {
    relay: Arc<Relay>,
    /// REST-created subscriptions, addressable by id alone.
    subs: Arc<DashMap<String, Arc<Subscription>>>,
}

/// Build the HTTP router.
pub fn router(relay: Arc<Relay>) -> Router {
    let state = HttpState {
        relay,
        subs: Arc::new(DashMap::new()),
    };
    Router::new()
        .route("/v1/events", post(publish_event))
        .route("/v1/subscriptions", post(create_subscription))
        .route("/v1/subscriptions/:id", axum::routing::delete(delete_subscription))
        .route("/v1/stream", get(stream))
        .route("/v1/ws", get(ws_upgrade))
        .route("/healthz", get(healthz))
        .route("/metrics", get(metrics_handler))
        .with_state(state)
}

async fn publish_event(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let raw_event = payload.get("event").unwrap_or(&payload);
    let event = match event_from_value(raw_event) {
        Ok(event) => event,
        Err(detail) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "accepted": false,
                    "error": "invalid_event",
                    "message": detail,
                })),
            );
        }
    };

    match state.relay.publish("http-api", &event).await {
        Ok(status) => (
            StatusCode::ACCEPTED,
            Json(json!({
                "accepted": true,
                "event_id": event.event_id.to_string(),
                "status": status.label(),
            })),
        ),
        Err(err) => {
            let code = match &err {
                PublishError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
                PublishError::Validation(_) => StatusCode::BAD_REQUEST,
            };
            (
                code,
                Json(json!({
                    "accepted": false,
                    "event_id": event.event_id.to_string(),
                    "error": err.code(),
                    "message": err.to_string(),
                })),
            )
        }
    }
}

async fn create_subscription(
    State(state): State<HttpState>,
    Json(payload): Json<Value>,
) -> impl IntoResponse {
    let filters = match parse_filters(payload.get("filters")) {
        Ok(filters) => filters,
        Err(detail) => {
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({"error": "invalid_message", "message": detail})),
            );
        }
    };

    let sub_id = payload
        .get("subscription_id")
        .and_then(Value::as_str)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| format!("sub-{}", uuid::Uuid::new_v4().simple()));
    let conn_id = format!("http-sse-{sub_id}");

    // Backfill lands in the outbox ahead of live events, newest first,
    // subject to the same bounded-queue policy.
    let backfill = match state.relay.backfill(&filters).await {
        Ok(events) => events,
        Err(err) => {
            tracing::error!("backfill failed: {err}");
            return (
                StatusCode::INTERNAL_SERVER_ERROR,
                Json(json!({"error": "internal_error"})),
            );
        }
    };
    let subscription = state.relay.subscribe(&conn_id, &sub_id, filters);
    for event in backfill {
        subscription.outbox.push(event);
    }
    state.subs.insert(sub_id.clone(), subscription);

    (
        StatusCode::OK,
        Json(json!({"subscription_id": sub_id})),
    )
}

fn parse_filters(raw: Option<&Value>) -> Result<Vec<Filter>, String> {
    let parsed: Vec<Filter> = match raw {
        Some(Value::Object(_)) => {
            vec![Filter::from_value(raw.unwrap()).map_err(|e| e.to_string())?]
        }
        Some(Value::Array(items)) => {
            let mut filters = Vec::with_capacity(items.len());
            for item in items {
                filters.push(Filter::from_value(item).map_err(|e| e.to_string())?);
            }
            filters
        }
        _ => return Err("filters must be an object or a list".into()),
    };
    if parsed.is_empty() {
        return Err("filters required".into());
    }
    Ok(parsed)
}

async fn delete_subscription(
    State(state): State<HttpState>,
    Path(sub_id): Path<String>,
) -> impl IntoResponse {
    let Some((_, subscription)) = state.subs.remove(&sub_id) else {
        return (
            StatusCode::NOT_FOUND,
            Json(json!({"error": "subscription_not_found"})),
        );
    };
    state
        .relay
        .unsubscribe(&subscription.conn_id, &subscription.sub_id);
    (
        StatusCode::OK,
        Json(json!({"deleted": true, "subscription_id": sub_id})),
    )
}

#[derive(Deserialize)]
struct StreamParams {
    subscription_id: String,
}

async fn stream(
    State(state): State<HttpState>,
    Query(params): Query<StreamParams>,
) -> Result<impl IntoResponse, (StatusCode, Json<Value>)> {
    let Some(subscription) = state
        .subs
        .get(&params.subscription_id)
        .map(|entry| entry.value().clone())
    else {
        return Err((
            StatusCode::NOT_FOUND,
            Json(json!({"error": "subscription_not_found"})),
        ));
    };

    let events = futures_util::stream::unfold(subscription, |subscription| async move {
        let event = subscription.outbox.pop().await?;
        subscription.outbox.delivered.fetch_add(1, Ordering::Relaxed);
        let payload = json!({
            "type": "event",
            "sub_id": subscription.sub_id,
            "event": event,
        });
        let sse = SseEvent::default().event("event").data(payload.to_string());
        Some((Ok::<_, Infallible>(sse), subscription))
    });

    Ok(Sse::new(events).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("heartbeat"),
    ))
}

async fn healthz(State(state): State<HttpState>) -> impl IntoResponse {
    let counters = state.relay.subscription_counters();
    let dropped_total: u64 = counters.iter().map(|c| c.dropped).sum();
    let events_stored = state.relay.store().len().await.unwrap_or(0);
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "events_stored": events_stored,
        "subscriptions": counters,
        "dropped_total": dropped_total,
    }))
}

async fn metrics_handler(State(state): State<HttpState>) -> impl IntoResponse {
    let m = state.relay.metrics();
    let accepted = m.events_accepted.load(Ordering::Relaxed);
    let rejected = m.events_rejected.load(Ordering::Relaxed);
    let duplicate = m.events_duplicate.load(Ordering::Relaxed);
    let replaced = m.events_replaced.load(Ordering::Relaxed);
    let connections = m.connections_total.load(Ordering::Relaxed);
    let rate_limited = m.rate_limit_hits.load(Ordering::Relaxed);
    let counters = state.relay.subscription_counters();
    let delivered: u64 = counters.iter().map(|c| c.delivered).sum();
    let dropped: u64 = counters.iter().map(|c| c.dropped).sum();
    let subscriptions = state.relay.registry().len();
    let stored = state.relay.store().len().await.unwrap_or(0);

    let body = format!(
        r#"# HELP aether_relay_events_accepted_total Events accepted
# TYPE aether_relay_events_accepted_total counter
aether_relay_events_accepted_total {accepted}

# HELP aether_relay_events_rejected_total Events rejected by validation
# TYPE aether_relay_events_rejected_total counter
aether_relay_events_rejected_total {rejected}

# HELP aether_relay_events_duplicate_total Duplicate submissions acknowledged
# TYPE aether_relay_events_duplicate_total counter
aether_relay_events_duplicate_total {duplicate}

# HELP aether_relay_events_replaced_total Replaceable incumbents displaced
# TYPE aether_relay_events_replaced_total counter
aether_relay_events_replaced_total {replaced}

# HELP aether_relay_events_delivered Events delivered on live subscriptions
# TYPE aether_relay_events_delivered gauge
aether_relay_events_delivered {delivered}

# HELP aether_relay_events_dropped Events dropped from live subscription outboxes
# TYPE aether_relay_events_dropped gauge
aether_relay_events_dropped {dropped}

# HELP aether_relay_connections_total Connections accepted
# TYPE aether_relay_connections_total counter
aether_relay_connections_total {connections}

# HELP aether_relay_rate_limit_hits_total Publishes rejected by rate limiting
# TYPE aether_relay_rate_limit_hits_total counter
aether_relay_rate_limit_hits_total {rate_limited}

# HELP aether_relay_subscriptions_active Live subscriptions
# TYPE aether_relay_subscriptions_active gauge
aether_relay_subscriptions_active {subscriptions}

# HELP aether_relay_events_stored Events currently stored
# TYPE aether_relay_events_stored gauge
aether_relay_events_stored {stored}

# HELP aether_relay_info Server information
# TYPE aether_relay_info gauge
aether_relay_info{{version="{version}"}} 1
"#,
        version = env!("CARGO_PKG_VERSION"),
    );

    ([(CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")], body)
}

// JSON WebSocket mirroring native semantics: same message set, JSON
// only, no transport encryption.

struct JsonSender {
    tx: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl FrameSender for JsonSender {
    async fn send(&self, message: &Message) -> bool {
        match serde_json::to_string(message) {
            Ok(text) => self.tx.send(text).await.is_ok(),
            Err(_) => false,
        }
    }
}

async fn ws_upgrade(State(state): State<HttpState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.on_upgrade(move |socket| json_ws_connection(socket, state.relay))
}

async fn json_ws_connection(socket: WebSocket, relay: Arc<Relay>) {
    let conn_id = format!("http-ws-{}", uuid::Uuid::new_v4());
    relay
        .metrics()
        .connections_total
        .fetch_add(1, Ordering::Relaxed);

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<String>(64);
    let writer = tokio::spawn(async move {
        while let Some(text) = out_rx.recv().await {
            if ws_tx.send(WsMessage::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
    });
    let sender: Arc<dyn FrameSender> = Arc::new(JsonSender { tx: out_tx.clone() });

    while let Some(Ok(frame)) = ws_rx.next().await {
        let text = match frame {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        match serde_json::from_str::<Message>(&text) {
            Ok(Message::Hello(_)) => {
                let welcome = Message::Welcome(aether_types::Welcome {
                    version: crate::session::PROTOCOL_VERSION,
                    format: aether_types::WireFormat::Json,
                    noise: None,
                });
                sender.send(&welcome).await;
            }
            Ok(message) => {
                handle_steady_message(&relay, &conn_id, message, &sender).await;
            }
            Err(err) => {
                sender
                    .send(&Message::Error(aether_types::ErrorFrame::new(
                        "invalid_message",
                        err.to_string(),
                    )))
                    .await;
            }
        }
    }

    relay.disconnect(&conn_id);
    drop(out_tx);
    let _ = writer.await;
}
