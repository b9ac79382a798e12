//! NIP-01 compatible WebSocket adapter.
//!
//! Text frames only. Inbound `["EVENT", event]`, `["REQ", sub_id,
//! filter, ...]`, `["CLOSE", sub_id]`; outbound `["OK", ...]`,
//! `["EVENT", sub_id, event]`, `["EOSE", sub_id]`, `["NOTICE", text]`.
//! The adapter translates `id` ↔ `event_id` and NIP-01 filters before
//! anything reaches the validator, so this surface produces the same
//! event ids as every other.
//!
//! EOSE is emitted after REQ backfill unconditionally, empty backfill
//! included.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use aether_types::{Event, Filter, FilterError};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use super::{event_from_value, event_to_nostr_value};
use crate::dispatch::{spawn_sender, EventSink};
use crate::relay::Relay;

/// Build the NIP-01 router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new().route("/", get(upgrade)).with_state(relay)
}

async fn upgrade(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, relay))
}

struct NostrSink {
    tx: mpsc::Sender<String>,
}

#[async_trait::async_trait]
impl EventSink for NostrSink {
    async fn deliver(&self, sub_id: &str, event: &Event) -> bool {
        let frame = json!(["EVENT", sub_id, event_to_nostr_value(event)]);
        self.tx.send(frame.to_string()).await.is_ok()
    }
}

async fn connection(socket: WebSocket, relay: Arc<Relay>) {
    let conn_id = format!("nostr-{}", uuid::Uuid::new_v4());
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

    while let Some(Ok(message)) = ws_rx.next().await {
        let text = match message {
            WsMessage::Text(text) => text,
            WsMessage::Close(_) => break,
            _ => continue,
        };
        if handle_frame(&relay, &conn_id, &text, &out_tx).await.is_err() {
            break;
        }
    }

    relay.disconnect(&conn_id);
    drop(out_tx);
    let _ = writer.await;
}

async fn handle_frame(
    relay: &Arc<Relay>,
    conn_id: &str,
    text: &str,
    out_tx: &mpsc::Sender<String>,
) -> Result<(), ()> {
    let send = |frame: Value| {
        let out_tx = out_tx.clone();
        async move { out_tx.send(frame.to_string()).await.map_err(|_| ()) }
    };

    let Ok(value) = serde_json::from_str::<Value>(text) else {
        return send(json!(["NOTICE", "invalid_message: not json"])).await;
    };
    let Some(array) = value.as_array() else {
        return send(json!(["NOTICE", "invalid_message: expected array message"])).await;
    };
    match array.first().and_then(Value::as_str) {
        Some("EVENT") => {
            let Some(raw_event) = array.get(1).filter(|v| v.is_object()) else {
                return send(json!(["NOTICE", "invalid_message: EVENT payload invalid"])).await;
            };
            match event_from_value(raw_event) {
                Ok(event) => {
                    let id_hex = event.event_id.to_string();
                    match relay.publish(conn_id, &event).await {
                        Ok(status) => {
                            let note = status.ack_reason().unwrap_or("accepted");
                            send(json!(["OK", id_hex, true, note])).await
                        }
                        Err(err) => {
                            send(json!([
                                "OK",
                                id_hex,
                                false,
                                format!("{}: {}", err.code(), err)
                            ]))
                            .await
                        }
                    }
                }
                Err(detail) => {
                    let claimed = raw_event
                        .get("id")
                        .or_else(|| raw_event.get("event_id"))
                        .and_then(Value::as_str)
                        .unwrap_or("");
                    send(json!([
                        "OK",
                        claimed,
                        false,
                        format!("invalid_event: {detail}")
                    ]))
                    .await
                }
            }
        }
        Some("REQ") => {
            let Some(sub_id) = array.get(1).and_then(Value::as_str) else {
                return send(json!(["NOTICE", "invalid_message: REQ requires sub_id"])).await;
            };
            if array.len() < 3 {
                return send(json!(["NOTICE", "invalid_message: REQ requires a filter"])).await;
            }
            let mut filters = Vec::with_capacity(array.len() - 2);
            for raw in &array[2..] {
                match nostr_filter(raw) {
                    Ok(filter) => filters.push(filter),
                    Err(err) => {
                        return send(json!(["NOTICE", format!("invalid_message: {err}")])).await
                    }
                }
            }

            let backfill = match relay.backfill(&filters).await {
                Ok(events) => events,
                Err(err) => {
                    tracing::error!("backfill failed: {err}");
                    return send(json!(["NOTICE", "internal_error"])).await;
                }
            };
            for event in backfill {
                send(json!(["EVENT", sub_id, event_to_nostr_value(&event)])).await?;
            }
            send(json!(["EOSE", sub_id])).await?;

            let subscription = relay.subscribe(conn_id, sub_id, filters);
            spawn_sender(
                subscription,
                Arc::new(NostrSink {
                    tx: out_tx.clone(),
                }),
            );
            Ok(())
        }
        Some("CLOSE") => {
            let Some(sub_id) = array.get(1).and_then(Value::as_str) else {
                return send(json!(["NOTICE", "invalid_message: CLOSE requires sub_id"])).await;
            };
            if !relay.unsubscribe(conn_id, sub_id) {
                return send(json!(["NOTICE", format!("subscription_not_found: {sub_id}")]))
                    .await;
            }
            Ok(())
        }
        _ => send(json!(["NOTICE", "invalid_message: unsupported command"])).await,
    }
}

/// Translate a NIP-01 filter object into a native [`Filter`].
///
/// `authors` hex prefixes become pubkey byte prefixes (odd-length
/// prefixes lose their trailing nibble; anything past 32 bytes is cut),
/// `#x` keys become tag requirements, and `kinds`/`since`/`until`/`limit`
/// pass through.
pub fn nostr_filter(raw: &Value) -> Result<Filter, FilterError> {
    let Some(object) = raw.as_object() else {
        return Err(FilterError::BadTagFilter);
    };

    let mut translated = serde_json::Map::new();
    let mut tags = serde_json::Map::new();

    for (key, value) in object {
        match key.as_str() {
            "kinds" | "since" | "until" | "limit" => {
                translated.insert(key.clone(), value.clone());
            }
            "authors" => {
                let list = value.as_array().ok_or(FilterError::BadList("authors"))?;
                let mut prefixes = Vec::with_capacity(list.len());
                for author in list {
                    let text = author.as_str().ok_or(FilterError::BadPrefix)?;
                    prefixes.push(Value::String(author_prefix(text)));
                }
                translated.insert("pubkey_prefixes".to_string(), Value::Array(prefixes));
            }
            tag_key if tag_key.starts_with('#') && tag_key.len() > 1 => {
                tags.insert(tag_key[1..].to_string(), value.clone());
            }
            _ => {}
        }
    }
    if !tags.is_empty() {
        translated.insert("tags".to_string(), Value::Object(tags));
    }

    Filter::from_value(&Value::Object(translated))
}

// Hex author prefix → even-length hex capped at 32 bytes.
fn author_prefix(text: &str) -> String {
    let text = text.to_ascii_lowercase();
    let even = if text.len() % 2 == 1 {
        &text[..text.len() - 1]
    } else {
        &text[..]
    };
    even.chars().take(64).collect()
}
