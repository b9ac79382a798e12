//! Wire surfaces over the shared relay core.
//!
//! Three adapters: the native protocol, a NIP-01 compatible text
//! protocol, and an HTTP surface (REST + SSE + JSON WebSocket). Each
//! normalizes its ingress shape to the same [`Event`] so every surface
//! produces bit-identical event ids.

pub mod http;
pub mod native;
pub mod nostr;

use std::sync::Arc;

use aether_types::{Ack, ErrorFrame, Event, EventFrame, Message};
use async_trait::async_trait;
use serde_json::Value;

use crate::dispatch::{spawn_sender, EventSink};
use crate::relay::{PublishError, Relay};
use crate::session::message_name;

/// A connection's outbound half, as seen by the shared steady-state
/// handler. Implementations own the surface-specific encoding.
#[async_trait]
pub(crate) trait FrameSender: Send + Sync + 'static {
    /// Send one protocol message. Returns false when the connection is
    /// gone.
    async fn send(&self, message: &Message) -> bool;
}

/// Adapts a [`FrameSender`] into the dispatcher's [`EventSink`].
pub(crate) struct SinkAdapter(pub Arc<dyn FrameSender>);

#[async_trait]
impl EventSink for SinkAdapter {
    async fn deliver(&self, sub_id: &str, event: &Event) -> bool {
        self.0
            .send(&Message::Event(EventFrame {
                sub_id: sub_id.to_string(),
                event: event.clone(),
            }))
            .await
    }
}

/// Steady-state message handling shared by the native and JSON-WebSocket
/// surfaces: PUBLISH, SUBSCRIBE, UNSUBSCRIBE; anything else is answered
/// with an ERROR frame and the session stays active.
pub(crate) async fn handle_steady_message(
    relay: &Arc<Relay>,
    conn_id: &str,
    message: Message,
    sender: &Arc<dyn FrameSender>,
) {
    match message {
        Message::Publish(publish) => {
            let event_id = publish.event.event_id;
            let ack = match relay.publish(conn_id, &publish.event).await {
                Ok(status) => Ack {
                    event_id,
                    accepted: true,
                    reason: status.ack_reason().map(str::to_string),
                },
                Err(err) => {
                    if matches!(err, PublishError::Storage(_)) {
                        tracing::error!(%event_id, "storage failure on publish: {err}");
                    }
                    Ack {
                        event_id,
                        accepted: false,
                        reason: Some(err.code().to_string()),
                    }
                }
            };
            sender.send(&Message::Ack(ack)).await;
        }
        Message::Subscribe(subscribe) => {
            let backfill = match relay.backfill(&subscribe.filters).await {
                Ok(events) => events,
                Err(err) => {
                    tracing::error!("backfill failed: {err}");
                    sender
                        .send(&Message::Error(ErrorFrame::new(
                            "internal_error",
                            err.to_string(),
                        )))
                        .await;
                    return;
                }
            };
            for event in backfill {
                if !sender
                    .send(&Message::Event(EventFrame {
                        sub_id: subscribe.sub_id.clone(),
                        event,
                    }))
                    .await
                {
                    return;
                }
            }
            let subscription = relay.subscribe(conn_id, &subscribe.sub_id, subscribe.filters);
            spawn_sender(subscription, Arc::new(SinkAdapter(sender.clone())));
        }
        Message::Unsubscribe(unsubscribe) => {
            if !relay.unsubscribe(conn_id, &unsubscribe.sub_id) {
                sender
                    .send(&Message::Error(ErrorFrame::new(
                        "subscription_not_found",
                        unsubscribe.sub_id,
                    )))
                    .await;
            }
        }
        other => {
            sender
                .send(&Message::Error(ErrorFrame::new(
                    "invalid_message",
                    format!("unexpected {} message", message_name(&other)),
                )))
                .await;
        }
    }
}

/// Normalize an ingress event object, accepting the `id` alias for
/// `event_id` that NIP-01 clients send.
pub(crate) fn event_from_value(raw: &Value) -> Result<Event, String> {
    let mut value = raw.clone();
    if let Some(obj) = value.as_object_mut() {
        if !obj.contains_key("event_id") {
            if let Some(id) = obj.get("id").cloned() {
                obj.insert("event_id".to_string(), id);
            }
        }
    }
    serde_json::from_value(value).map_err(|e| e.to_string())
}

/// Render an event for a NIP-01 client: the same object with the id
/// mirrored into `id`.
pub(crate) fn event_to_nostr_value(event: &Event) -> Value {
    let mut value = serde_json::to_value(event).expect("event serializes");
    if let Some(obj) = value.as_object_mut() {
        obj.insert(
            "id".to_string(),
            Value::String(event.event_id.to_string()),
        );
    }
    value
}
