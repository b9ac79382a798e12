//! The native surface: the Codec/Session flow over WebSocket.
//!
//! One connection runs one [`WireSession`]: HELLO within the configured
//! window, WELCOME with the negotiated format (and the optional noise
//! upgrade), then steady-state PUBLISH/SUBSCRIBE/UNSUBSCRIBE. A single
//! writer task owns the socket's send half; subscription senders and the
//! session loop all feed it through a channel.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use aether_types::{ErrorFrame, Message, WireFormat};
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};

use super::{handle_steady_message, FrameSender};
use crate::relay::Relay;
use crate::session::{SessionPhase, WireSession};

/// Build the native router.
pub fn router(relay: Arc<Relay>) -> Router {
    Router::new().route("/", get(upgrade)).with_state(relay)
}

async fn upgrade(ws: WebSocketUpgrade, State(relay): State<Arc<Relay>>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| connection(socket, relay))
}

struct NativeSender {
    session: Arc<Mutex<WireSession>>,
    tx: mpsc::Sender<WsMessage>,
}

#[async_trait::async_trait]
impl FrameSender for NativeSender {
    async fn send(&self, message: &Message) -> bool {
        let frame = {
            let mut session = self.session.lock().await;
            match session.encode_outbound(message) {
                Ok(frame) => frame,
                Err(err) => {
                    tracing::warn!("outbound encode failed: {err}");
                    return false;
                }
            }
        };
        let ws_message = if frame.binary {
            WsMessage::Binary(frame.bytes)
        } else {
            match String::from_utf8(frame.bytes) {
                Ok(text) => WsMessage::Text(text),
                Err(_) => return false,
            }
        };
        self.tx.send(ws_message).await.is_ok()
    }
}

async fn connection(socket: WebSocket, relay: Arc<Relay>) {
    let conn_id = format!("native-{}", uuid::Uuid::new_v4());
    relay
        .metrics()
        .connections_total
        .fetch_add(1, Ordering::Relaxed);
    tracing::info!(conn = %conn_id, "native connection open");

    let (ws_tx, mut ws_rx) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<WsMessage>(64);
    let writer = tokio::spawn(write_loop(ws_tx, out_rx));

    let session = Arc::new(Mutex::new(WireSession::new()));
    let sender: Arc<dyn FrameSender> = Arc::new(NativeSender {
        session: session.clone(),
        tx: out_tx.clone(),
    });

    run_session(&relay, &conn_id, &session, &sender, &out_tx, &mut ws_rx).await;

    relay.disconnect(&conn_id);
    session.lock().await.close();
    drop(out_tx);
    let _ = writer.await;
    tracing::info!(conn = %conn_id, "native connection closed");
}

async fn run_session(
    relay: &Arc<Relay>,
    conn_id: &str,
    session: &Arc<Mutex<WireSession>>,
    sender: &Arc<dyn FrameSender>,
    out_tx: &mpsc::Sender<WsMessage>,
    ws_rx: &mut SplitStream<WebSocket>,
) {
    let hello_window = Duration::from_secs(relay.config().server.hello_timeout_secs);
    let idle_window = Duration::from_secs(relay.config().server.idle_timeout_secs);

    // NEW: the first frame must be HELLO, within the window.
    let (data, binary) = match tokio::time::timeout(hello_window, next_data(ws_rx)).await {
        Err(_) => {
            tracing::debug!(conn = %conn_id, "hello timeout");
            send_plain_error(out_tx, "invalid_message", "hello timeout").await;
            return;
        }
        Ok(None) => return,
        Ok(Some(frame)) => frame,
    };

    let welcome = {
        let mut session = session.lock().await;
        session.process_hello(&data, binary)
    };
    match welcome {
        Ok(frame) => {
            let message = if frame.binary {
                WsMessage::Binary(frame.bytes)
            } else {
                WsMessage::Text(String::from_utf8_lossy(&frame.bytes).into_owned())
            };
            if out_tx.send(message).await.is_err() {
                return;
            }
        }
        Err(err) => {
            tracing::debug!(conn = %conn_id, "handshake failed: {err}");
            send_plain_error(out_tx, err.code(), &err.to_string()).await;
            return;
        }
    }

    // ACTIVE: inbound frames in arrival order; idle sessions get pinged.
    loop {
        let (data, _binary) = match tokio::time::timeout(idle_window, next_data(ws_rx)).await {
            Err(_) => {
                if out_tx.send(WsMessage::Ping(Vec::new())).await.is_err() {
                    return;
                }
                continue;
            }
            Ok(None) => return,
            Ok(Some(frame)) => frame,
        };

        let decoded = {
            let mut session = session.lock().await;
            session.decode_inbound(&data)
        };
        match decoded {
            Ok(message) => {
                handle_steady_message(relay, conn_id, message, sender).await;
            }
            Err(err) => {
                sender
                    .send(&Message::Error(ErrorFrame::new(
                        err.code(),
                        err.to_string(),
                    )))
                    .await;
                let fatal = {
                    let session = session.lock().await;
                    session.noise_fatal() || session.phase() == SessionPhase::Closed
                };
                if fatal {
                    tracing::warn!(conn = %conn_id, "session fatal after repeated failures");
                    return;
                }
            }
        }
    }
}

async fn write_loop(
    mut ws_tx: SplitSink<WebSocket, WsMessage>,
    mut out_rx: mpsc::Receiver<WsMessage>,
) {
    while let Some(message) = out_rx.recv().await {
        if ws_tx.send(message).await.is_err() {
            break;
        }
    }
    let _ = ws_tx.close().await;
}

/// Pull the next data frame off the socket, skipping control frames.
/// `None` means the connection is gone.
async fn next_data(ws_rx: &mut SplitStream<WebSocket>) -> Option<(Vec<u8>, bool)> {
    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(WsMessage::Text(text)) => return Some((text.into_bytes(), false)),
            Ok(WsMessage::Binary(bytes)) => return Some((bytes, true)),
            Ok(WsMessage::Ping(_)) | Ok(WsMessage::Pong(_)) => continue,
            Ok(WsMessage::Close(_)) | Err(_) => return None,
        }
    }
    None
}

/// Error before the session format is settled goes out as plain JSON.
async fn send_plain_error(out_tx: &mpsc::Sender<WsMessage>, code: &str, detail: &str) {
    let frame = Message::Error(ErrorFrame::new(code, detail));
    if let Ok(bytes) = aether_types::encode(&frame, WireFormat::Json) {
        let _ = out_tx
            .send(WsMessage::Text(
                String::from_utf8_lossy(&bytes).into_owned(),
            ))
            .await;
    }
}
