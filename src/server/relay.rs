//! Observer relay: every WebSocket connection on `/ws` gets its own
//! subscription and receives each status payload verbatim, in order.
//!
//! A slow observer only backs up its own subscription; publishers never
//! wait on it.

use axum::Router;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::response::Response;
use axum::routing::get;
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::broadcast::StatusBroadcaster;

/// Routes `/ws` and `/health`.
pub fn relay_router(broadcaster: StatusBroadcaster) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(|| async { "OK" }))
        .with_state(broadcaster)
}

async fn ws_handler(ws: WebSocketUpgrade, State(broadcaster): State<StatusBroadcaster>) -> Response {
    ws.on_upgrade(move |socket| relay(socket, broadcaster))
}

async fn relay(socket: WebSocket, broadcaster: StatusBroadcaster) {
    let mut updates = match broadcaster.subscribe_raw().await {
        Ok(s) => s,
        Err(e) => {
            warn!(channel = broadcaster.channel(), "subscribe failed: {e}");
            return;
        }
    };
    debug!(channel = broadcaster.channel(), "observer attached");

    let (mut sender, mut receiver) = socket.split();

    loop {
        tokio::select! {
            payload = updates.next() => {
                let Some(payload) = payload else { break };
                if let Err(e) = sender.send(Message::Text(payload.into())).await {
                    debug!("observer write failed: {e}");
                    break;
                }
            }
            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Close(_))) | None | Some(Err(_)) => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
    debug!(channel = broadcaster.channel(), "observer detached");
}
