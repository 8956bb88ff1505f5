use std::sync::atomic::Ordering;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{SinkExt, StreamExt};
use tracing::{debug, warn};

use crate::api::ApiState;
use crate::fanout::Subscription;

/// Upgrade handler for the live stream path.
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<ApiState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: ApiState) {
    let (mut sender, mut receiver) = socket.split();

    let subscription = state.fanout.subscribe();
    let id = subscription.id;
    let Subscription { rx: mut frames, queued_bytes, open, .. } = subscription;

    let mut send_task = tokio::spawn(async move {
        while open.load(Ordering::Relaxed) {
            match frames.recv().await {
                Some(frame) => {
                    let len = frame.len();
                    if let Err(e) = sender.send(Message::Text(frame.into())).await {
                        warn!(subscriber_id = ?id.0, error = %e, "websocket send failed");
                        break;
                    }
                    queued_bytes.fetch_sub(len, Ordering::Relaxed);
                }
                None => break,
            }
        }
        let _ = sender.close().await;
    });

    // Inbound frames: close ends the connection, everything else a
    // subscriber might send is ignored.
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = receiver.next().await {
            match message {
                Ok(Message::Close(_)) => {
                    debug!(subscriber_id = ?id.0, "websocket closed by client");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    debug!(subscriber_id = ?id.0, error = %e, "websocket receive error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    state.fanout.detach(id);
}
