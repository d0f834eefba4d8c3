// =============================================================================
// WebSocket Handler — run status over a bidirectional channel
// =============================================================================
//
// Clients connect to `/runs/{id}/ws` and receive:
//   1. An immediate `init` frame (payload hash + resolved config).
//   2. Differential status frames at a 1 s cadence whenever the record
//      changed since the last push.
// The connection closes once the run reaches a terminal status.
//
// The handler also responds to Ping frames with Pong and cleans up on
// disconnect; the poll loop dies with the connection.
// =============================================================================

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, State, WebSocketUpgrade,
    },
    response::IntoResponse,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use tokio::time::{interval, Duration};
use tracing::{debug, info};

use crate::api::stream::{payload_hash, status_payload};
use crate::app_state::AppState;

/// Axum handler for the WebSocket upgrade request.
pub async fn ws_run_status(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(run_id): Path<String>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, run_id))
}

async fn handle_ws_connection(socket: WebSocket, state: Arc<AppState>, run_id: String) {
    let (mut sender, mut receiver) = socket.split();

    let Some(rec) = state.registry.get(&run_id) else {
        let _ = sender
            .send(Message::Text(
                json!({"error": "run_not_found"}).to_string().into(),
            ))
            .await;
        let _ = sender.close().await;
        return;
    };

    // One-time init frame.
    let init = json!({
        "init": {
            "payload_hash": payload_hash(rec.meta.as_ref()),
            "config": rec
                .meta
                .as_ref()
                .and_then(|m| m.get("config_snapshot"))
                .cloned(),
        }
    });
    if sender.send(Message::Text(init.to_string().into())).await.is_err() {
        return;
    }

    let mut last: Option<serde_json::Value> = None;
    let mut poll = interval(Duration::from_secs(1));

    loop {
        tokio::select! {
            // ── Push loop: 1 s differential frames ──────────────────────
            _ = poll.tick() => {
                let Some(rec) = state.registry.get(&run_id) else {
                    break;
                };
                let payload = status_payload(&rec);
                if last.as_ref() != Some(&payload) {
                    if sender
                        .send(Message::Text(payload.to_string().into()))
                        .await
                        .is_err()
                    {
                        debug!(run_id = %run_id, "ws send failed — disconnecting");
                        break;
                    }
                    last = Some(payload);
                }
                if rec.status.is_terminal() {
                    info!(run_id = %run_id, "run terminal — closing ws");
                    break;
                }
            }

            // ── Recv loop: keepalive and disconnects ────────────────────
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Ping(data))) => {
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        debug!(run_id = %run_id, "ws closed by peer");
                        break;
                    }
                    Some(Ok(_)) => {
                        // Text/Binary/Pong from the peer carry no protocol
                        // meaning on this channel.
                    }
                    Some(Err(e)) => {
                        debug!(run_id = %run_id, error = %e, "ws receive error");
                        break;
                    }
                }
            }
        }
    }

    let _ = sender.close().await;
}
