// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! WebSocket ingress — the peer fabric.
//!
//! Each text frame is one coordination message (JSON).  Binary frames are
//! rejected.  A connecting peer must introduce itself with `agent:register`
//! within the handshake grace period or the connection is closed.
//!
//! One loop per connection bridges both directions: inbound frames go to the
//! hub in arrival order; the hub's outbound queue for this peer is drained
//! onto the socket.  A write failure ends the connection, and the hub marks
//! the associated agent record expired.

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
};
use tracing::{debug, info, warn};

use agora_hub::{ConnectionHandle, HubHandle};
use agora_proto::{MessageType, PeerMessage};

use crate::http::{authorized, AppState};

/// A peer must send `agent:register` within this window.
pub const HANDSHAKE_GRACE: Duration = Duration::from_secs(10);

/// HTTP handler for `GET /ws`.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Response {
    if !authorized(&state, &headers) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let hub = state.hub.clone();
    let queue_capacity = state.config.messaging.outbound_queue;
    ws.on_upgrade(move |socket| handle_socket(socket, hub, queue_capacity))
}

/// Bridge one WebSocket connection to the hub until either side closes.
pub async fn handle_socket(mut socket: WebSocket, hub: HubHandle, queue_capacity: usize) {
    let conn = ConnectionHandle::new(queue_capacity);
    let conn_id = conn.id;
    hub.connected(conn.clone()).await;
    info!(conn = %conn_id, "peer connected");

    let grace = tokio::time::sleep(HANDSHAKE_GRACE);
    tokio::pin!(grace);
    let mut registered = false;

    loop {
        tokio::select! {
            // No registration within the grace period: drop the peer.
            _ = &mut grace, if !registered => {
                warn!(conn = %conn_id, "no agent:register within grace period");
                break;
            }
            // Outbound: drain this peer's queue onto the socket.
            maybe = conn.pop() => {
                let Some(msg) = maybe else { break };
                let Ok(text) = serde_json::to_string(&msg) else { continue };
                if socket.send(Message::Text(text)).await.is_err() {
                    debug!(conn = %conn_id, "write failed, closing");
                    break;
                }
            }
            // Inbound: one JSON message per text frame.
            frame = socket.recv() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let msg: PeerMessage = match serde_json::from_str(&text) {
                            Ok(m) => m,
                            Err(e) => {
                                warn!(conn = %conn_id, "unparseable frame: {e}");
                                continue;
                            }
                        };
                        if !registered {
                            if msg.kind() != Some(MessageType::AgentRegister) {
                                warn!(
                                    conn = %conn_id,
                                    message_type = %msg.message_type,
                                    "first frame must be agent:register"
                                );
                                break;
                            }
                            registered = true;
                        }
                        hub.deliver(msg, Some(conn_id)).await;
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(conn = %conn_id, "binary frames are rejected");
                        break;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {}
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        debug!(conn = %conn_id, "recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    conn.close();
    hub.disconnected(conn_id).await;
    info!(conn = %conn_id, "peer disconnected");
}
