// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//!
//! Outbound WebSocket dialer — connects to the peer hubs listed in
//! `network.peers` and speaks the same frame protocol as the ingress side.
//!
//! The dialed hub expects `agent:register` first, so the host descriptor is
//! announced immediately after the connection comes up.  There is no retry
//! loop: a lost peer is healed by the next inbound registration, matching
//! the ingress recovery model.

use futures::{SinkExt, StreamExt};
use tokio_tungstenite::{connect_async, tungstenite};
use tracing::{debug, info, warn};

use agora_hub::{ConnectionHandle, HubHandle};
use agora_proto::{MessageType, PeerMessage, BROADCAST};

/// Dial one peer hub and bridge the connection until either side closes.
pub async fn dial_peer(url: String, hub: HubHandle, queue_capacity: usize) {
    let (mut socket, _) = match connect_async(url.as_str()).await {
        Ok(ok) => ok,
        Err(e) => {
            warn!(%url, "could not dial peer hub: {e}");
            return;
        }
    };
    info!(%url, "dialed peer hub");

    let conn = ConnectionHandle::new(queue_capacity);
    let conn_id = conn.id;
    hub.connected(conn.clone()).await;

    // Introduce ourselves before anything else.
    let descriptor = hub.host_descriptor();
    let register = PeerMessage::new(
        MessageType::AgentRegister,
        descriptor.identity.clone(),
        BROADCAST,
        serde_json::to_value(&descriptor).unwrap_or_default(),
    );
    let frame = serde_json::to_string(&register).unwrap_or_default();
    if socket.send(tungstenite::Message::Text(frame)).await.is_err() {
        warn!(%url, "registration write failed");
        conn.close();
        hub.disconnected(conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            maybe = conn.pop() => {
                let Some(msg) = maybe else { break };
                let Ok(text) = serde_json::to_string(&msg) else { continue };
                if socket.send(tungstenite::Message::Text(text)).await.is_err() {
                    debug!(%url, "write failed, closing");
                    break;
                }
            }
            frame = socket.next() => {
                match frame {
                    Some(Ok(tungstenite::Message::Text(text))) => {
                        match serde_json::from_str::<PeerMessage>(&text) {
                            Ok(msg) => hub.deliver(msg, Some(conn_id)).await,
                            Err(e) => warn!(%url, "unparseable frame: {e}"),
                        }
                    }
                    Some(Ok(tungstenite::Message::Ping(data))) => {
                        if socket.send(tungstenite::Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(tungstenite::Message::Binary(_))) => {
                        warn!(%url, "binary frames are rejected");
                        break;
                    }
                    Some(Ok(tungstenite::Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!(%url, "recv error: {e}");
                        break;
                    }
                }
            }
        }
    }

    conn.close();
    hub.disconnected(conn_id).await;
    info!(%url, "peer hub connection closed");
}
