//! Per-connection WebSocket handler.
//!
//! Each connection gets a relay-assigned party id and a bounded mpsc queue
//! feeding a write pump task. The read loop decodes frames into
//! [`WireMessage`]; malformed frames are logged and dropped, never allowed
//! to take the connection down. On disconnect the party leaves every channel
//! it joined and the remaining member is notified.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use canvaslink_protocol::WireMessage;

use crate::channels::{ChannelRegistry, JoinOutcome};

const OUTBOUND_QUEUE: usize = 256;

pub async fn handle_socket(socket: WebSocket, registry: Arc<ChannelRegistry>) {
    let party = uuid::Uuid::new_v4().to_string();
    debug!(party = %party, "connection opened");

    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Message>(OUTBOUND_QUEUE);

    // Write pump: everything addressed to this party funnels through here.
    let write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        let msg = match result {
            Ok(m) => m,
            Err(e) => {
                debug!(party = %party, error = %e, "read error");
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let frame: WireMessage = match serde_json::from_str(&text) {
                    Ok(frame) => frame,
                    Err(e) => {
                        warn!(party = %party, error = %e, "dropping malformed frame");
                        continue;
                    }
                };
                handle_frame(frame, &party, &registry, &tx).await;
            }
            Message::Ping(payload) => {
                let _ = tx.send(Message::Pong(payload)).await;
            }
            Message::Close(_) => break,
            // Text-frame protocol; binary and pong frames are ignored.
            _ => {}
        }
    }

    // Leave every joined channel and tell whoever is left behind.
    let left = registry.leave(&party).await;
    for channel in left {
        let notice = WireMessage::System {
            channel: channel.clone(),
            message: "peer left the channel".to_string(),
        };
        registry.relay(&channel, &party, &notice).await;
    }

    drop(tx);
    let _ = write_task.await;
    debug!(party = %party, "connection closed");
}

async fn handle_frame(
    frame: WireMessage,
    party: &str,
    registry: &ChannelRegistry,
    tx: &mpsc::Sender<Message>,
) {
    match frame {
        WireMessage::Join { channel } => {
            match registry.join(&channel, party, tx.clone()).await {
                JoinOutcome::Joined => {
                    info!(party = %party, channel = %channel, "joined channel");
                }
                JoinOutcome::AlreadyJoined => {
                    debug!(party = %party, channel = %channel, "rejoin ignored");
                }
            }
            // Confirmed on both paths: rejoining is a no-op, not an error.
            send_system(tx, &channel, format!("joined channel {channel}")).await;
        }
        WireMessage::Message { id, channel, message } => {
            if !registry.is_member(&channel, party).await {
                warn!(party = %party, channel = %channel, "message for unjoined channel refused");
                send_error(tx, format!("not a member of channel {channel}")).await;
                return;
            }
            let frame = WireMessage::Message {
                id,
                channel: channel.clone(),
                message,
            };
            let delivered = registry.relay(&channel, party, &frame).await;
            if delivered == 0 {
                debug!(party = %party, channel = %channel, "no peer in channel, frame dropped");
            }
        }
        WireMessage::CommandProgress(event) => {
            // Progress frames carry no channel; fan out on every channel the
            // sender belongs to (in practice exactly one).
            let frame = WireMessage::CommandProgress(event);
            for channel in registry.channels_of(party).await {
                registry.relay(&channel, party, &frame).await;
            }
        }
        WireMessage::System { .. } | WireMessage::Error { .. } => {
            debug!(party = %party, "ignoring relay-origin frame from client");
        }
    }
}

async fn send_system(tx: &mpsc::Sender<Message>, channel: &str, message: String) {
    send_frame(
        tx,
        &WireMessage::System {
            channel: channel.to_string(),
            message,
        },
    )
    .await;
}

async fn send_error(tx: &mpsc::Sender<Message>, message: String) {
    send_frame(tx, &WireMessage::Error { message }).await;
}

async fn send_frame(tx: &mpsc::Sender<Message>, frame: &WireMessage) {
    match serde_json::to_string(frame) {
        Ok(json) => {
            let _ = tx.send(Message::text(json)).await;
        }
        Err(e) => warn!(error = %e, "failed to encode relay frame"),
    }
}
