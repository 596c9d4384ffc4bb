//! WebSocket connection lifecycle: session setup, read/write loops, cleanup.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use voice_relay_core::protocol::{ClientEvent, ClientFrame, Outbound};

use crate::metrics;
use crate::session::SessionRunner;
use crate::state::GatewayState;

/// Handle a new WebSocket connection.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Everything bound for the browser goes through this channel
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Outbound>();

    let (handle, inbox) = state.registry.open(&conn_id).await;
    let Some(inbox) = inbox else {
        warn!(conn_id = %conn_id, "Connection id already registered, dropping connection");
        return;
    };
    metrics::record_session_opened();

    let runner = SessionRunner::new(
        conn_id.clone(),
        state.services.clone(),
        out_tx,
        handle.cancel_token(),
    );
    let session_task = tokio::spawn(runner.run(inbox, Some(state.welcome_message())));

    // Spawn event sender task
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            let msg = match outbound {
                Outbound::Frame(frame) => match serde_json::to_string(&frame) {
                    Ok(json) => Message::Text(json.into()),
                    Err(e) => {
                        warn!(%e, "Failed to encode server frame");
                        continue;
                    }
                },
                Outbound::Audio(bytes) => Message::Binary(bytes.into()),
            };
            if ws_tx.send(msg).await.is_err() {
                break;
            }
        }
    });

    // Main read loop
    while let Some(msg_result) = ws_rx.next().await {
        let event = match msg_result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientFrame>(text.as_str()) {
                Ok(frame) => ClientEvent::from(frame),
                Err(e) => {
                    warn!(conn_id = %conn_id, %e, "Ignoring invalid client frame");
                    continue;
                }
            },
            Ok(Message::Binary(bytes)) => ClientEvent::AudioChunk(bytes.to_vec()),
            Ok(Message::Close(_)) => {
                debug!(conn_id = %conn_id, "Client requested close");
                break;
            }
            Ok(_) => continue,
            Err(e) => {
                error!(conn_id = %conn_id, %e, "WebSocket error");
                break;
            }
        };
        if !state.registry.forward(&conn_id, event).await {
            debug!(conn_id = %conn_id, "Session gone, stopping read loop");
            break;
        }
    }

    // Cleanup
    state.registry.close(&conn_id).await;
    if let Err(e) = session_task.await {
        warn!(conn_id = %conn_id, %e, "Session task ended abnormally");
    }
    send_task.abort();
    metrics::record_session_closed();
    info!(conn_id = %conn_id, "WebSocket connection closed");
}
