//! WebSocket connection lifecycle: register, pump frames, tear down.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use tutor_relay_core::protocol::{ServerEvent, parse_control};

use crate::session::{Session, SessionEvent};
use crate::state::GatewayState;

/// Handle a new client connection for its whole lifetime.
pub async fn handle_ws_connection(state: Arc<GatewayState>, ws: WebSocket) {
    let conn_id = Uuid::new_v4().to_string();
    info!(conn_id = %conn_id, "New WebSocket connection");

    let (mut ws_tx, mut ws_rx) = ws.split();

    let (event_tx, mut event_rx) = mpsc::unbounded_channel::<ServerEvent>();
    let session = Session::spawn(conn_id.clone(), &state.config, state.streamer(), event_tx);
    state.register(&conn_id, session.shutdown_token()).await;

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_open();

    // Writer: serialize server events in order; close the socket once the
    // session drops its sender.
    let writer_conn_id = conn_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(event) = event_rx.recv().await {
            let text = match serde_json::to_string(&event) {
                Ok(text) => text,
                Err(e) => {
                    error!(conn_id = %writer_conn_id, "Failed to serialize {}: {e}", event.name());
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    // Reader: control messages and audio into the session queue
    loop {
        let msg = tokio::select! {
            _ = session.closed() => {
                debug!(conn_id = %conn_id, "Session ended; closing connection");
                break;
            }
            msg = ws_rx.next() => msg,
        };

        let event = match msg {
            Some(Ok(Message::Binary(data))) => SessionEvent::Audio(data.to_vec()),
            Some(Ok(Message::Text(text))) => match parse_control(text.as_str()) {
                Some(message) => {
                    debug!(conn_id = %conn_id, ?message, "Control message");
                    SessionEvent::Client(message)
                }
                None => SessionEvent::Audio(text.as_str().as_bytes().to_vec()),
            },
            Some(Ok(Message::Close(_))) | None => {
                info!(conn_id = %conn_id, "Client disconnected");
                break;
            }
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(conn_id = %conn_id, "WebSocket error: {e}");
                break;
            }
        };

        if !session.send(event) {
            break;
        }
    }

    // Dropping the handle ends the session, which closes both upstreams
    drop(session);
    cleanup_connection(&state, &conn_id).await;

    // Let the writer flush anything the session sent on its way out
    if tokio::time::timeout(std::time::Duration::from_secs(1), &mut send_task)
        .await
        .is_err()
    {
        debug!(conn_id = %conn_id, "Writer did not finish in time");
        send_task.abort();
    }
}

async fn cleanup_connection(state: &GatewayState, conn_id: &str) {
    if let Some(entry) = state.unregister(conn_id).await {
        let secs = (chrono::Utc::now() - entry.connected_at).num_seconds();
        info!(conn_id = %conn_id, duration_secs = secs, "Connection cleaned up");
    }

    #[cfg(feature = "metrics")]
    crate::metrics::record_session_close();
}
