//! WebSocket handler for Axum
//!
//! Pumps frames between the socket and a realtime [`Session`]. The session
//! owns all protocol state; this side only moves text in and envelopes out.

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    response::Response,
};
use forkcast_realtime::{ClientCommand, DisconnectReason, EventEnvelope, EventReceiver, Flow};
use futures::{
    stream::{SplitSink, StreamExt},
    SinkExt,
};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct WebSocketQuery {
    /// Authenticates during the upgrade instead of with an `authenticate` message
    token: Option<String>,
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(app_state): State<AppState>,
    Query(params): Query<WebSocketQuery>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, app_state, params.token))
}

type Sink = SplitSink<WebSocket, Message>;

/// Handle individual WebSocket connection
async fn handle_socket(socket: WebSocket, app_state: AppState, token: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel();
    let mut session = app_state.hub.session(tx);

    if let Some(token) = token {
        let flow = session
            .handle(ClientCommand::Authenticate { token: Some(token) })
            .await;
        if flow == Flow::Close {
            flush(&mut sender, &mut rx).await;
            let _ = sender.send(Message::Close(None)).await;
            return;
        }
    }

    let mut reason = DisconnectReason::ClientClosed;
    loop {
        let server_close = session.close_token();
        tokio::select! {
            () = closed(server_close) => {
                flush(&mut sender, &mut rx).await;
                let _ = sender.send(Message::Close(None)).await;
                break;
            }
            Some(envelope) = rx.recv() => {
                if !forward(&mut sender, &envelope).await {
                    reason = DisconnectReason::TransportError;
                    break;
                }
            }
            inbound = receiver.next() => match inbound {
                Some(Ok(Message::Text(text))) => {
                    if session.handle_text(&text).await == Flow::Close {
                        flush(&mut sender, &mut rx).await;
                        let _ = sender.send(Message::Close(None)).await;
                        break;
                    }
                }
                Some(Ok(Message::Pong(_))) => session.pong(),
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    tracing::debug!(error = %e, "WebSocket read failed");
                    reason = DisconnectReason::TransportError;
                    break;
                }
            }
        }
    }

    if let Some(conn) = session.connection() {
        tracing::info!(
            connection_id = %conn.id,
            user_id = %conn.identity.user_id,
            "WebSocket connection closing"
        );
    }
    session.close(reason).await;
}

/// Write one envelope; false once the socket is gone
async fn forward(sender: &mut Sink, envelope: &EventEnvelope) -> bool {
    match envelope.to_json() {
        Ok(json) => sender.send(Message::Text(json)).await.is_ok(),
        Err(e) => {
            tracing::error!(error = %e, event_type = %envelope.event_type, "Failed to serialize event");
            true
        }
    }
}

/// Drain whatever is already queued, e.g. the reply explaining a close
async fn flush(sender: &mut Sink, rx: &mut EventReceiver) {
    while let Ok(envelope) = rx.try_recv() {
        if !forward(sender, &envelope).await {
            break;
        }
    }
}

/// Resolves when the server closes the connection; never before authentication
async fn closed(token: Option<CancellationToken>) {
    match token {
        Some(token) => token.cancelled_owned().await,
        None => std::future::pending().await,
    }
}
