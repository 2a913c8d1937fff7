//! WebSocket transport
//!
//! The credential is checked before the upgrade; a rejected handshake gets a
//! plain 401 and never reaches the room registry. Each accepted socket runs
//! a writer task draining the connection's outbox and a reader loop that
//! handles inbound frames one at a time, in arrival order.

use axum::{
    extract::{
        ws::{
            rejection::WebSocketUpgradeRejection, Message as WsMessage, WebSocket,
            WebSocketUpgrade,
        },
        Query, State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::core::auth::extract_credential;
use crate::core::config::AppState;
use crate::core::models::Identity;

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    pub token: Option<String>,
}

/// GET /ws?token=...
pub async fn ws_handler(
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
    Query(params): Query<WsParams>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    let credential = extract_credential(&headers, params.token.as_deref());
    let identity = match state.auth.authenticate(credential.as_deref()).await {
        Ok(identity) => identity,
        Err(e) => return e.into_response(),
    };

    match ws {
        Ok(ws) => ws.on_upgrade(move |socket| handle_socket(socket, state, identity)),
        Err(rejection) => rejection.into_response(),
    }
}

async fn handle_socket(socket: WebSocket, state: AppState, identity: Identity) {
    let (conn, mut outbox) = state.coordinator.connect(&identity).await;
    let (mut sink, mut stream) = socket.split();

    let writer = tokio::spawn(async move {
        while let Some(event) = outbox.recv().await {
            let frame = match event.to_frame() {
                Ok(frame) => frame,
                Err(e) => {
                    warn!("[Socket] Dropping {}: {}", event.name(), e);
                    continue;
                }
            };
            if sink.send(WsMessage::Text(frame.into())).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    while let Some(incoming) = stream.next().await {
        match incoming {
            Ok(WsMessage::Text(text)) => {
                state
                    .coordinator
                    .handle_frame(conn, &identity, text.as_str())
                    .await;
            }
            Ok(WsMessage::Close(_)) => break,
            Ok(WsMessage::Binary(_)) => {
                debug!("[Socket] Ignoring binary frame from {}", conn);
            }
            Ok(_) => {}
            Err(e) => {
                info!("[Socket] {} closed abruptly: {}", conn, e);
                break;
            }
        }
    }

    state.coordinator.disconnect(conn, &identity).await;
    writer.abort();
}
