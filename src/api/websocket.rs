// Live socket for an actor room
// Pushes per-connection JSON-patch diffs and forwards inbound events to the host

use axum::{
    extract::{
        ws::{Message, WebSocket},
        Path, Query, State, WebSocketUpgrade,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tracing::{debug, error, warn};

use super::handlers::credentials;
use super::types::TokenQuery;
use super::ApiState;
use crate::engine::host::{ActorHost, CallerCredentials};

/// `GET /:actor_type/:id/socket`
pub async fn socket_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    Path((actor_type, id)): Path<(String, String)>,
    Query(query): Query<TokenQuery>,
    headers: HeaderMap,
) -> Response {
    let host = match state.hub.host(&actor_type, &id) {
        Ok(host) => host,
        Err(e) => return e.into_response(),
    };
    let creds = credentials(&headers, query.token);
    ws.on_upgrade(move |socket| handle_socket(socket, host, creds))
}

/// Process one socket. A caller that cannot be resolved gets the socket
/// closed without any message.
async fn handle_socket(socket: WebSocket, host: Arc<ActorHost>, creds: CallerCredentials) {
    let (mut ws_sender, mut ws_receiver) = socket.split();

    let Some(connection) = host.on_connect(&creds).await else {
        let _ = ws_sender.send(Message::Close(None)).await;
        return;
    };
    let connection_id = connection.connection_id.clone();
    let mut updates = connection.updates;

    let mut send_task = tokio::spawn(async move {
        while let Some(diff) = updates.recv().await {
            let json = match serde_json::to_string(&diff) {
                Ok(json) => json,
                Err(e) => {
                    error!("Failed to serialize diff: {}", e);
                    continue;
                }
            };
            if let Err(e) = ws_sender.send(Message::Text(json)).await {
                debug!("Socket send failed: {}", e);
                break;
            }
        }
    });

    let recv_host = host.clone();
    let recv_id = connection_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(message)) = ws_receiver.next().await {
            match message {
                Message::Text(text) => {
                    if let Err(e) = recv_host.on_message(&recv_id, &text).await {
                        warn!("Rejected socket event on {}: {}", recv_id, e);
                    }
                }
                Message::Binary(bytes) => match String::from_utf8(bytes) {
                    Ok(text) => {
                        if let Err(e) = recv_host.on_message(&recv_id, &text).await {
                            warn!("Rejected socket event on {}: {}", recv_id, e);
                        }
                    }
                    Err(_) => warn!("Ignoring non-UTF-8 frame on {}", recv_id),
                },
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }

    host.on_close(&connection_id).await;
}
