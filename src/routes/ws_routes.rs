use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::IntoResponse;
use serde::Deserialize;
use tracing::{debug, error, info, warn};

use crate::models::WsEvent;
use crate::service::{ChatService, ClientSession};

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Chat to resume after a reconnect.
    pub chat_id: Option<String>,
}

/// GET `/ws`: upgrades to a WebSocket speaking the chat protocol.
pub async fn ws_chat_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(svc): State<ChatService>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, svc, params.chat_id))
}

/// Handles a single WebSocket connection.
///
/// Protocol:
/// - Client sends JSON commands tagged by `event` (`chat`, `edit`, `continue`,
///   `regenerate`, `change_active_child`, `stop_generation`, `new_chat`, ...).
/// - Server answers rejected commands with `{ "event": "error", ... }` and
///   pushes every change of the attached chat (`chat_update`, `chat_saved`,
///   `chat_deleted`) to all connections attached to it.
async fn handle_socket(mut socket: WebSocket, svc: ChatService, chat_id: Option<String>) {
    let (mut client, greeting) = ClientSession::open(svc, chat_id.as_deref()).await;
    info!("WebSocket client connected to chat {}", client.chat_id());

    if !send_events(&mut socket, &greeting).await {
        client.close().await;
        return;
    }

    loop {
        let outgoing = tokio::select! {
            msg = socket.recv() => {
                let text = match msg {
                    Some(Ok(Message::Text(t))) => t.to_string(),
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => {
                        warn!("WebSocket receive error: {e}");
                        break;
                    }
                };
                client.handle_text(&text).await
            }
            received = client.recv() => client.handle_broadcast(received).await,
        };

        if !send_events(&mut socket, &outgoing).await {
            debug!("WebSocket send failed, client disconnected");
            break;
        }
    }

    info!("WebSocket client disconnected from chat {}", client.chat_id());
    client.close().await;
}

/// Serializes and sends each event; returns `false` once the socket is gone.
async fn send_events(socket: &mut WebSocket, events: &[WsEvent]) -> bool {
    for event in events {
        let json = match serde_json::to_string(event) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize event: {e}");
                continue;
            }
        };
        if socket.send(Message::Text(json.into())).await.is_err() {
            return false;
        }
    }
    true
}
