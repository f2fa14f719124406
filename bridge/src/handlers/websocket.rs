//! WebSocket handler for the call channel.
//!
//! Each text frame carries one call; replies go back on the same socket,
//! interleaved with the queue events every connection receives.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::dispatcher::Dispatcher;
use crate::websocket::{ClientMessage, ConnectionManager, ServerMessage};

/// Handle an established WebSocket connection.
///
/// This function:
/// 1. Registers the connection with the manager
/// 2. Spawns a task to forward outgoing messages
/// 3. Processes incoming messages in a loop
/// 4. Cleans up on disconnect
pub async fn handle_websocket_connection(
    socket: WebSocket,
    dispatcher: Arc<Dispatcher>,
    conn_manager: Arc<ConnectionManager>,
    client: String,
) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<ServerMessage>();
    let conn_id = conn_manager.register(client.clone(), tx);

    tracing::info!(conn_id = %conn_id, client = %client, "WebSocket client connected");

    let send_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            match serde_json::to_string(&msg) {
                Ok(text) => {
                    if let Err(e) = ws_sender.send(Message::Text(text.into())).await {
                        tracing::warn!("Failed to send WebSocket message: {}", e);
                        break;
                    }
                }
                Err(e) => {
                    tracing::error!("Failed to serialize WebSocket message: {}", e);
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => {
                let response = process_message(&text, &dispatcher).await;
                conn_manager.send_to(&conn_id, response);
            }
            Ok(Message::Binary(_)) => {
                tracing::warn!("Binary messages not supported");
                conn_manager.send_to(&conn_id, ServerMessage::error("binary frames are not supported", None));
            }
            Ok(Message::Ping(data)) => {
                tracing::trace!("Received ping: {} bytes", data.len());
            }
            Ok(Message::Pong(_)) => {
                tracing::trace!("Received pong");
            }
            Ok(Message::Close(_)) => {
                tracing::info!(conn_id = %conn_id, "WebSocket close frame received");
                break;
            }
            Err(e) => {
                tracing::warn!(conn_id = %conn_id, "WebSocket error: {}", e);
                break;
            }
        }
    }

    conn_manager.unregister(&conn_id);
    send_task.abort();

    tracing::info!(
        conn_id = %conn_id,
        client = %client,
        active_connections = conn_manager.connection_count(),
        "WebSocket client disconnected"
    );
}

/// Process a client message and return a server response.
pub async fn process_message(text: &str, dispatcher: &Dispatcher) -> ServerMessage {
    let client_msg: ClientMessage = match serde_json::from_str(text) {
        Ok(msg) => msg,
        Err(e) => {
            return ServerMessage::error(format!("Invalid message format: {}", e), None);
        }
    };

    match client_msg {
        ClientMessage::Call { id, method, args } => {
            let result = dispatcher.call(&method, args).await;
            if let Err(err) = &result {
                tracing::debug!(method = %method, code = err.code(), "Call failed: {}", err);
            }
            ServerMessage::reply(id, result)
        }
        ClientMessage::Ping => ServerMessage::Pong,
    }
}
