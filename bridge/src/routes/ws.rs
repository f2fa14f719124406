//! WebSocket upgrade endpoint.

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    response::Response,
    routing::get,
    Router,
};
use serde::Deserialize;

use crate::auth::AuthUser;
use crate::handlers::handle_websocket_connection;
use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// Free-form label for logs
    pub client: Option<String>,
}

/// Create WebSocket routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/ws", get(upgrade))
}

async fn upgrade(
    State(state): State<AppState>,
    _auth: AuthUser,
    Query(query): Query<WsQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let client = query.client.unwrap_or_else(|| "anonymous".to_string());
    ws.on_upgrade(move |socket| {
        handle_websocket_connection(socket, state.dispatcher, state.conn_manager, client)
    })
}
