//! WebSocket connection manager.
//!
//! Tracks open channel connections so queue events can be pushed to all of
//! them.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::mpsc;

use super::ServerMessage;

/// Sender for WebSocket messages.
pub type MessageSender = mpsc::UnboundedSender<ServerMessage>;

/// A single WebSocket connection.
#[derive(Debug)]
pub struct Connection {
    pub id: String,
    /// Client label from the `client` query parameter
    pub client: String,
    pub sender: MessageSender,
}

/// Manages active WebSocket connections.
#[derive(Debug, Default)]
pub struct ConnectionManager {
    connections: DashMap<String, Connection>,
}

impl ConnectionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn new_shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Register a new connection. Returns the connection ID.
    pub fn register(&self, client: String, sender: MessageSender) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        self.connections.insert(
            conn_id.clone(),
            Connection {
                id: conn_id.clone(),
                client,
                sender,
            },
        );
        tracing::info!(conn_id = %conn_id, "WebSocket connection registered");
        conn_id
    }

    pub fn unregister(&self, conn_id: &str) {
        if let Some((_, conn)) = self.connections.remove(conn_id) {
            tracing::info!(conn_id = %conn_id, client = %conn.client, "WebSocket connection unregistered");
        }
    }

    /// Broadcast a message to all connections.
    ///
    /// Returns the number of connections that received the message.
    pub fn broadcast_all(&self, message: ServerMessage) -> usize {
        let mut sent_count = 0;
        for entry in self.connections.iter() {
            if entry.value().sender.send(message.clone()).is_ok() {
                sent_count += 1;
            }
        }
        sent_count
    }

    /// Send a message to one connection. Returns false if it is gone.
    pub fn send_to(&self, conn_id: &str, message: ServerMessage) -> bool {
        match self.connections.get(conn_id) {
            Some(conn) => conn.sender.send(message).is_ok(),
            None => false,
        }
    }

    pub fn connection_count(&self) -> usize {
        self.connections.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn register_unregister() {
        let manager = ConnectionManager::new();
        let (tx, _rx) = mpsc::unbounded_channel();

        let conn_id = manager.register("app".to_string(), tx);
        assert_eq!(manager.connection_count(), 1);

        manager.unregister(&conn_id);
        assert_eq!(manager.connection_count(), 0);
        assert!(!manager.send_to(&conn_id, ServerMessage::Pong));
    }

    #[test]
    fn broadcast_reaches_every_connection() {
        let manager = ConnectionManager::new();
        let (tx1, mut rx1) = mpsc::unbounded_channel();
        let (tx2, mut rx2) = mpsc::unbounded_channel();
        let (tx3, rx3) = mpsc::unbounded_channel();

        manager.register("a".to_string(), tx1);
        manager.register("b".to_string(), tx2);
        manager.register("c".to_string(), tx3);
        drop(rx3);

        assert_eq!(manager.broadcast_all(ServerMessage::Pong), 2);
        assert!(matches!(rx1.try_recv().unwrap(), ServerMessage::Pong));
        assert!(matches!(rx2.try_recv().unwrap(), ServerMessage::Pong));
    }
}
