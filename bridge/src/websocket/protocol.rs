//! WebSocket message protocol definitions.
//!
//! All messages are JSON objects tagged by `type`, with snake_case type
//! names.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{AppError, ErrorBody};
use crate::queue::QueueEvent;

/// Messages sent from client to bridge.
#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Invoke a dispatcher method.
    Call {
        /// Echoed on the reply for correlation
        #[serde(default)]
        id: Value,
        method: String,
        #[serde(default)]
        args: Value,
    },

    /// Keep-alive ping.
    Ping,
}

/// Messages sent from bridge to client.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Result of a call: exactly one of `ok` and `error` is present.
    Reply {
        id: Value,
        #[serde(skip_serializing_if = "Option::is_none")]
        ok: Option<Value>,
        #[serde(skip_serializing_if = "Option::is_none")]
        error: Option<ErrorBody>,
    },

    /// Outcome of a queued command, pushed to every connection.
    QueueEvent(QueueEvent),

    /// Response to ping.
    Pong,

    /// The message could not be read.
    Error {
        message: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        id: Option<Value>,
    },
}

impl ServerMessage {
    pub fn reply(id: Value, result: Result<Value, AppError>) -> Self {
        match result {
            Ok(value) => ServerMessage::Reply {
                id,
                ok: Some(value),
                error: None,
            },
            Err(err) => ServerMessage::Reply {
                id,
                ok: None,
                error: Some(err.body()),
            },
        }
    }

    pub fn error(message: impl Into<String>, id: Option<Value>) -> Self {
        ServerMessage::Error {
            message: message.into(),
            id,
        }
    }
}
