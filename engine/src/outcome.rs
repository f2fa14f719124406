//! Backend failures and command outcomes.
//!
//! The backend reports failures as `{code, message}` pairs. This module
//! decides which of them are worth retrying and turns the result of a
//! command into an [`Outcome`].

use crate::codec::{self, Mapping};
use crate::{error::Result, CommandKind, FieldName, FieldValue, RemoteId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Error codes shared with the backend's REST dialect.
pub mod codes {
    pub const OTHER_CAUSE: i32 = -1;
    pub const INTERNAL_SERVER_ERROR: i32 = 1;
    pub const CONNECTION_FAILED: i32 = 100;
    pub const OBJECT_NOT_FOUND: i32 = 101;
    pub const INVALID_QUERY: i32 = 102;
    pub const INVALID_CLASS_NAME: i32 = 103;
    pub const MISSING_OBJECT_ID: i32 = 104;
    pub const INVALID_KEY_NAME: i32 = 105;
    pub const INVALID_POINTER: i32 = 106;
    pub const INVALID_JSON: i32 = 107;
    pub const COMMAND_UNAVAILABLE: i32 = 108;
    pub const OPERATION_FORBIDDEN: i32 = 119;
    pub const TIMEOUT: i32 = 124;
    pub const DUPLICATE_VALUE: i32 = 137;
    pub const VALIDATION_ERROR: i32 = 142;
    pub const REQUEST_LIMIT_EXCEEDED: i32 = 155;
    pub const USERNAME_MISSING: i32 = 200;
    pub const PASSWORD_MISSING: i32 = 201;
    pub const USERNAME_TAKEN: i32 = 202;
    pub const SESSION_MISSING: i32 = 206;
    pub const INVALID_SESSION_TOKEN: i32 = 209;
    /// Concurrent modification detected by the server (HTTP 409/412).
    pub const CONCURRENT_MODIFICATION: i32 = 409;
}

/// A failure reported by the backend or by the transport to it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("[{code}] {message}")]
pub struct BackendError {
    pub code: i32,
    pub message: String,
}

impl BackendError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    pub fn timeout(message: impl Into<String>) -> Self {
        Self::new(codes::TIMEOUT, message)
    }

    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(codes::CONNECTION_FAILED, message)
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(codes::OBJECT_NOT_FOUND, message)
    }

    /// How the failure should be handled.
    pub fn class(&self) -> ErrorClass {
        match self.code {
            codes::CONNECTION_FAILED
            | codes::TIMEOUT
            | codes::REQUEST_LIMIT_EXCEEDED
            | codes::INTERNAL_SERVER_ERROR => ErrorClass::Retryable,
            codes::CONCURRENT_MODIFICATION => ErrorClass::Conflict,
            _ => ErrorClass::Terminal,
        }
    }
}

/// Classification of a [`BackendError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Connectivity, timeouts and rate limits.
    Retryable,
    /// Validation, authorization, missing objects and everything unknown.
    Terminal,
    /// Concurrent modification. Surfaced, never retried automatically.
    Conflict,
}

/// What the backend sent back for a confirmed write or fetch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ServerFields {
    pub remote_id: Option<RemoteId>,
    pub created_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    /// Any other fields the server assigned or normalized.
    pub fields: BTreeMap<FieldName, FieldValue>,
}

impl ServerFields {
    /// Read a backend response mapping.
    pub fn from_response(response: &Mapping) -> Result<Self> {
        Ok(Self {
            remote_id: response
                .get(codec::KEY_OBJECT_ID)
                .and_then(|v| v.as_str())
                .map(str::to_string),
            created_at: codec::decode_timestamp(response.get(codec::KEY_CREATED_AT))?,
            updated_at: codec::decode_timestamp(response.get(codec::KEY_UPDATED_AT))?,
            fields: codec::decode_fields(response)?,
        })
    }
}

/// Result of executing one command.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    Success(ServerFields),
    RetryableFailure(BackendError),
    TerminalFailure(BackendError),
}

impl Outcome {
    pub fn is_success(&self) -> bool {
        matches!(self, Outcome::Success(_))
    }
}

/// Turn the raw result of a command into an [`Outcome`].
///
/// Deleting an object the backend no longer knows is a success.
pub fn classify(kind: CommandKind, result: std::result::Result<ServerFields, BackendError>) -> Outcome {
    match result {
        Ok(fields) => Outcome::Success(fields),
        Err(err) if kind == CommandKind::Delete && err.code == codes::OBJECT_NOT_FOUND => {
            Outcome::Success(ServerFields::default())
        }
        Err(err) => match err.class() {
            ErrorClass::Retryable => Outcome::RetryableFailure(err),
            ErrorClass::Terminal | ErrorClass::Conflict => Outcome::TerminalFailure(err),
        },
    }
}
