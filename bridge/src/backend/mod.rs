//! Backend access.
//!
//! Everything the bridge sends to the backend goes through [`Backend`]. The
//! REST implementation talks to a Parse-compatible server, the in-memory one
//! serves local development and tests.

mod memory;
mod rest;

pub use memory::{BackendCall, MemoryBackend};
pub use rest::RestBackend;

use async_trait::async_trait;
use parcel_engine::{BackendError, Mapping};
use serde_json::Value;

/// Result of a backend request.
pub type BackendResult<T> = Result<T, BackendError>;

/// A query against one class.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryRequest {
    pub class_name: String,
    /// Constraint document in the backend's query dialect.
    pub r#where: Option<Mapping>,
    pub limit: Option<i64>,
    pub skip: Option<i64>,
    /// Comma-separated keys, `-` prefix for descending.
    pub order: Option<String>,
    pub include: Option<String>,
    pub keys: Option<String>,
    /// Ask for the number of matches instead of the matches.
    pub count: bool,
}

impl QueryRequest {
    pub fn new(class_name: impl Into<String>) -> Self {
        Self {
            class_name: class_name.into(),
            ..Self::default()
        }
    }

    /// Read a query from call arguments.
    pub fn from_args(class_name: impl Into<String>, args: &Mapping) -> Self {
        let text = |key: &str| match args.get(key) {
            Some(Value::String(s)) => Some(s.clone()),
            Some(Value::Array(items)) => Some(
                items
                    .iter()
                    .filter_map(Value::as_str)
                    .collect::<Vec<_>>()
                    .join(","),
            ),
            _ => None,
        };

        Self {
            class_name: class_name.into(),
            r#where: args.get("where").and_then(Value::as_object).cloned(),
            limit: args.get("limit").and_then(Value::as_i64),
            skip: args.get("skip").and_then(Value::as_i64),
            order: text("order"),
            include: text("include"),
            keys: text("keys"),
            count: args.get("count").and_then(Value::as_bool).unwrap_or(false),
        }
    }
}

/// What a query returned.
#[derive(Debug, Clone, PartialEq)]
pub enum QueryResponse {
    Results(Vec<Mapping>),
    Count(i64),
}

/// A Parse-compatible backend.
///
/// Bodies and responses are transport mappings produced and read by the
/// engine's codec. `session` is the session token of the current user, when
/// there is one.
#[async_trait]
pub trait Backend: Send + Sync {
    /// Create (`remote_id` is `None`) or update an object. Returns the server
    /// response: `objectId` and `createdAt` on create, `updatedAt` on update,
    /// plus any fields the server assigned.
    async fn save(
        &self,
        class_name: &str,
        remote_id: Option<&str>,
        body: Mapping,
        session: Option<&str>,
    ) -> BackendResult<Mapping>;

    async fn delete(&self, class_name: &str, remote_id: &str, session: Option<&str>) -> BackendResult<()>;

    async fn fetch(&self, class_name: &str, remote_id: &str, session: Option<&str>) -> BackendResult<Mapping>;

    async fn query(&self, request: &QueryRequest, session: Option<&str>) -> BackendResult<QueryResponse>;

    /// Authenticate. Returns the user mapping including `sessionToken`.
    async fn log_in(&self, username: &str, password: &str) -> BackendResult<Mapping>;

    /// Create a user. Returns the user mapping including `sessionToken`.
    async fn sign_up(&self, user: Mapping) -> BackendResult<Mapping>;

    async fn log_out(&self, session: &str) -> BackendResult<()>;

    /// Current configuration parameters.
    async fn fetch_config(&self, session: Option<&str>) -> BackendResult<Mapping>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn query_from_args() {
        let args = json!({
            "where": {"playerName": "Sean Plott"},
            "limit": 10,
            "order": ["-score", "createdAt"],
            "count": true
        });
        let request = QueryRequest::from_args("GameScore", args.as_object().unwrap());

        assert_eq!(request.class_name, "GameScore");
        assert_eq!(request.limit, Some(10));
        assert_eq!(request.order.as_deref(), Some("-score,createdAt"));
        assert!(request.count);
        assert!(request.r#where.is_some());
        assert_eq!(request.skip, None);
    }
}
