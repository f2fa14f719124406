//! REST client for Parse-compatible servers.

use super::{Backend, BackendResult, QueryRequest, QueryResponse};
use async_trait::async_trait;
use parcel_engine::outcome::codes;
use parcel_engine::{BackendError, Mapping};
use reqwest::{Method, RequestBuilder, Response, StatusCode};
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

const HEADER_APPLICATION_ID: &str = "X-Parse-Application-Id";
const HEADER_CLIENT_KEY: &str = "X-Parse-Client-Key";
const HEADER_SESSION_TOKEN: &str = "X-Parse-Session-Token";

/// Backend reached over HTTP.
#[derive(Debug, Clone)]
pub struct RestBackend {
    http: reqwest::Client,
    server_url: String,
    application_id: String,
    client_key: Option<String>,
}

/// Error document returned by the server.
#[derive(Debug, Deserialize)]
struct ErrorDocument {
    code: i32,
    error: String,
}

impl RestBackend {
    pub fn new(
        server_url: impl Into<String>,
        application_id: impl Into<String>,
        client_key: Option<String>,
        timeout: Duration,
    ) -> Result<Self, BackendError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| BackendError::new(codes::OTHER_CAUSE, e.to_string()))?;

        Ok(Self {
            http,
            server_url: server_url.into().trim_end_matches('/').to_string(),
            application_id: application_id.into(),
            client_key,
        })
    }

    fn request(&self, method: Method, path: &str, session: Option<&str>) -> RequestBuilder {
        let mut builder = self
            .http
            .request(method, format!("{}/{}", self.server_url, path))
            .header(HEADER_APPLICATION_ID, &self.application_id);
        if let Some(key) = &self.client_key {
            builder = builder.header(HEADER_CLIENT_KEY, key);
        }
        if let Some(token) = session {
            builder = builder.header(HEADER_SESSION_TOKEN, token);
        }
        builder
    }

    async fn send(&self, builder: RequestBuilder) -> BackendResult<Value> {
        let response = builder.send().await.map_err(transport_error)?;
        read_response(response).await
    }
}

/// Endpoint of a class. Built-in classes have their own.
pub fn class_path(class_name: &str) -> String {
    match class_name {
        "_User" => "users".to_string(),
        "_Installation" => "installations".to_string(),
        "_Role" => "roles".to_string(),
        "_Session" => "sessions".to_string(),
        other => format!("classes/{}", other),
    }
}

fn transport_error(err: reqwest::Error) -> BackendError {
    if err.is_timeout() {
        BackendError::timeout(err.to_string())
    } else {
        BackendError::connection(err.to_string())
    }
}

/// Map an HTTP failure to a backend error code.
fn status_error(status: StatusCode, body: &str) -> BackendError {
    match status.as_u16() {
        429 => return BackendError::new(codes::REQUEST_LIMIT_EXCEEDED, body),
        409 | 412 => return BackendError::new(codes::CONCURRENT_MODIFICATION, body),
        _ => {}
    }
    if let Ok(doc) = serde_json::from_str::<ErrorDocument>(body) {
        return BackendError::new(doc.code, doc.error);
    }
    let message = format!("HTTP {}: {}", status, body);
    if status.is_server_error() {
        BackendError::new(codes::INTERNAL_SERVER_ERROR, message)
    } else {
        BackendError::new(codes::OTHER_CAUSE, message)
    }
}

async fn read_response(response: Response) -> BackendResult<Value> {
    let status = response.status();
    let text = response.text().await.map_err(transport_error)?;
    if !status.is_success() {
        return Err(status_error(status, &text));
    }
    if text.trim().is_empty() {
        return Ok(Value::Object(Mapping::new()));
    }
    serde_json::from_str(&text)
        .map_err(|e| BackendError::new(codes::INVALID_JSON, format!("invalid response: {}", e)))
}

fn into_mapping(value: Value) -> BackendResult<Mapping> {
    match value {
        Value::Object(map) => Ok(map),
        other => Err(BackendError::new(
            codes::INVALID_JSON,
            format!("expected an object, got {}", other),
        )),
    }
}

#[async_trait]
impl Backend for RestBackend {
    async fn save(
        &self,
        class_name: &str,
        remote_id: Option<&str>,
        body: Mapping,
        session: Option<&str>,
    ) -> BackendResult<Mapping> {
        let path = class_path(class_name);
        let builder = match remote_id {
            Some(id) => self.request(Method::PUT, &format!("{}/{}", path, id), session),
            None => self.request(Method::POST, &path, session),
        };
        into_mapping(self.send(builder.json(&body)).await?)
    }

    async fn delete(&self, class_name: &str, remote_id: &str, session: Option<&str>) -> BackendResult<()> {
        let path = format!("{}/{}", class_path(class_name), remote_id);
        self.send(self.request(Method::DELETE, &path, session)).await?;
        Ok(())
    }

    async fn fetch(&self, class_name: &str, remote_id: &str, session: Option<&str>) -> BackendResult<Mapping> {
        let path = format!("{}/{}", class_path(class_name), remote_id);
        into_mapping(self.send(self.request(Method::GET, &path, session)).await?)
    }

    async fn query(&self, request: &QueryRequest, session: Option<&str>) -> BackendResult<QueryResponse> {
        let mut params: Vec<(&str, String)> = Vec::new();
        if let Some(constraints) = &request.r#where {
            params.push(("where", Value::Object(constraints.clone()).to_string()));
        }
        if request.count {
            params.push(("count", "1".to_string()));
            params.push(("limit", "0".to_string()));
        } else if let Some(limit) = request.limit {
            params.push(("limit", limit.to_string()));
        }
        if let Some(skip) = request.skip {
            params.push(("skip", skip.to_string()));
        }
        for (key, value) in [
            ("order", &request.order),
            ("include", &request.include),
            ("keys", &request.keys),
        ] {
            if let Some(value) = value {
                params.push((key, value.clone()));
            }
        }

        let builder = self
            .request(Method::GET, &class_path(&request.class_name), session)
            .query(&params);
        let mut body = into_mapping(self.send(builder).await?)?;

        if request.count {
            let count = body.get("count").and_then(Value::as_i64).unwrap_or(0);
            return Ok(QueryResponse::Count(count));
        }
        let results = match body.remove("results") {
            Some(Value::Array(items)) => items
                .into_iter()
                .map(into_mapping)
                .collect::<BackendResult<Vec<_>>>()?,
            _ => Vec::new(),
        };
        Ok(QueryResponse::Results(results))
    }

    async fn log_in(&self, username: &str, password: &str) -> BackendResult<Mapping> {
        let body = serde_json::json!({ "username": username, "password": password });
        let builder = self.request(Method::POST, "login", None).json(&body);
        into_mapping(self.send(builder).await?)
    }

    async fn sign_up(&self, user: Mapping) -> BackendResult<Mapping> {
        let builder = self.request(Method::POST, "users", None).json(&user);
        let created = into_mapping(self.send(builder).await?)?;

        // The server only echoes what it assigned.
        let mut merged = user;
        merged.remove("password");
        merged.extend(created);
        Ok(merged)
    }

    async fn log_out(&self, session: &str) -> BackendResult<()> {
        self.send(self.request(Method::POST, "logout", Some(session))).await?;
        Ok(())
    }

    async fn fetch_config(&self, session: Option<&str>) -> BackendResult<Mapping> {
        let mut body = into_mapping(self.send(self.request(Method::GET, "config", session)).await?)?;
        match body.remove("params") {
            Some(Value::Object(params)) => Ok(params),
            _ => Ok(Mapping::new()),
        }
    }
}
