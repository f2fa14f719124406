//! HTTP form of the call channel: `POST /call/{method}`.

use axum::{
    body::Bytes,
    extract::{Path, State},
    routing::post,
    Json, Router,
};
use serde_json::{json, Value};

use crate::auth::AuthUser;
use crate::error::{AppError, Result};
use crate::AppState;

/// Create channel routes.
pub fn routes() -> Router<AppState> {
    Router::new().route("/call/{method}", post(call))
}

/// Parse a call body. An empty body means no arguments.
fn parse_body(body: &[u8]) -> Result<Value> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(body).map_err(|_| AppError::invalid_json("invalid parse object"))
}

/// Call handler.
///
/// Replies `{"ok": result}`, or an `{"error": {code, message}}` document
/// with a matching HTTP status.
async fn call(
    State(state): State<AppState>,
    _auth: AuthUser,
    Path(method): Path<String>,
    body: Bytes,
) -> Result<Json<Value>> {
    let args = parse_body(&body)?;
    let result = state.dispatcher.call(&method, args).await?;
    Ok(Json(json!({ "ok": result })))
}
