//! Channel authentication.
//!
//! When `CHANNEL_TOKEN` is configured every call must present it as a
//! Bearer token. Without it the channel is open, which suits a bridge bound
//! to the loopback interface.

use axum::{
    extract::FromRequestParts,
    http::{header::AUTHORIZATION, request::Parts},
};

use crate::error::AppError;
use crate::AppState;

/// Caller admitted to the channel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthUser {
    /// No channel token is configured.
    Anonymous,
    /// The caller presented the channel token.
    Token,
}

/// Token carried by an `Authorization: Bearer <token>` header.
fn bearer_token(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|header| header.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let Some(expected) = state.config.channel_token.as_deref() else {
            return Ok(AuthUser::Anonymous);
        };

        match bearer_token(parts) {
            Some(token) if token == expected => Ok(AuthUser::Token),
            Some(_) => {
                tracing::warn!("Rejected call with a wrong channel token");
                Err(AppError::Unauthorized)
            }
            None => Err(AppError::Unauthorized),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::Request;

    fn parts(header: Option<&str>) -> Parts {
        let mut builder = Request::builder().uri("/call/initialize");
        if let Some(value) = header {
            builder = builder.header(AUTHORIZATION, value);
        }
        builder.body(()).unwrap().into_parts().0
    }

    #[test]
    fn bearer_token_extraction() {
        assert_eq!(bearer_token(&parts(Some("Bearer s3cret"))), Some("s3cret"));
        assert_eq!(bearer_token(&parts(Some("Bearer "))), None);
        assert_eq!(bearer_token(&parts(Some("Basic abc"))), None);
        assert_eq!(bearer_token(&parts(None)), None);
    }
}
