//! Unified error handling for the bridge.
//!
//! Every failure that reaches the channel is reported as a `{code, message}`
//! pair using the backend's error codes.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use parcel_engine::outcome::codes;
use parcel_engine::{BackendError, Error as EngineError};
use serde::Serialize;

/// Application error type.
#[derive(Debug, thiserror::Error)]
pub enum AppError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("{message}")]
    BadRequest { code: i32, message: String },

    #[error("Method not implemented: {0}")]
    NotImplemented(String),

    #[error("Unauthorized")]
    Unauthorized,

    #[error("Internal error: {0}")]
    Internal(String),
}

impl AppError {
    pub fn bad_request(code: i32, message: impl Into<String>) -> Self {
        AppError::BadRequest {
            code,
            message: message.into(),
        }
    }

    /// Invalid or missing call arguments.
    pub fn invalid_json(message: impl Into<String>) -> Self {
        Self::bad_request(codes::INVALID_JSON, message)
    }

    /// Backend-compatible error code.
    pub fn code(&self) -> i32 {
        match self {
            AppError::Engine(e) => e.code(),
            AppError::BadRequest { code, .. } => *code,
            AppError::NotImplemented(_) => codes::COMMAND_UNAVAILABLE,
            AppError::Unauthorized => codes::OPERATION_FORBIDDEN,
            AppError::Database(_) | AppError::Migrate(_) | AppError::Internal(_) => {
                codes::OTHER_CAUSE
            }
        }
    }

    /// The `{code, message}` pair reported to callers.
    pub fn body(&self) -> ErrorBody {
        let message = match self {
            AppError::Engine(EngineError::Retryable { message, .. })
            | AppError::Engine(EngineError::Terminal { message, .. })
            | AppError::Engine(EngineError::Conflict(message)) => message.clone(),
            AppError::Database(_) | AppError::Migrate(_) => "storage failure".to_string(),
            other => other.to_string(),
        };
        ErrorBody {
            code: self.code(),
            message,
        }
    }

    fn status(&self) -> StatusCode {
        match self {
            AppError::Engine(e) => match e {
                EngineError::Retryable { .. } => StatusCode::SERVICE_UNAVAILABLE,
                EngineError::Conflict(_) | EngineError::IdentityConflict { .. } => StatusCode::CONFLICT,
                EngineError::Terminal { code, .. } if *code == codes::OBJECT_NOT_FOUND => {
                    StatusCode::NOT_FOUND
                }
                EngineError::UnknownHandle(_) => StatusCode::NOT_FOUND,
                _ => StatusCode::BAD_REQUEST,
            },
            AppError::BadRequest { .. } => StatusCode::BAD_REQUEST,
            AppError::NotImplemented(_) => StatusCode::NOT_IMPLEMENTED,
            AppError::Unauthorized => StatusCode::UNAUTHORIZED,
            AppError::Database(_) | AppError::Migrate(_) | AppError::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl From<BackendError> for AppError {
    fn from(err: BackendError) -> Self {
        AppError::Engine(err.into())
    }
}

/// Error payload of a failed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorBody {
    pub code: i32,
    pub message: String,
}

/// Error response body.
#[derive(Serialize)]
struct ErrorResponse {
    error: ErrorBody,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match &self {
            AppError::Database(e) => tracing::error!("Database error: {:?}", e),
            AppError::Migrate(e) => tracing::error!("Migration error: {:?}", e),
            AppError::Internal(msg) => tracing::error!("Internal error: {}", msg),
            AppError::Engine(e) => tracing::debug!("Engine error: {}", e),
            _ => {}
        }

        let body = Json(ErrorResponse { error: self.body() });
        (self.status(), body).into_response()
    }
}

/// Result type alias for handlers.
pub type Result<T> = std::result::Result<T, AppError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_keep_their_code() {
        let err: AppError = BackendError::new(codes::USERNAME_TAKEN, "Account already exists").into();
        assert_eq!(
            err.body(),
            ErrorBody {
                code: 202,
                message: "Account already exists".into()
            }
        );
        assert_eq!(err.status(), StatusCode::BAD_REQUEST);

        let err: AppError = BackendError::timeout("deadline elapsed").into();
        assert_eq!(err.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[test]
    fn validation_errors_use_channel_codes() {
        let err = AppError::invalid_json("invalid parse object");
        assert_eq!(err.code(), codes::INVALID_JSON);
        assert_eq!(err.body().message, "invalid parse object");

        let err: AppError = EngineError::Schema("missing className".into()).into();
        assert_eq!(err.code(), codes::MISSING_OBJECT_ID);
    }
}
