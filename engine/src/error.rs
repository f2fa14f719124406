//! Error types for the Parcel engine.

use crate::outcome::{codes, BackendError, ErrorClass};
use crate::{LocalHandle, RemoteId};
use thiserror::Error;

/// All possible errors from the Parcel engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Error {
    // Validation errors
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("schema error: {0}")]
    Schema(String),

    // Identity errors
    #[error("identity conflict for object {handle}: already '{existing}', refusing '{attempted}'")]
    IdentityConflict {
        handle: LocalHandle,
        existing: RemoteId,
        attempted: RemoteId,
    },

    #[error("unknown object handle: {0}")]
    UnknownHandle(LocalHandle),

    // Backend outcomes surfaced to synchronous callers
    #[error("retryable failure [{code}]: {message}")]
    Retryable { code: i32, message: String },

    #[error("terminal failure [{code}]: {message}")]
    Terminal { code: i32, message: String },

    #[error("conflict: {0}")]
    Conflict(String),
}

impl Error {
    /// Backend-compatible error code reported over the channel.
    pub fn code(&self) -> i32 {
        match self {
            Error::Serialization(_) => codes::INVALID_JSON,
            Error::Schema(_) => codes::MISSING_OBJECT_ID,
            Error::IdentityConflict { .. } | Error::UnknownHandle(_) => codes::OTHER_CAUSE,
            Error::Retryable { code, .. } | Error::Terminal { code, .. } => *code,
            Error::Conflict(_) => codes::CONCURRENT_MODIFICATION,
        }
    }

    /// Whether the failure is worth retrying later.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Error::Retryable { .. })
    }
}

impl From<BackendError> for Error {
    fn from(err: BackendError) -> Self {
        match err.class() {
            ErrorClass::Retryable => Error::Retryable {
                code: err.code,
                message: err.message,
            },
            ErrorClass::Conflict => Error::Conflict(err.message),
            ErrorClass::Terminal => Error::Terminal {
                code: err.code,
                message: err.message,
            },
        }
    }
}

/// Result type for engine operations.
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_display() {
        let err = Error::Schema("missing className".into());
        assert_eq!(err.to_string(), "schema error: missing className");

        let err = Error::IdentityConflict {
            handle: LocalHandle::from_raw(7),
            existing: "abc".into(),
            attempted: "xyz".into(),
        };
        assert_eq!(
            err.to_string(),
            "identity conflict for object 7: already 'abc', refusing 'xyz'"
        );

        let err = Error::Retryable {
            code: codes::TIMEOUT,
            message: "timed out".into(),
        };
        assert_eq!(err.to_string(), "retryable failure [124]: timed out");
    }

    #[test]
    fn backend_errors_follow_classification() {
        let err: Error = BackendError::new(codes::CONNECTION_FAILED, "offline").into();
        assert!(err.is_retryable());
        assert_eq!(err.code(), codes::CONNECTION_FAILED);

        let err: Error = BackendError::new(codes::VALIDATION_ERROR, "bad field").into();
        assert!(matches!(err, Error::Terminal { code: 142, .. }));

        let err: Error = BackendError::new(codes::CONCURRENT_MODIFICATION, "stale").into();
        assert_eq!(err, Error::Conflict("stale".into()));
        assert_eq!(err.code(), codes::CONCURRENT_MODIFICATION);
    }

    #[test]
    fn validation_errors_map_to_channel_codes() {
        assert_eq!(Error::Serialization("x".into()).code(), codes::INVALID_JSON);
        assert_eq!(Error::Schema("x".into()).code(), codes::MISSING_OBJECT_ID);
        assert_eq!(
            Error::UnknownHandle(LocalHandle::from_raw(1)).code(),
            codes::OTHER_CAUSE
        );
    }
}
