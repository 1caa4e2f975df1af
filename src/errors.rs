use crate::services::share_service::ShareError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// A lightweight wrapper for errors returned by HTTP handlers.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, msg)
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

/// Store failures never reach the client verbatim; they are logged here and
/// replaced by a generic message.
impl From<ShareError> for AppError {
    fn from(err: ShareError) -> Self {
        match err {
            ShareError::ValidationFailed(_) => AppError::bad_request(err.to_string()),
            ShareError::NotFoundOrExpired(msg) => AppError::not_found(msg),
            ShareError::CodeSpaceExhausted { .. } => {
                error!(error = %err, "short code space exhausted");
                AppError::internal("internal server error")
            }
            ShareError::Metadata(_) | ShareError::ObjectStore(_) => {
                error!(error = %err, "store failure");
                AppError::internal("internal server error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::{object_store::ObjectStoreError, validation::ValidationError};

    #[test]
    fn maps_share_errors_to_statuses() {
        let validation = AppError::from(ShareError::ValidationFailed(vec![ValidationError {
            field: "duration_minutes",
            message: "out of range".into(),
        }]));
        assert_eq!(validation.status, StatusCode::BAD_REQUEST);
        assert!(validation.message.contains("out of range"));

        let missing = AppError::from(ShareError::NotFoundOrExpired("gone".into()));
        assert_eq!(missing.status, StatusCode::NOT_FOUND);

        let exhausted = AppError::from(ShareError::CodeSpaceExhausted { attempts: 10 });
        assert_eq!(exhausted.status, StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[test]
    fn store_errors_are_not_leaked() {
        let err = AppError::from(ShareError::ObjectStore(ObjectStoreError::Unavailable(
            "disk at /secret/path failed".into(),
        )));
        assert_eq!(err.status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(!err.message.contains("/secret/path"));

        let err = AppError::from(ShareError::Metadata(sqlx::Error::PoolTimedOut));
        assert_eq!(err.message, "internal server error");
    }
}
