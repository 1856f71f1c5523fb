use crate::services::lifecycle::LifecycleError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// An HTTP-facing error: a status code plus a message safe to show clients.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
    /// Render as `text/plain` instead of JSON (the curl-style `PUT /` route).
    pub plain: bool,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
            plain: false,
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
    }

    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, msg)
    }

    pub fn unauthorized() -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "Invalid or missing API key")
    }

    /// Switch to a plain-text body.
    pub fn plain(mut self) -> Self {
        self.plain = true;
        self
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
        if self.plain {
            return (self.status, format!("{}\n", self.message)).into_response();
        }

        let body = Json(json!({
            "success": false,
            "message": self.message,
        }));

        (self.status, body).into_response()
    }
}

impl From<LifecycleError> for AppError {
    fn from(err: LifecycleError) -> Self {
        match err {
            LifecycleError::PayloadTooLarge { limit } => Self::new(
                StatusCode::PAYLOAD_TOO_LARGE,
                format!(
                    "File too large. Maximum size is {}",
                    crate::units::format_bytes(limit)
                ),
            ),
            LifecycleError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, "File not found"),
            LifecycleError::Gone(_) => Self::new(
                StatusCode::GONE,
                "File has expired or reached its download limit",
            ),
            LifecycleError::MetadataPersist { id, source } => {
                tracing::error!("metadata commit failed for {}: {}", id, source);
                Self::internal("Failed to save file metadata")
            }
            other => {
                tracing::error!("storage failure: {}", other);
                Self::internal("Internal storage error")
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::services::ledger::LedgerError;

    #[test]
    fn lifecycle_errors_map_to_statuses() {
        let cases = [
            (
                LifecycleError::PayloadTooLarge { limit: 1024 },
                StatusCode::PAYLOAD_TOO_LARGE,
            ),
            (LifecycleError::NotFound("x".into()), StatusCode::NOT_FOUND),
            (LifecycleError::Gone("x".into()), StatusCode::GONE),
            (
                LifecycleError::MetadataPersist {
                    id: "x".into(),
                    source: LedgerError::DuplicateId("x".into()),
                },
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
            (
                LifecycleError::Ledger(LedgerError::NotFound("x".into())),
                StatusCode::INTERNAL_SERVER_ERROR,
            ),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status, status);
        }
    }

    #[test]
    fn too_large_message_names_the_limit() {
        let err = AppError::from(LifecycleError::PayloadTooLarge {
            limit: 1024 * 1024 * 1024,
        });
        assert_eq!(err.message, "File too large. Maximum size is 1.00 GB");
    }
}
