//! Centralized error types for Whisper.
//!
//! Uses `thiserror` for ergonomic error definitions. Every variant maps onto one
//! of the stable wire codes shared by the WebSocket and HTTP surfaces, so a
//! handler deep in the gateway and a REST route produce identical client-visible
//! errors for the same condition.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;

/// Core application error type used across all Whisper services.
#[derive(Debug, thiserror::Error)]
pub enum WhisperError {
    /// Structural failure: bad JSON shape, unknown frame type, field out of
    /// pattern. Never carries a stack trace.
    #[error("Invalid payload: {message}")]
    InvalidPayload { message: String },

    /// Uniform authentication failure. Unknown challenge, expired challenge,
    /// bad signature, and wrong recovery key are deliberately indistinguishable.
    #[error("Authentication failed")]
    AuthFailed,

    /// The socket has no authenticated identity yet.
    #[error("Not registered")]
    NotRegistered,

    #[error("Rate limited")]
    RateLimited,

    /// Policy denial: banned identity, non-member, non-party.
    #[error("Forbidden")]
    Forbidden,

    #[error("{resource} not found")]
    NotFound { resource: String },

    #[error("Conflict: {message}")]
    Conflict { message: String },

    #[error("Timed out")]
    Timeout,

    // === Infrastructure errors — surfaced as INTERNAL, details logged only ===
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Internal error: {0}")]
    Internal(#[from] anyhow::Error),
}

/// JSON error response body sent to HTTP clients.
#[derive(Serialize)]
struct ErrorResponse {
    code: String,
    message: String,
}

impl WhisperError {
    /// Map error to HTTP status code.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidPayload { .. } => StatusCode::BAD_REQUEST,
            Self::AuthFailed | Self::NotRegistered => StatusCode::UNAUTHORIZED,
            Self::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            Self::Forbidden => StatusCode::FORBIDDEN,
            Self::NotFound { .. } => StatusCode::NOT_FOUND,
            Self::Conflict { .. } => StatusCode::CONFLICT,
            Self::Timeout => StatusCode::REQUEST_TIMEOUT,
            Self::Database(_) | Self::Redis(_) | Self::Internal(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    /// Stable error code string shared by the frame and HTTP surfaces.
    pub fn error_code(&self) -> &'static str {
        match self {
            Self::InvalidPayload { .. } => "INVALID_PAYLOAD",
            Self::AuthFailed => "AUTH_FAILED",
            Self::NotRegistered => "NOT_REGISTERED",
            Self::RateLimited => "RATE_LIMITED",
            Self::Forbidden => "FORBIDDEN",
            Self::NotFound { .. } => "NOT_FOUND",
            Self::Conflict { .. } => "CONFLICT",
            Self::Timeout => "TIMEOUT",
            Self::Database(_) | Self::Redis(_) | Self::Internal(_) => "INTERNAL",
        }
    }

    /// Client-visible message. Infrastructure errors are logged and replaced
    /// with a generic message; everything else uses the Display form.
    pub fn client_message(&self) -> String {
        match self {
            Self::Database(e) => {
                tracing::error!("Database error: {e}");
                "An internal error occurred".to_string()
            }
            Self::Redis(e) => {
                tracing::error!("Redis error: {e}");
                "An internal error occurred".to_string()
            }
            Self::Internal(e) => {
                tracing::error!("Internal error: {e}");
                "An internal error occurred".to_string()
            }
            other => other.to_string(),
        }
    }
}

impl IntoResponse for WhisperError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            code: self.error_code().to_string(),
            message: self.client_message(),
        };
        (status, axum::Json(body)).into_response()
    }
}

/// Convenience type alias for Results using WhisperError.
pub type WhisperResult<T> = Result<T, WhisperError>;

/// Shorthand for the pervasive `INVALID_PAYLOAD` construction.
pub fn invalid_payload(message: impl Into<String>) -> WhisperError {
    WhisperError::InvalidPayload { message: message.into() }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_are_stable() {
        assert_eq!(invalid_payload("x").error_code(), "INVALID_PAYLOAD");
        assert_eq!(WhisperError::AuthFailed.error_code(), "AUTH_FAILED");
        assert_eq!(WhisperError::RateLimited.error_code(), "RATE_LIMITED");
        assert_eq!(
            WhisperError::NotFound { resource: "attachment".into() }.error_code(),
            "NOT_FOUND"
        );
    }

    #[test]
    fn internal_errors_do_not_leak_details() {
        let err = WhisperError::Internal(anyhow::anyhow!("pg pool exhausted at 10.0.0.3"));
        assert_eq!(err.error_code(), "INTERNAL");
        assert_eq!(err.client_message(), "An internal error occurred");
    }
}
