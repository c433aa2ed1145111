//! Error types for the token server.

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use thiserror::Error;

/// Result type for server operations.
pub type Result<T> = std::result::Result<T, ServerError>;

/// Errors the token server can produce.
#[derive(Error, Debug)]
pub enum ServerError {
    /// Missing or invalid bearer credentials.
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// Per-user rate limit hit.
    #[error("Rate limited; retry after {retry_after_secs}s")]
    RateLimited {
        /// Seconds until the next permitted request.
        retry_after_secs: u64,
    },

    /// The request body was unusable.
    #[error("Bad request: {0}")]
    BadRequest(String),

    /// The provider refused or failed the mint.
    #[error("Provider error: {0}")]
    Provider(String),

    /// Configuration problem at startup.
    #[error("Config error: {0}")]
    Config(String),
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, body) = match &self {
            Self::Unauthorized(msg) => (
                StatusCode::UNAUTHORIZED,
                json!({ "success": false, "error": msg }),
            ),
            Self::RateLimited { retry_after_secs } => (
                StatusCode::TOO_MANY_REQUESTS,
                json!({
                    "success": false,
                    "error": "Too many token requests",
                    "retryAfter": retry_after_secs,
                }),
            ),
            Self::BadRequest(msg) => (
                StatusCode::BAD_REQUEST,
                json!({ "success": false, "error": msg }),
            ),
            Self::Provider(msg) => {
                tracing::error!(error = %msg, "credential mint failed");
                (
                    StatusCode::BAD_GATEWAY,
                    json!({ "success": false, "error": "Failed to mint realtime credential" }),
                )
            }
            Self::Config(msg) => (
                StatusCode::INTERNAL_SERVER_ERROR,
                json!({ "success": false, "error": msg }),
            ),
        };
        (status, Json(body)).into_response()
    }
}
