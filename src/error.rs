use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

/// The gateway's error type.
#[derive(Error, Debug)]
pub enum AppError {
    /// Missing, expired or rejected credentials.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The vendor refused the account (locked, not permitted).
    #[error("Access denied")]
    Forbidden,

    /// A proxy target outside the allow-list.
    #[error("Path not allowed: {0}")]
    PathNotAllowed(String),

    /// A validation error.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Too many attempts, either locally or at the vendor.
    #[error("Rate limit exceeded: {0}")]
    RateLimitExceeded(String),

    /// The gateway cannot sign or route the call with its current settings.
    #[error("Server misconfigured: {0}")]
    Misconfigured(String),

    /// The vendor (or the network to it) failed.
    #[error("Upstream error: {0}")]
    Upstream(String),

    /// Transport errors from the vendor HTTP client.
    #[error("HTTP client error: {0}")]
    Http(#[from] reqwest::Error),

    /// An internal server error.
    #[error("Internal server error: {0}")]
    Internal(String),
}

/// A `Result` type that uses `AppError` as the error type.
pub type Result<T> = std::result::Result<T, AppError>;

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            AppError::Authentication(ref msg) => {
                tracing::warn!("Authentication failed: {}", msg);
                (
                    StatusCode::UNAUTHORIZED,
                    "Please check your credentials and sign in again".to_string(),
                )
            }

            AppError::Forbidden => {
                tracing::warn!("Vendor denied access");
                (StatusCode::FORBIDDEN, "Access denied".to_string())
            }

            AppError::PathNotAllowed(ref path) => {
                tracing::warn!("🚫 Proxy path rejected: {}", path);
                (StatusCode::FORBIDDEN, "Not allowed".to_string())
            }

            AppError::Validation(ref msg) => {
                tracing::debug!("Validation error: {}", msg);
                (StatusCode::BAD_REQUEST, msg.clone())
            }

            AppError::RateLimitExceeded(ref msg) => {
                tracing::warn!("Rate limit exceeded: {}", msg);
                (
                    StatusCode::TOO_MANY_REQUESTS,
                    "Too many attempts, please try again later".to_string(),
                )
            }

            AppError::Misconfigured(ref msg) => {
                tracing::error!("❌ Server misconfigured: {}", msg);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "Server misconfigured".to_string(),
                )
            }

            AppError::Upstream(ref msg) => {
                tracing::error!("Upstream error: {}", msg);
                (StatusCode::BAD_GATEWAY, "Vendor service unavailable".to_string())
            }

            AppError::Http(ref e) => {
                tracing::error!("HTTP client error: {}", e);
                (StatusCode::BAD_GATEWAY, "Vendor service unavailable".to_string())
            }

            AppError::Internal(ref msg) => {
                tracing::error!("Internal error: {}", msg);
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
        };

        let body = sonic_rs::to_string(&sonic_rs::json!({
            "error": message
        }))
        .unwrap_or_else(|_| r#"{"error":"Internal server error"}"#.to_string());

        (
            status,
            [(http::header::CONTENT_TYPE, "application/json")],
            body,
        )
            .into_response()
    }
}
