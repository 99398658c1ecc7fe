use thiserror::Error;

/// Errors surfaced to the dashboard.
///
/// Every variant carries a message fit for display; transport details are
/// logged, not shown.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    #[error("Invalid email or password")]
    InvalidCredentials,

    #[error("Too many attempts, please wait a moment and try again")]
    TooManyAttempts,

    #[error("Access denied")]
    AccessDenied,

    #[error("The service is temporarily unavailable, please try again")]
    ServerError,

    #[error("Your session has expired, please sign in again")]
    SessionExpired,

    #[error("Not signed in")]
    NotAuthenticated,

    #[error("Request failed with status {status}")]
    Http { status: u16 },

    #[error("Network error: {0}")]
    Network(String),

    #[error("Unexpected response: {0}")]
    Decode(String),

    #[error("{0}")]
    NoData(String),

    #[error("Vehicle {0} is not part of this account")]
    UnknownVehicle(String),

    #[error("Local storage error: {0}")]
    Storage(String),
}

impl ClientError {
    /// Maps a non-success status from the gateway.
    pub fn from_status(status: u16) -> Self {
        match status {
            401 => ClientError::InvalidCredentials,
            403 => ClientError::AccessDenied,
            429 => ClientError::TooManyAttempts,
            500..=599 => ClientError::ServerError,
            status => ClientError::Http { status },
        }
    }
}

impl From<reqwest::Error> for ClientError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_decode() {
            ClientError::Decode(e.to_string())
        } else {
            ClientError::Network(e.to_string())
        }
    }
}
