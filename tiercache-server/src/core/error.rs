use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

/// Error type for store and broker operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    #[error("Memory limit exceeded")]
    MemoryLimitExceeded,

    #[error("Invalid topic pattern: {0}")]
    InvalidPattern(String),

    #[error("Unknown command: {0}")]
    UnknownCommand(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

impl StoreError {
    /// Get HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::InvalidValue(_)
            | Self::InvalidPattern(_)
            | Self::UnknownCommand(_)
            | Self::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            Self::MemoryLimitExceeded => StatusCode::INSUFFICIENT_STORAGE,
        }
    }
}

impl IntoResponse for StoreError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = Json(json!({
            "error": self.to_string(),
            "code": status.as_u16(),
        }));

        (status, body).into_response()
    }
}

pub type Result<T> = std::result::Result<T, StoreError>;
