use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use thiserror::Error;

/// Application-wide error type.
///
/// Each variant maps to a specific HTTP status via `status_code()` rather than
/// collapsing everything to 200 — signaling and recording failures are
/// distinguishable by status code, not just by a body flag.
#[derive(Error, Debug)]
pub enum AppError {
    #[error("Malformed offer: {0}")]
    MalformedOffer(String),

    #[error("Signaling failed: {0}")]
    SignalingFailed(String),

    #[error("Recording already in progress")]
    RecordingConflict,

    #[error("Recording unavailable: {0}")]
    RecordingUnavailable(String),

    #[error("Recording not found")]
    RecordingNotFound,

    #[error("Invalid filename")]
    InvalidFilename,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

/// Error response body
#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

impl AppError {
    fn status_code(&self) -> StatusCode {
        match self {
            AppError::MalformedOffer(_) => StatusCode::BAD_REQUEST,
            AppError::SignalingFailed(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::RecordingConflict => StatusCode::CONFLICT,
            AppError::RecordingUnavailable(_) => StatusCode::SERVICE_UNAVAILABLE,
            AppError::RecordingNotFound => StatusCode::NOT_FOUND,
            AppError::InvalidFilename => StatusCode::BAD_REQUEST,
            AppError::Io(_) => StatusCode::INTERNAL_SERVER_ERROR,
            AppError::Config(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = ErrorResponse {
            error: self.to_string(),
        };

        tracing::error!(
            error_type = std::any::type_name_of_val(&self),
            status = status.as_u16(),
            error_message = %body.error,
            "request failed"
        );

        (status, Json(body)).into_response()
    }
}

/// Result type alias for handlers and core components
pub type Result<T> = std::result::Result<T, AppError>;
