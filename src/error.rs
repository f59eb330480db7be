use std::fmt;

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

/// Domain error taxonomy for the scheduler and task-lifecycle subsystem.
///
/// Mapped to HTTP status codes at the edge (`IntoResponse` below); internal
/// code should propagate these rather than string errors.
#[derive(Debug)]
pub enum AppError {
    /// Caller's request violates a contract.
    Invalid(String),
    /// Unknown task id.
    NotFound(String),
    /// Store or filesystem I/O failure.
    Internal(String),
    /// The GPU probe tool failed (not merely "unavailable").
    ProbeError(String),
    /// The session host tool cannot be invoked at all.
    SessionUnavailable(String),
    /// The session host refused to start a session.
    SessionLaunchError(String),
}

pub type AppResult<T> = Result<T, AppError>;

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppError::Invalid(msg) => write!(f, "{msg}"),
            AppError::NotFound(msg) => write!(f, "{msg}"),
            AppError::Internal(msg) => write!(f, "{msg}"),
            AppError::ProbeError(msg) => write!(f, "GPU probe failed: {msg}"),
            AppError::SessionUnavailable(msg) => write!(f, "session host unavailable: {msg}"),
            AppError::SessionLaunchError(msg) => write!(f, "session launch failed: {msg}"),
        }
    }
}

impl std::error::Error for AppError {}

impl From<rusqlite::Error> for AppError {
    fn from(err: rusqlite::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

impl From<std::io::Error> for AppError {
    fn from(err: std::io::Error) -> Self {
        AppError::Internal(err.to_string())
    }
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = match &self {
            AppError::Invalid(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Internal(_)
            | AppError::ProbeError(_)
            | AppError::SessionUnavailable(_)
            | AppError::SessionLaunchError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = ErrorBody {
            error: self.to_string(),
        };
        (status, Json(body)).into_response()
    }
}
