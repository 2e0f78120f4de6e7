use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};

use crate::session::RegistryError;

/// Structured error type for all API handlers.
///
/// Each variant maps to an HTTP status code, a machine-readable code string,
/// and a human-readable message. Implements [`IntoResponse`] so handlers can
/// return `Result<T, ApiError>` directly.
#[derive(Debug)]
pub enum ApiError {
    /// 400 - Malformed or invalid request body.
    InvalidRequest(String),
    /// 403 - WebSocket upgrade from an origin that is not allowed.
    OriginNotAllowed,
    /// 404 - No session with this id.
    SessionNotFound(String),
    /// 409 - The session already reached a terminal state.
    SessionFinished(String),
    /// 503 - The registry is at its configured capacity.
    TooManySessions,
    /// 503 - The server is shutting down and accepts no new work.
    ShuttingDown,
}

impl ApiError {
    /// Returns the HTTP status code for this error variant.
    pub fn status_code(&self) -> StatusCode {
        match self {
            ApiError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            ApiError::OriginNotAllowed => StatusCode::FORBIDDEN,
            ApiError::SessionNotFound(_) => StatusCode::NOT_FOUND,
            ApiError::SessionFinished(_) => StatusCode::CONFLICT,
            ApiError::TooManySessions => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::ShuttingDown => StatusCode::SERVICE_UNAVAILABLE,
        }
    }

    /// Returns a machine-readable error code string.
    pub fn code(&self) -> &'static str {
        match self {
            ApiError::InvalidRequest(_) => "invalid_request",
            ApiError::OriginNotAllowed => "origin_not_allowed",
            ApiError::SessionNotFound(_) => "session_not_found",
            ApiError::SessionFinished(_) => "session_finished",
            ApiError::TooManySessions => "too_many_sessions",
            ApiError::ShuttingDown => "shutting_down",
        }
    }

    /// Returns a human-readable error message.
    pub fn message(&self) -> String {
        match self {
            ApiError::InvalidRequest(detail) => format!("Invalid request: {}.", detail),
            ApiError::OriginNotAllowed => {
                "WebSocket connections from this origin are not allowed.".to_string()
            }
            ApiError::SessionNotFound(id) => format!("Session not found: {}.", id),
            ApiError::SessionFinished(id) => format!("Session already finished: {}.", id),
            ApiError::TooManySessions => {
                "Too many sessions. Try again once older ones expire.".to_string()
            }
            ApiError::ShuttingDown => "Server is shutting down.".to_string(),
        }
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::MaxSessionsReached => ApiError::TooManySessions,
            RegistryError::Closed => ApiError::ShuttingDown,
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = serde_json::json!({
            "error": {
                "code": self.code(),
                "message": self.message(),
            }
        });
        (self.status_code(), Json(body)).into_response()
    }
}
