use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;
use thiserror::Error;

/// Failures talking to the remote Botmon API.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("botmon request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("botmon returned {status}: {body}")]
    Status { status: u16, body: String },

    #[error("botmon response parsing failed: {0}")]
    Parse(#[from] serde_json::Error),
}

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("a message is already being sent")]
    Busy,

    #[error("chat history is still loading")]
    Loading,

    #[error("text is required")]
    EmptyMessage,

    #[error("the session task stopped before finishing")]
    Interrupted,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid BOTMON_API_URL {url:?}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Error type for the test-console HTTP handlers.
#[derive(Debug)]
pub enum HttpError {
    NotFound(String),
    BadRequest(String),
    Conflict(String),
    Internal(String),
}

#[derive(Serialize)]
struct ErrorBody {
    error: String,
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            HttpError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            HttpError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            HttpError::Conflict(msg) => (StatusCode::CONFLICT, msg),
            HttpError::Internal(msg) => {
                tracing::error!("internal error: {msg}");
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    "internal server error".to_string(),
                )
            }
        };

        (status, Json(ErrorBody { error: message })).into_response()
    }
}

impl From<SessionError> for HttpError {
    fn from(e: SessionError) -> Self {
        match e {
            SessionError::EmptyMessage => HttpError::BadRequest(e.to_string()),
            SessionError::Busy | SessionError::Loading => HttpError::Conflict(e.to_string()),
            SessionError::Interrupted => HttpError::Internal(e.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn session_errors_map_to_status_codes() {
        let status = |e: SessionError| HttpError::from(e).into_response().status();
        assert_eq!(status(SessionError::EmptyMessage), StatusCode::BAD_REQUEST);
        assert_eq!(status(SessionError::Busy), StatusCode::CONFLICT);
        assert_eq!(status(SessionError::Loading), StatusCode::CONFLICT);
        assert_eq!(
            status(SessionError::Interrupted),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
