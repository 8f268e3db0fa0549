//! HTTP error handling and response mapping.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use scout_agents::SessionError;
use scout_engine::EngineError;
use serde_json::json;
use uuid::Uuid;

#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    #[error(transparent)]
    Session(#[from] SessionError),

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("session {0} not found")]
    SessionNotFound(Uuid),

    #[error("server at capacity")]
    ServiceUnavailable,

    #[error("internal error: {0}")]
    Internal(String),
}

impl From<EngineError> for ServerError {
    fn from(err: EngineError) -> Self {
        ServerError::Session(SessionError::Engine(err))
    }
}

impl ServerError {
    /// Status, OpenAI error type and machine-readable code.
    fn classify(&self) -> (StatusCode, &'static str, Option<&'static str>) {
        match self {
            ServerError::InvalidRequest(_) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None)
            }
            ServerError::SessionNotFound(_) => (
                StatusCode::NOT_FOUND,
                "invalid_request_error",
                Some("session_not_found"),
            ),
            ServerError::ServiceUnavailable => (StatusCode::SERVICE_UNAVAILABLE, "server_error", None),
            ServerError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None),
            ServerError::Session(SessionError::Busy) => (
                StatusCode::CONFLICT,
                "invalid_request_error",
                Some("session_busy"),
            ),
            ServerError::Session(SessionError::EmptyHistory) => {
                (StatusCode::BAD_REQUEST, "invalid_request_error", None)
            }
            ServerError::Session(SessionError::Engine(err)) => match err {
                EngineError::ContextOverflow { .. } => (
                    StatusCode::PAYLOAD_TOO_LARGE,
                    "invalid_request_error",
                    Some("context_length_exceeded"),
                ),
                EngineError::Tokenization(_) => {
                    (StatusCode::BAD_REQUEST, "invalid_request_error", None)
                }
                EngineError::Busy(_) => (StatusCode::SERVICE_UNAVAILABLE, "server_error", None),
                EngineError::Timeout => (StatusCode::GATEWAY_TIMEOUT, "server_error", Some("timeout")),
                EngineError::Load(_)
                | EngineError::Cancelled
                | EngineError::Inference(_) => {
                    (StatusCode::INTERNAL_SERVER_ERROR, "server_error", None)
                }
            },
        }
    }
}

impl IntoResponse for ServerError {
    fn into_response(self) -> Response {
        let (status, error_type, code) = self.classify();
        if status.is_server_error() {
            tracing::warn!(status = status.as_u16(), error = %self, "request failed");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "param": null,
                "code": code,
            }
        }));

        (status, body).into_response()
    }
}
