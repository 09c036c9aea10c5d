//! HTTP API and WebSocket event stream.
//!
//! Every JSON response uses the same envelope:
//!
//! ```json
//! {"success": true, "message": "Issue created", "data": {...}}
//! {"success": false, "error": "Issue not found: issue-1a2b3c4d"}
//! ```

mod server;
mod websocket;

pub use server::router;
pub use websocket::{MAX_MESSAGE_SIZE, PING_PERIOD, PONG_WAIT, WRITE_WAIT};

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde::Serialize;
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::Error;
use crate::agents::{AgentSettingsRegistry, Investigator, RateLimitTracker};
use crate::lifecycle::Lifecycle;
use crate::processor::ProcessorControl;

/// Shared application state handed to every handler.
#[derive(Clone)]
pub struct ApiState {
    pub lifecycle: Lifecycle,
    pub investigator: Investigator,
    pub control: ProcessorControl,
    pub settings: Arc<AgentSettingsRegistry>,
    pub rate_limits: RateLimitTracker,
    pub scenario_root: Arc<PathBuf>,
    /// Origins allowed on `/ws`; empty allows any
    pub allowed_origins: Arc<Vec<String>>,
    /// Fires when the server shuts down
    pub shutdown: CancellationToken,
}

/// An error response.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let status = match &error {
            Error::NotFound(_) => StatusCode::NOT_FOUND,
            Error::InvalidInput(_) => StatusCode::BAD_REQUEST,
            Error::Conflict(_) => StatusCode::CONFLICT,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status.is_server_error() {
            tracing::error!(error = %error, "request failed");
        }
        Self::new(status, error.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (
            self.status,
            Json(serde_json::json!({
                "success": false,
                "error": self.message,
            })),
        )
            .into_response()
    }
}

pub type ApiResult = std::result::Result<Response, ApiError>;

/// A successful envelope carrying `data`.
pub fn success<T: Serialize>(status: StatusCode, message: Option<&str>, data: T) -> ApiResult {
    let data = serde_json::to_value(data).map_err(Error::from)?;
    let mut body = serde_json::json!({ "success": true, "data": data });
    if let Some(message) = message {
        body["message"] = serde_json::Value::String(message.to_string());
    }
    Ok((status, Json(body)).into_response())
}

/// `200 OK` with `data`.
pub fn ok<T: Serialize>(data: T) -> ApiResult {
    success(StatusCode::OK, None, data)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_status_mapping() {
        let cases = [
            (Error::NotFound("x".into()), StatusCode::NOT_FOUND),
            (Error::InvalidInput("x".into()), StatusCode::BAD_REQUEST),
            (Error::Conflict("x".into()), StatusCode::CONFLICT),
            (Error::Timeout(5), StatusCode::INTERNAL_SERVER_ERROR),
            (Error::Other("x".into()), StatusCode::INTERNAL_SERVER_ERROR),
        ];
        for (error, status) in cases {
            assert_eq!(ApiError::from(error).status(), status);
        }
    }
}
