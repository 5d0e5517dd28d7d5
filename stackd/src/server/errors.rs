//! Mapping of domain errors onto HTTP responses

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::Serialize;

use crate::deploy::compose::ComposeError;
use crate::errors::StackError;

/// JSON error body. Compose failures carry the command output.
#[derive(Debug, Clone, Serialize)]
pub struct ErrorBody {
    pub error: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl From<&StackError> for ErrorBody {
    fn from(err: &StackError) -> Self {
        let (stdout, stderr) = match err {
            StackError::Compose(compose) => match compose.captured_output() {
                Some((stdout, stderr)) => (Some(stdout.to_string()), Some(stderr.to_string())),
                None => (None, None),
            },
            _ => (None, None),
        };
        Self {
            error: err.to_string(),
            stdout,
            stderr,
        }
    }
}

/// Error returned by handlers
#[derive(Debug)]
pub struct ApiError {
    pub status: StatusCode,
    pub body: ErrorBody,
}

impl ApiError {
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            body: ErrorBody {
                error: message.into(),
                stdout: None,
                stderr: None,
            },
        }
    }
}

/// HTTP status for a domain error
pub fn status_for(err: &StackError) -> StatusCode {
    match err {
        StackError::NotFound(_) => StatusCode::NOT_FOUND,
        StackError::NameTaken(_) => StatusCode::CONFLICT,
        StackError::ValidationError(_) | StackError::JsonError(_) => StatusCode::BAD_REQUEST,
        StackError::Compose(ComposeError::Cancelled { .. }) => StatusCode::REQUEST_TIMEOUT,
        StackError::Git(_) | StackError::Compose(_) => StatusCode::BAD_GATEWAY,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<StackError> for ApiError {
    fn from(err: StackError) -> Self {
        Self {
            status: status_for(&err),
            body: ErrorBody::from(&err),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body)).into_response()
    }
}
