//! Error types for the supervisor and JSON error responses for the dispatcher

use http_body_util::{combinators::BoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::header::{HeaderValue, CONNECTION, CONTENT_TYPE};
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::time::Duration;

/// Pool-level failures. Only `Startup` and `PoolExhausted` are fatal to the
/// supervisor process; everything per-request is handled in the dispatcher.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    /// The pool could not reach full readiness at startup
    #[error("worker pool failed to start: {0}")]
    Startup(String),

    /// A slot crashed more often than the restart ceiling allows
    #[error("worker slot {slot} restarted {restarts} times within {window:?}, giving up")]
    PoolExhausted {
        slot: usize,
        restarts: usize,
        window: Duration,
    },

    /// The listen socket could not be bound
    #[error("failed to bind {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    /// A worker process could not be launched
    #[error("failed to spawn worker: {0}")]
    Spawn(#[source] std::io::Error),

    /// The supervisor was asked to do something in the wrong lifecycle phase
    #[error("invalid supervisor state: {0}")]
    InvalidState(&'static str),
}

impl SupervisorError {
    /// Process exit code for this error
    pub fn exit_code(&self) -> u8 {
        match self {
            SupervisorError::Startup(_) => 3,
            SupervisorError::PoolExhausted { .. } => 4,
            SupervisorError::Bind { .. }
            | SupervisorError::Spawn(_)
            | SupervisorError::InvalidState(_) => 1,
        }
    }
}

/// Error codes for per-request failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum DispatchErrorCode {
    /// Request could not be understood
    BadRequest,
    /// No such resource in the application
    NotFound,
    /// The application raised a fault or panicked
    HandlerFault,
    /// The application did not respond within the request timeout
    RequestTimeout,
}

impl DispatchErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            DispatchErrorCode::BadRequest => StatusCode::BAD_REQUEST,
            DispatchErrorCode::NotFound => StatusCode::NOT_FOUND,
            DispatchErrorCode::HandlerFault => StatusCode::INTERNAL_SERVER_ERROR,
            DispatchErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
        }
    }

    /// Get the error code as a string for the X-Dispatch-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            DispatchErrorCode::BadRequest => "BAD_REQUEST",
            DispatchErrorCode::NotFound => "NOT_FOUND",
            DispatchErrorCode::HandlerFault => "HANDLER_FAULT",
            DispatchErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
        }
    }

    /// Whether the connection must be closed after sending this error
    pub fn closes_connection(&self) -> bool {
        matches!(
            self,
            DispatchErrorCode::RequestTimeout | DispatchErrorCode::BadRequest
        )
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: DispatchErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: DispatchErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

    /// Convert to JSON string
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| {
            format!(
                r#"{{"code":"{}","message":"{}","status":{}}}"#,
                self.code.as_header_value(),
                self.message.replace('\"', "\\\""),
                self.status
            )
        })
    }
}

/// Create a JSON error response with X-Dispatch-Error header
pub fn json_error_response(
    code: DispatchErrorCode,
    message: impl Into<String>,
) -> Response<BoxBody<Bytes, hyper::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    let mut response = Response::builder()
        .status(status)
        .header(CONTENT_TYPE, "application/json")
        .header("X-Dispatch-Error", code.as_header_value())
        .body(Full::new(Bytes::from(body)).map_err(|e| match e {}).boxed())
        .expect("valid response with StatusCode enum and static headers");

    if code.closes_connection() {
        response
            .headers_mut()
            .insert(CONNECTION, HeaderValue::from_static("close"));
    }

    response
}
