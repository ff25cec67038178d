//! Error types and JSON error responses for the proxy

use crate::transport::ProxyBody;
use http_body_util::{BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error returned by a response hook
pub type HookError = Box<dyn std::error::Error + Send + Sync>;

/// Result type alias using [`Error`]
pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Upstream host lacks an `http://` or `https://` scheme
    #[error("invalid proxy host '{host}'")]
    InvalidConfiguration { host: String },

    /// No configuration registered under this name
    #[error("unknown proxy named {0}")]
    UnknownProxy(String),

    /// Building the instance for a registered name failed
    #[error("can not make proxy[{name}]: {source}")]
    InstanceCreationFailed {
        name: String,
        #[source]
        source: Box<Error>,
    },

    /// Resolved target is not a URL with a host
    #[error("parse url error: {0}")]
    MalformedTargetUrl(String),

    /// A response hook rejected the upstream response
    #[error("response hook failed: {0}")]
    ResponseHookFailed(#[source] HookError),

    /// Transport-level failure talking to the upstream
    #[error("upstream error: {0}")]
    Upstream(String),

    /// Upstream did not answer within the configured timeout
    #[error("upstream request timed out")]
    UpstreamTimeout,
}

impl Error {
    /// Error code used when this error reaches the server surface
    pub fn code(&self) -> ProxyErrorCode {
        match self {
            Error::UnknownProxy(_) => ProxyErrorCode::UnknownProxy,
            Error::InvalidConfiguration { .. } | Error::InstanceCreationFailed { .. } => {
                ProxyErrorCode::ProxyCreationFailed
            }
            Error::MalformedTargetUrl(_) => ProxyErrorCode::MalformedTarget,
            Error::ResponseHookFailed(_) => ProxyErrorCode::ResponseHookFailed,
            Error::Upstream(_) => ProxyErrorCode::ConnectionFailed,
            Error::UpstreamTimeout => ProxyErrorCode::RequestTimeout,
        }
    }
}

/// Error codes for proxy errors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProxyErrorCode {
    /// No proxy configured for the request
    UnknownProxy,
    /// Proxy configuration could not be turned into an instance
    ProxyCreationFailed,
    /// Resolved upstream URL is unusable
    MalformedTarget,
    /// A response hook aborted the exchange
    ResponseHookFailed,
    /// Request timed out waiting for upstream
    RequestTimeout,
    /// Failed to connect to upstream
    ConnectionFailed,
    /// Exchange failed for a reason not tied to the upstream
    InternalError,
}

impl ProxyErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyErrorCode::UnknownProxy => StatusCode::NOT_FOUND,
            ProxyErrorCode::ProxyCreationFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ProxyErrorCode::MalformedTarget => StatusCode::NOT_FOUND,
            ProxyErrorCode::ResponseHookFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            ProxyErrorCode::ConnectionFailed => StatusCode::BAD_GATEWAY,
            ProxyErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Proxy-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ProxyErrorCode::UnknownProxy => "UNKNOWN_PROXY",
            ProxyErrorCode::ProxyCreationFailed => "PROXY_CREATION_FAILED",
            ProxyErrorCode::MalformedTarget => "MALFORMED_TARGET",
            ProxyErrorCode::ResponseHookFailed => "RESPONSE_HOOK_FAILED",
            ProxyErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            ProxyErrorCode::ConnectionFailed => "CONNECTION_FAILED",
            ProxyErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ProxyErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ProxyErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Proxy-Error header
pub fn json_error_response(code: ProxyErrorCode, message: impl Into<String>) -> Response<ProxyBody> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Proxy-Error", code.as_header_value())
        .body(full_body(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// The fixed plain-text reply for a target that does not parse to a URL with a host
pub fn parse_url_error_response() -> Response<ProxyBody> {
    Response::builder()
        .status(StatusCode::NOT_FOUND)
        .body(full_body("parse url error"))
        .expect("valid response builder")
}

pub(crate) fn full_body(chunk: impl Into<Bytes>) -> ProxyBody {
    Full::new(chunk.into()).map_err(|never| match never {}).boxed()
}
