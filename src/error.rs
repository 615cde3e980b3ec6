//! Error handling and JSON error responses for the proxy

use http_body_util::{combinators::UnsyncBoxBody, BodyExt, Full};
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;

/// Error codes for serving errors
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ServeErrorCode {
    /// No tenant could be derived from the request, or the derived value
    /// collides with a reserved asset-folder name
    InvalidTenant,
    /// The resolved object (and the index fallback, where applicable)
    /// does not exist in the store
    AssetNotFound,
    /// The object store failed for a reason other than absence
    UpstreamUnavailable,
    /// Internal serving error
    InternalError,
}

impl ServeErrorCode {
    /// Get the default HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServeErrorCode::InvalidTenant => StatusCode::NOT_FOUND,
            ServeErrorCode::AssetNotFound => StatusCode::NOT_FOUND,
            ServeErrorCode::UpstreamUnavailable => StatusCode::INTERNAL_SERVER_ERROR,
            ServeErrorCode::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Get the error code as a string for the X-Serve-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            ServeErrorCode::InvalidTenant => "INVALID_TENANT",
            ServeErrorCode::AssetNotFound => "ASSET_NOT_FOUND",
            ServeErrorCode::UpstreamUnavailable => "UPSTREAM_UNAVAILABLE",
            ServeErrorCode::InternalError => "INTERNAL_ERROR",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    /// The error code
    pub code: ServeErrorCode,
    /// Human-readable error message
    pub message: String,
    /// HTTP status code (for reference)
    pub status: u16,
}

impl ErrorResponse {
    /// Create a new error response
    pub fn new(code: ServeErrorCode, message: impl Into<String>) -> Self {
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

/// Create a JSON error response with X-Serve-Error header
pub fn json_error_response(
    code: ServeErrorCode,
    message: impl Into<String>,
) -> Response<UnsyncBoxBody<Bytes, std::io::Error>> {
    let error = ErrorResponse::new(code, message);
    let status = code.status_code();
    let body = error.to_json();

    Response::builder()
        .status(status)
        .header("Content-Type", "application/json")
        .header("X-Serve-Error", code.as_header_value())
        .body(
            Full::new(Bytes::from(body))
                .map_err(|never| match never {})
                .boxed_unsync(),
        )
        .expect("valid response with StatusCode enum and static headers")
}
