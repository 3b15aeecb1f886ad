//! Error types and JSON negative responses

use http_body_util::Full;
use hyper::body::Bytes;
use hyper::{Response, StatusCode};
use serde::Serialize;
use std::path::PathBuf;

/// Errors raised while reading, expanding or validating the config file.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid service block #{index}: {source}")]
    Service {
        index: usize,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid top-level configuration: {0}")]
    Global(#[source] toml::de::Error),

    #[error("service block #{index} references unknown template '{template}'")]
    UnknownTemplate { index: usize, template: String },

    #[error("configured port changed from {current} to {requested}; restart required")]
    PortChanged { current: u16, requested: u16 },

    #[error("configuration errors:\n  - {}", .0.join("\n  - "))]
    Invalid(Vec<String>),
}

/// Errors raised while loading a hosted application.
#[derive(Debug, thiserror::Error)]
pub enum LoadError {
    #[error("failed to read application file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse application file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("application file {path} has no binding named '{name}'")]
    MissingBinding { path: PathBuf, name: String },

    #[error("binding '{name}' in {path} does not name a handler")]
    MissingHandler { path: PathBuf, name: String },

    #[error("unknown application handler '{0}'")]
    UnknownHandler(String),

    #[error("handler '{handler}' failed to initialize: {message}")]
    Init { handler: String, message: String },
}

/// Error codes for negative responses produced by the worker itself
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum RouteErrorCode {
    /// No service prefix matched the request URI
    NoRoute,
    /// The service queue is at capacity
    ServiceBusy,
    /// The application did not answer within the service timeout
    RequestTimeout,
    /// The application failed while handling the request
    ApplicationError,
    /// The request could not be read or rewritten
    BadRequest,
}

impl RouteErrorCode {
    pub fn status_code(&self) -> StatusCode {
        match self {
            RouteErrorCode::NoRoute => StatusCode::NOT_FOUND,
            RouteErrorCode::ServiceBusy => StatusCode::SERVICE_UNAVAILABLE,
            RouteErrorCode::RequestTimeout => StatusCode::GATEWAY_TIMEOUT,
            RouteErrorCode::ApplicationError => StatusCode::INTERNAL_SERVER_ERROR,
            RouteErrorCode::BadRequest => StatusCode::BAD_REQUEST,
        }
    }

    /// Value for the X-Multiserver-Error header
    pub fn as_header_value(&self) -> &'static str {
        match self {
            RouteErrorCode::NoRoute => "NO_ROUTE",
            RouteErrorCode::ServiceBusy => "SERVICE_BUSY",
            RouteErrorCode::RequestTimeout => "REQUEST_TIMEOUT",
            RouteErrorCode::ApplicationError => "APPLICATION_ERROR",
            RouteErrorCode::BadRequest => "BAD_REQUEST",
        }
    }
}

/// JSON error response body
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub code: RouteErrorCode,
    pub message: String,
    pub status: u16,
}

impl ErrorResponse {
    pub fn new(code: RouteErrorCode, message: impl Into<String>) -> Self {
        Self {
            status: code.status_code().as_u16(),
            code,
            message: message.into(),
        }
    }

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

/// Header carrying the error code on negative responses
pub const X_MULTISERVER_ERROR: &str = "x-multiserver-error";

/// Build a JSON negative response as plain bytes (application-level response type)
pub fn error_response(code: RouteErrorCode, message: impl Into<String>) -> Response<Bytes> {
    let body = ErrorResponse::new(code, message).to_json();

    Response::builder()
        .status(code.status_code())
        .header("Content-Type", "application/json")
        .header(X_MULTISERVER_ERROR, code.as_header_value())
        .body(Bytes::from(body))
        .expect("valid response with StatusCode enum and static headers")
}

/// Same as [`error_response`], with a body ready for hyper
pub fn json_error_response(code: RouteErrorCode, message: impl Into<String>) -> Response<Full<Bytes>> {
    error_response(code, message).map(Full::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_code_status_codes() {
        assert_eq!(RouteErrorCode::NoRoute.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(
            RouteErrorCode::ServiceBusy.status_code(),
            StatusCode::SERVICE_UNAVAILABLE
        );
        assert_eq!(
            RouteErrorCode::RequestTimeout.status_code(),
            StatusCode::GATEWAY_TIMEOUT
        );
        assert_eq!(
            RouteErrorCode::ApplicationError.status_code(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }

    #[test]
    fn test_error_response_json() {
        let error = ErrorResponse::new(RouteErrorCode::NoRoute, "no service for /missing");
        let json = error.to_json();

        assert!(json.contains("\"code\":\"NO_ROUTE\""));
        assert!(json.contains("\"message\":\"no service for /missing\""));
        assert!(json.contains("\"status\":404"));
    }

    #[test]
    fn test_json_error_response_headers() {
        let response = json_error_response(RouteErrorCode::ServiceBusy, "queue full");

        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(
            response.headers().get("Content-Type").unwrap(),
            "application/json"
        );
        assert_eq!(
            response.headers().get(X_MULTISERVER_ERROR).unwrap(),
            "SERVICE_BUSY"
        );
    }

    #[test]
    fn test_invalid_config_lists_every_problem() {
        let err = ConfigError::Invalid(vec!["first".into(), "second".into()]);
        let text = err.to_string();
        assert!(text.contains("  - first"));
        assert!(text.contains("  - second"));
    }
}
