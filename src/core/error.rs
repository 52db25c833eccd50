//! Error types and handling for the gateway.
//!
//! This module provides a unified error type [`AppError`] for the request path
//! and implements HTTP response conversion, plus [`ConfigError`] for
//! configuration loading failures.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

const ERROR_TYPE_INVALID_REQUEST: &str = "invalid_request_error";
const ERROR_TYPE_AUTHENTICATION: &str = "authentication_error";
const ERROR_TYPE_PERMISSION: &str = "permission_error";
const ERROR_TYPE_RATE_LIMIT: &str = "rate_limit_error";
const ERROR_TYPE_API: &str = "api_error";

/// Errors raised while loading or parsing the configuration file.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("unsupported config format: {0:?}")]
    UnsupportedFormat(String),

    #[error("JSON syntax error at line {line}, column {column} near `{context}`: {source}")]
    Json {
        line: usize,
        column: usize,
        context: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("YAML parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("invalid listen address: {0}")]
    InvalidListenAddress(String),
}

/// Main error type for the request path.
///
/// Every failure is local and recoverable: it is surfaced to the caller as a
/// structured error body and never terminates the process.
#[derive(Error, Debug)]
pub enum AppError {
    /// The requested (or redirected) model has no configured backend
    #[error("model {0} not found in the configuration")]
    ModelNotFound(String),

    /// Backends exist for the model but all of them are disabled
    #[error("no enabled model {0} found in the configuration")]
    NoEnabledBackend(String),

    /// Presented key does not match the master key
    #[error("Unauthorized")]
    Unauthorized,

    /// Presented key is absent from the configured key table
    #[error("Forbidden: invalid API key")]
    UnauthorizedApiKey,

    /// The key's allow-list does not cover the model
    #[error("Forbidden: model {0} not supported for this API key")]
    ForbiddenModelForKey(String),

    /// Admission wait exceeded its deadline or was canceled
    #[error("Request rate limit exceeded: {0}")]
    RateLimited(String),

    /// Multi-part content sent to a model outside the multi-content allow-list
    #[error("model {0} does not support multi content messages")]
    UnsupportedMultiContent(String),

    #[error("unsupported proxy type: {0}")]
    UnsupportedProxyType(String),

    /// Proxy transport could not be built from the configuration
    #[error("proxy transport error: {0}")]
    ProxyTransport(String),

    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// HTTP request errors from the reqwest client
    #[error("HTTP request error: {0}")]
    Request(#[from] reqwest::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Not implemented: {0}")]
    NotImplemented(String),

    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AppError {
    fn status_and_type(&self) -> (StatusCode, &'static str) {
        match self {
            AppError::ModelNotFound(_) => (StatusCode::NOT_FOUND, ERROR_TYPE_INVALID_REQUEST),
            AppError::NoEnabledBackend(_) => (StatusCode::SERVICE_UNAVAILABLE, ERROR_TYPE_API),
            AppError::Unauthorized | AppError::UnauthorizedApiKey => {
                (StatusCode::UNAUTHORIZED, ERROR_TYPE_AUTHENTICATION)
            }
            AppError::ForbiddenModelForKey(_) => (StatusCode::FORBIDDEN, ERROR_TYPE_PERMISSION),
            AppError::RateLimited(_) => (StatusCode::TOO_MANY_REQUESTS, ERROR_TYPE_RATE_LIMIT),
            AppError::UnsupportedMultiContent(_) | AppError::BadRequest(_) => {
                (StatusCode::BAD_REQUEST, ERROR_TYPE_INVALID_REQUEST)
            }
            AppError::Request(e) => {
                if e.is_timeout() {
                    (StatusCode::GATEWAY_TIMEOUT, ERROR_TYPE_API)
                } else {
                    (StatusCode::BAD_GATEWAY, ERROR_TYPE_API)
                }
            }
            AppError::NotImplemented(_) => (StatusCode::NOT_IMPLEMENTED, ERROR_TYPE_API),
            AppError::UnsupportedProxyType(_)
            | AppError::ProxyTransport(_)
            | AppError::Config(_)
            | AppError::Serialization(_)
            | AppError::Internal(_) => (StatusCode::INTERNAL_SERVER_ERROR, ERROR_TYPE_API),
        }
    }

    /// HTTP status this error maps to.
    pub fn status_code(&self) -> StatusCode {
        self.status_and_type().0
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, error_type) = self.status_and_type();

        if status.is_server_error() {
            tracing::error!(status = %status, error = %self, "Request failed");
        } else {
            tracing::debug!(status = %status, error = %self, "Request rejected");
        }

        let body = Json(json!({
            "error": {
                "message": self.to_string(),
                "type": error_type,
                "code": status.as_u16()
            }
        }));

        (status, body).into_response()
    }
}

/// Convenience type alias for Results using [`AppError`].
pub type Result<T> = std::result::Result<T, AppError>;
