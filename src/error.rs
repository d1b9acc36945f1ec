use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde_json::json;
use thiserror::Error;

/// Unified error type for the gateway
#[derive(Error, Debug)]
pub enum GatewayError {
    // Routing errors
    #[error("Unknown endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Timed out reading the request body")]
    RequestTimeout,

    #[error("Invalid target URL: {0}")]
    InvalidTarget(String),

    // Egress errors
    #[error("No egress proxies available")]
    NoEgressAvailable,

    #[error("Egress proxy dial failed: {0}")]
    EgressDial(String),

    #[error("Egress proxy handshake failed: {0}")]
    EgressHandshake(String),

    #[error("Upstream request failed: {0}")]
    UpstreamRequest(String),

    #[error("Invalid proxy address: {0}")]
    InvalidProxyAddress(String),

    // Tunnel errors
    #[error("Connection hijacking is not supported")]
    HijackUnsupported,

    // Admission
    #[error("Server overloaded")]
    QueueFull,

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    // HTTP errors
    #[error("HTTP error: {0}")]
    Http(String),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for gateway operations
pub type Result<T> = std::result::Result<T, GatewayError>;

impl GatewayError {
    /// Get the HTTP status code for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            // 400 Bad Request
            GatewayError::InvalidEndpoint(_) | GatewayError::InvalidRequest(_) => {
                StatusCode::BAD_REQUEST
            }

            GatewayError::RequestTimeout => StatusCode::REQUEST_TIMEOUT,

            // 502 Bad Gateway
            GatewayError::EgressDial(_)
            | GatewayError::EgressHandshake(_)
            | GatewayError::UpstreamRequest(_)
            | GatewayError::InvalidProxyAddress(_) => StatusCode::BAD_GATEWAY,

            // 503 Service Unavailable
            GatewayError::NoEgressAvailable | GatewayError::QueueFull => {
                StatusCode::SERVICE_UNAVAILABLE
            }

            // 500 Internal Server Error
            GatewayError::InvalidTarget(_)
            | GatewayError::HijackUnsupported
            | GatewayError::InvalidConfig(_)
            | GatewayError::Io(_)
            | GatewayError::Serialization(_)
            | GatewayError::Http(_)
            | GatewayError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Check if this is a client error (4xx)
    pub fn is_client_error(&self) -> bool {
        self.status_code().is_client_error()
    }

    /// Check if this is a server error (5xx)
    pub fn is_server_error(&self) -> bool {
        self.status_code().is_server_error()
    }

    /// Whether the failure should be attributed to the egress proxy that carried it
    pub fn is_egress_failure(&self) -> bool {
        matches!(
            self,
            GatewayError::EgressDial(_)
                | GatewayError::EgressHandshake(_)
                | GatewayError::UpstreamRequest(_)
                | GatewayError::InvalidProxyAddress(_)
        )
    }
}

// Implement IntoResponse for metrics API error responses
impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let body = json!({
            "error": self.to_string(),
        });

        (status, Json(body)).into_response()
    }
}

// Convert from hyper errors
impl From<hyper::Error> for GatewayError {
    fn from(err: hyper::Error) -> Self {
        GatewayError::Http(err.to_string())
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for GatewayError {
    fn from(err: url::ParseError) -> Self {
        GatewayError::InvalidTarget(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_builder() {
            GatewayError::InvalidProxyAddress(err.to_string())
        } else {
            GatewayError::UpstreamRequest(err.to_string())
        }
    }
}
