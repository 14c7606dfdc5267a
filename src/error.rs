use crate::config::ConfigError;
use crate::http::Response;
use std::io;
use std::time::Duration;
use thiserror::Error;

/// Why a single request failed. Every variant stays local to its connection.
#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("malformed request: {0}")]
    BadRequest(String),
    #[error("Script not found")]
    NotFound(String),
    #[error("path escapes the script root")]
    Forbidden(String),
    #[error("method {0} not allowed")]
    MethodNotAllowed(String),
    #[error("request too large: {0}")]
    PayloadTooLarge(String),
    #[error("invalid script arguments: {0}")]
    InvalidArguments(String),
    #[error("failed to launch {script}: {source}")]
    Launch {
        script: String,
        #[source]
        source: io::Error,
    },
    #[error("{script} failed mid-stream: {reason}")]
    Stream { script: String, reason: String },
    #[error("{script} exceeded the {limit:?} execution limit")]
    Timeout { script: String, limit: Duration },
}

impl GatewayError {
    pub fn status_code(&self) -> u16 {
        match self {
            GatewayError::BadRequest(_) => 400,
            GatewayError::Forbidden(_) => 403,
            GatewayError::NotFound(_) => 404,
            GatewayError::MethodNotAllowed(_) => 405,
            GatewayError::PayloadTooLarge(_) => 413,
            GatewayError::InvalidArguments(_) => 422,
            GatewayError::Launch { .. } => 500,
            GatewayError::Stream { .. } => 502,
            GatewayError::Timeout { .. } => 504,
        }
    }
}

/// Errors that stop the gateway from starting at all.
#[derive(Debug, Error)]
pub enum ServerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("cannot listen on {addr}: {source}")]
    Bind {
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Builds the complete response for a request that failed before streaming.
pub fn generate_error_response(err: &GatewayError) -> Response {
    let mut res = Response::new(err.status_code());
    res.body = serde_json::json!({ "detail": err.to_string() })
        .to_string()
        .into_bytes();
    let length = res.body.len();
    res.header("Content-Type", "application/json")
        .header("Content-Length", length.to_string())
        .header("Connection", "close");
    if let GatewayError::MethodNotAllowed(_) = err {
        res.header("Allow", "POST");
    }
    res
}
