//! Error types shared by the mesh components.

use http::StatusCode;
use std::io;
use thiserror::Error;

/// Errors that can occur across the sidecar, control plane and deployer.
#[derive(Error, Debug)]
pub enum MeshError {
    /// Malformed input or a missing required field.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Unknown service or container.
    #[error("not found: {0}")]
    NotFound(String),

    /// Resolution or proxying towards an upstream failed.
    #[error("upstream failure: {0}")]
    UpstreamFailure(String),

    /// The sliding window for the caller is exhausted.
    #[error("rate limit exceeded")]
    RateLimited,

    /// Container runtime, store or serialization failure.
    #[error("runtime failure: {0}")]
    RuntimeFailure(String),

    /// An upstream answered with an unexpected status code.
    #[error("unexpected status code: {0}")]
    InvalidStatusCode(u16),

    /// The circuit breaker short-circuits calls towards this target.
    #[error("circuit breaker is open for target: {target}")]
    BreakerOpen { target: String },

    /// Failed to bind to the listener address.
    #[error("failed to bind listener to {addr}: {source}")]
    ListenerBind { addr: String, source: io::Error },

    /// Invalid configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// HTTP protocol error.
    #[error("http error: {0}")]
    Http(#[from] hyper::Error),

    /// I/O error.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

impl MeshError {
    /// Maps the error to the HTTP status code a handler should answer with.
    pub fn status(&self) -> StatusCode {
        match self {
            MeshError::InvalidRequest(_) => StatusCode::BAD_REQUEST,
            MeshError::NotFound(_) => StatusCode::NOT_FOUND,
            MeshError::RateLimited => StatusCode::TOO_MANY_REQUESTS,
            MeshError::UpstreamFailure(_)
            | MeshError::BreakerOpen { .. }
            | MeshError::InvalidStatusCode(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

/// Result type alias for mesh operations.
pub type Result<T> = std::result::Result<T, MeshError>;
