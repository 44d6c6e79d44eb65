//! Error types for the proxy.

use thiserror::Error;

use periscope_core::session::SessionError;

use crate::validate::ValidationError;

/// Proxy-level error type.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// Start-request validation failed; nothing was created.
    #[error("validation failed: {0}")]
    Validation(#[from] ValidationError),

    /// Session registry error.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// A listener could not bind its port.
    #[error("failed to bind {role} listener on port {port}: {source}")]
    Listen {
        role: &'static str,
        port: u16,
        source: std::io::Error,
    },
}

/// Errors on a single relayed connection. Contained to that connection.
#[derive(Debug, Error)]
pub enum RelayError {
    /// The client closed before a full request arrived.
    #[error("client closed before a full request arrived")]
    IncompleteRequest,

    /// The request line could not be parsed.
    #[error("malformed request line: {0:?}")]
    MalformedRequestLine(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for proxy operations.
pub type Result<T> = std::result::Result<T, ProxyError>;
