//! Error types for dodo.
//!
//! Every fallible operation in the crate returns [`DodoError`]. Variants are
//! grouped by the layer that produces them so callers can tell a broken
//! connection from a remote application failure without string matching.

use std::path::PathBuf;
use thiserror::Error;

/// Main error type for the dodo framework.
#[derive(Debug, Error)]
pub enum DodoError {
    // Configuration errors
    #[error("codec not found: {0}")]
    CodecNotFound(String),

    #[error("no client registered for protocol: {0}")]
    ClientNotFound(String),

    #[error("no compatible codec between client [{client}] and service [{service}]")]
    NoCompatibleCodec { client: String, service: String },

    #[error("TLS configuration error: {message}")]
    Tls { message: String },

    #[error("Configuration error: {message}")]
    Config { message: String },

    // Connectivity errors
    #[error("failed to dial {address}: {message}")]
    Dial { address: String, message: String },

    #[error("send failed: {message}")]
    Send { message: String },

    #[error("receive failed: {message}")]
    Recv { message: String },

    #[error("connection closed by peer")]
    ConnectionClosed,

    #[error("operation timed out after {0:?}")]
    Timeout(std::time::Duration),

    #[error("frame of {size} bytes exceeds maximum {max}")]
    FrameTooLarge { size: usize, max: usize },

    // Dispatch errors
    #[error("service not found: {0}")]
    ServiceNotFound(String),

    #[error("function not found: {service}.{func}")]
    FunctionNotFound { service: String, func: String },

    #[error("duplicate service name: {0}")]
    DuplicateService(String),

    /// Error string carried back in a response envelope.
    #[error("{message}")]
    Remote { message: String },

    // Discovery errors
    #[error("no instances available for service: {0}")]
    NoneAvailable(String),

    #[error("registry error: {message}")]
    Registry { message: String },

    #[error("invalid service record: {message}")]
    InvalidService { message: String },

    #[error("watcher stopped")]
    WatcherStopped,

    // Storage and serialization errors
    #[error("IO error at {path:?}: {message}")]
    Io {
        message: String,
        path: Option<PathBuf>,
        #[source]
        source: Option<std::io::Error>,
    },

    #[error("Database error: {message}")]
    Database {
        message: String,
        #[source]
        source: Option<rusqlite::Error>,
    },

    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("codec error: {message}")]
    Codec { message: String },

    #[error("{0}")]
    Other(String),
}

/// Result type alias for dodo operations.
pub type Result<T> = std::result::Result<T, DodoError>;

impl From<std::io::Error> for DodoError {
    fn from(err: std::io::Error) -> Self {
        DodoError::Io {
            message: err.to_string(),
            path: None,
            source: Some(err),
        }
    }
}

impl From<serde_json::Error> for DodoError {
    fn from(err: serde_json::Error) -> Self {
        DodoError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rusqlite::Error> for DodoError {
    fn from(err: rusqlite::Error) -> Self {
        DodoError::Database {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<rmp_serde::encode::Error> for DodoError {
    fn from(err: rmp_serde::encode::Error) -> Self {
        DodoError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<rmp_serde::decode::Error> for DodoError {
    fn from(err: rmp_serde::decode::Error) -> Self {
        DodoError::Codec {
            message: err.to_string(),
        }
    }
}

impl From<rustls::Error> for DodoError {
    fn from(err: rustls::Error) -> Self {
        DodoError::Tls {
            message: err.to_string(),
        }
    }
}

impl From<rcgen::Error> for DodoError {
    fn from(err: rcgen::Error) -> Self {
        DodoError::Tls {
            message: format!("certificate generation failed: {}", err),
        }
    }
}

impl DodoError {
    /// Create an IO error with path context.
    pub fn io_with_path(err: std::io::Error, path: impl Into<PathBuf>) -> Self {
        DodoError::Io {
            message: err.to_string(),
            path: Some(path.into()),
            source: Some(err),
        }
    }

    /// Create a registry error from any displayable cause.
    pub fn registry(message: impl std::fmt::Display) -> Self {
        DodoError::Registry {
            message: message.to_string(),
        }
    }

    /// Whether the error means the underlying connection can no longer be trusted.
    ///
    /// Connections that fail this way are closed instead of returned to the pool.
    pub fn is_connectivity(&self) -> bool {
        matches!(
            self,
            DodoError::Dial { .. }
                | DodoError::Send { .. }
                | DodoError::Recv { .. }
                | DodoError::ConnectionClosed
                | DodoError::Timeout(_)
                | DodoError::FrameTooLarge { .. }
        )
    }

    /// Whether the error comes from service discovery.
    pub fn is_discovery(&self) -> bool {
        matches!(
            self,
            DodoError::NoneAvailable(_)
                | DodoError::Registry { .. }
                | DodoError::InvalidService { .. }
                | DodoError::WatcherStopped
        )
    }
}
