//! Error Module
//!
//! Defines error types and result types used throughout the index server.

use hyper::StatusCode;
use thiserror::Error;

/// Main error type for the index server
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProxyError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Jail escape: {0}")]
    BadJailEscape(String),

    #[error("Symlink read error: {0}")]
    SymlinkReadError(String),

    #[error("Symlink loop: {0}")]
    SymlinkLoop(String),

    #[error("Listing read error: {0}")]
    ListingReadError(String),

    #[error("Invalid range: {0}")]
    InvalidRange(String),

    #[error("IO error: {0}")]
    IoError(String),

    #[error("HTTP error: {0}")]
    HttpError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("System error: {0}")]
    SystemError(String),

    #[error("Timeout error: {0}")]
    TimeoutError(String),
}

impl ProxyError {
    /// HTTP status reported to the client for this error
    pub fn status_code(&self) -> StatusCode {
        match self {
            ProxyError::NotFound(_) => StatusCode::NOT_FOUND,
            ProxyError::BadJailEscape(_)
            | ProxyError::SymlinkReadError(_)
            | ProxyError::SymlinkLoop(_) => StatusCode::BAD_REQUEST,
            ProxyError::InvalidRange(_) => StatusCode::RANGE_NOT_SATISFIABLE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Text written as the response body
    pub fn client_message(&self) -> String {
        match self {
            ProxyError::BadJailEscape(_) => "Symlink points outside of jail".to_string(),
            ProxyError::SymlinkLoop(_) => "Symlink loop".to_string(),
            ProxyError::NotFound(msg)
            | ProxyError::SymlinkReadError(msg)
            | ProxyError::ListingReadError(msg)
            | ProxyError::InvalidRange(msg)
            | ProxyError::IoError(msg)
            | ProxyError::HttpError(msg)
            | ProxyError::ConfigError(msg)
            | ProxyError::SystemError(msg)
            | ProxyError::TimeoutError(msg) => msg.clone(),
        }
    }
}

impl From<std::io::Error> for ProxyError {
    fn from(err: std::io::Error) -> Self {
        ProxyError::IoError(err.to_string())
    }
}

impl From<hyper::Error> for ProxyError {
    fn from(err: hyper::Error) -> Self {
        ProxyError::HttpError(err.to_string())
    }
}

impl From<serde_yaml::Error> for ProxyError {
    fn from(err: serde_yaml::Error) -> Self {
        ProxyError::ConfigError(err.to_string())
    }
}

/// Result type alias for the index server
pub type Result<T> = std::result::Result<T, ProxyError>;
