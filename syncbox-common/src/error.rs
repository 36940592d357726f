//! Common error types for Syncbox

use thiserror::Error;

/// Common result type for Syncbox operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error types shared by the peer node and the relay
#[derive(Error, Debug)]
pub enum Error {
    /// I/O operation error (wraps std::io::Error)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Configuration loading or validation error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Malformed or unexpected protocol frame
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Invalid user input or request parameter
    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Protocol(e.to_string())
    }
}
