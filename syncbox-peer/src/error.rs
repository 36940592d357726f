//! Error types for syncbox-peer
//!
//! Every failure degrades to "no playback occurs": errors are logged and
//! surfaced as events, never allowed to take the node down.

use syncbox_common::PeerId;
use thiserror::Error;

/// Main error type for the peer node
#[derive(Error, Debug)]
pub enum Error {
    /// Remote resource unreachable or invalid
    #[error("Fetch error: {0}")]
    Fetch(String),

    /// Fetched bytes are not decodable audio
    #[error("Decode error: {0}")]
    Decode(String),

    /// No live endpoint is registered for the peer
    #[error("No endpoint registered for {0}")]
    EndpointNotFound(PeerId),

    /// Dispatch found the endpoint but the local cache lacks the resource
    #[error("Resource not cached: {0}")]
    NotCached(String),

    /// Session layer errors (relay connection, broadcast)
    #[error("Session error: {0}")]
    Session(String),

    /// Audio output device errors
    #[error("Audio output error: {0}")]
    AudioOutput(String),

    /// Locator rejected by the control surface
    #[error("Invalid locator: {0}")]
    InvalidLocator(String),

    /// Configuration loading errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// HTTP server errors
    #[error("HTTP server error: {0}")]
    Http(String),

    /// File I/O errors
    #[error("File I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Errors from the shared library
    #[error(transparent)]
    Common(#[from] syncbox_common::Error),
}

/// Convenience Result type using the syncbox-peer Error
pub type Result<T> = std::result::Result<T, Error>;
