//! Error types for the Beacon endpoint

use thiserror::Error;

use crate::protocol::ProtocolError;

/// Result type alias for endpoint operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the endpoint core
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error (reported once at start-up)
    #[error("configuration error: {0}")]
    Config(String),

    /// Audio device error
    #[error("audio error: {0}")]
    Audio(String),

    /// Capture pipeline error
    #[error("capture error: {0}")]
    Capture(String),

    /// Playback pipeline error
    #[error("playback error: {0}")]
    Playback(String),

    /// A playback mode is already running
    #[error("playback already active")]
    AlreadyActive,

    /// No streaming playback is running
    #[error("no active playback stream")]
    NotActive,

    /// Assistant task has exited
    #[error("assistant is not running")]
    NotRunning,

    /// Cleaning (echo cancellation) capability error
    #[error("cleaning error: {0}")]
    Cleaning(String),

    /// Backend protocol error
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
