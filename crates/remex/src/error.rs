//! Error types for the Remex library

use thiserror::Error;
use std::time::Duration;

/// Main error type for Remex operations
#[derive(Debug, Error)]
pub enum RemexError {
    /// Connecting or authenticating to the remote host failed
    #[error("Connection error: {0}")]
    Connection(String),

    /// The remote host refused to start a command
    #[error("Failed to start `{command}`: {reason}")]
    ExecStart {
        /// Command as given by the caller
        command: String,
        /// Reason reported by the transport
        reason: String,
    },

    /// Transport failure outside connect and command start
    #[error("Transport error: {0}")]
    Transport(String),

    /// Timeout errors
    #[error("Timeout after {duration:?}")]
    Timeout {
        /// Duration that was exceeded
        duration: Duration,
    },

    /// Invalid configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization errors
    #[error("Serialization error: {0}")]
    Serialization(String),
}

impl From<remex_ssh::TransportError> for RemexError {
    fn from(err: remex_ssh::TransportError) -> Self {
        match err {
            remex_ssh::TransportError::Connection(msg) => Self::Connection(msg),
            remex_ssh::TransportError::Authentication(msg) => Self::Connection(format!("authentication failed: {}", msg)),
            remex_ssh::TransportError::Channel(msg) => Self::Transport(msg),
            remex_ssh::TransportError::ExecRefused(msg) => Self::Transport(format!("exec refused: {}", msg)),
            remex_ssh::TransportError::Timeout(addr) => Self::Connection(format!("timed out connecting to {}", addr)),
            remex_ssh::TransportError::Configuration(msg) => Self::Config(msg),
            remex_ssh::TransportError::Closed => Self::Transport("connection closed".to_string()),
        }
    }
}

impl From<serde_json::Error> for RemexError {
    fn from(err: serde_json::Error) -> Self {
        Self::Serialization(format!("JSON error: {}", err))
    }
}

impl RemexError {
    /// Whether connecting or authenticating to the remote host failed.
    ///
    /// Commands that ran and failed are reported as an
    /// [`ExitStatus`](crate::ExitStatus), never as an error.
    pub fn is_connection_failure(&self) -> bool {
        matches!(self, Self::Connection(_))
    }
}
