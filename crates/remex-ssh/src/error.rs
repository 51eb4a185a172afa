//! SSH-specific error types

use thiserror::Error;

/// Transport-specific errors
#[derive(Debug, Error)]
pub enum TransportError {
    /// Network or handshake failure while connecting
    #[error("SSH connection error: {0}")]
    Connection(String),

    /// Authentication error
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// Channel could not be opened or failed while running
    #[error("Channel error: {0}")]
    Channel(String),

    /// Remote side refused to start the requested command
    #[error("Remote refused to start command: {0}")]
    ExecRefused(String),

    /// Connecting to the remote host did not finish in time
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Connection already closed
    #[error("Connection closed")]
    Closed,
}
