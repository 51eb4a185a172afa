//! # Remex SSH Transport
//!
//! Transport contract and SSH implementations for Remex sessions.

#![warn(missing_docs)]

/// Transport abstraction and connection configuration
pub mod transport;

/// libssh2-backed transport
#[cfg(feature = "ssh2")]
pub mod libssh2;

/// Scripted in-memory transport for tests
#[cfg(any(test, feature = "mock"))]
pub mod mock;

/// SSH-specific error types
pub mod error;

pub use transport::{
    ChannelEvent, Connection, ConnectionInfo, ExecChannel, SshConfig, Transport, TransportType,
};
#[cfg(feature = "ssh2")]
pub use libssh2::Ssh2Transport;
pub use error::TransportError;
