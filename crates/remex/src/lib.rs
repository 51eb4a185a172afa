//! # Remex
//!
//! Remote command execution over SSH.
//!
//! A [`Session`] owns one connection to one host and runs one command at a
//! time inside it. Command output is collected by an [`OutputBuffer`] and
//! delivered to a registered callback on a fixed interval, and each callback
//! runs under the correlation identifier that was active when it was
//! registered.

#![warn(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

pub use remex_ssh as ssh;

/// Error types for the Remex library
pub mod error;

/// Output accumulation and interval-driven delivery
pub mod buffer;

/// Correlation identifiers carried into output callbacks
pub mod correlation;

/// Remote command line composition
pub mod command;

/// Session configuration
pub mod config;

/// Session management and command execution
pub mod session;

pub use error::RemexError;
pub use buffer::{OutputBuffer, OutputSink};
pub use correlation::CorrelationId;
pub use config::SessionConfig;
pub use session::{ExitStatus, OutputChunk, OutputMeta, Session, SessionBuilder};

/// Result type alias for Remex operations
pub type Result<T> = std::result::Result<T, RemexError>;
