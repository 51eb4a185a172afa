//! Transport abstraction and connection configuration

use async_trait::async_trait;
use bytes::Bytes;
use crate::TransportError;
use serde::Deserialize;
use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

/// Transport abstraction for different connection backends
#[async_trait]
pub trait Transport: Send + Sync {
    /// Connect and authenticate to the configured remote host
    async fn connect(&self, config: &SshConfig) -> Result<Box<dyn Connection>, TransportError>;

    /// Backend implemented by this transport
    fn transport_type(&self) -> TransportType;
}

/// An open, authenticated connection to one remote host
#[async_trait]
pub trait Connection: Send {
    /// Whether the underlying connection has been closed
    fn is_closed(&self) -> bool;

    /// Open a new command channel
    async fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, TransportError>;

    /// Close the connection. Closing twice is a no-op.
    async fn close(&mut self) -> Result<(), TransportError>;

    /// Get connection information
    fn info(&self) -> ConnectionInfo;
}

/// A single command-execution stream on a connection
#[async_trait]
pub trait ExecChannel: Send {
    /// Ask the remote side to run `command`.
    ///
    /// Returns [`TransportError::ExecRefused`] when the remote refuses the request.
    async fn exec(&mut self, command: &str) -> Result<(), TransportError>;

    /// Wait at most `wait` for the next channel event.
    ///
    /// `Ok(None)` means no event arrived within the wait.
    async fn process(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, TransportError>;
}

/// Events reported by a running command channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelEvent {
    /// Output data (stdout and stderr combined, in arrival order)
    Data(Bytes),
    /// Remote process reported an exit status
    ExitStatus(i32),
    /// Remote process was terminated by a signal
    ExitSignal(String),
    /// Remote side will send no more data
    Eof,
    /// Channel completed; no further events follow
    Closed,
}

/// Connection information
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port
    pub port: u16,
    /// Username
    pub username: String,
    /// Connection type
    pub transport_type: TransportType,
}

impl ConnectionInfo {
    /// Build connection information for `config`
    pub fn from_config(config: &SshConfig, transport_type: TransportType) -> Self {
        Self {
            host: config.host.clone(),
            port: config.port,
            username: config.username.clone(),
            transport_type,
        }
    }
}

impl fmt::Display for ConnectionInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}:{}", self.username, self.host, self.port)
    }
}

/// Transport type enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportType {
    /// SSH with libssh2
    SshLibssh2,
    /// Scripted in-memory transport (for testing)
    Mock,
}

/// SSH configuration
#[derive(Clone, Deserialize)]
#[serde(default)]
pub struct SshConfig {
    /// Remote hostname or IP
    pub host: String,
    /// Remote port (default: 22)
    pub port: u16,
    /// Username
    pub username: String,
    /// Password, tried first when present
    pub password: Option<String>,
    /// Private key path
    #[serde(alias = "private_key_path")]
    pub key_path: Option<PathBuf>,
    /// Connection timeout in seconds
    pub connect_timeout: u64,
}

impl SshConfig {
    /// Connection timeout as a [`Duration`]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }

    /// Check the configuration for values no transport can use
    pub fn validate(&self) -> Result<(), TransportError> {
        if self.host.is_empty() {
            return Err(TransportError::Configuration("host must not be empty".to_string()));
        }
        if self.username.is_empty() {
            return Err(TransportError::Configuration("username must not be empty".to_string()));
        }
        if self.port == 0 {
            return Err(TransportError::Configuration("port must not be 0".to_string()));
        }
        if self.connect_timeout == 0 {
            return Err(TransportError::Configuration("connect_timeout must be at least 1 second".to_string()));
        }
        Ok(())
    }
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 22,
            username: "root".to_string(),
            password: None,
            key_path: None,
            connect_timeout: 30,
        }
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &self.username)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_path", &self.key_path)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}
