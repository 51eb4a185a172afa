//! Session configuration

use crate::command::DEFAULT_LOGIN_SHELL;
use crate::{RemexError, Result};
use remex_ssh::SshConfig;
use serde::Deserialize;
use std::path::Path;
use std::time::Duration;

/// Configuration of one [`Session`](crate::Session).
///
/// Deserializes from a flat JSON object; connection fields (`host`, `port`,
/// `username`, `password`, `private_key_path`, `connect_timeout`) sit next
/// to the session fields.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// SSH configuration
    #[serde(flatten)]
    pub ssh: SshConfig,
    /// Output drain interval in seconds; 0 delivers every chunk as it arrives
    pub buffer: f64,
    /// Longest single wait for channel events, in milliseconds
    pub poll_interval_ms: u64,
    /// Upper bound for `exec_timeout`, in seconds
    pub command_timeout: Option<u64>,
    /// Shell invocation wrapping every command
    pub login_shell: String,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ssh: SshConfig::default(),
            buffer: 0.5,
            poll_interval_ms: 100,
            command_timeout: None,
            login_shell: DEFAULT_LOGIN_SHELL.to_string(),
        }
    }
}

impl SessionConfig {
    /// Parse and validate a JSON configuration
    pub fn from_json_str(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Read, parse and validate a JSON configuration file
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        Self::from_json_str(&json)
    }

    /// Reject values a session cannot run with
    pub fn validate(&self) -> Result<()> {
        self.ssh.validate()?;
        if !self.buffer.is_finite() || self.buffer < 0.0 {
            return Err(RemexError::Config(format!("buffer must be a non-negative number of seconds, got {}", self.buffer)));
        }
        if self.poll_interval_ms == 0 {
            return Err(RemexError::Config("poll_interval_ms must be greater than 0".to_string()));
        }
        if self.login_shell.trim().is_empty() {
            return Err(RemexError::Config("login_shell must not be empty".to_string()));
        }
        Ok(())
    }

    /// Output drain interval
    pub fn buffer_interval(&self) -> Duration {
        if self.buffer.is_finite() && self.buffer > 0.0 {
            Duration::from_secs_f64(self.buffer)
        } else {
            Duration::ZERO
        }
    }

    /// Longest single wait for channel events
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    /// Configured command timeout
    pub fn command_timeout(&self) -> Option<Duration> {
        self.command_timeout.map(Duration::from_secs)
    }
}
