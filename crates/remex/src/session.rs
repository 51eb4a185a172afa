//! Session management and command execution

use crate::buffer::{OutputBuffer, OutputSink};
use crate::command;
use crate::config::SessionConfig;
use crate::correlation::{Correlated, CorrelationId};
use crate::{RemexError, Result};
use bytes::Bytes;
use remex_ssh::{ChannelEvent, Connection, ConnectionInfo, ExecChannel, Transport, TransportError};
use std::borrow::Cow;
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, trace, warn};

/// Boxed output callback
type HandlerFn = Box<dyn FnMut(OutputChunk) + Send>;

/// Outcome of a remote command.
///
/// Indeterminate when the remote process never reported a status, for
/// example because it was killed by a signal or the channel failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitStatus(Option<i32>);

impl ExitStatus {
    /// Status reported by the remote process
    pub fn exited(code: i32) -> Self {
        Self(Some(code))
    }

    /// No status was reported
    pub fn indeterminate() -> Self {
        Self(None)
    }

    /// Reported exit code, if any
    pub fn code(&self) -> Option<i32> {
        self.0
    }

    /// Whether the command reported exit code 0
    pub fn success(&self) -> bool {
        self.0 == Some(0)
    }

    /// Whether no status was reported
    pub fn is_indeterminate(&self) -> bool {
        self.0.is_none()
    }
}

impl fmt::Display for ExitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(code) => write!(f, "exit status {}", code),
            None => f.write_str("indeterminate exit status"),
        }
    }
}

/// Identifies where a chunk of output came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputMeta {
    /// Name of the session that produced the output
    pub session: Arc<str>,
    /// Remote host
    pub host: Arc<str>,
    /// Correlation identifier captured when the handler was registered
    pub correlation_id: Option<CorrelationId>,
}

/// A chunk of command output delivered to a handler
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Raw output bytes (stdout and stderr combined)
    pub data: Bytes,
    /// Origin of the output
    pub meta: OutputMeta,
}

impl OutputChunk {
    /// Output as text, with invalid UTF-8 replaced
    pub fn text(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.data)
    }
}

/// Forwards drained output to a correlated handler
struct HandlerSink<'a, H> {
    handler: Option<&'a mut Correlated<H>>,
    session: &'a Arc<str>,
    host: &'a Arc<str>,
}

impl<H> OutputSink for HandlerSink<'_, H>
where
    H: FnMut(OutputChunk),
{
    fn deliver(&mut self, chunk: Bytes) {
        let Self { handler, session, host } = self;
        let Some(handler) = handler.as_deref_mut() else {
            trace!(session = %session, "No output handler registered, dropping {} bytes", chunk.len());
            return;
        };

        handler.call(|h, id| {
            h(OutputChunk {
                data: chunk,
                meta: OutputMeta {
                    session: Arc::clone(session),
                    host: Arc::clone(host),
                    correlation_id: id.cloned(),
                },
            })
        });
    }
}

/// Session builder for configuring connections
pub struct SessionBuilder {
    /// Target connection string
    target: String,
    /// Session name, defaults to the target
    name: Option<String>,
    /// Session configuration
    config: SessionConfig,
    /// Transport override
    transport: Option<Arc<dyn Transport>>,
}

impl SessionBuilder {
    /// Create a new session builder
    pub fn new(target: impl Into<String>) -> Self {
        let target = target.into();
        // Parse target string (user@host:port)
        let (username, host, port) = Self::parse_target(&target);

        let mut config = SessionConfig::default();
        config.ssh.host = host;
        config.ssh.port = port;
        config.ssh.username = username;

        Self {
            target,
            name: None,
            config,
            transport: None,
        }
    }

    /// Parse target string into components
    fn parse_target(target: &str) -> (String, String, u16) {
        // Format: [user@]host[:port]
        let mut username = "root".to_string();
        let mut host = target.to_string();
        let mut port = 22;

        // Extract username if present
        if let Some(at_pos) = target.find('@') {
            username = target[..at_pos].to_string();
            host = target[at_pos + 1..].to_string();
        }

        // Extract port if present
        if let Some(colon_pos) = host.rfind(':') {
            if let Ok(parsed_port) = host[colon_pos + 1..].parse::<u16>() {
                port = parsed_port;
                host = host[..colon_pos].to_string();
            }
        }

        (username, host, port)
    }

    /// Set the name used in log and output metadata
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Set password
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.config.ssh.password = Some(password.into());
        self
    }

    /// Set SSH key path
    pub fn with_key(mut self, key_path: PathBuf) -> Self {
        self.config.ssh.key_path = Some(key_path);
        self
    }

    /// Set connection timeout
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        // Whole seconds, rounded up, never 0
        let secs = timeout.as_secs() + u64::from(timeout.subsec_nanos() > 0);
        self.config.ssh.connect_timeout = secs.max(1);
        self
    }

    /// Set output drain interval; zero disables buffering
    pub fn with_buffer(mut self, interval: Duration) -> Self {
        self.config.buffer = interval.as_secs_f64();
        self
    }

    /// Set the longest single wait for channel events
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = u64::try_from(interval.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Set the command timeout
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.config.command_timeout = Some(timeout.as_secs());
        self
    }

    /// Set the login shell wrapping every command
    pub fn with_login_shell(mut self, shell: impl Into<String>) -> Self {
        self.config.login_shell = shell.into();
        self
    }

    /// Use `transport` instead of the default libssh2 transport
    pub fn with_transport(mut self, transport: Arc<dyn Transport>) -> Self {
        self.transport = Some(transport);
        self
    }

    /// Build the session configuration
    pub fn build_config(self) -> SessionConfig {
        self.config
    }

    /// Validate the configuration and create a disconnected session
    pub fn build(self) -> Result<Session> {
        self.config.validate()?;
        let name = self.name.unwrap_or(self.target);

        let transport = match self.transport {
            Some(transport) => transport,
            None => default_transport()?,
        };

        Ok(Session::with_transport(name, self.config, transport))
    }
}

#[cfg(feature = "ssh2")]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Ok(Arc::new(remex_ssh::Ssh2Transport::new()))
}

#[cfg(not(feature = "ssh2"))]
fn default_transport() -> Result<Arc<dyn Transport>> {
    Err(RemexError::Config("no transport configured and the ssh2 feature is disabled".to_string()))
}

/// One logical connection to one remote host.
///
/// Runs one command at a time. Output goes through the session's
/// [`OutputBuffer`] to the handler registered with [`Session::on_output`].
pub struct Session {
    /// Name used in log and output metadata
    name: Arc<str>,
    /// Remote host, shared with output metadata
    host: Arc<str>,
    /// Session configuration
    config: SessionConfig,
    transport: Arc<dyn Transport>,
    /// Present only while connected
    connection: Option<Box<dyn Connection>>,
    /// Created on the first command
    buffer: Option<OutputBuffer>,
    /// At most one registered handler
    output: Option<Correlated<HandlerFn>>,
}

impl Session {
    /// Create a new SSH session builder
    pub fn ssh(target: &str) -> SessionBuilder {
        debug!("Creating SSH session builder for target: {}", target);
        SessionBuilder::new(target)
    }

    /// Create a session using the libssh2 transport
    #[cfg(feature = "ssh2")]
    pub fn new(name: impl Into<String>, config: SessionConfig) -> Self {
        Self::with_transport(name, config, Arc::new(remex_ssh::Ssh2Transport::new()))
    }

    /// Create a session on top of `transport`
    pub fn with_transport(name: impl Into<String>, config: SessionConfig, transport: Arc<dyn Transport>) -> Self {
        Self {
            name: Arc::from(name.into()),
            host: Arc::from(config.ssh.host.as_str()),
            config,
            transport,
            connection: None,
            buffer: None,
            output: None,
        }
    }

    /// Session name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Session configuration
    pub fn config(&self) -> &SessionConfig {
        &self.config
    }

    /// Information about the open connection
    pub fn connection_info(&self) -> Option<ConnectionInfo> {
        self.connection.as_ref().filter(|c| !c.is_closed()).map(|c| c.info())
    }

    /// Whether a connection exists and has not been closed
    pub fn is_open(&self) -> bool {
        self.connection.as_ref().map_or(false, |c| !c.is_closed())
    }

    /// Connect to the remote host.
    ///
    /// Any previous connection is closed first. Failures are not retried.
    pub async fn connect(&mut self, silent: bool) -> Result<()> {
        if let Some(mut previous) = self.connection.take() {
            if !previous.is_closed() {
                if let Err(e) = previous.close().await {
                    warn!(session = %self.name, "Failed to close previous connection: {}", e);
                }
            }
        }

        let ssh = &self.config.ssh;
        if silent {
            debug!(session = %self.name, "Connecting to {}@{}:{}", ssh.username, ssh.host, ssh.port);
        } else {
            info!(session = %self.name, "Connecting to {}@{}:{}", ssh.username, ssh.host, ssh.port);
        }

        let connection = self.transport.connect(ssh).await.map_err(|e| match e {
            TransportError::Configuration(msg) => RemexError::Config(msg),
            other => {
                error!(session = %self.name, "Connection to {} failed: {}", ssh.host, other);
                RemexError::Connection(other.to_string())
            }
        })?;

        self.connection = Some(connection);
        Ok(())
    }

    /// Close the connection and deliver any output still buffered.
    ///
    /// Closing a session that is not connected is a no-op.
    pub async fn close(&mut self) -> Result<()> {
        let mut result = Ok(());
        if let Some(mut connection) = self.connection.take() {
            if !connection.is_closed() {
                debug!(session = %self.name, "Closing connection to {}", connection.info());
                result = connection.close().await.map_err(RemexError::from);
            }
        }

        if let Some(buffer) = self.buffer.take() {
            let mut sink = HandlerSink {
                handler: self.output.as_mut(),
                session: &self.name,
                host: &self.host,
            };
            buffer.stop(&mut sink);
        }

        result
    }

    /// Register the output handler, replacing any previous one.
    ///
    /// The correlation identifier and tracing span active now are restored
    /// around every call to `handler`.
    pub fn on_output<F>(&mut self, handler: F)
    where
        F: FnMut(OutputChunk) + Send + 'static,
    {
        if self.output.is_some() {
            debug!(session = %self.name, "Replacing output handler");
            self.deliver_leftover();
        }
        self.output = Some(Correlated::capture(Box::new(handler) as HandlerFn));
    }

    /// Run `command` and return its exit status.
    ///
    /// Connects first when the session is not open. A refused start is an
    /// [`RemexError::ExecStart`]; a command that runs and fails is a non-zero
    /// [`ExitStatus`].
    pub async fn exec(&mut self, command: &str) -> Result<ExitStatus> {
        self.run::<HandlerFn>(command, None).await
    }

    /// Run `command`, sending its output to `handler` instead of the registered handler
    pub async fn exec_with<F>(&mut self, command: &str, handler: F) -> Result<ExitStatus>
    where
        F: FnMut(OutputChunk) + Send,
    {
        let mut inline = Correlated::capture(handler);
        self.run(command, Some(&mut inline)).await
    }

    /// Run `command`, closing the session if it has not finished within `duration`
    pub async fn exec_timeout(&mut self, command: &str, duration: Duration) -> Result<ExitStatus> {
        let outcome = tokio::time::timeout(duration, self.exec(command)).await;
        match outcome {
            Ok(result) => result,
            Err(_) => {
                warn!(session = %self.name, "Command exceeded {:?}, closing session", duration);
                if let Err(e) = self.close().await {
                    warn!(session = %self.name, "Failed to close session after timeout: {}", e);
                }
                Err(RemexError::Timeout { duration })
            }
        }
    }

    /// Append `content` to the file at `path` on the remote host
    pub async fn upload_file(&mut self, path: &str, content: impl AsRef<[u8]>) -> Result<ExitStatus> {
        let content = content.as_ref();
        debug!(session = %self.name, "Uploading {} bytes to {}", content.len(), path);
        self.exec(&command::upload(path, content)).await
    }

    async fn run<H>(&mut self, command: &str, inline: Option<&mut Correlated<H>>) -> Result<ExitStatus>
    where
        H: FnMut(OutputChunk) + Send,
    {
        self.deliver_leftover();
        let mut channel = self.start(command).await?;

        let Self { name, host, config, buffer, output, .. } = self;
        let wait = config.poll_interval();

        let status = match inline {
            Some(handler) => {
                // Per-call buffer: output of a cancelled run is dropped with it
                let mut own = OutputBuffer::new(config.buffer_interval());
                let mut sink = HandlerSink { handler: Some(handler), session: name, host };
                drive(channel.as_mut(), &mut own, wait, &mut sink, name).await
            }
            None => {
                let buffer = buffer.get_or_insert_with(|| OutputBuffer::new(config.buffer_interval()));
                let mut sink = HandlerSink { handler: output.as_mut(), session: name, host };
                drive(channel.as_mut(), buffer, wait, &mut sink, name).await
            }
        };

        debug!(session = %self.name, "`{}` finished with {}", command, status);
        Ok(status)
    }

    /// Hand output left behind by a cancelled `exec` to the registered handler
    fn deliver_leftover(&mut self) {
        let Some(buffer) = self.buffer.as_mut() else { return };
        let mut sink = HandlerSink {
            handler: self.output.as_mut(),
            session: &self.name,
            host: &self.host,
        };
        if buffer.flush(&mut sink) {
            debug!(session = %self.name, "Delivered output left by an interrupted command");
        }
    }

    /// Connect if needed, open a channel and start `command` on it
    async fn start(&mut self, command: &str) -> Result<Box<dyn ExecChannel>> {
        if !self.is_open() {
            self.connect(false).await?;
        }

        let connection = self.connection.as_mut()
            .ok_or_else(|| RemexError::Transport("Session is not connected".to_string()))?;
        let mut channel = connection.open_channel().await
            .map_err(|e| RemexError::Transport(format!("Failed to open channel: {}", e)))?;

        let command_line = command::login_shell(&self.config.login_shell, command);
        debug!(session = %self.name, command = %command_line, "Starting remote command");

        if let Err(e) = channel.exec(&command_line).await {
            error!(session = %self.name, "Remote refused to start `{}`: {}", command, e);
            return Err(RemexError::ExecStart {
                command: command.to_string(),
                reason: e.to_string(),
            });
        }

        Ok(channel)
    }
}

/// Pump channel events into the buffer until the channel completes
async fn drive<S>(
    channel: &mut dyn ExecChannel,
    buffer: &mut OutputBuffer,
    wait: Duration,
    sink: &mut S,
    session: &str,
) -> ExitStatus
where
    S: OutputSink,
{
    let mut status = ExitStatus::indeterminate();

    loop {
        tokio::select! {
            event = channel.process(wait) => match event {
                Ok(None) => {}
                Ok(Some(ChannelEvent::Data(data))) => buffer.append(data, sink),
                Ok(Some(ChannelEvent::ExitStatus(code))) => {
                    trace!(session, "Remote exit status {}", code);
                    status = ExitStatus::exited(code);
                }
                Ok(Some(ChannelEvent::ExitSignal(signal))) => {
                    warn!(session, "Remote process terminated by signal {}", signal);
                }
                Ok(Some(ChannelEvent::Eof)) => trace!(session, "Remote output complete"),
                Ok(Some(ChannelEvent::Closed)) => break,
                Err(e) => {
                    warn!(session, "Channel failed: {}", e);
                    break;
                }
            },
            _ = buffer.tick() => {
                buffer.flush(sink);
            }
        }
    }

    buffer.flush(sink);
    status
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(buffer) = self.buffer.take() {
            let mut sink = HandlerSink {
                handler: self.output.as_mut(),
                session: &self.name,
                host: &self.host,
            };
            buffer.stop(&mut sink);
        }
    }
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("transport", &self.transport.transport_type())
            .field("open", &self.is_open())
            .field("has_output_handler", &self.output.is_some())
            .finish()
    }
}
