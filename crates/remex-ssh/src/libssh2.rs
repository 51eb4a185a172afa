//! SSH transport backed by libssh2
//!
//! libssh2 is blocking, so connection setup and channel requests run on the
//! tokio blocking pool and command output is read by a dedicated worker that
//! hands events to the async side over an mpsc channel.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    ChannelEvent, Connection, ConnectionInfo, ExecChannel, SshConfig, Transport, TransportError,
    TransportType,
};
use ssh2::{ErrorCode, ExtendedData};
use std::io::{self, Read};
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::{self, JoinError};
use tracing::{debug, trace, warn};

/// libssh2 session error code for an elapsed blocking timeout
const LIBSSH2_ERROR_TIMEOUT: i32 = -9;

/// Blocking read timeout of the output worker, in milliseconds
const READ_POLL_MS: u32 = 200;

/// Size of a single channel read
const READ_CHUNK: usize = 32 * 1024;

/// Events buffered between the output worker and the session
const EVENT_QUEUE: usize = 256;

/// Transport that opens SSH connections through libssh2
#[derive(Debug, Default, Clone, Copy)]
pub struct Ssh2Transport;

impl Ssh2Transport {
    /// Create a new libssh2 transport
    pub fn new() -> Self {
        Self
    }

    /// Connect, handshake and authenticate. Blocking.
    fn establish(config: &SshConfig) -> Result<ssh2::Session, TransportError> {
        config.validate()?;

        let addr = (config.host.as_str(), config.port)
            .to_socket_addrs()
            .map_err(|e| TransportError::Connection(format!("Failed to resolve {}: {}", config.host, e)))?
            .next()
            .ok_or_else(|| TransportError::Connection(format!("No address found for {}", config.host)))?;

        let tcp = TcpStream::connect_timeout(&addr, config.connect_timeout())
            .map_err(|e| connect_error(addr, e))?;

        let mut session = ssh2::Session::new()
            .map_err(|e| TransportError::Connection(format!("Failed to create SSH session: {}", e)))?;
        session.set_tcp_stream(tcp);
        session.set_timeout(timeout_ms(config.connect_timeout()));
        session.handshake()
            .map_err(|e| TransportError::Connection(format!("SSH handshake failed: {}", e)))?;

        // Host keys are not checked: the configured host is trusted explicitly.
        debug!("Handshake with {} complete, skipping host key verification", addr);

        Self::authenticate(&session, config)?;
        Ok(session)
    }

    /// Try every configured credential; fall back to the agent when none is configured.
    fn authenticate(session: &ssh2::Session, config: &SshConfig) -> Result<(), TransportError> {
        let mut attempted = false;

        if let Some(password) = &config.password {
            attempted = true;
            if let Err(e) = session.userauth_password(&config.username, password) {
                debug!("Password authentication for {} rejected: {}", config.username, e);
            }
        }

        if !session.authenticated() {
            if let Some(key_path) = &config.key_path {
                attempted = true;
                if let Err(e) = session.userauth_pubkey_file(&config.username, None, key_path, None) {
                    debug!("Key authentication for {} with {:?} rejected: {}", config.username, key_path, e);
                }
            }
        }

        if !attempted {
            session.userauth_agent(&config.username)
                .map_err(|e| TransportError::Authentication(format!("Agent authentication failed: {}", e)))?;
        }

        if session.authenticated() {
            Ok(())
        } else {
            Err(TransportError::Authentication(format!(
                "No configured credential accepted for {}@{}",
                config.username, config.host
            )))
        }
    }
}

#[async_trait]
impl Transport for Ssh2Transport {
    async fn connect(&self, config: &SshConfig) -> Result<Box<dyn Connection>, TransportError> {
        let owned = config.clone();
        let session = task::spawn_blocking(move || Self::establish(&owned))
            .await
            .map_err(join_error)??;

        Ok(Box::new(Ssh2Connection {
            session,
            closed: Arc::new(AtomicBool::new(false)),
            info: ConnectionInfo::from_config(config, TransportType::SshLibssh2),
            setup_timeout_ms: timeout_ms(config.connect_timeout()),
        }))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::SshLibssh2
    }
}

/// Authenticated libssh2 session
pub struct Ssh2Connection {
    session: ssh2::Session,
    /// Set by `close` or by a worker that lost the socket
    closed: Arc<AtomicBool>,
    info: ConnectionInfo,
    setup_timeout_ms: u32,
}

#[async_trait]
impl Connection for Ssh2Connection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }

        let session = self.session.clone();
        let timeout = self.setup_timeout_ms;
        let channel = task::spawn_blocking(move || {
            session.set_timeout(timeout);
            session.channel_session()
        })
        .await
        .map_err(join_error)?
        .map_err(|e| TransportError::Channel(format!("Failed to open session channel: {}", e)))?;

        debug!("Opened channel to {}", self.info);

        Ok(Box::new(Ssh2Channel {
            session: self.session.clone(),
            channel: Some(channel),
            events: None,
            closed: Arc::clone(&self.closed),
            setup_timeout_ms: self.setup_timeout_ms,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if self.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        debug!("Disconnecting from {}", self.info);
        let session = self.session.clone();
        task::spawn_blocking(move || session.disconnect(None, "session closed", None))
            .await
            .map_err(join_error)?
            .map_err(|e| TransportError::Connection(format!("Disconnect failed: {}", e)))
    }

    fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

impl Drop for Ssh2Connection {
    fn drop(&mut self) {
        // Lets a still-running output worker stop at its next read timeout.
        self.closed.store(true, Ordering::Release);
    }
}

/// Command channel on a libssh2 session
pub struct Ssh2Channel {
    session: ssh2::Session,
    /// Present until `exec` hands it to the output worker
    channel: Option<ssh2::Channel>,
    events: Option<mpsc::Receiver<ChannelEvent>>,
    closed: Arc<AtomicBool>,
    setup_timeout_ms: u32,
}

#[async_trait]
impl ExecChannel for Ssh2Channel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        let mut channel = self.channel.take()
            .ok_or_else(|| TransportError::Channel("A command was already started on this channel".to_string()))?;

        let session = self.session.clone();
        let timeout = self.setup_timeout_ms;
        let command_line = command.to_string();
        let channel = task::spawn_blocking(move || -> Result<ssh2::Channel, TransportError> {
            session.set_timeout(timeout);
            channel.handle_extended_data(ExtendedData::Merge)
                .map_err(|e| TransportError::Channel(format!("Failed to merge stderr: {}", e)))?;
            channel.exec(&command_line)
                .map_err(|e| TransportError::ExecRefused(e.to_string()))?;
            Ok(channel)
        })
        .await
        .map_err(join_error)??;

        let (tx, rx) = mpsc::channel(EVENT_QUEUE);
        let worker = OutputWorker {
            session: self.session.clone(),
            channel,
            tx,
            closed: Arc::clone(&self.closed),
        };
        task::spawn_blocking(move || worker.run());

        self.events = Some(rx);
        Ok(())
    }

    async fn process(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, TransportError> {
        let events = self.events.as_mut()
            .ok_or_else(|| TransportError::Channel("No command is running on this channel".to_string()))?;

        match tokio::time::timeout(wait, events.recv()).await {
            Ok(Some(event)) => Ok(Some(event)),
            // Worker finished and dropped its sender
            Ok(None) => Ok(Some(ChannelEvent::Closed)),
            Err(_) => Ok(None),
        }
    }
}

/// Blocking reader that forwards channel output and the exit report
struct OutputWorker {
    session: ssh2::Session,
    channel: ssh2::Channel,
    tx: mpsc::Sender<ChannelEvent>,
    closed: Arc<AtomicBool>,
}

impl OutputWorker {
    fn run(mut self) {
        self.session.set_timeout(READ_POLL_MS);

        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            match self.channel.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => {
                    trace!("Channel read {} bytes", n);
                    let chunk = Bytes::copy_from_slice(&buf[..n]);
                    if self.tx.blocking_send(ChannelEvent::Data(chunk)).is_err() {
                        debug!("Channel receiver dropped, stopping output worker");
                        return;
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::TimedOut => {
                    if self.should_stop() {
                        self.finish(None);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Channel read failed: {}", e);
                    self.closed.store(true, Ordering::Release);
                    self.finish(None);
                    return;
                }
            }
        }

        let _ = self.tx.blocking_send(ChannelEvent::Eof);

        loop {
            match self.channel.wait_close() {
                Ok(()) => break,
                Err(e) if matches!(e.code(), ErrorCode::Session(LIBSSH2_ERROR_TIMEOUT)) => {
                    if self.should_stop() {
                        self.finish(None);
                        return;
                    }
                }
                Err(e) => {
                    warn!("Waiting for channel close failed: {}", e);
                    self.finish(None);
                    return;
                }
            }
        }

        let report = match self.channel.exit_signal() {
            Ok(ssh2::ExitSignal { exit_signal: Some(signal), .. }) => Some(ChannelEvent::ExitSignal(signal)),
            _ => match self.channel.exit_status() {
                Ok(code) => Some(ChannelEvent::ExitStatus(code)),
                Err(e) => {
                    warn!("Failed to read exit status: {}", e);
                    None
                }
            },
        };
        self.finish(report);
    }

    fn should_stop(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.tx.is_closed()
    }

    fn finish(&self, report: Option<ChannelEvent>) {
        if let Some(event) = report {
            let _ = self.tx.blocking_send(event);
        }
        let _ = self.tx.blocking_send(ChannelEvent::Closed);
    }
}

fn connect_error(addr: SocketAddr, e: io::Error) -> TransportError {
    match e.kind() {
        io::ErrorKind::TimedOut | io::ErrorKind::WouldBlock => TransportError::Timeout(addr.to_string()),
        _ => TransportError::Connection(format!("Failed to connect to {}: {}", addr, e)),
    }
}

fn timeout_ms(duration: Duration) -> u32 {
    u32::try_from(duration.as_millis()).unwrap_or(u32::MAX)
}

fn join_error(e: JoinError) -> TransportError {
    TransportError::Connection(format!("Blocking SSH task failed: {}", e))
}
