//! Scripted in-memory transport
//!
//! Every `exec` consumes the next queued script. A script is a list of
//! [`Step`]s replayed by the channel's `process` call, so tests control the
//! exact arrival order and timing of output.

use async_trait::async_trait;
use bytes::Bytes;
use crate::{
    ChannelEvent, Connection, ConnectionInfo, ExecChannel, SshConfig, Transport, TransportError,
    TransportType,
};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// One scripted step of a running command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// Deliver an event
    Event(ChannelEvent),
    /// Report nothing for this long
    Pause(Duration),
}

impl Step {
    /// Output data step
    pub fn data(text: &str) -> Self {
        Step::Event(ChannelEvent::Data(Bytes::copy_from_slice(text.as_bytes())))
    }
}

#[derive(Debug, Default)]
struct MockState {
    refuse_connect: Option<String>,
    refuse_exec: Option<String>,
    scripts: VecDeque<Vec<Step>>,
    commands: Vec<String>,
    connects: usize,
    closes: usize,
    connections: Vec<Arc<AtomicBool>>,
}

/// Transport replaying scripted command runs
#[derive(Debug, Clone, Default)]
pub struct MockTransport {
    state: Arc<Mutex<MockState>>,
}

impl MockTransport {
    /// Create a transport with no scripts queued
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Queue the steps replayed by the next `exec`
    pub fn script(&self, steps: impl IntoIterator<Item = Step>) -> &Self {
        self.state().scripts.push_back(steps.into_iter().collect());
        self
    }

    /// Queue a command that prints `chunks` and exits with `status`
    pub fn respond(&self, chunks: &[&str], status: i32) -> &Self {
        let mut steps: Vec<Step> = chunks.iter().map(|chunk| Step::data(chunk)).collect();
        steps.push(Step::Event(ChannelEvent::Eof));
        steps.push(Step::Event(ChannelEvent::ExitStatus(status)));
        steps.push(Step::Event(ChannelEvent::Closed));
        self.script(steps)
    }

    /// Make every following `connect` fail
    pub fn refuse_connections(&self, reason: &str) -> &Self {
        self.state().refuse_connect = Some(reason.to_string());
        self
    }

    /// Make every following `exec` request fail
    pub fn refuse_exec(&self, reason: &str) -> &Self {
        self.state().refuse_exec = Some(reason.to_string());
        self
    }

    /// Mark every open connection as closed by the remote side
    pub fn drop_connections(&self) {
        for closed in self.state().connections.drain(..) {
            closed.store(true, Ordering::Release);
        }
    }

    /// Command lines received so far, in order
    pub fn commands(&self) -> Vec<String> {
        self.state().commands.clone()
    }

    /// Number of successful connects
    pub fn connect_count(&self) -> usize {
        self.state().connects
    }

    /// Number of connections closed by the client
    pub fn close_count(&self) -> usize {
        self.state().closes
    }
}

#[async_trait]
impl Transport for MockTransport {
    async fn connect(&self, config: &SshConfig) -> Result<Box<dyn Connection>, TransportError> {
        config.validate()?;

        let mut state = self.state();
        if let Some(reason) = &state.refuse_connect {
            return Err(TransportError::Connection(reason.clone()));
        }

        let closed = Arc::new(AtomicBool::new(false));
        state.connects += 1;
        state.connections.push(Arc::clone(&closed));

        Ok(Box::new(MockConnection {
            state: Arc::clone(&self.state),
            closed,
            info: ConnectionInfo::from_config(config, TransportType::Mock),
        }))
    }

    fn transport_type(&self) -> TransportType {
        TransportType::Mock
    }
}

struct MockConnection {
    state: Arc<Mutex<MockState>>,
    closed: Arc<AtomicBool>,
    info: ConnectionInfo,
}

#[async_trait]
impl Connection for MockConnection {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn open_channel(&mut self) -> Result<Box<dyn ExecChannel>, TransportError> {
        if self.is_closed() {
            return Err(TransportError::Closed);
        }
        Ok(Box::new(MockChannel {
            state: Arc::clone(&self.state),
            closed: Arc::clone(&self.closed),
            steps: VecDeque::new(),
            started: false,
        }))
    }

    async fn close(&mut self) -> Result<(), TransportError> {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.state.lock().unwrap_or_else(|e| e.into_inner()).closes += 1;
        }
        Ok(())
    }

    fn info(&self) -> ConnectionInfo {
        self.info.clone()
    }
}

struct MockChannel {
    state: Arc<Mutex<MockState>>,
    closed: Arc<AtomicBool>,
    steps: VecDeque<Step>,
    started: bool,
}

#[async_trait]
impl ExecChannel for MockChannel {
    async fn exec(&mut self, command: &str) -> Result<(), TransportError> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        state.commands.push(command.to_string());
        if let Some(reason) = &state.refuse_exec {
            return Err(TransportError::ExecRefused(reason.clone()));
        }

        self.steps = state.scripts.pop_front().map(VecDeque::from).unwrap_or_else(|| {
            VecDeque::from(vec![
                Step::Event(ChannelEvent::Eof),
                Step::Event(ChannelEvent::ExitStatus(0)),
                Step::Event(ChannelEvent::Closed),
            ])
        });
        self.started = true;
        Ok(())
    }

    async fn process(&mut self, wait: Duration) -> Result<Option<ChannelEvent>, TransportError> {
        if !self.started {
            return Err(TransportError::Channel("No command is running on this channel".to_string()));
        }
        if self.closed.load(Ordering::Acquire) {
            return Ok(Some(ChannelEvent::Closed));
        }

        match self.steps.front_mut() {
            None => Ok(Some(ChannelEvent::Closed)),
            Some(Step::Pause(remaining)) => {
                let slice = (*remaining).min(wait);
                tokio::time::sleep(slice).await;
                *remaining -= slice;
                if remaining.is_zero() {
                    self.steps.pop_front();
                }
                Ok(None)
            }
            Some(Step::Event(_)) => match self.steps.pop_front() {
                Some(Step::Event(event)) => Ok(Some(event)),
                _ => Ok(None),
            },
        }
    }
}
