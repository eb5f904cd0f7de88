//! Client-side session manager.
//!
//! Owned explicitly by the application root; there is no hidden global. One
//! command may be outstanding at a time, and completion is a single awaited
//! frame rather than a polled flag. Progress frames stream to an observer as
//! they arrive.

pub mod launcher;

use std::io::{self, Write};
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::error::HelperError;
use crate::protocol::command::Command;
use crate::protocol::wire::{self, FrameReader};
use crate::protocol::{Frame, ProgressKind, FAILURE, HELLO, READY, SUCCESS};
use crate::transport::{self, LocalStream};
use launcher::HelperProcess;

const READ_POLL: Duration = Duration::from_millis(100);

/// Tunables for a session. The defaults match the production client.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Endpoint to connect to. `SessionManager::start` replaces this with a
    /// freshly generated per-launch name; the default only serves `attach`.
    pub socket_name: String,
    /// Bound on every command, WRITE included.
    pub operation_timeout: Duration,
    /// Bound on the transitional handshake states.
    pub handshake_timeout: Duration,
    pub connect_attempts: u32,
    pub connect_interval: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            socket_name: crate::protocol::DEFAULT_SOCKET_NAME.to_string(),
            operation_timeout: Duration::from_secs(300),
            handshake_timeout: Duration::from_secs(10),
            connect_attempts: 50,
            connect_interval: Duration::from_millis(100),
        }
    }
}

/// Client connection states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    HandshakeReceiving,
    HandshakeSending,
    Connected,
    Error,
}

/// Receives progress frames while a command is outstanding.
pub trait ProgressObserver {
    fn on_progress(&mut self, kind: ProgressKind, now: i64, total: i64);
}

/// Observer that ignores everything.
pub struct NullObserver;

impl ProgressObserver for NullObserver {
    fn on_progress(&mut self, _kind: ProgressKind, _now: i64, _total: i64) {}
}

/// Terminal status of an accepted command. A FAILURE completion is a normal
/// answer; the session stays usable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Success,
    Failure,
}

/// A handshake-completed conversation with the helper.
pub struct Session {
    stream: LocalStream,
    reader: FrameReader,
    config: SessionConfig,
    state: SessionState,
}

impl Session {
    /// Connect and complete the handshake. `process` is polled between
    /// connect retries so a helper that died is reported as such instead of
    /// as a timeout.
    pub fn connect(
        config: SessionConfig,
        mut process: Option<&mut HelperProcess>,
    ) -> Result<Self, HelperError> {
        debug!("state {:?}", SessionState::Connecting);
        let mut stream = None;
        for _attempt in 0..config.connect_attempts {
            if let Some(p) = process.as_deref_mut() {
                if let Some(code) = p.exit_code() {
                    return Err(HelperError::HelperExited(code));
                }
            }
            match transport::connect(&config.socket_name) {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!("connect attempt failed: {e}");
                    std::thread::sleep(config.connect_interval);
                }
            }
        }
        let stream = stream.ok_or(HelperError::ConnectTimeout)?;

        let mut session = Session {
            stream,
            reader: FrameReader::new(),
            config,
            state: SessionState::HandshakeReceiving,
        };
        debug!("state {:?}", session.state);

        let deadline = Instant::now() + session.config.handshake_timeout;
        match session.read_frame(deadline) {
            Ok(Frame::Text(token)) if token == HELLO => {}
            Ok(frame) => {
                session.state = SessionState::Error;
                return Err(HelperError::HandshakeFailed(format!(
                    "expected {HELLO}, got {frame:?}"
                )));
            }
            Err(HelperError::OperationTimeout) => {
                session.state = SessionState::Error;
                return Err(HelperError::HandshakeFailed(
                    "timed out waiting for the greeting".to_string(),
                ));
            }
            Err(e) => {
                session.state = SessionState::Error;
                return Err(e);
            }
        }

        session.state = SessionState::HandshakeSending;
        debug!("state {:?}", session.state);
        wire::write_text(&mut session.stream, READY)?;
        session.stream.flush()?;

        // The transition to Connected is atomic: no observable intermediate
        session.state = SessionState::Connected;
        info!("session established on {}", session.config.socket_name);
        Ok(session)
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Send one command and block until its completion frame. Progress
    /// frames arriving in between go to `observer`.
    pub fn execute(
        &mut self,
        command: &Command,
        observer: &mut dyn ProgressObserver,
    ) -> Result<Completion, HelperError> {
        match self.state {
            SessionState::Connected => {}
            SessionState::Error | SessionState::Disconnected => {
                return Err(HelperError::NotConnected)
            }
            _ => return Err(HelperError::Busy),
        }

        wire::write_text(&mut self.stream, &command.render())?;
        self.stream.flush()?;

        let deadline = Instant::now() + self.config.operation_timeout;
        loop {
            match self.read_frame(deadline)? {
                Frame::Progress { kind, now, total } => observer.on_progress(kind, now, total),
                Frame::Text(status) if status == SUCCESS => return Ok(Completion::Success),
                Frame::Text(status) if status == FAILURE => return Ok(Completion::Failure),
                Frame::Text(other) => {
                    self.state = SessionState::Error;
                    self.stream.shutdown();
                    return Err(HelperError::ProtocolViolation(format!(
                        "unexpected token {other:?} while awaiting completion"
                    )));
                }
            }
        }
    }

    /// Ask the helper to exit. Consumes the session; the socket is closed
    /// regardless of the answer.
    pub fn shutdown(mut self) -> Result<(), HelperError> {
        let result = self.execute(&Command::Shutdown, &mut NullObserver);
        self.stream.shutdown();
        match result {
            Ok(Completion::Success) => Ok(()),
            Ok(Completion::Failure) => Err(HelperError::CommandFailed),
            Err(e) => Err(e),
        }
    }

    fn read_frame(&mut self, deadline: Instant) -> Result<Frame, HelperError> {
        loop {
            match self.reader.next_frame() {
                Ok(Some(frame)) => return Ok(frame),
                Ok(None) => {}
                Err(e) => {
                    self.state = SessionState::Error;
                    self.stream.shutdown();
                    return Err(HelperError::ProtocolViolation(e.to_string()));
                }
            }

            if Instant::now() >= deadline {
                self.state = SessionState::Error;
                return Err(HelperError::OperationTimeout);
            }

            self.stream.set_read_timeout(Some(READ_POLL))?;
            match self.reader.fill_from(&mut self.stream) {
                Ok(0) => {
                    self.state = SessionState::Error;
                    return Err(HelperError::PeerDisconnected);
                }
                Ok(_) => {}
                Err(e)
                    if e.kind() == io::ErrorKind::WouldBlock
                        || e.kind() == io::ErrorKind::TimedOut => {}
                Err(e) => {
                    self.state = SessionState::Error;
                    return Err(e.into());
                }
            }
        }
    }
}

/// Application-root owner of the single client session.
///
/// Launches the helper elevated, connects, and funnels every operation
/// through one place so a second concurrent operation is refused with a
/// `Busy` error instead of a second launch.
pub struct SessionManager {
    config: SessionConfig,
    session: Option<Session>,
    process: Option<HelperProcess>,
    connecting: bool,
}

impl SessionManager {
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            session: None,
            process: None,
            connecting: false,
        }
    }

    /// Launch the helper (elevated on Windows) and establish the session.
    pub fn start(&mut self) -> Result<(), HelperError> {
        if self.connecting {
            return Err(HelperError::Busy);
        }
        if self.session.is_some() {
            return Ok(());
        }

        // A fresh endpoint per launch, so a stale helper from an earlier run
        // can never hijack this session
        self.config.socket_name = launcher::generate_socket_name();

        self.connecting = true;
        let result = (|| {
            let mut process = launcher::launch_elevated(&self.config.socket_name)?;
            let session = Session::connect(self.config.clone(), Some(&mut process))?;
            self.process = Some(process);
            self.session = Some(session);
            Ok(())
        })();
        self.connecting = false;

        if result.is_err() {
            // A helper we launched is ours to reap
            if let Some(mut process) = self.process.take() {
                process.terminate();
            }
        }
        result
    }

    /// Attach to an already-listening helper (tests and development).
    pub fn attach(&mut self) -> Result<(), HelperError> {
        if self.connecting {
            return Err(HelperError::Busy);
        }
        if self.session.is_some() {
            return Ok(());
        }
        self.connecting = true;
        let result = Session::connect(self.config.clone(), None);
        self.connecting = false;
        self.session = Some(result?);
        Ok(())
    }

    /// Run one command to completion.
    pub fn execute(
        &mut self,
        command: &Command,
        observer: &mut dyn ProgressObserver,
    ) -> Result<Completion, HelperError> {
        if self.connecting {
            return Err(HelperError::Busy);
        }
        let session = self.session.as_mut().ok_or(HelperError::NotConnected)?;
        match session.execute(command, observer) {
            Ok(completion) => Ok(completion),
            Err(e) => {
                // Deadline expiry and hard protocol errors end the session
                // and the helper with it
                warn!("session error: {e}");
                self.teardown();
                Err(e)
            }
        }
    }

    /// Clean shutdown: SHUTDOWN command, then make sure the process is gone.
    pub fn shutdown(&mut self) {
        if let Some(session) = self.session.take() {
            if let Err(e) = session.shutdown() {
                warn!("helper shutdown was not clean: {e}");
            }
        }
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }

    fn teardown(&mut self) {
        if let Some(session) = self.session.take() {
            session.stream.shutdown();
        }
        if let Some(mut process) = self.process.take() {
            process.terminate();
        }
    }
}

impl Drop for SessionManager {
    fn drop(&mut self) {
        self.teardown();
    }
}
