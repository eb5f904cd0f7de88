//! Helper-side session server.
//!
//! One connection at a time: accept, handshake, then a Ready/Processing
//! loop that answers every accepted command with exactly one completion
//! frame. Frames from different commands never interleave because the
//! engines run to completion inside the loop.

pub mod dispatch;

use std::io::{self, Write};
use std::time::Duration;

use log::{debug, info, warn};

use crate::error::HelperError;
use crate::progress::{ProgressPacer, ProgressSink};
use crate::protocol::command::Command;
use crate::protocol::wire::{self, FrameReader};
use crate::protocol::{Frame, ProgressKind, FAILURE, HELLO, READY, SUCCESS};
use crate::transport::{LocalListener, LocalStream};
use crate::writer::diskpart::DiskManagement;
use dispatch::{Disposition, EngineContext};

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);
const READY_POLL: Duration = Duration::from_millis(100);

/// Server configuration.
pub struct HelperConfig {
    pub socket_name: String,
    pub daemon: bool,
}

/// Why the server stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServeOutcome {
    /// Clean SHUTDOWN acknowledged, or one-shot client served.
    Shutdown,
    /// The client vanished while a command was running; the operation was
    /// aborted and the process must not keep serving.
    PeerLostMidCommand,
}

/// Connection states, in the order a healthy session moves through them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ServerState {
    Idle,
    Connected,
    HandshakeSending,
    HandshakeReceiving,
    Ready,
    Processing,
    Error,
}

enum ClientEnd {
    Shutdown,
    Disconnected,
    Replaced(LocalStream),
    PeerLostMidCommand,
}

/// Serve the endpoint until shutdown.
pub fn run(config: &HelperConfig, disk: &dyn DiskManagement) -> Result<ServeOutcome, HelperError> {
    let listener = LocalListener::bind(&config.socket_name)?;
    info!("helper listening on {}", config.socket_name);

    let mut server = Server {
        disk,
        source_hash: None,
        total_bytes: 0,
    };

    let mut pending: Option<LocalStream> = None;
    loop {
        let stream = match pending.take() {
            Some(stream) => stream,
            None => {
                debug!("state {:?}: waiting for a client", ServerState::Idle);
                listener.accept()?
            }
        };

        match server.serve_client(&listener, stream)? {
            ClientEnd::Shutdown => return Ok(ServeOutcome::Shutdown),
            ClientEnd::PeerLostMidCommand => return Ok(ServeOutcome::PeerLostMidCommand),
            ClientEnd::Replaced(next) => {
                info!("a new client connected, dropping the old one");
                pending = Some(next);
            }
            ClientEnd::Disconnected => {
                if !config.daemon {
                    return Ok(ServeOutcome::Shutdown);
                }
            }
        }
    }
}

struct Server<'a> {
    disk: &'a dyn DiskManagement,
    source_hash: Option<[u8; 32]>,
    total_bytes: u64,
}

impl Server<'_> {
    fn serve_client(
        &mut self,
        listener: &LocalListener,
        mut stream: LocalStream,
    ) -> Result<ClientEnd, HelperError> {
        let mut state = ServerState::Connected;
        debug!("state {state:?}");

        // Handshake
        state = ServerState::HandshakeSending;
        debug!("state {state:?}");
        if let Err(e) = wire::write_text(&mut stream, HELLO).and_then(|()| stream.flush()) {
            warn!("handshake send failed: {e}");
            return Ok(ClientEnd::Disconnected);
        }

        state = ServerState::HandshakeReceiving;
        debug!("state {state:?}");
        let mut reader = FrameReader::new();
        match read_text_with_timeout(&mut stream, &mut reader, HANDSHAKE_TIMEOUT) {
            Ok(Some(token)) if token == READY => {}
            Ok(Some(other)) => {
                warn!("expected {READY}, got {other:?}; dropping client");
                stream.shutdown();
                return Ok(ClientEnd::Disconnected);
            }
            Ok(None) | Err(_) => {
                warn!("handshake did not complete, dropping client");
                stream.shutdown();
                return Ok(ClientEnd::Disconnected);
            }
        }

        state = ServerState::Ready;
        debug!("state {state:?}");

        // Command loop
        stream.set_read_timeout(Some(READY_POLL))?;
        loop {
            // A newer connection wins the endpoint while we sit in Ready
            if let Some(next) = listener.try_accept()? {
                stream.shutdown();
                return Ok(ClientEnd::Replaced(next));
            }

            let frame = match reader.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => match reader.fill_from(&mut stream) {
                    Ok(0) => {
                        debug!("client disconnected while Ready");
                        return Ok(ClientEnd::Disconnected);
                    }
                    Ok(_) => continue,
                    Err(e)
                        if e.kind() == io::ErrorKind::WouldBlock
                            || e.kind() == io::ErrorKind::TimedOut =>
                    {
                        continue
                    }
                    Err(e) => {
                        warn!("socket error while Ready: {e}");
                        return Ok(ClientEnd::Disconnected);
                    }
                },
                Err(e) => {
                    state = ServerState::Error;
                    warn!("state {state:?}: unparseable frame: {e}");
                    stream.shutdown();
                    return Ok(ClientEnd::Disconnected);
                }
            };

            let Frame::Text(line) = frame else {
                state = ServerState::Error;
                warn!("state {state:?}: unexpected progress frame from client");
                stream.shutdown();
                return Ok(ClientEnd::Disconnected);
            };

            state = ServerState::Processing;
            debug!("state {state:?}: {line}");
            match self.process(&line, &mut stream) {
                CommandEnd::Done => {
                    state = ServerState::Ready;
                    debug!("state {state:?}");
                }
                CommandEnd::Quit => return Ok(ClientEnd::Shutdown),
                CommandEnd::PeerLost => return Ok(ClientEnd::PeerLostMidCommand),
            }
        }
    }

    /// Run one command and answer with exactly one completion frame.
    fn process(&mut self, line: &str, stream: &mut LocalStream) -> CommandEnd {
        let command = match Command::parse(line) {
            Ok(command) => command,
            Err(e) => {
                warn!("rejecting command: {e}");
                return send_completion(stream, FAILURE);
            }
        };

        let result = {
            let mut sink = StreamSink { stream };
            let mut pacer = ProgressPacer::new(&mut sink);
            let mut ctx = EngineContext {
                disk: self.disk,
                source_hash: &mut self.source_hash,
                total_bytes: &mut self.total_bytes,
            };
            dispatch::execute(command, &mut ctx, &mut pacer)
        };

        match result {
            Ok(Disposition::Continue) => send_completion(stream, SUCCESS),
            Ok(Disposition::Quit) => {
                // Ack first, then quit; the second SHUTDOWN a client might
                // send can only fail at the transport
                let _ = send_completion(stream, SUCCESS);
                CommandEnd::Quit
            }
            Err(e) => {
                if is_peer_loss(&e) {
                    warn!("client vanished mid-command: {e:#}");
                    return CommandEnd::PeerLost;
                }
                warn!("command failed: {e:#}");
                send_completion(stream, FAILURE)
            }
        }
    }
}

enum CommandEnd {
    Done,
    Quit,
    PeerLost,
}

fn send_completion(stream: &mut LocalStream, status: &str) -> CommandEnd {
    match wire::write_text(stream, status).and_then(|()| stream.flush()) {
        Ok(()) => CommandEnd::Done,
        Err(e) => {
            warn!("could not deliver completion: {e}");
            CommandEnd::PeerLost
        }
    }
}

fn is_peer_loss(error: &anyhow::Error) -> bool {
    error.chain().any(|cause| {
        cause.downcast_ref::<io::Error>().is_some_and(|io_err| {
            matches!(
                io_err.kind(),
                io::ErrorKind::BrokenPipe
                    | io::ErrorKind::ConnectionReset
                    | io::ErrorKind::ConnectionAborted
            )
        })
    })
}

/// Emits progress frames onto the client stream.
struct StreamSink<'s> {
    stream: &'s mut LocalStream,
}

impl ProgressSink for StreamSink<'_> {
    fn emit(&mut self, kind: ProgressKind, now: u64, total: u64) -> io::Result<()> {
        wire::write_progress(self.stream, kind, now as i64, total as i64)?;
        self.stream.flush()
    }
}

/// Wait up to `timeout` for one string frame.
fn read_text_with_timeout(
    stream: &mut LocalStream,
    reader: &mut FrameReader,
    timeout: Duration,
) -> io::Result<Option<String>> {
    let deadline = std::time::Instant::now() + timeout;
    stream.set_read_timeout(Some(READY_POLL))?;
    loop {
        if let Some(frame) = reader.next_frame()? {
            return match frame {
                Frame::Text(text) => Ok(Some(text)),
                Frame::Progress { .. } => Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    "unexpected progress frame during handshake",
                )),
            };
        }
        if std::time::Instant::now() >= deadline {
            return Ok(None);
        }
        match reader.fill_from(stream) {
            Ok(0) => return Ok(None),
            Ok(_) => {}
            Err(e)
                if e.kind() == io::ErrorKind::WouldBlock
                    || e.kind() == io::ErrorKind::TimedOut => {}
            Err(e) => return Err(e),
        }
    }
}
