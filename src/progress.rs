//! Progress reporting plumbing shared by the write engine and the verifier.

use std::io;
use std::time::{Duration, Instant};

use crate::protocol::ProgressKind;

/// Receives progress updates. The helper binds one to the client stream;
/// tests collect frames in memory.
pub trait ProgressSink {
    fn emit(&mut self, kind: ProgressKind, now: u64, total: u64) -> io::Result<()>;
}

/// Sink that discards everything, for one-shot CLI runs without a client.
pub struct NullSink;

impl ProgressSink for NullSink {
    fn emit(&mut self, _kind: ProgressKind, _now: u64, _total: u64) -> io::Result<()> {
        Ok(())
    }
}

/// Rate-limits and deduplicates progress updates.
///
/// `tick` emits at most once per interval; `force` bypasses the interval for
/// the mandatory first and last frames. Both suppress a frame whose kind and
/// position match the previous one, so a stalled transfer does not spam the
/// client.
pub struct ProgressPacer<'a> {
    sink: &'a mut dyn ProgressSink,
    interval: Duration,
    last_emit: Option<Instant>,
    last_sent: Option<(ProgressKind, u64)>,
}

pub const DEFAULT_PROGRESS_INTERVAL: Duration = Duration::from_millis(200);

impl<'a> ProgressPacer<'a> {
    pub fn new(sink: &'a mut dyn ProgressSink) -> Self {
        Self::with_interval(sink, DEFAULT_PROGRESS_INTERVAL)
    }

    pub fn with_interval(sink: &'a mut dyn ProgressSink, interval: Duration) -> Self {
        Self {
            sink,
            interval,
            last_emit: None,
            last_sent: None,
        }
    }

    /// Periodic update; dropped silently when inside the pacing interval.
    pub fn tick(&mut self, kind: ProgressKind, now: u64, total: u64) -> io::Result<()> {
        if let Some(at) = self.last_emit {
            if at.elapsed() < self.interval {
                return Ok(());
            }
        }
        self.send(kind, now, total)
    }

    /// Mandatory update (start and completion frames).
    pub fn force(&mut self, kind: ProgressKind, now: u64, total: u64) -> io::Result<()> {
        self.send(kind, now, total)
    }

    fn send(&mut self, kind: ProgressKind, now: u64, total: u64) -> io::Result<()> {
        if self.last_sent == Some((kind, now)) {
            return Ok(());
        }
        self.sink.emit(kind, now, total)?;
        self.last_sent = Some((kind, now));
        self.last_emit = Some(Instant::now());
        Ok(())
    }
}
