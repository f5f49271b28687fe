//! Background pumps for a child process's output and error streams.
//!
//! The output pump decodes frames (or bare JSON lines) and publishes each
//! message body on a channel. The error pump collects lines into a
//! [`DiagnosticBuffer`] that callers drain when a call fails. Neither pump
//! ever blocks the caller of `call`; they talk to it only through the
//! channel and the buffer.

use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::mpsc::Sender;
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use tracing::{debug, warn};

use super::error::TransportError;
use super::framing::{self, FrameStart};

/// Lines kept by a diagnostic buffer before the oldest are dropped.
pub const DEFAULT_DIAGNOSTIC_LINES: usize = 1000;

/// Why an output pump stopped.
#[derive(Debug)]
pub enum ReaderExit {
    /// The stream reached end-of-file.
    EndOfStream,
    /// Nobody is listening on the channel any more.
    ReceiverGone,
    /// The stream carried something that could not be decoded.
    Failed(TransportError),
}

/// Decode messages from `reader` and publish them on `tx` until the stream ends.
///
/// Frames without a body, or with a body that is not UTF-8, are skipped.
/// Framing and truncation errors end the pump; they are not reported to the
/// caller, who will observe the lack of progress as a timeout or a crash.
pub fn pump_frames<R: BufRead>(mut reader: R, tx: &Sender<String>) -> ReaderExit {
    loop {
        let message = match framing::decode_header(&mut reader) {
            Ok(None) => {
                debug!("Output stream closed");
                return ReaderExit::EndOfStream;
            }
            Ok(Some(FrameStart::BareJson(line))) => line,
            Ok(Some(FrameStart::Headers(headers))) => {
                match framing::read_frame_body(&mut reader, &headers) {
                    Ok(body) if body.is_empty() => {
                        debug!("Skipping frame without body");
                        continue;
                    }
                    Ok(body) => body,
                    Err(e) if e.is_recoverable() => {
                        warn!("Discarding frame: {}", e);
                        continue;
                    }
                    Err(e) => {
                        warn!("Failed to read frame body: {}", e);
                        return ReaderExit::Failed(e);
                    }
                }
            }
            Err(e) => {
                warn!("Failed to read frame header: {}", e);
                return ReaderExit::Failed(e);
            }
        };

        if tx.send(message).is_err() {
            debug!("Response channel closed, stopping output reader");
            return ReaderExit::ReceiverGone;
        }
    }
}

/// Run [`pump_frames`] on a dedicated thread.
pub fn spawn_frame_reader<R>(
    name: &str,
    stream: R,
    tx: Sender<String>,
) -> io::Result<JoinHandle<ReaderExit>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-stdout", name))
        .spawn(move || pump_frames(BufReader::new(stream), &tx))
}

/// Copy lines from `reader` into `buffer` until the stream ends, then close it.
pub fn pump_lines<R: BufRead>(mut reader: R, buffer: &DiagnosticBuffer) {
    let mut line = Vec::new();
    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let text = String::from_utf8_lossy(&line);
                let text = text.trim_end_matches(['\r', '\n']);
                debug!(target: "toolhost::stderr", "{}", text);
                buffer.push(text.to_string());
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                debug!("Error stream read failed: {}", e);
                break;
            }
        }
    }
    buffer.close();
}

/// Run [`pump_lines`] on a dedicated thread.
pub fn spawn_diagnostic_reader<R>(
    name: &str,
    stream: R,
    buffer: Arc<DiagnosticBuffer>,
) -> io::Result<JoinHandle<()>>
where
    R: Read + Send + 'static,
{
    thread::Builder::new()
        .name(format!("{}-stderr", name))
        .spawn(move || pump_lines(BufReader::new(stream), &buffer))
}

#[derive(Debug, Default)]
struct DiagnosticState {
    lines: VecDeque<String>,
    dropped: usize,
    closed: bool,
}

/// Bounded, thread-safe store of error-stream lines.
///
/// Unlike the response channel this is never waited on during a call; it is
/// drained without blocking when a failure needs context.
#[derive(Debug)]
pub struct DiagnosticBuffer {
    state: Mutex<DiagnosticState>,
    closed: Condvar,
    capacity: usize,
}

impl Default for DiagnosticBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_DIAGNOSTIC_LINES)
    }
}

impl DiagnosticBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            state: Mutex::new(DiagnosticState::default()),
            closed: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    fn lock(&self) -> MutexGuard<'_, DiagnosticState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn push(&self, line: String) {
        let mut state = self.lock();
        if state.lines.len() == self.capacity {
            state.lines.pop_front();
            state.dropped += 1;
        }
        state.lines.push_back(line);
    }

    /// Mark the stream as finished and wake any waiter.
    pub fn close(&self) {
        self.lock().closed = true;
        self.closed.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Wait until the stream is closed or `timeout` passes. Returns whether it closed.
    ///
    /// A timeout too large to represent as a deadline waits without limit.
    pub fn wait_closed(&self, timeout: Duration) -> bool {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.lock();
        while !state.closed {
            state = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return false;
                    }
                    match self.closed.wait_timeout(state, deadline - now) {
                        Ok((guard, _)) => guard,
                        Err(poisoned) => poisoned.into_inner().0,
                    }
                }
                None => self
                    .closed
                    .wait(state)
                    .unwrap_or_else(PoisonError::into_inner),
            };
        }
        true
    }

    /// Take everything buffered so far, joined with newlines.
    pub fn drain(&self) -> String {
        let mut state = self.lock();
        let mut lines: Vec<String> = state.lines.drain(..).collect();
        if state.dropped > 0 {
            lines.insert(0, format!("[{} earlier lines dropped]", state.dropped));
            state.dropped = 0;
        }
        lines.join("\n")
    }
}
