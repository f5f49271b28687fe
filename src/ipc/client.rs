//! Stdio transport client for JSON-RPC tool servers.
//!
//! `TransportClient` spawns a tool server as a child process, writes framed
//! requests to its stdin and receives framed responses decoded by a
//! background reader thread on its stdout. A second thread collects stderr so
//! failures can report what the server said before it stalled or died.
//!
//! Only one request may be in flight per connection: the next message read
//! from the server is taken as the response to the last request, whatever
//! its `id` says. Issuing concurrent calls is not supported (and `call`
//! takes `&mut self` so it cannot happen by accident).

use std::io::{self, Write};
use std::process::{Child, ChildStdin, Command, ExitStatus, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use super::error::TransportError;
use super::framing;
use super::reader::{spawn_diagnostic_reader, spawn_frame_reader, DiagnosticBuffer};
use crate::config::ServerCommand;
use crate::rpc::{Request, Response};

/// Default request timeout in seconds.
pub const DEFAULT_TIMEOUT_SECS: u64 = 30;

/// Request id used on every call of a connection unless overridden.
pub const DEFAULT_REQUEST_ID: &str = "cli";

/// How long `close` waits for a graceful exit before killing the process.
const CLOSE_GRACE: Duration = Duration::from_millis(500);

/// Poll interval while waiting for the child to exit.
const EXIT_POLL: Duration = Duration::from_millis(50);

/// How long a crash report waits for the stderr reader to catch up.
const DIAGNOSTIC_SETTLE: Duration = Duration::from_millis(250);

type Result<T> = std::result::Result<T, TransportError>;

/// Client end of the framed stdio transport.
///
/// # Process Cleanup Safety
///
/// The client owns the child process. `close()` (also run on `Drop`) closes
/// the server's stdin, gives it a moment to exit on its own and then kills
/// and reaps it, so no orphaned or zombie servers are left behind.
///
/// # Example
///
/// ```ignore
/// use std::time::Duration;
/// use toolhost::config::ServerCommand;
/// use toolhost::ipc::TransportClient;
///
/// let cmd = ServerCommand::parse("bearingpro")?;
/// let mut client = TransportClient::spawn(&cmd, Duration::from_secs(15))?;
/// let pong = client.call_result("ping", serde_json::json!({}))?;
/// ```
pub struct TransportClient {
    /// Short name used for reader threads and log lines.
    name: String,
    child: Child,
    /// `None` once the connection is closed.
    stdin: Option<ChildStdin>,
    /// Messages decoded by the stdout reader.
    responses: Receiver<String>,
    /// Lines collected by the stderr reader.
    diagnostics: Arc<DiagnosticBuffer>,
    request_id: Value,
    timeout: Duration,
    closed: bool,
}

impl TransportClient {
    /// Spawn the server and start both reader threads.
    ///
    /// # Errors
    ///
    /// Returns `TransportError::Spawn` if the process cannot be started and
    /// `TransportError::Io` if its pipes or reader threads cannot be set up.
    /// In the latter case the process is cleaned up before returning.
    pub fn spawn(command: &ServerCommand, timeout: Duration) -> Result<Self> {
        info!("Starting tool server: {}", command.display());

        let mut cmd = Command::new(&command.program);
        cmd.args(&command.args)
            .envs(command.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped());
        if let Some(dir) = &command.cwd {
            cmd.current_dir(dir);
        }

        let mut child = cmd.spawn().map_err(|source| TransportError::Spawn {
            program: command.program.clone(),
            source,
        })?;

        let stdin = child.stdin.take();
        let stdout = child.stdout.take();
        let stderr = child.stderr.take();

        let name = std::path::Path::new(&command.program)
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| command.program.clone());

        let (tx, rx) = mpsc::channel();
        // Create client early so it owns the child process.
        // If any of the setup below fails, Drop will clean up the process.
        let client = Self {
            name,
            child,
            stdin,
            responses: rx,
            diagnostics: Arc::new(DiagnosticBuffer::new()),
            request_id: Value::from(DEFAULT_REQUEST_ID),
            timeout,
            closed: false,
        };

        let (Some(stdout), Some(stderr)) = (stdout, stderr) else {
            return Err(missing_pipe("stdout/stderr"));
        };
        if client.stdin.is_none() {
            return Err(missing_pipe("stdin"));
        }

        spawn_frame_reader(&client.name, stdout, tx)?;
        spawn_diagnostic_reader(&client.name, stderr, Arc::clone(&client.diagnostics))?;

        debug!("Tool server '{}' running as pid {}", client.name, client.pid());
        Ok(client)
    }

    /// Set the fixed request id used for every call on this connection.
    pub fn with_request_id(mut self, id: impl Into<Value>) -> Self {
        self.request_id = id.into();
        self
    }

    /// Set the default call timeout.
    pub fn set_timeout(&mut self, timeout: Duration) {
        self.timeout = timeout;
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    pub fn pid(&self) -> u32 {
        self.child.id()
    }

    /// Send a request and wait for the next message, using the connection timeout.
    pub fn call(&mut self, method: &str, params: Value) -> Result<Response> {
        let timeout = self.timeout;
        self.call_with_timeout(method, params, timeout)
    }

    /// Send a request and wait up to `timeout` for the next message.
    ///
    /// # Errors
    ///
    /// - `TransportError::Crashed` if the server exited without answering
    /// - `TransportError::Timeout` if it is alive but did not answer in time
    /// - `TransportError::Write` if the request could not be written
    /// - `TransportError::InvalidResponse` if the answer is not a response envelope
    ///
    /// An RPC-level error object is not an `Err`: it comes back inside the
    /// returned `Response`.
    pub fn call_with_timeout(
        &mut self,
        method: &str,
        params: Value,
        timeout: Duration,
    ) -> Result<Response> {
        if self.closed {
            return Err(TransportError::Io(io::Error::new(
                io::ErrorKind::NotConnected,
                "connection is closed",
            )));
        }

        self.discard_stale_messages();

        let request = Request::new(method, params, self.request_id.clone());
        let frame = framing::encode(&request)?;
        debug!(">>> {} {}", self.name, method);

        if let Err(source) = self.write_frame(&frame) {
            return Err(self.write_failure(source));
        }

        let response = self.await_response(timeout)?;
        debug!("<<< {} {}", self.name, method);
        Ok(response)
    }

    /// Like [`call`](Self::call), but unwraps the `result` and turns an RPC
    /// error object into `TransportError::Rpc`.
    pub fn call_result(&mut self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params)?
            .into_result()
            .map_err(TransportError::from)
    }

    /// True while the process is running and the connection is open.
    pub fn is_alive(&mut self) -> bool {
        !self.closed && self.exit_status().is_none()
    }

    /// Take everything the server wrote to stderr so far.
    pub fn drain_diagnostics(&self) -> String {
        self.diagnostics.drain()
    }

    /// Terminate the server. Safe to call more than once.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        // Closing stdin lets well-behaved servers exit on end-of-stream
        drop(self.stdin.take());

        let deadline = Instant::now() + CLOSE_GRACE;
        while Instant::now() < deadline {
            match self.child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Tool server '{}' exited: {}", self.name, status);
                    return;
                }
                Ok(None) => thread::sleep(EXIT_POLL),
                Err(e) => {
                    warn!("Error waiting for tool server '{}': {}", self.name, e);
                    break;
                }
            }
        }

        // If still running after the grace period, kill it
        debug!("Tool server '{}' didn't exit gracefully, killing", self.name);
        let _ = self.child.kill();
        let _ = self.child.wait();
    }

    fn write_frame(&mut self, frame: &[u8]) -> io::Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))?;
        stdin.write_all(frame)?;
        stdin.flush()
    }

    /// Drop messages that arrived after an earlier call gave up waiting.
    fn discard_stale_messages(&mut self) {
        for stale in self.responses.try_iter() {
            warn!(
                "Discarding late message from '{}': {}",
                self.name,
                preview(&stale)
            );
        }
    }

    fn write_failure(&mut self, source: io::Error) -> TransportError {
        // A broken pipe usually means the process is on its way out
        let status = if source.kind() == io::ErrorKind::BrokenPipe {
            self.wait_for_exit(Instant::now().checked_add(CLOSE_GRACE))
        } else {
            self.exit_status()
        };
        match status {
            Some(status) => self.crashed(status),
            None => TransportError::Write {
                source,
                diagnostics: self.diagnostics.drain(),
            },
        }
    }

    fn await_response(&mut self, timeout: Duration) -> Result<Response> {
        // `None` when the timeout is too large for a deadline: wait for the exit
        let deadline = Instant::now().checked_add(timeout);
        match self.responses.recv_timeout(timeout) {
            Ok(message) => parse_response(&message),
            Err(RecvTimeoutError::Timeout) => match self.exit_status() {
                Some(status) => Err(self.crashed(status)),
                None => Err(self.timed_out(timeout)),
            },
            // The stdout reader is gone: nothing more can arrive
            Err(RecvTimeoutError::Disconnected) => match self.wait_for_exit(deadline) {
                Some(status) => Err(self.crashed(status)),
                None => Err(self.timed_out(timeout)),
            },
        }
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        match self.child.try_wait() {
            Ok(status) => status,
            Err(e) => {
                warn!("Error polling tool server '{}': {}", self.name, e);
                None
            }
        }
    }

    /// Poll until the child exits or `deadline` passes. Without a deadline
    /// this polls until the exit.
    fn wait_for_exit(&mut self, deadline: Option<Instant>) -> Option<ExitStatus> {
        loop {
            if let Some(status) = self.exit_status() {
                return Some(status);
            }
            let pause = match deadline {
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        return None;
                    }
                    EXIT_POLL.min(deadline - now)
                }
                None => EXIT_POLL,
            };
            thread::sleep(pause);
        }
    }

    fn crashed(&self, status: ExitStatus) -> TransportError {
        warn!("Tool server '{}' exited before responding: {}", self.name, status);
        // Let the stderr reader pick up the last lines the process wrote
        self.diagnostics.wait_closed(DIAGNOSTIC_SETTLE);
        TransportError::Crashed {
            code: status.code(),
            diagnostics: self.diagnostics.drain(),
        }
    }

    fn timed_out(&self, timeout: Duration) -> TransportError {
        warn!(
            "Tool server '{}' did not respond within {:?}",
            self.name, timeout
        );
        TransportError::Timeout {
            timeout,
            diagnostics: self.diagnostics.drain(),
        }
    }
}

impl Drop for TransportClient {
    fn drop(&mut self) {
        self.close();
    }
}

fn missing_pipe(which: &str) -> TransportError {
    TransportError::Io(io::Error::new(
        io::ErrorKind::Other,
        format!("Failed to get {} handle for tool server", which),
    ))
}

fn parse_response(message: &str) -> Result<Response> {
    let response: Response = serde_json::from_str(message)
        .map_err(|e| TransportError::InvalidResponse(format!("{}: {}", e, preview(message))))?;
    if !response.is_well_formed() {
        return Err(TransportError::InvalidResponse(format!(
            "expected exactly one of result/error: {}",
            preview(message)
        )));
    }
    Ok(response)
}

fn preview(message: &str) -> String {
    const LIMIT: usize = 200;
    match message.char_indices().nth(LIMIT) {
        Some((idx, _)) => format!("{}...", &message[..idx]),
        None => message.to_string(),
    }
}

/// A connection that starts its server on first use.
///
/// After a crash the dead client is dropped, so the next call starts a fresh
/// server process.
pub struct LazyConnection {
    command: ServerCommand,
    timeout: Duration,
    client: Option<TransportClient>,
}

impl LazyConnection {
    pub fn new(command: ServerCommand, timeout: Duration) -> Self {
        Self {
            command,
            timeout,
            client: None,
        }
    }

    pub fn command(&self) -> &ServerCommand {
        &self.command
    }

    /// True once a server process has been started and not discarded.
    pub fn is_connected(&self) -> bool {
        self.client.is_some()
    }

    fn connect(&mut self) -> Result<&mut TransportClient> {
        if self.client.is_none() {
            self.client = Some(TransportClient::spawn(&self.command, self.timeout)?);
        }
        self.client
            .as_mut()
            .ok_or_else(|| {
                TransportError::Io(io::Error::new(io::ErrorKind::NotConnected, "no client"))
            })
    }

    pub fn call(&mut self, method: &str, params: Value) -> Result<Response> {
        let result = self.connect()?.call(method, params);
        if matches!(&result, Err(e) if e.is_crash()) {
            info!("Discarding crashed connection to {}", self.command.display());
            self.client = None;
        }
        result
    }

    pub fn call_result(&mut self, method: &str, params: Value) -> Result<Value> {
        self.call(method, params)?
            .into_result()
            .map_err(TransportError::from)
    }

    pub fn close(&mut self) {
        if let Some(mut client) = self.client.take() {
            client.close();
        }
    }
}
