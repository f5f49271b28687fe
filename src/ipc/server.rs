//! Stdio transport server: the single-threaded service loop of a tool server.
//!
//! The server reads one frame, dispatches it to the handler registered for
//! its method, writes the framed response and only then reads the next
//! frame. Handlers run on the loop thread, so they are expected to be quick.
//!
//! No single request can stop the loop. Malformed JSON and bodies that are
//! not UTF-8 are discarded. Bad envelopes and unknown methods get an error
//! frame, and handler failures (including panics) are answered with
//! `-32603 Internal error`. The loop stops only at end of input or when the
//! framing itself breaks down.

use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::panic::{self, AssertUnwindSafe};

use serde_json::{Map, Value};
use tracing::{debug, error, info, warn};

use super::error::{DispatchError, TransportError};
use super::framing;
use crate::rpc::{Response, PROTOCOL_FIELD, PROTOCOL_VERSION};

/// A registered method implementation.
pub type Handler = Box<dyn Fn(&Value) -> anyhow::Result<Value> + Send + Sync>;

/// Method name to handler mapping.
///
/// Built once at startup and moved into the server, which never changes it.
///
/// # Example
///
/// ```ignore
/// let table = HandlerTable::new()
///     .register("ping", |_params| Ok(json!({"pong": true})));
/// serve_stdio(table)?;
/// ```
#[derive(Default)]
pub struct HandlerTable {
    handlers: HashMap<String, Handler>,
}

impl HandlerTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `handler` under `name`, replacing any earlier registration.
    pub fn register<F>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(&Value) -> anyhow::Result<Value> + Send + Sync + 'static,
    {
        let name = name.into();
        if self.handlers.insert(name.clone(), Box::new(handler)).is_some() {
            warn!("Handler for '{}' registered twice; keeping the last one", name);
        }
        self
    }

    pub fn contains(&self, method: &str) -> bool {
        self.handlers.contains_key(method)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    /// Registered method names, sorted.
    pub fn methods(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.handlers.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    /// Invoke the handler for `method`.
    ///
    /// Handler errors and panics become `DispatchError`s; they never
    /// propagate past this call.
    pub fn dispatch(&self, method: &str, params: &Value) -> Result<Value, DispatchError> {
        let handler = self
            .handlers
            .get(method)
            .ok_or_else(|| DispatchError::MethodNotFound(method.to_string()))?;

        match panic::catch_unwind(AssertUnwindSafe(|| handler(params))) {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(reason)) => Err(DispatchError::Handler {
                method: method.to_string(),
                reason,
            }),
            Err(_) => Err(DispatchError::Panicked {
                method: method.to_string(),
            }),
        }
    }
}

/// Service loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ServerState {
    Running,
    Stopped,
}

/// Server end of the framed transport over any reader/writer pair.
pub struct TransportServer<R, W> {
    handlers: HandlerTable,
    reader: R,
    writer: W,
    state: ServerState,
    handled: u64,
}

impl<R: BufRead, W: Write> TransportServer<R, W> {
    pub fn new(handlers: HandlerTable, reader: R, writer: W) -> Self {
        Self {
            handlers,
            reader,
            writer,
            state: ServerState::Running,
            handled: 0,
        }
    }

    pub fn state(&self) -> ServerState {
        self.state
    }

    /// Number of requests answered so far.
    pub fn handled(&self) -> u64 {
        self.handled
    }

    /// Run until end of input.
    ///
    /// # Errors
    ///
    /// Returns the framing, truncation or I/O error that made further
    /// reading or writing impossible. End of input is not an error.
    pub fn serve(&mut self) -> Result<(), TransportError> {
        info!(
            "Serving {} methods: {}",
            self.handlers.len(),
            self.handlers.methods().join(", ")
        );
        while self.step()? == ServerState::Running {}
        info!("Input closed after {} requests, stopping", self.handled);
        Ok(())
    }

    /// Read and answer at most one frame.
    pub fn step(&mut self) -> Result<ServerState, TransportError> {
        if self.state == ServerState::Stopped {
            return Ok(ServerState::Stopped);
        }

        let raw = match framing::read_message(&mut self.reader) {
            Ok(Some(raw)) => raw,
            Ok(None) => {
                debug!("End of input");
                self.state = ServerState::Stopped;
                return Ok(self.state);
            }
            Err(e) if e.is_recoverable() => {
                warn!("Discarding message: {}", e);
                return Ok(self.state);
            }
            Err(e) => {
                error!("Unrecoverable framing error: {}", e);
                self.state = ServerState::Stopped;
                return Err(e);
            }
        };

        if raw.trim().is_empty() {
            debug!("Ignoring frame without body");
            return Ok(self.state);
        }

        let request: Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                warn!("Discarding malformed JSON message: {}", e);
                return Ok(self.state);
            }
        };

        let response = self.handle(&request);
        if let Err(e) = self.write_response(&response) {
            error!("Failed to write response: {}", e);
            self.state = ServerState::Stopped;
            return Err(e);
        }
        self.handled += 1;
        Ok(self.state)
    }

    /// Build the response for one decoded request.
    pub fn handle(&self, request: &Value) -> Response {
        let id = request.get("id").cloned().unwrap_or(Value::Null);
        match self.route(request) {
            Ok(result) => Response::success(id, result),
            Err(err) => {
                match &err {
                    DispatchError::Handler { .. } | DispatchError::Panicked { .. } => {
                        error!("{}", err)
                    }
                    _ => warn!("{}", err),
                }
                Response::failure(id, err.to_rpc_error())
            }
        }
    }

    fn route(&self, request: &Value) -> Result<Value, DispatchError> {
        let envelope = request
            .as_object()
            .ok_or_else(|| DispatchError::InvalidRequest("request must be an object".to_string()))?;

        if let Some(version) = envelope.get(PROTOCOL_FIELD) {
            if version.as_str() != Some(PROTOCOL_VERSION) {
                return Err(DispatchError::InvalidRequest(format!(
                    "{} must be '{}'",
                    PROTOCOL_FIELD, PROTOCOL_VERSION
                )));
            }
        }

        let method = envelope
            .get("method")
            .and_then(Value::as_str)
            .ok_or_else(|| DispatchError::InvalidRequest("method must be a string".to_string()))?;

        let params = match envelope.get("params") {
            None | Some(Value::Null) => Value::Object(Map::new()),
            Some(params) => params.clone(),
        };

        info!(">>> {}", method);
        let result = self.handlers.dispatch(method, &params)?;
        info!("<<< {} OK", method);
        Ok(result)
    }

    fn write_response(&mut self, response: &Response) -> Result<(), TransportError> {
        let frame = framing::encode(response)?;
        self.writer.write_all(&frame)?;
        self.writer.flush()?;
        Ok(())
    }

    /// Give back the reader and writer.
    pub fn into_parts(self) -> (R, W) {
        (self.reader, self.writer)
    }
}

/// Serve `handlers` on this process's own stdin/stdout until stdin closes.
pub fn serve_stdio(handlers: HandlerTable) -> Result<(), TransportError> {
    let stdin = std::io::stdin();
    let stdout = std::io::stdout();
    TransportServer::new(handlers, stdin.lock(), stdout.lock()).serve()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rpc::{INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};
    use pretty_assertions::assert_eq;
    use serde_json::json;
    use std::io::Cursor;

    fn table() -> HandlerTable {
        HandlerTable::new()
            .register("ping", |_| Ok(json!({"pong": true})))
            .register("echo", |params| Ok(params.clone()))
            .register("fail", |_| Err(anyhow::anyhow!("database password is hunter2")))
            .register("explode", |_| panic!("handler bug"))
    }

    fn frames(messages: &[&str]) -> Vec<u8> {
        let mut raw = Vec::new();
        for message in messages {
            raw.extend(framing::frame_bytes(message.as_bytes()));
        }
        raw
    }

    /// Run the server over `input` and decode every response it wrote.
    fn run(input: Vec<u8>) -> (Result<(), TransportError>, Vec<Value>, u64) {
        let mut server = TransportServer::new(table(), Cursor::new(input), Vec::new());
        let result = server.serve();
        let handled = server.handled();
        let (_, output) = server.into_parts();

        let mut reader = output.as_slice();
        let mut responses = Vec::new();
        while let Some(body) = framing::read_message(&mut reader).unwrap() {
            responses.push(serde_json::from_str(&body).unwrap());
        }
        (result, responses, handled)
    }

    #[test]
    fn test_ping_response_body() {
        let input = frames(&[r#"{"protocol":"2.0","id":"1","method":"ping","params":{}}"#]);
        let (result, responses, handled) = run(input);

        assert!(result.is_ok());
        assert_eq!(handled, 1);
        assert_eq!(
            responses,
            vec![json!({"protocol": "2.0", "id": "1", "result": {"pong": true}})]
        );
    }

    #[test]
    fn test_unknown_method_keeps_running() {
        let input = frames(&[
            r#"{"protocol":"2.0","id":"a","method":"does_not_exist","params":{}}"#,
            r#"{"protocol":"2.0","id":"b","method":"ping","params":{}}"#,
        ]);
        let (result, responses, _) = run(input);

        assert!(result.is_ok());
        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], json!(METHOD_NOT_FOUND));
        assert_eq!(responses[0]["id"], json!("a"));
        assert_eq!(responses[1]["result"], json!({"pong": true}));
    }

    #[test]
    fn test_malformed_json_is_discarded() {
        let input = frames(&[
            r#"{"protocol":"2.0","id":1,"method":"#,
            r#"{"protocol":"2.0","id":2,"method":"ping"}"#,
        ]);
        let (result, responses, handled) = run(input);

        assert!(result.is_ok());
        assert_eq!(handled, 1);
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0]["id"], json!(2));
    }

    #[test]
    fn test_body_that_is_not_utf8_is_discarded() {
        let mut input = framing::frame_bytes(&[0xff, 0xfe, b'{', b'}']);
        input.extend(frames(&[r#"{"protocol":"2.0","id":2,"method":"ping"}"#]));

        let mut server = TransportServer::new(table(), Cursor::new(input.clone()), Vec::new());
        assert_eq!(server.step().unwrap(), ServerState::Running);
        assert_eq!(server.handled(), 0);

        let (result, responses, handled) = run(input);
        assert!(result.is_ok());
        assert_eq!(handled, 1);
        assert_eq!(
            responses,
            vec![json!({"protocol": "2.0", "id": 2, "result": {"pong": true}})]
        );
    }

    #[test]
    fn test_wrong_protocol_version() {
        let input = frames(&[r#"{"protocol":"1.0","id":7,"method":"ping"}"#]);
        let (_, responses, _) = run(input);

        assert_eq!(responses[0]["error"]["code"], json!(INVALID_REQUEST));
        assert_eq!(responses[0]["id"], json!(7));
    }

    #[test]
    fn test_missing_protocol_is_accepted() {
        let input = frames(&[r#"{"id":7,"method":"echo","params":{"x":1}}"#]);
        let (_, responses, _) = run(input);
        assert_eq!(responses[0]["result"], json!({"x": 1}));
    }

    #[test]
    fn test_missing_params_become_empty_object() {
        let input = frames(&[
            r#"{"protocol":"2.0","id":1,"method":"echo"}"#,
            r#"{"protocol":"2.0","id":2,"method":"echo","params":null}"#,
        ]);
        let (_, responses, _) = run(input);
        assert_eq!(responses[0]["result"], json!({}));
        assert_eq!(responses[1]["result"], json!({}));
    }

    #[test]
    fn test_non_object_and_missing_method_are_invalid() {
        let input = frames(&[r#"[1,2,3]"#, r#"{"protocol":"2.0","id":3}"#]);
        let (_, responses, _) = run(input);

        assert_eq!(responses.len(), 2);
        assert_eq!(responses[0]["error"]["code"], json!(INVALID_REQUEST));
        assert_eq!(responses[0]["id"], Value::Null);
        assert_eq!(responses[1]["error"]["code"], json!(INVALID_REQUEST));
    }

    #[test]
    fn test_handler_failure_does_not_leak_detail() {
        let input = frames(&[
            r#"{"protocol":"2.0","id":1,"method":"fail"}"#,
            r#"{"protocol":"2.0","id":2,"method":"ping"}"#,
        ]);
        let (result, responses, _) = run(input);

        assert!(result.is_ok());
        assert_eq!(
            responses[0],
            json!({
                "protocol": "2.0",
                "id": 1,
                "error": {"code": INTERNAL_ERROR, "message": "Internal error"}
            })
        );
        assert_eq!(responses[1]["result"], json!({"pong": true}));
    }

    #[test]
    fn test_handler_panic_is_contained() {
        let input = frames(&[
            r#"{"protocol":"2.0","id":1,"method":"explode"}"#,
            r#"{"protocol":"2.0","id":2,"method":"ping"}"#,
        ]);
        let (result, responses, _) = run(input);

        assert!(result.is_ok());
        assert_eq!(responses[0]["error"]["code"], json!(INTERNAL_ERROR));
        assert_eq!(responses[1]["result"], json!({"pong": true}));
    }

    #[test]
    fn test_bare_json_request() {
        let input = b"{\"protocol\":\"2.0\",\"id\":9,\"method\":\"ping\"}\n".to_vec();
        let (_, responses, _) = run(input);
        assert_eq!(responses[0]["result"], json!({"pong": true}));
    }

    #[test]
    fn test_broken_framing_stops_server() {
        let mut input = frames(&[r#"{"protocol":"2.0","id":1,"method":"ping"}"#]);
        input.extend_from_slice(b"this is not a header\r\n\r\n");
        input.extend(frames(&[r#"{"protocol":"2.0","id":2,"method":"ping"}"#]));

        let mut server = TransportServer::new(table(), Cursor::new(input), Vec::new());
        assert_eq!(server.step().unwrap(), ServerState::Running);
        assert!(matches!(server.step(), Err(TransportError::Framing(_))));
        assert_eq!(server.state(), ServerState::Stopped);
        assert_eq!(server.step().unwrap(), ServerState::Stopped);
        assert_eq!(server.handled(), 1);
    }

    #[test]
    fn test_truncated_frame_stops_server() {
        let input = b"Content-Length: 100\r\n\r\n{\"protocol\"".to_vec();
        let (result, responses, _) = run(input);
        assert!(matches!(result, Err(TransportError::TruncatedStream { .. })));
        assert!(responses.is_empty());
    }

    #[test]
    fn test_handler_table() {
        let table = table();
        assert_eq!(table.len(), 4);
        assert!(table.contains("ping"));
        assert!(!table.contains("pong"));
        assert_eq!(table.methods(), vec!["echo", "explode", "fail", "ping"]);
        assert!(matches!(
            table.dispatch("nope", &json!({})),
            Err(DispatchError::MethodNotFound(_))
        ));
    }
}
