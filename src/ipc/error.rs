//! Error kinds for the framed stdio transport.

use std::time::Duration;

use thiserror::Error;

use crate::rpc::{RpcError, INTERNAL_ERROR, INVALID_REQUEST, METHOD_NOT_FOUND};

/// Transport-level failures, shared by the codec, the readers and the client.
///
/// `Timeout`, `Crashed` and `Write` carry whatever the child process wrote to
/// its error stream, so a failed call can be diagnosed without a second round
/// trip.
#[derive(Debug, Error)]
pub enum TransportError {
    /// Malformed or missing header block.
    #[error("Framing error: {0}")]
    Framing(String),

    /// The stream ended before the declared number of bytes arrived.
    #[error("Stream ended after {received} of {expected} bytes")]
    TruncatedStream { expected: usize, received: usize },

    /// A complete body was read but is not valid UTF-8. The stream is still
    /// in sync and the next frame can be read.
    #[error("Message body is not valid UTF-8: {0}")]
    InvalidBody(String),

    /// No response within the deadline while the process is still running.
    #[error("No response within {}s. Stderr so far:\n{diagnostics}", .timeout.as_secs_f64())]
    Timeout {
        timeout: Duration,
        diagnostics: String,
    },

    /// The process exited before responding.
    #[error("Server exited (code={}). Stderr:\n{diagnostics}", display_code(.code))]
    Crashed {
        code: Option<i32>,
        diagnostics: String,
    },

    /// The request could not be written to the child's input.
    #[error("Failed to write to server stdin: {source}\nServer stderr:\n{diagnostics}")]
    Write {
        #[source]
        source: std::io::Error,
        diagnostics: String,
    },

    /// The child process could not be started.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// A message arrived but is not a valid response envelope.
    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    /// The server answered with an RPC error object.
    #[error("Server error {code}: {message}")]
    Rpc { code: i32, message: String },

    /// I/O error while reading or writing a frame.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

fn display_code(code: &Option<i32>) -> String {
    code.map(|c| c.to_string())
        .unwrap_or_else(|| "signal".to_string())
}

impl TransportError {
    /// Diagnostic text attached to the error, if any.
    pub fn diagnostics(&self) -> Option<&str> {
        match self {
            TransportError::Timeout { diagnostics, .. }
            | TransportError::Crashed { diagnostics, .. }
            | TransportError::Write { diagnostics, .. } => Some(diagnostics),
            _ => None,
        }
    }

    /// True when the peer process is gone and the connection must be rebuilt.
    pub fn is_crash(&self) -> bool {
        matches!(self, TransportError::Crashed { .. })
    }

    /// True when only the current message was lost and reading may go on.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, TransportError::InvalidBody(_))
    }
}

impl From<RpcError> for TransportError {
    fn from(err: RpcError) -> Self {
        TransportError::Rpc {
            code: err.code,
            message: err.message,
        }
    }
}

/// Server-side dispatch failures.
///
/// Each kind maps onto an RPC error code and a fixed public message. The
/// handler's own error text is for the log only and never reaches the peer.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("Invalid Request: {0}")]
    InvalidRequest(String),

    #[error("Method not found: {0}")]
    MethodNotFound(String),

    #[error("Handler '{method}' failed: {reason:#}")]
    Handler {
        method: String,
        reason: anyhow::Error,
    },

    #[error("Handler '{method}' panicked")]
    Panicked { method: String },
}

impl DispatchError {
    pub fn code(&self) -> i32 {
        match self {
            DispatchError::InvalidRequest(_) => INVALID_REQUEST,
            DispatchError::MethodNotFound(_) => METHOD_NOT_FOUND,
            DispatchError::Handler { .. } | DispatchError::Panicked { .. } => INTERNAL_ERROR,
        }
    }

    /// Error object written to the peer.
    pub fn to_rpc_error(&self) -> RpcError {
        match self {
            DispatchError::InvalidRequest(_) | DispatchError::MethodNotFound(_) => {
                RpcError::new(self.code(), self.to_string())
            }
            DispatchError::Handler { .. } | DispatchError::Panicked { .. } => {
                RpcError::new(INTERNAL_ERROR, "Internal error")
            }
        }
    }
}
