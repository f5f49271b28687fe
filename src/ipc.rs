//! Framed duplex transport between a chat host and its tool servers.
//!
//! A tool server is a child process that speaks JSON-RPC shaped messages on
//! its standard streams. Both ends of that conversation live here:
//!
//! ```text
//! ┌──────────────────┐    stdin  (framed requests)    ┌──────────────────┐
//! │ TransportClient  │ ─────────────────────────────► │ TransportServer  │
//! │  (host process)  │ ◄───────────────────────────── │  (tool process)  │
//! └──────────────────┘    stdout (framed responses)   └──────────────────┘
//!          ▲               stderr (diagnostics)                │
//!          └───────────────────────────────────────────────────┘
//! ```
//!
//! # Protocol
//!
//! Messages use HTTP-style Content-Length framing (same as LSP):
//!
//! ```text
//! Content-Length: 55\r\n
//! Content-Type: application/json\r\n
//! \r\n
//! {"protocol":"2.0","id":"1","method":"ping","params":{}}
//! ```
//!
//! A line starting with `{` or `[` in place of a header is accepted as a
//! complete unframed message.
//!
//! # Usage
//!
//! ```ignore
//! use toolhost::config::ServerCommand;
//! use toolhost::ipc::TransportClient;
//! use serde_json::json;
//!
//! let cmd = ServerCommand::parse("bearingpro")?;
//! let mut client = TransportClient::spawn(&cmd, Duration::from_secs(15))?;
//! let result = client.call_result("catalog_list", json!({}))?;
//! ```

mod client;
mod error;
pub mod framing;
pub mod reader;
mod server;

pub use client::{LazyConnection, TransportClient, DEFAULT_REQUEST_ID, DEFAULT_TIMEOUT_SECS};
pub use error::{DispatchError, TransportError};
pub use framing::{decode, encode, read_message, write_message, FrameStart, HeaderMap};
pub use reader::DiagnosticBuffer;
pub use server::{serve_stdio, Handler, HandlerTable, ServerState, TransportServer};
