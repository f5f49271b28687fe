//! Toolhost Library
//!
//! A chat host that drives JSON-RPC tool servers over framed stdio pipes,
//! plus the `bearingpro` tool server it talks to:
//!
//! - `ipc` - Framed transport: codec, stream readers, client and server
//! - `rpc` - Request/response envelope types and error codes
//! - `config` - Server commands and host settings from the environment
//! - `models` - Bearing data shared by the tools and the host
//! - `tools` - Bearing life tools and the server's method table
//! - `host` - Intent parsing and the interactive session
//!
//! # IPC Module
//!
//! ```ignore
//! use std::time::Duration;
//! use toolhost::config::ServerCommand;
//! use toolhost::ipc::LazyConnection;
//!
//! let mut conn = LazyConnection::new(ServerCommand::parse("bearingpro")?, Duration::from_secs(30));
//! let pong = conn.call_result("ping", serde_json::json!({}))?;
//! ```

pub mod config;
pub mod host;
pub mod ipc;
pub mod models;
pub mod rpc;
pub mod tools;
