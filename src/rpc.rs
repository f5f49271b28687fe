//! RPC envelope types shared by the transport client and server.
//!
//! The envelope is JSON-RPC shaped, but the version travels in a
//! `protocol` field:
//!
//! ```text
//! {"protocol":"2.0","id":"1","method":"ping","params":{}}
//! {"protocol":"2.0","id":"1","result":{"pong":true}}
//! {"protocol":"2.0","id":"1","error":{"code":-32601,"message":"Method not found"}}
//! ```

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Protocol version carried by every request and response.
pub const PROTOCOL_VERSION: &str = "2.0";

/// Name of the envelope field holding [`PROTOCOL_VERSION`].
pub const PROTOCOL_FIELD: &str = "protocol";

/// The request is not a valid request object.
pub const INVALID_REQUEST: i32 = -32600;

/// The method does not exist on the server.
pub const METHOD_NOT_FOUND: i32 = -32601;

/// The handler failed while processing the request.
pub const INTERNAL_ERROR: i32 = -32603;

/// An outgoing request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Request {
    pub protocol: String,
    pub id: Value,
    pub method: String,
    #[serde(default)]
    pub params: Value,
}

impl Request {
    /// Build a request for the current protocol version.
    pub fn new(method: impl Into<String>, params: Value, id: impl Into<Value>) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            id: id.into(),
            method: method.into(),
            params,
        }
    }
}

/// Error object carried by a failed response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RpcError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RpcError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }
}

/// A response. Exactly one of `result` and `error` is present.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub protocol: String,
    #[serde(default)]
    pub id: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<RpcError>,
}

impl Response {
    /// Successful response echoing the request id.
    pub fn success(id: Value, result: Value) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            id,
            result: Some(result),
            error: None,
        }
    }

    /// Error response echoing the request id (`null` when unknown).
    pub fn failure(id: Value, error: RpcError) -> Self {
        Self {
            protocol: PROTOCOL_VERSION.to_string(),
            id,
            result: None,
            error: Some(error),
        }
    }

    pub fn is_error(&self) -> bool {
        self.error.is_some()
    }

    /// Check the "exactly one of result/error" rule.
    pub fn is_well_formed(&self) -> bool {
        self.result.is_some() != self.error.is_some()
    }

    /// Split into the result value or the RPC error.
    pub fn into_result(self) -> Result<Value, RpcError> {
        match (self.result, self.error) {
            (_, Some(err)) => Err(err),
            (Some(value), None) => Ok(value),
            (None, None) => Err(RpcError::new(
                INTERNAL_ERROR,
                "Response missing both result and error",
            )),
        }
    }
}
