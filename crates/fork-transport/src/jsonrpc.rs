//! JSON-RPC 2.0 wire codec for the forking transport.
//!
//! Only the envelope is handled here; pairing a response to the request that
//! produced it is decided by `id` equality alone, never by arrival order.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{ForkError, ForkResult};

/// Protocol version tag carried by every envelope.
pub const VERSION: &str = "2.0";

/// An outbound request envelope.
#[derive(Debug, Serialize)]
pub struct Request<'a> {
    pub jsonrpc: &'static str,
    pub id: u64,
    pub method: &'a str,
    pub params: &'a [Value],
}

impl<'a> Request<'a> {
    /// Build a request envelope for the given wire identifier.
    pub fn new(id: u64, method: &'a str, params: &'a [Value]) -> Self {
        Self {
            jsonrpc: VERSION,
            id,
            method,
            params,
        }
    }

    /// Serialize the envelope to the text frame sent on the wire.
    pub fn to_text(&self) -> ForkResult<String> {
        serde_json::to_string(self).map_err(|e| ForkError::serialization(e.to_string()))
    }
}

/// A structured error object from a JSON-RPC error envelope.
#[derive(Clone, Debug, Deserialize, PartialEq)]
pub struct ErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Option<Value>,
}

/// An inbound response envelope, parsed tolerantly.
///
/// `id` is `None` for frames that carry no identifier (or a `null` one);
/// such frames can never match an in-flight entry and are dropped by the
/// dispatcher.
#[derive(Debug, Deserialize)]
pub struct Response {
    #[serde(default)]
    pub id: Option<u64>,
    #[serde(default)]
    pub result: Option<Value>,
    #[serde(default)]
    pub error: Option<ErrorObject>,
}

impl Response {
    /// Parse a raw inbound frame.
    pub fn parse(raw: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(raw)
    }

    /// Convert the envelope into the outcome that settles the pending call.
    pub fn into_outcome(self) -> ForkResult<Value> {
        match self.error {
            Some(error) => Err(ForkError::Rpc {
                code: error.code,
                message: error.message,
                data: error.data,
            }),
            None => Ok(self.result.unwrap_or(Value::Null)),
        }
    }
}

/// Derive the coalescing key for a call.
///
/// Deterministic over (method, ordered params); never transmitted. Two calls
/// with the same signature issued while one is outstanding share a single
/// wire round-trip.
pub fn signature(method: &str, params: &[Value]) -> ForkResult<String> {
    #[derive(Serialize)]
    struct CallSignature<'a> {
        method: &'a str,
        params: &'a [Value],
    }
    serde_json::to_string(&CallSignature { method, params })
        .map_err(|e| ForkError::serialization(e.to_string()))
}
