//! Error handling for the forking transport layer.

use std::time::Duration;

use serde_json::Value;
use thiserror::Error;

/// The result type used throughout the forking transport.
pub type ForkResult<T> = Result<T, ForkError>;

/// Errors surfaced to callers of the forking transport.
///
/// Callers never observe raw socket-level failures; every error is folded
/// into one of these variants before it settles a pending call. The type is
/// `Clone` because coalesced callers all receive the same settled error.
#[derive(Clone, Debug, Error, PartialEq)]
pub enum ForkError {
    /// The fork session was torn down before or during the call.
    ///
    /// Distinguishable from every other variant so callers can special-case
    /// graceful shutdown.
    #[error("forking request aborted")]
    Aborted,

    /// The connection failed to open, or errored before opening.
    #[error("transport error: {message}")]
    Transport { message: String },

    /// The upstream node answered with a structured JSON-RPC error.
    #[error("upstream error {code}: {message}")]
    Rpc {
        code: i64,
        message: String,
        data: Option<Value>,
    },

    /// The caller's own payload could not be encoded, or a resolved result
    /// could not be decoded into the requested type.
    #[error("serialization error: {message}")]
    Serialization { message: String },

    /// The handler was constructed with an invalid configuration.
    #[error("configuration error: {message}")]
    Config { message: String },

    /// The optional per-request deadline elapsed with no matching response.
    #[error("request timed out after {duration:?}")]
    Timeout { duration: Duration },
}

impl ForkError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport {
            message: message.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(message: impl Into<String>) -> Self {
        Self::Serialization {
            message: message.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
        }
    }

    /// Create a timeout error.
    pub fn timeout(duration: Duration) -> Self {
        Self::Timeout { duration }
    }

    /// Whether this error came from session teardown.
    pub fn is_abort(&self) -> bool {
        matches!(self, Self::Aborted)
    }
}
