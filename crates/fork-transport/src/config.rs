//! Forking transport configuration.
//!
//! The endpoint URL, `Origin` header, and any extra headers (auth tokens and
//! the like) are assembled by the owning simulator's configuration layer;
//! this struct only carries them to the connection.

use std::time::Duration;

use http::{HeaderMap, HeaderName, HeaderValue};

/// Configuration for the forking WebSocket connection.
#[derive(Clone, Debug)]
pub struct ForkConfig {
    /// Upstream endpoint URL (`ws://` or `wss://`).
    pub url: String,
    /// Value for the `Origin` header, if any.
    pub origin: Option<String>,
    /// Additional headers sent with the connection handshake.
    pub headers: HeaderMap,
    /// Optional deadline for a single in-flight request.
    ///
    /// `None` preserves the upstream-waits-forever behavior of the original
    /// handler; setting a deadline is an explicit hardening knob.
    pub request_timeout: Option<Duration>,
    /// Capacity of the channel carrying outbound frames to the connection.
    pub command_channel_capacity: usize,
}

impl ForkConfig {
    /// Create a configuration for the given upstream URL.
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            origin: None,
            headers: HeaderMap::new(),
            request_timeout: None,
            command_channel_capacity: 64,
        }
    }

    /// Set the `Origin` header value.
    #[must_use]
    pub fn origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = Some(origin.into());
        self
    }

    /// Add a handshake header.
    #[must_use]
    pub fn header(mut self, name: HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    /// Replace the handshake header set.
    #[must_use]
    pub fn headers(mut self, headers: HeaderMap) -> Self {
        self.headers = headers;
        self
    }

    /// Set the per-request deadline.
    #[must_use]
    pub fn request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// Set the outbound command channel capacity.
    #[must_use]
    pub fn command_channel_capacity(mut self, capacity: usize) -> Self {
        self.command_channel_capacity = capacity;
        self
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), String> {
        if self.url.is_empty() {
            return Err("URL cannot be empty".to_string());
        }
        let url = url::Url::parse(&self.url).map_err(|e| format!("invalid URL: {e}"))?;
        if !matches!(url.scheme(), "ws" | "wss") {
            return Err(format!("URL scheme must be ws or wss, got {}", url.scheme()));
        }
        if self.request_timeout.is_some_and(|t| t.is_zero()) {
            return Err("Request timeout must be > 0".to_string());
        }
        if self.command_channel_capacity == 0 {
            return Err("Command channel capacity must be > 0".to_string());
        }
        Ok(())
    }
}
