//! Forking transport layer for a local chain simulator.
//!
//! When the simulator is forked from a live network, calls it cannot answer
//! locally (the requested state predates the fork point) are relayed to a
//! remote upstream node over a persistent WebSocket connection and answered
//! as if they were local.
//!
//! The hard part is not the JSON-RPC payloads; it is keeping a reliable,
//! deduplicating, asynchronous RPC client alive on top of an unreliable,
//! long-lived, message-oriented connection:
//!
//! - **Correlation**: every outgoing call gets a monotonically increasing
//!   wire identifier; responses pair by identifier equality only, never by
//!   arrival order.
//! - **Coalescing**: concurrent identical calls (same method + parameters)
//!   share a single wire round-trip. Deduplication only — once a call
//!   settles, the next identical call hits the wire again.
//! - **Lifecycle**: the connection reconnects immediately on any unexpected
//!   close, and tears down with a normal-closure code when the session-wide
//!   abort signal fires.
//!
//! # Example
//!
//! ```rust,no_run
//! use fork_transport::{ForkConfig, WsHandler};
//! use serde_json::json;
//! use tokio_util::sync::CancellationToken;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let abort = CancellationToken::new();
//!     let config = ForkConfig::new("wss://mainnet.example.com").origin("http://localhost:8545");
//!     let handler = WsHandler::new(config, abort.clone())?;
//!
//!     let balance = handler
//!         .request("eth_getBalance", &[json!("0xA"), json!("latest")])
//!         .await?;
//!     println!("balance: {balance}");
//!
//!     handler.close().await;
//!     Ok(())
//! }
//! ```

mod coalesce;
pub mod config;
pub mod conn;
pub mod error;
mod handler;
pub mod jsonrpc;
mod pending;

pub use config::ForkConfig;
pub use conn::ConnState;
pub use error::{ForkError, ForkResult};
pub use handler::WsHandler;
