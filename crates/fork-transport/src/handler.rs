//! The transport facade: the single public entry point combining connection
//! readiness, request coalescing, identifier correlation, and cancellation.

use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};

use futures_util::FutureExt;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;

use crate::{
    coalesce::{ReplyFuture, RequestCoalescer},
    config::ForkConfig,
    conn::{ConnCommand, ConnState, ConnectionActor},
    error::{ForkError, ForkResult},
    jsonrpc,
    pending::InFlightTable,
};

/// Forking JSON-RPC handler over a persistent WebSocket connection.
///
/// Relays calls the simulator cannot answer locally to the configured
/// upstream node. Concurrent identical calls (same method and parameters)
/// coalesce into a single wire round-trip; sequential identical calls do
/// not — this layer deduplicates requests, it never caches responses.
///
/// The handler is cheap to clone; clones share the same connection,
/// correlation table, and identifier counter. Each handler instance owns its
/// own counter and tables, so multiple fork sessions can run side by side in
/// one process without sharing state.
#[derive(Clone)]
pub struct WsHandler {
    config: Arc<ForkConfig>,
    cmd_tx: mpsc::Sender<ConnCommand>,
    state_rx: watch::Receiver<ConnState>,
    in_flight: Arc<InFlightTable>,
    coalescer: RequestCoalescer,
    /// Next wire identifier; monotonic for the lifetime of this handler,
    /// never reset across reconnects.
    next_id: Arc<AtomicU64>,
    abort: CancellationToken,
    shutdown: CancellationToken,
}

impl WsHandler {
    /// Create a handler and start connecting to the upstream node.
    ///
    /// `abort` is the session-wide cancellation signal supplied by the
    /// owning fork session; firing it rejects queued and in-flight calls and
    /// tears the connection down for good.
    pub fn new(config: ForkConfig, abort: CancellationToken) -> ForkResult<Self> {
        config.validate().map_err(ForkError::config)?;

        let config = Arc::new(config);
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_channel_capacity);
        let (state_tx, state_rx) = watch::channel(ConnState::Connecting);
        let in_flight = Arc::new(InFlightTable::new());
        let shutdown = CancellationToken::new();

        let actor = ConnectionActor::new(
            Arc::clone(&config),
            cmd_rx,
            Arc::clone(&in_flight),
            state_tx,
            abort.clone(),
            shutdown.clone(),
        );
        tokio::spawn(actor.run());

        Ok(Self {
            config,
            cmd_tx,
            state_rx,
            in_flight,
            coalescer: RequestCoalescer::new(),
            next_id: Arc::new(AtomicU64::new(1)),
            abort,
            shutdown,
        })
    }

    /// Relay a JSON-RPC call to the upstream node.
    ///
    /// Waits for the connection to be open, joins an identical in-flight
    /// call if one exists, and otherwise assigns the next wire identifier
    /// and performs the round-trip. Resolves with the upstream `result`
    /// payload, or rejects with a [`ForkError`] — callers never see raw
    /// socket failures.
    pub async fn request(&self, method: &str, params: &[Value]) -> ForkResult<Value> {
        if self.teardown_started() {
            return Err(ForkError::Aborted);
        }
        self.await_open().await?;

        let key = jsonrpc::signature(method, params)?;
        let reply = self
            .coalescer
            .join(key, || self.perform_send(method, params));
        reply.await
    }

    /// Relay a call and decode the `result` payload into `T`.
    pub async fn request_as<T: DeserializeOwned>(
        &self,
        method: &str,
        params: &[Value],
    ) -> ForkResult<T> {
        let value = self.request(method, params).await?;
        serde_json::from_value(value).map_err(|e| ForkError::serialization(e.to_string()))
    }

    /// Shut the handler down.
    ///
    /// Idempotent; resolves immediately without waiting for the close
    /// confirmation. The connection is closed with a normal-closure code and
    /// never re-established; pending calls reject with the abort error.
    pub async fn close(&self) {
        self.shutdown.cancel();
    }

    /// Current connection lifecycle state.
    pub fn state(&self) -> ConnState {
        self.state_rx.borrow().clone()
    }

    /// Number of requests on the wire awaiting a response.
    pub fn pending_count(&self) -> usize {
        self.in_flight.len()
    }

    /// Number of distinct call signatures currently in flight.
    pub fn coalesced_count(&self) -> usize {
        self.coalescer.len()
    }

    fn teardown_started(&self) -> bool {
        self.abort.is_cancelled() || self.shutdown.is_cancelled()
    }

    /// Wait for the current readiness signal.
    ///
    /// `Connecting` and `Closed` are transient; the first settled state
    /// decides the outcome. A failed connect rejects the calls that were
    /// waiting on that attempt — they are not retried here, the caller must
    /// issue the request again.
    async fn await_open(&self) -> ForkResult<()> {
        let mut state_rx = self.state_rx.clone();
        loop {
            {
                let state = state_rx.borrow_and_update();
                match &*state {
                    ConnState::Open => return Ok(()),
                    ConnState::Failed(message) => return Err(ForkError::transport(message)),
                    ConnState::Aborted => return Err(ForkError::Aborted),
                    ConnState::Connecting | ConnState::Closed => {}
                }
            }
            if state_rx.changed().await.is_err() {
                return Err(ForkError::Aborted);
            }
        }
    }

    /// Build the send future for a fresh (non-coalesced) call.
    ///
    /// Abort is re-checked inside the future: a session can be torn down
    /// between the readiness wait and the send. The in-flight entry is
    /// removed on every exit path that will never see a response.
    fn perform_send(&self, method: &str, params: &[Value]) -> ReplyFuture {
        let abort = self.abort.clone();
        let shutdown = self.shutdown.clone();
        let in_flight = Arc::clone(&self.in_flight);
        let cmd_tx = self.cmd_tx.clone();
        let next_id = Arc::clone(&self.next_id);
        let timeout = self.config.request_timeout;
        let method = method.to_owned();
        let params = params.to_vec();

        async move {
            if abort.is_cancelled() || shutdown.is_cancelled() {
                return Err(ForkError::Aborted);
            }

            let id = next_id.fetch_add(1, Ordering::Relaxed);
            let frame = jsonrpc::Request::new(id, &method, &params).to_text()?;
            let rx = in_flight.register(id);

            if cmd_tx.send(ConnCommand::Send { frame }).await.is_err() {
                // The connection task only goes away on teardown.
                in_flight.forget(id);
                return Err(ForkError::Aborted);
            }

            let settled = async {
                match rx.await {
                    Ok(outcome) => outcome,
                    Err(_) => Err(ForkError::Aborted),
                }
            };
            match timeout {
                None => settled.await,
                Some(limit) => match tokio::time::timeout(limit, settled).await {
                    Ok(outcome) => outcome,
                    Err(_) => {
                        in_flight.forget(id);
                        Err(ForkError::timeout(limit))
                    }
                },
            }
        }
        .boxed()
    }
}
