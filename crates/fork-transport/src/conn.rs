//! Connection lifecycle management for the forking transport.
//!
//! A single background task owns the upstream socket. It connects, publishes
//! readiness through a watch channel, routes outbound frames and inbound
//! responses while open, and reconnects immediately on any unexpected close.
//! Only the abort signal (or `close()`) ends the loop; that teardown closes
//! the socket with a normal-closure code and is terminal.

use std::sync::Arc;

use futures_util::{
    SinkExt, StreamExt,
    stream::{SplitSink, SplitStream},
};
use http::HeaderValue;
use tokio::{
    net::TcpStream,
    sync::{mpsc, watch},
};
use tokio_tungstenite::{
    MaybeTlsStream, WebSocketStream, connect_async,
    tungstenite::{
        Message,
        client::IntoClientRequest,
        protocol::{CloseFrame, frame::coding::CloseCode},
    },
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, trace, warn};

use crate::{
    config::ForkConfig,
    error::{ForkError, ForkResult},
    jsonrpc,
    pending::InFlightTable,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;

/// Connection lifecycle states, published to readiness waiters.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ConnState {
    /// A connect attempt is outstanding.
    Connecting,
    /// The socket is open and carrying traffic.
    Open,
    /// The last connect attempt failed; a retry follows immediately.
    ///
    /// Requests waiting on readiness observe this as a transport error.
    Failed(String),
    /// The socket dropped unexpectedly; a reconnect follows immediately.
    Closed,
    /// Terminal: the session was aborted or the handler was closed.
    Aborted,
}

/// Commands from the transport facade to the connection task.
pub(crate) enum ConnCommand {
    /// Transmit a serialized request envelope as a text frame.
    Send { frame: String },
}

/// How a driven connection ended.
enum Exit {
    /// Unexpected close; the caller reconnects.
    Dropped,
    /// Abort or shutdown; the caller must not reconnect.
    Teardown,
}

/// Background task owning the upstream connection.
pub(crate) struct ConnectionActor {
    config: Arc<ForkConfig>,
    cmd_rx: mpsc::Receiver<ConnCommand>,
    in_flight: Arc<InFlightTable>,
    state_tx: watch::Sender<ConnState>,
    abort: CancellationToken,
    shutdown: CancellationToken,
}

impl ConnectionActor {
    pub(crate) fn new(
        config: Arc<ForkConfig>,
        cmd_rx: mpsc::Receiver<ConnCommand>,
        in_flight: Arc<InFlightTable>,
        state_tx: watch::Sender<ConnState>,
        abort: CancellationToken,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            config,
            cmd_rx,
            in_flight,
            state_tx,
            abort,
            shutdown,
        }
    }

    /// Run until aborted or closed.
    ///
    /// Every unexpected close or connect failure retries immediately, with
    /// no backoff and no attempt limit, matching the behavior this layer
    /// replaces. The abort branches come first in each `select!`, so once
    /// the signal fires no further connect attempt can start.
    pub(crate) async fn run(mut self) {
        info!(url = %self.config.url, "starting forking transport");

        // `Failed` and `Closed` stay published while the next attempt runs,
        // so a request issued before the retry succeeds observes the failure
        // instead of a value that was overwritten mid-retry. A successful
        // connect re-arms readiness by publishing `Open`.
        self.state_tx.send_replace(ConnState::Connecting);

        'reconnect: loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => break 'reconnect,
                _ = self.shutdown.cancelled() => break 'reconnect,
                cmd = self.cmd_rx.recv() => match cmd {
                    // A frame raced an unexpected close; it cannot be
                    // delivered and its in-flight entry stays pending, the
                    // same orphaning the wire contract accepts for frames
                    // lost to a dropped socket.
                    Some(ConnCommand::Send { .. }) => {
                        warn!("dropping outbound frame; connection not open");
                    }
                    None => break 'reconnect,
                },
                result = connect(&self.config) => match result {
                    Ok(socket) => {
                        debug!("upstream connection open");
                        self.state_tx.send_replace(ConnState::Open);
                        match self.drive(socket).await {
                            Exit::Teardown => break 'reconnect,
                            Exit::Dropped => {
                                warn!("upstream connection dropped; reconnecting");
                                self.state_tx.send_replace(ConnState::Closed);
                            }
                        }
                    }
                    Err(error) => {
                        warn!(%error, "upstream connect failed; retrying");
                        self.state_tx.send_replace(ConnState::Failed(error.to_string()));
                    }
                },
            }
        }

        // Terminal: reject everything still in flight and refuse new work.
        self.in_flight.reject_all(ForkError::Aborted);
        self.state_tx.send_replace(ConnState::Aborted);
        info!("forking transport stopped");
    }

    /// Pump an open connection until it drops or teardown is requested.
    async fn drive(&mut self, socket: WsStream) -> Exit {
        let (mut sink, mut stream): (WsSink, SplitStream<WsStream>) = socket.split();

        loop {
            tokio::select! {
                biased;
                _ = self.abort.cancelled() => return close_normally(sink).await,
                _ = self.shutdown.cancelled() => return close_normally(sink).await,
                cmd = self.cmd_rx.recv() => match cmd {
                    Some(ConnCommand::Send { frame }) => {
                        if let Err(error) = sink.send(Message::text(frame)).await {
                            warn!(%error, "failed to transmit frame");
                            return Exit::Dropped;
                        }
                    }
                    None => {
                        debug!("handler dropped; shutting down connection");
                        return close_normally(sink).await;
                    }
                },
                message = stream.next() => match message {
                    Some(Ok(message)) => self.dispatch(message),
                    Some(Err(error)) => {
                        warn!(%error, "upstream read error");
                        return Exit::Dropped;
                    }
                    None => return Exit::Dropped,
                },
            }
        }
    }

    /// Route one inbound message to the correlation table.
    fn dispatch(&self, message: Message) {
        match message {
            Message::Text(text) => self.dispatch_frame(text.as_str()),
            Message::Binary(bytes) => match std::str::from_utf8(&bytes) {
                Ok(text) => self.dispatch_frame(text),
                Err(_) => warn!("dropping non-UTF-8 binary frame from upstream"),
            },
            // Pings are answered by the protocol layer; a close frame is
            // followed by the stream ending, which triggers the reconnect.
            Message::Ping(_) | Message::Pong(_) | Message::Close(_) | Message::Frame(_) => {}
        }
    }

    /// Pair a raw inbound frame with its in-flight entry by id.
    ///
    /// Malformed frames and frames without an id are dropped with a warning;
    /// the correlation table is never touched by them. Frames whose id
    /// matches no entry (late, duplicate, or foreign) are dropped silently.
    fn dispatch_frame(&self, raw: &str) {
        let response = match jsonrpc::Response::parse(raw) {
            Ok(response) => response,
            Err(error) => {
                warn!(%error, "dropping malformed frame from upstream");
                return;
            }
        };
        let Some(id) = response.id else {
            warn!("dropping frame without an id");
            return;
        };
        if !self.in_flight.settle(id, response.into_outcome()) {
            trace!(id, "dropping frame for unknown id");
        }
    }
}

/// Open the upstream socket with the configured endpoint, origin, and
/// headers.
async fn connect(config: &ForkConfig) -> ForkResult<WsStream> {
    let mut request = config
        .url
        .as_str()
        .into_client_request()
        .map_err(|e| ForkError::transport(e.to_string()))?;

    let headers = request.headers_mut();
    if let Some(origin) = &config.origin {
        let value = HeaderValue::from_str(origin)
            .map_err(|e| ForkError::transport(format!("invalid origin header: {e}")))?;
        headers.insert(http::header::ORIGIN, value);
    }
    for (name, value) in &config.headers {
        headers.insert(name, value.clone());
    }

    let (socket, _response) = connect_async(request)
        .await
        .map_err(|e| ForkError::transport(e.to_string()))?;
    Ok(socket)
}

/// Intentional teardown uses close code 1000 (normal closure). The close
/// confirmation is not awaited.
async fn close_normally(mut sink: WsSink) -> Exit {
    let frame = CloseFrame {
        code: CloseCode::Normal,
        reason: "fork session ended".into(),
    };
    let _ = sink.send(Message::Close(Some(frame))).await;
    Exit::Teardown
}
