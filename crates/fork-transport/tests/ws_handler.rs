//! End-to-end tests against a scripted in-process upstream node.

use std::{
    sync::{
        Arc, Mutex,
        atomic::{AtomicUsize, Ordering},
    },
    time::Duration,
};

use fork_transport::{ConnState, ForkConfig, ForkError, WsHandler};
use futures_util::{SinkExt, StreamExt};
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::{
    WebSocketStream, accept_async,
    tungstenite::{Message, protocol::frame::coding::CloseCode},
};
use tokio_util::sync::CancellationToken;

async fn bind() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

fn handler_for(url: &str) -> (WsHandler, CancellationToken) {
    let abort = CancellationToken::new();
    let handler = WsHandler::new(ForkConfig::new(url), abort.clone()).unwrap();
    (handler, abort)
}

async fn accept_ws(listener: &TcpListener) -> WebSocketStream<TcpStream> {
    let (stream, _) = listener.accept().await.unwrap();
    accept_async(stream).await.unwrap()
}

async fn next_request(ws: &mut WebSocketStream<TcpStream>) -> Value {
    loop {
        match ws.next().await.expect("upstream connection ended").unwrap() {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            _ => continue,
        }
    }
}

async fn reply(ws: &mut WebSocketStream<TcpStream>, id: &Value, result: Value) {
    let frame = json!({"jsonrpc": "2.0", "id": id, "result": result});
    ws.send(Message::text(frame.to_string())).await.unwrap();
}

async fn wait_for_state(handler: &WsHandler, pred: impl Fn(&ConnState) -> bool) {
    for _ in 0..400 {
        if pred(&handler.state()) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("state never reached; last state: {:?}", handler.state());
}

#[tokio::test]
async fn coalesces_concurrent_identical_calls() {
    let (listener, url) = bind().await;
    let hits = Arc::new(AtomicUsize::new(0));

    let server_hits = hits.clone();
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        loop {
            let request = next_request(&mut ws).await;
            server_hits.fetch_add(1, Ordering::SeqCst);
            // Hold the reply so the second caller joins the first.
            tokio::time::sleep(Duration::from_millis(50)).await;
            reply(&mut ws, &request["id"], json!("0x64")).await;
        }
    });

    let (handler, _abort) = handler_for(&url);
    let params = vec![json!("0xA")];
    let (a, b) = tokio::join!(
        handler.request("eth_getBalance", &params),
        handler.request("eth_getBalance", &params),
    );

    assert_eq!(a.unwrap(), json!("0x64"));
    assert_eq!(b.unwrap(), json!("0x64"));
    assert_eq!(hits.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn identical_calls_after_settlement_hit_the_wire_again() {
    let (listener, url) = bind().await;
    let seen_ids = Arc::new(Mutex::new(Vec::<u64>::new()));

    let server_ids = seen_ids.clone();
    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        loop {
            let request = next_request(&mut ws).await;
            server_ids
                .lock()
                .unwrap()
                .push(request["id"].as_u64().unwrap());
            reply(&mut ws, &request["id"], json!("0x64")).await;
        }
    });

    let (handler, _abort) = handler_for(&url);
    let params = vec![json!("0xA")];
    handler.request("eth_getBalance", &params).await.unwrap();
    handler.request("eth_getBalance", &params).await.unwrap();

    let ids = seen_ids.lock().unwrap().clone();
    assert_eq!(ids.len(), 2, "a settled call must not be served from cache");
    assert!(ids[0] < ids[1], "wire ids must be strictly increasing");
}

#[tokio::test]
async fn responses_pair_by_id_not_by_order() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let first = next_request(&mut ws).await;
        let second = next_request(&mut ws).await;
        // Answer in reverse order; each response echoes its own method.
        for request in [second, first] {
            let method = request["method"].clone();
            reply(&mut ws, &request["id"], method).await;
        }
    });

    let (handler, _abort) = handler_for(&url);
    let balance_params = [json!("0xA")];
    let nonce_params = [json!("0xA")];
    let (a, b) = tokio::join!(
        handler.request("eth_getBalance", &balance_params),
        handler.request("eth_getTransactionCount", &nonce_params),
    );

    assert_eq!(a.unwrap(), json!("eth_getBalance"));
    assert_eq!(b.unwrap(), json!("eth_getTransactionCount"));
}

#[tokio::test]
async fn reconnects_after_unexpected_drop() {
    let (listener, url) = bind().await;
    let seen_ids = Arc::new(Mutex::new(Vec::<u64>::new()));
    let (reconnected_tx, reconnected_rx) = tokio::sync::oneshot::channel();

    let server_ids = seen_ids.clone();
    tokio::spawn(async move {
        // First connection: answer one request, then drop without a close
        // handshake.
        let mut ws = accept_ws(&listener).await;
        let request = next_request(&mut ws).await;
        server_ids
            .lock()
            .unwrap()
            .push(request["id"].as_u64().unwrap());
        reply(&mut ws, &request["id"], json!("one")).await;
        drop(ws);

        // Second connection after the automatic reconnect.
        let mut ws = accept_ws(&listener).await;
        reconnected_tx.send(()).unwrap();
        loop {
            let request = next_request(&mut ws).await;
            server_ids
                .lock()
                .unwrap()
                .push(request["id"].as_u64().unwrap());
            reply(&mut ws, &request["id"], json!("two")).await;
        }
    });

    let (handler, _abort) = handler_for(&url);
    let first = handler.request("eth_blockNumber", &[]).await.unwrap();
    assert_eq!(first, json!("one"));

    // Wait until the automatic reconnect has completed its handshake, so the
    // next call is not lost to the dying socket.
    reconnected_rx.await.unwrap();

    let second = handler.request("eth_blockNumber", &[]).await.unwrap();
    assert_eq!(second, json!("two"), "reconnect must be caller-invisible");

    let ids = seen_ids.lock().unwrap().clone();
    assert!(
        ids[0] < ids[1],
        "wire ids must keep increasing across a reconnect"
    );
}

#[tokio::test]
async fn abort_rejects_calls_waiting_on_readiness() {
    // Accept TCP but never complete the WebSocket handshake, so the
    // connection stays in `Connecting` forever.
    let (listener, url) = bind().await;
    let (handler, abort) = handler_for(&url);

    let pending = tokio::spawn({
        let handler = handler.clone();
        async move { handler.request("eth_blockNumber", &[]).await }
    });
    tokio::time::sleep(Duration::from_millis(50)).await;

    abort.cancel();
    let err = pending.await.unwrap().unwrap_err();
    assert!(err.is_abort());

    // Terminal: no reconnect attempt may follow the abort.
    wait_for_state(&handler, |s| *s == ConnState::Aborted).await;
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert_eq!(handler.state(), ConnState::Aborted);
    drop(listener);
}

#[tokio::test]
async fn abort_closes_with_normal_code_and_rejects_in_flight() {
    let (listener, url) = bind().await;
    let (request_seen_tx, request_seen_rx) = tokio::sync::oneshot::channel();

    let upstream = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _request = next_request(&mut ws).await;
        request_seen_tx.send(()).unwrap();

        // The handler must announce teardown with a normal closure.
        loop {
            match ws.next().await.expect("expected a close frame").unwrap() {
                Message::Close(Some(frame)) => return frame.code,
                Message::Close(None) => panic!("close frame carried no code"),
                _ => continue,
            }
        }
    });

    let (handler, abort) = handler_for(&url);
    let in_flight = tokio::spawn({
        let handler = handler.clone();
        async move { handler.request("eth_getBalance", &[json!("0xA")]).await }
    });

    request_seen_rx.await.unwrap();
    assert_eq!(handler.pending_count(), 1);
    abort.cancel();

    let err = in_flight.await.unwrap().unwrap_err();
    assert!(err.is_abort(), "in-flight calls reject on abort, got {err:?}");
    assert_eq!(handler.pending_count(), 0);

    let close_code = upstream.await.unwrap();
    assert_eq!(close_code, CloseCode::Normal);
}

#[tokio::test]
async fn close_sends_normal_closure_and_is_terminal() {
    let (listener, url) = bind().await;
    let upstream = tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        loop {
            match ws.next().await.expect("expected a close frame").unwrap() {
                Message::Close(Some(frame)) => return frame.code,
                _ => continue,
            }
        }
    });

    let (handler, _abort) = handler_for(&url);
    wait_for_state(&handler, |s| *s == ConnState::Open).await;

    handler.close().await;
    assert_eq!(upstream.await.unwrap(), CloseCode::Normal);

    wait_for_state(&handler, |s| *s == ConnState::Aborted).await;
    let err = handler.request("eth_blockNumber", &[]).await.unwrap_err();
    assert!(err.is_abort());
}

#[tokio::test]
async fn unmatched_and_malformed_frames_are_dropped() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let request = next_request(&mut ws).await;

        // Noise first: invalid JSON, an id-less frame, and a frame for an id
        // nothing is waiting on. None of it may disturb the pending call.
        ws.send(Message::text("not json")).await.unwrap();
        ws.send(Message::text(r#"{"jsonrpc":"2.0","result":"0x0"}"#))
            .await
            .unwrap();
        reply(&mut ws, &json!(999_999), json!("0xdead")).await;

        reply(&mut ws, &request["id"], json!("0x64")).await;
        // Keep the connection open until the client is done.
        while ws.next().await.is_some() {}
    });

    let (handler, _abort) = handler_for(&url);
    let balance = handler
        .request("eth_getBalance", &[json!("0xA")])
        .await
        .unwrap();
    assert_eq!(balance, json!("0x64"));
    assert_eq!(handler.pending_count(), 0);
}

#[tokio::test]
async fn upstream_error_objects_propagate_as_structured_errors() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let request = next_request(&mut ws).await;
        let frame = json!({
            "jsonrpc": "2.0",
            "id": request["id"],
            "error": {"code": -32601, "message": "method not found"},
        });
        ws.send(Message::text(frame.to_string())).await.unwrap();
        while ws.next().await.is_some() {}
    });

    let (handler, _abort) = handler_for(&url);
    let err = handler
        .request("eth_unknownMethod", &[])
        .await
        .unwrap_err();
    assert_eq!(
        err,
        ForkError::Rpc {
            code: -32601,
            message: "method not found".to_string(),
            data: None,
        }
    );
}

#[tokio::test]
async fn connect_failure_rejects_with_transport_error() {
    // Reserve a port, then free it so the connect is refused.
    let (listener, url) = bind().await;
    drop(listener);

    let (handler, _abort) = handler_for(&url);
    let err = handler.request("eth_blockNumber", &[]).await.unwrap_err();
    assert!(
        matches!(err, ForkError::Transport { .. }),
        "expected a transport error, got {err:?}"
    );
    handler.close().await;
}

#[tokio::test]
async fn configured_timeout_bounds_an_unanswered_call() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let _request = next_request(&mut ws).await;
        // Never answer.
        while ws.next().await.is_some() {}
    });

    let abort = CancellationToken::new();
    let config = ForkConfig::new(&url).request_timeout(Duration::from_millis(100));
    let handler = WsHandler::new(config, abort).unwrap();

    let err = handler.request("eth_blockNumber", &[]).await.unwrap_err();
    assert!(matches!(err, ForkError::Timeout { .. }));
    assert_eq!(handler.pending_count(), 0, "timed-out entries must not leak");
}

#[tokio::test]
async fn typed_requests_decode_the_result_payload() {
    let (listener, url) = bind().await;

    tokio::spawn(async move {
        let mut ws = accept_ws(&listener).await;
        let request = next_request(&mut ws).await;
        assert_eq!(request["jsonrpc"], "2.0");
        assert_eq!(request["method"], "net_version");
        reply(&mut ws, &request["id"], json!("1")).await;
        while ws.next().await.is_some() {}
    });

    let (handler, _abort) = handler_for(&url);
    let version: String = handler.request_as("net_version", &[]).await.unwrap();
    assert_eq!(version, "1");
}
