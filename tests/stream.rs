//! Integration tests for [`KalshiStream`] against an in-process WebSocket
//! server.
//!
//! Each test binds a `tokio-tungstenite` server on `127.0.0.1:0`, points a
//! stream at it, and inspects the frames the client writes. No network access
//! is needed.
//!
//! # What is tested
//!
//! - **Replay**: subscriptions made before `connect()` are sent on open
//! - **Reference counting**: shared pairs unsubscribe only on last release
//! - **Reconnect**: replay precedes requests buffered during the outage,
//!   reflects changes made while offline, and backoff restarts after success
//! - **Dispatch**: data, ack and error frames reach their listeners
//! - **Resilience**: bad frames and panicking listeners leave the link up
//! - **Lifecycle**: in-flight connects, failed connects, `close()` (also
//!   mid-handshake), attempt limits and keepalive

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use futures_util::{SinkExt, StreamExt};
use kalshi_stream::constants::channels;
use kalshi_stream::ws::{ConnectionState, KalshiStream, KalshiStreamBuilder, ListenerHandle};
use kalshi_stream::KalshiError;
use serde_json::{Value, json};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{WebSocketStream, accept_async};

/// Upper bound for anything a test waits on.
const WAIT: Duration = Duration::from_secs(5);

type ServerWs = WebSocketStream<TcpStream>;

// ---------------------------------------------------------------------------
// Harness
// ---------------------------------------------------------------------------

struct MockServer {
    url: String,
    accepted: mpsc::UnboundedReceiver<ServerWs>,
    acceptor: JoinHandle<()>,
}

impl MockServer {
    async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, accepted) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                if let Ok(ws) = accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            url,
            accepted,
            acceptor,
        }
    }

    /// Wait for the next client connection.
    async fn next_conn(&mut self) -> ServerWs {
        timeout(WAIT, self.accepted.recv())
            .await
            .expect("timed out waiting for a connection")
            .expect("acceptor stopped")
    }

    /// Assert that no new connection arrives within `window`.
    async fn assert_no_conn(&mut self, window: Duration) {
        assert!(
            timeout(window, self.accepted.recv()).await.is_err(),
            "unexpected connection"
        );
    }

    /// Drop the listener so further connects are refused.
    fn stop_accepting(&self) {
        self.acceptor.abort();
    }

    /// Like [`MockServer::start`], but the next `refuse` TCP connections
    /// (counted from whenever the counter is raised) are dropped before the
    /// WebSocket handshake.
    async fn start_flaky(refuse: Arc<AtomicUsize>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("ws://{}", listener.local_addr().unwrap());
        let (tx, accepted) = mpsc::unbounded_channel();
        let acceptor = tokio::spawn(async move {
            while let Ok((tcp, _)) = listener.accept().await {
                let refused = refuse
                    .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                    .is_ok();
                if refused {
                    drop(tcp);
                    continue;
                }
                if let Ok(ws) = accept_async(tcp).await {
                    if tx.send(ws).is_err() {
                        break;
                    }
                }
            }
        });
        Self {
            url,
            accepted,
            acceptor,
        }
    }
}

/// Poll until `reconnect_count()` reaches `n`.
async fn wait_reconnects(stream: &KalshiStream, n: u64) {
    timeout(WAIT, async {
        while stream.reconnect_count() < n {
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("timed out waiting for reconnect");
}

fn stream_for(server: &MockServer) -> KalshiStream {
    KalshiStreamBuilder::new()
        .url(&server.url)
        .base_delay(Duration::from_millis(50))
        .max_delay(Duration::from_millis(200))
        .connect_timeout(Duration::from_secs(2))
        .ping_interval(None)
        .build()
}

/// Next text frame from the client, parsed as JSON.
async fn next_json(ws: &mut ServerWs) -> Value {
    loop {
        let msg = timeout(WAIT, ws.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("client closed the connection")
            .expect("websocket error");
        if let Message::Text(text) = msg {
            return serde_json::from_str(text.as_str()).unwrap();
        }
    }
}

async fn push(ws: &mut ServerWs, frame: Value) {
    ws.send(Message::Text(frame.to_string().into())).await.unwrap();
}

async fn wait_state(stream: &KalshiStream, mut pred: impl FnMut(&ConnectionState) -> bool) {
    let mut rx = stream.state_changes();
    timeout(WAIT, rx.wait_for(|s| pred(s)))
        .await
        .expect("timed out waiting for state")
        .expect("state sender dropped");
}

fn collect(stream: &KalshiStream, kind: &str) -> (ListenerHandle, mpsc::UnboundedReceiver<Value>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let handle = stream.on(kind, move |payload| {
        let _ = tx.send(payload.clone());
    });
    (handle, rx)
}

async fn recv(rx: &mut mpsc::UnboundedReceiver<Value>) -> Value {
    timeout(WAIT, rx.recv())
        .await
        .expect("timed out waiting for a payload")
        .expect("listener dropped")
}

/// `(channel, ticker)` pairs covered by subscribe frames.
fn pairs(frames: &[Value]) -> BTreeSet<(String, Option<String>)> {
    let mut out = BTreeSet::new();
    for f in frames {
        let chans = f["channels"].as_array().unwrap();
        for c in chans {
            let c = c.as_str().unwrap().to_owned();
            match f.get("market_tickers").and_then(Value::as_array) {
                None => {
                    out.insert((c.clone(), None));
                }
                Some(ts) => {
                    for t in ts {
                        out.insert((c.clone(), Some(t.as_str().unwrap().to_owned())));
                    }
                }
            }
        }
    }
    out
}

// ---------------------------------------------------------------------------
// Subscriptions
// ---------------------------------------------------------------------------

#[tokio::test]
async fn subscriptions_made_before_connect_are_replayed_on_open() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();

    stream.connect().await.unwrap();
    assert!(stream.is_connected());

    let mut ws = server.next_conn().await;
    assert_eq!(
        next_json(&mut ws).await,
        json!({"command": "subscribe", "channels": ["ticker"], "market_tickers": ["FOO"]})
    );
    stream.close().await;
}

#[tokio::test]
async fn subscribe_while_connected_is_sent_immediately() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    stream.subscribe(&["fill"], None).unwrap();
    assert_eq!(
        next_json(&mut ws).await,
        json!({"command": "subscribe", "channels": ["fill"]})
    );
    stream.close().await;
}

#[tokio::test]
async fn shared_pair_unsubscribes_only_after_last_holder() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    // Two independent consumers want the same pair.
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();
    stream.unsubscribe(&["ticker"], Some(&["FOO"])).unwrap();
    stream.send(&json!({"id": "marker"})).unwrap();
    stream.unsubscribe(&["ticker"], Some(&["FOO"])).unwrap();

    assert_eq!(next_json(&mut ws).await["command"], "subscribe");
    // Nothing was sent for the first unsubscribe.
    assert_eq!(next_json(&mut ws).await, json!({"id": "marker"}));
    assert_eq!(
        next_json(&mut ws).await,
        json!({"command": "unsubscribe", "channels": ["ticker"], "market_tickers": ["FOO"]})
    );
    assert!(stream.active_subscriptions().is_empty());
    stream.close().await;
}

#[tokio::test]
async fn reconnect_replays_before_flushing_buffered_requests() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();
    stream.subscribe(&["fill"], None).unwrap();
    stream.connect().await.unwrap();

    let mut first = server.next_conn().await;
    let initial = vec![next_json(&mut first).await, next_json(&mut first).await];
    let expected = BTreeSet::from([
        ("fill".to_owned(), None),
        ("ticker".to_owned(), Some("FOO".to_owned())),
    ]);
    assert_eq!(pairs(&initial), expected);

    // Server drops the link; a request made during the outage is buffered.
    first.close(None).await.unwrap();
    drop(first);
    wait_state(&stream, |s| *s != ConnectionState::Connected).await;
    stream.send(&json!({"id": 7, "cmd": "list_subscriptions"})).unwrap();

    let mut second = server.next_conn().await;
    let replay = vec![next_json(&mut second).await, next_json(&mut second).await];
    assert_eq!(pairs(&replay), expected);
    assert!(replay.iter().all(|f| f["command"] == "subscribe"));
    assert_eq!(
        next_json(&mut second).await,
        json!({"id": 7, "cmd": "list_subscriptions"})
    );

    wait_state(&stream, |s| *s == ConnectionState::Connected).await;
    assert_eq!(stream.reconnect_count(), 1);
    let counts: Vec<usize> = stream.active_subscriptions().iter().map(|e| e.ref_count).collect();
    assert_eq!(counts, vec![1, 1]);
    stream.close().await;
}

#[tokio::test]
async fn replay_reflects_changes_made_while_offline() {
    let mut server = MockServer::start().await;
    let stream = KalshiStreamBuilder::new()
        .url(&server.url)
        .base_delay(Duration::from_millis(300))
        .ping_interval(None)
        .build();
    stream.subscribe(&["trade"], Some(&["A"])).unwrap();
    stream.connect().await.unwrap();

    let mut first = server.next_conn().await;
    assert_eq!(
        next_json(&mut first).await,
        json!({"command": "subscribe", "channels": ["trade"], "market_tickers": ["A"]})
    );

    first.close(None).await.unwrap();
    drop(first);
    wait_state(&stream, |s| *s != ConnectionState::Connected).await;

    // Swap A for B before the link comes back.
    stream.unsubscribe(&["trade"], Some(&["A"])).unwrap();
    stream.subscribe(&["trade"], Some(&["B"])).unwrap();
    stream.send(&json!({"id": "marker"})).unwrap();

    let mut second = server.next_conn().await;
    assert_eq!(
        next_json(&mut second).await,
        json!({"command": "subscribe", "channels": ["trade"], "market_tickers": ["B"]})
    );
    // No stale unsubscribe for A, and no subscribe for it either.
    assert_eq!(next_json(&mut second).await, json!({"id": "marker"}));
    stream.close().await;
}

#[tokio::test]
async fn backoff_restarts_after_a_successful_reconnect() {
    let refuse = Arc::new(AtomicUsize::new(0));
    let mut server = MockServer::start_flaky(Arc::clone(&refuse)).await;
    let stream = KalshiStreamBuilder::new()
        .url(&server.url)
        .base_delay(Duration::from_millis(150))
        .max_delay(Duration::from_secs(10))
        .ping_interval(None)
        .build();
    stream.connect().await.unwrap();
    let mut first = server.next_conn().await;

    // Two refused attempts (150ms, 300ms) before the third (600ms) lands.
    refuse.store(2, Ordering::SeqCst);
    first.close(None).await.unwrap();
    drop(first);
    let mut second = server.next_conn().await;
    wait_reconnects(&stream, 1).await;
    assert_eq!(refuse.load(Ordering::SeqCst), 0);

    // The next drop starts again from the base delay, not from 1200ms.
    let started = Instant::now();
    second.close(None).await.unwrap();
    drop(second);
    let _third = server.next_conn().await;
    assert!(
        started.elapsed() < Duration::from_millis(800),
        "reconnect took {:?}",
        started.elapsed()
    );
    wait_reconnects(&stream, 2).await;
    assert_eq!(stream.reconnect_count(), 2);
    stream.close().await;
}

// ---------------------------------------------------------------------------
// Dispatch
// ---------------------------------------------------------------------------

#[tokio::test]
async fn trade_payload_reaches_its_listener_once() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    let (_handle, mut trades) = collect(&stream, channels::TRADE);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    push(&mut ws, json!({"type": "trade", "data": {"ticker": "FOO", "price": 52}})).await;

    assert_eq!(recv(&mut trades).await, json!({"ticker": "FOO", "price": 52}));
    push(&mut ws, json!({"type": "ticker", "data": {"ticker": "FOO"}})).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(trades.try_recv().is_err());
    stream.close().await;
}

#[tokio::test]
async fn acknowledgements_and_errors_are_dispatched() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    let (_acks, mut acks) = collect(&stream, channels::SUBSCRIBED);
    let (_errors, mut errors) = collect(&stream, channels::ERROR);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    push(&mut ws, json!({"type": "subscribed", "channels": ["ticker", "trade"]})).await;
    push(&mut ws, json!({"type": "error", "msg": {"code": 6, "msg": "Unknown channel"}})).await;

    let ack = recv(&mut acks).await;
    assert_eq!(ack["channels"], json!(["ticker", "trade"]));
    let err = recv(&mut errors).await;
    assert_eq!(err["msg"]["code"], 6);
    assert!(stream.is_connected());
    stream.close().await;
}

#[tokio::test]
async fn malformed_frame_does_not_break_the_connection() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    let (_handle, mut tickers) = collect(&stream, channels::TICKER);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    ws.send(Message::Text("not json {".into())).await.unwrap();
    push(&mut ws, json!({"data": {"no": "type"}})).await;
    push(&mut ws, json!({"type": "ticker", "data": {"ticker": "FOO", "yes_bid": 40}})).await;

    assert_eq!(recv(&mut tickers).await["yes_bid"], 40);
    assert!(stream.is_connected());
    assert_eq!(stream.reconnect_count(), 0);
    stream.close().await;
}

#[tokio::test]
async fn panicking_listener_is_isolated() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    let _bad = stream.on(channels::FILL, |_| panic!("listener bug"));
    let (_good, mut fills) = collect(&stream, channels::FILL);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    push(&mut ws, json!({"type": "fill", "data": {"order_id": "a"}})).await;
    push(&mut ws, json!({"type": "fill", "data": {"order_id": "b"}})).await;

    assert_eq!(recv(&mut fills).await["order_id"], "a");
    assert_eq!(recv(&mut fills).await["order_id"], "b");
    assert!(stream.is_connected());
    stream.close().await;
}

#[tokio::test]
async fn released_listener_stops_receiving() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    let calls = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&calls);
    let handle = stream.on(channels::TRADE, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });
    let (_other, mut trades) = collect(&stream, channels::TRADE);
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    push(&mut ws, json!({"type": "trade", "data": {"n": 1}})).await;
    recv(&mut trades).await;
    assert!(handle.release());

    push(&mut ws, json!({"type": "trade", "data": {"n": 2}})).await;
    recv(&mut trades).await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(!handle.release());
    stream.close().await;
}

// ---------------------------------------------------------------------------
// Lifecycle
// ---------------------------------------------------------------------------

#[tokio::test]
async fn second_connect_while_connecting_fails_fast() {
    // Accepts TCP but never completes the WebSocket handshake.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let _hold = tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((sock, _)) = listener.accept().await {
            held.push(sock);
        }
    });

    let stream = KalshiStreamBuilder::new()
        .url(format!("ws://{addr}"))
        .connect_timeout(Duration::from_millis(500))
        .ping_interval(None)
        .build();

    let racer = stream.clone();
    let first = tokio::spawn(async move { racer.connect().await });
    wait_state(&stream, |s| *s == ConnectionState::Connecting).await;

    assert!(matches!(
        stream.connect().await,
        Err(KalshiError::ConnectInFlight)
    ));
    assert!(matches!(
        first.await.unwrap(),
        Err(KalshiError::ConnectTimeout(_))
    ));
    assert_eq!(stream.state(), ConnectionState::Disconnected);
}

#[tokio::test]
async fn failed_connect_is_returned_to_the_caller() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let stream = KalshiStreamBuilder::new()
        .url(format!("ws://{addr}"))
        .ping_interval(None)
        .build();
    stream.subscribe(&["ticker"], None).unwrap();

    assert!(stream.connect().await.is_err());
    assert_eq!(stream.state(), ConnectionState::Disconnected);
    assert_eq!(stream.active_subscriptions().len(), 1);
}

#[tokio::test]
async fn connect_when_connected_is_a_noop() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.connect().await.unwrap();
    let _ws = server.next_conn().await;

    stream.connect().await.unwrap();
    server.assert_no_conn(Duration::from_millis(300)).await;
    assert!(stream.is_connected());
    stream.close().await;
}

#[tokio::test]
async fn close_stops_reconnecting_and_keeps_subscriptions() {
    let mut server = MockServer::start().await;
    let stream = stream_for(&server);
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;
    next_json(&mut ws).await;

    stream.close().await;
    assert_eq!(stream.state(), ConnectionState::Disconnected);

    // The client said goodbye and does not come back on its own.
    let end = timeout(WAIT, ws.next()).await.expect("client did not close");
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    server.assert_no_conn(Duration::from_millis(500)).await;
    assert_eq!(stream.active_subscriptions().len(), 1);

    // A later connect picks the ledger back up.
    stream.connect().await.unwrap();
    let mut again = server.next_conn().await;
    assert_eq!(next_json(&mut again).await["market_tickers"], json!(["FOO"]));
    stream.close().await;
}

#[tokio::test]
async fn close_during_handshake_does_not_override_newer_connect() {
    // The first connection's handshake is held back; later ones complete
    // straight away.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen) = mpsc::unbounded_channel();
    let (tx, mut accepted) = mpsc::unbounded_channel();
    let _acceptor = tokio::spawn(async move {
        let mut index = 0usize;
        while let Ok((tcp, _)) = listener.accept().await {
            let _ = seen_tx.send(index);
            let delay = if index == 0 {
                Duration::from_millis(500)
            } else {
                Duration::ZERO
            };
            let tx = tx.clone();
            tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Ok(ws) = accept_async(tcp).await {
                    let _ = tx.send((index, ws));
                }
            });
            index += 1;
        }
    });

    let stream = KalshiStreamBuilder::new()
        .url(format!("ws://{addr}"))
        .connect_timeout(Duration::from_secs(2))
        .ping_interval(None)
        .build();

    let racer = stream.clone();
    let first = tokio::spawn(async move { racer.connect().await });
    assert_eq!(timeout(WAIT, seen.recv()).await.unwrap(), Some(0));

    stream.close().await;
    assert_eq!(stream.state(), ConnectionState::Disconnected);
    stream.connect().await.unwrap();
    stream.subscribe(&["ticker"], Some(&["FOO"])).unwrap();

    // The abandoned handshake finishes later and must not take over.
    let abandoned = timeout(WAIT, first).await.unwrap().unwrap();
    assert!(matches!(abandoned, Err(KalshiError::Closed)));
    assert_eq!(stream.state(), ConnectionState::Connected);

    let (index, mut live) = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(index, 1);
    assert_eq!(
        next_json(&mut live).await,
        json!({"command": "subscribe", "channels": ["ticker"], "market_tickers": ["FOO"]})
    );

    let (index, mut stale) = timeout(WAIT, accepted.recv()).await.unwrap().unwrap();
    assert_eq!(index, 0);
    let end = timeout(WAIT, stale.next()).await.expect("stale socket left open");
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));

    // Only one socket task is running, so one close() ends everything.
    stream.close().await;
    assert_eq!(stream.state(), ConnectionState::Disconnected);
    let end = timeout(WAIT, live.next()).await.expect("live socket left open");
    assert!(matches!(end, None | Some(Ok(Message::Close(_))) | Some(Err(_))));
    assert!(timeout(Duration::from_millis(300), seen.recv()).await.is_err());
}

#[tokio::test]
async fn gives_up_after_attempt_limit() {
    let mut server = MockServer::start().await;
    let stream = KalshiStreamBuilder::new()
        .url(&server.url)
        .base_delay(Duration::from_millis(20))
        .max_attempts(Some(2))
        .ping_interval(None)
        .build();
    stream.connect().await.unwrap();
    let mut ws = server.next_conn().await;

    server.stop_accepting();
    ws.close(None).await.unwrap();
    drop(ws);

    wait_state(&stream, |s| *s == ConnectionState::Disconnected).await;
    assert_eq!(stream.reconnect_count(), 0);
}

#[tokio::test]
async fn silent_server_triggers_keepalive_reconnect() {
    let mut server = MockServer::start().await;
    let stream = KalshiStreamBuilder::new()
        .url(&server.url)
        .base_delay(Duration::from_millis(20))
        .ping_interval(Some(Duration::from_millis(100)))
        .pong_timeout(Duration::from_millis(100))
        .build();
    stream.connect().await.unwrap();

    // Never read from the first connection, so pings go unanswered.
    let _silent = server.next_conn().await;
    let _second = server.next_conn().await;
    wait_state(&stream, |s| *s == ConnectionState::Connected).await;
    assert!(stream.reconnect_count() >= 1);
    stream.close().await;
}
