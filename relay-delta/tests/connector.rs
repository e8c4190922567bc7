//! Connector tests against a local fake exchange
//!
//! Run with: cargo test -p relay-delta --test connector

use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use relay_core::{ChannelSpec, ConnectionErrorKind, ConnectionState};
use relay_delta::{DeltaCredentials, DeltaWebSocket, DeltaWebSocketConfig, UpstreamEvent};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{accept_async, WebSocketStream};

type ServerSocket = WebSocketStream<TcpStream>;

struct FakeExchange {
    url: String,
    connections: Arc<AtomicUsize>,
    /// Every JSON frame the exchange received, in order
    seen: mpsc::UnboundedReceiver<Value>,
}

async fn spawn_exchange<F, Fut>(handler: F) -> FakeExchange
where
    F: Fn(ServerSocket, mpsc::UnboundedSender<Value>, usize) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let connections = Arc::new(AtomicUsize::new(0));
    let (seen_tx, seen) = mpsc::unbounded_channel();

    let counter = Arc::clone(&connections);
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let index = counter.fetch_add(1, Ordering::SeqCst);
            if let Ok(ws) = accept_async(stream).await {
                tokio::spawn(handler(ws, seen_tx.clone(), index));
            }
        }
    });

    FakeExchange {
        url: format!("ws://{}", addr),
        connections,
        seen,
    }
}

/// Read the next JSON text frame, recording it
async fn next_json(ws: &mut ServerSocket, seen: &mpsc::UnboundedSender<Value>) -> Option<Value> {
    while let Some(Ok(message)) = ws.next().await {
        if let Message::Text(text) = message {
            let value: Value = serde_json::from_str(text.as_str()).unwrap();
            let _ = seen.send(value.clone());
            return Some(value);
        }
    }
    None
}

async fn send_json(ws: &mut ServerSocket, value: Value) {
    let _ = ws.send(Message::Text(value.to_string().into())).await;
}

/// Accepts auth, acknowledges subscriptions and pushes one ticker per subscribe
async fn cooperative(mut ws: ServerSocket, seen: mpsc::UnboundedSender<Value>, _index: usize) {
    while let Some(frame) = next_json(&mut ws, &seen).await {
        match frame["type"].as_str() {
            Some("auth") => send_json(&mut ws, json!({"type": "auth", "success": true})).await,
            Some("subscribe") => {
                send_json(
                    &mut ws,
                    json!({"type": "subscriptions", "channels": frame["payload"]["channels"]}),
                )
                .await;
                send_json(
                    &mut ws,
                    json!({"type": "v2/ticker", "symbol": "btcusd", "close": "42000.5"}),
                )
                .await;
            }
            _ => {}
        }
    }
}

/// Records frames, never answers
async fn silent(mut ws: ServerSocket, seen: mpsc::UnboundedSender<Value>, _index: usize) {
    while next_json(&mut ws, &seen).await.is_some() {}
}

/// Rejects every auth request
async fn rejecting(mut ws: ServerSocket, seen: mpsc::UnboundedSender<Value>, _index: usize) {
    while let Some(frame) = next_json(&mut ws, &seen).await {
        if frame["type"] == "auth" {
            send_json(
                &mut ws,
                json!({"type": "auth", "success": false, "message": "invalid api key"}),
            )
            .await;
        }
    }
}

/// Closes the first connection straight away, behaves on the rest
async fn flaky(mut ws: ServerSocket, seen: mpsc::UnboundedSender<Value>, index: usize) {
    if index == 0 {
        let _ = ws.close(None).await;
        return;
    }
    cooperative(ws, seen, index).await;
}

fn test_config(url: &str, credentials: Option<DeltaCredentials>) -> DeltaWebSocketConfig {
    DeltaWebSocketConfig {
        ws_url: url.to_string(),
        credentials,
        auth_timeout: Duration::from_millis(500),
        reconnect_base: Duration::from_millis(10),
        reconnect_max: Duration::from_millis(20),
        max_reconnect_attempts: 3,
        ..Default::default()
    }
}

fn credentials() -> Option<DeltaCredentials> {
    Some(DeltaCredentials::new("test-key", "test-secret"))
}

async fn wait_for<F>(events: &mut mpsc::Receiver<UpstreamEvent>, mut matches: F) -> UpstreamEvent
where
    F: FnMut(&UpstreamEvent) -> bool,
{
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            match events.recv().await {
                Some(event) if matches(&event) => return event,
                Some(_) => continue,
                None => panic!("event channel closed"),
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_open(event: &UpstreamEvent) -> bool {
    matches!(
        event,
        UpstreamEvent::State {
            state: ConnectionState::Open,
            ..
        }
    )
}

async fn next_seen(exchange: &mut FakeExchange) -> Value {
    tokio::time::timeout(Duration::from_secs(5), exchange.seen.recv())
        .await
        .expect("timed out waiting for exchange frame")
        .expect("exchange stopped")
}

#[tokio::test]
async fn authenticates_then_flushes_queued_subscriptions() {
    let mut exchange = spawn_exchange(cooperative).await;
    let (ws, mut events) = DeltaWebSocket::new(test_config(&exchange.url, credentials()));

    ws.subscribe(vec![ChannelSpec::new("v2/ticker", ["BTCUSD"])])
        .unwrap();
    ws.start().unwrap();

    let open = wait_for(&mut events, is_open).await;
    assert_eq!(
        open,
        UpstreamEvent::State {
            state: ConnectionState::Open,
            authenticated: true
        }
    );
    assert!(ws.status().authenticated);

    let auth = next_seen(&mut exchange).await;
    assert_eq!(auth["type"], "auth");
    assert_eq!(auth["payload"]["api_key"], "test-key");
    assert_eq!(auth["payload"]["signature"].as_str().unwrap().len(), 64);

    let subscribe = next_seen(&mut exchange).await;
    assert_eq!(subscribe["type"], "subscribe");
    assert_eq!(
        subscribe["payload"]["channels"],
        json!([{"name": "v2/ticker", "symbols": ["BTCUSD"]}])
    );

    let frame = wait_for(&mut events, |e| matches!(e, UpstreamEvent::Frame(_))).await;
    let UpstreamEvent::Frame(frame) = frame else {
        unreachable!()
    };
    assert_eq!(frame.channel, "v2/ticker");
    assert_eq!(frame.symbol.as_deref(), Some("BTCUSD"));
    assert_eq!(frame.payload["close"], "42000.5");

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn auth_timeout_continues_unauthenticated() {
    let exchange = spawn_exchange(silent).await;
    let mut config = test_config(&exchange.url, credentials());
    config.auth_timeout = Duration::from_millis(100);
    let (ws, mut events) = DeltaWebSocket::new(config);
    ws.start().unwrap();

    wait_for(&mut events, |e| {
        matches!(
            e,
            UpstreamEvent::State {
                state: ConnectionState::Authenticating,
                ..
            }
        )
    })
    .await;
    let open = wait_for(&mut events, is_open).await;
    assert_eq!(
        open,
        UpstreamEvent::State {
            state: ConnectionState::Open,
            authenticated: false
        }
    );
    assert!(!ws.status().authenticated);

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn public_mode_sends_only_subscription_changes() {
    let mut exchange = spawn_exchange(cooperative).await;
    let (ws, mut events) = DeltaWebSocket::new(test_config(&exchange.url, None));
    ws.start().unwrap();

    let open = wait_for(&mut events, is_open).await;
    assert_eq!(
        open,
        UpstreamEvent::State {
            state: ConnectionState::Open,
            authenticated: false
        }
    );

    let ticker = ChannelSpec::new("v2/ticker", ["ETHUSD"]);
    ws.subscribe(vec![ticker.clone()]).unwrap();
    let subscribe = next_seen(&mut exchange).await;
    assert_eq!(subscribe["type"], "subscribe");

    // Already subscribed: no second frame goes out
    ws.subscribe(vec![ticker.clone()]).unwrap();
    ws.unsubscribe(vec![ticker]).unwrap();
    let unsubscribe = next_seen(&mut exchange).await;
    assert_eq!(unsubscribe["type"], "unsubscribe");
    assert_eq!(
        unsubscribe["payload"]["channels"],
        json!([{"name": "v2/ticker", "symbols": ["ETHUSD"]}])
    );
    assert_eq!(ws.status().subscriptions, 0);

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn auth_failure_reports_error_and_stops_after_max_attempts() {
    let exchange = spawn_exchange(rejecting).await;
    let mut config = test_config(&exchange.url, credentials());
    config.max_reconnect_attempts = 2;
    let (ws, mut events) = DeltaWebSocket::new(config);
    ws.start().unwrap();

    let error = wait_for(&mut events, |e| matches!(e, UpstreamEvent::Error { .. })).await;
    match error {
        UpstreamEvent::Error { kind, message } => {
            assert_eq!(kind, ConnectionErrorKind::Auth);
            assert!(message.contains("invalid api key"));
        }
        other => panic!("unexpected event: {:?}", other),
    }

    let exhausted = wait_for(&mut events, |e| {
        matches!(e, UpstreamEvent::ReconnectExhausted { .. })
    })
    .await;
    assert_eq!(exhausted, UpstreamEvent::ReconnectExhausted { attempts: 2 });
    assert_eq!(exchange.connections.load(Ordering::SeqCst), 3);
    assert!(ws.status().exhausted);

    // A manual reconnect starts a fresh round
    ws.reconnect().unwrap();
    wait_for(&mut events, |e| {
        matches!(
            e,
            UpstreamEvent::Error {
                kind: ConnectionErrorKind::Auth,
                ..
            }
        )
    })
    .await;
    assert_eq!(exchange.connections.load(Ordering::SeqCst), 4);

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn unreachable_upstream_retries_a_bounded_number_of_times() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    drop(listener);

    let (ws, mut events) = DeltaWebSocket::new(test_config(&format!("ws://{}", addr), None));
    ws.start().unwrap();

    let mut network_errors = 0;
    let attempts = loop {
        match wait_for(&mut events, |e| {
            matches!(
                e,
                UpstreamEvent::Error { .. } | UpstreamEvent::ReconnectExhausted { .. }
            )
        })
        .await
        {
            UpstreamEvent::Error { kind, .. } => {
                assert_eq!(kind, ConnectionErrorKind::Network);
                network_errors += 1;
            }
            UpstreamEvent::ReconnectExhausted { attempts } => break attempts,
            _ => unreachable!(),
        }
    };

    assert_eq!(attempts, 3);
    // Initial attempt plus three retries
    assert_eq!(network_errors, 4);
    assert_eq!(ws.status().state, ConnectionState::Disconnected);

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn server_close_triggers_reconnect_and_resubscribe() {
    let mut exchange = spawn_exchange(flaky).await;
    let (ws, mut events) = DeltaWebSocket::new(test_config(&exchange.url, None));
    ws.subscribe(vec![ChannelSpec::new("l2_orderbook", ["BTCUSD"])])
        .unwrap();
    ws.start().unwrap();

    // Depending on timing the drop shows up as a close or a failed send
    wait_for(&mut events, |e| {
        matches!(
            e,
            UpstreamEvent::Closed { .. } | UpstreamEvent::Error { .. }
        )
    })
    .await;
    wait_for(&mut events, is_open).await;

    let mut subscribes = 0;
    while subscribes == 0 {
        if next_seen(&mut exchange).await["type"] == "subscribe" {
            subscribes += 1;
        }
    }
    assert!(exchange.connections.load(Ordering::SeqCst) >= 2);
    assert_eq!(ws.status().reconnect_attempts, 0);

    ws.shutdown().unwrap();
}

#[tokio::test]
async fn shutdown_closes_event_channel() {
    let exchange = spawn_exchange(cooperative).await;
    let (ws, mut events) = DeltaWebSocket::new(test_config(&exchange.url, None));
    ws.start().unwrap();
    wait_for(&mut events, is_open).await;

    ws.shutdown().unwrap();

    let mut last = None;
    let drained = tokio::time::timeout(Duration::from_secs(5), async {
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
    })
    .await;
    assert!(drained.is_ok());
    assert_eq!(
        last,
        Some(UpstreamEvent::State {
            state: ConnectionState::Disconnected,
            authenticated: false
        })
    );
}

#[tokio::test]
async fn start_is_idempotent() {
    let exchange = spawn_exchange(cooperative).await;
    let (ws, mut events) = DeltaWebSocket::new(test_config(&exchange.url, None));
    ws.start().unwrap();
    ws.start().unwrap();

    wait_for(&mut events, is_open).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(exchange.connections.load(Ordering::SeqCst), 1);

    ws.shutdown().unwrap();
}

async fn drain(events: &mut mpsc::Receiver<UpstreamEvent>) -> Option<UpstreamEvent> {
    let mut last = None;
    tokio::time::timeout(Duration::from_secs(1), async {
        while let Some(event) = events.recv().await {
            last = Some(event);
        }
    })
    .await
    .expect("connection task did not stop");
    last
}

#[tokio::test]
async fn shutdown_during_handshake_does_not_wait_for_timeout() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    // Accept TCP but never answer the WebSocket handshake
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((stream, _)) = listener.accept().await {
            held.push(stream);
        }
    });

    let mut config = test_config(&format!("ws://{}", addr), None);
    config.connect_timeout = Duration::from_secs(30);
    let (ws, mut events) = DeltaWebSocket::new(config);
    ws.start().unwrap();

    wait_for(&mut events, |e| {
        matches!(
            e,
            UpstreamEvent::State {
                state: ConnectionState::Connecting,
                ..
            }
        )
    })
    .await;
    ws.shutdown().unwrap();

    assert_eq!(
        drain(&mut events).await,
        Some(UpstreamEvent::State {
            state: ConnectionState::Disconnected,
            authenticated: false
        })
    );
}

#[tokio::test]
async fn shutdown_during_auth_wait_does_not_wait_for_timeout() {
    let mut exchange = spawn_exchange(silent).await;
    let mut config = test_config(&exchange.url, credentials());
    config.auth_timeout = Duration::from_secs(30);
    let (ws, mut events) = DeltaWebSocket::new(config);
    ws.start().unwrap();

    wait_for(&mut events, |e| {
        matches!(
            e,
            UpstreamEvent::State {
                state: ConnectionState::Authenticating,
                ..
            }
        )
    })
    .await;
    assert_eq!(next_seen(&mut exchange).await["type"], "auth");

    // Changes while authenticating only touch the desired set
    ws.subscribe(vec![ChannelSpec::new("v2/ticker", ["BTCUSD"])])
        .unwrap();
    ws.shutdown().unwrap();

    assert_eq!(
        drain(&mut events).await,
        Some(UpstreamEvent::State {
            state: ConnectionState::Disconnected,
            authenticated: false
        })
    );
    assert_eq!(ws.status().subscriptions, 1);
    assert_eq!(exchange.connections.load(Ordering::SeqCst), 1);
}
