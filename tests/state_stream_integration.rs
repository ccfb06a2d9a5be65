//! End-to-end tests: real server, real WebSocket clients.
//!
//! Spins up the axum router the binary uses, feeds deltas through the
//! aggregator, and asserts what clients actually receive on the wire.

use std::sync::Arc;
use std::time::Duration;

use axum::{middleware as axum_mw, routing::get, Router};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Map, Value};
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use tradedeck_backend::aggregator::Aggregator;
use tradedeck_backend::api::{self, AppState};
use tradedeck_backend::config::Config;
use tradedeck_backend::middleware::logging::request_logging;
use tradedeck_backend::models::{
    MarketQuote, Order, OrderSide, OrderStatus, PriceLevel, StateDelta,
};
use tradedeck_backend::protocol;
use tradedeck_backend::session::{ws_handler, SessionRegistry};

const ORIGIN: &str = "http://localhost:3000";

struct TestServer {
    addr: String,
    aggregator: Arc<Aggregator>,
    sessions: Arc<SessionRegistry>,
    shutdown_tx: watch::Sender<bool>,
    aggregator_handle: JoinHandle<()>,
    server_handle: JoinHandle<()>,
}

async fn start_server() -> TestServer {
    let mut config = Config::default();
    config.web_interval = Duration::from_millis(20);
    config.tui_interval = Duration::from_millis(40);
    let config = Arc::new(config);

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let (aggregator, aggregator_handle) = Aggregator::spawn(
        config.order_retention,
        config.order_book_depth,
        shutdown_rx.clone(),
    );

    let sessions = SessionRegistry::new();
    let (_ready_tx, ready_rx) = {
        let (tx, rx) = watch::channel(true);
        (tx, rx)
    };

    let prometheus = metrics_exporter_prometheus::PrometheusBuilder::new().build_recorder();

    let state = AppState {
        config: config.clone(),
        aggregator: aggregator.clone(),
        sessions: sessions.clone(),
        ready: ready_rx,
        prometheus: prometheus.handle(),
    };

    let app = Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(api::health))
        .route("/ready", get(api::ready))
        .route("/debug", get(api::debug_state))
        .layer(axum_mw::from_fn(request_logging))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    TestServer {
        addr,
        aggregator,
        sessions,
        shutdown_tx,
        aggregator_handle,
        server_handle,
    }
}

type Client = WebSocketStream<MaybeTlsStream<tokio::net::TcpStream>>;

async fn connect(server: &TestServer, query: &str, origin: Option<&str>) -> Client {
    let mut request = format!("ws://{}/ws{query}", server.addr)
        .into_client_request()
        .unwrap();
    if let Some(origin) = origin {
        request
            .headers_mut()
            .insert("Origin", origin.parse().unwrap());
    }
    let (ws, _resp) = connect_async(request).await.expect("upgrade accepted");
    ws
}

async fn subscribe(client: &mut Client, categories: &[&str]) {
    let msg = json!({ "action": "subscribe", "subscriptions": categories }).to_string();
    client.send(Message::Text(msg)).await.unwrap();
}

/// Next JSON frame of one of the given types, skipping others.
async fn next_frame_of(client: &mut Client, kinds: &[&str]) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .expect("frame within timeout")
            .expect("stream open")
            .expect("read ok");
        match msg {
            Message::Text(text) => {
                let value: Value = serde_json::from_str(&text).unwrap();
                let ty = value["type"].as_str().unwrap_or_default().to_string();
                if kinds.contains(&ty.as_str()) {
                    return value;
                }
            }
            Message::Close(_) => panic!("unexpected close while waiting for {kinds:?}"),
            _ => {}
        }
    }
}

fn quote_delta(symbol: &str, last: f64, bid: f64, ask: f64, ts: i64) -> StateDelta {
    StateDelta::MarketQuoteUpdate {
        symbol: symbol.to_string(),
        quote: MarketQuote {
            symbol: symbol.to_string(),
            last,
            bid,
            ask,
            bid_size: 1.0,
            ask_size: 1.0,
            high_24h: 0.0,
            low_24h: 0.0,
            volume_24h: 0.0,
            updated_at: ts,
        },
    }
}

fn order_delta(id: &str, ts: i64) -> StateDelta {
    StateDelta::OrderUpdate(Order {
        id: id.to_string(),
        symbol: "BTCUSDT".to_string(),
        side: OrderSide::Buy,
        order_type: "limit".to_string(),
        status: OrderStatus::New,
        quantity: 1.0,
        filled_quantity: 0.0,
        price: 50_000.0,
        created_at: ts,
        updated_at: ts,
    })
}

#[tokio::test(flavor = "multi_thread")]
async fn baseline_snapshot_then_diff() {
    let server = start_server().await;

    server
        .aggregator
        .submit(quote_delta("BTCUSDT", 50_000.0, 49_999.0, 50_001.0, 1))
        .await;
    while server.aggregator.version() < 1 {
        tokio::task::yield_now().await;
    }

    let mut client = connect(&server, "?type=web", Some(ORIGIN)).await;
    subscribe(&mut client, &["market_data"]).await;

    let ack = next_frame_of(&mut client, &["subscribed"]).await;
    assert_eq!(ack["subscriptions"], json!(["market_data"]));

    let snapshot = next_frame_of(&mut client, &["state_update"]).await;
    assert_eq!(snapshot["version"], 1);
    assert_eq!(snapshot["data"]["market_data"]["BTCUSDT"]["last"], 50_000.0);
    assert_eq!(snapshot["data"]["market_data"]["BTCUSDT"]["bid"], 49_999.0);

    server
        .aggregator
        .submit(quote_delta("BTCUSDT", 50_010.0, 49_999.0, 50_001.0, 2))
        .await;

    let diff = next_frame_of(&mut client, &["diff_update"]).await;
    assert_eq!(diff["version"], 2);
    assert_eq!(diff["changes"]["market_data"]["BTCUSDT"]["last"], 50_010.0);
    // Unchanged fields do not travel.
    assert!(diff["changes"]["market_data"]["BTCUSDT"]
        .get("bid")
        .is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn binary_encoding_end_to_end() {
    let server = start_server().await;

    server
        .aggregator
        .submit(quote_delta("ETHUSDT", 3000.0, 2999.0, 3001.0, 1))
        .await;
    while server.aggregator.version() < 1 {
        tokio::task::yield_now().await;
    }

    let mut client = connect(&server, "?type=web&encoding=binary", Some(ORIGIN)).await;
    let sub = protocol::encode_binary_client(&protocol::ClientMessage::Subscribe {
        subscriptions: vec!["market_data".to_string()],
    });
    client.send(Message::Binary(sub)).await.unwrap();

    let mut saw_snapshot = false;
    for _ in 0..10 {
        let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        if let Message::Binary(bytes) = msg {
            match protocol::decode_binary(&bytes).expect("decodable frame") {
                protocol::ServerFrame::StateUpdate { version, data, .. } => {
                    assert_eq!(version, 1);
                    assert_eq!(data["market_data"]["ETHUSDT"]["last"], 3000.0);
                    saw_snapshot = true;
                    break;
                }
                _ => continue,
            }
        }
    }
    assert!(saw_snapshot, "no binary state_update received");
}

#[tokio::test(flavor = "multi_thread")]
async fn disallowed_origin_is_rejected() {
    let server = start_server().await;

    let mut request = format!("ws://{}/ws?type=web", server.addr)
        .into_client_request()
        .unwrap();
    request
        .headers_mut()
        .insert("Origin", "https://evil.example.com".parse().unwrap());

    let err = connect_async(request).await.expect_err("upgrade must fail");
    match err {
        tokio_tungstenite::tungstenite::Error::Http(resp) => {
            assert_eq!(resp.status(), 403);
        }
        other => panic!("expected HTTP error, got {other:?}"),
    }

    // A browser-profile client with no origin at all is rejected too.
    let request = format!("ws://{}/ws?type=web", server.addr)
        .into_client_request()
        .unwrap();
    assert!(connect_async(request).await.is_err());

    // The tui hint may omit the origin.
    let request = format!("ws://{}/ws?type=tui", server.addr)
        .into_client_request()
        .unwrap();
    assert!(connect_async(request).await.is_ok());
}

#[tokio::test(flavor = "multi_thread")]
async fn unsubscribe_drops_category_from_diffs() {
    let server = start_server().await;

    server
        .aggregator
        .submit(quote_delta("BTCUSDT", 50_000.0, 49_999.0, 50_001.0, 1))
        .await;
    server.aggregator.submit(order_delta("o-1", 1)).await;
    while server.aggregator.version() < 2 {
        tokio::task::yield_now().await;
    }

    let mut client = connect(&server, "?type=web", Some(ORIGIN)).await;
    subscribe(&mut client, &["market_data", "orders"]).await;

    let snapshot = next_frame_of(&mut client, &["state_update"]).await;
    assert!(snapshot["data"].get("orders").is_some());

    client
        .send(Message::Text(
            json!({ "action": "unsubscribe", "subscriptions": ["orders"] }).to_string(),
        ))
        .await
        .unwrap();
    // Let the reader apply the change and any in-flight tick pass.
    tokio::time::sleep(Duration::from_millis(200)).await;

    // Mutate both categories; the diff must only carry market_data.
    server.aggregator.submit(order_delta("o-2", 2)).await;
    server
        .aggregator
        .submit(quote_delta("BTCUSDT", 50_020.0, 49_999.0, 50_001.0, 3))
        .await;

    let diff = next_frame_of(&mut client, &["diff_update"]).await;
    assert!(diff["changes"].get("orders").is_none());
    assert_eq!(diff["changes"]["market_data"]["BTCUSDT"]["last"], 50_020.0);
}

#[tokio::test(flavor = "multi_thread")]
async fn order_book_gap_recovers_with_full_book() {
    let server = start_server().await;

    let book = |first: u64, last: u64, price: f64| StateDelta::OrderBookDelta {
        symbol: "ETHUSDT".to_string(),
        first_id: first,
        last_id: last,
        bid_changes: vec![PriceLevel { price, size: 1.0 }],
        ask_changes: vec![],
        timestamp: 1,
    };

    server.aggregator.submit(book(10, 15, 3000.0)).await;
    server.aggregator.submit(book(16, 20, 3001.0)).await;
    // Gap: 21 expected.
    server.aggregator.submit(book(22, 25, 3002.0)).await;
    // Re-baseline.
    server.aggregator.submit(book(30, 35, 3003.0)).await;

    // Three applied deltas (the gap one is rejected).
    while server.aggregator.version() < 3 {
        tokio::task::yield_now().await;
    }

    let mut client = connect(&server, "?type=web", Some(ORIGIN)).await;
    subscribe(&mut client, &["order_book"]).await;

    let snapshot = next_frame_of(&mut client, &["state_update"]).await;
    let eth = &snapshot["data"]["order_book"]["ETHUSDT"];
    assert_eq!(eth["last_update_id"], 35);
    let bids = eth["bids"].as_array().unwrap();
    assert!(bids.iter().any(|l| l["price"] == json!(3003.0)));
}

#[tokio::test(flavor = "multi_thread")]
async fn shutdown_sends_one_frame_per_client_and_drains() {
    let server = start_server().await;

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = connect(&server, "?type=web", Some(ORIGIN)).await;
        subscribe(&mut client, &["market_data"]).await;
        // Consume the handshake frames so only shutdown traffic remains
        // interesting.
        let _ = next_frame_of(&mut client, &["state_update"]).await;
        clients.push(client);
    }
    assert_eq!(server.sessions.client_count(), 5);

    // Queue one more delta, then shut down: the aggregator must drain it.
    server
        .aggregator
        .submit(quote_delta("BTCUSDT", 50_000.0, 49_999.0, 50_001.0, 9))
        .await;

    server.sessions.begin_shutdown();
    server.shutdown_tx.send(true).unwrap();

    for mut client in clients {
        let mut shutdown_frames = 0;
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), client.next())
                .await
                .expect("frame or close within timeout");
            match msg {
                Some(Ok(Message::Text(text))) => {
                    let value: Value = serde_json::from_str(&text).unwrap();
                    if value["type"] == "shutting_down" {
                        shutdown_frames += 1;
                    }
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(_)) => break,
            }
        }
        assert_eq!(shutdown_frames, 1, "exactly one shutting_down frame");
    }

    assert!(server.sessions.drain(Duration::from_secs(5)).await);

    // Aggregator exits only after draining its channel.
    tokio::time::timeout(Duration::from_secs(5), server.aggregator_handle)
        .await
        .expect("aggregator exits")
        .unwrap();
    assert_eq!(server.aggregator.version(), 1);

    server.server_handle.abort();
}

/// Apply a diff the way a client would: objects merge field-wise, `null`
/// deletes a key, arrays and scalars replace.
fn apply_changes(state: &mut Map<String, Value>, changes: &Map<String, Value>) {
    for (key, change) in changes {
        match change {
            Value::Null => {
                state.remove(key);
            }
            Value::Object(fields) => match state.get_mut(key) {
                Some(Value::Object(existing)) => {
                    let nested: Map<String, Value> = fields.clone();
                    apply_changes_obj(existing, &nested);
                }
                _ => {
                    state.insert(key.clone(), change.clone());
                }
            },
            other => {
                state.insert(key.clone(), other.clone());
            }
        }
    }
}

fn apply_changes_obj(state: &mut Map<String, Value>, changes: &Map<String, Value>) {
    apply_changes(state, changes)
}

#[tokio::test(flavor = "multi_thread")]
async fn client_view_converges_to_server_state() {
    let server = start_server().await;

    let mut client = connect(&server, "?type=web", Some(ORIGIN)).await;
    subscribe(&mut client, &["market_data", "orders"]).await;
    let _ = next_frame_of(&mut client, &["subscribed"]).await;

    // Mixed workload, interleaved with the client's ticks.
    for i in 0..20i64 {
        server
            .aggregator
            .submit(quote_delta(
                if i % 2 == 0 { "BTCUSDT" } else { "ETHUSDT" },
                50_000.0 + i as f64,
                49_999.0,
                50_001.0,
                i + 1,
            ))
            .await;
        if i % 3 == 0 {
            server.aggregator.submit(order_delta(&format!("o-{i}"), i + 1)).await;
        }
        if i % 5 == 0 {
            tokio::time::sleep(Duration::from_millis(30)).await;
        }
    }

    // 20 quotes plus 7 order updates, all accepted.
    let expected_version = 27;
    tokio::time::timeout(Duration::from_secs(5), async {
        while server.aggregator.version() < expected_version {
            tokio::task::yield_now().await;
        }
    })
    .await
    .expect("aggregator applied all deltas");
    let final_version = server.aggregator.version();
    assert_eq!(final_version, expected_version);

    // Replay everything the client receives until it reaches the final
    // version.
    let mut client_state: Map<String, Value> = Map::new();
    let mut last_version: Option<u64> = None;
    while last_version != Some(final_version) {
        let frame = next_frame_of(&mut client, &["state_update", "diff_update"]).await;
        let version = frame["version"].as_u64().unwrap();
        if let Some(prev) = last_version {
            assert!(version > prev, "versions strictly increase");
        }
        last_version = Some(version);

        if frame["type"] == "state_update" {
            client_state = frame["data"].as_object().unwrap().clone();
        } else {
            let changes = frame["changes"].as_object().unwrap().clone();
            apply_changes(&mut client_state, &changes);
        }
    }

    // Compare against the server's filtered view at that version.
    let view = server.aggregator.snapshot(
        tradedeck_backend::models::CategorySet::from_names(&["market_data", "orders"]),
    );
    assert_eq!(view.version, final_version);
    let server_payload = tradedeck_backend::diff::view_payload(&view);

    assert_eq!(
        Value::Object(client_state),
        Value::Object(server_payload),
        "client state equals server state at version {final_version}"
    );
}
