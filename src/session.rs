//! Client session layer.
//!
//! Accepts `/ws` upgrades, enforces the origin whitelist, negotiates the
//! cadence profile and wire encoding, then runs the duplex loop: a reader
//! task applies subscription changes and answers pings, a writer task pumps
//! the bounded send queue onto the socket, and the per-client ticker from
//! the broadcaster fills that queue. Any task can close the session through
//! a shared close signal; the first reason wins.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::Arc;

use axum::extract::ws::{close_code, CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::{header::ORIGIN, HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use metrics::{counter, decrement_gauge, histogram, increment_gauge};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{interval, sleep, timeout, Duration, Instant};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::aggregator::Aggregator;
use crate::api::AppState;
use crate::broadcast::{run_client_ticker, ClientProfile};
use crate::metrics::{
    BROADCASTS_SENT_TOTAL, CLIENTS_CONNECTED, DIFF_BYTES, WRITE_ERRORS_TOTAL,
};
use crate::models::CategorySet;
use crate::protocol::{
    decode_binary_client, encode_binary, parse_client_text, ClientMessage, ClientParseError,
    Encoding, ServerFrame,
};

/// Coded close reasons, sent in the close frame so clients can tell apart
/// being slow from a server shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    ClientDisconnect,
    HandshakeTimeout,
    KeepAliveTimeout,
    SlowConsumer,
    WriteError,
    Shutdown,
    Internal,
}

impl CloseReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CloseReason::ClientDisconnect => "client_disconnect",
            CloseReason::HandshakeTimeout => "handshake_timeout",
            CloseReason::KeepAliveTimeout => "keep_alive_timeout",
            CloseReason::SlowConsumer => "slow_consumer",
            CloseReason::WriteError => "write_error",
            CloseReason::Shutdown => "shutting_down",
            CloseReason::Internal => "internal_error",
        }
    }
}

/// Session-scoped close signal shared by the reader, writer, and ticker.
#[derive(Clone)]
pub struct SessionCloser {
    tx: Arc<watch::Sender<Option<CloseReason>>>,
}

impl SessionCloser {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(None);
        Self { tx: Arc::new(tx) }
    }

    /// Set the close reason. Only the first close takes effect.
    pub fn close(&self, reason: CloseReason) -> bool {
        self.tx.send_if_modified(|current| {
            if current.is_none() {
                *current = Some(reason);
                true
            } else {
                false
            }
        })
    }

    pub fn subscribe(&self) -> watch::Receiver<Option<CloseReason>> {
        self.tx.subscribe()
    }

    pub fn reason(&self) -> Option<CloseReason> {
        *self.tx.borrow()
    }
}

impl Default for SessionCloser {
    fn default() -> Self {
        Self::new()
    }
}

/// Live sessions plus the counters `/debug` reports.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, SessionCloser>>,
    count: AtomicUsize,
    bytes_sent: AtomicU64,
    accepting: AtomicBool,
}

impl SessionRegistry {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            count: AtomicUsize::new(0),
            bytes_sent: AtomicU64::new(0),
            accepting: AtomicBool::new(true),
        })
    }

    fn register(&self, id: Uuid, closer: SessionCloser) {
        self.sessions.write().insert(id, closer);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    fn unregister(&self, id: Uuid) {
        if self.sessions.write().remove(&id).is_some() {
            self.count.fetch_sub(1, Ordering::Relaxed);
        }
    }

    pub fn client_count(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn add_bytes(&self, n: u64) {
        self.bytes_sent.fetch_add(n, Ordering::Relaxed);
    }

    pub fn bytes_sent(&self) -> u64 {
        self.bytes_sent.load(Ordering::Relaxed)
    }

    pub fn accepting(&self) -> bool {
        self.accepting.load(Ordering::Relaxed)
    }

    /// Stop accepting upgrades and ask every live session to shut down.
    /// Each client gets one `shutting_down` frame from its writer.
    pub fn begin_shutdown(&self) {
        self.accepting.store(false, Ordering::Relaxed);
        for closer in self.sessions.read().values() {
            closer.close(CloseReason::Shutdown);
        }
    }

    /// Wait for sessions to finish, up to `limit`. Returns true when all
    /// drained in time.
    pub async fn drain(&self, limit: Duration) -> bool {
        let deadline = Instant::now() + limit;
        while self.client_count() > 0 && Instant::now() < deadline {
            sleep(Duration::from_millis(50)).await;
        }
        self.client_count() == 0
    }
}

#[derive(Debug, Deserialize)]
pub struct WsQuery {
    /// `web` (default) or `tui`; selects the cadence profile and doubles as
    /// the non-browser hint for the origin policy.
    #[serde(rename = "type")]
    pub client_type: Option<String>,
    /// `json` (default) or `binary`.
    pub encoding: Option<String>,
}

/// Origin policy: the reported origin must be whitelisted. Browsers always
/// send one, so only `type=tui` clients may omit it.
pub fn origin_allowed(origin: Option<&str>, allowed: &[String], profile: ClientProfile) -> bool {
    match origin {
        Some(origin) => allowed.iter().any(|a| a == "*" || a == origin),
        None => profile == ClientProfile::Tui,
    }
}

/// `GET /ws` upgrade handler.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(query): Query<WsQuery>,
    headers: HeaderMap,
    State(state): State<AppState>,
) -> Response {
    if !state.sessions.accepting() {
        return (StatusCode::SERVICE_UNAVAILABLE, "shutting down").into_response();
    }

    let Some(profile) = ClientProfile::from_query(query.client_type.as_deref()) else {
        return (StatusCode::BAD_REQUEST, "unknown client type").into_response();
    };
    let Some(encoding) = Encoding::from_query(query.encoding.as_deref()) else {
        return (StatusCode::BAD_REQUEST, "unknown encoding").into_response();
    };

    let origin = headers.get(ORIGIN).and_then(|v| v.to_str().ok());
    if !origin_allowed(origin, &state.config.allowed_origins, profile) {
        warn!(?origin, "upgrade rejected: origin not allowed");
        return (StatusCode::FORBIDDEN, "origin not allowed").into_response();
    }

    ws.on_upgrade(move |socket| run_session(socket, state, profile, encoding))
}

async fn run_session(
    socket: WebSocket,
    state: AppState,
    profile: ClientProfile,
    encoding: Encoding,
) {
    let id = Uuid::new_v4();
    let closer = SessionCloser::new();
    state.sessions.register(id, closer.clone());
    increment_gauge!(CLIENTS_CONNECTED, 1.0);
    info!(%id, ?profile, ?encoding, "client connected");

    drive_session(socket, &state, profile, encoding, &closer).await;

    state.sessions.unregister(id);
    decrement_gauge!(CLIENTS_CONNECTED, 1.0);
    info!(
        %id,
        reason = closer.reason().map(|r| r.as_str()).unwrap_or("socket_closed"),
        "client disconnected"
    );
}

async fn drive_session(
    mut socket: WebSocket,
    state: &AppState,
    profile: ClientProfile,
    encoding: Encoding,
    closer: &SessionCloser,
) {
    let cfg = &state.config;

    // Handshaking: the client must subscribe within the grace window.
    let Some(initial_subs) =
        await_initial_subscribe(&mut socket, encoding, cfg.handshake_grace, closer).await
    else {
        return;
    };

    let subscriptions = Arc::new(AtomicU8::new(initial_subs.bits()));
    let ack = ServerFrame::Subscribed {
        subscriptions: initial_subs.names(),
        version: state.aggregator.version(),
    };
    if socket.send(encode_ws(&ack, encoding)).await.is_err() {
        return;
    }

    // Active: split into the write path and the reader.
    let (sink, stream) = socket.split();
    let (out_tx, out_rx) = mpsc::channel::<ServerFrame>(cfg.send_queue_depth);

    let writer = tokio::spawn(run_writer(
        sink,
        out_rx,
        encoding,
        closer.clone(),
        state.sessions.clone(),
        cfg.ping_interval,
        cfg.write_timeout,
    ));

    let ticker = tokio::spawn(run_client_ticker(
        state.aggregator.clone(),
        subscriptions.clone(),
        out_tx.clone(),
        profile.cadence(cfg.web_interval, cfg.tui_interval),
        cfg.send_queue_depth,
        cfg.slow_consumer_max_skips,
        closer.clone(),
    ));

    run_reader(
        stream,
        subscriptions,
        out_tx,
        state.aggregator.clone(),
        closer.clone(),
        cfg.read_timeout,
        ticker,
    )
    .await;

    // The writer flushes and sends the close frame; give it a bounded
    // moment to do so.
    let _ = timeout(cfg.write_timeout + Duration::from_secs(1), writer).await;
}

/// Wait for the initial `subscribe`. Pings are answered; anything else gets
/// an `unknown_action` error while the clock keeps running.
async fn await_initial_subscribe(
    socket: &mut WebSocket,
    encoding: Encoding,
    grace: Duration,
    closer: &SessionCloser,
) -> Option<CategorySet> {
    let deadline = Instant::now() + grace;

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        let msg = match timeout(remaining, socket.recv()).await {
            Err(_) => {
                closer.close(CloseReason::HandshakeTimeout);
                let _ = socket
                    .send(close_message(CloseReason::HandshakeTimeout))
                    .await;
                return None;
            }
            Ok(None) => {
                closer.close(CloseReason::ClientDisconnect);
                return None;
            }
            Ok(Some(Err(_))) => {
                closer.close(CloseReason::ClientDisconnect);
                return None;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        match decode_client(&msg) {
            Some(Ok(ClientMessage::Subscribe { subscriptions })) => {
                return Some(CategorySet::from_names(&subscriptions));
            }
            Some(Ok(ClientMessage::Ping)) => {
                let _ = socket.send(encode_ws(&ServerFrame::Pong, encoding)).await;
            }
            Some(Ok(ClientMessage::Unsubscribe { .. })) => {
                let frame = ServerFrame::unknown_action("unsubscribe before subscribe");
                let _ = socket.send(encode_ws(&frame, encoding)).await;
            }
            Some(Err(ClientParseError::UnknownAction(action))) => {
                let frame = ServerFrame::unknown_action(&action);
                let _ = socket.send(encode_ws(&frame, encoding)).await;
            }
            Some(Err(ClientParseError::Malformed)) => {
                let frame = ServerFrame::unknown_action("");
                let _ = socket.send(encode_ws(&frame, encoding)).await;
            }
            None => {
                if matches!(msg, Message::Close(_)) {
                    closer.close(CloseReason::ClientDisconnect);
                    return None;
                }
                // Control frames: keep waiting.
            }
        }
    }
}

type WsSink = SplitSink<WebSocket, Message>;
type WsStream = SplitStream<WebSocket>;

async fn run_reader(
    mut stream: WsStream,
    subscriptions: Arc<AtomicU8>,
    out_tx: mpsc::Sender<ServerFrame>,
    aggregator: Arc<Aggregator>,
    closer: SessionCloser,
    read_timeout: Duration,
    mut ticker: JoinHandle<()>,
) {
    let mut closed = closer.subscribe();
    let mut last_activity = Instant::now();

    loop {
        let idle_deadline = last_activity + read_timeout;
        tokio::select! {
            maybe = stream.next() => match maybe {
                Some(Ok(msg)) => {
                    last_activity = Instant::now();
                    if matches!(msg, Message::Close(_)) {
                        closer.close(CloseReason::ClientDisconnect);
                        return;
                    }
                    handle_client_message(&msg, &subscriptions, &out_tx, &aggregator);
                }
                Some(Err(e)) => {
                    debug!(error = %e, "client read error");
                    closer.close(CloseReason::ClientDisconnect);
                    return;
                }
                None => {
                    closer.close(CloseReason::ClientDisconnect);
                    return;
                }
            },
            _ = tokio::time::sleep_until(idle_deadline) => {
                closer.close(CloseReason::KeepAliveTimeout);
                return;
            }
            _ = closed.changed() => {
                if closed.borrow().is_some() {
                    return;
                }
            }
            result = &mut ticker => {
                if let Err(e) = result {
                    if e.is_panic() {
                        // A diff-compute panic takes down this client only.
                        error!("client ticker panicked");
                    }
                    closer.close(CloseReason::Internal);
                }
                // Otherwise the ticker closed the session itself.
                return;
            }
        }
    }
}

fn handle_client_message(
    msg: &Message,
    subscriptions: &AtomicU8,
    out_tx: &mpsc::Sender<ServerFrame>,
    aggregator: &Aggregator,
) {
    let parsed = match decode_client(msg) {
        Some(parsed) => parsed,
        None => return, // ping/pong control traffic
    };

    let reply = match parsed {
        Ok(ClientMessage::Subscribe { subscriptions: names }) => {
            let set = CategorySet::from_names(&names);
            subscriptions.store(set.bits(), Ordering::Release);
            Some(ServerFrame::Subscribed {
                subscriptions: set.names(),
                version: aggregator.version(),
            })
        }
        Ok(ClientMessage::Unsubscribe { subscriptions: names }) => {
            let mut set = CategorySet::from_bits(subscriptions.load(Ordering::Acquire));
            for name in &names {
                if let Some(c) = crate::models::Category::from_str(name) {
                    set.remove(c);
                }
            }
            subscriptions.store(set.bits(), Ordering::Release);
            None
        }
        Ok(ClientMessage::Ping) => Some(ServerFrame::Pong),
        Err(ClientParseError::UnknownAction(action)) => {
            Some(ServerFrame::unknown_action(&action))
        }
        Err(ClientParseError::Malformed) => Some(ServerFrame::unknown_action("")),
    };

    if let Some(frame) = reply {
        // Control replies ride the same bounded queue; drop rather than
        // block if the client is backed up.
        let _ = out_tx.try_send(frame);
    }
}

async fn run_writer(
    mut sink: WsSink,
    mut out_rx: mpsc::Receiver<ServerFrame>,
    encoding: Encoding,
    closer: SessionCloser,
    registry: Arc<SessionRegistry>,
    ping_interval: Duration,
    write_timeout: Duration,
) {
    let mut ping = interval(ping_interval);
    ping.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
    // interval() fires immediately; no point pinging a brand new socket.
    ping.tick().await;

    let mut closed = closer.subscribe();

    loop {
        tokio::select! {
            maybe = out_rx.recv() => match maybe {
                Some(frame) => {
                    if send_frame(&mut sink, &frame, encoding, write_timeout, &registry)
                        .await
                        .is_err()
                    {
                        counter!(WRITE_ERRORS_TOTAL, 1);
                        closer.close(CloseReason::WriteError);
                        return;
                    }
                }
                None => return,
            },
            _ = ping.tick() => {
                if timeout(write_timeout, sink.send(Message::Ping(Vec::new())))
                    .await
                    .map_or(true, |r| r.is_err())
                {
                    counter!(WRITE_ERRORS_TOTAL, 1);
                    closer.close(CloseReason::WriteError);
                    return;
                }
            }
            _ = closed.changed() => {
                let Some(reason) = *closed.borrow() else { continue };
                if reason == CloseReason::Shutdown {
                    // Drain queued state, then announce the shutdown.
                    while let Ok(frame) = out_rx.try_recv() {
                        if send_frame(&mut sink, &frame, encoding, write_timeout, &registry)
                            .await
                            .is_err()
                        {
                            break;
                        }
                    }
                    let _ = send_frame(
                        &mut sink,
                        &ServerFrame::ShuttingDown,
                        encoding,
                        write_timeout,
                        &registry,
                    )
                    .await;
                }
                let _ = timeout(write_timeout, sink.send(close_message(reason))).await;
                return;
            }
        }
    }
}

async fn send_frame(
    sink: &mut WsSink,
    frame: &ServerFrame,
    encoding: Encoding,
    write_timeout: Duration,
    registry: &SessionRegistry,
) -> Result<(), ()> {
    let msg = encode_ws(frame, encoding);
    let bytes = message_len(&msg);

    match timeout(write_timeout, sink.send(msg)).await {
        Ok(Ok(())) => {
            registry.add_bytes(bytes as u64);
            match frame {
                ServerFrame::StateUpdate { .. } => {
                    counter!(BROADCASTS_SENT_TOTAL, 1, "type" => "snapshot");
                }
                ServerFrame::DiffUpdate { .. } => {
                    counter!(BROADCASTS_SENT_TOTAL, 1, "type" => "diff");
                    histogram!(DIFF_BYTES, bytes as f64);
                }
                _ => {}
            }
            Ok(())
        }
        _ => Err(()),
    }
}

fn encode_ws(frame: &ServerFrame, encoding: Encoding) -> Message {
    match encoding {
        Encoding::Json => {
            Message::Text(serde_json::to_string(frame).unwrap_or_else(|_| "{}".to_string()))
        }
        Encoding::Binary => Message::Binary(encode_binary(frame)),
    }
}

fn message_len(msg: &Message) -> usize {
    match msg {
        Message::Text(t) => t.len(),
        Message::Binary(b) => b.len(),
        _ => 0,
    }
}

fn close_message(reason: CloseReason) -> Message {
    Message::Close(Some(CloseFrame {
        code: close_code::NORMAL,
        reason: reason.as_str().into(),
    }))
}

/// Decode a client frame in either encoding. `None` for control frames the
/// session layer does not interpret.
fn decode_client(msg: &Message) -> Option<Result<ClientMessage, ClientParseError>> {
    match msg {
        Message::Text(text) => Some(parse_client_text(text)),
        Message::Binary(bytes) => Some(
            decode_binary_client(bytes).map_err(|_| ClientParseError::Malformed),
        ),
        _ => None,
    }
}
