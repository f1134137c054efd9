//! Transport session: owns the gateway connection and dispatches frames.
//!
//! One [`Session`] is one connection epoch. Connecting walks
//! `Disconnected -> Connecting -> Synchronizing -> Ready`: open the
//! channel, exchange the hello handshake, issue the bootstrap battery
//! concurrently, then accept traffic. Two background tasks own the socket
//! halves: a writer draining an outbound queue and a reader dispatching
//! every inbound frame to the pending-call registry, the subscription
//! registry, or the event bus. Sending and receiving never block each
//! other.
//!
//! Teardown, explicit or on transport failure, fails every pending call
//! with "connection lost", marks every subscription stale, and emits
//! exactly one `Disconnected` notification.

use crate::error::{Result, TradeLinkError};
use crate::events::{DisconnectReason, Event, EventBus, GatewayFault};
use crate::models::{
    is_fatal_fault, ClientFrame, ConnectionOptions, ConnectionStats, Identity, ServerFrame,
    SubscribeParams, SubscriptionId, SubscriptionInfo, BOOTSTRAP_ACCOUNT_STATE,
    BOOTSTRAP_OPEN_ORDERS, BOOTSTRAP_POSITIONS,
};
use crate::pending::PendingCalls;
use crate::subscriptions::{LiveResult, Subscriptions};
use crate::timeouts::TradeLinkTimeouts;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use serde_json::{json, Value as JsonValue};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, SystemTime};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant as TokioInstant;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use url::Url;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Capacity of the outbound frame queue between callers and the writer task.
const OUTBOUND_CHANNEL_CAPACITY: usize = 256;

/// Maximum sleep duration that won't overflow `Instant + Duration`.
/// ~100 years is far enough into the future to be effectively "never".
const FAR_FUTURE: Duration = Duration::from_secs(100 * 365 * 24 * 3600);

// ── Session state ───────────────────────────────────────────────────────────

/// Connection lifecycle states of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Synchronizing,
    Ready,
}

impl SessionState {
    fn as_u8(self) -> u8 {
        match self {
            SessionState::Disconnected => 0,
            SessionState::Connecting => 1,
            SessionState::Synchronizing => 2,
            SessionState::Ready => 3,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SessionState::Connecting,
            2 => SessionState::Synchronizing,
            3 => SessionState::Ready,
            _ => SessionState::Disconnected,
        }
    }
}

// ── Idle monitor ────────────────────────────────────────────────────────────

/// Watches inbound traffic and raises one idle notification when nothing
/// arrives within the armed threshold of the last arm/reset.
///
/// Firing does not disconnect; the supervisor decides what it means.
/// The monitor is one-shot: after firing it stays quiet until re-armed.
pub(crate) struct IdleMonitor {
    state: Mutex<IdleState>,
    /// Wakes the dispatch loop so it picks up a new deadline; without
    /// this, arming an already-silent session would never fire.
    rescheduled: Notify,
}

struct IdleState {
    timeout: Option<Duration>,
    last_activity: TokioInstant,
    fired: bool,
}

impl IdleMonitor {
    fn new() -> Self {
        Self {
            state: Mutex::new(IdleState {
                timeout: None,
                last_activity: TokioInstant::now(),
                fired: false,
            }),
            rescheduled: Notify::new(),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, IdleState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Arm (or re-arm) the monitor. Resets the activity clock.
    pub fn arm(&self, timeout: Duration) {
        let mut state = self.lock();
        state.timeout = if TradeLinkTimeouts::is_no_timeout(timeout) {
            None
        } else {
            Some(timeout)
        };
        state.last_activity = TokioInstant::now();
        state.fired = false;
        drop(state);
        self.rescheduled.notify_one();
    }

    /// Disarm the monitor.
    pub fn disarm(&self) {
        let mut state = self.lock();
        state.timeout = None;
        state.fired = false;
        drop(state);
        self.rescheduled.notify_one();
    }

    /// Completes when `arm`/`disarm` changed the schedule, so the
    /// dispatch loop can recompute its sleep deadline.
    pub async fn changed(&self) {
        self.rescheduled.notified().await;
    }

    /// Record inbound activity, pushing the deadline out.
    pub fn touch(&self) {
        self.lock().last_activity = TokioInstant::now();
    }

    /// Deadline the dispatch loop should sleep until, if armed.
    pub fn deadline(&self) -> Option<TokioInstant> {
        let state = self.lock();
        if state.fired {
            return None;
        }
        state.timeout.map(|t| state.last_activity + t)
    }

    /// Latch the monitor as fired if its deadline has passed. Returns how
    /// long the line had been quiet, or `None` if not due.
    pub fn fire_if_due(&self) -> Option<Duration> {
        let mut state = self.lock();
        let timeout = state.timeout?;
        if state.fired {
            return None;
        }
        let quiet = TokioInstant::now().duration_since(state.last_activity);
        if quiet >= timeout {
            state.fired = true;
            Some(quiet)
        } else {
            None
        }
    }
}

// ── Shared session core ─────────────────────────────────────────────────────

struct SessionShared {
    endpoint: String,
    identity: Identity,
    timeouts: TradeLinkTimeouts,
    state: AtomicU8,
    connected: AtomicBool,
    pending: PendingCalls,
    subscriptions: Subscriptions,
    events: EventBus,
    idle: IdleMonitor,
    outbound_tx: mpsc::Sender<Message>,
    shutdown: Notify,
    accounts: Mutex<Vec<String>>,
    server_version: AtomicU32,
    bootstrap: Mutex<HashMap<String, JsonValue>>,
    connected_at: SystemTime,
    frames_sent: AtomicU64,
    frames_received: AtomicU64,
    bytes_sent: AtomicU64,
    bytes_received: AtomicU64,
}

impl SessionShared {
    fn set_state(&self, state: SessionState) {
        self.state.store(state.as_u8(), Ordering::SeqCst);
    }

    fn state(&self) -> SessionState {
        SessionState::from_u8(self.state.load(Ordering::SeqCst))
    }

    fn encode(frame: &ClientFrame) -> Result<String> {
        serde_json::to_string(frame)
            .map_err(|e| TradeLinkError::SerializationError(format!("Failed to encode frame: {}", e)))
    }

    async fn send_frame(&self, frame: &ClientFrame) -> Result<()> {
        if !self.connected.load(Ordering::SeqCst) {
            return Err(TradeLinkError::SessionClosed);
        }
        let payload = Self::encode(frame)?;
        self.frames_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(payload.len() as u64, Ordering::Relaxed);
        self.outbound_tx
            .send(Message::Text(payload.into()))
            .await
            .map_err(|_| TradeLinkError::ConnectionLost("writer task stopped".to_string()))
    }

    /// Non-async best-effort send, for `Drop` paths.
    fn try_send_frame(&self, frame: &ClientFrame) {
        if !self.connected.load(Ordering::SeqCst) {
            return;
        }
        if let Ok(payload) = Self::encode(frame) {
            let _ = self.outbound_tx.try_send(Message::Text(payload.into()));
        }
    }

    /// Tear the session down. Idempotent: only the first caller flushes
    /// the registries and emits the disconnect notification.
    fn teardown(&self, reason: DisconnectReason) {
        if !self.connected.swap(false, Ordering::SeqCst) {
            return;
        }
        info!("[trade-link] Session closed: {}", reason);
        self.set_state(SessionState::Disconnected);
        self.pending.fail_all(&reason.message);
        self.subscriptions.mark_all_stale();
        self.events.emit(Event::SubscriptionsStale);
        self.events.emit(Event::Disconnected(reason));
        self.shutdown.notify_waiters();
    }

    async fn call(
        self: &Arc<Self>,
        method: &str,
        params: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        let (id, handle) = self.pending.register(Some(json!({ "method": method })));
        let frame = ClientFrame::Request {
            call_id: id,
            method: method.to_string(),
            params,
        };
        if let Err(e) = self.send_frame(&frame).await {
            self.pending.cancel(id);
            return Err(e);
        }
        handle.wait(timeout).await
    }
}

// ── Endpoint resolution ─────────────────────────────────────────────────────

/// Normalize a configured endpoint into the URL the transport dials.
/// `http(s)` schemes map onto their socket counterparts.
fn resolve_gateway_url(endpoint: &str) -> Result<String> {
    let mut url = Url::parse(endpoint.trim()).map_err(|e| {
        TradeLinkError::ConfigurationError(format!("Invalid endpoint '{}': {}", endpoint, e))
    })?;

    if url.host_str().is_none() {
        return Err(TradeLinkError::ConfigurationError(
            "Endpoint must include a host".to_string(),
        ));
    }
    if !url.username().is_empty() || url.password().is_some() {
        return Err(TradeLinkError::ConfigurationError(
            "Endpoint must not include username/password credentials".to_string(),
        ));
    }

    let scheme = match url.scheme() {
        "ws" | "http" => "ws",
        "wss" | "https" => "wss",
        other => {
            return Err(TradeLinkError::ConfigurationError(format!(
                "Unsupported endpoint scheme '{}'; expected ws(s) or http(s)",
                other
            )));
        }
    };
    url.set_scheme(scheme).map_err(|_| {
        TradeLinkError::ConfigurationError("Failed to set endpoint scheme".to_string())
    })?;
    url.set_fragment(None);

    Ok(url.to_string())
}

// ── Handshake ───────────────────────────────────────────────────────────────

/// Send the hello frame and wait for the gateway's acknowledgment,
/// tolerating unrelated frames that may arrive first.
async fn send_hello_and_wait(
    ws: &mut WsStream,
    identity: &Identity,
    timeout: Duration,
) -> Result<(Vec<String>, u32)> {
    let hello = ClientFrame::Hello {
        client_id: identity.client_id,
        account: identity.account.clone(),
    };
    let payload = SessionShared::encode(&hello)?;
    ws.send(Message::Text(payload.into()))
        .await
        .map_err(|e| TradeLinkError::ConnectionError(format!("Failed to send hello: {}", e)))?;

    let deadline = TokioInstant::now() + timeout;
    loop {
        let remaining = deadline.saturating_duration_since(TokioInstant::now());
        if remaining.is_zero() {
            return Err(TradeLinkError::TimeoutError(format!(
                "Handshake timeout ({:?})",
                timeout
            )));
        }

        match tokio::time::timeout(remaining, ws.next()).await {
            Ok(Some(Ok(Message::Text(text)))) => {
                match serde_json::from_str::<ServerFrame>(&text) {
                    Ok(ServerFrame::HelloAck {
                        accounts,
                        server_version,
                    }) => return Ok((accounts, server_version)),
                    Ok(ServerFrame::HelloError { message }) => {
                        return Err(TradeLinkError::ConnectionError(format!(
                            "Gateway rejected session: {}",
                            message
                        )));
                    }
                    // Tolerate other frames during the handshake and keep
                    // waiting for the acknowledgment.
                    Ok(_) => continue,
                    Err(e) => {
                        return Err(TradeLinkError::SerializationError(format!(
                            "Failed to parse handshake reply: {}",
                            e
                        )));
                    }
                }
            }
            Ok(Some(Ok(Message::Ping(payload)))) => {
                let _ = ws.send(Message::Pong(payload)).await;
            }
            Ok(Some(Ok(Message::Pong(_) | Message::Binary(_) | Message::Frame(_)))) => continue,
            Ok(Some(Ok(Message::Close(_)))) => {
                return Err(TradeLinkError::ConnectionError(
                    "Connection closed during handshake".to_string(),
                ));
            }
            Ok(Some(Err(e))) => {
                return Err(TradeLinkError::ConnectionError(format!(
                    "Transport error during handshake: {}",
                    e
                )));
            }
            Ok(None) => {
                return Err(TradeLinkError::ConnectionError(
                    "Connection closed before handshake completed".to_string(),
                ));
            }
            Err(_) => {
                return Err(TradeLinkError::TimeoutError(format!(
                    "Handshake timeout ({:?})",
                    timeout
                )));
            }
        }
    }
}

// ── Background tasks ────────────────────────────────────────────────────────

/// Drains the outbound queue into the socket. Stops after forwarding a
/// close frame, on a write failure, or when every sender is gone; the
/// reader observes the dead socket and performs the actual teardown.
async fn writer_loop(mut sink: SplitSink<WsStream, Message>, mut rx: mpsc::Receiver<Message>) {
    while let Some(message) = rx.recv().await {
        let is_close = matches!(message, Message::Close(_));
        if let Err(e) = sink.send(message).await {
            warn!("[trade-link] Failed to send frame: {}", e);
            break;
        }
        if is_close {
            break;
        }
    }
    let _ = sink.close().await;
}

/// Reads inbound frames, feeds the idle monitor, and dispatches every
/// message to the registries or the event bus. This is the single active
/// dispatch path of the session.
async fn reader_loop(mut stream: SplitStream<WsStream>, shared: Arc<SessionShared>) {
    loop {
        if !shared.connected.load(Ordering::SeqCst) {
            return;
        }
        let deadline = shared.idle.deadline();
        let idle_armed = deadline.is_some();
        let idle_sleep = tokio::time::sleep_until(
            deadline.unwrap_or_else(|| TokioInstant::now() + FAR_FUTURE),
        );
        tokio::pin!(idle_sleep);

        tokio::select! {
            biased;

            _ = shared.shutdown.notified() => {
                return;
            }

            // The idle schedule changed; loop around and recompute the
            // sleep deadline.
            _ = shared.idle.changed() => {}

            _ = &mut idle_sleep, if idle_armed => {
                if let Some(quiet) = shared.idle.fire_if_due() {
                    warn!(
                        "[trade-link] No inbound traffic for {:.1}s",
                        quiet.as_secs_f64()
                    );
                    shared.events.emit(Event::IdleTimeout(quiet));
                }
            }

            frame = stream.next() => {
                shared.idle.touch();
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        shared.frames_received.fetch_add(1, Ordering::Relaxed);
                        shared.bytes_received.fetch_add(text.len() as u64, Ordering::Relaxed);
                        match serde_json::from_str::<ServerFrame>(&text) {
                            Ok(parsed) => dispatch_frame(&shared, parsed),
                            Err(e) => warn!("[trade-link] Failed to parse gateway frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Binary(data))) => {
                        shared.frames_received.fetch_add(1, Ordering::Relaxed);
                        shared.bytes_received.fetch_add(data.len() as u64, Ordering::Relaxed);
                        match serde_json::from_slice::<ServerFrame>(&data) {
                            Ok(parsed) => dispatch_frame(&shared, parsed),
                            Err(e) => warn!("[trade-link] Failed to parse binary gateway frame: {}", e),
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = shared.outbound_tx.try_send(Message::Pong(payload));
                    }
                    Some(Ok(Message::Pong(_) | Message::Frame(_))) => {}
                    Some(Ok(Message::Close(close))) => {
                        let reason = match close {
                            Some(frame) => DisconnectReason::with_code(
                                frame.reason.to_string(),
                                frame.code.into(),
                            ),
                            None => DisconnectReason::new("Gateway closed the connection"),
                        };
                        shared.teardown(reason);
                        return;
                    }
                    Some(Err(e)) => {
                        shared.teardown(DisconnectReason::new(format!("Transport error: {}", e)));
                        return;
                    }
                    None => {
                        shared.teardown(DisconnectReason::new("Gateway stream ended"));
                        return;
                    }
                }
            }
        }
    }
}

/// Route one inbound frame: replies to the pending-call registry, updates
/// to the subscription registry, everything else to the event bus.
fn dispatch_frame(shared: &Arc<SessionShared>, frame: ServerFrame) {
    match frame {
        ServerFrame::Reply { call_id, result } => {
            shared.pending.resolve(call_id, result);
        }
        ServerFrame::CallError {
            call_id,
            code,
            message,
        } => {
            if is_fatal_fault(code) {
                shared
                    .events
                    .emit(Event::Error(GatewayFault::new(code, message.clone(), true)));
            }
            shared
                .pending
                .fail(call_id, TradeLinkError::GatewayError { code, message });
        }
        ServerFrame::Update {
            subscription_id,
            kind,
            data,
        } => {
            shared.subscriptions.update(subscription_id, kind, data);
        }
        ServerFrame::Broadcast { topic, data } => match topic.as_str() {
            "order_status" => shared.events.emit(Event::OrderStatus(data)),
            "account" | "account_update" => shared.events.emit(Event::AccountUpdate(data)),
            other => debug!("[trade-link] Ignoring broadcast for unknown topic '{}'", other),
        },
        ServerFrame::Fault { code, message } => {
            let fatal = is_fatal_fault(code);
            shared
                .events
                .emit(Event::Error(GatewayFault::new(code, message, fatal)));
        }
        ServerFrame::HelloAck { .. } | ServerFrame::HelloError { .. } => {
            debug!("[trade-link] Ignoring handshake frame on an established session");
        }
    }
}

// ── Synchronization ─────────────────────────────────────────────────────────

/// Issue the bootstrap battery concurrently, each request bounded by the
/// sync timeout. Failures are warnings unless strict sync is requested.
async fn synchronize(
    shared: &Arc<SessionShared>,
    options: &ConnectionOptions,
) -> Result<()> {
    let mut requests: Vec<(&str, JsonValue)> = vec![(BOOTSTRAP_POSITIONS, json!({}))];
    if !options.read_only {
        requests.push((BOOTSTRAP_OPEN_ORDERS, json!({})));
    }
    let account = shared.identity.account.clone();
    requests.push((
        BOOTSTRAP_ACCOUNT_STATE,
        if account.is_empty() {
            json!({})
        } else {
            json!({ "account": account })
        },
    ));

    let sync_timeout = shared.timeouts.sync_timeout;
    let pending: Vec<_> = requests
        .iter()
        .map(|(method, params)| shared.call(*method, params.clone(), Some(sync_timeout)))
        .collect();
    let results = futures_util::future::join_all(pending).await;

    let mut errors = Vec::new();
    for ((method, _), result) in requests.iter().zip(results) {
        match result {
            Ok(value) => {
                shared
                    .bootstrap
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner)
                    .insert((*method).to_string(), value);
            }
            Err(e) => {
                warn!("[trade-link] Bootstrap request '{}' failed: {}", method, e);
                errors.push(format!("{}: {}", method, e));
            }
        }
    }

    if options.strict_sync && !errors.is_empty() {
        return Err(TradeLinkError::SyncError(errors.join("; ")));
    }
    Ok(())
}

// ── Session ─────────────────────────────────────────────────────────────────

/// One connection epoch to the gateway.
///
/// Created via [`TradeLinkClient::connect`](crate::client::TradeLinkClient::connect).
/// All methods take `&self`; the session can be shared behind an `Arc`
/// between concurrent callers and the supervisor.
pub struct Session {
    shared: Arc<SessionShared>,
    _reader_handle: JoinHandle<()>,
    _writer_handle: JoinHandle<()>,
}

impl Session {
    pub(crate) async fn connect(
        endpoint: &str,
        identity: Identity,
        timeouts: &TradeLinkTimeouts,
        options: &ConnectionOptions,
        events: EventBus,
    ) -> Result<Session> {
        let url = resolve_gateway_url(endpoint)?;
        info!(
            "[trade-link] Connecting to {} with client id {}",
            url, identity.client_id
        );

        let connect_result = if !TradeLinkTimeouts::is_no_timeout(timeouts.connect_timeout) {
            tokio::time::timeout(timeouts.connect_timeout, connect_async(url.as_str())).await
        } else {
            Ok(connect_async(url.as_str()).await)
        };
        let mut ws = match connect_result {
            Ok(Ok((stream, _response))) => stream,
            Ok(Err(e)) => {
                return Err(TradeLinkError::ConnectionError(format!(
                    "Connection failed: {}",
                    e
                )));
            }
            Err(_) => {
                return Err(TradeLinkError::TimeoutError(format!(
                    "Connection timeout ({:?})",
                    timeouts.connect_timeout
                )));
            }
        };

        let (accounts, server_version) =
            send_hello_and_wait(&mut ws, &identity, timeouts.handshake_timeout).await?;
        info!(
            "[trade-link] Handshake complete (server version {})",
            server_version
        );

        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_CHANNEL_CAPACITY);
        let shared = Arc::new(SessionShared {
            endpoint: endpoint.to_string(),
            identity,
            timeouts: timeouts.clone(),
            state: AtomicU8::new(SessionState::Synchronizing.as_u8()),
            connected: AtomicBool::new(true),
            pending: PendingCalls::new(),
            subscriptions: Subscriptions::new(),
            events,
            idle: IdleMonitor::new(),
            outbound_tx,
            shutdown: Notify::new(),
            accounts: Mutex::new(accounts),
            server_version: AtomicU32::new(server_version),
            bootstrap: Mutex::new(HashMap::new()),
            connected_at: SystemTime::now(),
            frames_sent: AtomicU64::new(0),
            frames_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
        });

        let (sink, stream) = ws.split();
        let writer_handle = tokio::spawn(writer_loop(sink, outbound_rx));
        let reader_handle = tokio::spawn(reader_loop(stream, shared.clone()));

        shared.events.emit(Event::Connected);

        let session = Session {
            shared,
            _reader_handle: reader_handle,
            _writer_handle: writer_handle,
        };

        if let Err(e) = synchronize(&session.shared, options).await {
            warn!("[trade-link] Synchronization failed, tearing session down: {}", e);
            session.disconnect().await;
            return Err(e);
        }

        if timeouts.idle_timeout > Duration::ZERO {
            session.shared.idle.arm(timeouts.idle_timeout);
        }
        session.shared.set_state(SessionState::Ready);
        info!("[trade-link] Session ready");
        Ok(session)
    }

    /// Current lifecycle state.
    pub fn state(&self) -> SessionState {
        self.shared.state()
    }

    /// Whether the session has not been torn down.
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::SeqCst)
    }

    /// Endpoint this session was dialed against.
    pub fn endpoint(&self) -> &str {
        &self.shared.endpoint
    }

    /// Identity presented during the handshake.
    pub fn identity(&self) -> &Identity {
        &self.shared.identity
    }

    /// Accounts reported by the gateway during the handshake.
    pub fn accounts(&self) -> Vec<String> {
        self.shared
            .accounts
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Gateway protocol version from the handshake.
    pub fn server_version(&self) -> u32 {
        self.shared.server_version.load(Ordering::Relaxed)
    }

    /// Result of a bootstrap request captured during synchronization.
    pub fn bootstrap(&self, method: &str) -> Option<JsonValue> {
        self.shared
            .bootstrap
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(method)
            .cloned()
    }

    /// Traffic counters for this epoch.
    pub fn stats(&self) -> ConnectionStats {
        ConnectionStats {
            connected_at: self.shared.connected_at,
            frames_sent: self.shared.frames_sent.load(Ordering::Relaxed),
            frames_received: self.shared.frames_received.load(Ordering::Relaxed),
            bytes_sent: self.shared.bytes_sent.load(Ordering::Relaxed),
            bytes_received: self.shared.bytes_received.load(Ordering::Relaxed),
        }
    }

    /// Issue a request and wait for its reply.
    ///
    /// `timeout` bounds the wait; `None` applies the configured default
    /// call timeout, and a zero duration waits indefinitely. The caller
    /// always gets a value or a typed error within its bound; a reply
    /// arriving after the bound is discarded.
    pub async fn call(
        &self,
        method: &str,
        params: JsonValue,
        timeout: Option<Duration>,
    ) -> Result<JsonValue> {
        let effective = timeout.or(Some(self.shared.timeouts.call_timeout));
        self.shared.call(method, params, effective).await
    }

    /// Send a fire-and-forget message carrying no call id.
    pub async fn notify(&self, method: &str, params: JsonValue) -> Result<()> {
        self.shared
            .send_frame(&ClientFrame::Notify {
                method: method.to_string(),
                params,
            })
            .await
    }

    /// Open a streaming subscription.
    ///
    /// Two subscriptions with identical parameters are independent. The
    /// returned handle consumes updates by push (`next`) or pull
    /// (`live().snapshot()`).
    pub async fn subscribe(&self, topic: &str, params: JsonValue) -> Result<SubscriptionHandle> {
        let subscribe_params = SubscribeParams::new(topic, params);
        let (id, live, update_rx) = self
            .shared
            .subscriptions
            .insert(subscribe_params.clone());
        let frame = ClientFrame::Subscribe {
            subscription_id: id,
            topic: subscribe_params.topic.clone(),
            params: subscribe_params.params.clone(),
        };
        if let Err(e) = self.shared.send_frame(&frame).await {
            self.shared.subscriptions.remove(id);
            return Err(e);
        }
        debug!("[trade-link] Subscribed {} to '{}'", id, subscribe_params.topic);
        Ok(SubscriptionHandle {
            id,
            params: subscribe_params,
            live,
            update_rx,
            shared: self.shared.clone(),
            closed: false,
        })
    }

    /// Close a subscription. Equivalent to [`SubscriptionHandle::close`].
    pub async fn unsubscribe(&self, handle: &mut SubscriptionHandle) -> Result<()> {
        handle.close().await
    }

    /// Metadata for every subscription registered in this epoch,
    /// including the stored parameters needed to resubscribe.
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.shared.subscriptions.list()
    }

    /// Arm the idle-traffic monitor. Every inbound frame resets it; when
    /// it fires, one `IdleTimeout` notification is emitted and the
    /// monitor stays quiet until re-armed.
    pub fn arm_idle_monitor(&self, timeout: Duration) {
        self.shared.idle.arm(timeout);
    }

    /// Disarm the idle-traffic monitor.
    pub fn disarm_idle_monitor(&self) {
        self.shared.idle.disarm();
    }

    /// Access to the event bus this session emits on.
    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    /// Tear the session down.
    ///
    /// Pending calls fail with "connection lost", subscriptions go stale,
    /// and exactly one `Disconnected` notification is emitted. Calling
    /// this again is a no-op.
    pub async fn disconnect(&self) {
        if !self.is_connected() {
            return;
        }
        info!("[trade-link] Disconnecting");
        let _ = self.shared.outbound_tx.send(Message::Close(None)).await;
        self.shared
            .teardown(DisconnectReason::with_code("Disconnected by client", 1000));
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        // Best-effort close; harmless when already disconnected.
        if self.shared.connected.load(Ordering::SeqCst) {
            let _ = self.shared.outbound_tx.try_send(Message::Close(None));
            self.shared
                .teardown(DisconnectReason::new("Session dropped"));
        }
    }
}

// ── Subscription handle ─────────────────────────────────────────────────────

/// Consumer handle for one subscription.
///
/// Push consumption via [`next`](Self::next) and pull consumption via
/// [`live`](Self::live) may run concurrently with the dispatch path
/// writing updates. Dropping the handle unsubscribes best-effort.
pub struct SubscriptionHandle {
    id: SubscriptionId,
    params: SubscribeParams,
    live: Arc<LiveResult>,
    update_rx: mpsc::Receiver<crate::models::UpdateEvent>,
    shared: Arc<SessionShared>,
    closed: bool,
}

impl SubscriptionHandle {
    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    /// Parameters this subscription was created with; feed them back into
    /// [`Session::subscribe`] to resubscribe after a reconnect.
    pub fn params(&self) -> &SubscribeParams {
        &self.params
    }

    /// The live result, continuously updated in place.
    pub fn live(&self) -> &LiveResult {
        &self.live
    }

    /// A shared reference to the live result that outlives this handle.
    pub fn live_handle(&self) -> Arc<LiveResult> {
        self.live.clone()
    }

    /// Receive the next pushed update.
    ///
    /// Returns `None` once the subscription is closed or its session is
    /// torn down; the live result then reads as stale.
    pub async fn next(&mut self) -> Option<crate::models::UpdateEvent> {
        self.update_rx.recv().await
    }

    /// Close the subscription. The registry entry is removed immediately;
    /// an unsubscribe frame is sent when the session is still up. Safe to
    /// call multiple times.
    pub async fn close(&mut self) -> Result<()> {
        if self.closed {
            return Ok(());
        }
        self.closed = true;
        self.shared.subscriptions.remove(self.id);
        if self.shared.connected.load(Ordering::SeqCst) {
            self.shared
                .send_frame(&ClientFrame::Unsubscribe {
                    subscription_id: self.id,
                })
                .await?;
        }
        Ok(())
    }

    /// Returns `true` once `close()` has run.
    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if !self.closed {
            self.shared.subscriptions.remove(self.id);
            self.shared.try_send_frame(&ClientFrame::Unsubscribe {
                subscription_id: self.id,
            });
        }
    }
}
