//! In-process fake gateway for integration tests.
//!
//! Speaks the trade-link wire protocol over a real WebSocket listener on
//! an ephemeral port. Default behavior answers the handshake and echoes
//! every request back as its reply; tests reshape it at runtime (mute,
//! hold-and-reverse replies, per-method failures) and inject arbitrary
//! server frames to drive subscriptions, broadcasts, and faults.

#![allow(dead_code)]

use bytes::Bytes;
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value as JsonValue};
use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;
use trade_link::{
    CallId, ClientFrame, Event, EventBus, ServerFrame, Topic, TradeLinkClient, TradeLinkTimeouts,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Runtime-adjustable gateway behavior.
#[derive(Debug, Clone, Default)]
pub struct Behavior {
    /// Stop answering requests entirely. Handshakes still succeed.
    pub mute: bool,
    /// Collect this many requests, then answer the batch in reverse order.
    pub hold_replies: Option<usize>,
    /// Methods answered with a `CallError` carrying the mapped code.
    pub fail_methods: HashMap<String, i64>,
    /// Methods that never get an answer.
    pub drop_methods: HashSet<String>,
    /// Reject the handshake with this message.
    pub reject_hello: Option<String>,
}

struct GatewayState {
    behavior: Mutex<Behavior>,
    received: Mutex<Vec<ClientFrame>>,
    inject_tx: broadcast::Sender<ServerFrame>,
    close_tx: broadcast::Sender<()>,
    connections: AtomicUsize,
}

/// A scripted gateway bound to an ephemeral local port.
pub struct FakeGateway {
    addr: SocketAddr,
    state: Arc<GatewayState>,
    _accept_task: JoinHandle<()>,
}

impl FakeGateway {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0")
            .await
            .expect("bind fake gateway");
        let addr = listener.local_addr().expect("fake gateway local addr");
        let (inject_tx, _) = broadcast::channel(256);
        let (close_tx, _) = broadcast::channel(4);
        let state = Arc::new(GatewayState {
            behavior: Mutex::new(Behavior::default()),
            received: Mutex::new(Vec::new()),
            inject_tx,
            close_tx,
            connections: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let accept_task = tokio::spawn(async move {
            loop {
                let Ok((stream, _)) = listener.accept().await else {
                    break;
                };
                tokio::spawn(handle_connection(stream, accept_state.clone()));
            }
        });

        Self {
            addr,
            state,
            _accept_task: accept_task,
        }
    }

    pub fn url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    // ── behavior knobs ──────────────────────────────────────────────────

    pub fn set_mute(&self, mute: bool) {
        self.state.behavior.lock().unwrap().mute = mute;
    }

    pub fn hold_replies(&self, batch: usize) {
        self.state.behavior.lock().unwrap().hold_replies = Some(batch);
    }

    pub fn fail_method(&self, method: &str, code: i64) {
        self.state
            .behavior
            .lock()
            .unwrap()
            .fail_methods
            .insert(method.to_string(), code);
    }

    pub fn drop_method(&self, method: &str) {
        self.state
            .behavior
            .lock()
            .unwrap()
            .drop_methods
            .insert(method.to_string());
    }

    pub fn reject_hello(&self, message: &str) {
        self.state.behavior.lock().unwrap().reject_hello = Some(message.to_string());
    }

    // ── server-initiated traffic ────────────────────────────────────────

    /// Send a frame to every live connection.
    pub fn inject(&self, frame: ServerFrame) {
        let _ = self.state.inject_tx.send(frame);
    }

    /// Close every live connection from the server side.
    pub fn close_connections(&self) {
        let _ = self.state.close_tx.send(());
    }

    // ── observation ─────────────────────────────────────────────────────

    /// Every client frame received so far, across all connections.
    pub fn received(&self) -> Vec<ClientFrame> {
        self.state.received.lock().unwrap().clone()
    }

    /// `(call_id, params)` of every request for `method` seen so far.
    pub fn requests_for(&self, method: &str) -> Vec<(CallId, JsonValue)> {
        self.received()
            .into_iter()
            .filter_map(|frame| match frame {
                ClientFrame::Request {
                    call_id,
                    method: m,
                    params,
                } if m == method => Some((call_id, params)),
                _ => None,
            })
            .collect()
    }

    pub fn request_count(&self, method: &str) -> usize {
        self.requests_for(method).len()
    }

    /// Number of connections that completed the handshake.
    pub fn connections(&self) -> usize {
        self.state.connections.load(Ordering::SeqCst)
    }

    /// Poll until a request for `method` has been observed.
    pub async fn wait_for_request(&self, method: &str) -> (CallId, JsonValue) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        loop {
            if let Some(found) = self.requests_for(method).pop() {
                return found;
            }
            if tokio::time::Instant::now() >= deadline {
                panic!("no '{}' request observed within 5s", method);
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }

    /// Poll until at least `count` handshakes have completed.
    pub async fn wait_for_connections(&self, count: usize) {
        let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
        while self.connections() < count {
            if tokio::time::Instant::now() >= deadline {
                panic!(
                    "only {} of {} expected connections within 5s",
                    self.connections(),
                    count
                );
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

async fn handle_connection(stream: TcpStream, state: Arc<GatewayState>) {
    let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await else {
        return;
    };

    // Handshake: wait for the hello frame, acknowledge or reject it.
    loop {
        match ws.next().await {
            Some(Ok(Message::Text(text))) => {
                let Ok(frame) = serde_json::from_str::<ClientFrame>(&text) else {
                    continue;
                };
                state.received.lock().unwrap().push(frame.clone());
                if matches!(frame, ClientFrame::Hello { .. }) {
                    let reject = state.behavior.lock().unwrap().reject_hello.clone();
                    match reject {
                        Some(message) => {
                            let _ = send_frame(&mut ws, &ServerFrame::HelloError { message }).await;
                            return;
                        }
                        None => {
                            let ack = ServerFrame::HelloAck {
                                accounts: vec!["TEST1".to_string()],
                                server_version: 42,
                            };
                            if send_frame(&mut ws, &ack).await.is_err() {
                                return;
                            }
                            break;
                        }
                    }
                }
            }
            Some(Ok(_)) => continue,
            _ => return,
        }
    }

    state.connections.fetch_add(1, Ordering::SeqCst);
    // A transport-level ping right after the handshake; the client must
    // answer with a pong without surfacing anything.
    let _ = ws.send(Message::Ping(Bytes::from_static(b"trade-link"))).await;

    let mut inject_rx = state.inject_tx.subscribe();
    let mut close_rx = state.close_tx.subscribe();
    let mut held: Vec<(CallId, String, JsonValue)> = Vec::new();

    loop {
        tokio::select! {
            frame = ws.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        let Ok(parsed) = serde_json::from_str::<ClientFrame>(&text) else {
                            continue;
                        };
                        state.received.lock().unwrap().push(parsed.clone());
                        let ClientFrame::Request { call_id, method, params } = parsed else {
                            continue;
                        };
                        let behavior = state.behavior.lock().unwrap().clone();
                        if behavior.mute || behavior.drop_methods.contains(&method) {
                            continue;
                        }
                        if let Some(code) = behavior.fail_methods.get(&method) {
                            let reply = ServerFrame::CallError {
                                call_id,
                                code: *code,
                                message: format!("{} rejected", method),
                            };
                            if send_frame(&mut ws, &reply).await.is_err() {
                                break;
                            }
                        } else if let Some(batch) = behavior.hold_replies {
                            held.push((call_id, method, params));
                            if held.len() >= batch {
                                for (id, method, params) in held.drain(..).rev() {
                                    let reply = ServerFrame::Reply {
                                        call_id: id,
                                        result: json!({"method": method, "params": params}),
                                    };
                                    if send_frame(&mut ws, &reply).await.is_err() {
                                        return;
                                    }
                                }
                            }
                        } else {
                            let reply = ServerFrame::Reply {
                                call_id,
                                result: json!({"method": method, "params": params}),
                            };
                            if send_frame(&mut ws, &reply).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = ws.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => continue,
                }
            }
            injected = inject_rx.recv() => {
                match injected {
                    Ok(frame) => {
                        if send_frame(&mut ws, &frame).await.is_err() {
                            break;
                        }
                    }
                    Err(_) => continue,
                }
            }
            _ = close_rx.recv() => {
                let _ = ws.close(None).await;
                break;
            }
        }
    }
}

async fn send_frame(
    ws: &mut WebSocketStream<TcpStream>,
    frame: &ServerFrame,
) -> Result<(), ()> {
    let text = serde_json::to_string(frame).expect("encode server frame");
    ws.send(Message::Text(text.into())).await.map_err(|_| ())
}

// ── Client and event helpers ────────────────────────────────────────────────

/// A client with short timeouts suited to an in-process gateway.
pub fn test_client(url: &str) -> TradeLinkClient {
    TradeLinkClient::builder()
        .endpoint(url)
        .timeouts(test_timeouts())
        .build()
        .expect("build test client")
}

pub fn test_timeouts() -> TradeLinkTimeouts {
    TradeLinkTimeouts::builder()
        .connect_timeout(Duration::from_secs(5))
        .handshake_timeout(Duration::from_secs(5))
        .call_timeout(Duration::from_secs(5))
        .sync_timeout(Duration::from_secs(5))
        .probe_timeout(Duration::from_secs(2))
        .build()
}

/// Buffers every event emitted on one topic.
pub struct EventRecorder {
    rx: mpsc::UnboundedReceiver<Event>,
}

impl EventRecorder {
    pub fn subscribe(bus: &EventBus, topic: Topic) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        bus.on(topic, move |event| {
            let _ = tx.send(event.clone());
        });
        Self { rx }
    }

    /// Wait for the next event, bounded at five seconds.
    pub async fn next(&mut self) -> Event {
        tokio::time::timeout(Duration::from_secs(5), self.rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event stream ended")
    }

    /// Event already buffered, if any. Does not wait.
    pub fn try_next(&mut self) -> Option<Event> {
        self.rx.try_recv().ok()
    }

    /// Drain everything buffered so far and return how many there were.
    pub fn drain(&mut self) -> usize {
        let mut count = 0;
        while self.rx.try_recv().is_ok() {
            count += 1;
        }
        count
    }
}
