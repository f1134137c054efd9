//! Lifecycle event broadcasting.
//!
//! A single [`EventBus`] carries every notification the session layer and
//! the supervisor emit: connection lifecycle, gateway broadcasts, idle
//! detection, and supervisor state changes. Topics form a fixed,
//! compile-time set; each topic holds an ordered listener list.
//!
//! Delivery is synchronous on the emitting task, in registration order.
//! A listener that panics is caught and logged so the remaining listeners
//! for the same emission still run.
//!
//! # Example
//!
//! ```rust
//! use trade_link::{Event, EventBus, Topic};
//!
//! let bus = EventBus::new();
//! let handle = bus.on(Topic::Connected, |_event| {
//!     println!("session is up");
//! });
//! bus.emit(Event::Connected);
//! bus.off(handle);
//! ```

use log::warn;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::fmt;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Notification topics known at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Topic {
    /// A session finished its handshake.
    Connected,
    /// A session was torn down, explicitly or on transport failure.
    Disconnected,
    /// All live subscriptions of the torn-down session went stale.
    SubscriptionsStale,
    /// Gateway broadcast: an order changed status.
    OrderStatus,
    /// Gateway broadcast: account data changed.
    AccountUpdate,
    /// The gateway reported a fault, per-call or session-level.
    Error,
    /// No inbound traffic arrived within the armed idle threshold.
    IdleTimeout,
    /// The supervisor began its start sequence.
    Starting,
    /// The supervisor has a ready session.
    Started,
    /// The supervisor began tearing the session down.
    Stopping,
    /// The supervisor finished tearing the session down.
    Stopped,
    /// Idle traffic raised suspicion; a probe is being issued.
    SoftTimeout,
    /// The probe failed; the session is considered dead.
    HardTimeout,
}

/// Reason attached to a [`Event::Disconnected`] notification.
#[derive(Debug, Clone, PartialEq)]
pub struct DisconnectReason {
    /// Human-readable description of why the session ended.
    pub message: String,
    /// Close code from the transport, if one was received.
    pub code: Option<u16>,
}

impl DisconnectReason {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            code: None,
        }
    }

    pub fn with_code(message: impl Into<String>, code: u16) -> Self {
        Self {
            message: message.into(),
            code: Some(code),
        }
    }
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(code) = self.code {
            write!(f, "{} (code: {})", self.message, code)
        } else {
            write!(f, "{}", self.message)
        }
    }
}

/// Fault carried by an [`Event::Error`] notification.
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayFault {
    pub code: i64,
    pub message: String,
    /// Fatal faults escalate to the supervisor's hard-failure path.
    pub fatal: bool,
}

impl GatewayFault {
    pub fn new(code: i64, message: impl Into<String>, fatal: bool) -> Self {
        Self {
            code,
            message: message.into(),
            fatal,
        }
    }
}

impl fmt::Display for GatewayFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "gateway fault {}: {}", self.code, self.message)
    }
}

/// A notification with its typed payload.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Connected,
    Disconnected(DisconnectReason),
    SubscriptionsStale,
    OrderStatus(JsonValue),
    AccountUpdate(JsonValue),
    Error(GatewayFault),
    /// Carries how long the line had been quiet when the monitor fired.
    IdleTimeout(Duration),
    Starting,
    Started,
    Stopping,
    Stopped,
    SoftTimeout,
    HardTimeout,
}

impl Event {
    /// The topic this event is delivered on.
    pub fn topic(&self) -> Topic {
        match self {
            Event::Connected => Topic::Connected,
            Event::Disconnected(_) => Topic::Disconnected,
            Event::SubscriptionsStale => Topic::SubscriptionsStale,
            Event::OrderStatus(_) => Topic::OrderStatus,
            Event::AccountUpdate(_) => Topic::AccountUpdate,
            Event::Error(_) => Topic::Error,
            Event::IdleTimeout(_) => Topic::IdleTimeout,
            Event::Starting => Topic::Starting,
            Event::Started => Topic::Started,
            Event::Stopping => Topic::Stopping,
            Event::Stopped => Topic::Stopped,
            Event::SoftTimeout => Topic::SoftTimeout,
            Event::HardTimeout => Topic::HardTimeout,
        }
    }
}

type Listener = Arc<dyn Fn(&Event) + Send + Sync>;

/// Handle returned by [`EventBus::on`], used to unregister the listener.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ListenerHandle {
    topic: Topic,
    id: u64,
}

impl ListenerHandle {
    pub fn topic(&self) -> Topic {
        self.topic
    }
}

/// Broadcasts notifications to per-topic listener lists.
///
/// Cloning is cheap; clones share the same listener table, which is how
/// the client, its sessions, and the supervisor all emit into one bus.
#[derive(Clone, Default)]
pub struct EventBus {
    inner: Arc<EventBusInner>,
}

#[derive(Default)]
struct EventBusInner {
    next_id: AtomicU64,
    listeners: Mutex<HashMap<Topic, Vec<(u64, Listener)>>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a listener; delivery order follows registration order.
    pub fn on(
        &self,
        topic: Topic,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let mut table = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        table
            .entry(topic)
            .or_default()
            .push((id, Arc::new(listener)));
        ListenerHandle { topic, id }
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    ///
    /// Safe to call from within a listener: the emission in progress
    /// iterates over a snapshot and is not corrupted.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        let mut table = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match table.get_mut(&handle.topic) {
            Some(list) => {
                let before = list.len();
                list.retain(|(id, _)| *id != handle.id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Deliver an event to every listener of its topic, in registration
    /// order, on the calling task. Panicking listeners are isolated.
    pub fn emit(&self, event: Event) {
        let topic = event.topic();
        let snapshot: Vec<(u64, Listener)> = {
            let table = self
                .inner
                .listeners
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            match table.get(&topic) {
                Some(list) => list.clone(),
                None => return,
            }
        };
        for (id, listener) in snapshot {
            if catch_unwind(AssertUnwindSafe(|| listener(&event))).is_err() {
                warn!(
                    "[trade-link] Listener {} for {:?} panicked during delivery",
                    id, topic
                );
            }
        }
    }

    /// Number of listeners currently registered for a topic.
    pub fn listener_count(&self, topic: Topic) -> usize {
        self.inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&topic)
            .map_or(0, |list| list.len())
    }
}

impl fmt::Debug for EventBus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let table = self
            .inner
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let total: usize = table.values().map(|list| list.len()).sum();
        f.debug_struct("EventBus")
            .field("topics", &table.len())
            .field("listeners", &total)
            .finish()
    }
}
