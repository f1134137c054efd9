//! Data models for the trade-link client.
//!
//! Defines the wire frames exchanged with the gateway and the shared
//! identifier and configuration types. Frame payloads are opaque
//! `serde_json::Value`s; the gateway-specific message catalog is not
//! interpreted here.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use std::fmt;
use std::time::SystemTime;

/// Correlates one outbound request with its eventual reply.
///
/// Allocated monotonically per session; unique only within that session
/// epoch. After a reconnect the counter restarts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct CallId(pub u64);

impl fmt::Display for CallId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identifies one live subscription within a session epoch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct SubscriptionId(pub u64);

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity presented to the gateway during the session handshake.
///
/// The client id must be unique per connected client; the account is
/// optional and scopes account-level bootstrap requests.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub client_id: u32,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub account: String,
}

impl Identity {
    pub fn new(client_id: u32) -> Self {
        Self {
            client_id,
            account: String::new(),
        }
    }

    pub fn with_account(mut self, account: impl Into<String>) -> Self {
        self.account = account.into();
        self
    }
}

impl Default for Identity {
    fn default() -> Self {
        Self::new(1)
    }
}

/// Options governing session establishment behavior.
#[derive(Debug, Clone, Default)]
pub struct ConnectionOptions {
    /// Fail the whole connect attempt when any bootstrap request fails
    /// during synchronization, instead of logging a warning.
    pub strict_sync: bool,

    /// Skip order-related bootstrap requests for read-only sessions.
    pub read_only: bool,
}

impl ConnectionOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_strict_sync(mut self, strict: bool) -> Self {
        self.strict_sync = strict;
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }
}

/// How a subscription update mutates its live result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    /// Append the payload to the accumulated rows.
    Append,
    /// Replace the whole state object with the payload.
    Replace,
    /// Discard the accumulated rows.
    Clear,
}

/// Client-to-gateway frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientFrame {
    /// Session handshake, sent once immediately after the channel opens.
    Hello {
        client_id: u32,
        #[serde(default, skip_serializing_if = "String::is_empty")]
        account: String,
    },

    /// A request expecting exactly one reply correlated by `call_id`.
    Request {
        call_id: CallId,
        method: String,
        params: JsonValue,
    },

    /// Open a streaming subscription.
    Subscribe {
        subscription_id: SubscriptionId,
        topic: String,
        params: JsonValue,
    },

    /// Close a streaming subscription.
    Unsubscribe { subscription_id: SubscriptionId },

    /// Fire-and-forget message carrying no call id.
    Notify { method: String, params: JsonValue },
}

/// Gateway-to-client frames.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerFrame {
    /// Successful handshake acknowledgment.
    HelloAck {
        #[serde(default)]
        accounts: Vec<String>,
        #[serde(default)]
        server_version: u32,
    },

    /// Handshake rejection; the gateway closes the channel afterwards.
    HelloError { message: String },

    /// Reply to the request with the matching `call_id`.
    Reply { call_id: CallId, result: JsonValue },

    /// Error reply for one specific call.
    CallError {
        call_id: CallId,
        code: i64,
        message: String,
    },

    /// Incremental update for one subscription.
    Update {
        subscription_id: SubscriptionId,
        kind: UpdateKind,
        data: JsonValue,
    },

    /// Topic-addressed message not tied to a call or subscription.
    Broadcast { topic: String, data: JsonValue },

    /// Session-level fault not tied to a call.
    Fault { code: i64, message: String },
}

/// Parameters that created a subscription, kept verbatim so the owning
/// layer can resubscribe after a reconnect.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubscribeParams {
    pub topic: String,
    pub params: JsonValue,
}

impl SubscribeParams {
    pub fn new(topic: impl Into<String>, params: JsonValue) -> Self {
        Self {
            topic: topic.into(),
            params,
        }
    }
}

/// Metadata snapshot for one registered subscription.
#[derive(Debug, Clone)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub params: SubscribeParams,
    pub stale: bool,
    pub updates_received: u64,
}

/// A routed subscription update, as delivered on the push channel.
#[derive(Debug, Clone, PartialEq)]
pub struct UpdateEvent {
    pub subscription_id: SubscriptionId,
    pub kind: UpdateKind,
    pub data: JsonValue,
}

// ── Bootstrap battery ───────────────────────────────────────────────────────

/// Bootstrap request issued while the session is synchronizing.
pub const BOOTSTRAP_POSITIONS: &str = "positions";
/// Bootstrap request issued while the session is synchronizing.
/// Skipped for read-only sessions.
pub const BOOTSTRAP_OPEN_ORDERS: &str = "open_orders";
/// Bootstrap request issued while the session is synchronizing.
pub const BOOTSTRAP_ACCOUNT_STATE: &str = "account_state";

// ── Gateway fault codes ─────────────────────────────────────────────────────

/// The gateway rejected the client's credentials or permissions.
pub const FAULT_NOT_AUTHORIZED: i64 = 100;
/// The gateway lost its own upstream connectivity.
pub const FAULT_GATEWAY_UNREACHABLE: i64 = 1100;

/// Faults that cannot be recovered within the current session and must
/// escalate to the supervisor, bypassing the soft-timeout probe.
pub fn is_fatal_fault(code: i64) -> bool {
    matches!(code, FAULT_NOT_AUTHORIZED | FAULT_GATEWAY_UNREACHABLE)
}

// ── Connection statistics ───────────────────────────────────────────────────

/// Traffic counters for one session epoch.
#[derive(Debug, Clone)]
pub struct ConnectionStats {
    pub connected_at: SystemTime,
    pub frames_sent: u64,
    pub frames_received: u64,
    pub bytes_sent: u64,
    pub bytes_received: u64,
}
