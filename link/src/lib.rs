//! Client session layer for a long-running trading gateway.
//!
//! `trade-link` keeps one persistent connection to a gateway process and
//! gives callers three things on top of it:
//!
//! - **Request/reply correlation** — many concurrent [`Session::call`]s,
//!   each matched to its reply by a per-session call id, each bounded by
//!   its own timeout. A caller always gets a value or a typed error; a
//!   reply arriving after the caller gave up is discarded.
//! - **Live subscriptions** — [`Session::subscribe`] opens an open-ended
//!   update stream consumed by push ([`SubscriptionHandle::next`]) or
//!   pull ([`LiveResult::snapshot`]), both safe to run concurrently with
//!   the dispatch path writing updates.
//! - **Supervision** — the [`Watchdog`] launches the gateway process,
//!   opens sessions, probes liveness when inbound traffic goes quiet,
//!   and tears everything down and retries on confirmed failure.
//!
//! Lifecycle notifications (connect, disconnect, faults, idle timeouts,
//! supervisor transitions) fan out over the [`EventBus`] to any number
//! of listeners.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use trade_link::{Identity, Topic, TradeLinkClient};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let client = TradeLinkClient::builder()
//!     .endpoint("ws://localhost:4001")
//!     .identity(Identity::new(1).with_account("DU12345"))
//!     .build()?;
//!
//! client.on(Topic::Disconnected, |event| {
//!     eprintln!("session lost: {:?}", event);
//! });
//!
//! let session = client.connect().await?;
//! let positions = session.call("positions", serde_json::json!({}), None).await?;
//! println!("positions: {}", positions);
//!
//! let mut quotes = session
//!     .subscribe("quotes", serde_json::json!({"symbol": "EURUSD"}))
//!     .await?;
//! while let Some(update) = quotes.next().await {
//!     println!("quote update: {:?}", update);
//! }
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod error;
pub mod events;
pub mod models;
pub mod pending;
pub mod session;
pub mod subscriptions;
pub mod timeouts;
pub mod watchdog;

pub use client::{TradeLinkClient, TradeLinkClientBuilder};
pub use error::{Result, TradeLinkError};
pub use events::{DisconnectReason, Event, EventBus, GatewayFault, ListenerHandle, Topic};
pub use models::{
    is_fatal_fault, CallId, ClientFrame, ConnectionOptions, ConnectionStats, Identity,
    ServerFrame, SubscribeParams, SubscriptionId, SubscriptionInfo, UpdateEvent, UpdateKind,
    BOOTSTRAP_ACCOUNT_STATE, BOOTSTRAP_OPEN_ORDERS, BOOTSTRAP_POSITIONS,
    FAULT_GATEWAY_UNREACHABLE, FAULT_NOT_AUTHORIZED,
};
pub use pending::{CallHandle, PendingCalls};
pub use session::{Session, SessionState, SubscriptionHandle};
pub use subscriptions::{LiveResult, LiveSnapshot, Subscriptions};
pub use timeouts::{TradeLinkTimeouts, TradeLinkTimeoutsBuilder};
pub use watchdog::{GatewayCommand, GatewayLauncher, SupervisorState, Watchdog, WatchdogConfig};
