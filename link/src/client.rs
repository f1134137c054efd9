//! Main trade-link client with builder pattern.
//!
//! Provides the primary interface for connecting to a trading gateway
//! and opening sessions. The client is cheap configuration plus the
//! shared event bus; every [`connect`](TradeLinkClient::connect) opens an
//! independent session epoch against the configured endpoint.

use crate::{
    error::{Result, TradeLinkError},
    events::{Event, EventBus, ListenerHandle, Topic},
    models::{ConnectionOptions, Identity},
    session::Session,
    timeouts::TradeLinkTimeouts,
};

/// Main trade-link client.
///
/// Use [`TradeLinkClientBuilder`] to construct instances with custom
/// configuration. The client owns the [`EventBus`], so listeners
/// registered here keep firing across reconnects: each session emits
/// into the same bus.
///
/// # Examples
///
/// ```rust,no_run
/// use trade_link::{Identity, TradeLinkClient};
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let client = TradeLinkClient::builder()
///     .endpoint("ws://localhost:4001")
///     .identity(Identity::new(1).with_account("DU12345"))
///     .build()?;
///
/// let session = client.connect().await?;
/// let time = session.call("server_time", serde_json::json!({}), None).await?;
/// println!("gateway time: {}", time);
/// # Ok(())
/// # }
/// ```
#[derive(Clone)]
pub struct TradeLinkClient {
    endpoint: String,
    identity: Identity,
    timeouts: TradeLinkTimeouts,
    options: ConnectionOptions,
    events: EventBus,
}

impl TradeLinkClient {
    /// Create a new builder for configuring the client.
    pub fn builder() -> TradeLinkClientBuilder {
        TradeLinkClientBuilder::new()
    }

    /// Open a new session against the configured endpoint.
    ///
    /// Walks the full establishment sequence: dial, handshake, bootstrap
    /// synchronization. Returns once the session is `Ready` (or once a
    /// strict-sync failure tore it down). Each call opens an independent
    /// session epoch; call ids and subscription ids restart per epoch.
    pub async fn connect(&self) -> Result<Session> {
        Session::connect(
            &self.endpoint,
            self.identity.clone(),
            &self.timeouts,
            &self.options,
            self.events.clone(),
        )
        .await
    }

    /// Register a listener for a notification topic.
    ///
    /// Listeners survive session teardown; a reconnected session emits
    /// into the same bus.
    pub fn on(
        &self,
        topic: Topic,
        listener: impl Fn(&Event) + Send + Sync + 'static,
    ) -> ListenerHandle {
        self.events.on(topic, listener)
    }

    /// Unregister a listener. Returns `false` if it was already gone.
    pub fn off(&self, handle: ListenerHandle) -> bool {
        self.events.off(handle)
    }

    /// The event bus shared by this client and its sessions.
    pub fn events(&self) -> EventBus {
        self.events.clone()
    }

    /// Endpoint this client dials.
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Identity presented during session handshakes.
    pub fn identity(&self) -> &Identity {
        &self.identity
    }

    /// Get the configured timeouts.
    pub fn timeouts(&self) -> &TradeLinkTimeouts {
        &self.timeouts
    }

    /// Get the configured connection options.
    pub fn connection_options(&self) -> &ConnectionOptions {
        &self.options
    }
}

/// Builder for configuring [`TradeLinkClient`] instances.
pub struct TradeLinkClientBuilder {
    endpoint: Option<String>,
    identity: Identity,
    timeouts: TradeLinkTimeouts,
    options: ConnectionOptions,
    events: Option<EventBus>,
}

impl TradeLinkClientBuilder {
    fn new() -> Self {
        Self {
            endpoint: None,
            identity: Identity::default(),
            timeouts: TradeLinkTimeouts::default(),
            options: ConnectionOptions::default(),
            events: None,
        }
    }

    /// Set the gateway endpoint (`ws://`, `wss://`, `http://`, or
    /// `https://`; HTTP schemes are mapped to their socket counterparts).
    pub fn endpoint(mut self, endpoint: impl Into<String>) -> Self {
        self.endpoint = Some(endpoint.into());
        self
    }

    /// Set the identity presented during the session handshake.
    pub fn identity(mut self, identity: Identity) -> Self {
        self.identity = identity;
        self
    }

    /// Set the client id, keeping the rest of the identity.
    pub fn client_id(mut self, client_id: u32) -> Self {
        self.identity.client_id = client_id;
        self
    }

    /// Set the account scope, keeping the rest of the identity.
    pub fn account(mut self, account: impl Into<String>) -> Self {
        self.identity.account = account.into();
        self
    }

    /// Set comprehensive timeout configuration for all operations.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use trade_link::{TradeLinkClient, TradeLinkTimeouts};
    ///
    /// # fn example() -> trade_link::Result<()> {
    /// let client = TradeLinkClient::builder()
    ///     .endpoint("ws://localhost:4001")
    ///     .timeouts(TradeLinkTimeouts::fast())
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn timeouts(mut self, timeouts: TradeLinkTimeouts) -> Self {
        self.timeouts = timeouts;
        self
    }

    /// Set connection options for session establishment behavior.
    ///
    /// # Example
    ///
    /// ```rust,no_run
    /// use trade_link::{ConnectionOptions, TradeLinkClient};
    ///
    /// # fn example() -> trade_link::Result<()> {
    /// let client = TradeLinkClient::builder()
    ///     .endpoint("ws://localhost:4001")
    ///     .connection_options(
    ///         ConnectionOptions::new()
    ///             .with_strict_sync(true)
    ///             .with_read_only(true),
    ///     )
    ///     .build()?;
    /// # Ok(())
    /// # }
    /// ```
    pub fn connection_options(mut self, options: ConnectionOptions) -> Self {
        self.options = options;
        self
    }

    /// Use an existing event bus instead of a fresh one.
    ///
    /// Lets a host wire several clients into one notification stream.
    pub fn event_bus(mut self, events: EventBus) -> Self {
        self.events = Some(events);
        self
    }

    /// Build the client.
    pub fn build(self) -> Result<TradeLinkClient> {
        let endpoint = self
            .endpoint
            .ok_or_else(|| TradeLinkError::ConfigurationError("endpoint is required".into()))?;

        Ok(TradeLinkClient {
            endpoint,
            identity: self.identity,
            timeouts: self.timeouts,
            options: self.options,
            events: self.events.unwrap_or_default(),
        })
    }
}
