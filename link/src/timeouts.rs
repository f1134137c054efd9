//! Timeout configuration for trade-link operations.
//!
//! Centralizes every deadline the session layer applies: connection
//! establishment, the handshake, individual calls, bootstrap
//! synchronization, liveness probes, and idle detection.

use std::time::Duration;

/// Timeout configuration for trade-link operations.
///
/// # Examples
///
/// ```rust
/// use trade_link::TradeLinkTimeouts;
/// use std::time::Duration;
///
/// // Use defaults (recommended for most cases)
/// let timeouts = TradeLinkTimeouts::default();
///
/// // Custom timeouts for a slow gateway host
/// let timeouts = TradeLinkTimeouts::builder()
///     .connect_timeout(Duration::from_secs(30))
///     .call_timeout(Duration::from_secs(60))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TradeLinkTimeouts {
    /// Timeout for establishing the gateway connection (TCP + handshake
    /// of the underlying channel). Default: 10 seconds.
    pub connect_timeout: Duration,

    /// Timeout for the session handshake exchange after the channel is
    /// open. Default: 5 seconds.
    pub handshake_timeout: Duration,

    /// Default deadline for a `call` when the caller does not pass one.
    /// Default: 30 seconds.
    pub call_timeout: Duration,

    /// Per-request deadline for the bootstrap battery issued while the
    /// session is synchronizing. Default: 10 seconds.
    pub sync_timeout: Duration,

    /// Deadline for the supervisor's liveness probe call.
    /// Default: 4 seconds.
    pub probe_timeout: Duration,

    /// Idle-traffic threshold armed on the session when requested.
    /// Set to 0 to leave the idle monitor disarmed.
    /// Default: 0 (disarmed).
    pub idle_timeout: Duration,
}

impl Default for TradeLinkTimeouts {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            handshake_timeout: Duration::from_secs(5),
            call_timeout: Duration::from_secs(30),
            sync_timeout: Duration::from_secs(10),
            probe_timeout: Duration::from_secs(4),
            idle_timeout: Duration::ZERO,
        }
    }
}

impl TradeLinkTimeouts {
    /// Create a new builder for custom timeout configuration.
    pub fn builder() -> TradeLinkTimeoutsBuilder {
        TradeLinkTimeoutsBuilder::new()
    }

    /// Timeouts suited to a gateway on the same host.
    pub fn fast() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            handshake_timeout: Duration::from_secs(2),
            call_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(3),
            probe_timeout: Duration::from_secs(2),
            idle_timeout: Duration::ZERO,
        }
    }

    /// Timeouts suited to a remote gateway over an unreliable network.
    pub fn relaxed() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            handshake_timeout: Duration::from_secs(15),
            call_timeout: Duration::from_secs(120),
            sync_timeout: Duration::from_secs(30),
            probe_timeout: Duration::from_secs(10),
            idle_timeout: Duration::ZERO,
        }
    }

    /// Check if a duration represents "no timeout" (zero or very large).
    pub fn is_no_timeout(duration: Duration) -> bool {
        duration.is_zero() || duration > Duration::from_secs(86400 * 365)
    }
}

/// Builder for creating custom [`TradeLinkTimeouts`] configurations.
#[derive(Debug, Clone)]
pub struct TradeLinkTimeoutsBuilder {
    timeouts: TradeLinkTimeouts,
}

impl TradeLinkTimeoutsBuilder {
    fn new() -> Self {
        Self {
            timeouts: TradeLinkTimeouts::default(),
        }
    }

    /// Set the connection establishment timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.connect_timeout = timeout;
        self
    }

    /// Set the connection establishment timeout in seconds.
    pub fn connect_timeout_secs(self, secs: u64) -> Self {
        self.connect_timeout(Duration::from_secs(secs))
    }

    /// Set the session handshake timeout.
    pub fn handshake_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.handshake_timeout = timeout;
        self
    }

    /// Set the session handshake timeout in seconds.
    pub fn handshake_timeout_secs(self, secs: u64) -> Self {
        self.handshake_timeout(Duration::from_secs(secs))
    }

    /// Set the default call deadline.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.call_timeout = timeout;
        self
    }

    /// Set the default call deadline in seconds.
    pub fn call_timeout_secs(self, secs: u64) -> Self {
        self.call_timeout(Duration::from_secs(secs))
    }

    /// Set the per-request bootstrap synchronization deadline.
    pub fn sync_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.sync_timeout = timeout;
        self
    }

    /// Set the per-request bootstrap synchronization deadline in seconds.
    pub fn sync_timeout_secs(self, secs: u64) -> Self {
        self.sync_timeout(Duration::from_secs(secs))
    }

    /// Set the liveness probe deadline.
    pub fn probe_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.probe_timeout = timeout;
        self
    }

    /// Set the liveness probe deadline in seconds.
    pub fn probe_timeout_secs(self, secs: u64) -> Self {
        self.probe_timeout(Duration::from_secs(secs))
    }

    /// Set the idle-traffic threshold. Set to 0 to leave the monitor
    /// disarmed.
    pub fn idle_timeout(mut self, timeout: Duration) -> Self {
        self.timeouts.idle_timeout = timeout;
        self
    }

    /// Set the idle-traffic threshold in seconds.
    pub fn idle_timeout_secs(self, secs: u64) -> Self {
        self.idle_timeout(Duration::from_secs(secs))
    }

    /// Build the timeout configuration.
    pub fn build(self) -> TradeLinkTimeouts {
        self.timeouts
    }
}
