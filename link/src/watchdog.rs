//! Gateway process control and session supervision.
//!
//! [`GatewayLauncher`] starts and stops the external gateway process and
//! mirrors its stdout into the log. [`Watchdog`] sits above one
//! [`TradeLinkClient`]: launch the gateway, give it its startup grace,
//! open a session, arm the idle monitor, and block on failure signals.
//! Idle suspicion is soft and answered with a cheap probe call; a failed
//! probe, a disconnect, a fatal gateway fault, or a process exit tears
//! the whole epoch down, and the loop retries after a delay until
//! explicitly stopped.
//!
//! Supervisor transitions are emitted on the client's event bus
//! (`Starting`, `Started`, `Stopping`, `Stopped`, `SoftTimeout`,
//! `HardTimeout`) so a host can react without driving the retry loop.

use crate::client::TradeLinkClient;
use crate::error::{Result, TradeLinkError};
use crate::events::{Event, EventBus, Topic};
use crate::session::Session;
use crate::timeouts::TradeLinkTimeouts;
use log::{debug, info, warn};
use serde_json::json;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, watch, Mutex as TokioMutex};
use tokio::task::JoinHandle;

// ── Supervisor state ────────────────────────────────────────────────────────

/// Lifecycle states of the [`Watchdog`] control loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SupervisorState {
    Stopped,
    StartingGateway,
    AwaitingReady,
    Connecting,
    Running,
    Stopping,
}

impl SupervisorState {
    fn as_u8(self) -> u8 {
        match self {
            SupervisorState::Stopped => 0,
            SupervisorState::StartingGateway => 1,
            SupervisorState::AwaitingReady => 2,
            SupervisorState::Connecting => 3,
            SupervisorState::Running => 4,
            SupervisorState::Stopping => 5,
        }
    }

    fn from_u8(value: u8) -> Self {
        match value {
            1 => SupervisorState::StartingGateway,
            2 => SupervisorState::AwaitingReady,
            3 => SupervisorState::Connecting,
            4 => SupervisorState::Running,
            5 => SupervisorState::Stopping,
            _ => SupervisorState::Stopped,
        }
    }
}

// ── Gateway command line ────────────────────────────────────────────────────

/// Named options assembled into the gateway launch command line.
///
/// Only the options that were set appear as arguments, in a fixed order.
#[derive(Debug, Clone)]
pub struct GatewayCommand {
    program: PathBuf,
    install_path: Option<PathBuf>,
    config_path: Option<PathBuf>,
    username: Option<String>,
    password: Option<String>,
    mode: Option<String>,
}

impl GatewayCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            install_path: None,
            config_path: None,
            username: None,
            password: None,
            mode: None,
        }
    }

    /// Installation directory passed to the launch script.
    pub fn with_install_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.install_path = Some(path.into());
        self
    }

    /// Configuration file passed to the launch script.
    pub fn with_config_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.config_path = Some(path.into());
        self
    }

    /// Login credentials passed to the launch script.
    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.username = Some(username.into());
        self.password = Some(password.into());
        self
    }

    /// Operating mode, e.g. `paper` or `live`.
    pub fn with_mode(mut self, mode: impl Into<String>) -> Self {
        self.mode = Some(mode.into());
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    /// Arguments in the fixed option order, skipping unset options.
    pub fn to_args(&self) -> Vec<String> {
        let mut args = Vec::new();
        if let Some(path) = &self.install_path {
            args.push(format!("--install-path={}", path.display()));
        }
        if let Some(path) = &self.config_path {
            args.push(format!("--config={}", path.display()));
        }
        if let Some(username) = &self.username {
            args.push(format!("--user={}", username));
        }
        if let Some(password) = &self.password {
            args.push(format!("--pw={}", password));
        }
        if let Some(mode) = &self.mode {
            args.push(format!("--mode={}", mode));
        }
        args
    }
}

// ── Gateway launcher ────────────────────────────────────────────────────────

/// Owns the external gateway process.
///
/// `start` spawns the process with stdout piped; a monitor task logs each
/// stdout line and flips the exit signal when the stream ends. The
/// process stdout is read purely for logging; nothing is parsed out of it.
pub struct GatewayLauncher {
    command: GatewayCommand,
    child: Option<Child>,
    monitor: Option<JoinHandle<()>>,
    exit_tx: watch::Sender<bool>,
}

impl GatewayLauncher {
    pub fn new(command: GatewayCommand) -> Self {
        let (exit_tx, _) = watch::channel(false);
        Self {
            command,
            child: None,
            monitor: None,
            exit_tx,
        }
    }

    /// Spawn the gateway process. A launcher that already holds a running
    /// process is left alone.
    pub async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }
        info!(
            "[trade-link] Starting gateway process {}",
            self.command.program.display()
        );
        let mut child = Command::new(&self.command.program)
            .args(self.command.to_args())
            .stdout(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TradeLinkError::ProcessError(format!(
                    "Failed to start gateway '{}': {}",
                    self.command.program.display(),
                    e
                ))
            })?;

        self.exit_tx.send_replace(false);
        if let Some(stdout) = child.stdout.take() {
            let exit_tx = self.exit_tx.clone();
            self.monitor = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    debug!("[gateway] {}", line);
                }
                // End of stream: the gateway closed its stdout, which only
                // happens when the process exits.
                exit_tx.send_replace(true);
            }));
        }
        self.child = Some(child);
        Ok(())
    }

    /// Kill the gateway process and wait for it to be reaped. A launcher
    /// with no running process is left alone.
    pub async fn terminate(&mut self) {
        if let Some(monitor) = self.monitor.take() {
            monitor.abort();
        }
        if let Some(mut child) = self.child.take() {
            info!("[trade-link] Terminating gateway process");
            let _ = child.start_kill();
            let _ = child.wait().await;
            self.exit_tx.send_replace(true);
        }
    }

    /// Whether a started process has not been observed exiting.
    pub fn is_running(&self) -> bool {
        self.child.is_some() && !*self.exit_tx.borrow()
    }

    /// Receiver that reads `true` once the process has exited.
    pub fn exit_signal(&self) -> watch::Receiver<bool> {
        self.exit_tx.subscribe()
    }
}

// ── Watchdog configuration ──────────────────────────────────────────────────

/// Timing and probe configuration for the [`Watchdog`].
#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    /// Outer bound on one whole connect attempt (dial, handshake, and
    /// bootstrap synchronization together). Zero disables the bound.
    /// Default: 30 seconds.
    pub connect_timeout: Duration,

    /// Grace period between launching the gateway process and the first
    /// connect attempt. Only applies when a launcher is configured.
    /// Default: 30 seconds.
    pub app_startup_time: Duration,

    /// Idle-traffic threshold armed on each session. Default: 20 seconds.
    pub app_idle_timeout: Duration,

    /// Deadline for the liveness probe call issued after a soft timeout.
    /// Default: 4 seconds.
    pub probe_timeout: Duration,

    /// Delay between tearing a failed epoch down and the next start
    /// attempt. Default: 2 seconds.
    pub retry_delay: Duration,

    /// Cheap request used to probe gateway liveness after a soft timeout.
    /// Default: `server_time`.
    pub probe_method: String,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            app_startup_time: Duration::from_secs(30),
            app_idle_timeout: Duration::from_secs(20),
            probe_timeout: Duration::from_secs(4),
            retry_delay: Duration::from_secs(2),
            probe_method: "server_time".to_string(),
        }
    }
}

impl WatchdogConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_app_startup_time(mut self, duration: Duration) -> Self {
        self.app_startup_time = duration;
        self
    }

    pub fn with_app_idle_timeout(mut self, timeout: Duration) -> Self {
        self.app_idle_timeout = timeout;
        self
    }

    pub fn with_probe_timeout(mut self, timeout: Duration) -> Self {
        self.probe_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_probe_method(mut self, method: impl Into<String>) -> Self {
        self.probe_method = method.into();
        self
    }
}

// ── Watchdog ────────────────────────────────────────────────────────────────

/// Failure signals funneled from the event listeners into the watch loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureSignal {
    Idle,
    Disconnected,
    Fatal,
    GatewayExited,
}

/// Keeps the gateway process and one client session alive.
///
/// Intended for an event-driven host that re-initializes itself upon
/// (re-)connect: the watchdog restarts sessions but does not replay
/// subscriptions; the host rebuilds its own state from the stored
/// subscription params when `Started` fires again.
///
/// # Examples
///
/// ```rust,no_run
/// use trade_link::{
///     GatewayCommand, GatewayLauncher, TradeLinkClient, Watchdog, WatchdogConfig,
/// };
///
/// # async fn example() -> trade_link::Result<()> {
/// let client = TradeLinkClient::builder()
///     .endpoint("ws://localhost:4001")
///     .build()?;
///
/// let command = GatewayCommand::new("/opt/gateway/bin/start.sh")
///     .with_config_path("/etc/gateway.ini")
///     .with_credentials("demo", "demo")
///     .with_mode("paper");
///
/// let mut watchdog = Watchdog::new(client, WatchdogConfig::default())
///     .with_launcher(GatewayLauncher::new(command));
/// watchdog.start();
/// // ... host runs until shutdown ...
/// watchdog.stop().await;
/// # Ok(())
/// # }
/// ```
pub struct Watchdog {
    client: TradeLinkClient,
    config: WatchdogConfig,
    launcher: Arc<TokioMutex<Option<GatewayLauncher>>>,
    state: Arc<AtomicU8>,
    stop_tx: watch::Sender<bool>,
    current: Arc<TokioMutex<Option<Arc<Session>>>>,
    runner: Option<JoinHandle<()>>,
}

impl Watchdog {
    /// Supervise connections opened by `client`. Without a launcher the
    /// watchdog only drives the connection, for a gateway process that is
    /// managed externally.
    pub fn new(client: TradeLinkClient, config: WatchdogConfig) -> Self {
        let (stop_tx, _) = watch::channel(false);
        Self {
            client,
            config,
            launcher: Arc::new(TokioMutex::new(None)),
            state: Arc::new(AtomicU8::new(SupervisorState::Stopped.as_u8())),
            stop_tx,
            current: Arc::new(TokioMutex::new(None)),
            runner: None,
        }
    }

    /// Also own the gateway process itself.
    pub fn with_launcher(self, launcher: GatewayLauncher) -> Self {
        // Uncontended before `start`; the control loop is the only other
        // holder of this slot.
        match self.launcher.try_lock() {
            Ok(mut slot) => *slot = Some(launcher),
            Err(_) => warn!("[trade-link] Launcher not installed: watchdog already running"),
        }
        self
    }

    /// Current control-loop state.
    pub fn state(&self) -> SupervisorState {
        SupervisorState::from_u8(self.state.load(Ordering::SeqCst))
    }

    /// The session of the current epoch, if one is up.
    pub async fn session(&self) -> Option<Arc<Session>> {
        self.current.lock().await.clone()
    }

    /// The event bus supervisor transitions are emitted on.
    pub fn events(&self) -> EventBus {
        self.client.events()
    }

    /// Whether the control loop has been started and not stopped.
    pub fn is_started(&self) -> bool {
        self.runner.is_some()
    }

    /// Start the control loop. Emits `Starting` and returns immediately;
    /// progress is reported through the event bus. Starting twice is a
    /// no-op.
    pub fn start(&mut self) {
        if self.runner.is_some() {
            return;
        }
        info!("[trade-link] Watchdog starting");
        self.stop_tx.send_replace(false);
        self.client.events().emit(Event::Starting);
        self.runner = Some(tokio::spawn(run_loop(
            self.client.clone(),
            self.config.clone(),
            self.launcher.clone(),
            self.state.clone(),
            self.stop_tx.subscribe(),
            self.current.clone(),
        )));
    }

    /// Stop the control loop: emits `Stopping`, tears the current epoch
    /// down, and waits for the loop to finish. Stopping twice is a no-op.
    pub async fn stop(&mut self) {
        let Some(runner) = self.runner.take() else {
            return;
        };
        info!("[trade-link] Watchdog stopping");
        self.state
            .store(SupervisorState::Stopping.as_u8(), Ordering::SeqCst);
        self.client.events().emit(Event::Stopping);
        self.stop_tx.send_replace(true);
        // Unblock the loop's failure wait promptly.
        if let Some(session) = self.current.lock().await.clone() {
            session.disconnect().await;
        }
        let _ = runner.await;
    }
}

impl Drop for Watchdog {
    fn drop(&mut self) {
        // Best-effort: the gateway child is killed on drop of its handle.
        self.stop_tx.send_replace(true);
        if let Some(runner) = self.runner.take() {
            runner.abort();
        }
    }
}

// ── Control loop ────────────────────────────────────────────────────────────

fn set_state(state: &AtomicU8, value: SupervisorState) {
    state.store(value.as_u8(), Ordering::SeqCst);
}

/// Sleep, returning early with `true` when stop is requested.
async fn sleep_or_stop(duration: Duration, stop_rx: &mut watch::Receiver<bool>) -> bool {
    tokio::select! {
        _ = tokio::time::sleep(duration) => false,
        _ = stop_rx.wait_for(|stopped| *stopped) => true,
    }
}

/// Resolves once the gateway process exits; never, without a launcher.
async fn wait_exit(exit_rx: &mut Option<watch::Receiver<bool>>) {
    match exit_rx {
        Some(rx) => {
            let _ = rx.wait_for(|exited| *exited).await;
        }
        None => std::future::pending().await,
    }
}

async fn run_loop(
    client: TradeLinkClient,
    config: WatchdogConfig,
    launcher: Arc<TokioMutex<Option<GatewayLauncher>>>,
    state: Arc<AtomicU8>,
    mut stop_rx: watch::Receiver<bool>,
    current: Arc<TokioMutex<Option<Arc<Session>>>>,
) {
    let events = client.events();
    loop {
        if *stop_rx.borrow() {
            break;
        }

        run_epoch(
            &client, &config, &launcher, &state, &mut stop_rx, &current, &events,
        )
        .await;

        // Teardown, whatever ended the epoch: close the session, kill the
        // gateway, report. The session teardown fails every pending call
        // with "connection lost" and marks subscriptions stale.
        set_state(&state, SupervisorState::Stopping);
        if let Some(session) = current.lock().await.take() {
            session.disconnect().await;
        }
        if let Some(gateway) = launcher.lock().await.as_mut() {
            gateway.terminate().await;
        }
        events.emit(Event::Stopped);
        set_state(&state, SupervisorState::Stopped);

        if *stop_rx.borrow() || sleep_or_stop(config.retry_delay, &mut stop_rx).await {
            break;
        }
    }
}

/// One start-to-failure pass. Returns when the session is confirmed dead
/// or stop was requested; the caller performs the teardown.
async fn run_epoch(
    client: &TradeLinkClient,
    config: &WatchdogConfig,
    launcher: &TokioMutex<Option<GatewayLauncher>>,
    state: &AtomicU8,
    stop_rx: &mut watch::Receiver<bool>,
    current: &TokioMutex<Option<Arc<Session>>>,
    events: &EventBus,
) {
    // Launch the gateway process and give it its startup grace.
    let mut exit_rx = None;
    {
        let mut guard = launcher.lock().await;
        if let Some(gateway) = guard.as_mut() {
            set_state(state, SupervisorState::StartingGateway);
            if let Err(e) = gateway.start().await {
                warn!("[trade-link] Failed to start gateway: {}", e);
                return;
            }
            exit_rx = Some(gateway.exit_signal());
        }
    }
    if exit_rx.is_some() {
        set_state(state, SupervisorState::AwaitingReady);
        if sleep_or_stop(config.app_startup_time, stop_rx).await {
            return;
        }
    }

    // Open the session.
    set_state(state, SupervisorState::Connecting);
    let attempt = client.connect();
    let connected = if TradeLinkTimeouts::is_no_timeout(config.connect_timeout) {
        attempt.await
    } else {
        match tokio::time::timeout(config.connect_timeout, attempt).await {
            Ok(result) => result,
            Err(_) => Err(TradeLinkError::TimeoutError(format!(
                "Connect attempt exceeded {:?}",
                config.connect_timeout
            ))),
        }
    };
    let session = match connected {
        Ok(session) => Arc::new(session),
        Err(e) => {
            warn!("[trade-link] Connect failed: {}", e);
            return;
        }
    };
    *current.lock().await = Some(session.clone());
    set_state(state, SupervisorState::Running);
    events.emit(Event::Started);

    // Watch for failure. Disconnect, fatal fault, idle timeout, and
    // gateway exit all funnel into one channel; idle is the only soft one.
    session.arm_idle_monitor(config.app_idle_timeout);
    let (failure_tx, mut failure_rx) = mpsc::channel::<FailureSignal>(8);
    let tx = failure_tx.clone();
    let on_idle = events.on(Topic::IdleTimeout, move |_| {
        let _ = tx.try_send(FailureSignal::Idle);
    });
    let tx = failure_tx.clone();
    let on_disconnect = events.on(Topic::Disconnected, move |_| {
        let _ = tx.try_send(FailureSignal::Disconnected);
    });
    let tx = failure_tx;
    let on_error = events.on(Topic::Error, move |event| {
        if let Event::Error(fault) = event {
            if fault.fatal {
                let _ = tx.try_send(FailureSignal::Fatal);
            }
        }
    });

    loop {
        let signal = tokio::select! {
            biased;
            _ = stop_rx.wait_for(|stopped| *stopped) => None,
            _ = wait_exit(&mut exit_rx) => Some(FailureSignal::GatewayExited),
            signal = failure_rx.recv() => signal,
        };
        match signal {
            // Idle suspicion: probe before declaring the session dead.
            Some(FailureSignal::Idle) => {
                debug!("[trade-link] Soft timeout, probing the gateway");
                events.emit(Event::SoftTimeout);
                let probe = session
                    .call(&config.probe_method, json!({}), Some(config.probe_timeout))
                    .await;
                match probe {
                    Ok(_) => {
                        session.arm_idle_monitor(config.app_idle_timeout);
                    }
                    Err(e) => {
                        warn!("[trade-link] Liveness probe failed: {}", e);
                        events.emit(Event::HardTimeout);
                        break;
                    }
                }
            }
            Some(FailureSignal::Disconnected) => {
                warn!("[trade-link] Session disconnected");
                break;
            }
            Some(FailureSignal::Fatal) => {
                warn!("[trade-link] Fatal gateway fault, restarting the session");
                break;
            }
            Some(FailureSignal::GatewayExited) => {
                warn!("[trade-link] Gateway process exited");
                break;
            }
            // Stop requested, or every signal source is gone.
            None => break,
        }
    }

    events.off(on_idle);
    events.off(on_disconnect);
    events.off(on_error);
}
