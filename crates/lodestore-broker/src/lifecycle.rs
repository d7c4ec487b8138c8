//! Embedded broker lifecycle.
//!
//! A broker moves through a supervised state machine:
//!
//! ```text
//! NotStarted ──► Starting ──► Ready ──► ShuttingDown ──► Stopped
//!                    │                                     ▲
//!                    └─────────────── (failed start) ──────┘
//! ```
//!
//! The current state is published on a `watch` channel so callers (the
//! HTTP readiness check, tests) can observe it without polling the broker.
//!
//! Two brokers implement [`EmbeddedBroker`]:
//!
//! - [`TcpBroker`] serves the wire protocol on a TCP listener, backed by the
//!   SQLite [`DurableEngine`] under the configured storage directory.
//! - [`InMemoryBroker`] has no listener; clients talk to a
//!   [`MemoryEngine`] in-process.

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::client::BrokerClient;
use crate::engine::{DurableEngine, Engine, LocalConnection, MemoryEngine, spawn_sweeper};
use crate::error::{BrokerError, BrokerResult};
use crate::kv::KvConnection;
use crate::server::BrokerServer;

// ---------------------------------------------------------------------------
// State machine
// ---------------------------------------------------------------------------

/// Lifecycle state of an embedded broker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BrokerState {
    NotStarted,
    Starting,
    Ready,
    ShuttingDown,
    Stopped,
}

impl BrokerState {
    /// Whether the state machine permits moving from `self` to `next`.
    pub fn can_transition_to(self, next: BrokerState) -> bool {
        use BrokerState::*;
        matches!(
            (self, next),
            (NotStarted, Starting)
                | (Starting, Ready)
                | (Starting, Stopped)
                | (Ready, ShuttingDown)
                | (ShuttingDown, Stopped)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::NotStarted => "not_started",
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::ShuttingDown => "shutting_down",
            Self::Stopped => "stopped",
        }
    }
}

impl fmt::Display for BrokerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Observable holder of a [`BrokerState`].
#[derive(Debug)]
pub struct Lifecycle {
    tx: watch::Sender<BrokerState>,
}

impl Default for Lifecycle {
    fn default() -> Self {
        Self::new()
    }
}

impl Lifecycle {
    pub fn new() -> Self {
        let (tx, _) = watch::channel(BrokerState::NotStarted);
        Self { tx }
    }

    pub fn state(&self) -> BrokerState {
        *self.tx.borrow()
    }

    pub fn subscribe(&self) -> watch::Receiver<BrokerState> {
        self.tx.subscribe()
    }

    /// Move to `to`, returning the previous state.
    pub fn transition(&self, to: BrokerState) -> BrokerResult<BrokerState> {
        let mut outcome = Ok(to);
        self.tx.send_if_modified(|state| {
            if state.can_transition_to(to) {
                outcome = Ok(*state);
                *state = to;
                true
            } else {
                outcome = Err(BrokerError::InvalidTransition { from: *state, to });
                false
            }
        });
        if let Ok(from) = outcome {
            tracing::debug!(%from, %to, "broker state changed");
        }
        outcome
    }
}

// ---------------------------------------------------------------------------
// Options
// ---------------------------------------------------------------------------

/// Settings for an embedded broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BrokerOptions {
    /// Interface to listen on.
    pub host: IpAddr,
    /// Port to listen on; `0` picks an ephemeral port.
    pub port: u16,
    /// Directory holding the durable store.
    pub storage_dir: PathBuf,
    /// Upper bound on the wait for ready-for-connections.
    pub ready_timeout: Duration,
    /// How often expired entries are swept.
    pub sweep_interval: Duration,
}

impl Default for BrokerOptions {
    fn default() -> Self {
        Self {
            host: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            port: 4222,
            storage_dir: PathBuf::from("./data"),
            ready_timeout: Duration::from_secs(5),
            sweep_interval: Duration::from_secs(1),
        }
    }
}

impl BrokerOptions {
    pub fn listen_addr(&self) -> SocketAddr {
        SocketAddr::new(self.host, self.port)
    }
}

/// Address a client should dial to reach a listener bound at `bound`.
/// Wildcard binds are reached over loopback.
pub fn client_addr(bound: SocketAddr) -> SocketAddr {
    match bound.ip() {
        IpAddr::V4(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), bound.port())
        }
        IpAddr::V6(ip) if ip.is_unspecified() => {
            SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), bound.port())
        }
        _ => bound,
    }
}

// ---------------------------------------------------------------------------
// Capability
// ---------------------------------------------------------------------------

/// A broker the application starts, connects to, and shuts down.
#[async_trait]
pub trait EmbeddedBroker: Send + Sync {
    /// Start serving and wait until ready, bounded by the ready timeout.
    async fn start(&self) -> BrokerResult<()>;

    /// Open a new client connection.  Requires the `Ready` state.
    async fn connect(&self) -> BrokerResult<Arc<dyn KvConnection>>;

    /// Stop serving.  In-flight requests are drained until `deadline`
    /// elapses, after which the broker is torn down and `ShutdownTimeout` is
    /// returned.  Shutting down an already stopped broker is a no-op.
    async fn shutdown(&self, deadline: Duration) -> BrokerResult<()>;

    fn state(&self) -> BrokerState;

    fn subscribe(&self) -> watch::Receiver<BrokerState>;

    /// Address clients reach the broker on, once ready.  `None` for brokers
    /// without a listener.
    fn client_addr(&self) -> Option<SocketAddr>;
}

fn not_ready(state: BrokerState) -> BrokerError {
    BrokerError::NotReady {
        reason: format!("broker is {state}"),
    }
}

/// `Ok` when a shutdown request should proceed, `Err(Ok)` when there is
/// nothing to do.
fn begin_shutdown(lifecycle: &Lifecycle) -> Result<(), BrokerResult<()>> {
    if lifecycle.state() == BrokerState::Stopped {
        return Err(Ok(()));
    }
    lifecycle
        .transition(BrokerState::ShuttingDown)
        .map(|_| ())
        .map_err(Err)
}

/// Wait for `task` until `expires`.  A task still running at the deadline
/// is aborted and `false` is returned.  An already expired deadline never
/// waits.
async fn join_until(mut task: JoinHandle<()>, expires: Instant) -> bool {
    if Instant::now() >= expires && !task.is_finished() {
        task.abort();
        return false;
    }
    match tokio::time::timeout_at(expires, &mut task).await {
        Ok(_) => true,
        Err(_) => {
            task.abort();
            false
        }
    }
}

// ---------------------------------------------------------------------------
// TCP broker
// ---------------------------------------------------------------------------

/// Broker serving the wire protocol over TCP.
pub struct TcpBroker {
    options: BrokerOptions,
    engine: Option<Arc<dyn Engine>>,
    lifecycle: Lifecycle,
    bound: OnceLock<SocketAddr>,
    running: Mutex<Option<Running>>,
}

struct Running {
    shutdown: watch::Sender<bool>,
    server: JoinHandle<()>,
    sweeper: JoinHandle<()>,
}

impl TcpBroker {
    /// A broker backed by a [`DurableEngine`] in `options.storage_dir`.
    pub fn new(options: BrokerOptions) -> Self {
        Self {
            options,
            engine: None,
            lifecycle: Lifecycle::new(),
            bound: OnceLock::new(),
            running: Mutex::new(None),
        }
    }

    /// A broker serving a caller-supplied engine instead of opening one.
    pub fn with_engine(options: BrokerOptions, engine: Arc<dyn Engine>) -> Self {
        Self {
            engine: Some(engine),
            ..Self::new(options)
        }
    }

    pub fn options(&self) -> &BrokerOptions {
        &self.options
    }

    async fn open_engine(&self) -> BrokerResult<Arc<dyn Engine>> {
        if let Some(engine) = &self.engine {
            return Ok(Arc::clone(engine));
        }
        let dir = self.options.storage_dir.clone();
        let engine = tokio::task::spawn_blocking(move || DurableEngine::open(dir)).await??;
        Ok(Arc::new(engine))
    }

    /// Open the engine and bind the listener.  Both share the
    /// `ready_timeout` bound.
    async fn launch(&self) -> BrokerResult<(SocketAddr, Running)> {
        let ready_timeout = self.options.ready_timeout;
        let expires = Instant::now() + ready_timeout;
        let store = self.options.storage_dir.display();

        let engine = match tokio::time::timeout_at(expires, self.open_engine()).await {
            Ok(Ok(engine)) => engine,
            Ok(Err(e)) => {
                return Err(BrokerError::NotReady {
                    reason: format!("cannot open store in {store}: {e}"),
                });
            }
            Err(_) => {
                return Err(BrokerError::NotReady {
                    reason: format!("store in {store} not open within {ready_timeout:?}"),
                });
            }
        };

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (ready_tx, ready_rx) = oneshot::channel::<BrokerResult<SocketAddr>>();
        let listen = self.options.listen_addr();

        let server_engine = Arc::clone(&engine);
        let server_shutdown = shutdown_rx.clone();
        let server = tokio::spawn(async move {
            match BrokerServer::bind(listen, server_engine).await {
                Ok(server) => {
                    let _ = ready_tx.send(Ok(server.local_addr()));
                    server.serve(server_shutdown).await;
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                }
            }
        });

        let addr = match tokio::time::timeout_at(expires, ready_rx).await {
            Ok(Ok(Ok(addr))) => addr,
            Ok(Ok(Err(e))) => {
                return Err(BrokerError::NotReady {
                    reason: format!("cannot listen on {listen}: {e}"),
                });
            }
            Ok(Err(_)) => {
                return Err(BrokerError::NotReady {
                    reason: "broker task exited before reporting ready".into(),
                });
            }
            Err(_) => {
                server.abort();
                return Err(BrokerError::NotReady {
                    reason: format!("not ready for connections within {ready_timeout:?}"),
                });
            }
        };

        let sweeper = spawn_sweeper(engine, self.options.sweep_interval, shutdown_rx);
        let running = Running {
            shutdown: shutdown_tx,
            server,
            sweeper,
        };
        Ok((addr, running))
    }
}

#[async_trait]
impl EmbeddedBroker for TcpBroker {
    async fn start(&self) -> BrokerResult<()> {
        self.lifecycle.transition(BrokerState::Starting)?;
        tracing::info!(
            addr = %self.options.listen_addr(),
            store_dir = %self.options.storage_dir.display(),
            persistent = self.engine.is_none(),
            "starting embedded broker"
        );

        match self.launch().await {
            Ok((addr, running)) => {
                let _ = self.bound.set(addr);
                *self.running.lock().await = Some(running);
                self.lifecycle.transition(BrokerState::Ready)?;
                tracing::info!(%addr, "embedded broker ready");
                Ok(())
            }
            Err(e) => {
                self.lifecycle.transition(BrokerState::Stopped)?;
                tracing::error!(error = %e, "embedded broker failed to start");
                Err(e)
            }
        }
    }

    async fn connect(&self) -> BrokerResult<Arc<dyn KvConnection>> {
        let state = self.lifecycle.state();
        if state != BrokerState::Ready {
            return Err(not_ready(state));
        }
        let addr = self.client_addr().ok_or_else(|| not_ready(state))?;
        let client = BrokerClient::connect(addr).await?;
        Ok(Arc::new(client))
    }

    async fn shutdown(&self, deadline: Duration) -> BrokerResult<()> {
        if let Err(done) = begin_shutdown(&self.lifecycle) {
            return done;
        }
        tracing::info!(?deadline, "shutting down embedded broker");

        let running = self.running.lock().await.take();
        let result = match running {
            Some(running) => {
                running.shutdown.send_replace(true);
                let expires = Instant::now() + deadline;
                let server_done = join_until(running.server, expires).await;
                let sweeper_done = join_until(running.sweeper, expires).await;
                if server_done && sweeper_done {
                    Ok(())
                } else {
                    Err(BrokerError::ShutdownTimeout { deadline })
                }
            }
            None => Ok(()),
        };

        self.lifecycle.transition(BrokerState::Stopped)?;
        match &result {
            Ok(()) => tracing::info!("embedded broker stopped"),
            Err(e) => tracing::warn!(error = %e, "embedded broker stopped forcibly"),
        }
        result
    }

    fn state(&self) -> BrokerState {
        self.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<BrokerState> {
        self.lifecycle.subscribe()
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        self.bound.get().copied().map(client_addr)
    }
}

// ---------------------------------------------------------------------------
// In-memory broker
// ---------------------------------------------------------------------------

/// Broker without a listener, serving a [`MemoryEngine`] in-process.
pub struct InMemoryBroker {
    engine: Arc<MemoryEngine>,
    ready_timeout: Duration,
    sweep_interval: Duration,
    startup_delay: Duration,
    lifecycle: Lifecycle,
    shutdown: watch::Sender<bool>,
    connections: Mutex<Vec<LocalConnection>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Default for InMemoryBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryBroker {
    pub fn new() -> Self {
        let defaults = BrokerOptions::default();
        let (shutdown, _) = watch::channel(false);
        Self {
            engine: Arc::new(MemoryEngine::new()),
            ready_timeout: defaults.ready_timeout,
            sweep_interval: defaults.sweep_interval,
            startup_delay: Duration::ZERO,
            lifecycle: Lifecycle::new(),
            shutdown,
            connections: Mutex::new(Vec::new()),
            sweeper: Mutex::new(None),
        }
    }

    pub fn with_ready_timeout(mut self, ready_timeout: Duration) -> Self {
        self.ready_timeout = ready_timeout;
        self
    }

    pub fn with_sweep_interval(mut self, sweep_interval: Duration) -> Self {
        self.sweep_interval = sweep_interval;
        self
    }

    /// Delay the ready signal, e.g. to exercise readiness timeouts.
    pub fn with_startup_delay(mut self, startup_delay: Duration) -> Self {
        self.startup_delay = startup_delay;
        self
    }
}

#[async_trait]
impl EmbeddedBroker for InMemoryBroker {
    async fn start(&self) -> BrokerResult<()> {
        self.lifecycle.transition(BrokerState::Starting)?;
        tracing::info!(persistent = false, "starting in-memory broker");

        let (ready_tx, ready_rx) = oneshot::channel::<()>();
        let delay = self.startup_delay;
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = ready_tx.send(());
        });

        if tokio::time::timeout(self.ready_timeout, ready_rx).await.is_err() {
            self.lifecycle.transition(BrokerState::Stopped)?;
            return Err(BrokerError::NotReady {
                reason: format!("not ready for connections within {:?}", self.ready_timeout),
            });
        }

        let engine: Arc<dyn Engine> = self.engine.clone();
        let sweeper = spawn_sweeper(engine, self.sweep_interval, self.shutdown.subscribe());
        *self.sweeper.lock().await = Some(sweeper);

        self.lifecycle.transition(BrokerState::Ready)?;
        tracing::info!("in-memory broker ready");
        Ok(())
    }

    async fn connect(&self) -> BrokerResult<Arc<dyn KvConnection>> {
        let state = self.lifecycle.state();
        if state != BrokerState::Ready {
            return Err(not_ready(state));
        }
        let engine: Arc<dyn Engine> = self.engine.clone();
        let connection = LocalConnection::new(engine);
        self.connections.lock().await.push(connection.clone());
        Ok(Arc::new(connection))
    }

    async fn shutdown(&self, deadline: Duration) -> BrokerResult<()> {
        if let Err(done) = begin_shutdown(&self.lifecycle) {
            return done;
        }

        for connection in self.connections.lock().await.drain(..) {
            connection.close().await;
        }
        self.shutdown.send_replace(true);

        let sweeper = self.sweeper.lock().await.take();
        let result = match sweeper {
            Some(sweeper) => {
                if join_until(sweeper, Instant::now() + deadline).await {
                    Ok(())
                } else {
                    Err(BrokerError::ShutdownTimeout { deadline })
                }
            }
            None => Ok(()),
        };

        self.lifecycle.transition(BrokerState::Stopped)?;
        tracing::info!("in-memory broker stopped");
        result
    }

    fn state(&self) -> BrokerState {
        self.lifecycle.state()
    }

    fn subscribe(&self) -> watch::Receiver<BrokerState> {
        self.lifecycle.subscribe()
    }

    fn client_addr(&self) -> Option<SocketAddr> {
        None
    }
}

// ---------------------------------------------------------------------------
// Handle
// ---------------------------------------------------------------------------

/// A started broker and the client connection opened against it.
#[derive(Clone)]
pub struct BrokerHandle {
    broker: Arc<dyn EmbeddedBroker>,
    client: Arc<dyn KvConnection>,
}

impl BrokerHandle {
    pub fn broker(&self) -> &Arc<dyn EmbeddedBroker> {
        &self.broker
    }

    pub fn client(&self) -> &Arc<dyn KvConnection> {
        &self.client
    }

    /// Close the client, then stop the broker, all within `deadline`.
    pub async fn shutdown(&self, deadline: Duration) -> BrokerResult<()> {
        let expires = Instant::now() + deadline;
        let client_closed = tokio::time::timeout_at(expires, self.client.close())
            .await
            .is_ok();
        let remaining = expires.saturating_duration_since(Instant::now());
        self.broker.shutdown(remaining).await?;
        if client_closed {
            Ok(())
        } else {
            Err(BrokerError::ShutdownTimeout { deadline })
        }
    }
}

/// Start `broker`, wait for readiness, and connect a client to it.
///
/// If the client cannot connect the broker is stopped again before the
/// error is returned.
pub async fn start_broker(broker: Arc<dyn EmbeddedBroker>) -> BrokerResult<BrokerHandle> {
    broker.start().await?;
    match broker.connect().await {
        Ok(client) => Ok(BrokerHandle { broker, client }),
        Err(e) => {
            tracing::error!(error = %e, "cannot connect to embedded broker");
            if let Err(stop) = broker.shutdown(Duration::from_secs(5)).await {
                tracing::warn!(error = %stop, "broker teardown after failed connect");
            }
            Err(e)
        }
    }
}

/// Start a durable [`TcpBroker`] with `options` and connect to it.
pub async fn start_embedded(options: BrokerOptions) -> BrokerResult<BrokerHandle> {
    start_broker(Arc::new(TcpBroker::new(options))).await
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kv::BucketConfig;

    fn ephemeral(dir: &std::path::Path) -> BrokerOptions {
        BrokerOptions {
            host: IpAddr::V4(Ipv4Addr::LOCALHOST),
            port: 0,
            storage_dir: dir.to_path_buf(),
            ..BrokerOptions::default()
        }
    }

    #[test]
    fn transitions() {
        use BrokerState::*;
        assert!(NotStarted.can_transition_to(Starting));
        assert!(Starting.can_transition_to(Stopped));
        assert!(!NotStarted.can_transition_to(ShuttingDown));
        assert!(!Ready.can_transition_to(Starting));
        assert!(!Stopped.can_transition_to(Starting));
    }

    #[test]
    fn lifecycle_rejects_invalid_transition() {
        let lifecycle = Lifecycle::new();
        let mut rx = lifecycle.subscribe();
        assert_eq!(
            lifecycle.transition(BrokerState::Starting).unwrap(),
            BrokerState::NotStarted
        );
        assert!(rx.has_changed().unwrap());
        assert_eq!(*rx.borrow_and_update(), BrokerState::Starting);

        let err = lifecycle.transition(BrokerState::ShuttingDown).unwrap_err();
        assert!(matches!(
            err,
            BrokerError::InvalidTransition {
                from: BrokerState::Starting,
                to: BrokerState::ShuttingDown
            }
        ));
        assert!(!rx.has_changed().unwrap());
    }

    #[test]
    fn wildcard_binds_are_dialed_on_loopback() {
        let any: SocketAddr = "0.0.0.0:4222".parse().unwrap();
        assert_eq!(client_addr(any), "127.0.0.1:4222".parse().unwrap());
        let any6: SocketAddr = "[::]:4222".parse().unwrap();
        assert_eq!(client_addr(any6), "[::1]:4222".parse().unwrap());
        let exact: SocketAddr = "10.1.2.3:4222".parse().unwrap();
        assert_eq!(client_addr(exact), exact);
    }

    #[tokio::test]
    async fn tcp_broker_starts_and_stops() {
        let dir = tempfile::tempdir().unwrap();
        let handle = start_embedded(ephemeral(dir.path())).await.unwrap();
        assert_eq!(handle.broker().state(), BrokerState::Ready);
        assert!(dir.path().join("kv.db").exists());

        let kv = handle
            .client()
            .create_key_value(BucketConfig::new("sessions"))
            .await
            .unwrap();
        kv.put("a", b"1").await.unwrap();

        handle.shutdown(Duration::from_secs(5)).await.unwrap();
        assert_eq!(handle.broker().state(), BrokerState::Stopped);
        assert!(handle.client().is_closed());

        // Stopping twice is harmless.
        handle.broker().shutdown(Duration::from_secs(1)).await.unwrap();
    }

    #[tokio::test]
    async fn starting_twice_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let broker = TcpBroker::new(ephemeral(dir.path()));
        broker.start().await.unwrap();
        assert!(matches!(
            broker.start().await,
            Err(BrokerError::InvalidTransition { .. })
        ));
        broker.shutdown(Duration::from_secs(5)).await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_before_start_is_rejected() {
        let broker = InMemoryBroker::new();
        assert!(matches!(
            broker.shutdown(Duration::from_secs(1)).await,
            Err(BrokerError::InvalidTransition {
                from: BrokerState::NotStarted,
                ..
            })
        ));
    }

    #[tokio::test]
    async fn zero_deadline_reports_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let broker = TcpBroker::new(ephemeral(dir.path()));
        broker.start().await.unwrap();

        assert!(matches!(
            broker.shutdown(Duration::ZERO).await,
            Err(BrokerError::ShutdownTimeout { .. })
        ));
        assert_eq!(broker.state(), BrokerState::Stopped);
    }

    #[tokio::test]
    async fn slow_in_memory_start_is_not_ready() {
        let broker = InMemoryBroker::new()
            .with_ready_timeout(Duration::from_millis(20))
            .with_startup_delay(Duration::from_secs(5));
        assert!(matches!(
            broker.start().await,
            Err(BrokerError::NotReady { .. })
        ));
        assert_eq!(broker.state(), BrokerState::Stopped);
        assert!(matches!(
            broker.connect().await,
            Err(BrokerError::NotReady { .. })
        ));
    }

    #[tokio::test]
    async fn in_memory_shutdown_closes_connections() {
        let handle = start_broker(Arc::new(InMemoryBroker::new())).await.unwrap();
        assert!(handle.broker().client_addr().is_none());

        let extra = handle.broker().connect().await.unwrap();
        handle.shutdown(Duration::from_secs(1)).await.unwrap();
        assert!(extra.is_closed());
        assert!(handle.client().is_closed());
    }
}
