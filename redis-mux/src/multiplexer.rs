//! The multiplexer
//!
//! [`Multiplexer`] owns one [`ServerEndpoint`] per known address and routes
//! every command over the shared connection of the endpoint the selection
//! strategy picks. All dispatch is async; the blocking calls run the async
//! path on the runtime captured at connect time and wait for it with a
//! timeout.
//!
//! # Example
//!
//! ```no_run
//! use redis_mux::{Command, ConnectionConfig, Multiplexer};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: ConnectionConfig = "redis1:6379,redis2:6379,abortConnect=false".parse()?;
//! let mux = Multiplexer::connect(config).await?;
//!
//! let db = mux.database(None);
//! db.set("greeting", "hello").await?;
//! let value = db.get("greeting").await?;
//! assert_eq!(value.as_deref(), Some("hello"));
//!
//! println!("{}", mux.status());
//! # Ok(())
//! # }
//! ```

use crate::bridge::{BridgeEvent, ConnectionType, Message};
use crate::command::{Command, CommandFlags};
use crate::connection::{Connector, TcpConnector};
use crate::database::Database;
use crate::events::{EventHub, MuxEvent};
use crate::reconfigure::{ReconfigureOutcome, RunState};
use crate::selection::ServerSelectionStrategy;
use crate::server::{ServerEndpoint, ServerStatus};
use parking_lot::{Mutex, RwLock};
use redis_mux_core::{
    config::ConnectionConfig,
    error::{ConnectionFailureKind, RedisError, RedisResult},
    types::{EndPoint, ServerType},
    value::RespValue,
};
use serde::Serialize;
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Extra time a blocking caller waits beyond the command's own deadline
const BLOCKING_SLACK: Duration = Duration::from_millis(100);

/// Multiplexer-wide counters
#[derive(Debug, Default)]
pub struct MuxCounters {
    /// Commands dispatched
    pub operations: AtomicU64,
    /// Fire-and-forget commands dispatched
    pub fire_and_forget: AtomicU64,
    /// Blocking calls that timed out
    pub sync_timeouts: AtomicU64,
    /// Async calls that timed out
    pub async_timeouts: AtomicU64,
    /// `MOVED`/`ASK` replies followed
    pub redirects: AtomicU64,
}

/// Point-in-time view of the whole multiplexer
#[derive(Debug, Clone, Serialize)]
pub struct MuxStatus {
    /// Configured client name
    pub client_name: Option<String>,
    /// Kind of deployment
    pub server_type: ServerType,
    /// Whether any endpoint can take commands
    pub connected: bool,
    /// Cause of the reconfiguration in progress
    pub reconfiguring: Option<String>,
    /// Cluster slots with an owner
    pub covered_slots: i64,
    /// Commands dispatched
    pub operations: u64,
    /// Fire-and-forget commands dispatched
    pub fire_and_forget: u64,
    /// Blocking calls that timed out
    pub sync_timeouts: u64,
    /// Async calls that timed out
    pub async_timeouts: u64,
    /// Redirects followed
    pub redirects: u64,
    /// Last recorded error
    pub last_error: Option<String>,
    /// Every known endpoint
    pub servers: Vec<ServerStatus>,
}

impl fmt::Display for MuxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "{} ({}): {}",
            self.client_name.as_deref().unwrap_or("redis-mux"),
            self.server_type,
            if self.connected {
                "connected"
            } else {
                "disconnected"
            }
        )?;
        if let Some(cause) = &self.reconfiguring {
            writeln!(f, "  reconfiguring: {}", cause)?;
        }
        if self.server_type == ServerType::Cluster {
            writeln!(f, "  covered slots: {}", self.covered_slots)?;
        }
        writeln!(
            f,
            "  ops={}, fire-and-forget={}, sync timeouts={}, async timeouts={}, redirects={}",
            self.operations,
            self.fire_and_forget,
            self.sync_timeouts,
            self.async_timeouts,
            self.redirects
        )?;
        if let Some(error) = &self.last_error {
            writeln!(f, "  last error: {}", error)?;
        }
        for server in &self.servers {
            writeln!(f, "  {}", server)?;
        }
        Ok(())
    }
}

#[derive(Default)]
struct EndpointTable {
    by_address: HashMap<EndPoint, Arc<ServerEndpoint>>,
    order: Vec<EndPoint>,
}

/// State shared by the multiplexer and its background tasks
pub(crate) struct MuxInner {
    pub(crate) config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    table: RwLock<EndpointTable>,
    pub(crate) seeds: RwLock<Vec<EndPoint>>,
    /// Master named from outside, elected whenever it answers as a master
    pub(crate) preferred_master: RwLock<Option<EndPoint>>,
    pub(crate) selection: ServerSelectionStrategy,
    pub(crate) hub: EventHub,
    bridge_events: mpsc::UnboundedSender<BridgeEvent>,
    pub(crate) run: RunState,
    pub(crate) channels: Mutex<BTreeSet<String>>,
    pub(crate) subscribed_on: Mutex<Option<EndPoint>>,
    pub(crate) heartbeat: Mutex<Option<JoinHandle<()>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    counters: MuxCounters,
    last_error: RwLock<Option<String>>,
    closed: AtomicBool,
    pub(crate) runtime: Handle,
}

struct Pending {
    reply: Option<oneshot::Receiver<RedisResult<RespValue>>>,
    deadline: Instant,
    description: String,
    endpoint: EndPoint,
}

impl MuxInner {
    pub(crate) fn new(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        runtime: Handle,
    ) -> (Self, mpsc::UnboundedReceiver<BridgeEvent>) {
        let (bridge_events, rx) = mpsc::unbounded_channel();
        let seeds = config.endpoints.clone();
        let inner = Self {
            config: Arc::new(config),
            connector,
            table: RwLock::new(EndpointTable::default()),
            seeds: RwLock::new(seeds),
            preferred_master: RwLock::new(None),
            selection: ServerSelectionStrategy::new(),
            hub: EventHub::new(),
            bridge_events,
            run: RunState::default(),
            channels: Mutex::new(BTreeSet::new()),
            subscribed_on: Mutex::new(None),
            heartbeat: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
            counters: MuxCounters::default(),
            last_error: RwLock::new(None),
            closed: AtomicBool::new(false),
            runtime,
        };
        (inner, rx)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    pub(crate) fn server(&self, endpoint: &EndPoint) -> Option<Arc<ServerEndpoint>> {
        self.table.read().by_address.get(endpoint).cloned()
    }

    /// Every endpoint in registration order
    pub(crate) fn servers(&self) -> Vec<Arc<ServerEndpoint>> {
        let table = self.table.read();
        table
            .order
            .iter()
            .filter_map(|endpoint| table.by_address.get(endpoint).cloned())
            .collect()
    }

    pub(crate) fn get_or_add(&self, endpoint: &EndPoint) -> Arc<ServerEndpoint> {
        if let Some(server) = self.server(endpoint) {
            return server;
        }
        let mut table = self.table.write();
        if let Some(server) = table.by_address.get(endpoint) {
            return server.clone();
        }
        debug!("Registering endpoint {}", endpoint);
        let server = Arc::new(ServerEndpoint::new(
            endpoint.clone(),
            self.config.clone(),
            self.connector.clone(),
            self.bridge_events.clone(),
            self.hub.clone(),
        ));
        table.by_address.insert(endpoint.clone(), server.clone());
        table.order.push(endpoint.clone());
        server
    }

    /// Drop every endpoint not in `keep`, returning the dropped ones
    fn retain_endpoints(&self, keep: &[EndPoint]) -> Vec<Arc<ServerEndpoint>> {
        let mut table = self.table.write();
        let table = &mut *table;
        let mut removed = Vec::new();
        table.order.retain(|endpoint| {
            if keep.contains(endpoint) {
                return true;
            }
            if let Some(server) = table.by_address.remove(endpoint) {
                removed.push(server);
            }
            false
        });
        removed
    }

    pub(crate) fn record_error(&self, error: &RedisError) {
        *self.last_error.write() = Some(error.to_string());
    }

    /// Start a reconfiguration in the background
    pub(crate) fn trigger_reconfigure(self: &Arc<Self>, cause: String, blame: Option<EndPoint>) {
        if self.is_closed() {
            return;
        }
        let inner = self.clone();
        self.runtime.spawn(async move {
            match inner.reconfigure(&cause, blame, false, false).await {
                Ok(ReconfigureOutcome::Completed { healthy }) => {
                    debug!("Reconfiguration for '{}' done, healthy: {}", cause, healthy);
                }
                Ok(ReconfigureOutcome::AlreadyRunning { .. }) => {}
                Err(e) => warn!("Reconfiguration for '{}' failed: {}", cause, e),
            }
        });
    }

    fn on_bridge_event(self: &Arc<Self>, event: BridgeEvent) {
        match event {
            BridgeEvent::Redirect {
                source,
                message,
                redirect,
            } => self.follow_redirect(&source, message, redirect),
            BridgeEvent::ConnectionFailed {
                endpoint,
                connection,
                kind,
                message,
            } => {
                warn!(
                    "{} connection to {} failed: {}: {}",
                    connection, endpoint, kind, message
                );
                *self.last_error.write() =
                    Some(format!("{endpoint} ({connection}): {kind}: {message}"));
                self.hub.publish(MuxEvent::ConnectionFailed {
                    endpoint: endpoint.clone(),
                    connection,
                    kind,
                    message,
                });
                self.trigger_reconfigure(format!("connection to {endpoint} failed"), Some(endpoint));
            }
            BridgeEvent::PubSub {
                endpoint,
                channel,
                payload,
            } => {
                let broadcast = &self.config.configuration_channel;
                if !broadcast.is_empty() && &channel == broadcast {
                    info!("Reconfiguration requested through {}", endpoint);
                    self.hub.publish(MuxEvent::ConfigurationChangedBroadcast {
                        endpoint: endpoint.clone(),
                    });
                    self.trigger_reconfigure("configuration broadcast".to_string(), Some(endpoint));
                } else {
                    self.hub.publish(MuxEvent::Message {
                        endpoint,
                        channel,
                        payload,
                    });
                }
            }
        }
    }

    fn follow_redirect(self: &Arc<Self>, source: &EndPoint, message: Message, redirect: RedisError) {
        let (Some((host, port)), Some(slot)) = (redirect.redirect_target(), redirect.redirect_slot())
        else {
            message.fail(redirect);
            return;
        };
        let is_moved = matches!(redirect, RedisError::Moved { .. });
        self.counters.redirects.fetch_add(1, Ordering::Relaxed);
        debug!(
            "{} for slot {} from {} to {}:{}",
            if is_moved { "MOVED" } else { "ASK" },
            slot,
            source,
            host,
            port
        );

        let target = self.get_or_add(&EndPoint::new(host, port));
        let inner = self.clone();
        self.runtime.spawn(async move {
            if !target.is_connected() {
                let deadline = message
                    .deadline
                    .unwrap_or_else(|| Instant::now() + inner.config.connect_timeout);
                if let Err(e) = target.activate(ConnectionType::Interactive, deadline).await {
                    message.fail(e);
                    return;
                }
                target.set_server_type(ServerType::Cluster);
            }
            inner.selection.try_resend(slot, message, &target, is_moved);
        });
    }

    fn detail(&self, what: &str, command: &Command, endpoint: Option<&EndPoint>) -> String {
        if !self.config.include_detail_in_exceptions {
            return what.to_string();
        }
        match endpoint {
            Some(endpoint) => format!("{what} ({command} on {endpoint})"),
            None => format!("{what} ({command})"),
        }
    }

    fn prepare(&self, mut command: Command) -> RedisResult<Command> {
        command.validate()?;
        let name = command.code().name().to_string();
        if !self.config.command_map.is_available(&name) {
            return Err(RedisError::CommandDisabled(name));
        }
        if command.code().is_admin()
            && !self.config.allow_admin
            && !command.flags().contains(CommandFlags::INTERNAL_CALL)
        {
            return Err(RedisError::AdminModeRequired(name));
        }
        if command.db().is_none() {
            command.set_db(self.config.default_database);
        }
        Ok(command)
    }

    fn resolve(&self, command: &Command, pinned: Option<&EndPoint>) -> RedisResult<Arc<ServerEndpoint>> {
        if let Some(endpoint) = pinned {
            match self.server(endpoint) {
                Some(server)
                    if server.is_connected() && self.selection.serves(&server, command) =>
                {
                    if server.is_replica() && command.code().is_master_only() {
                        return Err(RedisError::MasterOnly(self.detail(
                            "command cannot be issued to a replica",
                            command,
                            Some(endpoint),
                        )));
                    }
                    return Ok(server);
                }
                Some(_) => debug!("{} cannot take {}, resolving automatically", endpoint, command),
                None => debug!("{} is not known, resolving automatically", endpoint),
            }
        }

        self.selection.select(command)?.ok_or_else(|| {
            RedisError::NoConnectionAvailable(self.detail(
                "no connection is available to service this operation",
                command,
                None,
            ))
        })
    }

    fn submit(&self, command: Command, pinned: Option<&EndPoint>, sync: bool) -> RedisResult<Pending> {
        if self.is_closed() {
            return Err(RedisError::Disposed);
        }
        let command = self.prepare(command)?;
        let server = self.resolve(&command, pinned)?;

        if let Some(database) = command.db() {
            let available = server.databases();
            if u32::from(database) >= available {
                return Err(RedisError::DatabaseOutOfRange {
                    database,
                    available,
                });
            }
        }

        let timeout = command.timeout().unwrap_or(if sync {
            self.config.sync_timeout
        } else {
            self.config.async_timeout
        });
        let deadline = Instant::now() + timeout;
        let description = command.describe();
        let endpoint = server.endpoint().clone();
        self.counters.operations.fetch_add(1, Ordering::Relaxed);

        if command.is_fire_and_forget() {
            self.counters.fire_and_forget.fetch_add(1, Ordering::Relaxed);
            server.try_write(Message::new(command, None, Some(deadline)));
            return Ok(Pending {
                reply: None,
                deadline,
                description,
                endpoint,
            });
        }

        let (tx, rx) = oneshot::channel();
        // a failed write has already failed the sink
        server.try_write(Message::new(command, Some(tx), Some(deadline)));
        Ok(Pending {
            reply: Some(rx),
            deadline,
            description,
            endpoint,
        })
    }

    pub(crate) async fn dispatch(
        &self,
        command: Command,
        pinned: Option<EndPoint>,
        sync: bool,
    ) -> RedisResult<RespValue> {
        let pending = self.submit(command, pinned.as_ref(), sync)?;
        let Some(reply) = pending.reply else {
            return Ok(RespValue::Null);
        };

        match timeout_at(pending.deadline, reply).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RedisError::connection(
                ConnectionFailureKind::ConnectionDisposed,
                &pending.endpoint,
                format!("{} was abandoned", pending.description),
            )),
            Err(_) => {
                let counter = if sync {
                    &self.counters.sync_timeouts
                } else {
                    &self.counters.async_timeouts
                };
                counter.fetch_add(1, Ordering::Relaxed);
                let detail = if self.config.include_detail_in_exceptions {
                    format!("{} on {}", pending.description, pending.endpoint)
                } else {
                    pending.description
                };
                Err(RedisError::Timeout(detail))
            }
        }
    }

    fn status(&self) -> MuxStatus {
        let topology = self.selection.topology();
        MuxStatus {
            client_name: self.config.client_name.clone(),
            server_type: topology.server_type(),
            connected: self.is_connected(),
            reconfiguring: self.run.current_cause(),
            covered_slots: self.selection.count_covered_slots(),
            operations: self.counters.operations.load(Ordering::Relaxed),
            fire_and_forget: self.counters.fire_and_forget.load(Ordering::Relaxed),
            sync_timeouts: self.counters.sync_timeouts.load(Ordering::Relaxed),
            async_timeouts: self.counters.async_timeouts.load(Ordering::Relaxed),
            redirects: self.counters.redirects.load(Ordering::Relaxed),
            last_error: self.last_error.read().clone(),
            servers: self.servers().iter().map(|s| s.status()).collect(),
        }
    }

    fn is_connected(&self) -> bool {
        self.servers().iter().any(|server| server.is_selectable())
    }

    fn stop_tasks(&self) {
        if let Some(heartbeat) = self.heartbeat.lock().take() {
            heartbeat.abort();
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn pump_bridge_events(inner: Weak<MuxInner>, mut events: mpsc::UnboundedReceiver<BridgeEvent>) {
    while let Some(event) = events.recv().await {
        let Some(inner) = inner.upgrade() else {
            break;
        };
        inner.on_bridge_event(event);
    }
}

/// Run `future` on `runtime` and wait for it from a non-async thread
fn block_on_runtime<F, T>(runtime: &Handle, limit: Duration, future: F) -> RedisResult<T>
where
    F: Future<Output = RedisResult<T>> + Send + 'static,
    T: Send + 'static,
{
    let (tx, rx) = std::sync::mpsc::channel();
    runtime.spawn(async move {
        let _ = tx.send(future.await);
    });
    match rx.recv_timeout(limit) {
        Ok(result) => result,
        Err(std::sync::mpsc::RecvTimeoutError::Timeout) => Err(RedisError::Timeout(format!(
            "no result within {limit:?}"
        ))),
        Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => Err(RedisError::Disposed),
    }
}

/// A connection multiplexer over one Redis deployment
///
/// Dropping the multiplexer stops its background tasks and closes every
/// connection without waiting; use [`Multiplexer::close`] to let in-flight
/// commands finish first.
pub struct Multiplexer {
    inner: Arc<MuxInner>,
}

impl fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Multiplexer")
            .field("endpoints", &self.endpoints())
            .field("connected", &self.is_connected())
            .finish()
    }
}

impl Multiplexer {
    /// Connect over TCP
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::UnableToConnect`] when nothing could be reached
    /// and `abort_on_connect_fail` is set, or when DNS resolution timed out.
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_with(config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom [`Connector`]
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::connect`].
    pub async fn connect_with(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<Self> {
        Self::start(config, connector, None).await
    }

    /// Connect with `master` preferred over any other server claiming the role
    pub(crate) async fn connect_following(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        master: EndPoint,
    ) -> RedisResult<Self> {
        Self::start(config, connector, Some(master)).await
    }

    async fn start(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
        preferred_master: Option<EndPoint>,
    ) -> RedisResult<Self> {
        let (inner, events) = MuxInner::new(config, connector, Handle::current());
        *inner.preferred_master.write() = preferred_master;
        let inner = Arc::new(inner);
        let pump = tokio::spawn(pump_bridge_events(Arc::downgrade(&inner), events));
        inner.tasks.lock().push(pump);

        let mux = Self { inner };
        mux.inner
            .reconfigure("initial connect", None, true, false)
            .await?;
        Ok(mux)
    }

    /// Connect from a thread outside the runtime
    ///
    /// Must not be called from within an async context of `runtime`.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::connect`]; also times out when the runtime does not
    /// finish the connect in time.
    pub fn connect_blocking(config: ConnectionConfig, runtime: &Handle) -> RedisResult<Self> {
        let attempts = u32::try_from(config.connect_retry + 1).unwrap_or(u32::MAX);
        let limit = config.connect_timeout.saturating_mul(attempts) + BLOCKING_SLACK;
        let connect = async move { Self::connect(config).await };
        block_on_runtime(runtime, limit, connect)
    }

    /// Re-run topology discovery now
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Disposed`] after close.
    pub async fn reconfigure(&self) -> RedisResult<ReconfigureOutcome> {
        self.inner.reconfigure("requested", None, false, false).await
    }

    /// Blocking [`Multiplexer::reconfigure`]
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::reconfigure`].
    pub fn reconfigure_blocking(&self) -> RedisResult<ReconfigureOutcome> {
        let inner = self.inner.clone();
        let limit = inner.config.connect_timeout.saturating_mul(2) + BLOCKING_SLACK;
        let runtime = inner.runtime.clone();
        block_on_runtime(&runtime, limit, async move {
            inner.reconfigure("requested", None, false, false).await
        })
    }

    /// Addresses of every known endpoint
    #[must_use]
    pub fn endpoints(&self) -> Vec<EndPoint> {
        self.inner.table.read().order.clone()
    }

    /// The endpoint registered for `endpoint`
    #[must_use]
    pub fn get_server(&self, endpoint: &EndPoint) -> Option<Arc<ServerEndpoint>> {
        self.inner.server(endpoint)
    }

    /// Register an endpoint; it joins the topology at the next reconfiguration
    pub fn add_endpoint(&self, endpoint: EndPoint) -> Arc<ServerEndpoint> {
        {
            let mut seeds = self.inner.seeds.write();
            if !seeds.contains(&endpoint) {
                seeds.push(endpoint.clone());
            }
        }
        self.inner.get_or_add(&endpoint)
    }

    /// Replace the endpoint set with `endpoints` and follow `master`
    ///
    /// Endpoints outside the new set are closed. The change takes effect at
    /// the next reconfiguration.
    pub(crate) fn replace_endpoints(&self, endpoints: Vec<EndPoint>, master: EndPoint) {
        *self.inner.preferred_master.write() = Some(master);
        for endpoint in &endpoints {
            self.inner.get_or_add(endpoint);
        }
        let removed = self.inner.retain_endpoints(&endpoints);
        *self.inner.seeds.write() = endpoints;

        let grace = self.inner.config.sync_timeout;
        for server in removed {
            debug!("Dropping endpoint {}", server.endpoint());
            self.inner.runtime.spawn(async move { server.close(grace).await });
        }
    }

    /// Reconfigure once any run already in progress has finished
    ///
    /// Gives up with [`ReconfigureOutcome::AlreadyRunning`] when other runs
    /// keep the token for longer than `limit`.
    pub(crate) async fn reconfigure_after_current(
        &self,
        cause: &str,
        limit: Duration,
    ) -> RedisResult<ReconfigureOutcome> {
        self.inner.reconfigure_after_current(cause, limit).await
    }

    /// The selectable master of the current topology
    pub(crate) fn master_endpoint(&self) -> Option<EndPoint> {
        self.inner
            .selection
            .topology()
            .masters()
            .iter()
            .find(|server| server.is_selectable())
            .map(|server| server.endpoint().clone())
    }

    /// Cluster hash slot of `key`
    #[must_use]
    pub fn hash_slot(&self, key: impl AsRef<[u8]>) -> u16 {
        self.inner.selection.hash_slot(key.as_ref())
    }

    /// Ask every multiplexer listening on the configuration channel to reconfigure
    ///
    /// # Errors
    ///
    /// Returns an error when no master is available or the publish fails.
    pub async fn publish_reconfigure(&self) -> RedisResult<i64> {
        self.inner.broadcast_reconfigure().await
    }

    /// Diagnostic snapshot
    #[must_use]
    pub fn status(&self) -> MuxStatus {
        self.inner.status()
    }

    /// Whether any endpoint can take commands
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.inner.is_connected()
    }

    /// Last error recorded by the multiplexer
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.inner.last_error.read().clone()
    }

    /// Multiplexer-wide counters
    #[must_use]
    pub fn counters(&self) -> &MuxCounters {
        &self.inner.counters
    }

    /// A receiver of all future events
    #[must_use]
    pub fn subscribe_events(&self) -> broadcast::Receiver<MuxEvent> {
        self.inner.hub.subscribe()
    }

    /// Run `handler` for every future event; a panicking handler is reported
    /// as [`MuxEvent::InternalError`] and keeps running
    pub fn on_event<F>(&self, handler: F) -> JoinHandle<()>
    where
        F: Fn(MuxEvent) + Send + Sync + 'static,
    {
        self.inner.hub.on_event(handler)
    }

    /// Subscribe to a pub/sub channel
    ///
    /// Messages arrive as [`MuxEvent::Message`]. The subscription survives
    /// reconfiguration and moves to a new master when needed.
    ///
    /// # Errors
    ///
    /// Returns an error when no endpoint can carry subscriptions or the
    /// server rejects the subscription.
    pub async fn subscribe(&self, channel: impl Into<String>) -> RedisResult<()> {
        let channel = channel.into();
        if !self.inner.config.command_map.is_available("SUBSCRIBE") {
            return Err(RedisError::CommandDisabled("SUBSCRIBE".to_string()));
        }
        self.inner.channels.lock().insert(channel.clone());

        let topology = self.inner.selection.topology();
        let server = self.inner.subscription_server(&topology).ok_or_else(|| {
            RedisError::NoConnectionAvailable("no endpoint can carry subscriptions".to_string())
        })?;
        let deadline = Instant::now() + self.inner.config.async_timeout;
        server.subscribe(&channel, deadline).await?;

        let moved = {
            let mut current = self.inner.subscribed_on.lock();
            let moved = current.as_ref() != Some(server.endpoint());
            *current = Some(server.endpoint().clone());
            moved
        };
        if moved {
            // the other tracked channels follow
            for other in self.inner.tracked_channels() {
                if other != channel {
                    server.subscribe(&other, deadline).await?;
                }
            }
        }
        Ok(())
    }

    /// Execute a command and wait for its reply
    ///
    /// Server error replies are returned as [`RedisError::Server`].
    ///
    /// # Errors
    ///
    /// Returns routing, connection, timeout and server errors.
    pub async fn execute(&self, command: Command) -> RedisResult<RespValue> {
        self.inner.dispatch(command, None, false).await
    }

    /// Execute a command on a specific endpoint
    ///
    /// Falls back to normal routing when the endpoint is disconnected, or
    /// does not own the command's slot in a cluster.
    ///
    /// # Errors
    ///
    /// Also returns [`RedisError::MasterOnly`] for a write pinned to a replica.
    pub async fn execute_on(&self, command: Command, endpoint: &EndPoint) -> RedisResult<RespValue> {
        self.inner
            .dispatch(command, Some(endpoint.clone()), false)
            .await
    }

    /// Blocking [`Multiplexer::execute`], bounded by the sync timeout
    ///
    /// Must not be called from within an async context of the runtime.
    ///
    /// # Errors
    ///
    /// See [`Multiplexer::execute`].
    pub fn execute_blocking(&self, command: Command) -> RedisResult<RespValue> {
        let inner = self.inner.clone();
        let limit = command.timeout().unwrap_or(inner.config.sync_timeout) + BLOCKING_SLACK;
        let runtime = inner.runtime.clone();
        block_on_runtime(&runtime, limit, async move {
            inner.dispatch(command, None, true).await
        })
    }

    /// Send a command without waiting for, or receiving, its reply
    ///
    /// # Errors
    ///
    /// Returns validation and routing errors only.
    pub fn fire_and_forget(&self, command: Command) -> RedisResult<()> {
        let command = command.with_flags(CommandFlags::FIRE_AND_FORGET);
        self.inner.submit(command, None, false).map(|_| ())
    }

    /// A view of one database; `None` uses the configured default
    #[must_use]
    pub fn database(&self, index: Option<u16>) -> Database<'_> {
        Database::new(self, index)
    }

    /// Stop accepting commands and close every connection
    ///
    /// In-flight commands get up to `grace` to complete.
    pub async fn close(&self, grace: Duration) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        info!("Closing multiplexer");
        if let Some(heartbeat) = self.inner.heartbeat.lock().take() {
            heartbeat.abort();
        }
        let closing: Vec<_> = self
            .inner
            .servers()
            .into_iter()
            .map(|server| async move { server.close(grace).await })
            .collect();
        futures_util::future::join_all(closing).await;
        self.inner.stop_tasks();
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.stop_tasks();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::CommandCode;

    #[test]
    fn test_status_display() {
        let status = MuxStatus {
            client_name: Some("app".to_string()),
            server_type: ServerType::Cluster,
            connected: false,
            reconfiguring: Some("initial connect".to_string()),
            covered_slots: 8192,
            operations: 3,
            fire_and_forget: 1,
            sync_timeouts: 0,
            async_timeouts: 2,
            redirects: 0,
            last_error: Some("boom".to_string()),
            servers: Vec::new(),
        };
        let text = status.to_string();
        assert!(text.starts_with("app (cluster): disconnected"));
        assert!(text.contains("covered slots: 8192"));
        assert!(text.contains("async timeouts=2"));
        assert!(text.contains("last error: boom"));
    }

    #[tokio::test]
    async fn test_prepare_applies_policy() {
        let config = ConnectionConfig::default().with_default_database(2);
        let (inner, _events) = MuxInner::new(config, Arc::new(TcpConnector), Handle::current());

        let prepared = inner.prepare(Command::new(CommandCode::Get).key("k")).unwrap();
        assert_eq!(prepared.db(), Some(2));

        let explicit = inner
            .prepare(Command::new(CommandCode::Get).key("k").with_db(5))
            .unwrap();
        assert_eq!(explicit.db(), Some(5));

        assert!(matches!(
            inner.prepare(Command::new(CommandCode::Flushall)),
            Err(RedisError::AdminModeRequired(_))
        ));
        assert!(inner
            .prepare(Command::new(CommandCode::Info).with_flags(CommandFlags::INTERNAL_CALL))
            .is_ok());
    }

    #[tokio::test]
    async fn test_disabled_command_rejected() {
        let config = ConnectionConfig::default()
            .with_command_map(redis_mux_core::config::CommandMap::with_disabled(["KEYS"]))
            .with_allow_admin(true);
        let (inner, _events) = MuxInner::new(config, Arc::new(TcpConnector), Handle::current());
        assert!(matches!(
            inner.prepare(Command::new(CommandCode::Keys).arg("*")),
            Err(RedisError::CommandDisabled(name)) if name == "KEYS"
        ));
    }

    #[tokio::test]
    async fn test_no_route_without_servers() {
        let (inner, _events) = MuxInner::new(
            ConnectionConfig::default(),
            Arc::new(TcpConnector),
            Handle::current(),
        );
        let result = inner
            .dispatch(Command::new(CommandCode::Get).key("k"), None, false)
            .await;
        assert!(matches!(result, Err(RedisError::NoConnectionAvailable(_))));
    }
}
