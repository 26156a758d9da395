//! Server endpoints
//!
//! A [`ServerEndpoint`] is everything the multiplexer knows about one
//! `host:port`: its connections, what kind of server it is, whether it may be
//! selected for routing, and a few counters. Endpoints live in the
//! multiplexer's table for its whole life; reconfiguration only changes their
//! flags and the topology snapshot that points at them.

use crate::bridge::{
    BridgeEvent, BridgeStatus, ConnectionType, Message, PhysicalBridge, WriteResult,
};
use crate::cluster::ClusterConfiguration;
use crate::command::{Command, CommandCode, CommandFlags};
use crate::connection::{Connector, RedisConnection};
use crate::events::{EventHub, MuxEvent};
use crate::features::ServerFeatures;
use crate::protocol::{parse_info, ProtocolVersion, RoleReply};
use bitflags::bitflags;
use bytes::Bytes;
use parking_lot::RwLock;
use redis_mux_core::{
    config::ConnectionConfig,
    error::{ConnectionFailureKind, RedisError, RedisResult},
    types::{EndPoint, ServerType},
    value::RespValue,
};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Databases a standalone server has unless it says otherwise
pub const DEFAULT_DATABASES: u32 = 16;

bitflags! {
    /// Reasons an endpoint is excluded from routing
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct UnselectableFlags: u8 {
        /// The last probe did not complete in time
        const DID_NOT_RESPOND = 1 << 0;
        /// The server is of a type this multiplexer does not route to
        const WRONG_SERVER_TYPE = 1 << 1;
        /// The server claims to be master but lost the election
        const REDUNDANT_MASTER = 1 << 2;
        /// Disabled by the caller
        const DISABLED = 1 << 3;
    }
}

/// Per-endpoint operation counters
#[derive(Debug, Default)]
pub struct ServerCounters {
    /// Messages accepted for writing
    pub operations: AtomicU64,
    /// Messages that could not be queued
    pub write_failures: AtomicU64,
    /// Failed connection attempts
    pub connect_failures: AtomicU64,
    /// Successful connection attempts
    pub connects: AtomicU64,
}

/// What a probe learned about a server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeReport {
    /// Kind of server
    pub server_type: ServerType,
    /// Whether the server is a replica
    pub is_replica: bool,
    /// Master address reported by a replica
    pub master: Option<EndPoint>,
    /// Value of the tie-breaker key, when read
    pub tie_breaker: Option<String>,
}

/// Point-in-time view of an endpoint
#[derive(Debug, Clone, Serialize)]
pub struct ServerStatus {
    /// Address
    pub endpoint: EndPoint,
    /// Kind of server
    pub server_type: ServerType,
    /// Whether the server is a replica
    pub is_replica: bool,
    /// Interactive connection is up
    pub connected: bool,
    /// Subscription connection is up
    pub subscriber_connected: bool,
    /// Server version, when known
    pub version: Option<String>,
    /// Negotiated protocol
    pub protocol: String,
    /// Names of the unselectable flags
    pub unselectable: Vec<String>,
    /// Commands queued for writing
    pub queued: usize,
    /// Commands awaiting a reply
    pub in_flight: usize,
    /// Messages accepted for writing
    pub operations: u64,
    /// Last recorded error
    pub last_error: Option<String>,
}

impl fmt::Display for ServerStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} {} ({}), {}; ops={}, queued={}, in-flight={}",
            self.endpoint,
            self.server_type,
            if self.is_replica { "replica" } else { "master" },
            self.version.as_deref().unwrap_or("unknown version"),
            if self.connected {
                "connected"
            } else {
                "disconnected"
            },
            self.operations,
            self.queued,
            self.in_flight
        )?;
        if !self.unselectable.is_empty() {
            write!(f, ", unselectable: {}", self.unselectable.join("|"))?;
        }
        if let Some(error) = &self.last_error {
            write!(f, ", last error: {}", error)?;
        }
        Ok(())
    }
}

fn server_type_to_u8(server_type: ServerType) -> u8 {
    match server_type {
        ServerType::Standalone => 0,
        ServerType::Cluster => 1,
        ServerType::Sentinel => 2,
        ServerType::Proxy => 3,
    }
}

fn server_type_from_u8(value: u8) -> ServerType {
    match value {
        1 => ServerType::Cluster,
        2 => ServerType::Sentinel,
        3 => ServerType::Proxy,
        _ => ServerType::Standalone,
    }
}

/// One Redis server and its two connections
pub struct ServerEndpoint {
    endpoint: EndPoint,
    config: Arc<ConnectionConfig>,
    connector: Arc<dyn Connector>,
    bridge_events: mpsc::UnboundedSender<BridgeEvent>,
    hub: EventHub,
    interactive: RwLock<Option<Arc<PhysicalBridge>>>,
    subscription: RwLock<Option<Arc<PhysicalBridge>>>,
    connecting: tokio::sync::Mutex<()>,
    is_replica: AtomicBool,
    server_type: AtomicU8,
    resp3: AtomicBool,
    databases: AtomicU32,
    unselectable: AtomicU8,
    features: RwLock<Option<ServerFeatures>>,
    master: RwLock<Option<EndPoint>>,
    last_error: RwLock<Option<String>>,
    last_heartbeat: RwLock<Option<Instant>>,
    counters: ServerCounters,
}

impl fmt::Debug for ServerEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerEndpoint")
            .field("endpoint", &self.endpoint)
            .field("server_type", &self.server_type())
            .field("is_replica", &self.is_replica())
            .field("connected", &self.is_connected())
            .field("unselectable", &self.unselectable())
            .finish()
    }
}

impl ServerEndpoint {
    /// Create an endpoint; nothing is connected yet
    pub fn new(
        endpoint: EndPoint,
        config: Arc<ConnectionConfig>,
        connector: Arc<dyn Connector>,
        bridge_events: mpsc::UnboundedSender<BridgeEvent>,
        hub: EventHub,
    ) -> Self {
        Self {
            endpoint,
            config,
            connector,
            bridge_events,
            hub,
            interactive: RwLock::new(None),
            subscription: RwLock::new(None),
            connecting: tokio::sync::Mutex::new(()),
            is_replica: AtomicBool::new(false),
            server_type: AtomicU8::new(server_type_to_u8(ServerType::Standalone)),
            resp3: AtomicBool::new(false),
            databases: AtomicU32::new(DEFAULT_DATABASES),
            unselectable: AtomicU8::new(0),
            features: RwLock::new(None),
            master: RwLock::new(None),
            last_error: RwLock::new(None),
            last_heartbeat: RwLock::new(None),
            counters: ServerCounters::default(),
        }
    }

    /// The endpoint's address
    #[must_use]
    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// Kind of server, as of the last probe
    #[must_use]
    pub fn server_type(&self) -> ServerType {
        server_type_from_u8(self.server_type.load(Ordering::Acquire))
    }

    pub(crate) fn set_server_type(&self, server_type: ServerType) {
        let previous = self
            .server_type
            .swap(server_type_to_u8(server_type), Ordering::AcqRel);
        if server_type == ServerType::Cluster {
            self.databases.store(1, Ordering::Release);
        } else if previous == server_type_to_u8(ServerType::Cluster) {
            self.databases.store(DEFAULT_DATABASES, Ordering::Release);
        }
    }

    /// Whether the server is a replica
    #[must_use]
    pub fn is_replica(&self) -> bool {
        self.is_replica.load(Ordering::Acquire)
    }

    pub(crate) fn set_replica(&self, is_replica: bool) {
        self.is_replica.store(is_replica, Ordering::Release);
    }

    /// Negotiated protocol of the interactive connection
    #[must_use]
    pub fn protocol(&self) -> ProtocolVersion {
        if self.resp3.load(Ordering::Acquire) {
            ProtocolVersion::Resp3
        } else {
            ProtocolVersion::Resp2
        }
    }

    /// Capabilities derived from the reported version
    #[must_use]
    pub fn features(&self) -> Option<ServerFeatures> {
        self.features.read().clone()
    }

    /// Number of databases the server has
    #[must_use]
    pub fn databases(&self) -> u32 {
        self.databases.load(Ordering::Acquire)
    }

    /// Master reported by a replica
    #[must_use]
    pub fn master(&self) -> Option<EndPoint> {
        self.master.read().clone()
    }

    /// Current unselectable flags
    #[must_use]
    pub fn unselectable(&self) -> UnselectableFlags {
        UnselectableFlags::from_bits_truncate(self.unselectable.load(Ordering::Acquire))
    }

    /// Add unselectable flags
    pub fn set_unselectable(&self, flags: UnselectableFlags) {
        let before = UnselectableFlags::from_bits_truncate(
            self.unselectable.fetch_or(flags.bits(), Ordering::AcqRel),
        );
        if !before.contains(flags) {
            debug!("{} is now unselectable: {:?}", self.endpoint, before | flags);
        }
    }

    /// Remove unselectable flags
    pub fn clear_unselectable(&self, flags: UnselectableFlags) {
        self.unselectable.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    /// Connected and not excluded from routing
    #[must_use]
    pub fn is_selectable(&self) -> bool {
        self.is_connected() && self.unselectable().is_empty()
    }

    /// Whether the interactive connection is up
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.interactive
            .read()
            .as_ref()
            .is_some_and(|bridge| bridge.is_connected())
    }

    /// Whether the subscription connection is up
    #[must_use]
    pub fn is_subscriber_connected(&self) -> bool {
        self.subscription
            .read()
            .as_ref()
            .is_some_and(|bridge| bridge.is_connected())
    }

    /// Operation counters
    #[must_use]
    pub fn counters(&self) -> &ServerCounters {
        &self.counters
    }

    /// Last error recorded for this endpoint
    #[must_use]
    pub fn last_error(&self) -> Option<String> {
        self.last_error.read().clone()
    }

    pub(crate) fn record_error(&self, error: &RedisError) {
        *self.last_error.write() = Some(error.to_string());
    }

    /// When the heartbeat last checked the endpoint
    #[must_use]
    pub fn last_heartbeat(&self) -> Option<Instant> {
        *self.last_heartbeat.read()
    }

    fn bridge(&self, connection: ConnectionType) -> &RwLock<Option<Arc<PhysicalBridge>>> {
        match connection {
            ConnectionType::Interactive => &self.interactive,
            ConnectionType::Subscription => &self.subscription,
        }
    }

    fn connected_bridge(&self, connection: ConnectionType) -> Option<Arc<PhysicalBridge>> {
        self.bridge(connection)
            .read()
            .as_ref()
            .filter(|bridge| bridge.is_connected())
            .cloned()
    }

    /// Make sure `connection` is up, connecting if necessary
    ///
    /// # Errors
    ///
    /// Returns the connect or handshake failure.
    pub async fn activate(&self, connection: ConnectionType, deadline: Instant) -> RedisResult<()> {
        if self.connected_bridge(connection).is_some() {
            return Ok(());
        }
        let _guard = self.connecting.lock().await;
        if self.connected_bridge(connection).is_some() {
            return Ok(());
        }

        debug!("Activating {} connection to {}", connection, self.endpoint);
        let opened = timeout_at(
            deadline,
            RedisConnection::open(self.connector.as_ref(), &self.endpoint, &self.config),
        )
        .await
        .unwrap_or_else(|_| {
            Err(RedisError::connection(
                ConnectionFailureKind::UnableToResolvePhysicalConnection,
                &self.endpoint,
                "connect timed out",
            ))
        });

        let (conn, handshake) = match opened {
            Ok(opened) => opened,
            Err(e) => {
                self.counters.connect_failures.fetch_add(1, Ordering::Relaxed);
                self.record_error(&e);
                debug!("Connect to {} failed: {}", self.endpoint, e);
                return Err(e);
            }
        };

        if let Some(negotiation) = &handshake.negotiation {
            if let Some(mode) = negotiation.mode {
                self.set_server_type(mode);
            }
            if let Some(role) = &negotiation.role {
                self.set_replica(role != "master");
            }
            if let Some(version) = negotiation.server_version.as_deref() {
                *self.features.write() = ServerFeatures::parse(version);
            }
        }
        if connection == ConnectionType::Interactive {
            self.resp3.store(
                handshake.protocol == ProtocolVersion::Resp3,
                Ordering::Release,
            );
        }

        let (stream, leftover) = conn.into_parts();
        let bridge = PhysicalBridge::spawn(
            self.endpoint.clone(),
            connection,
            self.config.clone(),
            handshake.protocol,
            stream,
            leftover,
            self.bridge_events.clone(),
        );
        *self.bridge(connection).write() = Some(Arc::new(bridge));
        self.counters.connects.fetch_add(1, Ordering::Relaxed);
        *self.last_error.write() = None;

        info!("Connected {} connection to {}", connection, self.endpoint);
        self.hub.publish(MuxEvent::ConnectionRestored {
            endpoint: self.endpoint.clone(),
            connection,
        });
        Ok(())
    }

    /// Hand a message to the interactive connection
    ///
    /// On anything but success the message's sink has been failed.
    pub fn try_write(&self, message: Message) -> WriteResult {
        self.write_on(ConnectionType::Interactive, message)
    }

    fn write_on(&self, connection: ConnectionType, message: Message) -> WriteResult {
        let bridge = self.bridge(connection).read().clone();
        let result = match bridge {
            Some(bridge) => bridge.try_write(message),
            None => {
                let detail = if self.config.include_detail_in_exceptions {
                    format!("{} has no {} connection (command {})", self.endpoint, connection, message.command)
                } else {
                    format!("{} has no {} connection", self.endpoint, connection)
                };
                message.fail(RedisError::NoConnectionAvailable(detail));
                WriteResult::NoConnectionAvailable
            }
        };
        match result {
            WriteResult::Success => {
                self.counters.operations.fetch_add(1, Ordering::Relaxed);
            }
            _ => {
                self.counters.write_failures.fetch_add(1, Ordering::Relaxed);
            }
        }
        result
    }

    /// Send a command issued by the multiplexer itself and wait for the reply
    ///
    /// # Errors
    ///
    /// Returns a timeout when `deadline` passes, or the command's error.
    pub async fn send_internal(
        &self,
        connection: ConnectionType,
        command: Command,
        deadline: Instant,
    ) -> RedisResult<RespValue> {
        let command = command.with_flags(CommandFlags::INTERNAL_CALL | CommandFlags::NO_REDIRECT);
        let description = command.describe();
        let (tx, rx) = oneshot::channel();
        self.write_on(connection, Message::new(command, Some(tx), Some(deadline)));

        match timeout_at(deadline, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(RedisError::connection(
                ConnectionFailureKind::InternalFailure,
                &self.endpoint,
                format!("{} was dropped without a reply", description),
            )),
            Err(_) => Err(RedisError::Timeout(format!(
                "{} on {}",
                description, self.endpoint
            ))),
        }
    }

    /// Connect (if needed) and find out what kind of server this is
    ///
    /// Sends `INFO` (or `ROLE`), a tracer (`PING`, `ECHO` or `TIME`) and, when
    /// configured, reads the tie-breaker key. Every step honours the command map.
    ///
    /// # Errors
    ///
    /// Returns the connect failure or the first failed probe command.
    pub async fn auto_configure(&self, deadline: Instant) -> RedisResult<ProbeReport> {
        self.activate(ConnectionType::Interactive, deadline).await?;
        let map = &self.config.command_map;

        if map.is_available("INFO") {
            let reply = self
                .send_internal(ConnectionType::Interactive, Command::new(CommandCode::Info), deadline)
                .await?;
            let info = parse_info(&reply.as_string()?);
            if let Some(version) = info.get("redis_version") {
                *self.features.write() = ServerFeatures::parse(version);
            }
            let mode = info
                .get("redis_mode")
                .and_then(|m| ServerType::from_mode(m))
                .unwrap_or(ServerType::Standalone);
            let cluster_enabled = info.get("cluster_enabled").map(String::as_str) == Some("1");
            self.set_server_type(if cluster_enabled { ServerType::Cluster } else { mode });

            match info.get("role").map(String::as_str) {
                Some("slave" | "replica") => {
                    self.set_replica(true);
                    let master = match (info.get("master_host"), info.get("master_port")) {
                        (Some(host), Some(port)) => {
                            port.parse::<u16>().ok().map(|port| EndPoint::new(host.clone(), port))
                        }
                        _ => None,
                    };
                    *self.master.write() = master;
                }
                Some(_) => {
                    self.set_replica(false);
                    *self.master.write() = None;
                }
                None => {}
            }
        } else if map.is_available("ROLE") {
            let reply = self
                .send_internal(ConnectionType::Interactive, Command::new(CommandCode::Role), deadline)
                .await?;
            match RoleReply::parse(&reply) {
                Some(RoleReply::Master { .. }) => {
                    self.set_replica(false);
                    *self.master.write() = None;
                }
                Some(RoleReply::Replica { host, port }) => {
                    self.set_replica(true);
                    *self.master.write() = Some(EndPoint::new(host, port));
                }
                Some(RoleReply::Sentinel { .. }) => self.set_server_type(ServerType::Sentinel),
                None => warn!("Unrecognised ROLE reply from {}", self.endpoint),
            }
        }

        self.send_tracer(deadline).await?;

        let server_type = self.server_type();
        let tie_breaker = if self.config.has_tie_breaker()
            && server_type != ServerType::Sentinel
            && map.is_available("GET")
        {
            let get = Command::new(CommandCode::Get)
                .key(Bytes::from(self.config.tie_breaker.clone()))
                .with_db(0);
            match self.send_internal(ConnectionType::Interactive, get, deadline).await {
                Ok(value) => value.as_optional_string().ok().flatten(),
                Err(e) => {
                    debug!("Tie-breaker read failed on {}: {}", self.endpoint, e);
                    None
                }
            }
        } else {
            None
        };

        if self.config.allow_admin
            && server_type == ServerType::Standalone
            && map.is_available("CONFIG")
        {
            let config_get = Command::new(CommandCode::Config).arg("GET").arg("databases");
            if let Ok(reply) = self
                .send_internal(ConnectionType::Interactive, config_get, deadline)
                .await
            {
                if let Some(count) = reply
                    .field("databases")
                    .and_then(|v| v.as_int().ok())
                    .and_then(|n| u32::try_from(n).ok())
                {
                    self.databases.store(count.max(1), Ordering::Release);
                }
            }
        }

        *self.last_heartbeat.write() = Some(Instant::now());
        Ok(ProbeReport {
            server_type,
            is_replica: self.is_replica(),
            master: self.master(),
            tie_breaker,
        })
    }

    async fn send_tracer(&self, deadline: Instant) -> RedisResult<()> {
        let map = &self.config.command_map;
        let tracer = if map.is_available("PING") {
            Command::new(CommandCode::Ping)
        } else if map.is_available("ECHO") {
            Command::new(CommandCode::Echo).arg("tracer")
        } else if map.is_available("TIME") {
            Command::new(CommandCode::Time)
        } else {
            return Ok(());
        };
        match self
            .send_internal(ConnectionType::Interactive, tracer, deadline)
            .await
        {
            Err(RedisError::Server(msg)) if msg.starts_with("LOADING") => Err(RedisError::connection(
                ConnectionFailureKind::Loading,
                &self.endpoint,
                msg,
            )),
            Err(e) => Err(e),
            Ok(_) => Ok(()),
        }
    }

    /// Read the cluster layout from this node
    ///
    /// # Errors
    ///
    /// Returns the command failure or a parse error.
    pub async fn cluster_nodes(&self, deadline: Instant) -> RedisResult<ClusterConfiguration> {
        let reply = self
            .send_internal(
                ConnectionType::Interactive,
                Command::raw(CommandCode::Cluster, ["NODES"]),
                deadline,
            )
            .await?;
        ClusterConfiguration::parse(&reply.as_string()?, &self.endpoint)
    }

    /// Subscribe the subscription connection to `channel`
    ///
    /// # Errors
    ///
    /// Returns the connect failure or the server's rejection.
    pub async fn subscribe(&self, channel: &str, deadline: Instant) -> RedisResult<()> {
        self.activate(ConnectionType::Subscription, deadline).await?;
        let command = Command::new(CommandCode::Subscribe).arg(Bytes::from(channel.to_string()));
        self.send_internal(ConnectionType::Subscription, command, deadline)
            .await?;
        debug!("Subscribed to {} on {}", channel, self.endpoint);
        Ok(())
    }

    /// Send a keep-alive tracer when the interactive connection has been idle
    pub(crate) fn keep_alive(&self, idle: Duration) {
        *self.last_heartbeat.write() = Some(Instant::now());
        let Some(bridge) = self.connected_bridge(ConnectionType::Interactive) else {
            return;
        };
        if bridge.is_idle_for(idle) {
            let ping = Command::new(CommandCode::Ping)
                .with_flags(CommandFlags::INTERNAL_CALL | CommandFlags::FIRE_AND_FORGET);
            debug!("Keep-alive to {}", self.endpoint);
            bridge.try_write(Message::new(ping, None, None));
        }
    }

    /// Drop connections that are no longer usable
    pub(crate) fn reset_disconnected(&self) {
        for connection in [ConnectionType::Interactive, ConnectionType::Subscription] {
            let mut slot = self.bridge(connection).write();
            if slot.as_ref().is_some_and(|bridge| !bridge.is_connected()) {
                *slot = None;
            }
        }
    }

    /// Close both connections, giving in-flight commands up to `grace`
    pub async fn close(&self, grace: Duration) {
        let bridges: Vec<Arc<PhysicalBridge>> = [&self.interactive, &self.subscription]
            .into_iter()
            .filter_map(|slot| slot.write().take())
            .collect();
        for bridge in bridges {
            bridge.close(grace).await;
        }
    }

    /// Point-in-time status
    #[must_use]
    pub fn status(&self) -> ServerStatus {
        let bridge: Option<BridgeStatus> =
            self.interactive.read().as_ref().map(|bridge| bridge.status());
        let unselectable = self
            .unselectable()
            .iter_names()
            .map(|(name, _)| name.to_string())
            .collect();
        ServerStatus {
            endpoint: self.endpoint.clone(),
            server_type: self.server_type(),
            is_replica: self.is_replica(),
            connected: self.is_connected(),
            subscriber_connected: self.is_subscriber_connected(),
            version: self.features().map(|f| f.to_string()),
            protocol: self.protocol().to_string(),
            unselectable,
            queued: bridge.map_or(0, |b| b.queued),
            in_flight: bridge.map_or(0, |b| b.in_flight),
            operations: self.counters.operations.load(Ordering::Relaxed),
            last_error: self.last_error(),
        }
    }
}
