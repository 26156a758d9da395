//! Redis Sentinel support
//!
//! A [`SentinelController`] keeps one multiplexer connected to the sentinel
//! processes and, per monitored service, a child multiplexer connected to the
//! service's current master and its replicas. Master switches announced on
//! `+switch-master` move the child over; new sentinels announced on
//! `+sentinel` join the sentinel multiplexer; services that lost their
//! master are retried on a fixed interval.
//!
//! # Example
//!
//! ```no_run
//! use redis_mux::{ConnectionConfig, SentinelController};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let config: ConnectionConfig = "sentinel1,sentinel2,serviceName=mymaster".parse()?;
//! let sentinel = SentinelController::connect(config).await?;
//!
//! let master = sentinel.get_master("mymaster").await?;
//! master.database(None).set("key", "value").await?;
//! # Ok(())
//! # }
//! ```

use crate::command::{Command, CommandCode};
use crate::connection::{Connector, TcpConnector};
use crate::events::MuxEvent;
use crate::multiplexer::Multiplexer;
use crate::reconfigure::ReconfigureOutcome;
use parking_lot::Mutex;
use redis_mux_core::{
    config::{CommandMap, ConnectionConfig},
    error::{RedisError, RedisResult},
    types::EndPoint,
    value::RespValue,
};
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Channel on which sentinels announce master changes
pub const SWITCH_MASTER_CHANNEL: &str = "+switch-master";

/// Channel on which sentinels announce each other
pub const SENTINEL_HELLO_CHANNEL: &str = "+sentinel";

/// How often services without a master are retried
const RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Connect timeouts a switch waits for a reconfiguration already running
const SWITCH_WAIT_FACTOR: u32 = 4;

/// Replica flags that make a replica unusable
const DOWN_FLAGS: [&str; 3] = ["s_down", "o_down", "disconnected"];

/// Connection state of one monitored service
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SentinelState {
    /// No usable master connection
    Disconnected,
    /// Connected to the master sentinel reports
    Connected,
    /// Moving to a new master
    Switching,
}

/// A `+switch-master` announcement
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSwitch {
    /// Service name
    pub service: String,
    /// Previous master
    pub old: EndPoint,
    /// New master
    pub new: EndPoint,
}

impl MasterSwitch {
    /// Parse `<name> <old-ip> <old-port> <new-ip> <new-port>`
    #[must_use]
    pub fn parse(payload: &str) -> Option<Self> {
        let parts: Vec<&str> = payload.split_whitespace().collect();
        let [service, old_ip, old_port, new_ip, new_port] = parts.as_slice() else {
            return None;
        };
        Some(Self {
            service: (*service).to_string(),
            old: EndPoint::new(*old_ip, old_port.parse().ok()?),
            new: EndPoint::new(*new_ip, new_port.parse().ok()?),
        })
    }
}

/// Parse a `+sentinel` announcement into the new sentinel's address
///
/// The payload is `sentinel <id> <ip> <port> @ <name> <master-ip> <master-port>`.
#[must_use]
pub fn parse_sentinel_hello(payload: &str) -> Option<(String, EndPoint)> {
    let parts: Vec<&str> = payload.split_whitespace().collect();
    match parts.as_slice() {
        ["sentinel", _id, ip, port, "@", service, ..] => {
            Some(((*service).to_string(), EndPoint::new(*ip, port.parse().ok()?)))
        }
        _ => None,
    }
}

/// The master followed by its replicas, without duplicates
fn service_endpoints(master: &EndPoint, replicas: Vec<EndPoint>) -> Vec<EndPoint> {
    let mut endpoints = vec![master.clone()];
    for replica in replicas {
        if !endpoints.contains(&replica) {
            endpoints.push(replica);
        }
    }
    endpoints
}

fn parse_address(reply: &RespValue) -> RedisResult<Option<EndPoint>> {
    if reply.is_null() {
        return Ok(None);
    }
    let parts = reply.as_array()?;
    let [host, port] = parts.as_slice() else {
        return Err(RedisError::UnexpectedResponse(format!(
            "master address with {} parts",
            parts.len()
        )));
    };
    let port = port
        .as_string()?
        .parse::<u16>()
        .map_err(|_| RedisError::Sentinel("invalid master port".to_string()))?;
    Ok(Some(EndPoint::new(host.as_string()?, port)))
}

fn parse_replicas(reply: &RespValue) -> RedisResult<Vec<EndPoint>> {
    let mut replicas = Vec::new();
    for entry in reply.as_array()? {
        let fields: HashMap<String, String> = entry
            .as_pairs()?
            .into_iter()
            .filter_map(|(k, v)| Some((k.as_string().ok()?, v.as_string().ok()?)))
            .collect();
        let flags = fields.get("flags").map(String::as_str).unwrap_or_default();
        if flags.split(',').any(|flag| DOWN_FLAGS.contains(&flag)) {
            continue;
        }
        let (Some(ip), Some(port)) = (fields.get("ip"), fields.get("port")) else {
            continue;
        };
        if let Ok(port) = port.parse::<u16>() {
            replicas.push(EndPoint::new(ip.clone(), port));
        }
    }
    Ok(replicas)
}

struct Service {
    state: SentinelState,
    master: Option<EndPoint>,
    mux: Option<Arc<Multiplexer>>,
}

impl Service {
    const fn new() -> Self {
        Self {
            state: SentinelState::Disconnected,
            master: None,
            mux: None,
        }
    }
}

struct SentinelShared {
    sentinels: Multiplexer,
    template: ConnectionConfig,
    connector: Arc<dyn Connector>,
    services: Mutex<HashMap<String, Service>>,
}

/// Client-side sentinel support
pub struct SentinelController {
    shared: Arc<SentinelShared>,
    tasks: Vec<JoinHandle<()>>,
}

impl SentinelController {
    /// Connect to the sentinels in `config.endpoints` over TCP
    ///
    /// # Errors
    ///
    /// Returns an error when no sentinel can be reached.
    pub async fn connect(config: ConnectionConfig) -> RedisResult<Self> {
        Self::connect_with(config, Arc::new(TcpConnector)).await
    }

    /// Connect using a custom [`Connector`]
    ///
    /// `config` describes the sentinels; its credentials and timeouts are
    /// reused for the master connections.
    ///
    /// # Errors
    ///
    /// See [`SentinelController::connect`].
    pub async fn connect_with(
        config: ConnectionConfig,
        connector: Arc<dyn Connector>,
    ) -> RedisResult<Self> {
        if config.endpoints.is_empty() {
            return Err(RedisError::Config("No sentinels configured".to_string()));
        }
        let mut sentinel_config = config.clone();
        sentinel_config.command_map = CommandMap::sentinel();
        sentinel_config.tie_breaker = String::new();
        sentinel_config.configuration_channel = String::new();
        sentinel_config.abort_on_connect_fail = true;

        let sentinels = Multiplexer::connect_with(sentinel_config, connector.clone()).await?;
        let events = sentinels.subscribe_events();
        sentinels.subscribe(SWITCH_MASTER_CHANNEL).await?;
        sentinels.subscribe(SENTINEL_HELLO_CHANNEL).await?;
        info!("Connected to {} sentinels", sentinels.endpoints().len());

        let shared = Arc::new(SentinelShared {
            sentinels,
            template: config,
            connector,
            services: Mutex::new(HashMap::new()),
        });
        let tasks = vec![
            tokio::spawn(watch_announcements(Arc::downgrade(&shared), events)),
            tokio::spawn(retry_services(Arc::downgrade(&shared))),
        ];
        Ok(Self { shared, tasks })
    }

    /// The multiplexer connected to the sentinels
    #[must_use]
    pub fn sentinels(&self) -> &Multiplexer {
        &self.shared.sentinels
    }

    /// Master address sentinel currently reports for `service`
    ///
    /// # Errors
    ///
    /// Returns the sentinel's error or a malformed reply.
    pub async fn get_master_address(&self, service: &str) -> RedisResult<Option<EndPoint>> {
        self.shared.master_address(service).await
    }

    /// Healthy replicas sentinel reports for `service`
    ///
    /// # Errors
    ///
    /// Returns the sentinel's error or a malformed reply.
    pub async fn replicas(&self, service: &str) -> RedisResult<Vec<EndPoint>> {
        self.shared.replicas(service).await
    }

    /// A multiplexer connected to the master of `service`
    ///
    /// The multiplexer is created on first use and follows master switches.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::Sentinel`] when sentinel knows no master for the
    /// service, or the connect failure.
    pub async fn get_master(&self, service: &str) -> RedisResult<Arc<Multiplexer>> {
        self.shared.get_master(service).await
    }

    /// Move `service` to `master`
    ///
    /// # Errors
    ///
    /// Returns the reconfiguration failure.
    pub async fn switch_master(&self, service: &str, master: EndPoint) -> RedisResult<()> {
        self.shared.switch_master(service, master).await
    }

    /// State of `service`; unknown services are disconnected
    #[must_use]
    pub fn state(&self, service: &str) -> SentinelState {
        self.shared
            .services
            .lock()
            .get(service)
            .map_or(SentinelState::Disconnected, |s| s.state)
    }

    /// Master `service` is connected to
    #[must_use]
    pub fn current_master(&self, service: &str) -> Option<EndPoint> {
        self.shared
            .services
            .lock()
            .get(service)
            .and_then(|s| s.master.clone())
    }
}

impl Drop for SentinelController {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

impl SentinelShared {
    async fn master_address(&self, service: &str) -> RedisResult<Option<EndPoint>> {
        let command = Command::new(CommandCode::Sentinel)
            .arg("get-master-addr-by-name")
            .arg(service.to_string());
        parse_address(&self.sentinels.execute(command).await?)
    }

    async fn replicas(&self, service: &str) -> RedisResult<Vec<EndPoint>> {
        let command = Command::new(CommandCode::Sentinel)
            .arg("replicas")
            .arg(service.to_string());
        parse_replicas(&self.sentinels.execute(command).await?)
    }

    fn set_state(&self, service: &str, state: SentinelState) {
        self.services
            .lock()
            .entry(service.to_string())
            .or_insert_with(Service::new)
            .state = state;
    }

    async fn get_master(&self, service: &str) -> RedisResult<Arc<Multiplexer>> {
        {
            let services = self.services.lock();
            if let Some(Service {
                state: SentinelState::Connected,
                mux: Some(mux),
                ..
            }) = services.get(service)
            {
                return Ok(mux.clone());
            }
        }

        self.set_state(service, SentinelState::Switching);
        match self.connect_service(service).await {
            Ok((master, mux)) => {
                let mut services = self.services.lock();
                let entry = services
                    .entry(service.to_string())
                    .or_insert_with(Service::new);
                entry.state = SentinelState::Connected;
                entry.master = Some(master);
                entry.mux = Some(mux.clone());
                Ok(mux)
            }
            Err(e) => {
                self.set_state(service, SentinelState::Disconnected);
                Err(e)
            }
        }
    }

    async fn connect_service(&self, service: &str) -> RedisResult<(EndPoint, Arc<Multiplexer>)> {
        let master = self.master_address(service).await?.ok_or_else(|| {
            RedisError::Sentinel(format!("no master is known for service '{service}'"))
        })?;
        let replicas = self.replicas_or_none(service).await;

        let mut config = self.template.clone();
        config.endpoints = service_endpoints(&master, replicas);
        config.service_name = None;
        config.command_map = CommandMap::default();
        config.tie_breaker = String::new();

        info!("Connecting service {} to master {}", service, master);
        let mux =
            Multiplexer::connect_following(config, self.connector.clone(), master.clone()).await?;
        Ok((master, Arc::new(mux)))
    }

    async fn replicas_or_none(&self, service: &str) -> Vec<EndPoint> {
        match self.replicas(service).await {
            Ok(replicas) => replicas,
            Err(e) => {
                debug!("Listing replicas of {} failed: {}", service, e);
                Vec::new()
            }
        }
    }

    async fn switch_master(&self, service: &str, master: EndPoint) -> RedisResult<()> {
        let mux = {
            let mut services = self.services.lock();
            let entry = services
                .entry(service.to_string())
                .or_insert_with(Service::new);
            if entry.master.as_ref() == Some(&master) && entry.state == SentinelState::Connected {
                return Ok(());
            }
            entry.state = SentinelState::Switching;
            entry.mux.clone()
        };

        let Some(mux) = mux else {
            // not connected yet; the next get_master asks sentinel afresh
            self.set_state(service, SentinelState::Disconnected);
            return Ok(());
        };

        info!("Switching service {} to master {}", service, master);
        let replicas = self.replicas_or_none(service).await;
        mux.replace_endpoints(service_endpoints(&master, replicas), master.clone());
        let limit = self.template.connect_timeout.saturating_mul(SWITCH_WAIT_FACTOR);
        let result = mux.reconfigure_after_current("master switch", limit).await;

        let mut services = self.services.lock();
        let entry = services
            .entry(service.to_string())
            .or_insert_with(Service::new);
        match result {
            Ok(ReconfigureOutcome::Completed { .. })
                if mux.master_endpoint().as_ref() == Some(&master) =>
            {
                entry.state = SentinelState::Connected;
                entry.master = Some(master);
                Ok(())
            }
            Ok(outcome) => {
                // retried from the sentinel's view on the next tick
                debug!("Switching {} to {} not done: {:?}", service, master, outcome);
                entry.state = SentinelState::Disconnected;
                Ok(())
            }
            Err(e) => {
                entry.state = SentinelState::Disconnected;
                Err(e)
            }
        }
    }

    fn add_sentinel(self: &Arc<Self>, endpoint: EndPoint) {
        if self.sentinels.get_server(&endpoint).is_some() {
            return;
        }
        info!("Discovered sentinel {}", endpoint);
        self.sentinels.add_endpoint(endpoint);
        let shared = self.clone();
        tokio::spawn(async move {
            if let Err(e) = shared.sentinels.reconfigure().await {
                warn!("Adding sentinel failed: {}", e);
            }
        });
    }
}

async fn watch_announcements(shared: Weak<SentinelShared>, mut events: broadcast::Receiver<MuxEvent>) {
    loop {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!("Sentinel watcher lagged, {} events skipped", skipped);
                continue;
            }
            Err(broadcast::error::RecvError::Closed) => break,
        };
        let MuxEvent::Message {
            channel, payload, ..
        } = event
        else {
            continue;
        };
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let payload = String::from_utf8_lossy(&payload);

        match channel.as_str() {
            SWITCH_MASTER_CHANNEL => {
                let Some(switch) = MasterSwitch::parse(&payload) else {
                    warn!("Malformed {} message: {}", SWITCH_MASTER_CHANNEL, payload);
                    continue;
                };
                if !shared.services.lock().contains_key(&switch.service) {
                    continue;
                }
                info!(
                    "Sentinel reports {} moved from {} to {}",
                    switch.service, switch.old, switch.new
                );
                tokio::spawn(async move {
                    if let Err(e) = shared.switch_master(&switch.service, switch.new).await {
                        warn!("Switching {} failed: {}", switch.service, e);
                    }
                });
            }
            SENTINEL_HELLO_CHANNEL => {
                if let Some((_, endpoint)) = parse_sentinel_hello(&payload) {
                    shared.add_sentinel(endpoint);
                }
            }
            _ => {}
        }
    }
}

async fn retry_services(shared: Weak<SentinelShared>) {
    let mut ticker = tokio::time::interval(RETRY_INTERVAL);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(shared) = shared.upgrade() else {
            break;
        };

        let pending: Vec<(String, Option<Arc<Multiplexer>>)> = shared
            .services
            .lock()
            .iter()
            .filter(|(_, s)| {
                s.state == SentinelState::Disconnected
                    || s.mux.as_ref().is_some_and(|mux| !mux.is_connected())
            })
            .map(|(name, s)| (name.clone(), s.mux.clone()))
            .collect();

        for (service, mux) in pending {
            let master = match shared.master_address(&service).await {
                Ok(Some(master)) => master,
                Ok(None) => continue,
                Err(e) => {
                    debug!("Sentinel lookup for {} failed: {}", service, e);
                    continue;
                }
            };
            let result = match mux {
                Some(_) => shared.switch_master(&service, master).await,
                None => shared.get_master(&service).await.map(|_| ()),
            };
            if let Err(e) = result {
                debug!("Retrying {} failed: {}", service, e);
            }
        }
    }
}
