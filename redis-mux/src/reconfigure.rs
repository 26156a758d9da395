//! Reconfiguration
//!
//! A run probes every known endpoint, works out the shape of the deployment,
//! elects a master when several claim the role, and swaps the resulting
//! topology into the selection strategy. Runs never overlap: a run token is
//! taken by compare-and-swap and released when the run's guard drops, so a
//! concurrent request is declined instead of queued.

use crate::bridge::ConnectionType;
use crate::cluster::ClusterConfiguration;
use crate::command::{Command, CommandCode};
use crate::election::elect_master;
use crate::events::MuxEvent;
use crate::multiplexer::MuxInner;
use crate::selection::Topology;
use crate::server::{ProbeReport, ServerEndpoint, UnselectableFlags};
use futures_util::stream::{FuturesUnordered, StreamExt};
use parking_lot::Mutex;
use redis_mux_core::{
    error::{RedisError, RedisResult},
    types::{EndPoint, ServerType, DEFAULT_PORT},
};
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::time::{timeout, timeout_at, Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

/// Probe iterations per attempt: configured endpoints, then nodes discovered
/// through `CLUSTER NODES`
const MAX_PROBE_ITERATIONS: usize = 2;

/// Result of asking for a reconfiguration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReconfigureOutcome {
    /// The run finished
    Completed {
        /// Whether a Redis server of a usable type responded
        healthy: bool,
    },
    /// Another run was in progress, nothing was done
    AlreadyRunning {
        /// Cause of the run in progress
        cause: String,
    },
}

/// The run token cell
#[derive(Debug, Default)]
pub(crate) struct RunState {
    token: AtomicU64,
    issued: AtomicU64,
    cause: Mutex<Option<String>>,
    finished: Notify,
}

impl RunState {
    fn begin(&self, cause: &str) -> Option<ActiveRun<'_>> {
        let token = self.issued.fetch_add(1, Ordering::Relaxed) + 1;
        self.token
            .compare_exchange(0, token, Ordering::AcqRel, Ordering::Acquire)
            .ok()?;
        *self.cause.lock() = Some(cause.to_string());
        Some(ActiveRun { state: self })
    }

    /// Cause of the active run
    pub(crate) fn current_cause(&self) -> Option<String> {
        if self.token.load(Ordering::Acquire) == 0 {
            return None;
        }
        self.cause.lock().clone()
    }
}

struct ActiveRun<'a> {
    state: &'a RunState,
}

impl Drop for ActiveRun<'_> {
    fn drop(&mut self) {
        *self.state.cause.lock() = None;
        self.state.token.store(0, Ordering::Release);
        self.state.finished.notify_waiters();
    }
}

struct Probed {
    server: Arc<ServerEndpoint>,
    report: ProbeReport,
}

#[derive(Default)]
struct Survey {
    /// In probe completion order
    responded: Vec<Probed>,
    cluster: Option<ClusterConfiguration>,
}

impl Survey {
    /// At least one Redis server, cluster node or sentinel answered
    fn is_healthy(&self) -> bool {
        self.responded.iter().any(|probed| {
            matches!(
                probed.report.server_type,
                ServerType::Standalone | ServerType::Cluster | ServerType::Sentinel
            )
        })
    }
}

impl MuxInner {
    /// Run one reconfiguration
    ///
    /// `first` marks the initial connect, which resolves DNS, retries
    /// unhealthy rounds and may fail outright.
    pub(crate) async fn reconfigure(
        self: &Arc<Self>,
        cause: &str,
        blame: Option<EndPoint>,
        first: bool,
        broadcast: bool,
    ) -> RedisResult<ReconfigureOutcome> {
        let Some(_run) = self.run.begin(cause) else {
            let running = self
                .run
                .current_cause()
                .unwrap_or_else(|| "unknown".to_string());
            debug!(
                "Reconfiguration for '{}' declined, already running for '{}'",
                cause, running
            );
            return Ok(ReconfigureOutcome::AlreadyRunning { cause: running });
        };
        if self.is_closed() {
            return Err(RedisError::Disposed);
        }
        info!("Reconfiguring: {}", cause);

        if first && self.config.resolve_dns {
            self.resolve_seeds().await?;
        }
        let seeds = self.seeds.read().clone();
        for seed in &seeds {
            self.get_or_add(seed);
        }
        if self.servers().is_empty() {
            let error = RedisError::UnableToConnect("no endpoints are configured".to_string());
            self.record_error(&error);
            return Err(error);
        }

        let attempts = if first {
            self.config.connect_retry + 1
        } else {
            1
        };
        let mut topology = None;
        for attempt in 1..=attempts {
            if attempt > 1 {
                debug!("Connect attempt {} of {}", attempt, attempts);
                for server in self.servers() {
                    server.reset_disconnected();
                }
            }
            let deadline = Instant::now() + self.config.connect_timeout;
            let survey = self.survey(deadline).await;
            if survey.is_healthy() {
                topology = Some(self.build_topology(&survey));
                break;
            }
        }

        let Some(topology) = topology else {
            let error = self.unreachable_error(cause);
            self.record_error(&error);
            if first && self.config.abort_on_connect_fail {
                return Err(error);
            }
            if first {
                warn!("Continuing without a connection: {}", error);
                self.start_heartbeat();
            } else {
                warn!("Keeping the previous topology: {}", error);
            }
            return Ok(ReconfigureOutcome::Completed { healthy: false });
        };

        self.apply(topology, blame).await;
        if broadcast {
            if let Err(e) = self.broadcast_reconfigure().await {
                warn!("Reconfiguration broadcast failed: {}", e);
            }
        }
        Ok(ReconfigureOutcome::Completed { healthy: true })
    }

    /// Run a reconfiguration, first waiting out one that is in progress
    pub(crate) async fn reconfigure_after_current(
        self: &Arc<Self>,
        cause: &str,
        limit: Duration,
    ) -> RedisResult<ReconfigureOutcome> {
        let deadline = Instant::now() + limit;
        loop {
            let finished = self.run.finished.notified();
            match self.reconfigure(cause, None, false, false).await? {
                ReconfigureOutcome::AlreadyRunning { cause: running } => {
                    debug!("'{}' waits for the run for '{}'", cause, running);
                    if timeout_at(deadline, finished).await.is_err() {
                        return Ok(ReconfigureOutcome::AlreadyRunning { cause: running });
                    }
                }
                done => return Ok(done),
            }
        }
    }

    fn unreachable_error(&self, cause: &str) -> RedisError {
        let details: Vec<String> = self
            .servers()
            .iter()
            .filter_map(|server| {
                server
                    .last_error()
                    .map(|error| format!("{}: {}", server.endpoint(), error))
            })
            .collect();
        if details.is_empty() || !self.config.include_detail_in_exceptions {
            RedisError::UnableToConnect(format!("no endpoint responded ({cause})"))
        } else {
            RedisError::UnableToConnect(format!(
                "no endpoint responded ({cause}); {}",
                details.join("; ")
            ))
        }
    }

    async fn resolve_seeds(&self) -> RedisResult<()> {
        let seeds = self.seeds.read().clone();
        let mut resolved: Vec<EndPoint> = Vec::with_capacity(seeds.len());
        for seed in seeds {
            if seed.is_ip() {
                resolved.push(seed);
                continue;
            }
            let host = seed.host.clone();
            let lookup = tokio::net::lookup_host((host.as_str(), seed.port));
            let resolution = timeout(self.config.connect_timeout, lookup).await;
            let endpoint = match resolution {
                Err(_) => {
                    return Err(RedisError::UnableToConnect(format!(
                        "timed out resolving {seed}"
                    )))
                }
                Ok(Ok(mut addresses)) => match addresses.next() {
                    Some(address) => {
                        debug!("Resolved {} to {}", seed, address);
                        EndPoint::new(address.ip().to_string(), address.port())
                    }
                    None => seed,
                },
                Ok(Err(e)) => {
                    warn!("Could not resolve {}: {}", seed, e);
                    seed
                }
            };
            if !resolved.contains(&endpoint) {
                resolved.push(endpoint);
            }
        }
        *self.seeds.write() = resolved;
        Ok(())
    }

    async fn probe_all(&self, targets: Vec<Arc<ServerEndpoint>>, deadline: Instant) -> Vec<Probed> {
        let mut probes: FuturesUnordered<_> = targets
            .into_iter()
            .map(|server| async move {
                let result = server.auto_configure(deadline).await;
                (server, result)
            })
            .collect();

        let mut responded = Vec::new();
        while let Some((server, result)) = probes.next().await {
            match result {
                Ok(report) => {
                    server.clear_unselectable(
                        UnselectableFlags::DID_NOT_RESPOND
                            | UnselectableFlags::WRONG_SERVER_TYPE
                            | UnselectableFlags::REDUNDANT_MASTER,
                    );
                    debug!(
                        "{} responded: {} {}",
                        server.endpoint(),
                        report.server_type,
                        if report.is_replica { "replica" } else { "master" }
                    );
                    responded.push(Probed { server, report });
                }
                Err(e) => {
                    debug!("{} did not respond: {}", server.endpoint(), e);
                    server.set_unselectable(UnselectableFlags::DID_NOT_RESPOND);
                    server.record_error(&e);
                }
            }
        }
        responded
    }

    async fn survey(&self, deadline: Instant) -> Survey {
        let mut survey = Survey::default();
        let mut probed: HashSet<EndPoint> = HashSet::new();

        for iteration in 1..=MAX_PROBE_ITERATIONS {
            let targets: Vec<Arc<ServerEndpoint>> = self
                .servers()
                .into_iter()
                .filter(|server| probed.insert(server.endpoint().clone()))
                .collect();
            if targets.is_empty() {
                break;
            }
            debug!("Probe iteration {} over {} endpoints", iteration, targets.len());
            let responded = self.probe_all(targets, deadline).await;
            survey.responded.extend(responded);
            if survey.cluster.is_some() {
                break;
            }

            let seed = survey
                .responded
                .iter()
                .find(|p| p.report.server_type == ServerType::Cluster)
                .map(|p| p.server.clone());
            let Some(seed) = seed else {
                break;
            };
            if !self.config.command_map.is_available("CLUSTER") {
                break;
            }
            match seed.cluster_nodes(deadline).await {
                Ok(config) => {
                    let mut discovered = 0;
                    for node in config.healthy_nodes() {
                        if self.server(&node.endpoint).is_none() {
                            self.get_or_add(&node.endpoint);
                            discovered += 1;
                        }
                    }
                    info!(
                        "{} reported {} cluster nodes, {} new",
                        seed.endpoint(),
                        config.nodes().len(),
                        discovered
                    );
                    survey.cluster = Some(config);
                    if discovered == 0 {
                        break;
                    }
                }
                Err(e) => {
                    warn!("CLUSTER NODES failed on {}: {}", seed.endpoint(), e);
                    seed.record_error(&e);
                    break;
                }
            }
        }
        survey
    }

    fn build_topology(&self, survey: &Survey) -> Topology {
        if let Some(config) = &survey.cluster {
            for probed in &survey.responded {
                if probed.report.server_type != ServerType::Cluster {
                    probed
                        .server
                        .set_unselectable(UnselectableFlags::WRONG_SERVER_TYPE);
                }
            }
            let topology = Topology::cluster(config, |endpoint| self.server(endpoint));
            info!(
                "Cluster topology: {} masters, {} replicas",
                topology.masters().len(),
                topology.replicas().len()
            );
            return topology;
        }

        let mut masters = Vec::new();
        let mut replicas = Vec::new();
        let mut sentinels = Vec::new();
        for probed in &survey.responded {
            if probed.report.server_type == ServerType::Sentinel {
                sentinels.push(probed.server.clone());
            } else if probed.report.is_replica {
                replicas.push(probed.server.clone());
            } else {
                masters.push(probed.server.clone());
            }
        }

        let preferred = self.preferred_master.read().clone();
        let winner = match preferred {
            Some(named) => {
                let winner = masters.iter().position(|m| m.endpoint() == &named);
                match winner {
                    Some(_) => info!("Following {} as master", named),
                    None => warn!("{} does not answer as a master", named),
                }
                winner
            }
            None => {
                let candidates: Vec<EndPoint> =
                    masters.iter().map(|s| s.endpoint().clone()).collect();
                let votes = survey
                    .responded
                    .iter()
                    .filter_map(|p| p.report.tie_breaker.as_deref());
                elect_master(&candidates, votes, DEFAULT_PORT).map(|election| {
                    info!("Elected {} as master ({})", election.endpoint, election.kind);
                    election.winner
                })
            }
        };
        for (index, loser) in masters.iter().enumerate() {
            if Some(index) != winner {
                warn!("{} is a redundant master", loser.endpoint());
                loser.set_unselectable(UnselectableFlags::REDUNDANT_MASTER);
            }
        }
        let master = winner.map(|index| masters[index].clone());

        info!(
            "Standalone topology: master {}, {} replicas, {} sentinels",
            master
                .as_ref()
                .map_or_else(|| "none".to_string(), |m| m.endpoint().to_string()),
            replicas.len(),
            sentinels.len()
        );
        Topology::standalone(master, replicas, sentinels)
    }

    async fn apply(self: &Arc<Self>, topology: Topology, blame: Option<EndPoint>) {
        self.selection.set_topology(topology);
        let topology = self.selection.topology();
        let deadline = Instant::now() + self.config.connect_timeout;
        self.resubscribe(&topology, deadline).await;
        self.start_heartbeat();
        self.hub
            .publish(MuxEvent::ConfigurationChanged { endpoint: blame });
    }

    /// Channels to keep subscribed, including the configuration channel
    pub(crate) fn tracked_channels(&self) -> Vec<String> {
        let mut channels: Vec<String> = self.channels.lock().iter().cloned().collect();
        let broadcast = &self.config.configuration_channel;
        if !broadcast.is_empty() && !channels.contains(broadcast) {
            channels.push(broadcast.clone());
        }
        channels
    }

    /// The endpoint that carries subscriptions
    ///
    /// Stays on the current one while its subscription connection is up.
    pub(crate) fn subscription_server(&self, topology: &Topology) -> Option<Arc<ServerEndpoint>> {
        let current = self.subscribed_on.lock().clone();
        if let Some(server) = current.and_then(|endpoint| self.server(&endpoint)) {
            if server.is_subscriber_connected() && server.unselectable().is_empty() {
                return Some(server);
            }
        }
        topology
            .masters()
            .iter()
            .chain(topology.sentinels())
            .chain(topology.replicas())
            .find(|server| server.is_selectable())
            .cloned()
    }

    async fn resubscribe(&self, topology: &Topology, deadline: Instant) {
        if !self.config.command_map.is_available("SUBSCRIBE") {
            return;
        }
        let channels = self.tracked_channels();
        if channels.is_empty() {
            return;
        }
        let Some(server) = self.subscription_server(topology) else {
            debug!("No endpoint available for subscriptions");
            return;
        };
        let current = self.subscribed_on.lock().clone();
        if current.as_ref() == Some(server.endpoint()) && server.is_subscriber_connected() {
            return;
        }

        for channel in &channels {
            if let Err(e) = server.subscribe(channel, deadline).await {
                warn!("Subscribing {} on {} failed: {}", channel, server.endpoint(), e);
                return;
            }
        }
        info!(
            "Subscribed {} channels on {}",
            channels.len(),
            server.endpoint()
        );
        *self.subscribed_on.lock() = Some(server.endpoint().clone());
    }

    /// Ask other multiplexers on the configuration channel to reconfigure
    ///
    /// Returns the number of receivers the server reported.
    pub(crate) async fn broadcast_reconfigure(&self) -> RedisResult<i64> {
        let channel = &self.config.configuration_channel;
        if channel.is_empty() || !self.config.command_map.is_available("PUBLISH") {
            return Ok(0);
        }
        let topology = self.selection.topology();
        let master = topology
            .masters()
            .iter()
            .find(|server| server.is_selectable())
            .cloned()
            .ok_or_else(|| {
                RedisError::NoConnectionAvailable("no master to broadcast through".to_string())
            })?;
        let publish = Command::new(CommandCode::Publish)
            .arg(channel.clone())
            .arg("*");
        let deadline = Instant::now() + self.config.async_timeout;
        let receivers = master
            .send_internal(ConnectionType::Interactive, publish, deadline)
            .await?
            .as_int()?;
        info!("Broadcast reconfiguration to {} receivers", receivers);
        Ok(receivers)
    }

    fn start_heartbeat(self: &Arc<Self>) {
        let mut slot = self.heartbeat.lock();
        if slot.is_some() {
            return;
        }
        let weak = Arc::downgrade(self);
        let period = self.config.heartbeat_interval;
        debug!("Starting heartbeat every {:?}", period);
        *slot = Some(self.runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                if inner.is_closed() {
                    break;
                }
                inner.heartbeat().await;
            }
        }));
    }

    /// Keep idle connections alive and bring failed endpoints back
    async fn heartbeat(self: &Arc<Self>) {
        let deadline = Instant::now() + self.config.connect_timeout;
        let mut reconnects = FuturesUnordered::new();
        for server in self.servers() {
            if server.is_connected() {
                server.keep_alive(self.config.keep_alive);
                continue;
            }
            server.reset_disconnected();
            reconnects.push(async move {
                let result = server
                    .activate(ConnectionType::Interactive, deadline)
                    .await;
                (server, result)
            });
        }

        let mut restored = None;
        while let Some((server, result)) = reconnects.next().await {
            if result.is_ok() {
                info!("Heartbeat reconnected {}", server.endpoint());
                if restored.is_none() {
                    restored = Some(server.endpoint().clone());
                }
            }
        }
        if let Some(endpoint) = restored {
            self.trigger_reconfigure(format!("{endpoint} reconnected"), Some(endpoint));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_run_token_is_exclusive() {
        let state = RunState::default();
        let run = state.begin("first").unwrap();
        assert!(state.begin("second").is_none());
        assert_eq!(state.current_cause().as_deref(), Some("first"));
        drop(run);

        assert!(state.current_cause().is_none());
        let again = state.begin("third");
        assert!(again.is_some());
    }

    #[tokio::test]
    async fn test_resolve_seeds_replaces_host_names() {
        let config: redis_mux_core::config::ConnectionConfig = "localhost:6390,127.0.0.1:6391"
            .parse()
            .expect("invalid connection string");
        let (inner, _events) = MuxInner::new(
            config.with_resolve_dns(true),
            Arc::new(crate::connection::TcpConnector),
            tokio::runtime::Handle::current(),
        );
        inner.resolve_seeds().await.expect("resolve failed");

        let seeds = inner.seeds.read().clone();
        assert!(seeds.iter().all(EndPoint::is_ip));
        assert!(seeds.iter().any(|seed| seed.port == 6390));
        assert!(seeds.contains(&EndPoint::new("127.0.0.1", 6391)));
    }
}
