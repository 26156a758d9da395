//! Server selection
//!
//! Routing reads an immutable [`Topology`] snapshot through `ArcSwap`, so a
//! command never sees a half-applied reconfiguration. Updates (a new topology
//! after reconfiguration, a slot moved by `-MOVED`) build a modified copy and
//! swap it in.

use crate::bridge::{Message, WriteResult};
use crate::cluster::{calculate_slot, ClusterConfiguration, CLUSTER_SLOTS};
use crate::command::{Command, CommandFlags, ReplicaPreference};
use crate::server::ServerEndpoint;
use arc_swap::ArcSwap;
use redis_mux_core::{
    error::{RedisError, RedisResult},
    types::{EndPoint, ServerType},
};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

type SlotTable = Vec<Option<Arc<ServerEndpoint>>>;

/// An immutable view of the servers and how they relate
#[derive(Debug, Clone)]
pub struct Topology {
    server_type: ServerType,
    masters: Vec<Arc<ServerEndpoint>>,
    replicas: Vec<Arc<ServerEndpoint>>,
    sentinels: Vec<Arc<ServerEndpoint>>,
    slots: Option<Arc<SlotTable>>,
    replicas_of: HashMap<EndPoint, Vec<Arc<ServerEndpoint>>>,
    primary_of: HashMap<EndPoint, Arc<ServerEndpoint>>,
}

impl Default for Topology {
    fn default() -> Self {
        Self::standalone(None, Vec::new(), Vec::new())
    }
}

impl Topology {
    /// A master with its replicas, plus any sentinels that were seen
    #[must_use]
    pub fn standalone(
        master: Option<Arc<ServerEndpoint>>,
        replicas: Vec<Arc<ServerEndpoint>>,
        sentinels: Vec<Arc<ServerEndpoint>>,
    ) -> Self {
        let server_type = if master.is_none() && replicas.is_empty() && !sentinels.is_empty() {
            ServerType::Sentinel
        } else {
            ServerType::Standalone
        };
        let mut replicas_of = HashMap::new();
        let mut primary_of = HashMap::new();
        if let Some(master) = &master {
            replicas_of.insert(master.endpoint().clone(), replicas.clone());
            for replica in &replicas {
                primary_of.insert(replica.endpoint().clone(), master.clone());
            }
        }
        Self {
            server_type,
            masters: master.into_iter().collect(),
            replicas,
            sentinels,
            slots: None,
            replicas_of,
            primary_of,
        }
    }

    /// A cluster layout; `lookup` maps node addresses to endpoints
    ///
    /// Nodes without an endpoint, failed nodes and replicas of unknown
    /// primaries are left out.
    pub fn cluster<F>(config: &ClusterConfiguration, lookup: F) -> Self
    where
        F: Fn(&EndPoint) -> Option<Arc<ServerEndpoint>>,
    {
        let mut slots: SlotTable = vec![None; CLUSTER_SLOTS as usize];
        let mut masters = Vec::new();
        let mut replicas = Vec::new();
        let mut replicas_of: HashMap<EndPoint, Vec<Arc<ServerEndpoint>>> = HashMap::new();
        let mut primary_of = HashMap::new();

        for node in config.healthy_nodes().filter(|n| !n.is_replica()) {
            let Some(server) = lookup(&node.endpoint) else {
                continue;
            };
            for range in &node.slots {
                for slot in range.start..=range.end {
                    slots[slot as usize] = Some(server.clone());
                }
            }
            masters.push(server);
        }

        for node in config.healthy_nodes().filter(|n| n.is_replica()) {
            let primary = node
                .parent_id
                .as_deref()
                .and_then(|id| config.node(id))
                .and_then(|parent| lookup(&parent.endpoint));
            let (Some(server), Some(primary)) = (lookup(&node.endpoint), primary) else {
                continue;
            };
            replicas_of
                .entry(primary.endpoint().clone())
                .or_default()
                .push(server.clone());
            primary_of.insert(server.endpoint().clone(), primary);
            replicas.push(server);
        }

        Self {
            server_type: ServerType::Cluster,
            masters,
            replicas,
            sentinels: Vec::new(),
            slots: Some(Arc::new(slots)),
            replicas_of,
            primary_of,
        }
    }

    /// Kind of deployment
    #[must_use]
    pub const fn server_type(&self) -> ServerType {
        self.server_type
    }

    /// Masters (the elected one for standalone deployments)
    #[must_use]
    pub fn masters(&self) -> &[Arc<ServerEndpoint>] {
        &self.masters
    }

    /// The current master of a standalone deployment
    #[must_use]
    pub fn master(&self) -> Option<&Arc<ServerEndpoint>> {
        self.masters.first()
    }

    /// Replicas
    #[must_use]
    pub fn replicas(&self) -> &[Arc<ServerEndpoint>] {
        &self.replicas
    }

    /// Sentinels seen during the last reconfiguration
    #[must_use]
    pub fn sentinels(&self) -> &[Arc<ServerEndpoint>] {
        &self.sentinels
    }

    /// Owner of a cluster slot
    #[must_use]
    pub fn slot_owner(&self, slot: u16) -> Option<&Arc<ServerEndpoint>> {
        self.slots
            .as_ref()
            .and_then(|slots| slots.get(slot as usize))
            .and_then(Option::as_ref)
    }

    fn primary_for(&self, server: &Arc<ServerEndpoint>) -> Arc<ServerEndpoint> {
        if server.is_replica() {
            if let Some(primary) = self.primary_of.get(server.endpoint()) {
                return primary.clone();
            }
        }
        server.clone()
    }
}

/// Picks the endpoint for each command
#[derive(Debug)]
pub struct ServerSelectionStrategy {
    topology: ArcSwap<Topology>,
    replica_offset: AtomicUsize,
}

impl Default for ServerSelectionStrategy {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerSelectionStrategy {
    /// A strategy over an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self {
            topology: ArcSwap::from_pointee(Topology::default()),
            replica_offset: AtomicUsize::new(0),
        }
    }

    /// The current snapshot
    #[must_use]
    pub fn topology(&self) -> Arc<Topology> {
        self.topology.load_full()
    }

    /// Install a new snapshot
    pub fn set_topology(&self, topology: Topology) {
        self.topology.store(Arc::new(topology));
    }

    /// Hash slot of a key
    #[must_use]
    pub fn hash_slot(&self, key: &[u8]) -> u16 {
        calculate_slot(key)
    }

    /// Choose the endpoint for `command`
    ///
    /// `Ok(None)` means no suitable endpoint is currently selectable.
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::MultipleSlots`] when a cluster command's keys
    /// span slots.
    pub fn select(&self, command: &Command) -> RedisResult<Option<Arc<ServerEndpoint>>> {
        let topology = self.topology.load();
        let preference = command.preference();

        if topology.server_type == ServerType::Cluster {
            if let Some(slot) = command.hash_slot()? {
                if let Some(owner) = topology.slot_owner(slot) {
                    return Ok(self.pick_for_owner(&topology, owner, preference));
                }
                debug!("Slot {} is unmapped, using any master", slot);
            }
        }

        Ok(self.pick_any(&topology, preference))
    }

    /// Whether `server` owns the slot of `command` in cluster mode
    ///
    /// Always true outside cluster mode and for keyless commands.
    #[must_use]
    pub fn serves(&self, server: &ServerEndpoint, command: &Command) -> bool {
        let topology = self.topology.load();
        if topology.server_type != ServerType::Cluster {
            return true;
        }
        let Ok(Some(slot)) = command.hash_slot() else {
            return true;
        };
        match topology.slot_owner(slot) {
            Some(owner) => {
                owner.endpoint() == server.endpoint()
                    || topology
                        .replicas_of
                        .get(owner.endpoint())
                        .is_some_and(|r| r.iter().any(|s| s.endpoint() == server.endpoint()))
            }
            None => true,
        }
    }

    fn next_offset(&self) -> usize {
        self.replica_offset.fetch_add(1, Ordering::Relaxed)
    }

    fn rotate(&self, candidates: Vec<Arc<ServerEndpoint>>) -> Option<Arc<ServerEndpoint>> {
        if candidates.is_empty() {
            return None;
        }
        let index = self.next_offset() % candidates.len();
        candidates.into_iter().nth(index)
    }

    fn pick_for_owner(
        &self,
        topology: &Topology,
        owner: &Arc<ServerEndpoint>,
        preference: ReplicaPreference,
    ) -> Option<Arc<ServerEndpoint>> {
        let primary = topology.primary_for(owner);
        let master = Some(primary.clone()).filter(|s| s.is_selectable() && !s.is_replica());
        let replicas = || {
            let candidates = topology
                .replicas_of
                .get(primary.endpoint())
                .map(|replicas| {
                    replicas
                        .iter()
                        .filter(|s| s.is_selectable())
                        .cloned()
                        .collect()
                })
                .unwrap_or_default();
            self.rotate(candidates)
        };

        match preference {
            ReplicaPreference::DemandMaster => master,
            ReplicaPreference::PreferMaster => master.or_else(replicas),
            ReplicaPreference::PreferReplica => replicas().or(master),
            ReplicaPreference::DemandReplica => replicas(),
        }
    }

    fn pick_any(
        &self,
        topology: &Topology,
        preference: ReplicaPreference,
    ) -> Option<Arc<ServerEndpoint>> {
        let primaries = if topology.server_type == ServerType::Sentinel {
            &topology.sentinels
        } else {
            &topology.masters
        };
        let masters = || {
            let candidates: Vec<_> = primaries
                .iter()
                .filter(|s| s.is_selectable() && !s.is_replica())
                .cloned()
                .collect();
            if topology.server_type == ServerType::Cluster {
                self.rotate(candidates)
            } else {
                candidates.into_iter().next()
            }
        };
        let replicas = || {
            let candidates = topology
                .replicas
                .iter()
                .filter(|s| s.is_selectable() && s.is_replica())
                .cloned()
                .collect();
            self.rotate(candidates)
        };

        match preference {
            ReplicaPreference::DemandMaster => masters(),
            ReplicaPreference::PreferMaster => masters().or_else(replicas),
            ReplicaPreference::PreferReplica => replicas().or_else(masters),
            ReplicaPreference::DemandReplica => replicas(),
        }
    }

    /// Point slots `from..=to` at `server`
    pub fn update_cluster_range(&self, from: u16, to: u16, server: Arc<ServerEndpoint>) {
        self.topology.rcu(|current| {
            let mut next = Topology::clone(current);
            let mut slots: SlotTable = match &current.slots {
                Some(slots) => slots.as_ref().clone(),
                None => vec![None; CLUSTER_SLOTS as usize],
            };
            for slot in from..=to.min(CLUSTER_SLOTS - 1) {
                slots[slot as usize] = Some(server.clone());
            }
            if !next.masters.iter().any(|m| m.endpoint() == server.endpoint()) && !server.is_replica() {
                next.masters.push(server.clone());
            }
            next.slots = Some(Arc::new(slots));
            next.server_type = ServerType::Cluster;
            next
        });
    }

    /// Resend a redirected message to `server`
    ///
    /// `MOVED` updates the slot map permanently before resending; `ASK`
    /// resends once with an `ASKING` prefix and leaves the map alone. Returns
    /// false, with the message's sink failed, when `server` cannot take it.
    pub fn try_resend(
        &self,
        slot: u16,
        mut message: Message,
        server: &Arc<ServerEndpoint>,
        is_moved: bool,
    ) -> bool {
        if is_moved {
            info!("Slot {} moved to {}", slot, server.endpoint());
            self.update_cluster_range(slot, slot, server.clone());
            message.command.remove_flags(CommandFlags::ASKING);
        } else {
            debug!("Slot {} asks for {}", slot, server.endpoint());
            message.command.insert_flags(CommandFlags::ASKING);
        }

        if !server.is_connected() {
            message.fail(RedisError::NoConnectionAvailable(format!(
                "redirect target {} is not connected",
                server.endpoint()
            )));
            return false;
        }
        server.try_write(message) == WriteResult::Success
    }

    /// Number of slots with an owner
    #[must_use]
    pub fn count_covered_slots(&self) -> i64 {
        self.topology
            .load()
            .slots
            .as_ref()
            .map_or(0, |slots| slots.iter().filter(|s| s.is_some()).count() as i64)
    }

    /// Owner of a slot in the current snapshot
    #[must_use]
    pub fn server_for_slot(&self, slot: u16) -> Option<Arc<ServerEndpoint>> {
        self.topology.load().slot_owner(slot).cloned()
    }
}
