//! Common types used throughout the library

use crate::error::{RedisError, RedisResult};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use std::str::FromStr;

/// Default Redis port
pub const DEFAULT_PORT: u16 = 6379;

/// Default Sentinel port
pub const DEFAULT_SENTINEL_PORT: u16 = 26379;

/// Network address of one Redis node
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct EndPoint {
    /// Host name or IP literal
    pub host: String,
    /// TCP port
    pub port: u16,
}

impl EndPoint {
    /// Create a new endpoint
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `host:port`, defaulting the port when it is missing
    ///
    /// # Errors
    ///
    /// Returns an error if the host is empty or the port is not a number.
    pub fn parse_with_default(s: &str, default_port: u16) -> RedisResult<Self> {
        let s = s.trim();
        if s.is_empty() {
            return Err(RedisError::Config("Empty endpoint".to_string()));
        }

        // [v6]:port
        if let Some(rest) = s.strip_prefix('[') {
            let (host, tail) = rest
                .split_once(']')
                .ok_or_else(|| RedisError::Config(format!("Invalid endpoint: {s}")))?;
            let port = match tail.strip_prefix(':') {
                Some(p) => p
                    .parse::<u16>()
                    .map_err(|_| RedisError::Config(format!("Invalid port in endpoint: {s}")))?,
                None => default_port,
            };
            return Ok(Self::new(host, port));
        }

        // A bare IPv6 literal has several colons and no port
        if s.matches(':').count() > 1 {
            return Ok(Self::new(s, default_port));
        }

        match s.rsplit_once(':') {
            Some((host, port)) => {
                if host.is_empty() {
                    return Err(RedisError::Config(format!("Invalid endpoint: {s}")));
                }
                let port = port
                    .parse::<u16>()
                    .map_err(|_| RedisError::Config(format!("Invalid port in endpoint: {s}")))?;
                Ok(Self::new(host, port))
            }
            None => Ok(Self::new(s, default_port)),
        }
    }

    /// Whether the host is an IP literal rather than a DNS name
    #[must_use]
    pub fn is_ip(&self) -> bool {
        self.host.parse::<IpAddr>().is_ok()
    }

    /// The host with any domain suffix removed (`redis-1.prod.local` → `redis-1`)
    ///
    /// IP literals are returned unchanged.
    #[must_use]
    pub fn de_dotted_host(&self) -> &str {
        if self.is_ip() {
            return &self.host;
        }
        self.host.split('.').next().unwrap_or(&self.host)
    }

    /// Compare ignoring domain suffixes and host case
    #[must_use]
    pub fn matches_loosely(&self, other: &Self) -> bool {
        self.port == other.port
            && self
                .de_dotted_host()
                .eq_ignore_ascii_case(other.de_dotted_host())
    }
}

impl fmt::Display for EndPoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host.contains(':') {
            write!(f, "[{}]:{}", self.host, self.port)
        } else {
            write!(f, "{}:{}", self.host, self.port)
        }
    }
}

impl FromStr for EndPoint {
    type Err = RedisError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse_with_default(s, DEFAULT_PORT)
    }
}

/// What kind of server an endpoint turned out to be
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ServerType {
    /// A plain Redis server, master or replica
    Standalone,
    /// A node of a Redis Cluster
    Cluster,
    /// A Sentinel process
    Sentinel,
    /// A proxy such as twemproxy or envoy
    Proxy,
}

impl ServerType {
    /// Parse the `redis_mode` field of `INFO server` / HELLO
    #[must_use]
    pub fn from_mode(mode: &str) -> Option<Self> {
        match mode.trim().to_ascii_lowercase().as_str() {
            "standalone" => Some(Self::Standalone),
            "cluster" => Some(Self::Cluster),
            "sentinel" => Some(Self::Sentinel),
            "proxy" => Some(Self::Proxy),
            _ => None,
        }
    }
}

impl fmt::Display for ServerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Standalone => "standalone",
            Self::Cluster => "cluster",
            Self::Sentinel => "sentinel",
            Self::Proxy => "proxy",
        };
        f.write_str(name)
    }
}

/// Represents a slot range in a Redis cluster
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotRange {
    /// Start of the slot range (inclusive)
    pub start: u16,
    /// End of the slot range (inclusive)
    pub end: u16,
}

impl SlotRange {
    /// Create a new slot range
    #[must_use]
    pub const fn new(start: u16, end: u16) -> Self {
        Self { start, end }
    }

    /// Check if a slot is within this range
    #[must_use]
    pub const fn contains(&self, slot: u16) -> bool {
        slot >= self.start && slot <= self.end
    }

    /// Number of slots covered
    #[must_use]
    pub const fn len(&self) -> u32 {
        if self.end < self.start {
            return 0;
        }
        self.end as u32 - self.start as u32 + 1
    }

    /// Ranges are never empty; present for API symmetry with `len`
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        false
    }
}

/// One record of `CLUSTER NODES` output
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    /// Node ID (run id of the cluster node)
    pub id: String,
    /// Client-facing address
    pub endpoint: EndPoint,
    /// Raw flags (`myself`, `master`, `slave`, `fail`, ...)
    pub flags: Vec<String>,
    /// Primary node id for replicas
    pub parent_id: Option<String>,
    /// Slot ranges owned by this node
    pub slots: Vec<SlotRange>,
}

impl ClusterNode {
    /// Whether the node is a replica
    #[must_use]
    pub fn is_replica(&self) -> bool {
        self.has_flag("slave") || self.has_flag("replica")
    }

    /// Whether this record describes the node that produced the listing
    #[must_use]
    pub fn is_myself(&self) -> bool {
        self.has_flag("myself")
    }

    /// Whether the cluster considers the node failed or without address
    #[must_use]
    pub fn is_failed(&self) -> bool {
        self.has_flag("fail") || self.has_flag("noaddr") || self.has_flag("handshake")
    }

    /// Check if this node owns a given slot
    #[must_use]
    pub fn owns_slot(&self, slot: u16) -> bool {
        self.slots.iter().any(|range| range.contains(slot))
    }

    fn has_flag(&self, flag: &str) -> bool {
        self.flags.iter().any(|f| f == flag)
    }
}
