//! Redis Cluster support
//!
//! This module provides functionality for Redis Cluster operations including:
//! - Slot calculation using CRC16
//! - `CLUSTER NODES` parsing
//! - Slot ownership lookups over a parsed node listing

use crc16::*;
use redis_mux_core::{
    error::{RedisError, RedisResult},
    types::{ClusterNode, EndPoint, SlotRange},
};
use tracing::debug;

/// Total number of hash slots in Redis Cluster
pub const CLUSTER_SLOTS: u16 = 16384;

/// Calculate the hash slot for a given key
///
/// This implements the Redis Cluster key hashing algorithm:
/// - If the key contains {...}, only the part between the first { and first } is hashed
/// - Otherwise, the entire key is hashed
/// - The hash is CRC16 mod 16384
pub fn calculate_slot(key: &[u8]) -> u16 {
    let hash_key = extract_hash_tag(key);
    State::<XMODEM>::calculate(hash_key) % CLUSTER_SLOTS
}

/// Extract the hash tag from a key
///
/// Hash tags allow you to ensure multiple keys are allocated to the same hash slot.
/// For example: `{user1000}.following` and `{user1000}.followers` will hash to the same slot.
fn extract_hash_tag(key: &[u8]) -> &[u8] {
    if let Some(start) = key.iter().position(|&b| b == b'{') {
        if let Some(end) = key[start + 1..].iter().position(|&b| b == b'}') {
            let end = start + 1 + end;
            // Empty tags hash the whole key
            if end > start + 1 {
                return &key[start + 1..end];
            }
        }
    }
    key
}

/// A parsed `CLUSTER NODES` listing
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClusterConfiguration {
    nodes: Vec<ClusterNode>,
}

impl ClusterConfiguration {
    /// Parse `CLUSTER NODES` output
    ///
    /// `origin` is the endpoint that produced the listing; it stands in for the
    /// `myself` record when the server does not know its own address yet.
    ///
    /// # Errors
    ///
    /// Returns an error when a line is malformed.
    pub fn parse(text: &str, origin: &EndPoint) -> RedisResult<Self> {
        let mut nodes = Vec::new();
        for line in text.lines().map(str::trim).filter(|l| !l.is_empty()) {
            nodes.push(parse_node_line(line, origin)?);
        }
        debug!("Parsed {} cluster nodes from {}", nodes.len(), origin);
        Ok(Self { nodes })
    }

    /// All nodes in listing order
    #[must_use]
    pub fn nodes(&self) -> &[ClusterNode] {
        &self.nodes
    }

    /// Nodes that are neither failed nor without an address
    pub fn healthy_nodes(&self) -> impl Iterator<Item = &ClusterNode> {
        self.nodes.iter().filter(|n| !n.is_failed())
    }

    /// Look a node up by id
    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ClusterNode> {
        self.nodes.iter().find(|n| n.id == id)
    }

    /// The node serving a slot
    #[must_use]
    pub fn owner_of(&self, slot: u16) -> Option<&ClusterNode> {
        self.nodes
            .iter()
            .find(|n| !n.is_replica() && n.owns_slot(slot))
    }

    /// Replicas attached to a primary
    pub fn replicas_of<'a>(&'a self, primary_id: &'a str) -> impl Iterator<Item = &'a ClusterNode> {
        self.nodes
            .iter()
            .filter(move |n| n.parent_id.as_deref() == Some(primary_id))
    }

    /// Number of slots with an owner
    #[must_use]
    pub fn covered_slots(&self) -> u32 {
        self.nodes
            .iter()
            .filter(|n| !n.is_replica())
            .flat_map(|n| n.slots.iter())
            .map(SlotRange::len)
            .sum()
    }
}

fn parse_node_line(line: &str, origin: &EndPoint) -> RedisResult<ClusterNode> {
    let fields: Vec<&str> = line.split_whitespace().collect();
    if fields.len() < 8 {
        return Err(RedisError::Protocol(format!(
            "Malformed CLUSTER NODES line: {line}"
        )));
    }

    let flags: Vec<String> = fields[2].split(',').map(str::to_string).collect();
    let myself = flags.iter().any(|f| f == "myself");
    let endpoint = match parse_node_address(fields[1])? {
        Some(endpoint) => endpoint,
        None if myself => origin.clone(),
        None => EndPoint::new("", 0),
    };

    let parent_id = match fields[3] {
        "-" | "" => None,
        id => Some(id.to_string()),
    };

    let mut slots = Vec::new();
    for token in &fields[8..] {
        // [slot->-node] and [slot-<-node] describe migrations, not ownership
        if token.starts_with('[') {
            continue;
        }
        let range = match token.split_once('-') {
            Some((start, end)) => {
                let (start, end) = (parse_slot(start)?, parse_slot(end)?);
                if start > end {
                    return Err(RedisError::Protocol(format!(
                        "Reversed slot range {token} in CLUSTER NODES"
                    )));
                }
                SlotRange::new(start, end)
            }
            None => {
                let slot = parse_slot(token)?;
                SlotRange::new(slot, slot)
            }
        };
        slots.push(range);
    }

    Ok(ClusterNode {
        id: fields[0].to_string(),
        endpoint,
        flags,
        parent_id,
        slots,
    })
}

/// `ip:port@cport[,hostname]`; an empty ip means the address is unknown
fn parse_node_address(field: &str) -> RedisResult<Option<EndPoint>> {
    let (address, hostname) = match field.split_once(',') {
        Some((address, hostname)) => (address, Some(hostname)),
        None => (field, None),
    };
    let address = address.split('@').next().unwrap_or(address);
    let (host, port) = address
        .rsplit_once(':')
        .ok_or_else(|| RedisError::Protocol(format!("Malformed node address: {field}")))?;
    let port = port
        .parse::<u16>()
        .map_err(|_| RedisError::Protocol(format!("Malformed node address: {field}")))?;

    let host = match (host, hostname) {
        ("", Some(name)) if !name.is_empty() => name,
        ("", _) => return Ok(None),
        (host, _) => host,
    };
    let host = host.trim_start_matches('[').trim_end_matches(']');
    Ok(Some(EndPoint::new(host, port)))
}

fn parse_slot(token: &str) -> RedisResult<u16> {
    token
        .parse::<u16>()
        .ok()
        .filter(|slot| *slot < CLUSTER_SLOTS)
        .ok_or_else(|| RedisError::Protocol(format!("Invalid slot: {token}")))
}
