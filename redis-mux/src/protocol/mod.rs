//! Redis protocol implementations
//!
//! This module contains the RESP codec plus the helpers that interpret the
//! handshake replies (`HELLO`, `INFO`, `ROLE`) both protocol generations send.

pub mod resp;

pub use redis_mux_core::ProtocolVersion;
pub use resp::{FrameScan, RespDecoder, RespEncoder};

use redis_mux_core::{types::ServerType, value::RespValue};
use std::collections::HashMap;

/// Protocol negotiation result
#[derive(Debug, Clone)]
pub struct ProtocolNegotiation {
    /// The negotiated protocol version
    pub version: ProtocolVersion,
    /// `server` field of the HELLO reply
    pub server: Option<String>,
    /// `version` field of the HELLO reply
    pub server_version: Option<String>,
    /// `mode` field of the HELLO reply
    pub mode: Option<ServerType>,
    /// `role` field of the HELLO reply
    pub role: Option<String>,
}

impl ProtocolNegotiation {
    /// A negotiation that settled on a protocol without any server details
    #[must_use]
    pub const fn new(version: ProtocolVersion) -> Self {
        Self {
            version,
            server: None,
            server_version: None,
            mode: None,
            role: None,
        }
    }

    /// Interpret a HELLO reply
    ///
    /// RESP3 servers answer with a map; a server that only accepted `HELLO 2`
    /// answers with the same fields as a flat array.
    #[must_use]
    pub fn from_hello(reply: &RespValue) -> Self {
        let text = |name: &str| reply.field(name).and_then(|v| v.as_string().ok());
        let version = match reply.field("proto").and_then(|v| v.as_int().ok()) {
            Some(3) => ProtocolVersion::Resp3,
            _ => ProtocolVersion::Resp2,
        };

        Self {
            version,
            server: text("server"),
            server_version: text("version"),
            mode: text("mode").as_deref().and_then(ServerType::from_mode),
            role: text("role"),
        }
    }
}

/// Parse an `INFO` reply into `field -> value`
///
/// Section headers and blank lines are skipped.
#[must_use]
pub fn parse_info(text: &str) -> HashMap<String, String> {
    text.lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| line.split_once(':'))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

/// What a `ROLE` reply says about the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RoleReply {
    /// A master, with the addresses of its replicas
    Master {
        /// `(host, port)` of connected replicas
        replicas: Vec<(String, u16)>,
    },
    /// A replica of the given master
    Replica {
        /// Master host
        host: String,
        /// Master port
        port: u16,
    },
    /// A sentinel, with the monitored service names
    Sentinel {
        /// Monitored masters
        masters: Vec<String>,
    },
}

impl RoleReply {
    /// Parse a `ROLE` reply
    #[must_use]
    pub fn parse(reply: &RespValue) -> Option<Self> {
        let items = reply.as_array().ok()?;
        let kind = items.first()?.as_string().ok()?;
        match kind.as_str() {
            "master" => {
                let replicas = items
                    .get(2)
                    .and_then(|v| v.as_array().ok())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|entry| {
                        let fields = entry.as_array().ok()?;
                        let host = fields.first()?.as_string().ok()?;
                        let port = fields.get(1)?.as_int().ok()?;
                        Some((host, u16::try_from(port).ok()?))
                    })
                    .collect();
                Some(Self::Master { replicas })
            }
            "slave" | "replica" => {
                let host = items.get(1)?.as_string().ok()?;
                let port = u16::try_from(items.get(2)?.as_int().ok()?).ok()?;
                Some(Self::Replica { host, port })
            }
            "sentinel" => {
                let masters = items
                    .get(1)
                    .and_then(|v| v.as_array().ok())
                    .unwrap_or_default()
                    .iter()
                    .filter_map(|v| v.as_string().ok())
                    .collect();
                Some(Self::Sentinel { masters })
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn bulk(s: &str) -> RespValue {
        RespValue::BulkString(Bytes::from(s.to_string()))
    }

    #[test]
    fn test_hello_map_reply() {
        let reply = RespValue::Map(vec![
            (bulk("server"), bulk("redis")),
            (bulk("version"), bulk("7.2.4")),
            (bulk("proto"), RespValue::Integer(3)),
            (bulk("mode"), bulk("cluster")),
            (bulk("role"), bulk("master")),
        ]);
        let negotiation = ProtocolNegotiation::from_hello(&reply);
        assert_eq!(negotiation.version, ProtocolVersion::Resp3);
        assert_eq!(negotiation.server_version.as_deref(), Some("7.2.4"));
        assert_eq!(negotiation.mode, Some(ServerType::Cluster));
        assert_eq!(negotiation.role.as_deref(), Some("master"));
    }

    #[test]
    fn test_hello_flat_array_reply() {
        let reply = RespValue::Array(vec![
            bulk("server"),
            bulk("redis"),
            bulk("proto"),
            RespValue::Integer(2),
            bulk("mode"),
            bulk("standalone"),
        ]);
        let negotiation = ProtocolNegotiation::from_hello(&reply);
        assert_eq!(negotiation.version, ProtocolVersion::Resp2);
        assert_eq!(negotiation.mode, Some(ServerType::Standalone));
    }

    #[test]
    fn test_parse_info() {
        let info = parse_info("# Server\r\nredis_version:7.0.11\r\nredis_mode:standalone\r\n\r\n# Replication\r\nrole:slave\r\nmaster_host:10.0.0.1\r\n");
        assert_eq!(info.get("redis_version").map(String::as_str), Some("7.0.11"));
        assert_eq!(info.get("role").map(String::as_str), Some("slave"));
        assert_eq!(info.get("master_host").map(String::as_str), Some("10.0.0.1"));
        assert_eq!(info.len(), 4);
    }

    #[test]
    fn test_parse_role() {
        let master = RespValue::Array(vec![
            bulk("master"),
            RespValue::Integer(3129659),
            RespValue::Array(vec![RespValue::Array(vec![
                bulk("127.0.0.1"),
                bulk("9001"),
                bulk("3129242"),
            ])]),
        ]);
        assert_eq!(
            RoleReply::parse(&master),
            Some(RoleReply::Master {
                replicas: vec![("127.0.0.1".to_string(), 9001)]
            })
        );

        let replica = RespValue::Array(vec![
            bulk("slave"),
            bulk("127.0.0.1"),
            RespValue::Integer(9000),
            bulk("connected"),
            RespValue::Integer(3167038),
        ]);
        assert_eq!(
            RoleReply::parse(&replica),
            Some(RoleReply::Replica {
                host: "127.0.0.1".to_string(),
                port: 9000
            })
        );

        assert_eq!(RoleReply::parse(&RespValue::Integer(1)), None);
    }
}
