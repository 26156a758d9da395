//! Async Redis connection multiplexer for Rust
//!
//! `redis-mux` shares a small number of connections between every caller and
//! routes each command to the right server. It discovers the shape of the
//! deployment on connect and whenever something changes: standalone masters
//! with replicas, Redis Cluster, or services monitored by Sentinel.
//!
//! # Features
//!
//! - Pipelined request/response correlation over one connection per server
//! - Cluster slot routing with transparent `MOVED`/`ASK` handling
//! - Master election by tie-breaker key when several servers claim the role
//! - Replica routing preferences and master-only write protection
//! - Sentinel master discovery and switch-over
//! - RESP2 and RESP3, negotiated with `HELLO`
//! - Async API with blocking wrappers
//!
//! # Quick Start
//!
//! ```no_run
//! use redis_mux::{Command, CommandCode, ConnectionConfig, Multiplexer};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config: ConnectionConfig = "localhost:6379".parse()?;
//!     let mux = Multiplexer::connect(config).await?;
//!
//!     let db = mux.database(None);
//!     db.set("mykey", "myvalue").await?;
//!     let value = db.get("mykey").await?;
//!     println!("Value: {:?}", value);
//!
//!     let reply = mux.execute(Command::new(CommandCode::Incr).key("hits")).await?;
//!     println!("Hits: {}", reply.as_int()?);
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_const_for_fn)]
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::future_not_send)]
#![allow(clippy::significant_drop_tightening)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_possible_wrap)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::cast_lossless)]
#![allow(clippy::return_self_not_must_use)]
#![allow(clippy::large_enum_variant)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::manual_let_else)]
#![allow(clippy::unused_async)]

pub mod bridge;
pub mod cluster;
pub mod command;
pub mod connection;
pub mod database;
pub mod election;
pub mod events;
pub mod features;
pub mod multiplexer;
pub mod protocol;
pub mod reconfigure;
pub mod selection;
pub mod sentinel;
pub mod server;

pub use bridge::{ConnectionType, WriteResult};
pub use command::{Command, CommandCode, CommandFlags, ReplicaPreference};
pub use connection::{AsyncStream, BoxedStream, Connector, TcpConnector};
pub use database::Database;
pub use events::MuxEvent;
pub use multiplexer::{MuxStatus, Multiplexer};
pub use reconfigure::ReconfigureOutcome;
pub use sentinel::{SentinelController, SentinelState};
pub use server::{ServerEndpoint, ServerStatus, UnselectableFlags};

pub use redis_mux_core::{
    ClusterNode, CommandMap, ConnectionConfig, ConnectionFailureKind, EndPoint, ProtocolVersion,
    RedisError, RedisResult, RespValue, ServerType, SlotRange,
};
