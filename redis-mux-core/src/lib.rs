//! Core types and traits for the redis-mux Redis client
//!
//! This crate provides the fundamental types, configuration and error
//! definitions shared by the multiplexer and its collaborators.

#![warn(missing_docs)]

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::{CommandMap, ConnectionConfig, ProtocolVersion};
pub use error::{ConnectionFailureKind, RedisError, RedisResult};
pub use types::{ClusterNode, EndPoint, ServerType, SlotRange};
pub use value::RespValue;
