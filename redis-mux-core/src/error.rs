//! Error types for Redis operations

use std::fmt;
use std::io;
use thiserror::Error;

/// Result type for Redis operations
pub type RedisResult<T> = Result<T, RedisError>;

/// Why a physical connection failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionFailureKind {
    /// AUTH or HELLO AUTH was rejected
    AuthenticationFailure,
    /// The peer sent something that is not valid RESP, or replied out of turn
    ProtocolFailure,
    /// Socket level failure: refused, reset, closed by peer
    SocketFailure,
    /// The server is still loading its dataset
    Loading,
    /// The connection was closed locally
    ConnectionDisposed,
    /// No physical connection could be established for the endpoint
    UnableToResolvePhysicalConnection,
    /// A bug or unexpected state inside the client
    InternalFailure,
}

impl fmt::Display for ConnectionFailureKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::AuthenticationFailure => "AuthenticationFailure",
            Self::ProtocolFailure => "ProtocolFailure",
            Self::SocketFailure => "SocketFailure",
            Self::Loading => "Loading",
            Self::ConnectionDisposed => "ConnectionDisposed",
            Self::UnableToResolvePhysicalConnection => "UnableToResolvePhysicalConnection",
            Self::InternalFailure => "InternalFailure",
        };
        f.write_str(name)
    }
}

/// Comprehensive error type for Redis operations
#[derive(Error, Debug)]
pub enum RedisError {
    /// IO error during network operations
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// Protocol parsing error
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Server returned an error
    #[error("Server error: {0}")]
    Server(String),

    /// MOVED redirect in cluster mode
    #[error("MOVED redirect: slot {slot} to {host}:{port}")]
    Moved {
        /// Slot number that was moved
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// ASK redirect in cluster mode
    #[error("ASK redirect: slot {slot} to {host}:{port}")]
    Ask {
        /// Slot number for temporary redirect
        slot: u16,
        /// Target host
        host: String,
        /// Target port
        port: u16,
    },

    /// No endpoint was reachable within the connect window
    #[error("Unable to connect: {0}")]
    UnableToConnect(String),

    /// A physical connection failed
    #[error("Connection failure ({kind}) on {endpoint}: {message}")]
    ConnectionFailure {
        /// Failure category
        kind: ConnectionFailureKind,
        /// Endpoint the connection belonged to
        endpoint: String,
        /// Human readable detail
        message: String,
    },

    /// A suitable endpoint exists but is not connected, or none exists
    #[error("No connection is available to service this operation: {0}")]
    NoConnectionAvailable(String),

    /// The command's deadline expired before it could be written
    #[error("Timeout before the command could be written: {0}")]
    TimeoutBeforeWrite(String),

    /// The command's deadline expired while waiting for the reply
    #[error("Operation timed out: {0}")]
    Timeout(String),

    /// The command's keys hash to more than one cluster slot
    #[error("Multi-key operations must involve a single slot; keys span slots {0:?}")]
    MultipleSlots(Vec<u16>),

    /// A write-class command was routed to a replica
    #[error("Command cannot be issued to a replica: {0}")]
    MasterOnly(String),

    /// The command targets a database the server does not have
    #[error("Database {database} is out of range (server has {available} databases)")]
    DatabaseOutOfRange {
        /// Requested database index
        database: u16,
        /// Number of databases the server has
        available: u32,
    },

    /// The command is an admin command and admin mode is disabled
    #[error("This operation is not available unless admin mode is enabled: {0}")]
    AdminModeRequired(String),

    /// The command is disabled by the command map
    #[error("This operation has been disabled in the command map: {0}")]
    CommandDisabled(String),

    /// Too many arguments for one multi-bulk request
    #[error("Too many arguments: {count} (maximum {max})")]
    TooManyArguments {
        /// Arguments supplied
        count: usize,
        /// Protocol limit
        max: usize,
    },

    /// Type conversion error
    #[error("Type conversion error: {0}")]
    Type(String),

    /// Invalid configuration
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Sentinel error
    #[error("Sentinel error: {0}")]
    Sentinel(String),

    /// Maximum redirect attempts exceeded
    #[error("Maximum redirect attempts ({0}) exceeded")]
    MaxRetriesExceeded(usize),

    /// Unexpected response from server
    #[error("Unexpected response: {0}")]
    UnexpectedResponse(String),

    /// The multiplexer has been closed
    #[error("The multiplexer has been closed")]
    Disposed,
}

impl RedisError {
    /// Parse a Redis error message to check for MOVED or ASK redirects
    #[must_use]
    pub fn parse_redirect(msg: &str) -> Option<Self> {
        let (is_moved, rest) = if let Some(rest) = msg.strip_prefix("MOVED ") {
            (true, rest)
        } else if let Some(rest) = msg.strip_prefix("ASK ") {
            (false, rest)
        } else {
            return None;
        };

        let mut parts = rest.split_whitespace();
        let slot = parts.next()?.parse::<u16>().ok()?;
        let (host, port) = parts.next()?.rsplit_once(':')?;
        let port = port.parse::<u16>().ok()?;
        if parts.next().is_some() {
            return None;
        }

        let host = host.to_string();
        Some(if is_moved {
            Self::Moved { slot, host, port }
        } else {
            Self::Ask { slot, host, port }
        })
    }

    /// Build a connection failure error
    pub fn connection(
        kind: ConnectionFailureKind,
        endpoint: impl fmt::Display,
        message: impl Into<String>,
    ) -> Self {
        Self::ConnectionFailure {
            kind,
            endpoint: endpoint.to_string(),
            message: message.into(),
        }
    }

    /// Check if this error is a redirect (MOVED or ASK)
    #[must_use]
    pub const fn is_redirect(&self) -> bool {
        matches!(self, Self::Moved { .. } | Self::Ask { .. })
    }

    /// Check if this error belongs to the connection class
    #[must_use]
    pub const fn is_connection_error(&self) -> bool {
        matches!(
            self,
            Self::Io(_)
                | Self::UnableToConnect(_)
                | Self::ConnectionFailure { .. }
                | Self::NoConnectionAvailable(_)
                | Self::TimeoutBeforeWrite(_)
        )
    }

    /// Check if this error is a timeout
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self, Self::Timeout(_) | Self::TimeoutBeforeWrite(_))
    }

    /// The connection failure category, if any
    #[must_use]
    pub const fn failure_kind(&self) -> Option<ConnectionFailureKind> {
        match self {
            Self::ConnectionFailure { kind, .. } => Some(*kind),
            _ => None,
        }
    }

    /// Get the target address from a redirect error
    #[must_use]
    pub fn redirect_target(&self) -> Option<(String, u16)> {
        match self {
            Self::Moved { host, port, .. } | Self::Ask { host, port, .. } => {
                Some((host.clone(), *port))
            }
            _ => None,
        }
    }

    /// Get the slot number from a redirect error
    #[must_use]
    pub const fn redirect_slot(&self) -> Option<u16> {
        match self {
            Self::Moved { slot, .. } | Self::Ask { slot, .. } => Some(*slot),
            _ => None,
        }
    }
}
