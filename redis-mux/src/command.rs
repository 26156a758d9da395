//! Command descriptors
//!
//! A [`Command`] carries everything routing and the bridge need: the command
//! code, target database, routing keys, arguments, flags and an optional
//! per-command timeout. The argument layout differs between command families,
//! so each family is a [`CommandShape`] variant with its own serializer.

use crate::cluster::calculate_slot;
use crate::protocol::RespEncoder;
use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use redis_mux_core::error::{RedisError, RedisResult};
use std::fmt;
use std::time::Duration;

/// Maximum number of arguments in one multi-bulk request
pub const MAX_MULTI_BULK_ARGS: usize = 1_048_576;

macro_rules! command_codes {
    ($($variant:ident => $name:literal),* $(,)?) => {
        /// Redis command codes known to the multiplexer
        #[derive(Debug, Clone, PartialEq, Eq, Hash)]
        pub enum CommandCode {
            $(
                #[allow(missing_docs)]
                $variant,
            )*
            /// Any other command, by upper-cased name
            Unknown(String),
        }

        impl CommandCode {
            /// The wire name of the command
            #[must_use]
            pub fn name(&self) -> &str {
                match self {
                    $(Self::$variant => $name,)*
                    Self::Unknown(name) => name,
                }
            }

            /// Look a command up by name, case-insensitively
            #[must_use]
            pub fn from_name(name: &str) -> Self {
                let upper = name.to_ascii_uppercase();
                match upper.as_str() {
                    $($name => Self::$variant,)*
                    _ => Self::Unknown(upper),
                }
            }
        }
    };
}

command_codes! {
    Append => "APPEND",
    Asking => "ASKING",
    Auth => "AUTH",
    Bgrewriteaof => "BGREWRITEAOF",
    Bgsave => "BGSAVE",
    Client => "CLIENT",
    Cluster => "CLUSTER",
    Config => "CONFIG",
    Dbsize => "DBSIZE",
    Debug => "DEBUG",
    Decr => "DECR",
    Del => "DEL",
    Discard => "DISCARD",
    Echo => "ECHO",
    Eval => "EVAL",
    Evalsha => "EVALSHA",
    Exec => "EXEC",
    Exists => "EXISTS",
    Expire => "EXPIRE",
    Flushall => "FLUSHALL",
    Flushdb => "FLUSHDB",
    Get => "GET",
    Getset => "GETSET",
    Hdel => "HDEL",
    Hello => "HELLO",
    Hget => "HGET",
    Hgetall => "HGETALL",
    Hset => "HSET",
    Incr => "INCR",
    Incrby => "INCRBY",
    Info => "INFO",
    Keys => "KEYS",
    Lpop => "LPOP",
    Lpush => "LPUSH",
    Lrange => "LRANGE",
    Mget => "MGET",
    Migrate => "MIGRATE",
    Monitor => "MONITOR",
    Mset => "MSET",
    Multi => "MULTI",
    Pexpire => "PEXPIRE",
    Ping => "PING",
    Psubscribe => "PSUBSCRIBE",
    Publish => "PUBLISH",
    Punsubscribe => "PUNSUBSCRIBE",
    Quit => "QUIT",
    Randomkey => "RANDOMKEY",
    Rename => "RENAME",
    Replicaof => "REPLICAOF",
    Role => "ROLE",
    Rpop => "RPOP",
    Rpush => "RPUSH",
    Sadd => "SADD",
    Save => "SAVE",
    Scan => "SCAN",
    Script => "SCRIPT",
    Select => "SELECT",
    Sentinel => "SENTINEL",
    Set => "SET",
    Setex => "SETEX",
    Setnx => "SETNX",
    Shutdown => "SHUTDOWN",
    Sinterstore => "SINTERSTORE",
    Slaveof => "SLAVEOF",
    Smembers => "SMEMBERS",
    Srem => "SREM",
    Subscribe => "SUBSCRIBE",
    Sunionstore => "SUNIONSTORE",
    Time => "TIME",
    Ttl => "TTL",
    Unlink => "UNLINK",
    Unsubscribe => "UNSUBSCRIBE",
    Watch => "WATCH",
    Zadd => "ZADD",
    Zinterstore => "ZINTERSTORE",
    Zrange => "ZRANGE",
    Zunionstore => "ZUNIONSTORE",
}

impl CommandCode {
    /// Commands that need admin mode
    #[must_use]
    pub fn is_admin(&self) -> bool {
        matches!(
            self,
            Self::Bgrewriteaof
                | Self::Bgsave
                | Self::Client
                | Self::Cluster
                | Self::Config
                | Self::Debug
                | Self::Flushall
                | Self::Flushdb
                | Self::Info
                | Self::Keys
                | Self::Monitor
                | Self::Replicaof
                | Self::Save
                | Self::Shutdown
                | Self::Slaveof
        )
    }

    /// Commands that modify data and so may only run on a master
    #[must_use]
    pub fn is_master_only(&self) -> bool {
        matches!(
            self,
            Self::Append
                | Self::Decr
                | Self::Del
                | Self::Eval
                | Self::Evalsha
                | Self::Expire
                | Self::Flushall
                | Self::Flushdb
                | Self::Getset
                | Self::Hdel
                | Self::Hset
                | Self::Incr
                | Self::Incrby
                | Self::Lpop
                | Self::Lpush
                | Self::Migrate
                | Self::Mset
                | Self::Pexpire
                | Self::Rename
                | Self::Rpop
                | Self::Rpush
                | Self::Sadd
                | Self::Set
                | Self::Setex
                | Self::Setnx
                | Self::Sinterstore
                | Self::Srem
                | Self::Sunionstore
                | Self::Unlink
                | Self::Zadd
                | Self::Zinterstore
                | Self::Zunionstore
        )
    }

    /// Commands that switch a connection into subscriber mode
    #[must_use]
    pub fn is_subscription(&self) -> bool {
        matches!(
            self,
            Self::Subscribe | Self::Psubscribe | Self::Unsubscribe | Self::Punsubscribe
        )
    }
}

impl fmt::Display for CommandCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

bitflags! {
    /// Behaviour flags of a command
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct CommandFlags: u16 {
        /// Do not wait for (or report) the reply
        const FIRE_AND_FORGET = 1 << 0;
        /// Prefer the master, fall back to a replica
        const PREFER_MASTER = 1 << 1;
        /// Only a master may serve the command
        const DEMAND_MASTER = 1 << 2;
        /// Prefer a replica, fall back to the master
        const PREFER_REPLICA = 1 << 3;
        /// Only a replica may serve the command
        const DEMAND_REPLICA = 1 << 4;
        /// Surface MOVED/ASK to the caller instead of following them
        const NO_REDIRECT = 1 << 5;
        /// Queue ahead of normal traffic
        const HIGH_PRIORITY = 1 << 6;
        /// Issued by the multiplexer itself; skips the admin-mode check
        const INTERNAL_CALL = 1 << 7;
        /// Do not consult or populate the script cache
        const NO_SCRIPT_CACHE = 1 << 8;
        /// Prefix the command with ASKING (set while following an ASK redirect)
        const ASKING = 1 << 9;
    }
}

/// Master/replica routing preference
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicaPreference {
    /// Master only
    DemandMaster,
    /// Master, or a replica when no master is available
    PreferMaster,
    /// Replica, or the master when no replica is available
    PreferReplica,
    /// Replica only
    DemandReplica,
}

impl ReplicaPreference {
    /// Whether the preference accepts a master
    #[must_use]
    pub const fn allows_master(self) -> bool {
        !matches!(self, Self::DemandReplica)
    }

    /// Whether the preference accepts a replica
    #[must_use]
    pub const fn allows_replica(self) -> bool {
        !matches!(self, Self::DemandMaster)
    }
}

/// Argument layout of a command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandShape {
    /// `NAME key... arg...`
    Standard {
        /// Routing keys, written first
        keys: Vec<Bytes>,
        /// Remaining arguments
        args: Vec<Bytes>,
    },
    /// `NAME destination numkeys key... arg...` (ZUNIONSTORE and friends)
    Numkeys {
        /// Destination key
        destination: Bytes,
        /// Source keys
        keys: Vec<Bytes>,
        /// Trailing arguments (WEIGHTS, AGGREGATE)
        args: Vec<Bytes>,
    },
    /// `EVAL|EVALSHA script numkeys key... arg...`
    Script {
        /// Script body or SHA1
        script: Bytes,
        /// Keys the script touches
        keys: Vec<Bytes>,
        /// Script arguments
        args: Vec<Bytes>,
    },
    /// `MIGRATE host port key db timeout [COPY] [REPLACE]`
    Migrate {
        /// Target host
        host: String,
        /// Target port
        port: u16,
        /// Key to move
        key: Bytes,
        /// Target database
        db: u16,
        /// Timeout in milliseconds
        timeout_ms: u64,
        /// Keep the source key
        copy: bool,
        /// Overwrite the target key
        replace: bool,
    },
    /// Arguments written verbatim; keys are routing hints only
    Raw {
        /// Routing hints, not written
        keys: Vec<Bytes>,
        /// Arguments as written
        args: Vec<Bytes>,
    },
}

impl CommandShape {
    fn keys(&self) -> Vec<&Bytes> {
        match self {
            Self::Standard { keys, .. } | Self::Script { keys, .. } | Self::Raw { keys, .. } => {
                keys.iter().collect()
            }
            Self::Numkeys {
                destination, keys, ..
            } => std::iter::once(destination).chain(keys.iter()).collect(),
            Self::Migrate { key, .. } => vec![key],
        }
    }

    fn arg_count(&self) -> usize {
        match self {
            Self::Standard { keys, args } => keys.len() + args.len(),
            Self::Numkeys { keys, args, .. } | Self::Script { keys, args, .. } => {
                2 + keys.len() + args.len()
            }
            Self::Migrate { copy, replace, .. } => {
                5 + usize::from(*copy) + usize::from(*replace)
            }
            Self::Raw { args, .. } => args.len(),
        }
    }

    fn write_args(&self, out: &mut Vec<Bytes>) {
        match self {
            Self::Standard { keys, args } => {
                out.extend(keys.iter().cloned());
                out.extend(args.iter().cloned());
            }
            Self::Numkeys {
                destination,
                keys,
                args,
            } => {
                out.push(destination.clone());
                out.push(Bytes::from(keys.len().to_string()));
                out.extend(keys.iter().cloned());
                out.extend(args.iter().cloned());
            }
            Self::Script { script, keys, args } => {
                out.push(script.clone());
                out.push(Bytes::from(keys.len().to_string()));
                out.extend(keys.iter().cloned());
                out.extend(args.iter().cloned());
            }
            Self::Migrate {
                host,
                port,
                key,
                db,
                timeout_ms,
                copy,
                replace,
            } => {
                out.push(Bytes::from(host.clone()));
                out.push(Bytes::from(port.to_string()));
                out.push(key.clone());
                out.push(Bytes::from(db.to_string()));
                out.push(Bytes::from(timeout_ms.to_string()));
                if *copy {
                    out.push(Bytes::from_static(b"COPY"));
                }
                if *replace {
                    out.push(Bytes::from_static(b"REPLACE"));
                }
            }
            Self::Raw { args, .. } => out.extend(args.iter().cloned()),
        }
    }
}

/// A command ready to be routed and written
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Command {
    code: CommandCode,
    db: Option<u16>,
    flags: CommandFlags,
    shape: CommandShape,
    timeout: Option<Duration>,
}

impl Command {
    /// A standard-shaped command without keys or arguments
    #[must_use]
    pub fn new(code: CommandCode) -> Self {
        Self::with_shape(
            code,
            CommandShape::Standard {
                keys: Vec::new(),
                args: Vec::new(),
            },
        )
    }

    /// A standard-shaped command by name
    #[must_use]
    pub fn cmd(name: &str) -> Self {
        Self::new(CommandCode::from_name(name))
    }

    /// A command with an explicit shape
    #[must_use]
    pub fn with_shape(code: CommandCode, shape: CommandShape) -> Self {
        Self {
            code,
            db: None,
            flags: CommandFlags::empty(),
            shape,
            timeout: None,
        }
    }

    /// `ZUNIONSTORE`-style command
    pub fn numkeys<K, A>(
        code: CommandCode,
        destination: impl Into<Bytes>,
        keys: impl IntoIterator<Item = K>,
        args: impl IntoIterator<Item = A>,
    ) -> Self
    where
        K: Into<Bytes>,
        A: Into<Bytes>,
    {
        Self::with_shape(
            code,
            CommandShape::Numkeys {
                destination: destination.into(),
                keys: keys.into_iter().map(Into::into).collect(),
                args: args.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// `EVAL` when `script` is a body, `EVALSHA` when it is a digest
    pub fn script<K, A>(
        code: CommandCode,
        script: impl Into<Bytes>,
        keys: impl IntoIterator<Item = K>,
        args: impl IntoIterator<Item = A>,
    ) -> Self
    where
        K: Into<Bytes>,
        A: Into<Bytes>,
    {
        Self::with_shape(
            code,
            CommandShape::Script {
                script: script.into(),
                keys: keys.into_iter().map(Into::into).collect(),
                args: args.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// `MIGRATE host port key db timeout [COPY] [REPLACE]`
    #[must_use]
    pub fn migrate(
        host: impl Into<String>,
        port: u16,
        key: impl Into<Bytes>,
        db: u16,
        timeout: Duration,
        copy: bool,
        replace: bool,
    ) -> Self {
        Self::with_shape(
            CommandCode::Migrate,
            CommandShape::Migrate {
                host: host.into(),
                port,
                key: key.into(),
                db,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                copy,
                replace,
            },
        )
    }

    /// A command whose arguments are written verbatim
    pub fn raw<A>(code: CommandCode, args: impl IntoIterator<Item = A>) -> Self
    where
        A: Into<Bytes>,
    {
        Self::with_shape(
            code,
            CommandShape::Raw {
                keys: Vec::new(),
                args: args.into_iter().map(Into::into).collect(),
            },
        )
    }

    /// Add a routing key
    ///
    /// Standard commands write keys before arguments; raw commands only use
    /// the key for routing.
    #[must_use]
    pub fn key(mut self, key: impl Into<Bytes>) -> Self {
        match &mut self.shape {
            CommandShape::Standard { keys, .. }
            | CommandShape::Numkeys { keys, .. }
            | CommandShape::Script { keys, .. }
            | CommandShape::Raw { keys, .. } => keys.push(key.into()),
            CommandShape::Migrate { .. } => {}
        }
        self
    }

    /// Add an argument
    #[must_use]
    pub fn arg(mut self, arg: impl Into<Bytes>) -> Self {
        match &mut self.shape {
            CommandShape::Standard { args, .. }
            | CommandShape::Numkeys { args, .. }
            | CommandShape::Script { args, .. }
            | CommandShape::Raw { args, .. } => args.push(arg.into()),
            CommandShape::Migrate { .. } => {}
        }
        self
    }

    /// Set the target database
    #[must_use]
    pub const fn with_db(mut self, db: u16) -> Self {
        self.db = Some(db);
        self
    }

    /// Add flags
    #[must_use]
    pub fn with_flags(mut self, flags: CommandFlags) -> Self {
        self.flags |= flags;
        self
    }

    /// Set a per-command timeout
    #[must_use]
    pub const fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub(crate) fn set_db(&mut self, db: Option<u16>) {
        self.db = db;
    }

    pub(crate) fn insert_flags(&mut self, flags: CommandFlags) {
        self.flags |= flags;
    }

    pub(crate) fn remove_flags(&mut self, flags: CommandFlags) {
        self.flags.remove(flags);
    }

    /// The command code
    #[must_use]
    pub const fn code(&self) -> &CommandCode {
        &self.code
    }

    /// The target database
    #[must_use]
    pub const fn db(&self) -> Option<u16> {
        self.db
    }

    /// The flags
    #[must_use]
    pub const fn flags(&self) -> CommandFlags {
        self.flags
    }

    /// The argument layout
    #[must_use]
    pub const fn shape(&self) -> &CommandShape {
        &self.shape
    }

    /// The per-command timeout
    #[must_use]
    pub const fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Routing keys
    #[must_use]
    pub fn keys(&self) -> Vec<&Bytes> {
        self.shape.keys()
    }

    /// Number of arguments after the command name
    #[must_use]
    pub fn arg_count(&self) -> usize {
        self.shape.arg_count()
    }

    /// Whether the caller is waiting for a reply
    #[must_use]
    pub fn is_fire_and_forget(&self) -> bool {
        self.flags.contains(CommandFlags::FIRE_AND_FORGET)
    }

    /// Effective routing preference
    ///
    /// Write commands always demand a master.
    #[must_use]
    pub fn preference(&self) -> ReplicaPreference {
        if self.code.is_master_only() || self.flags.contains(CommandFlags::DEMAND_MASTER) {
            ReplicaPreference::DemandMaster
        } else if self.flags.contains(CommandFlags::DEMAND_REPLICA) {
            ReplicaPreference::DemandReplica
        } else if self.flags.contains(CommandFlags::PREFER_REPLICA) {
            ReplicaPreference::PreferReplica
        } else {
            ReplicaPreference::PreferMaster
        }
    }

    /// Hash slot shared by every key, `None` for keyless commands
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::MultipleSlots`] when the keys span slots.
    pub fn hash_slot(&self) -> RedisResult<Option<u16>> {
        let mut slots: Vec<u16> = self.keys().iter().map(|k| calculate_slot(k)).collect();
        slots.sort_unstable();
        slots.dedup();
        match slots.len() {
            0 => Ok(None),
            1 => Ok(Some(slots[0])),
            _ => Err(RedisError::MultipleSlots(slots)),
        }
    }

    /// Check the argument count against the protocol limit
    ///
    /// # Errors
    ///
    /// Returns [`RedisError::TooManyArguments`] past [`MAX_MULTI_BULK_ARGS`].
    pub fn validate(&self) -> RedisResult<()> {
        let count = self.arg_count();
        if count > MAX_MULTI_BULK_ARGS {
            return Err(RedisError::TooManyArguments {
                count,
                max: MAX_MULTI_BULK_ARGS,
            });
        }
        Ok(())
    }

    /// Serialize the command as a RESP request
    pub fn write_to(&self, buf: &mut BytesMut) {
        let mut parts = Vec::with_capacity(1 + self.arg_count());
        parts.push(Bytes::from(self.code.name().to_string()));
        self.shape.write_args(&mut parts);
        RespEncoder::encode_request(parts, buf);
    }

    /// Short description for logs and error details
    #[must_use]
    pub fn describe(&self) -> String {
        match self.keys().first() {
            Some(key) => format!("{} {}", self.code, String::from_utf8_lossy(key)),
            None => self.code.to_string(),
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.describe())
    }
}
