//! Configuration types for Redis connections

use crate::error::{RedisError, RedisResult};
use crate::types::{EndPoint, DEFAULT_PORT};
use std::collections::HashSet;
use std::str::FromStr;
use std::time::Duration;

/// Key whose value lets clients agree on the real master
pub const DEFAULT_TIE_BREAKER: &str = "__Booksleeve_TieBreak";

/// Channel used to broadcast "please reconfigure" between clients
pub const DEFAULT_CONFIGURATION_CHANNEL: &str = "__Booksleeve_MasterChanged";

/// Protocol version preference
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ProtocolVersion {
    /// RESP2 (Redis Serialization Protocol version 2) - Default
    #[default]
    Resp2,
    /// RESP3 (Redis Serialization Protocol version 3) - Redis 6.0+
    Resp3,
}

impl std::fmt::Display for ProtocolVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Resp2 => write!(f, "RESP2"),
            Self::Resp3 => write!(f, "RESP3"),
        }
    }
}

/// Which commands the deployment permits
///
/// Names are compared case-insensitively. Disabled commands are rejected
/// before they are written, and probes pick an alternative when their first
/// choice is unavailable.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandMap {
    disabled: HashSet<String>,
}

impl CommandMap {
    /// A map that disables the given commands
    pub fn with_disabled<I, S>(commands: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            disabled: commands
                .into_iter()
                .map(|c| c.as_ref().to_ascii_uppercase())
                .collect(),
        }
    }

    /// The command set exposed by Sentinel processes
    #[must_use]
    pub fn sentinel() -> Self {
        Self::with_disabled([
            "GET", "SET", "DEL", "EXISTS", "EXPIRE", "TTL", "INCR", "DECR", "INCRBY", "MGET",
            "MSET", "HGET", "HSET", "SELECT", "CLUSTER", "CONFIG", "ECHO", "TIME", "KEYS",
            "SCAN", "EVAL", "EVALSHA", "SCRIPT", "MULTI", "EXEC",
        ])
    }

    /// The command set exposed by twemproxy
    #[must_use]
    pub fn twemproxy() -> Self {
        Self::with_disabled([
            "INFO", "ROLE", "CLUSTER", "CONFIG", "CLIENT", "ECHO", "TIME", "SELECT", "SUBSCRIBE",
            "PSUBSCRIBE", "PUBLISH", "SENTINEL", "KEYS", "SCAN", "MULTI", "EXEC",
        ])
    }

    /// Disable one more command
    #[must_use]
    pub fn disable(mut self, command: &str) -> Self {
        self.disabled.insert(command.to_ascii_uppercase());
        self
    }

    /// Whether the command may be sent
    #[must_use]
    pub fn is_available(&self, command: &str) -> bool {
        !self.disabled.contains(&command.to_ascii_uppercase())
    }
}

/// Configuration for a multiplexer
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Seed endpoints
    pub endpoints: Vec<EndPoint>,

    /// Optional user for ACL authentication
    pub user: Option<String>,

    /// Optional password for authentication
    pub password: Option<String>,

    /// Name reported through CLIENT SETNAME / HELLO SETNAME
    pub client_name: Option<String>,

    /// Database used when a command does not specify one
    pub default_database: Option<u16>,

    /// Connection timeout, also the budget of one reconfiguration run
    pub connect_timeout: Duration,

    /// Timeout of blocking calls
    pub sync_timeout: Duration,

    /// Timeout of async calls
    pub async_timeout: Duration,

    /// Extra probe rounds on the first connect when nothing answered
    pub connect_retry: usize,

    /// Fail `connect` when no endpoint is reachable
    pub abort_on_connect_fail: bool,

    /// Permit admin commands (FLUSHALL, CONFIG, SHUTDOWN, ...)
    pub allow_admin: bool,

    /// Resolve host names before the first connect
    pub resolve_dns: bool,

    /// Tie-breaker key; empty disables tie-breaker voting
    pub tie_breaker: String,

    /// Pub/sub channel for reconfiguration broadcasts; empty disables it
    pub configuration_channel: String,

    /// Sentinel service name to monitor
    pub service_name: Option<String>,

    /// Permitted commands
    pub command_map: CommandMap,

    /// Preferred protocol version
    pub protocol_version: ProtocolVersion,

    /// How often the heartbeat runs
    pub heartbeat_interval: Duration,

    /// Idle time after which the heartbeat sends a keep-alive tracer
    pub keep_alive: Duration,

    /// Maximum number of MOVED/ASK hops per command
    pub max_redirects: usize,

    /// Include the command and endpoint in error messages
    pub include_detail_in_exceptions: bool,

    /// How long `close` waits for in-flight commands
    pub close_grace_period: Duration,

    /// Enable TCP keepalive
    pub tcp_keepalive: Option<Duration>,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            endpoints: Vec::new(),
            user: None,
            password: None,
            client_name: None,
            default_database: None,
            connect_timeout: Duration::from_secs(5),
            sync_timeout: Duration::from_secs(5),
            async_timeout: Duration::from_secs(5),
            connect_retry: 3,
            abort_on_connect_fail: true,
            allow_admin: false,
            resolve_dns: false,
            tie_breaker: DEFAULT_TIE_BREAKER.to_string(),
            configuration_channel: DEFAULT_CONFIGURATION_CHANNEL.to_string(),
            service_name: None,
            command_map: CommandMap::default(),
            protocol_version: ProtocolVersion::default(),
            heartbeat_interval: Duration::from_secs(1),
            keep_alive: Duration::from_secs(60),
            max_redirects: 5,
            include_detail_in_exceptions: true,
            close_grace_period: Duration::from_secs(5),
            tcp_keepalive: Some(Duration::from_secs(60)),
        }
    }
}

impl ConnectionConfig {
    /// Create a new configuration from a connection string
    ///
    /// # Errors
    ///
    /// Returns an error if the string cannot be parsed.
    pub fn new(connection_string: impl AsRef<str>) -> RedisResult<Self> {
        connection_string.as_ref().parse()
    }

    /// Create a configuration for explicit endpoints
    #[must_use]
    pub fn with_endpoints(endpoints: impl IntoIterator<Item = EndPoint>) -> Self {
        Self {
            endpoints: endpoints.into_iter().collect(),
            ..Default::default()
        }
    }

    /// Add one endpoint
    #[must_use]
    pub fn add_endpoint(mut self, endpoint: EndPoint) -> Self {
        if !self.endpoints.contains(&endpoint) {
            self.endpoints.push(endpoint);
        }
        self
    }

    /// Set the password for authentication
    #[must_use]
    pub fn with_password(mut self, password: impl Into<String>) -> Self {
        self.password = Some(password.into());
        self
    }

    /// Set the client name
    #[must_use]
    pub fn with_client_name(mut self, name: impl Into<String>) -> Self {
        self.client_name = Some(name.into());
        self
    }

    /// Set the default database
    #[must_use]
    pub const fn with_default_database(mut self, database: u16) -> Self {
        self.default_database = Some(database);
        self
    }

    /// Set the connection timeout
    #[must_use]
    pub const fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Set the timeout of blocking calls
    #[must_use]
    pub const fn with_sync_timeout(mut self, timeout: Duration) -> Self {
        self.sync_timeout = timeout;
        self
    }

    /// Set the timeout of async calls
    #[must_use]
    pub const fn with_async_timeout(mut self, timeout: Duration) -> Self {
        self.async_timeout = timeout;
        self
    }

    /// Set the number of connect retries
    #[must_use]
    pub const fn with_connect_retry(mut self, retries: usize) -> Self {
        self.connect_retry = retries;
        self
    }

    /// Fail (or not) the connect call when nothing is reachable
    #[must_use]
    pub const fn with_abort_on_connect_fail(mut self, abort: bool) -> Self {
        self.abort_on_connect_fail = abort;
        self
    }

    /// Enable or disable admin commands
    #[must_use]
    pub const fn with_allow_admin(mut self, allow: bool) -> Self {
        self.allow_admin = allow;
        self
    }

    /// Resolve DNS names before the first connect
    #[must_use]
    pub const fn with_resolve_dns(mut self, resolve: bool) -> Self {
        self.resolve_dns = resolve;
        self
    }

    /// Set the tie-breaker key (empty disables voting)
    #[must_use]
    pub fn with_tie_breaker(mut self, key: impl Into<String>) -> Self {
        self.tie_breaker = key.into();
        self
    }

    /// Set the configuration broadcast channel (empty disables it)
    #[must_use]
    pub fn with_configuration_channel(mut self, channel: impl Into<String>) -> Self {
        self.configuration_channel = channel.into();
        self
    }

    /// Set the sentinel service name
    #[must_use]
    pub fn with_service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Set the command map
    #[must_use]
    pub fn with_command_map(mut self, map: CommandMap) -> Self {
        self.command_map = map;
        self
    }

    /// Set the preferred protocol version
    #[must_use]
    pub const fn with_protocol_version(mut self, version: ProtocolVersion) -> Self {
        self.protocol_version = version;
        self
    }

    /// Set the heartbeat interval
    #[must_use]
    pub const fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval;
        self
    }

    /// Set the idle keep-alive threshold
    #[must_use]
    pub const fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the maximum number of redirects
    #[must_use]
    pub const fn with_max_redirects(mut self, max: usize) -> Self {
        self.max_redirects = max;
        self
    }

    /// Set the close grace period
    #[must_use]
    pub const fn with_close_grace_period(mut self, grace: Duration) -> Self {
        self.close_grace_period = grace;
        self
    }

    /// Whether tie-breaker voting is enabled
    #[must_use]
    pub fn has_tie_breaker(&self) -> bool {
        !self.tie_breaker.is_empty()
    }

    /// Default port for endpoints without one
    #[must_use]
    pub fn default_port(&self) -> u16 {
        if self.service_name.is_some() {
            crate::types::DEFAULT_SENTINEL_PORT
        } else {
            DEFAULT_PORT
        }
    }

    fn apply_option(&mut self, key: &str, value: &str) -> RedisResult<()> {
        fn millis(key: &str, value: &str) -> RedisResult<Duration> {
            value
                .parse::<u64>()
                .map(Duration::from_millis)
                .map_err(|_| RedisError::Config(format!("Invalid value for {key}: {value}")))
        }
        fn flag(key: &str, value: &str) -> RedisResult<bool> {
            value
                .parse::<bool>()
                .map_err(|_| RedisError::Config(format!("Invalid value for {key}: {value}")))
        }
        fn number<T: FromStr>(key: &str, value: &str) -> RedisResult<T> {
            value
                .parse::<T>()
                .map_err(|_| RedisError::Config(format!("Invalid value for {key}: {value}")))
        }

        match key.to_ascii_lowercase().as_str() {
            "abortconnect" => self.abort_on_connect_fail = flag(key, value)?,
            "allowadmin" => self.allow_admin = flag(key, value)?,
            "connecttimeout" => self.connect_timeout = millis(key, value)?,
            "synctimeout" => self.sync_timeout = millis(key, value)?,
            "asynctimeout" => self.async_timeout = millis(key, value)?,
            "connectretry" => self.connect_retry = number(key, value)?,
            "resolvedns" => self.resolve_dns = flag(key, value)?,
            "tiebreaker" => self.tie_breaker = value.to_string(),
            "configchannel" => self.configuration_channel = value.to_string(),
            "servicename" => self.service_name = Some(value.to_string()),
            "user" => self.user = Some(value.to_string()),
            "password" => self.password = Some(value.to_string()),
            "name" => self.client_name = Some(value.to_string()),
            "defaultdatabase" => self.default_database = Some(number(key, value)?),
            "keepalive" => {
                self.keep_alive = Duration::from_secs(number(key, value)?);
            }
            "maxredirects" => self.max_redirects = number(key, value)?,
            "protocol" => {
                self.protocol_version = match value.to_ascii_lowercase().as_str() {
                    "resp2" | "2" => ProtocolVersion::Resp2,
                    "resp3" | "3" => ProtocolVersion::Resp3,
                    _ => {
                        return Err(RedisError::Config(format!(
                            "Invalid value for protocol: {value}"
                        )))
                    }
                }
            }
            "$disabled" | "disabledcommands" => {
                self.command_map = CommandMap::with_disabled(value.split('|'));
            }
            _ => {
                return Err(RedisError::Config(format!("Unknown option: {key}")));
            }
        }
        Ok(())
    }
}

impl FromStr for ConnectionConfig {
    type Err = RedisError;

    /// Parse either `redis://host1:6379,host2:6379` or the option form
    /// `host1:6379,host2,abortConnect=false,connectTimeout=2000`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        let body = s
            .strip_prefix("redis://")
            .or_else(|| s.strip_prefix("rediss://"))
            .unwrap_or(s);

        let mut config = Self::default();
        let mut hosts = Vec::new();
        for token in body.split(',') {
            let token = token.trim();
            if token.is_empty() {
                continue;
            }
            match token.split_once('=') {
                Some((key, value)) => config.apply_option(key.trim(), value.trim())?,
                None => hosts.push(token.to_string()),
            }
        }

        let default_port = config.default_port();
        for host in hosts {
            let endpoint = EndPoint::parse_with_default(&host, default_port)?;
            if !config.endpoints.contains(&endpoint) {
                config.endpoints.push(endpoint);
            }
        }

        Ok(config)
    }
}
