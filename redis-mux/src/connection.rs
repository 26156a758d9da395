//! Transport and connection handshake
//!
//! Socket setup goes through the [`Connector`] trait so the multiplexer can be
//! driven over any byte stream. [`RedisConnection`] is the request/response
//! wrapper used while a connection is being set up; once the handshake is done
//! it is split into its parts and handed to a bridge.

use crate::command::{Command, CommandCode};
use crate::protocol::{ProtocolNegotiation, ProtocolVersion, RespDecoder};
use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use redis_mux_core::{
    config::ConnectionConfig,
    error::{ConnectionFailureKind, RedisError, RedisResult},
    types::EndPoint,
    value::RespValue,
};
use std::io::Cursor;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, warn};

/// A bidirectional byte stream
pub trait AsyncStream: AsyncRead + AsyncWrite + Send + Unpin {}

impl<T> AsyncStream for T where T: AsyncRead + AsyncWrite + Send + Unpin {}

/// Boxed stream handed out by connectors
pub type BoxedStream = Box<dyn AsyncStream>;

/// Opens byte streams to endpoints
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Open a stream to `endpoint`
    async fn connect(
        &self,
        endpoint: &EndPoint,
        config: &ConnectionConfig,
    ) -> RedisResult<BoxedStream>;
}

/// Plain TCP connector
#[derive(Debug, Clone, Copy, Default)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(
        &self,
        endpoint: &EndPoint,
        config: &ConnectionConfig,
    ) -> RedisResult<BoxedStream> {
        let addr = (endpoint.host.as_str(), endpoint.port);
        debug!("Connecting to Redis at {}", endpoint);

        let stream = timeout(config.connect_timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| RedisError::Timeout(format!("connect to {}", endpoint)))?
            .map_err(|e| {
                RedisError::connection(
                    ConnectionFailureKind::UnableToResolvePhysicalConnection,
                    endpoint,
                    e.to_string(),
                )
            })?;
        stream.set_nodelay(true)?;

        let Some(keepalive_duration) = config.tcp_keepalive else {
            return Ok(Box::new(stream));
        };

        let socket = socket2::Socket::from(stream.into_std()?);
        let keepalive = socket2::TcpKeepalive::new().with_time(keepalive_duration);
        socket.set_tcp_keepalive(&keepalive).map_err(|e| {
            RedisError::connection(
                ConnectionFailureKind::SocketFailure,
                endpoint,
                format!("Failed to set TCP keepalive: {}", e),
            )
        })?;
        let stream = TcpStream::from_std(socket.into())?;
        Ok(Box::new(stream))
    }
}

/// Outcome of a successful handshake
#[derive(Debug, Clone)]
pub struct Handshake {
    /// Protocol spoken on the connection
    pub protocol: ProtocolVersion,
    /// Details from HELLO, when it was used
    pub negotiation: Option<ProtocolNegotiation>,
}

/// A connection to a Redis server in request/response mode
pub struct RedisConnection {
    stream: BoxedStream,
    read_buffer: BytesMut,
    endpoint: EndPoint,
}

impl RedisConnection {
    /// Wrap an already open stream
    #[must_use]
    pub fn new(stream: BoxedStream, endpoint: EndPoint) -> Self {
        Self {
            stream,
            read_buffer: BytesMut::with_capacity(8192),
            endpoint,
        }
    }

    /// Open a stream through `connector` and run the handshake
    ///
    /// # Errors
    ///
    /// Returns a connection failure when the socket cannot be opened or the
    /// server rejects authentication.
    pub async fn open(
        connector: &dyn Connector,
        endpoint: &EndPoint,
        config: &ConnectionConfig,
    ) -> RedisResult<(Self, Handshake)> {
        let stream = connector.connect(endpoint, config).await?;
        let mut conn = Self::new(stream, endpoint.clone());
        let handshake = conn.handshake(config).await?;
        Ok((conn, handshake))
    }

    async fn handshake(&mut self, config: &ConnectionConfig) -> RedisResult<Handshake> {
        if config.protocol_version == ProtocolVersion::Resp3
            && config.command_map.is_available("HELLO")
        {
            let mut hello = Command::new(CommandCode::Hello).arg("3");
            if let Some(password) = &config.password {
                let user = config.user.as_deref().unwrap_or("default");
                hello = hello
                    .arg("AUTH")
                    .arg(Bytes::from(user.to_string()))
                    .arg(Bytes::from(password.clone()));
            }
            if let Some(name) = &config.client_name {
                hello = hello.arg("SETNAME").arg(Bytes::from(name.clone()));
            }

            match self.execute(&hello).await? {
                RespValue::Error(msg) if is_auth_error(&msg) => {
                    return Err(RedisError::connection(
                        ConnectionFailureKind::AuthenticationFailure,
                        &self.endpoint,
                        msg,
                    ));
                }
                RespValue::Error(msg) => {
                    debug!(
                        "HELLO rejected by {} ({}), falling back to RESP2",
                        self.endpoint, msg
                    );
                }
                reply => {
                    let negotiation = ProtocolNegotiation::from_hello(&reply);
                    debug!("Negotiated {} with {}", negotiation.version, self.endpoint);
                    return Ok(Handshake {
                        protocol: negotiation.version,
                        negotiation: Some(negotiation),
                    });
                }
            }
        }

        if let Some(password) = &config.password {
            self.authenticate(config.user.as_deref(), password).await?;
        }

        if let Some(name) = &config.client_name {
            if config.command_map.is_available("CLIENT") {
                let setname = Command::new(CommandCode::Client)
                    .arg("SETNAME")
                    .arg(Bytes::from(name.clone()));
                if let RespValue::Error(msg) = self.execute(&setname).await? {
                    warn!("CLIENT SETNAME failed on {}: {}", self.endpoint, msg);
                }
            }
        }

        Ok(Handshake {
            protocol: ProtocolVersion::Resp2,
            negotiation: None,
        })
    }

    async fn authenticate(&mut self, user: Option<&str>, password: &str) -> RedisResult<()> {
        debug!("Authenticating with {}", self.endpoint);
        let mut auth = Command::new(CommandCode::Auth);
        if let Some(user) = user {
            auth = auth.arg(Bytes::from(user.to_string()));
        }
        auth = auth.arg(Bytes::from(password.to_string()));

        match self.execute(&auth).await? {
            RespValue::SimpleString(ref s) if s == "OK" => Ok(()),
            RespValue::Error(e) => Err(RedisError::connection(
                ConnectionFailureKind::AuthenticationFailure,
                &self.endpoint,
                e,
            )),
            other => Err(RedisError::connection(
                ConnectionFailureKind::AuthenticationFailure,
                &self.endpoint,
                format!("Unexpected authentication response: {:?}", other),
            )),
        }
    }

    /// Write a command and read its reply
    ///
    /// Server errors come back as `Ok(RespValue::Error(..))`; only transport
    /// and protocol failures are `Err`.
    ///
    /// # Errors
    ///
    /// Returns an error if the socket fails or the reply cannot be decoded.
    pub async fn execute(&mut self, command: &Command) -> RedisResult<RespValue> {
        let mut buf = BytesMut::new();
        command.write_to(&mut buf);
        self.stream
            .write_all(&buf)
            .await
            .map_err(|e| socket_failure(&self.endpoint, e))?;
        self.stream.flush().await.map_err(|e| socket_failure(&self.endpoint, e))?;
        self.read_response().await
    }

    /// Read a complete RESP response from the connection
    async fn read_response(&mut self) -> RedisResult<RespValue> {
        loop {
            let mut cursor = Cursor::new(&self.read_buffer[..]);
            if let Some(value) = RespDecoder::decode(&mut cursor)? {
                let pos = cursor.position() as usize;
                self.read_buffer.advance(pos);
                return Ok(value);
            }

            let n = self
                .stream
                .read_buf(&mut self.read_buffer)
                .await
                .map_err(|e| socket_failure(&self.endpoint, e))?;
            if n == 0 {
                return Err(RedisError::connection(
                    ConnectionFailureKind::SocketFailure,
                    &self.endpoint,
                    "Connection closed by server",
                ));
            }
        }
    }

    /// The endpoint this connection talks to
    #[must_use]
    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    /// Split into the stream and any bytes already read past the last reply
    #[must_use]
    pub fn into_parts(self) -> (BoxedStream, BytesMut) {
        (self.stream, self.read_buffer)
    }
}

fn socket_failure(endpoint: &EndPoint, e: std::io::Error) -> RedisError {
    RedisError::connection(ConnectionFailureKind::SocketFailure, endpoint, e.to_string())
}

fn is_auth_error(msg: &str) -> bool {
    msg.starts_with("WRONGPASS")
        || msg.starts_with("NOAUTH")
        || msg.contains("invalid password")
        || msg.contains("invalid username-password")
}
