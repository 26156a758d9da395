//! In-memory Redis servers for integration tests
//!
//! A [`MockNetwork`] implements [`Connector`] over `tokio::io::duplex`
//! streams, so tests can stand up masters, replicas, cluster nodes and
//! sentinels, take them down, make them hang, and inject redirects without
//! touching a real socket.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use redis_mux::cluster::calculate_slot;
use redis_mux::protocol::{RespDecoder, RespEncoder};
use redis_mux::{
    BoxedStream, ConnectionConfig, ConnectionFailureKind, Connector, EndPoint, RedisError,
    RedisResult, RespValue,
};
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream};
use tokio::sync::{mpsc, watch};

pub const HOST: &str = "127.0.0.1";

pub fn ep(port: u16) -> EndPoint {
    EndPoint::new(HOST, port)
}

/// A configuration with short timeouts and no connect retries
pub fn test_config(endpoints: &[EndPoint]) -> ConnectionConfig {
    ConnectionConfig::with_endpoints(endpoints.iter().cloned())
        .with_connect_timeout(Duration::from_millis(500))
        .with_sync_timeout(Duration::from_secs(1))
        .with_async_timeout(Duration::from_secs(1))
        .with_connect_retry(0)
}

/// Poll `check` until it holds, failing the test after five seconds
pub async fn eventually<F>(what: &str, check: F)
where
    F: Fn() -> bool,
{
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !check() {
        assert!(
            tokio::time::Instant::now() < deadline,
            "timed out waiting for {what}"
        );
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// What a mock server claims to be
#[derive(Debug, Clone)]
pub enum Role {
    Master,
    Replica(EndPoint),
    Sentinel,
}

/// A redirect returned for one key
#[derive(Debug, Clone)]
pub enum Redirect {
    Moved(EndPoint),
    Ask(EndPoint),
}

struct ServerState {
    role: Role,
    mode: Option<String>,
    cluster_nodes: Option<String>,
    down: bool,
    hang: bool,
    databases: u32,
    data: HashMap<(u16, Bytes), Bytes>,
    redirects: HashMap<Bytes, Redirect>,
    services: HashMap<String, (EndPoint, Vec<EndPoint>)>,
    log: Vec<Vec<String>>,
    accepted: usize,
}

struct Subscriber {
    channels: Vec<String>,
    tx: mpsc::UnboundedSender<Bytes>,
}

/// One fake Redis process
pub struct MockServer {
    endpoint: EndPoint,
    state: Mutex<ServerState>,
    subscribers: Mutex<Vec<Subscriber>>,
    shutdown: watch::Sender<u64>,
}

struct Session {
    db: u16,
    tx: mpsc::UnboundedSender<Bytes>,
}

impl Session {
    fn send(&self, value: &RespValue) {
        let mut buf = BytesMut::new();
        RespEncoder::encode(value, &mut buf);
        let _ = self.tx.send(buf.freeze());
    }
}

fn bulk(text: impl Into<String>) -> RespValue {
    RespValue::BulkString(Bytes::from(text.into()))
}

fn ok() -> RespValue {
    RespValue::SimpleString("OK".to_string())
}

fn error(text: impl Into<String>) -> RespValue {
    RespValue::Error(text.into())
}

impl MockServer {
    fn new(endpoint: EndPoint, role: Role) -> Self {
        let (shutdown, _) = watch::channel(0);
        Self {
            endpoint,
            state: Mutex::new(ServerState {
                role,
                mode: None,
                cluster_nodes: None,
                down: false,
                hang: false,
                databases: 16,
                data: HashMap::new(),
                redirects: HashMap::new(),
                services: HashMap::new(),
                log: Vec::new(),
                accepted: 0,
            }),
            subscribers: Mutex::new(Vec::new()),
            shutdown,
        }
    }

    pub fn endpoint(&self) -> &EndPoint {
        &self.endpoint
    }

    pub fn set_role(&self, role: Role) {
        self.state.lock().role = role;
    }

    /// Report `mode` as `redis_mode` in INFO instead of the role's mode
    pub fn set_mode(&self, mode: &str) {
        self.state.lock().mode = Some(mode.to_string());
    }

    /// Serve `CLUSTER NODES` with `text` and report cluster mode in INFO
    pub fn set_cluster_nodes(&self, text: impl Into<String>) {
        self.state.lock().cluster_nodes = Some(text.into());
    }

    /// Refuse new connections and drop the open ones
    pub fn set_down(&self, down: bool) {
        self.state.lock().down = down;
        if down {
            self.drop_connections();
        }
    }

    /// Read requests but never answer them
    pub fn set_hang(&self, hang: bool) {
        self.state.lock().hang = hang;
    }

    pub fn drop_connections(&self) {
        self.subscribers.lock().clear();
        self.shutdown.send_modify(|generation| *generation += 1);
    }

    pub fn redirect(&self, key: &str, redirect: Redirect) {
        self.state
            .lock()
            .redirects
            .insert(Bytes::from(key.to_string()), redirect);
    }

    pub fn clear_redirects(&self) {
        self.state.lock().redirects.clear();
    }

    pub fn insert(&self, key: &str, value: &str) {
        self.state.lock().data.insert(
            (0, Bytes::from(key.to_string())),
            Bytes::from(value.to_string()),
        );
    }

    pub fn value(&self, db: u16, key: &str) -> Option<String> {
        self.state
            .lock()
            .data
            .get(&(db, Bytes::from(key.to_string())))
            .map(|v| String::from_utf8_lossy(v).into_owned())
    }

    /// Make this sentinel report `master` and `replicas` for `service`
    pub fn monitor(&self, service: &str, master: EndPoint, replicas: Vec<EndPoint>) {
        self.state
            .lock()
            .services
            .insert(service.to_string(), (master, replicas));
    }

    /// Every request received so far, upper-cased command name first
    pub fn log(&self) -> Vec<Vec<String>> {
        self.state.lock().log.clone()
    }

    pub fn received(&self, command: &str) -> usize {
        self.state
            .lock()
            .log
            .iter()
            .filter(|request| request.first().map(String::as_str) == Some(command))
            .count()
    }

    pub fn connections_accepted(&self) -> usize {
        self.state.lock().accepted
    }

    /// Deliver `payload` on `channel` to every subscriber; returns receivers
    pub fn publish(&self, channel: &str, payload: &str) -> i64 {
        let message = RespValue::Array(vec![bulk("message"), bulk(channel), bulk(payload)]);
        let mut buf = BytesMut::new();
        RespEncoder::encode(&message, &mut buf);
        let frame = buf.freeze();

        let mut receivers = 0;
        let mut subscribers = self.subscribers.lock();
        subscribers.retain(|subscriber| !subscriber.tx.is_closed());
        for subscriber in subscribers.iter() {
            if subscriber.channels.iter().any(|c| c == channel) && subscriber.tx.send(frame.clone()).is_ok() {
                receivers += 1;
            }
        }
        receivers
    }

    fn accept(self: &Arc<Self>, stream: DuplexStream) {
        self.state.lock().accepted += 1;
        tokio::spawn(serve(self.clone(), stream));
    }

    fn handle(&self, session: &mut Session, request: &RespValue) {
        let Ok(items) = request.as_array() else {
            return;
        };
        let args: Vec<Bytes> = items.iter().filter_map(|v| v.as_bytes().ok()).collect();
        let Some(first) = args.first() else {
            return;
        };
        let name = String::from_utf8_lossy(first).to_ascii_uppercase();
        let text = |i: usize| {
            args.get(i)
                .map(|a| String::from_utf8_lossy(a).into_owned())
                .unwrap_or_default()
        };

        let mut state = self.state.lock();
        let mut logged = vec![name.clone()];
        logged.extend((1..args.len()).map(text));
        state.log.push(logged);
        if state.hang {
            return;
        }

        if matches!(name.as_str(), "GET" | "SET" | "INCR" | "DEL" | "EXISTS" | "MGET") {
            if let Some(redirect) = args.get(1).and_then(|key| state.redirects.get(key)) {
                let slot = calculate_slot(&args[1]);
                let reply = match redirect {
                    Redirect::Moved(target) => format!("MOVED {slot} {target}"),
                    Redirect::Ask(target) => format!("ASK {slot} {target}"),
                };
                session.send(&error(reply));
                return;
            }
        }

        let reply = match name.as_str() {
            "HELLO" => error("ERR unknown command 'HELLO'"),
            "AUTH" | "CLIENT" | "ASKING" => ok(),
            "SELECT" => match text(1).parse::<u16>() {
                Ok(db) if u32::from(db) < state.databases => {
                    session.db = db;
                    ok()
                }
                _ => error("ERR DB index is out of range"),
            },
            "PING" if args.len() > 1 => bulk(text(1)),
            "PING" => RespValue::SimpleString("PONG".to_string()),
            "ECHO" => bulk(text(1)),
            "TIME" => RespValue::Array(vec![bulk("1700000000"), bulk("0")]),
            "INFO" => bulk(self.info(&state)),
            "ROLE" => match &state.role {
                Role::Master => RespValue::Array(vec![
                    bulk("master"),
                    RespValue::Integer(0),
                    RespValue::Array(Vec::new()),
                ]),
                Role::Replica(master) => RespValue::Array(vec![
                    bulk("slave"),
                    bulk(master.host.clone()),
                    RespValue::Integer(i64::from(master.port)),
                    bulk("connected"),
                    RespValue::Integer(0),
                ]),
                Role::Sentinel => RespValue::Array(vec![
                    bulk("sentinel"),
                    RespValue::Array(state.services.keys().map(|s| bulk(s.clone())).collect()),
                ]),
            },
            "CONFIG" if text(1).eq_ignore_ascii_case("GET") && text(2) == "databases" => {
                RespValue::Array(vec![bulk("databases"), bulk(state.databases.to_string())])
            }
            "CLUSTER" => match &state.cluster_nodes {
                Some(nodes) if text(1).eq_ignore_ascii_case("NODES") => bulk(nodes.clone()),
                Some(_) => error("ERR unknown subcommand"),
                None => error("ERR This instance has cluster support disabled"),
            },
            "GET" => state
                .data
                .get(&(session.db, args[1].clone()))
                .map_or(RespValue::Null, |v| RespValue::BulkString(v.clone())),
            "SET" if args.len() >= 3 => {
                state
                    .data
                    .insert((session.db, args[1].clone()), args[2].clone());
                ok()
            }
            "INCR" => {
                let key = (session.db, args[1].clone());
                let current = state
                    .data
                    .get(&key)
                    .and_then(|v| String::from_utf8_lossy(v).parse::<i64>().ok())
                    .unwrap_or(0);
                state
                    .data
                    .insert(key, Bytes::from((current + 1).to_string()));
                RespValue::Integer(current + 1)
            }
            "DEL" | "EXISTS" => {
                let mut count = 0;
                for key in &args[1..] {
                    let key = (session.db, key.clone());
                    let hit = if name == "DEL" {
                        state.data.remove(&key).is_some()
                    } else {
                        state.data.contains_key(&key)
                    };
                    if hit {
                        count += 1;
                    }
                }
                RespValue::Integer(count)
            }
            "MGET" => RespValue::Array(
                args[1..]
                    .iter()
                    .map(|key| {
                        state
                            .data
                            .get(&(session.db, key.clone()))
                            .map_or(RespValue::Null, |v| RespValue::BulkString(v.clone()))
                    })
                    .collect(),
            ),
            "SUBSCRIBE" => {
                drop(state);
                let channels: Vec<String> = (1..args.len()).map(text).collect();
                let mut subscribers = self.subscribers.lock();
                let position = subscribers
                    .iter()
                    .position(|s| s.tx.same_channel(&session.tx));
                let subscriber = match position {
                    Some(index) => &mut subscribers[index],
                    None => {
                        subscribers.push(Subscriber {
                            channels: Vec::new(),
                            tx: session.tx.clone(),
                        });
                        let last = subscribers.len() - 1;
                        &mut subscribers[last]
                    }
                };
                for channel in channels {
                    if !subscriber.channels.contains(&channel) {
                        subscriber.channels.push(channel.clone());
                    }
                    session.send(&RespValue::Array(vec![
                        bulk("subscribe"),
                        bulk(channel),
                        RespValue::Integer(subscriber.channels.len() as i64),
                    ]));
                }
                return;
            }
            "PUBLISH" => {
                drop(state);
                let receivers = self.publish(&text(1), &text(2));
                session.send(&RespValue::Integer(receivers));
                return;
            }
            "SENTINEL" => {
                let service = state.services.get(&text(2));
                match (text(1).to_ascii_lowercase().as_str(), service) {
                    ("get-master-addr-by-name", Some((master, _))) => RespValue::Array(vec![
                        bulk(master.host.clone()),
                        bulk(master.port.to_string()),
                    ]),
                    ("get-master-addr-by-name", None) => RespValue::Null,
                    ("replicas" | "slaves", Some((_, replicas))) => RespValue::Array(
                        replicas
                            .iter()
                            .map(|replica| {
                                RespValue::Array(vec![
                                    bulk("ip"),
                                    bulk(replica.host.clone()),
                                    bulk("port"),
                                    bulk(replica.port.to_string()),
                                    bulk("flags"),
                                    bulk("slave"),
                                ])
                            })
                            .collect(),
                    ),
                    (_, None) => error("ERR No such master with that name"),
                    _ => error("ERR unknown sentinel subcommand"),
                }
            }
            _ => error(format!("ERR unknown command '{name}'")),
        };
        session.send(&reply);
    }

    fn info(&self, state: &ServerState) -> String {
        let mode = match (&state.mode, &state.role, &state.cluster_nodes) {
            (Some(mode), _, _) => mode.as_str(),
            (None, Role::Sentinel, _) => "sentinel",
            (None, _, Some(_)) => "cluster",
            _ => "standalone",
        };
        let mut info = format!(
            "# Server\r\nredis_version:7.2.4\r\nredis_mode:{mode}\r\ntcp_port:{}\r\n",
            self.endpoint.port
        );
        match &state.role {
            Role::Master => info.push_str("# Replication\r\nrole:master\r\nconnected_slaves:0\r\n"),
            Role::Replica(master) => info.push_str(&format!(
                "# Replication\r\nrole:slave\r\nmaster_host:{}\r\nmaster_port:{}\r\nmaster_link_status:up\r\n",
                master.host, master.port
            )),
            Role::Sentinel => info.push_str(&format!(
                "# Sentinel\r\nsentinel_masters:{}\r\n",
                state.services.len()
            )),
        }
        if state.cluster_nodes.is_some() {
            info.push_str("# Cluster\r\ncluster_enabled:1\r\n");
        }
        info
    }
}

async fn serve(server: Arc<MockServer>, stream: DuplexStream) {
    let (mut reader, mut writer) = tokio::io::split(stream);
    let (tx, mut rx) = mpsc::unbounded_channel::<Bytes>();
    let mut shutdown = server.shutdown.subscribe();

    let writer_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if writer.write_all(&frame).await.is_err() {
                break;
            }
        }
    });

    let mut session = Session { db: 0, tx };
    let mut buf = BytesMut::with_capacity(4096);
    'connection: loop {
        loop {
            let mut cursor = Cursor::new(&buf[..]);
            match RespDecoder::decode(&mut cursor) {
                Ok(Some(request)) => {
                    let consumed = cursor.position() as usize;
                    buf.advance(consumed);
                    server.handle(&mut session, &request);
                }
                Ok(None) => break,
                Err(_) => break 'connection,
            }
        }

        tokio::select! {
            _ = shutdown.changed() => break,
            read = reader.read_buf(&mut buf) => match read {
                Ok(0) | Err(_) => break,
                Ok(_) => {}
            },
        }
    }
    writer_task.abort();
}

/// A set of mock servers reachable through one [`Connector`]
#[derive(Default)]
pub struct MockNetwork {
    servers: Mutex<HashMap<EndPoint, Arc<MockServer>>>,
}

impl MockNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn add(&self, port: u16, role: Role) -> Arc<MockServer> {
        let server = Arc::new(MockServer::new(ep(port), role));
        self.servers.lock().insert(ep(port), server.clone());
        server
    }

    pub fn master(&self, port: u16) -> Arc<MockServer> {
        self.add(port, Role::Master)
    }

    pub fn replica(&self, port: u16, master: u16) -> Arc<MockServer> {
        self.add(port, Role::Replica(ep(master)))
    }

    pub fn sentinel(&self, port: u16) -> Arc<MockServer> {
        self.add(port, Role::Sentinel)
    }

    /// Masters on `ports` forming one cluster, slots split evenly in order
    pub fn cluster(&self, ports: &[u16]) -> Vec<Arc<MockServer>> {
        let text = cluster_nodes_text(ports);
        ports
            .iter()
            .map(|&port| {
                let server = self.master(port);
                server.set_cluster_nodes(text.clone());
                server
            })
            .collect()
    }

    pub fn server(&self, port: u16) -> Arc<MockServer> {
        self.servers.lock()[&ep(port)].clone()
    }
}

/// `CLUSTER NODES` output for masters on `ports` with evenly split slots
pub fn cluster_nodes_text(ports: &[u16]) -> String {
    let total = 16384usize;
    let count = ports.len().max(1);
    let mut lines = Vec::new();
    for (index, port) in ports.iter().enumerate() {
        let start = total * index / count;
        let end = total * (index + 1) / count - 1;
        let flags = if index == 0 { "myself,master" } else { "master" };
        lines.push(format!(
            "{:040x} {HOST}:{port}@{} {flags} - 0 0 {} connected {start}-{end}",
            index + 1,
            u32::from(*port) + 10000,
            index + 1
        ));
    }
    lines.join("\n")
}

#[async_trait]
impl Connector for MockNetwork {
    async fn connect(
        &self,
        endpoint: &EndPoint,
        _config: &ConnectionConfig,
    ) -> RedisResult<BoxedStream> {
        let server = self.servers.lock().get(endpoint).cloned();
        match server {
            Some(server) if !server.state.lock().down => {
                let (client, remote) = tokio::io::duplex(64 * 1024);
                server.accept(remote);
                Ok(Box::new(client))
            }
            _ => Err(RedisError::connection(
                ConnectionFailureKind::SocketFailure,
                endpoint,
                "connection refused",
            )),
        }
    }
}
