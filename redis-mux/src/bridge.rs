//! Physical bridge: one socket, one writer task, one reader task
//!
//! Producers hand [`Message`]s to the bridge through unbounded channels. The
//! writer task pushes each message onto the in-flight FIFO *before* writing
//! its bytes, so the reader task can always pair the next reply with the
//! oldest in-flight entry. Database switches and `ASKING` prefixes are queued
//! as internal entries whose replies are consumed by the bridge itself.

use crate::command::{Command, CommandCode, CommandFlags};
use crate::connection::BoxedStream;
use crate::protocol::{FrameScan, ProtocolVersion, RespDecoder};
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::Mutex;
use redis_mux_core::{
    config::ConnectionConfig,
    error::{ConnectionFailureKind, RedisError, RedisResult},
    types::EndPoint,
    value::RespValue,
};
use std::collections::VecDeque;
use std::fmt;
use std::io::Cursor;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::sync::{mpsc, oneshot, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

/// Most messages encoded into one socket write
const MAX_BATCH: usize = 128;

/// `selected_db` value when the connection's database is not known
const UNKNOWN_DB: u32 = u32::MAX;

/// Completion sink of a command
pub type ReplySink = oneshot::Sender<RedisResult<RespValue>>;

/// Result of handing a message to an endpoint
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteResult {
    /// Queued for writing
    Success,
    /// No usable connection
    NoConnectionAvailable,
    /// The deadline passed before the message could be queued
    TimeoutBeforeWrite,
    /// The connection went away while queueing
    WriteFailure,
}

/// Which of an endpoint's two connections a bridge is
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionType {
    /// Request/response traffic
    Interactive,
    /// Pub/sub traffic
    Subscription,
}

impl fmt::Display for ConnectionType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Interactive => f.write_str("interactive"),
            Self::Subscription => f.write_str("subscription"),
        }
    }
}

/// A command travelling through the multiplexer together with its sink
#[derive(Debug)]
pub struct Message {
    /// The command
    pub command: Command,
    /// Completion sink; `None` for fire-and-forget
    pub sink: Option<ReplySink>,
    /// Redirects followed so far
    pub redirects: usize,
    /// Latest instant at which the message may still be written
    pub deadline: Option<Instant>,
}

impl Message {
    /// Create a message
    #[must_use]
    pub fn new(command: Command, sink: Option<ReplySink>, deadline: Option<Instant>) -> Self {
        Self {
            command,
            sink,
            redirects: 0,
            deadline,
        }
    }

    /// Satisfy the sink; a dropped receiver means the caller gave up
    pub fn complete(mut self, result: RedisResult<RespValue>) {
        if let Some(sink) = self.sink.take() {
            let _ = sink.send(result);
        }
    }

    /// Fail the sink with `error`
    pub fn fail(self, error: RedisError) {
        self.complete(Err(error));
    }

    /// Whether the deadline has passed
    #[must_use]
    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }
}

/// Notifications a bridge raises for its owner
#[derive(Debug)]
pub enum BridgeEvent {
    /// A reply was `-MOVED` or `-ASK`; the message wants resending
    Redirect {
        /// Endpoint that answered with the redirect
        source: EndPoint,
        /// The message, sink still unsatisfied
        message: Message,
        /// The parsed redirect
        redirect: RedisError,
    },
    /// The connection failed
    ConnectionFailed {
        /// Endpoint of the bridge
        endpoint: EndPoint,
        /// Which connection failed
        connection: ConnectionType,
        /// Failure category
        kind: ConnectionFailureKind,
        /// Detail
        message: String,
    },
    /// A pub/sub message arrived
    PubSub {
        /// Endpoint the message arrived on
        endpoint: EndPoint,
        /// Channel name
        channel: String,
        /// Payload
        payload: Bytes,
    },
}

enum InFlight {
    /// Reply to a database switch, consumed by the bridge
    Select(u16),
    /// Reply to an `ASKING` prefix, consumed by the bridge
    Asking,
    /// Reply owed to a message
    Reply(Message),
}

struct BridgeShared {
    endpoint: EndPoint,
    connection: ConnectionType,
    config: Arc<ConnectionConfig>,
    protocol: ProtocolVersion,
    in_flight: Mutex<VecDeque<InFlight>>,
    /// Database the writer last switched to
    selected_db: AtomicU32,
    /// A SELECT the server refused; commands queued behind it for that
    /// database fail instead of running elsewhere
    failed_select: Mutex<Option<(u16, String)>>,
    connected: AtomicBool,
    failed: AtomicBool,
    closing: AtomicBool,
    queued: AtomicUsize,
    written: AtomicU64,
    created: Instant,
    last_read_ms: AtomicU64,
    last_write_ms: AtomicU64,
    shutdown: Notify,
    events: mpsc::UnboundedSender<BridgeEvent>,
}

impl BridgeShared {
    fn elapsed_ms(&self) -> u64 {
        u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX)
    }

    fn detail(&self, command: &Command, message: &str) -> String {
        if self.config.include_detail_in_exceptions {
            format!("{} (command {}, {} connection)", message, command, self.connection)
        } else {
            message.to_string()
        }
    }

    /// Tear the connection down once, failing everything in flight
    fn fail_connection(&self, kind: ConnectionFailureKind, reason: String) {
        if self.failed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.connected.store(false, Ordering::Release);
        self.shutdown.notify_one();

        let pending: Vec<InFlight> = self.in_flight.lock().drain(..).collect();
        if kind != ConnectionFailureKind::ConnectionDisposed {
            warn!(
                "{} connection to {} failed ({}): {}; failing {} in-flight commands",
                self.connection,
                self.endpoint,
                kind,
                reason,
                pending.len()
            );
        }
        for entry in pending {
            if let InFlight::Reply(message) = entry {
                let detail = self.detail(&message.command, &reason);
                message.fail(RedisError::connection(kind, &self.endpoint, detail));
            }
        }

        if kind != ConnectionFailureKind::ConnectionDisposed {
            let _ = self.events.send(BridgeEvent::ConnectionFailed {
                endpoint: self.endpoint.clone(),
                connection: self.connection,
                kind,
                message: reason,
            });
        }
    }

    /// Encode one message, recording its in-flight entries first
    fn enqueue(&self, message: Message, in_flight: &mut VecDeque<InFlight>, buf: &mut BytesMut) {
        if message.is_expired() {
            let detail = self.detail(&message.command, "deadline passed while queued");
            message.fail(RedisError::TimeoutBeforeWrite(detail));
            return;
        }

        if let Some(db) = message.command.db() {
            if self.selected_db.load(Ordering::Acquire) != u32::from(db) {
                let select = Command::new(CommandCode::Select).arg(Bytes::from(db.to_string()));
                in_flight.push_back(InFlight::Select(db));
                select.write_to(buf);
                self.selected_db.store(u32::from(db), Ordering::Release);
            }
        }

        if message.command.flags().contains(CommandFlags::ASKING) {
            in_flight.push_back(InFlight::Asking);
            Command::new(CommandCode::Asking).write_to(buf);
        }

        message.command.write_to(buf);
        in_flight.push_back(InFlight::Reply(message));
    }

    fn on_frame(&self, frame: RespValue) -> Result<(), String> {
        match classify(&frame, self.connection, self.protocol) {
            FrameKind::PubSubMessage { channel, payload } => {
                trace!("Message on {} from {}", channel, self.endpoint);
                let _ = self.events.send(BridgeEvent::PubSub {
                    endpoint: self.endpoint.clone(),
                    channel,
                    payload,
                });
                return Ok(());
            }
            FrameKind::OutOfBand => {
                debug!("Ignoring out-of-band frame from {}", self.endpoint);
                return Ok(());
            }
            FrameKind::Reply => {}
        }

        let entry = self.in_flight.lock().pop_front();
        match entry {
            None => Err(format!(
                "received a {} reply with nothing in flight",
                frame.type_name()
            )),
            Some(InFlight::Select(db)) => {
                let mut failed = self.failed_select.lock();
                if let RespValue::Error(msg) = frame {
                    warn!("SELECT {} failed on {}: {}", db, self.endpoint, msg);
                    // the next command for this database selects again
                    let _ = self.selected_db.compare_exchange(
                        u32::from(db),
                        UNKNOWN_DB,
                        Ordering::AcqRel,
                        Ordering::Acquire,
                    );
                    *failed = Some((db, msg));
                } else if failed.as_ref().is_some_and(|(failed_db, _)| *failed_db == db) {
                    *failed = None;
                }
                Ok(())
            }
            Some(InFlight::Asking) => {
                if let RespValue::Error(msg) = frame {
                    warn!("ASKING failed on {}: {}", self.endpoint, msg);
                }
                Ok(())
            }
            Some(InFlight::Reply(message)) => {
                let refused = message.command.db().and_then(|db| {
                    self.failed_select
                        .lock()
                        .as_ref()
                        .filter(|(failed_db, _)| *failed_db == db)
                        .map(|(_, msg)| format!("SELECT {db} failed: {msg}"))
                });
                match refused {
                    Some(reason) => {
                        let detail = self.detail(&message.command, &reason);
                        message.fail(RedisError::Server(detail));
                    }
                    None => self.complete(message, frame),
                }
                Ok(())
            }
        }
    }

    fn complete(&self, mut message: Message, frame: RespValue) {
        let text = match frame {
            RespValue::Error(text) => text,
            reply => {
                message.complete(Ok(reply));
                return;
            }
        };

        let Some(redirect) = RedisError::parse_redirect(&text) else {
            message.fail(RedisError::Server(text));
            return;
        };

        if message.command.flags().contains(CommandFlags::NO_REDIRECT) {
            message.fail(redirect);
        } else if message.redirects >= self.config.max_redirects {
            debug!(
                "Giving up on {} after {} redirects",
                message.command, message.redirects
            );
            message.fail(RedisError::MaxRetriesExceeded(self.config.max_redirects));
        } else {
            message.redirects += 1;
            let _ = self.events.send(BridgeEvent::Redirect {
                source: self.endpoint.clone(),
                message,
                redirect,
            });
        }
    }
}

enum FrameKind {
    Reply,
    PubSubMessage { channel: String, payload: Bytes },
    OutOfBand,
}

fn classify(frame: &RespValue, connection: ConnectionType, protocol: ProtocolVersion) -> FrameKind {
    let items = match frame {
        RespValue::Push(items) => items,
        RespValue::Array(items)
            if connection == ConnectionType::Subscription && protocol == ProtocolVersion::Resp2 =>
        {
            items
        }
        _ => return FrameKind::Reply,
    };

    let kind = items
        .first()
        .and_then(|v| v.as_string().ok())
        .map(|s| s.to_ascii_lowercase());
    let text = |i: usize| items.get(i).and_then(|v| v.as_string().ok());
    let payload = |i: usize| items.get(i).and_then(|v| v.as_bytes().ok());

    match kind.as_deref() {
        Some("message") => match (text(1), payload(2)) {
            (Some(channel), Some(payload)) => FrameKind::PubSubMessage { channel, payload },
            _ => FrameKind::OutOfBand,
        },
        Some("pmessage") => match (text(2), payload(3)) {
            (Some(channel), Some(payload)) => FrameKind::PubSubMessage { channel, payload },
            _ => FrameKind::OutOfBand,
        },
        Some("subscribe" | "psubscribe" | "unsubscribe" | "punsubscribe" | "pong") => {
            FrameKind::Reply
        }
        _ if matches!(frame, RespValue::Push(_)) => FrameKind::OutOfBand,
        _ => FrameKind::Reply,
    }
}

/// Point-in-time view of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BridgeStatus {
    /// Connection type
    pub connection: ConnectionType,
    /// Whether the socket is usable
    pub connected: bool,
    /// Messages waiting for the writer
    pub queued: usize,
    /// Messages written and awaiting a reply
    pub in_flight: usize,
    /// Messages written since the bridge opened
    pub written: u64,
}

/// One physical connection to a server
pub struct PhysicalBridge {
    shared: Arc<BridgeShared>,
    high_tx: mpsc::UnboundedSender<Message>,
    normal_tx: mpsc::UnboundedSender<Message>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PhysicalBridge {
    /// Start the writer and reader tasks over an established stream
    ///
    /// `leftover` holds bytes read past the end of the handshake.
    pub fn spawn(
        endpoint: EndPoint,
        connection: ConnectionType,
        config: Arc<ConnectionConfig>,
        protocol: ProtocolVersion,
        stream: BoxedStream,
        leftover: BytesMut,
        events: mpsc::UnboundedSender<BridgeEvent>,
    ) -> Self {
        let shared = Arc::new(BridgeShared {
            endpoint,
            connection,
            config,
            protocol,
            in_flight: Mutex::new(VecDeque::new()),
            // a fresh connection starts on database 0
            selected_db: AtomicU32::new(0),
            failed_select: Mutex::new(None),
            connected: AtomicBool::new(true),
            failed: AtomicBool::new(false),
            closing: AtomicBool::new(false),
            queued: AtomicUsize::new(0),
            written: AtomicU64::new(0),
            created: Instant::now(),
            last_read_ms: AtomicU64::new(0),
            last_write_ms: AtomicU64::new(0),
            shutdown: Notify::new(),
            events,
        });

        let (reader, writer) = tokio::io::split(stream);
        let (high_tx, high_rx) = mpsc::unbounded_channel();
        let (normal_tx, normal_rx) = mpsc::unbounded_channel();

        let write_task = tokio::spawn(write_loop(shared.clone(), writer, high_rx, normal_rx));
        let read_task = tokio::spawn(read_loop(shared.clone(), reader, leftover));

        debug!(
            "Bridge up: {} connection to {}",
            shared.connection, shared.endpoint
        );

        Self {
            shared,
            high_tx,
            normal_tx,
            tasks: Mutex::new(vec![write_task, read_task]),
        }
    }

    /// Whether the connection can take messages
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.shared.connected.load(Ordering::Acquire) && !self.shared.closing.load(Ordering::Acquire)
    }

    /// Queue a message for writing
    ///
    /// On anything but [`WriteResult::Success`] the message's sink has been
    /// failed with the matching error.
    pub fn try_write(&self, message: Message) -> WriteResult {
        if !self.is_connected() {
            let detail = self
                .shared
                .detail(&message.command, &format!("{} is not connected", self.shared.endpoint));
            message.fail(RedisError::NoConnectionAvailable(detail));
            return WriteResult::NoConnectionAvailable;
        }
        if message.is_expired() {
            let detail = self.shared.detail(&message.command, "deadline passed before write");
            message.fail(RedisError::TimeoutBeforeWrite(detail));
            return WriteResult::TimeoutBeforeWrite;
        }

        let tx = if message.command.flags().contains(CommandFlags::HIGH_PRIORITY) {
            &self.high_tx
        } else {
            &self.normal_tx
        };
        self.shared.queued.fetch_add(1, Ordering::AcqRel);
        match tx.send(message) {
            Ok(()) => WriteResult::Success,
            Err(mpsc::error::SendError(message)) => {
                self.shared.queued.fetch_sub(1, Ordering::AcqRel);
                let detail = self.shared.detail(&message.command, "connection closed while queueing");
                message.fail(RedisError::connection(
                    ConnectionFailureKind::SocketFailure,
                    &self.shared.endpoint,
                    detail,
                ));
                WriteResult::WriteFailure
            }
        }
    }

    /// Whether nothing was read or written for `idle`
    #[must_use]
    pub fn is_idle_for(&self, idle: Duration) -> bool {
        let now = self.shared.elapsed_ms();
        let last = self
            .shared
            .last_read_ms
            .load(Ordering::Acquire)
            .max(self.shared.last_write_ms.load(Ordering::Acquire));
        now.saturating_sub(last) >= u64::try_from(idle.as_millis()).unwrap_or(u64::MAX)
    }

    /// Point-in-time status
    #[must_use]
    pub fn status(&self) -> BridgeStatus {
        BridgeStatus {
            connection: self.shared.connection,
            connected: self.is_connected(),
            queued: self.shared.queued.load(Ordering::Acquire),
            in_flight: self.shared.in_flight.lock().len(),
            written: self.shared.written.load(Ordering::Acquire),
        }
    }

    /// Stop accepting messages, wait up to `grace` for in-flight replies,
    /// then drop the socket
    pub async fn close(&self, grace: Duration) {
        self.shared.closing.store(true, Ordering::Release);
        let deadline = Instant::now() + grace;
        while Instant::now() < deadline {
            let status = self.status();
            if status.queued == 0 && status.in_flight == 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        self.shared.fail_connection(
            ConnectionFailureKind::ConnectionDisposed,
            "connection closed".to_string(),
        );
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl Drop for PhysicalBridge {
    fn drop(&mut self) {
        self.shared.fail_connection(
            ConnectionFailureKind::ConnectionDisposed,
            "connection dropped".to_string(),
        );
        for task in self.tasks.get_mut().drain(..) {
            task.abort();
        }
    }
}

async fn write_loop(
    shared: Arc<BridgeShared>,
    mut writer: WriteHalf<BoxedStream>,
    mut high: mpsc::UnboundedReceiver<Message>,
    mut normal: mpsc::UnboundedReceiver<Message>,
) {
    let mut buf = BytesMut::with_capacity(8192);

    loop {
        let first = tokio::select! {
            biased;
            _ = shared.shutdown.notified() => break,
            Some(message) = high.recv() => message,
            Some(message) = normal.recv() => message,
            else => break,
        };

        let mut batch = Vec::with_capacity(8);
        batch.push(first);
        while batch.len() < MAX_BATCH {
            match high.try_recv().or_else(|_| normal.try_recv()) {
                Ok(message) => batch.push(message),
                Err(_) => break,
            }
        }
        shared.queued.fetch_sub(batch.len(), Ordering::AcqRel);

        let count = batch.len() as u64;
        {
            let mut in_flight = shared.in_flight.lock();
            for message in batch {
                shared.enqueue(message, &mut in_flight, &mut buf);
            }
        }

        if buf.is_empty() {
            continue;
        }
        let result = async {
            writer.write_all(&buf).await?;
            writer.flush().await
        }
        .await;
        buf.clear();

        if let Err(e) = result {
            shared.fail_connection(ConnectionFailureKind::SocketFailure, e.to_string());
            break;
        }
        shared.written.fetch_add(count, Ordering::AcqRel);
        shared
            .last_write_ms
            .store(shared.elapsed_ms(), Ordering::Release);
    }

    high.close();
    normal.close();
    while let Ok(message) = high.try_recv().or_else(|_| normal.try_recv()) {
        shared.queued.fetch_sub(1, Ordering::AcqRel);
        let detail = shared.detail(&message.command, "connection closed before write");
        message.fail(RedisError::connection(
            ConnectionFailureKind::SocketFailure,
            &shared.endpoint,
            detail,
        ));
    }
    debug!(
        "Writer stopped for {} connection to {}",
        shared.connection, shared.endpoint
    );
}

async fn read_loop(shared: Arc<BridgeShared>, mut reader: ReadHalf<BoxedStream>, mut buffer: BytesMut) {
    // bytes the head frame needs before it is worth scanning again
    let mut wanted = 0usize;
    loop {
        while buffer.len() >= wanted {
            let frame_len = match RespDecoder::scan(&buffer) {
                Ok(FrameScan::Complete(len)) => len,
                Ok(FrameScan::Incomplete(needed)) => {
                    wanted = needed;
                    break;
                }
                Err(e) => {
                    shared.fail_connection(ConnectionFailureKind::ProtocolFailure, e.to_string());
                    return;
                }
            };
            let decoded = {
                let mut cursor = Cursor::new(&buffer[..frame_len]);
                RespDecoder::decode(&mut cursor).map(|frame| frame.map(|f| (f, cursor.position())))
            };
            let (frame, consumed) = match decoded {
                Ok(Some(decoded)) => decoded,
                Ok(None) => {
                    shared.fail_connection(
                        ConnectionFailureKind::ProtocolFailure,
                        "frame ended before its declared length".to_string(),
                    );
                    return;
                }
                Err(e) => {
                    shared.fail_connection(ConnectionFailureKind::ProtocolFailure, e.to_string());
                    return;
                }
            };
            buffer.advance(consumed as usize);
            wanted = 0;
            if let Err(reason) = shared.on_frame(frame) {
                shared.fail_connection(ConnectionFailureKind::ProtocolFailure, reason);
                return;
            }
        }

        match reader.read_buf(&mut buffer).await {
            Ok(0) => {
                shared.fail_connection(
                    ConnectionFailureKind::SocketFailure,
                    "connection closed by server".to_string(),
                );
                return;
            }
            Ok(_) => shared
                .last_read_ms
                .store(shared.elapsed_ms(), Ordering::Release),
            Err(e) => {
                shared.fail_connection(ConnectionFailureKind::SocketFailure, e.to_string());
                return;
            }
        }
    }
}
