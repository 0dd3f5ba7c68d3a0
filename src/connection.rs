//! Connection abstraction and the per-connection write loop.
//!
//! A [`Conn`] unifies several wire transports behind one write pipeline:
//! callers append packets to an outbound batch and a single writer task per
//! connection drains the batch onto the transport, so writes never block the
//! caller on I/O and packets written in program order reach the wire in the
//! same order.
//!
//! Transport variants: stream sockets (TCP/UNIX), datagram sockets,
//! WebSocket frames, pluggable reliable-UDP sessions, a gateway re-framing
//! mode that forwards through an upstream connection, and an empty variant
//! for tests.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use dashmap::DashMap;
use futures::stream::SplitSink;
use futures::SinkExt;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{sleep, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_tungstenite::WebSocketStream;
use tracing::{debug, warn};

use crate::error::ServerError;
use crate::gateway::{self, GatewayFrame};
use crate::pool::Pool;
use crate::server::Server;
use crate::utils::unix_nanos;

/// WebSocket text frame.
pub const WEBSOCKET_TEXT: i32 = 1;
/// WebSocket binary frame.
pub const WEBSOCKET_BINARY: i32 = 2;
/// WebSocket close control frame.
pub const WEBSOCKET_CLOSE: i32 = 8;
/// WebSocket ping control frame.
pub const WEBSOCKET_PING: i32 = 9;
/// WebSocket pong control frame.
pub const WEBSOCKET_PONG: i32 = 10;

/// How long the writer sleeps between drains when the batch is empty.
const WRITER_IDLE: Duration = Duration::from_millis(50);

/// An outbound packet: payload plus the transport-specific frame kind
/// (WebSocket opcode for WebSocket connections, `0` elsewhere).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Packet {
    /// Transport frame kind.
    pub frame: i32,
    /// Payload bytes.
    pub data: Vec<u8>,
}

impl Packet {
    /// A packet with frame kind `0`, suitable for non-WebSocket transports.
    pub fn new(data: impl Into<Vec<u8>>) -> Self {
        Self { frame: 0, data: data.into() }
    }

    /// A WebSocket text packet.
    pub fn text(data: impl Into<Vec<u8>>) -> Self {
        Self { frame: WEBSOCKET_TEXT, data: data.into() }
    }

    /// A WebSocket binary packet.
    pub fn binary(data: impl Into<Vec<u8>>) -> Self {
        Self { frame: WEBSOCKET_BINARY, data: data.into() }
    }

    /// A packet with an explicit frame kind.
    pub fn with_frame(frame: i32, data: impl Into<Vec<u8>>) -> Self {
        Self { frame, data: data.into() }
    }
}

/// Callback invoked after the transport acknowledges (or fails) a write.
pub type WriteCallback = Box<dyn FnOnce(Option<&ServerError>) + Send + 'static>;

/// A reliable-UDP session the server can write through.
///
/// The core does not ship a reliable-UDP implementation; listeners that
/// maintain their own sessions (KCP-style) hand them in through this trait.
#[async_trait::async_trait]
pub trait ReliableSession: Send {
    /// Writes one packet to the session.
    async fn send(&mut self, data: &[u8]) -> std::io::Result<()>;
    /// Closes the session.
    async fn close(&mut self) -> std::io::Result<()>;
}

/// Which transport a connection speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    /// TCP or UNIX stream socket.
    Stream,
    /// UDP datagram socket.
    Datagram,
    /// WebSocket frames.
    Websocket,
    /// Reliable-UDP session.
    ReliableUdp,
    /// Gateway re-encapsulation; forwards through an upstream connection.
    GatewayProxy,
    /// No transport; writes are discarded. Test double.
    Empty,
}

type WsSink = SplitSink<WebSocketStream<TcpStream>, WsMessage>;

pub(crate) enum Transport {
    Stream(tokio::net::tcp::OwnedWriteHalf),
    #[cfg(unix)]
    UnixStream(tokio::net::unix::OwnedWriteHalf),
    Datagram {
        socket: Arc<tokio::net::UdpSocket>,
        peer: std::net::SocketAddr,
    },
    Websocket(WsSink),
    Reliable(Box<dyn ReliableSession>),
    Empty,
}

impl Transport {
    async fn emit(&mut self, frame: i32, data: &[u8]) -> Result<(), ServerError> {
        match self {
            Transport::Stream(half) => half
                .write_all(data)
                .await
                .map_err(|e| ServerError::TransportWrite(e.to_string())),
            #[cfg(unix)]
            Transport::UnixStream(half) => half
                .write_all(data)
                .await
                .map_err(|e| ServerError::TransportWrite(e.to_string())),
            Transport::Datagram { socket, peer } => socket
                .send_to(data, *peer)
                .await
                .map(|_| ())
                .map_err(|e| ServerError::TransportWrite(e.to_string())),
            Transport::Websocket(sink) => {
                let msg = match frame {
                    WEBSOCKET_TEXT => {
                        WsMessage::Text(String::from_utf8_lossy(data).into_owned())
                    }
                    WEBSOCKET_CLOSE => WsMessage::Close(None),
                    WEBSOCKET_PING => WsMessage::Ping(data.to_vec()),
                    WEBSOCKET_PONG => WsMessage::Pong(data.to_vec()),
                    _ => WsMessage::Binary(data.to_vec()),
                };
                sink.send(msg)
                    .await
                    .map_err(|e| ServerError::TransportWrite(e.to_string()))
            }
            Transport::Reliable(session) => session
                .send(data)
                .await
                .map_err(|e| ServerError::TransportWrite(e.to_string())),
            Transport::Empty => Ok(()),
        }
    }

    async fn shutdown(&mut self) {
        match self {
            Transport::Stream(half) => {
                let _ = half.shutdown().await;
            }
            #[cfg(unix)]
            Transport::UnixStream(half) => {
                let _ = half.shutdown().await;
            }
            Transport::Websocket(sink) => {
                let _ = sink.close().await;
            }
            Transport::Reliable(session) => {
                let _ = session.close().await;
            }
            Transport::Datagram { .. } | Transport::Empty => {}
        }
    }
}

struct GatewayTarget {
    upstream: Arc<Conn>,
    origin: String,
}

#[derive(Clone)]
struct ConnShared {
    id: String,
    remote_addr: String,
    ip: String,
    kind: TransportKind,
}

/// A pooled batch record: one queued write plus its optional callback.
struct BatchRecord {
    frame: i32,
    data: Vec<u8>,
    callback: Option<WriteCallback>,
}

impl Default for BatchRecord {
    fn default() -> Self {
        Self { frame: 0, data: Vec::new(), callback: None }
    }
}

struct BatchState {
    pool: Pool<BatchRecord>,
    packets: Vec<BatchRecord>,
}

/// A server connection. Always handled as `Arc<Conn>`.
pub struct Conn {
    server: Weak<Server>,
    shared: Mutex<ConnShared>,
    transport: tokio::sync::Mutex<Transport>,
    /// `None` once the connection is closed.
    batch: Mutex<Option<BatchState>>,
    data: DashMap<String, serde_json::Value>,
    gateway: Option<GatewayTarget>,
    closed: AtomicBool,
    /// Bumped on reuse so a superseded writer task exits.
    writer_epoch: AtomicU64,
}

fn strip_port(addr: &str) -> String {
    match addr.rfind(':') {
        Some(idx) => addr[..idx].to_string(),
        None => addr.to_string(),
    }
}

impl Conn {
    fn build(
        server: &Arc<Server>,
        transport: Transport,
        remote_addr: String,
        kind: TransportKind,
    ) -> Arc<Self> {
        let batch_capacity = server.config().conn_write_buffer_size;
        let conn = Arc::new(Self {
            server: Arc::downgrade(server),
            shared: Mutex::new(ConnShared {
                id: remote_addr.clone(),
                ip: strip_port(&remote_addr),
                remote_addr,
                kind,
            }),
            transport: tokio::sync::Mutex::new(transport),
            batch: Mutex::new(Some(BatchState {
                pool: Pool::new(batch_capacity, BatchRecord::default, |record| {
                    record.frame = 0;
                    record.data = Vec::new();
                    record.callback = None;
                }),
                packets: Vec::new(),
            })),
            data: DashMap::new(),
            gateway: None,
            closed: AtomicBool::new(false),
            writer_epoch: AtomicU64::new(0),
        });
        Self::spawn_writer(&conn);
        conn
    }

    pub(crate) fn new_stream(
        server: &Arc<Server>,
        half: tokio::net::tcp::OwnedWriteHalf,
        remote_addr: String,
    ) -> Arc<Self> {
        Self::build(server, Transport::Stream(half), remote_addr, TransportKind::Stream)
    }

    #[cfg(unix)]
    pub(crate) fn new_unix_stream(
        server: &Arc<Server>,
        half: tokio::net::unix::OwnedWriteHalf,
        remote_addr: String,
    ) -> Arc<Self> {
        Self::build(
            server,
            Transport::UnixStream(half),
            remote_addr,
            TransportKind::Stream,
        )
    }

    pub(crate) fn new_datagram(
        server: &Arc<Server>,
        socket: Arc<tokio::net::UdpSocket>,
        peer: std::net::SocketAddr,
    ) -> Arc<Self> {
        Self::build(
            server,
            Transport::Datagram { socket, peer },
            peer.to_string(),
            TransportKind::Datagram,
        )
    }

    pub(crate) fn new_websocket(
        server: &Arc<Server>,
        sink: WsSink,
        remote_addr: String,
    ) -> Arc<Self> {
        Self::build(
            server,
            Transport::Websocket(sink),
            remote_addr,
            TransportKind::Websocket,
        )
    }

    /// Wraps a reliable-UDP session supplied by an external listener.
    pub fn new_reliable(
        server: &Arc<Server>,
        session: Box<dyn ReliableSession>,
        remote_addr: String,
    ) -> Arc<Self> {
        Self::build(
            server,
            Transport::Reliable(session),
            remote_addr,
            TransportKind::ReliableUdp,
        )
    }

    /// A connection with no transport, suitable for tests and harnesses.
    /// Writes are accepted and silently discarded by the writer.
    pub fn empty(server: &Arc<Server>) -> Arc<Self> {
        Self::build(
            server,
            Transport::Empty,
            "0.0.0.0:0".to_string(),
            TransportKind::Empty,
        )
    }

    /// A gateway-proxy pseudo-connection: every write is re-framed as a
    /// [`GatewayFrame`] and forwarded through `upstream`. No writer task is
    /// spawned; the upstream connection owns the actual transport.
    pub fn gateway(upstream: &Arc<Conn>, origin_id: impl Into<String>) -> Arc<Self> {
        let origin = origin_id.into();
        Arc::new(Self {
            server: upstream.server.clone(),
            shared: Mutex::new(ConnShared {
                id: origin.clone(),
                remote_addr: String::new(),
                ip: String::new(),
                kind: TransportKind::GatewayProxy,
            }),
            transport: tokio::sync::Mutex::new(Transport::Empty),
            batch: Mutex::new(None),
            data: DashMap::new(),
            gateway: Some(GatewayTarget { upstream: Arc::clone(upstream), origin }),
            closed: AtomicBool::new(false),
            writer_epoch: AtomicU64::new(0),
        })
    }

    /// Connection id: the remote-address string (the origin id for gateway
    /// connections).
    pub fn id(&self) -> String {
        self.shared.lock().map(|s| s.id.clone()).unwrap_or_default()
    }

    /// Remote address string.
    pub fn remote_addr(&self) -> String {
        self.shared
            .lock()
            .map(|s| s.remote_addr.clone())
            .unwrap_or_default()
    }

    /// Remote IP with the port stripped.
    pub fn ip(&self) -> String {
        self.shared.lock().map(|s| s.ip.clone()).unwrap_or_default()
    }

    /// Which transport this connection speaks.
    pub fn transport_kind(&self) -> TransportKind {
        self.shared
            .lock()
            .map(|s| s.kind)
            .unwrap_or(TransportKind::Empty)
    }

    /// Whether this connection has no real transport behind it.
    pub fn is_empty(&self) -> bool {
        matches!(self.transport_kind(), TransportKind::Empty)
    }

    pub(crate) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Stores a user-data value on the connection.
    pub fn set_data(&self, key: impl Into<String>, value: serde_json::Value) {
        self.data.insert(key.into(), value);
    }

    /// Fetches a user-data value.
    pub fn get_data(&self, key: &str) -> Option<serde_json::Value> {
        self.data.get(key).map(|entry| entry.value().clone())
    }

    /// Drops every user-data entry.
    pub fn release_data(&self) {
        self.data.clear();
    }

    /// Appends a packet to the outbound batch. Never blocks on I/O.
    ///
    /// The `ConnectionWritePacketBefore` hooks may rewrite the packet first.
    /// Writes on a closed connection are silently dropped.
    pub fn write(self: &Arc<Self>, packet: Packet) {
        self.enqueue(packet, None);
    }

    /// Like [`write`](Self::write), plus `callback(err)` fires after the
    /// transport acknowledges (or fails) the send.
    pub fn write_with_callback(self: &Arc<Self>, packet: Packet, callback: WriteCallback) {
        self.enqueue(packet, Some(callback));
    }

    fn enqueue(self: &Arc<Self>, packet: Packet, callback: Option<WriteCallback>) {
        if let Some(gw) = &self.gateway {
            let envelope = GatewayFrame {
                conn_id: gw.origin.clone(),
                frame: packet.frame,
                data: packet.data,
                timestamp: unix_nanos(),
            };
            match gateway::encode(&envelope) {
                Ok(buf) => gw.upstream.write(Packet::with_frame(envelope.frame, buf)),
                Err(err) => warn!(conn = %self.id(), %err, "gateway re-frame failed"),
            }
            return;
        }

        let packet = match self.server.upgrade() {
            Some(server) => server
                .events()
                .emit_connection_write_packet_before(&server, self, packet),
            None => packet,
        };

        let mut guard = match self.batch.lock() {
            Ok(guard) => guard,
            Err(_) => return,
        };
        let Some(state) = guard.as_mut() else {
            // Closed; late writes are swallowed.
            return;
        };
        let mut record = state.pool.get();
        record.frame = packet.frame;
        record.data = packet.data;
        record.callback = callback;
        state.packets.push(record);
    }

    fn spawn_writer(conn: &Arc<Self>) {
        let conn = Arc::clone(conn);
        let epoch = conn.writer_epoch.load(Ordering::SeqCst);
        tokio::spawn(async move {
            conn.write_loop(epoch).await;
        });
    }

    /// The serialized writer: snapshots the batch under the connection
    /// mutex, clears it, and emits each record via the transport. Any
    /// transport error terminates the loop and closes the connection.
    async fn write_loop(self: Arc<Self>, epoch: u64) {
        loop {
            if self.writer_epoch.load(Ordering::SeqCst) != epoch {
                return; // superseded by reuse
            }
            let drained = {
                let mut guard = match self.batch.lock() {
                    Ok(guard) => guard,
                    Err(_) => return,
                };
                match guard.as_mut() {
                    None => return, // closed
                    Some(state) if state.packets.is_empty() => None,
                    Some(state) => Some(std::mem::take(&mut state.packets)),
                }
            };
            let Some(records) = drained else {
                sleep(WRITER_IDLE).await;
                continue;
            };

            let mut failure = None;
            {
                let mut transport = self.transport.lock().await;
                for mut record in records {
                    let result = transport.emit(record.frame, &record.data).await;
                    let callback = record.callback.take();
                    let err = result.err();
                    if let Ok(mut guard) = self.batch.lock() {
                        if let Some(state) = guard.as_mut() {
                            state.pool.release(record);
                        }
                    }
                    if let Some(cb) = callback {
                        cb(err.as_ref());
                    }
                    if let Some(e) = err {
                        failure = Some(e);
                        break;
                    }
                }
            }
            if let Some(err) = failure {
                warn!(conn = %self.id(), %err, "connection writer terminated");
                self.close().await;
                return;
            }
        }
    }

    /// Closes the connection: the batch pool is closed, buffers dropped and
    /// the transport handle shut down. Idempotent.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Ok(mut guard) = self.batch.lock() {
            if let Some(state) = guard.take() {
                state.pool.close();
            }
        }
        let mut transport = self.transport.lock().await;
        transport.shutdown().await;
        *transport = Transport::Empty;
        debug!(conn = %self.id(), "connection closed");
    }

    /// Closes `self`, then inherits `other`'s transport, address, user data
    /// and pending batch. Used for reconnect-keep-identity flows; `other`
    /// need not still be open. `other` is left closed and empty.
    pub async fn reuse(self: &Arc<Self>, other: &Arc<Conn>) {
        // Retire our writer and transport first.
        self.writer_epoch.fetch_add(1, Ordering::SeqCst);
        {
            let mut transport = self.transport.lock().await;
            transport.shutdown().await;
            let mut theirs = other.transport.lock().await;
            *transport = std::mem::replace(&mut *theirs, Transport::Empty);
        }
        {
            // Self-then-other lock order; concurrent opposite-direction
            // reuse is not supported.
            let (Ok(mut ours), Ok(mut theirs)) = (self.batch.lock(), other.batch.lock()) else {
                return;
            };
            *ours = theirs.take();
        }
        if let (Ok(mut ours), Ok(theirs)) = (self.shared.lock(), other.shared.lock()) {
            *ours = theirs.clone();
        }
        self.data.clear();
        let keys: Vec<String> = other.data.iter().map(|e| e.key().clone()).collect();
        for key in keys {
            if let Some((key, value)) = other.data.remove(&key) {
                self.data.insert(key, value);
            }
        }
        other.closed.store(true, Ordering::SeqCst);

        let inherited_open = self.batch.lock().map(|g| g.is_some()).unwrap_or(false);
        self.closed.store(!inherited_open, Ordering::SeqCst);
        if inherited_open {
            Self::spawn_writer(self);
        }
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id())
            .field("kind", &self.transport_kind())
            .field("closed", &self.is_closed())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn strip_port_handles_common_forms() {
        assert_eq!(strip_port("10.0.0.1:8888"), "10.0.0.1");
        assert_eq!(strip_port("[::1]:8888"), "[::1]");
        assert_eq!(strip_port("/tmp/app.sock"), "/tmp/app.sock");
    }

    #[test]
    fn packet_constructors() {
        assert_eq!(Packet::text("hi").frame, WEBSOCKET_TEXT);
        assert_eq!(Packet::binary(vec![1]).frame, WEBSOCKET_BINARY);
        assert_eq!(Packet::new(vec![1, 2]).frame, 0);
    }
}
