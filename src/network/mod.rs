//! Transport drivers behind the network adapter contract.
//!
//! The server core never touches sockets directly: a [`NetworkAdapter`]
//! binds the address, accepts connections, creates [`Conn`](crate::Conn)s
//! with the right transport variant and feeds inbound payloads into the
//! core through `Server::push_packet`. Read errors stay scoped to the
//! connection that raised them — the adapter closes that connection through
//! the core and keeps serving everyone else.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use crate::error::ServerError;
use crate::server::Server;

mod tcp;
mod udp;
mod ws;

/// Which listener the server runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NetworkKind {
    /// TCP, any address family.
    Tcp,
    /// TCP over IPv4.
    Tcp4,
    /// TCP over IPv6.
    Tcp6,
    /// UDP, any address family.
    Udp,
    /// UDP over IPv4.
    Udp4,
    /// UDP over IPv6.
    Udp6,
    /// UNIX stream socket; the address is the socket path.
    Unix,
    /// WebSocket; the address carries the upgrade path, e.g. `":8888/ws"`.
    Websocket,
    /// No listener. The message system runs; packets arrive only through
    /// explicitly created connections.
    None,
}

impl fmt::Display for NetworkKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            NetworkKind::Tcp => "tcp",
            NetworkKind::Tcp4 => "tcp4",
            NetworkKind::Tcp6 => "tcp6",
            NetworkKind::Udp => "udp",
            NetworkKind::Udp4 => "udp4",
            NetworkKind::Udp6 => "udp6",
            NetworkKind::Unix => "unix",
            NetworkKind::Websocket => "websocket",
            NetworkKind::None => "none",
        };
        f.write_str(name)
    }
}

/// A transport driver. `listen` must return once the listener is bound and
/// accepting; `stop` tears the listener down during shutdown.
#[async_trait]
pub(crate) trait NetworkAdapter: Send + Sync {
    async fn listen(&self, server: Arc<Server>, addr: &str) -> Result<(), ServerError>;
    async fn stop(&self);
}

/// Expands the Go-style `":8888"` shorthand into a bindable address.
pub(crate) fn normalize_bind_addr(addr: &str) -> String {
    if addr.starts_with(':') {
        format!("0.0.0.0{addr}")
    } else {
        addr.to_string()
    }
}

/// Selects the driver for a network kind.
pub(crate) fn adapter_for(kind: NetworkKind) -> Box<dyn NetworkAdapter> {
    match kind {
        NetworkKind::Tcp | NetworkKind::Tcp4 | NetworkKind::Tcp6 => {
            Box::new(tcp::TcpAdapter::default())
        }
        NetworkKind::Unix => Box::new(tcp::UnixAdapter::default()),
        NetworkKind::Udp | NetworkKind::Udp4 | NetworkKind::Udp6 => {
            Box::new(udp::UdpAdapter::default())
        }
        NetworkKind::Websocket => Box::new(ws::WebsocketAdapter::default()),
        NetworkKind::None => Box::new(NoneAdapter),
    }
}

/// The `NetworkKind::None` driver: nothing to bind, nothing to stop.
struct NoneAdapter;

#[async_trait]
impl NetworkAdapter for NoneAdapter {
    async fn listen(&self, _server: Arc<Server>, _addr: &str) -> Result<(), ServerError> {
        Ok(())
    }

    async fn stop(&self) {}
}
