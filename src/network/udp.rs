//! Datagram driver.
//!
//! UDP has no connections, so the driver materializes one [`Conn`] per peer
//! address on first contact and keeps it in the server's online table; the
//! connection writes back through `send_to` on the shared socket.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::net::UdpSocket;
use tokio::task::JoinHandle;
use tracing::info;

use crate::connection::Conn;
use crate::error::ServerError;
use crate::server::Server;

use super::{normalize_bind_addr, NetworkAdapter};

const DATAGRAM_BUFFER: usize = 64 * 1024;

#[derive(Default)]
pub(super) struct UdpAdapter {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl NetworkAdapter for UdpAdapter {
    async fn listen(&self, server: Arc<Server>, addr: &str) -> Result<(), ServerError> {
        let addr = normalize_bind_addr(addr);
        let socket = Arc::new(
            UdpSocket::bind(&addr)
                .await
                .map_err(|e| ServerError::Network(format!("udp bind {addr}: {e}")))?,
        );
        info!(%addr, "udp socket bound");

        let handle = tokio::spawn(async move {
            let mut buf = vec![0u8; DATAGRAM_BUFFER];
            loop {
                tokio::select! {
                    _ = server.cancelled() => return,
                    result = socket.recv_from(&mut buf) => {
                        let Ok((n, peer)) = result else { return };
                        let id = peer.to_string();
                        let conn = match server.get_online(&id) {
                            Some(conn) => conn,
                            None => {
                                let conn =
                                    Conn::new_datagram(&server, Arc::clone(&socket), peer);
                                server.register_conn(&conn);
                                conn
                            }
                        };
                        server.push_packet(&conn, 0, buf[..n].to_vec()).await;
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        Ok(())
    }

    async fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}
