//! Stream-socket drivers: TCP and UNIX.
//!
//! Raw stream transports have no framing of their own; each successful read
//! is handed to the core as one packet with frame kind `0`.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::AsyncReadExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::connection::Conn;
use crate::error::ServerError;
use crate::server::Server;

use super::{normalize_bind_addr, NetworkAdapter};

const READ_BUFFER: usize = 4096;

#[derive(Default)]
pub(super) struct TcpAdapter {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

#[async_trait]
impl NetworkAdapter for TcpAdapter {
    async fn listen(&self, server: Arc<Server>, addr: &str) -> Result<(), ServerError> {
        let addr = normalize_bind_addr(addr);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|e| ServerError::Network(format!("tcp bind {addr}: {e}")))?;
        info!(%addr, "tcp listener bound");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        tokio::spawn(async move {
                            let (mut read_half, write_half) = stream.into_split();
                            let conn =
                                Conn::new_stream(&server, write_half, peer.to_string());
                            server.register_conn(&conn);

                            let mut buf = vec![0u8; READ_BUFFER];
                            loop {
                                tokio::select! {
                                    _ = server.cancelled() => {
                                        conn.close().await;
                                        return;
                                    }
                                    result = read_half.read(&mut buf) => match result {
                                        Ok(0) => {
                                            server.disconnect_conn(&conn, None).await;
                                            return;
                                        }
                                        Ok(n) => {
                                            server.push_packet(&conn, 0, buf[..n].to_vec()).await;
                                        }
                                        Err(e) => {
                                            let err = anyhow::Error::new(
                                                ServerError::TransportRead(e.to_string()),
                                            );
                                            server.disconnect_conn(&conn, Some(err)).await;
                                            return;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "tcp accept failed");
                        break;
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

#[derive(Default)]
pub(super) struct UnixAdapter {
    tasks: Mutex<Vec<JoinHandle<()>>>,
    conn_seq: Arc<AtomicU64>,
}

#[async_trait]
impl NetworkAdapter for UnixAdapter {
    #[cfg(unix)]
    async fn listen(&self, server: Arc<Server>, addr: &str) -> Result<(), ServerError> {
        use tokio::net::UnixListener;

        let path = addr.to_string();
        let listener = UnixListener::bind(&path)
            .map_err(|e| ServerError::Network(format!("unix bind {path}: {e}")))?;
        info!(%path, "unix listener bound");

        let conn_seq = Arc::clone(&self.conn_seq);
        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, _peer)) => {
                        let server = Arc::clone(&server);
                        // UNIX peers are usually unnamed; synthesize a stable
                        // id from the socket path and an accept sequence.
                        let id = format!("{path}#{}", conn_seq.fetch_add(1, Ordering::SeqCst));
                        tokio::spawn(async move {
                            let (mut read_half, write_half) = stream.into_split();
                            let conn = Conn::new_unix_stream(&server, write_half, id);
                            server.register_conn(&conn);

                            let mut buf = vec![0u8; READ_BUFFER];
                            loop {
                                tokio::select! {
                                    _ = server.cancelled() => {
                                        conn.close().await;
                                        return;
                                    }
                                    result = read_half.read(&mut buf) => match result {
                                        Ok(0) => {
                                            server.disconnect_conn(&conn, None).await;
                                            return;
                                        }
                                        Ok(n) => {
                                            server.push_packet(&conn, 0, buf[..n].to_vec()).await;
                                        }
                                        Err(e) => {
                                            let err = anyhow::Error::new(
                                                ServerError::TransportRead(e.to_string()),
                                            );
                                            server.disconnect_conn(&conn, Some(err)).await;
                                            return;
                                        }
                                    }
                                }
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "unix accept failed");
                        break;
                    }
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            tasks.push(handle);
        }
        Ok(())
    }

    #[cfg(not(unix))]
    async fn listen(&self, _server: Arc<Server>, _addr: &str) -> Result<(), ServerError> {
        Err(ServerError::UnsupportedNetwork(super::NetworkKind::Unix))
    }

    async fn stop(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for handle in tasks.drain(..) {
                handle.abort();
            }
        }
    }
}
