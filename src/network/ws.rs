//! WebSocket driver.
//!
//! The listen address carries the upgrade path (`":8888/ws"`); upgrade
//! requests for any other path are rejected with 404. Inbound frames are
//! mapped to the stable frame-kind integers, checked against the configured
//! allow-list and pushed into the core. The configured read deadline bounds
//! every single read.

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use futures::StreamExt;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_tungstenite::accept_hdr_async;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::http::StatusCode;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tracing::{error, info, warn};

use crate::connection::{
    Conn, WEBSOCKET_BINARY, WEBSOCKET_PING, WEBSOCKET_PONG, WEBSOCKET_TEXT,
};
use crate::error::ServerError;
use crate::server::Server;

use super::{normalize_bind_addr, NetworkAdapter};

#[derive(Default)]
pub(super) struct WebsocketAdapter {
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Splits `":8888/ws"` into the bind address and the upgrade path.
fn split_addr(addr: &str) -> (String, String) {
    match addr.find('/') {
        Some(idx) => (
            normalize_bind_addr(&addr[..idx]),
            addr[idx..].to_string(),
        ),
        None => (normalize_bind_addr(addr), "/".to_string()),
    }
}

#[async_trait]
impl NetworkAdapter for WebsocketAdapter {
    async fn listen(&self, server: Arc<Server>, addr: &str) -> Result<(), ServerError> {
        let (bind, path) = split_addr(addr);
        let listener = TcpListener::bind(&bind)
            .await
            .map_err(|e| ServerError::Network(format!("websocket bind {bind}: {e}")))?;
        info!(%bind, %path, "websocket listener bound");

        let handle = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        let server = Arc::clone(&server);
                        let path = path.clone();
                        tokio::spawn(async move {
                            let check_path = |req: &Request, resp: Response| {
                                if req.uri().path() == path {
                                    Ok(resp)
                                } else {
                                    let mut reject = ErrorResponse::new(None);
                                    *reject.status_mut() = StatusCode::NOT_FOUND;
                                    Err(reject)
                                }
                            };
                            let ws = match accept_hdr_async(stream, check_path).await {
                                Ok(ws) => ws,
                                Err(e) => {
                                    warn!(%peer, error = %e, "websocket handshake failed");
                                    return;
                                }
                            };
                            let (sink, stream) = ws.split();
                            let conn =
                                Conn::new_websocket(&server, sink, peer.to_string());
                            server.register_conn(&conn);
                            read_loop(server, conn, stream).await;
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "websocket accept failed");
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

async fn read_loop(
    server: Arc<Server>,
    conn: Arc<Conn>,
    mut stream: futures::stream::SplitStream<
        tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    >,
) {
    let deadline = server.config().websocket_read_deadline;
    loop {
        let next = async {
            match deadline {
                Some(window) => match timeout(window, stream.next()).await {
                    Ok(item) => Ok(item),
                    Err(_) => Err(()),
                },
                None => Ok(stream.next().await),
            }
        };

        let item = tokio::select! {
            _ = server.cancelled() => {
                conn.close().await;
                return;
            }
            item = next => item,
        };

        let msg = match item {
            Err(()) => {
                let err = anyhow::Error::new(ServerError::TransportRead(
                    "websocket read deadline exceeded".to_string(),
                ));
                server.disconnect_conn(&conn, Some(err)).await;
                return;
            }
            Ok(None) => {
                server.disconnect_conn(&conn, None).await;
                return;
            }
            Ok(Some(Err(e))) => {
                let err =
                    anyhow::Error::new(ServerError::TransportRead(e.to_string()));
                server.disconnect_conn(&conn, Some(err)).await;
                return;
            }
            Ok(Some(Ok(msg))) => msg,
        };

        let (frame, data) = match msg {
            WsMessage::Text(text) => (WEBSOCKET_TEXT, text.into_bytes()),
            WsMessage::Binary(data) => (WEBSOCKET_BINARY, data),
            WsMessage::Ping(data) => (WEBSOCKET_PING, data),
            WsMessage::Pong(data) => (WEBSOCKET_PONG, data),
            WsMessage::Close(_) => {
                server.disconnect_conn(&conn, None).await;
                return;
            }
            WsMessage::Frame(_) => continue,
        };

        if let Some(allow) = &server.config().websocket_frame_allow {
            if !allow.contains(&frame) {
                warn!(
                    conn = %conn.id(),
                    error = %ServerError::IllegalFrameKind(frame),
                    "frame dropped"
                );
                continue;
            }
        }

        server.push_packet(&conn, frame, data).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn addr_splits_into_bind_and_path() {
        assert_eq!(
            split_addr(":8888/ws"),
            ("0.0.0.0:8888".to_string(), "/ws".to_string())
        );
        assert_eq!(
            split_addr("127.0.0.1:9000/game/ws"),
            ("127.0.0.1:9000".to_string(), "/game/ws".to_string())
        );
        assert_eq!(
            split_addr(":8888"),
            ("0.0.0.0:8888".to_string(), "/".to_string())
        );
    }
}
