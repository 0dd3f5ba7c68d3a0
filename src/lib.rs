//! # Meridian - Multi-Protocol Game Server Core
//!
//! A message dispatch engine for multiplayer game servers. Every
//! server-side event — inbound packets, ticker fires, blocking async work,
//! system tasks — flows through a pool of ordered, per-shunt processing
//! queues on top of a connection abstraction that unifies several wire
//! transports behind a single write pipeline.
//!
//! ## Architecture Overview
//!
//! * **Dispatcher fabric** — a dynamic set of named FIFO queues ("shunts"),
//!   each consumed by exactly one worker task. Work on one shunt executes
//!   strictly in enqueue order; the system as a whole runs shunts in
//!   parallel.
//! * **Message model** — a closed set of pooled message kinds with
//!   well-defined routing, coalescing and panic-recovery rules.
//! * **Connection write loop** — one serialized writer per connection,
//!   polymorphic over stream sockets, datagrams, WebSocket frames,
//!   reliable-UDP sessions and a gateway re-encapsulation mode.
//!
//! ## Message Flow
//!
//! 1. A transport driver accepts a connection and pushes inbound payloads
//!    through [`Server::push_packet`].
//! 2. The router classifies the message and selects a dispatcher: the
//!    connection's current shunt, or the reserved `"system"` shunt.
//! 3. The dispatcher worker drains its queue in order and invokes the
//!    registered [event hooks](Events).
//! 4. Handlers write responses through [`Conn::write`]; the connection's
//!    writer task drains the outbound batch onto the transport.
//!
//! ## Async Messages
//!
//! Blocking work never runs on a dispatcher worker. An async message is a
//! two-phase job: the `caller` executes in a bounded blocking pool, then a
//! callback message carrying the caller's error is dispatched back onto the
//! originating shunt, so the callback observes the shunt's serial context.
//! `Unique*` variants coalesce by string key: while a job with a given key
//! is in flight, further jobs with the same key are silently dropped.
//!
//! ## Example
//!
//! ```no_run
//! use meridian::{NetworkKind, Server, ServerConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let server = Server::new(NetworkKind::Websocket, ServerConfig::default());
//!     server.events().on_connection_receive_packet(|_srv, conn, packet| {
//!         // Echo everything back.
//!         conn.write(packet.clone());
//!     });
//!     if let Err(e) = server.run(":8888/ws").await {
//!         panic!("server failed: {e}");
//!     }
//! }
//! ```

pub mod config;
pub mod connection;
pub mod dispatcher;
pub mod error;
pub mod events;
pub mod gateway;
pub mod logging;
pub mod message;
pub mod network;
pub mod pool;
pub mod server;
pub mod stats;
pub mod ticker;
pub mod utils;

pub use config::{RunMode, ServerConfig, StatisticsConfig, TickerConfig};
pub use connection::{
    Conn, Packet, ReliableSession, TransportKind, WriteCallback, WEBSOCKET_BINARY,
    WEBSOCKET_CLOSE, WEBSOCKET_PING, WEBSOCKET_PONG, WEBSOCKET_TEXT,
};
pub use dispatcher::SYSTEM_SHUNT;
pub use error::ServerError;
pub use events::Events;
pub use gateway::{GatewayFrame, FRAME_TERMINATOR};
pub use message::{ErrorAction, Message, MessageKind};
pub use network::NetworkKind;
pub use server::Server;
pub use ticker::Ticker;

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};
    use tokio::sync::oneshot;
    use tokio::time::{sleep, timeout, Duration};

    /// Boots a `NetworkKind::None` server and waits until `StartFinish`.
    async fn start_server(config: ServerConfig) -> (Arc<Server>, tokio::task::JoinHandle<()>) {
        let server = Server::new(NetworkKind::None, config);
        let (tx, rx) = oneshot::channel();
        let tx = Mutex::new(Some(tx));
        server.events().on_start_finish(move |_srv| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(());
            }
        });
        let handle = {
            let server = Arc::clone(&server);
            tokio::spawn(async move {
                server.run("").await.expect("server run failed");
            })
        };
        timeout(Duration::from_secs(5), rx)
            .await
            .expect("startup timed out")
            .expect("start finish never fired");
        (server, handle)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn system_messages_execute_in_order() {
        let (server, handle) = start_server(ServerConfig::default()).await;
        let log = Arc::new(Mutex::new(Vec::new()));

        for i in 0..16 {
            let log = log.clone();
            server
                .push_system_message(move || log.lock().unwrap().push(i))
                .await;
        }

        timeout(Duration::from_secs(2), async {
            while log.lock().unwrap().len() < 16 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("system messages never drained");

        assert_eq!(*log.lock().unwrap(), (0..16).collect::<Vec<_>>());
        server.shutdown();
        handle.await.expect("run task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn exec_before_veto_drops_messages() {
        let (server, handle) = start_server(ServerConfig::default()).await;
        let executed = Arc::new(AtomicUsize::new(0));

        server
            .events()
            .on_message_exec_before(|_srv, msg| msg.kind() != MessageKind::Ticker);

        let counter = executed.clone();
        server
            .push_ticker_message("dropped", move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;
        let counter = executed.clone();
        server
            .push_system_message(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        timeout(Duration::from_secs(2), async {
            while executed.load(Ordering::SeqCst) < 1 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("system message never ran");
        // A short grace period to catch the vetoed ticker sneaking through.
        sleep(Duration::from_millis(100)).await;
        assert_eq!(executed.load(Ordering::SeqCst), 1);

        server.shutdown();
        handle.await.expect("run task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn panicking_handler_reaches_message_error_hook() {
        let (server, handle) = start_server(ServerConfig::default()).await;
        let errors = Arc::new(Mutex::new(Vec::new()));

        let sink = errors.clone();
        server.events().on_message_error(move |_srv, _msg, err| {
            sink.lock().unwrap().push(err.to_string());
        });

        server.push_system_message(|| panic!("handler exploded")).await;

        // The dispatcher survives the panic and keeps processing.
        let alive = Arc::new(AtomicUsize::new(0));
        let counter = alive.clone();
        server
            .push_system_message(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            })
            .await;

        timeout(Duration::from_secs(2), async {
            while alive.load(Ordering::SeqCst) == 0 {
                sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("dispatcher died after a handler panic");

        let seen = errors.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert!(seen[0].contains("handler exploded"), "got {:?}", *seen);

        server.shutdown();
        handle.await.expect("run task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn gateway_write_reframes_through_upstream() {
        let (server, handle) = start_server(ServerConfig::default()).await;
        let captured = Arc::new(Mutex::new(Vec::new()));

        let sink = captured.clone();
        server
            .events()
            .on_connection_write_packet_before(move |_srv, _conn, packet| {
                sink.lock().unwrap().push(packet.clone());
                packet
            });

        let upstream = Conn::empty(&server);
        let gw = Conn::gateway(&upstream, "c-17");
        assert_eq!(gw.transport_kind(), TransportKind::GatewayProxy);
        assert_eq!(gw.id(), "c-17");

        gw.write(Packet::with_frame(2, vec![0x01, 0x02]));

        let captured = captured.lock().unwrap();
        assert_eq!(captured.len(), 1, "upstream must see exactly one packet");
        let frame = gateway::decode(&captured[0].data).expect("valid gateway frame");
        assert_eq!(frame.conn_id, "c-17");
        assert_eq!(frame.frame, 2);
        assert_eq!(frame.data, vec![0x01, 0x02]);
        assert!(frame.timestamp > 0);

        server.shutdown();
        handle.await.expect("run task panicked");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn out_of_range_compression_fails_run() {
        let server = Server::new(
            NetworkKind::None,
            ServerConfig {
                websocket_compression: 10,
                ..Default::default()
            },
        );
        let err = server
            .run("")
            .await
            .expect_err("invalid compression level must fail run");
        assert!(matches!(err, ServerError::Construction(_)), "got {err}");
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn ticker_requires_configuration() {
        let server = Server::new(NetworkKind::None, ServerConfig::default());
        assert!(matches!(
            server.ticker(),
            Err(ServerError::TickerUnsupported)
        ));

        let server = Server::new(
            NetworkKind::None,
            ServerConfig {
                ticker: Some(TickerConfig::default()),
                ..Default::default()
            },
        );
        assert!(server.ticker().is_ok());
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn online_table_tracks_connections() {
        let (server, handle) = start_server(ServerConfig::default()).await;
        assert_eq!(server.get_online_count(), 0);

        let conn = Conn::empty(&server);
        assert!(!conn.is_closed());
        assert_eq!(conn.id(), "0.0.0.0:0");
        assert_eq!(conn.ip(), "0.0.0.0");

        conn.set_data("slot", serde_json::json!(7));
        assert_eq!(conn.get_data("slot"), Some(serde_json::json!(7)));
        conn.release_data();
        assert_eq!(conn.get_data("slot"), None);

        server.shutdown();
        handle.await.expect("run task panicked");
    }
}
