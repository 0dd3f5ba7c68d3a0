//! End-to-end tests for the dispatch fabric and the transports.
//!
//! These boot real servers (mostly `NetworkKind::None`, one real WebSocket
//! listener) and verify the externally observable guarantees: per-shunt
//! ordering, unique coalescing, shunt migration, the deadlock watchdog and
//! graceful shutdown draining.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::{SinkExt, StreamExt};
use meridian::{
    Conn, MessageKind, NetworkKind, Packet, Server, ServerConfig, TickerConfig,
};
use tokio::sync::oneshot;
use tokio::time::{sleep, timeout, Duration};
use tokio_tungstenite::tungstenite::Message as WsMessage;

/// Boots a server and waits for `StartFinish` before returning.
async fn start_server(
    kind: NetworkKind,
    addr: &str,
    config: ServerConfig,
) -> (Arc<Server>, tokio::task::JoinHandle<()>) {
    let server = Server::new(kind, config);
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    server.events().on_start_finish(move |_srv| {
        if let Some(tx) = tx.lock().unwrap().take() {
            let _ = tx.send(());
        }
    });
    let handle = {
        let server = Arc::clone(&server);
        let addr = addr.to_string();
        tokio::spawn(async move {
            server.run(addr).await.expect("server run failed");
        })
    };
    timeout(Duration::from_secs(5), rx)
        .await
        .expect("startup timed out")
        .expect("start finish never fired");
    (server, handle)
}

async fn wait_until(what: &str, check: impl Fn() -> bool) {
    timeout(Duration::from_secs(5), async {
        while !check() {
            sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for {what}"));
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_echo_round_trip() {
    let (server, handle) = start_server(
        NetworkKind::Websocket,
        "127.0.0.1:19831/ws",
        ServerConfig::default(),
    )
    .await;

    server
        .events()
        .on_connection_receive_packet(|_srv, conn, packet| {
            conn.write(packet.clone());
        });

    let (mut client, _) = tokio_tungstenite::connect_async("ws://127.0.0.1:19831/ws")
        .await
        .expect("client connect failed");
    client
        .send(WsMessage::Text("ping".to_string()))
        .await
        .expect("client send failed");

    let reply = timeout(Duration::from_secs(2), client.next())
        .await
        .expect("echo timed out")
        .expect("stream ended")
        .expect("read failed");
    assert_eq!(reply, WsMessage::Text("ping".to_string()));

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn websocket_upgrade_path_is_enforced() {
    let (server, handle) = start_server(
        NetworkKind::Websocket,
        "127.0.0.1:19832/game",
        ServerConfig::default(),
    )
    .await;

    let wrong = tokio_tungstenite::connect_async("ws://127.0.0.1:19832/other").await;
    assert!(wrong.is_err(), "upgrade on the wrong path must be rejected");

    let right = tokio_tungstenite::connect_async("ws://127.0.0.1:19832/game").await;
    assert!(right.is_ok(), "upgrade on the configured path must succeed");

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn unique_async_coalesces_by_key() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let callers = Arc::new(AtomicUsize::new(0));
    let callbacks = Arc::new(AtomicUsize::new(0));
    let callback_errs = Arc::new(Mutex::new(Vec::new()));

    for _ in 0..5 {
        let callers = callers.clone();
        let callbacks = callbacks.clone();
        let errs = callback_errs.clone();
        server
            .push_unique_async_message(
                "K",
                move || {
                    callers.fetch_add(1, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(50));
                    Ok(())
                },
                move |err| {
                    errs.lock().unwrap().push(err.is_none());
                    callbacks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
    }

    wait_until("the surviving callback", || {
        callbacks.load(Ordering::SeqCst) >= 1
    })
    .await;
    // Grace period: any wrongly surviving duplicate would land here.
    sleep(Duration::from_millis(200)).await;

    assert_eq!(callers.load(Ordering::SeqCst), 1, "exactly one caller runs");
    assert_eq!(callbacks.load(Ordering::SeqCst), 1, "exactly one callback runs");
    assert_eq!(*callback_errs.lock().unwrap(), vec![true], "caller error is None");

    // After the callback the key is free again.
    let callers2 = callers.clone();
    server
        .push_unique_async_message("K", move || {
            callers2.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }, |_| {})
        .await;
    wait_until("the key to be accepted again", || {
        callers.load(Ordering::SeqCst) == 2
    })
    .await;

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn shunt_migration_preserves_order_and_closes_empty_shunt() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let closed_shunts = Arc::new(Mutex::new(Vec::new()));
    let sink = closed_shunts.clone();
    server.events().on_shunt_channel_closed(move |_srv, name| {
        sink.lock().unwrap().push(name.to_string());
    });

    let conn = Conn::empty(&server);
    server.use_shunt(&conn, "A");
    assert!(server.has_shunt("A"));
    assert_eq!(server.get_conn_curr_shunt(&conn), "A");

    let log = Arc::new(Mutex::new(Vec::new()));
    let p1 = log.clone();
    server
        .push_shunt_message(&conn, move || p1.lock().unwrap().push("P1"))
        .await;

    server.use_shunt(&conn, "B");
    let p2 = log.clone();
    server
        .push_shunt_message(&conn, move || p2.lock().unwrap().push("P2"))
        .await;

    wait_until("both packets", || log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["P1", "P2"]);

    assert!(!server.has_shunt("A"), "emptied shunt must be torn down");
    assert!(server.has_shunt("B"));
    assert_eq!(server.get_conn_curr_shunt(&conn), "B");
    assert!(closed_shunts.lock().unwrap().contains(&"A".to_string()));

    // Re-attaching to the same shunt is a no-op.
    server.use_shunt(&conn, "B");
    assert_eq!(server.get_shunt_num(), 1);

    server.release_shunt(&conn);
    assert!(!server.has_shunt("B"));
    assert_eq!(server.get_conn_curr_shunt(&conn), "system");

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn shunt_async_callback_resynchronizes_on_the_shunt() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let conn = Conn::empty(&server);
    server.use_shunt(&conn, "lane");

    // The callback must be serialized with other work on the shunt: a
    // shunt message pushed after the callback message cannot run before it.
    let log = Arc::new(Mutex::new(Vec::new()));
    let (done_tx, done_rx) = oneshot::channel();
    let done_tx = Mutex::new(Some(done_tx));

    let cb_log = log.clone();
    server
        .push_shunt_async_message(
            &conn,
            || {
                std::thread::sleep(Duration::from_millis(30));
                Ok(())
            },
            move |err| {
                assert!(err.is_none());
                cb_log.lock().unwrap().push("callback");
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            },
        )
        .await;

    timeout(Duration::from_secs(2), done_rx)
        .await
        .expect("callback timed out")
        .expect("callback dropped");

    let after_log = log.clone();
    server
        .push_shunt_message(&conn, move || after_log.lock().unwrap().push("after"))
        .await;
    wait_until("the trailing shunt message", || log.lock().unwrap().len() == 2).await;
    assert_eq!(*log.lock().unwrap(), vec!["callback", "after"]);

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn shunt_async_callback_survives_migration_to_another_shunt() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let conn = Conn::empty(&server);
    server.use_shunt(&conn, "A");

    let log = Arc::new(Mutex::new(Vec::new()));
    let cb_log = log.clone();
    server
        .push_shunt_async_message(
            &conn,
            || {
                std::thread::sleep(Duration::from_millis(150));
                Ok(())
            },
            move |err| {
                assert!(err.is_none());
                cb_log.lock().unwrap().push("callback");
            },
        )
        .await;

    // Let the caller enter the pool, then migrate while it is in flight.
    sleep(Duration::from_millis(30)).await;
    server.use_shunt(&conn, "B");
    assert!(
        server.has_shunt("A"),
        "a shunt with outstanding async work stays registered"
    );
    assert_eq!(server.get_conn_curr_shunt(&conn), "B");

    // Park B's worker; a callback wrongly routed through the connection's
    // current shunt would have to wait behind it.
    let blocker_log = log.clone();
    server
        .push_shunt_message(&conn, move || {
            std::thread::sleep(Duration::from_millis(800));
            blocker_log.lock().unwrap().push("b-done");
        })
        .await;

    wait_until("the callback and the blocker", || log.lock().unwrap().len() == 2).await;
    assert_eq!(
        *log.lock().unwrap(),
        vec!["callback", "b-done"],
        "the callback resynchronizes on its original dispatcher, not the migrated shunt"
    );

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn deadlock_watchdog_fires_once_and_is_diagnostic_only() {
    let (server, handle) = start_server(
        NetworkKind::None,
        "",
        ServerConfig {
            deadlock_detect: Some(Duration::from_millis(50)),
            ..Default::default()
        },
    )
    .await;

    let suspicions = Arc::new(Mutex::new(Vec::new()));
    let sink = suspicions.clone();
    server
        .events()
        .on_deadlock_detect(move |_srv, kind, _summary| {
            sink.lock().unwrap().push(kind);
        });

    let finished = Arc::new(AtomicUsize::new(0));
    let counter = finished.clone();
    server
        .push_system_message(move || {
            std::thread::sleep(Duration::from_millis(200));
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;

    wait_until("the slow handler to finish", || {
        finished.load(Ordering::SeqCst) == 1
    })
    .await;
    assert_eq!(
        *suspicions.lock().unwrap(),
        vec![MessageKind::System],
        "the watchdog fires exactly once for the slow message"
    );

    // Subsequent messages process normally and stay quiet.
    let counter = finished.clone();
    server
        .push_system_message(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        })
        .await;
    wait_until("the follow-up message", || finished.load(Ordering::SeqCst) == 2).await;
    sleep(Duration::from_millis(100)).await;
    assert_eq!(suspicions.lock().unwrap().len(), 1);

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn graceful_shutdown_drains_in_flight_async_work() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let stops = Arc::new(AtomicUsize::new(0));
    let stop_counter = stops.clone();
    server.events().on_stop(move |_srv| {
        stop_counter.fetch_add(1, Ordering::SeqCst);
    });

    let callbacks = Arc::new(AtomicUsize::new(0));
    for _ in 0..100 {
        let callbacks = callbacks.clone();
        server
            .push_async_message(
                || {
                    std::thread::sleep(Duration::from_millis(20));
                    Ok(())
                },
                move |_err| {
                    callbacks.fetch_add(1, Ordering::SeqCst);
                },
            )
            .await;
    }

    server.shutdown();
    timeout(Duration::from_secs(10), handle)
        .await
        .expect("shutdown never completed")
        .expect("run task panicked");

    assert_eq!(
        callbacks.load(Ordering::SeqCst),
        100,
        "every in-flight callback executes before run returns"
    );
    assert_eq!(server.get_message_count(), 0, "in-flight counter drains to zero");
    assert_eq!(stops.load(Ordering::SeqCst), 1, "Stop fires exactly once");
}

#[tokio::test(flavor = "multi_thread")]
async fn ticker_messages_flow_through_the_system_shunt() {
    let (server, handle) = start_server(
        NetworkKind::None,
        "",
        ServerConfig {
            ticker: Some(TickerConfig::default()),
            ..Default::default()
        },
    )
    .await;

    let fires = Arc::new(AtomicUsize::new(0));
    let counter = fires.clone();
    server
        .ticker()
        .expect("ticker configured")
        .every("heartbeat", Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

    wait_until("a few ticker fires", || fires.load(Ordering::SeqCst) >= 3).await;
    server.ticker().expect("ticker configured").stop("heartbeat");
    let settled = fires.load(Ordering::SeqCst);
    sleep(Duration::from_millis(100)).await;
    assert!(
        fires.load(Ordering::SeqCst) <= settled + 1,
        "a stopped ticker must not keep firing"
    );

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn reuse_inherits_identity_and_state() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let original = Conn::empty(&server);
    let reconnected = Conn::empty(&server);
    reconnected.set_data("session", serde_json::json!("s-42"));

    original.reuse(&reconnected).await;

    assert_eq!(
        original.get_data("session"),
        Some(serde_json::json!("s-42")),
        "user data moves to the reused connection"
    );
    assert_eq!(reconnected.get_data("session"), None);

    // The reused connection keeps accepting writes.
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    original.write_with_callback(
        Packet::new(b"hello again".to_vec()),
        Box::new(move |err| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(err.is_none());
            }
        }),
    );
    let ok = timeout(Duration::from_secs(2), rx)
        .await
        .expect("write after reuse timed out")
        .expect("write callback dropped");
    assert!(ok);

    server.shutdown();
    handle.await.expect("run task panicked");
}

#[tokio::test(flavor = "multi_thread")]
async fn write_with_callback_reports_transport_result() {
    let (server, handle) =
        start_server(NetworkKind::None, "", ServerConfig::default()).await;

    let conn = Conn::empty(&server);
    let (tx, rx) = oneshot::channel();
    let tx = Mutex::new(Some(tx));
    conn.write_with_callback(
        Packet::new(b"hello".to_vec()),
        Box::new(move |err| {
            if let Some(tx) = tx.lock().unwrap().take() {
                let _ = tx.send(err.is_none());
            }
        }),
    );

    let ok = timeout(Duration::from_secs(2), rx)
        .await
        .expect("write callback timed out")
        .expect("write callback dropped");
    assert!(ok, "the empty transport accepts writes");

    server.shutdown();
    handle.await.expect("run task panicked");
}
