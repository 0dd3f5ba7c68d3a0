//! Server construction, startup, shutdown and introspection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::{Arc, OnceLock, RwLock, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::{watch, Notify, Semaphore};
use tokio::time::sleep;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::connection::Conn;
use crate::dispatcher::{Dispatcher, SYSTEM_SHUNT};
use crate::error::ServerError;
use crate::events::Events;
use crate::message::Message;
use crate::network::{adapter_for, NetworkAdapter, NetworkKind};
use crate::pool::Pool;
use crate::stats::MessageStatistics;
use crate::ticker::Ticker;

use super::registry::Registry;

/// Bounded pool for the blocking phase of async messages. The semaphore
/// bounds how many callers run at once; each caller executes on the blocking
/// thread pool so it may block freely.
pub(crate) struct AsyncPool {
    semaphore: Arc<Semaphore>,
}

impl AsyncPool {
    fn new(size: usize) -> Self {
        Self {
            semaphore: Arc::new(Semaphore::new(size)),
        }
    }

    /// Runs `task` once a pool slot frees up. During late shutdown the
    /// semaphore is closed; the task then runs without a slot rather than
    /// being lost, since in-flight accounting depends on it completing.
    pub(crate) async fn submit(
        &self,
        task: impl std::future::Future<Output = ()> + Send + 'static,
    ) {
        let permit = self.semaphore.clone().acquire_owned().await.ok();
        tokio::spawn(async move {
            task.await;
            drop(permit);
        });
    }

    fn close(&self) {
        self.semaphore.close();
    }
}

/// The network server. Construct with [`Server::new`], feed it through the
/// `push_*` API and the shunt registry, and drive it with
/// [`run`](Server::run).
pub struct Server {
    kind: NetworkKind,
    config: ServerConfig,
    events: Events,
    adapter: Box<dyn NetworkAdapter>,
    online: DashMap<String, Arc<Conn>>,
    message_pool: Pool<Message>,
    pub(super) registry: RwLock<Registry>,
    pub(super) system: OnceLock<Dispatcher>,
    pub(crate) async_pool: Option<AsyncPool>,
    statistics: Option<MessageStatistics>,
    ticker: Option<Ticker>,
    pub(super) message_counter: AtomicI64,
    closed: AtomicBool,
    started: AtomicBool,
    addr: OnceLock<String>,
    shutdown_notify: Notify,
    cancel_tx: watch::Sender<bool>,
    done_tx: watch::Sender<bool>,
    weak: Weak<Server>,
}

impl Server {
    /// Creates a server for the given network kind. Configuration values
    /// are checked when [`run`](Self::run) is called.
    pub fn new(kind: NetworkKind, config: ServerConfig) -> Arc<Self> {
        let config = config.normalize();
        let (cancel_tx, _) = watch::channel(false);
        let (done_tx, _) = watch::channel(false);

        Arc::new_cyclic(|weak: &Weak<Server>| {
            let ticker = config
                .ticker
                .as_ref()
                .map(|tc| Ticker::new(weak.clone(), tc));
            let statistics = config.statistics.as_ref().map(MessageStatistics::new);
            let async_pool = if config.disable_async {
                None
            } else {
                Some(AsyncPool::new(config.async_pool_size))
            };
            let message_pool = Pool::new(config.message_pool_size, Message::default, |msg| {
                msg.reset();
            });

            Self {
                kind,
                adapter: adapter_for(kind),
                events: Events::default(),
                online: DashMap::new(),
                message_pool,
                registry: RwLock::new(Registry {
                    dispatchers: HashMap::new(),
                    members: HashMap::new(),
                    curr: HashMap::new(),
                }),
                system: OnceLock::new(),
                async_pool,
                statistics,
                ticker,
                message_counter: AtomicI64::new(0),
                closed: AtomicBool::new(false),
                started: AtomicBool::new(false),
                addr: OnceLock::new(),
                shutdown_notify: Notify::new(),
                cancel_tx,
                done_tx,
                weak: weak.clone(),
                config,
            }
        })
    }

    /// The hook table; register event handlers here.
    pub fn events(&self) -> &Events {
        &self.events
    }

    /// The configuration the server was built with.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    /// The configured network kind.
    pub fn kind(&self) -> NetworkKind {
        self.kind
    }

    /// The address the server was started with, if it is running.
    pub fn addr(&self) -> Option<&str> {
        self.addr.get().map(String::as_str)
    }

    /// The server ticker, when ticker support was configured.
    pub fn ticker(&self) -> Result<&Ticker, ServerError> {
        self.ticker.as_ref().ok_or(ServerError::TickerUnsupported)
    }

    pub(crate) fn arc(&self) -> Option<Arc<Server>> {
        self.weak.upgrade()
    }

    /// Runs the server on `addr` until shutdown.
    ///
    /// Address forms: `":8888"` for socket networks, a filesystem path for
    /// UNIX sockets, `":8888/ws"` for WebSocket, and the empty string for
    /// [`NetworkKind::None`].
    ///
    /// Startup: message pool and system dispatcher come up first and
    /// `MessageReady` fires; the network adapter then binds and
    /// `StartFinish` marks the point where traffic may flow. SIGHUP, SIGINT,
    /// SIGQUIT and SIGTERM all initiate a graceful shutdown, as does
    /// [`shutdown`](Self::shutdown).
    pub async fn run(self: &Arc<Self>, addr: impl Into<String>) -> Result<(), ServerError> {
        let addr = addr.into();
        self.config.validate()?;
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(ServerError::Construction(
                "server is already running".to_string(),
            ));
        }
        let _ = self.addr.set(addr.clone());
        self.events.emit_start_before(self);

        // Message system first: dispatch must be live before any packet.
        let system = Dispatcher::new(self.config.dispatcher_buffer_size, SYSTEM_SHUNT);
        self.system
            .set(system.clone())
            .map_err(|_| ServerError::Construction("message system already initialized".into()))?;
        self.spawn_worker(system);
        self.start_statistics_rotation();
        self.events.emit_message_ready(self);

        self.adapter.listen(Arc::clone(self), &addr).await?;

        info!("====================================================================");
        info!(network = %self.kind, listen = %addr, "🚀 server running");
        info!("====================================================================");
        self.events.emit_start_finish(self);

        if let Some(life) = self.config.limit_life {
            let server = Arc::clone(self);
            tokio::spawn(async move {
                sleep(life).await;
                warn!("server lifetime limit reached");
                server.shutdown();
            });
        }

        self.wait_for_trigger().await;
        self.shutdown_internal(None).await;
        self.wait_done().await;
        Ok(())
    }

    /// Shorthand for `run("")`, for [`NetworkKind::None`] servers.
    pub async fn run_none(self: &Arc<Self>) -> Result<(), ServerError> {
        self.run("").await
    }

    /// Spawns the consumer worker for a dispatcher.
    pub(super) fn spawn_worker(&self, dispatcher: Dispatcher) {
        let Some(server) = self.arc() else { return };
        tokio::spawn(dispatcher.start(move |d, msg| {
            let server = Arc::clone(&server);
            async move {
                server.dispatch_message(d, msg).await;
            }
        }));
    }

    fn start_statistics_rotation(&self) {
        let Some(stats) = &self.statistics else { return };
        let period = stats.duration();
        let Some(server) = self.arc() else { return };
        tokio::spawn(async move {
            let mut timer = tokio::time::interval_at(
                tokio::time::Instant::now() + period,
                period,
            );
            loop {
                tokio::select! {
                    _ = server.cancelled() => return,
                    _ = timer.tick() => {
                        if let Some(stats) = &server.statistics {
                            stats.rotate();
                        }
                    }
                }
            }
        });
    }

    /// Waits for a termination signal, a [`shutdown`](Self::shutdown) call,
    /// or a shutdown completed elsewhere (e.g. an `Error` message).
    async fn wait_for_trigger(&self) {
        let mut done_rx = self.done_tx.subscribe();
        let done = async move {
            while !*done_rx.borrow() {
                if done_rx.changed().await.is_err() {
                    break;
                }
            }
        };

        #[cfg(unix)]
        {
            use tokio::signal::unix::{signal, SignalKind};

            let mut sighup =
                signal(SignalKind::hangup()).expect("Failed to create SIGHUP handler");
            let mut sigint =
                signal(SignalKind::interrupt()).expect("Failed to create SIGINT handler");
            let mut sigquit =
                signal(SignalKind::quit()).expect("Failed to create SIGQUIT handler");
            let mut sigterm =
                signal(SignalKind::terminate()).expect("Failed to create SIGTERM handler");

            tokio::select! {
                _ = sighup.recv() => info!("SIGHUP received - initiating graceful shutdown"),
                _ = sigint.recv() => info!("SIGINT received - initiating graceful shutdown"),
                _ = sigquit.recv() => info!("SIGQUIT received - initiating graceful shutdown"),
                _ = sigterm.recv() => info!("SIGTERM received - initiating graceful shutdown"),
                _ = self.shutdown_notify.notified() => {}
                _ = done => {}
            }
        }

        #[cfg(not(unix))]
        {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Ctrl+C received - initiating graceful shutdown");
                }
                _ = self.shutdown_notify.notified() => {}
                _ = done => {}
            }
        }
    }

    async fn wait_done(&self) {
        let mut done_rx = self.done_tx.subscribe();
        while !*done_rx.borrow() {
            if done_rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Requests a graceful shutdown; [`run`](Self::run) returns once every
    /// in-flight message has drained.
    pub fn shutdown(&self) {
        // notify_one stores a permit, so a shutdown requested before run
        // reaches its select is not lost.
        self.shutdown_notify.notify_one();
    }

    /// The actual teardown. Idempotent: only the first caller proceeds.
    ///
    /// Blocks until the in-flight message counter drains, then cancels the
    /// server context, stops the adapter, releases ticker and async pool,
    /// closes every dispatcher and fires `ShuntChannelClosed` for each. An
    /// error shutdown logs and panics for operator visibility after the
    /// teardown completed.
    pub(crate) async fn shutdown_internal(&self, err: Option<anyhow::Error>) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(e) = &err {
            error!(state = "shutdown", error = %e, "server shutting down on error");
        }

        while self.message_counter.load(Ordering::SeqCst) > 0 {
            info!(
                network = %self.kind,
                listen = self.addr().unwrap_or(""),
                state = "waiting",
                messages = self.message_counter.load(Ordering::SeqCst),
                "shutdown draining in-flight messages"
            );
            sleep(Duration::from_secs(1)).await;
        }

        self.events.emit_stop(self);
        let _ = self.cancel_tx.send(true);
        self.adapter.stop().await;

        if let Some(ticker) = &self.ticker {
            ticker.release();
        }
        if let Some(pool) = &self.async_pool {
            pool.close();
        }

        let drained: Vec<Dispatcher> = {
            let Ok(mut registry) = self.registry.write() else {
                return;
            };
            registry.curr.clear();
            registry.members.clear();
            registry.dispatchers.drain().map(|(_, d)| d).collect()
        };
        for dispatcher in drained {
            self.events.emit_shunt_channel_closed(self, dispatcher.name());
            dispatcher.close();
        }
        if let Some(system) = self.system.get() {
            system.close();
        }
        self.message_pool.close();

        match err {
            Some(e) => {
                error!(
                    network = %self.kind,
                    listen = self.addr().unwrap_or(""),
                    state = "exception",
                    error = %e,
                    "server shutdown"
                );
                let _ = self.done_tx.send(true);
                panic!("server shutdown with error: {e}");
            }
            None => {
                info!(
                    network = %self.kind,
                    listen = self.addr().unwrap_or(""),
                    state = "normal",
                    "server shutdown"
                );
                let _ = self.done_tx.send(true);
            }
        }
    }

    /// Whether shutdown has begun.
    pub fn is_shutdown(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// A receiver over the server context; flips to `true` at shutdown.
    pub fn context(&self) -> watch::Receiver<bool> {
        self.cancel_tx.subscribe()
    }

    /// Resolves once the server context is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.cancel_tx.subscribe();
        loop {
            if *rx.borrow() {
                return;
            }
            if rx.changed().await.is_err() {
                return;
            }
        }
    }

    /// Like [`cancelled`](Self::cancelled) with an upper bound; returns
    /// `true` when cancelled, `false` when the timeout won.
    pub async fn cancelled_timeout(&self, timeout: Duration) -> bool {
        tokio::time::timeout(timeout, self.cancelled()).await.is_ok()
    }

    // --- connection bookkeeping -------------------------------------------

    /// Registers a freshly accepted connection and fires the opened hooks.
    pub(crate) fn register_conn(&self, conn: &Arc<Conn>) {
        if self.is_shutdown() {
            return;
        }
        self.online.insert(conn.id(), Arc::clone(conn));
        self.events.emit_connection_opened(self, conn);
        self.events.emit_connection_opened_after(self, conn);
    }

    /// Closes and unregisters a connection, firing `ConnectionClosed` and
    /// releasing its shunt membership.
    pub(crate) async fn disconnect_conn(&self, conn: &Arc<Conn>, err: Option<anyhow::Error>) {
        conn.close().await;
        if self.online.remove(&conn.id()).is_none() {
            return;
        }
        self.events.emit_connection_closed(self, conn, err.as_ref());
        self.release_shunt(conn);
    }

    /// Number of online connections.
    pub fn get_online_count(&self) -> usize {
        self.online.len()
    }

    /// The online connection with the given id.
    pub fn get_online(&self, id: &str) -> Option<Arc<Conn>> {
        self.online.get(id).map(|entry| Arc::clone(entry.value()))
    }

    /// A snapshot of every online connection.
    pub fn get_online_all(&self) -> Vec<Arc<Conn>> {
        self.online
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Whether a connection with the given id is online.
    pub fn is_online(&self, id: &str) -> bool {
        self.online.contains_key(id)
    }

    /// Closes the online connection with the given id, if any.
    pub async fn close_conn(&self, id: &str) {
        if let Some(conn) = self.get_online(id) {
            self.disconnect_conn(&conn, None).await;
        }
    }

    // --- statistics --------------------------------------------------------

    /// In-flight message count: enqueued minus completed.
    pub fn get_message_count(&self) -> i64 {
        self.message_counter.load(Ordering::SeqCst)
    }

    /// Whether the statistics ring is enabled.
    pub fn has_message_statistics(&self) -> bool {
        self.statistics.is_some()
    }

    /// Message count in the current statistics window.
    pub fn get_duration_message_count(&self) -> i64 {
        self.get_duration_message_count_by_offset(0)
    }

    /// Message count `offset` windows ago; `0` is the current window.
    pub fn get_duration_message_count_by_offset(&self, offset: usize) -> i64 {
        self.statistics
            .as_ref()
            .map(|s| s.count_by_offset(offset))
            .unwrap_or(0)
    }

    /// Counts for every retained statistics window, current first.
    pub fn get_all_duration_message_count(&self) -> Vec<i64> {
        self.statistics
            .as_ref()
            .map(|s| s.all_counts())
            .unwrap_or_default()
    }

    pub(crate) fn hit_message_statistics(&self) {
        self.message_counter.fetch_add(1, Ordering::SeqCst);
        if let Some(stats) = &self.statistics {
            stats.hit();
        }
    }

    pub(crate) fn message_pool(&self) -> &Pool<Message> {
        &self.message_pool
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("network", &self.kind)
            .field("addr", &self.addr())
            .field("online", &self.online.len())
            .field("closed", &self.is_shutdown())
            .finish()
    }
}
