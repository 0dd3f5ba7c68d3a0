//! Message routing and execution.
//!
//! `push_message` classifies a pooled record, selects the target dispatcher
//! (the connection's current shunt for shunt-routed kinds, the system
//! dispatcher for everything else), applies unique-key coalescing and
//! enqueues. `dispatch_message` runs on the dispatcher worker: it arms the
//! deadlock watchdog, recovers panics into structured errors, tracks
//! low-exec costs and releases the record — unless the record is in flight
//! inside the async pool, where ownership travels with the job.

use std::backtrace::Backtrace;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{error, warn};

use crate::connection::{Conn, Packet};
use crate::dispatcher::Dispatcher;
use crate::message::{AsyncCallback, ErrorAction, Message, MessageKind};
use crate::utils::recover_transform;

use super::Server;

/// Sync handlers over this cost log a low-exec warning.
const LOW_EXEC_SYNC: Duration = Duration::from_millis(100);
/// Async callers over this cost log a low-exec warning.
const LOW_EXEC_ASYNC: Duration = Duration::from_secs(1);

/// Decrements a dispatcher's wait counter when dropped, whether the
/// synthesized callback executed or was discarded unexecuted.
struct WaitGuard(Dispatcher);

impl Drop for WaitGuard {
    fn drop(&mut self) {
        self.0.wait_add(-1);
    }
}

impl Server {
    // --- push API ----------------------------------------------------------

    /// Pushes an inbound packet from a transport.
    ///
    /// `frame` is transport-specific: a WebSocket opcode for WebSocket
    /// connections, `0` elsewhere.
    pub async fn push_packet(&self, conn: &Arc<Conn>, frame: i32, data: Vec<u8>) {
        let warn_size = self.config().packet_warn_size;
        if warn_size > 0 && data.len() > warn_size {
            warn!(
                conn = %conn.id(),
                size = data.len(),
                warn_size,
                "oversized packet received"
            );
        }
        let msg = self
            .message_pool()
            .get()
            .cast_to_packet(Arc::clone(conn), Packet { frame, data });
        self.push_message(msg).await;
    }

    /// Pushes a handler to run on the system shunt.
    pub async fn push_system_message(&self, handler: impl FnOnce() + Send + 'static) {
        let msg = self.message_pool().get().cast_to_system(Box::new(handler));
        self.push_message(msg).await;
    }

    /// Pushes a handler to run on `conn`'s current shunt.
    pub async fn push_shunt_message(
        &self,
        conn: &Arc<Conn>,
        handler: impl FnOnce() + Send + 'static,
    ) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_shunt(Arc::clone(conn), Box::new(handler));
        self.push_message(msg).await;
    }

    /// Pushes a labeled ticker fire onto the system shunt.
    pub async fn push_ticker_message(&self, name: &str, handler: impl FnOnce() + Send + 'static) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_ticker(name.to_string(), Box::new(handler));
        self.push_message(msg).await;
    }

    /// Pushes a labeled ticker fire onto `conn`'s current shunt.
    pub async fn push_shunt_ticker_message(
        &self,
        conn: &Arc<Conn>,
        name: &str,
        handler: impl FnOnce() + Send + 'static,
    ) {
        let msg = self.message_pool().get().cast_to_shunt_ticker(
            Arc::clone(conn),
            name.to_string(),
            Box::new(handler),
        );
        self.push_message(msg).await;
    }

    /// Pushes a two-phase async job: `caller` runs in the async pool (it may
    /// block), then `callback` observes the caller's error back on the
    /// system shunt.
    ///
    /// The caller should hold only the blocking part of the work; everything
    /// touching shared state belongs in the callback, where the shunt's
    /// serial context applies.
    pub async fn push_async_message(
        &self,
        caller: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_async(Box::new(caller), Some(Box::new(callback)));
        self.push_message(msg).await;
    }

    /// Pushes a callback-only async message onto the system shunt.
    pub async fn push_async_callback_message(
        &self,
        err: Option<anyhow::Error>,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        self.push_async_callback_boxed(err, Box::new(callback)).await;
    }

    /// As [`push_async_message`](Self::push_async_message) but the callback
    /// resynchronizes onto `conn`'s current shunt.
    pub async fn push_shunt_async_message(
        &self,
        conn: &Arc<Conn>,
        caller: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        let msg = self.message_pool().get().cast_to_shunt_async(
            Arc::clone(conn),
            Box::new(caller),
            Some(Box::new(callback)),
        );
        self.push_message(msg).await;
    }

    /// Pushes a callback-only async message onto `conn`'s current shunt.
    pub async fn push_shunt_async_callback_message(
        &self,
        conn: &Arc<Conn>,
        err: Option<anyhow::Error>,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        self.push_shunt_async_callback_boxed(Arc::clone(conn), err, Box::new(callback))
            .await;
    }

    /// As [`push_async_message`](Self::push_async_message), coalesced by
    /// `key`: while a job with this key is in flight on the target
    /// dispatcher, further jobs with the same key are silently dropped.
    pub async fn push_unique_async_message(
        &self,
        key: &str,
        caller: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        let msg = self.message_pool().get().cast_to_unique_async(
            key.to_string(),
            Box::new(caller),
            Some(Box::new(callback)),
        );
        self.push_message(msg).await;
    }

    /// Pushes the callback form that releases `key` after running.
    pub async fn push_unique_async_callback_message(
        &self,
        key: &str,
        err: Option<anyhow::Error>,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        self.push_unique_async_callback_boxed(key.to_string(), err, Box::new(callback))
            .await;
    }

    /// The shunt-scoped unique async form.
    pub async fn push_unique_shunt_async_message(
        &self,
        conn: &Arc<Conn>,
        key: &str,
        caller: impl FnOnce() -> anyhow::Result<()> + Send + 'static,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        let msg = self.message_pool().get().cast_to_unique_shunt_async(
            Arc::clone(conn),
            key.to_string(),
            Box::new(caller),
            Some(Box::new(callback)),
        );
        self.push_message(msg).await;
    }

    /// The shunt-scoped unique callback form.
    pub async fn push_unique_shunt_async_callback_message(
        &self,
        conn: &Arc<Conn>,
        key: &str,
        err: Option<anyhow::Error>,
        callback: impl FnOnce(Option<anyhow::Error>) + Send + 'static,
    ) {
        self.push_unique_shunt_async_callback_boxed(
            Arc::clone(conn),
            key.to_string(),
            err,
            Box::new(callback),
        )
        .await;
    }

    /// Pushes an error message. [`ErrorAction::Shutdown`] initiates a
    /// graceful shutdown carrying the error; [`ErrorAction::None`] logs and
    /// panics for operator visibility.
    pub async fn push_error_message(&self, err: anyhow::Error, action: ErrorAction) {
        let msg = self.message_pool().get().cast_to_error(err, action);
        self.push_message(msg).await;
    }

    pub(crate) async fn push_async_callback_boxed(
        &self,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) {
        let msg = self.message_pool().get().cast_to_async_callback(err, callback);
        self.push_message(msg).await;
    }

    pub(crate) async fn push_shunt_async_callback_boxed(
        &self,
        conn: Arc<Conn>,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_shunt_async_callback(conn, err, callback);
        self.push_message(msg).await;
    }

    pub(crate) async fn push_unique_async_callback_boxed(
        &self,
        key: String,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_unique_async_callback(key, err, callback);
        self.push_message(msg).await;
    }

    pub(crate) async fn push_unique_shunt_async_callback_boxed(
        &self,
        conn: Arc<Conn>,
        key: String,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) {
        let msg = self
            .message_pool()
            .get()
            .cast_to_unique_shunt_async_callback(conn, key, err, callback);
        self.push_message(msg).await;
    }

    // --- routing -----------------------------------------------------------

    /// Releases a record back to the pool, unless the server is shutting
    /// down — late releases are dropped so the pool never outlives shutdown.
    pub(crate) fn release_message(&self, msg: Message) {
        if !self.is_shutdown() {
            self.message_pool().release(msg);
        }
    }

    /// Enqueues a message onto a specific dispatcher, bypassing the
    /// connection-to-shunt lookup.
    ///
    /// Used for the callback phase of async messages: the callback must
    /// resynchronize on the dispatcher the caller was dispatched from, even
    /// if the connection migrated to another shunt while the caller was in
    /// the pool.
    pub(crate) async fn push_message_to(&self, dispatcher: &Dispatcher, msg: Message) {
        if !self.events().emit_message_exec_before(self, &msg) {
            self.release_message(msg);
            return;
        }
        self.hit_message_statistics();
        if let Err(msg) = dispatcher.put(msg).await {
            self.message_counter.fetch_sub(1, Ordering::SeqCst);
            self.release_message(msg);
        }
    }

    pub(crate) async fn push_message(&self, msg: Message) {
        if !self.events().emit_message_exec_before(self, &msg) {
            self.release_message(msg);
            return;
        }

        let dispatcher = if msg.kind().is_shunt_routed() {
            self.conn_dispatcher(msg.conn())
        } else {
            self.system.get().cloned()
        };
        let Some(dispatcher) = dispatcher else {
            warn!(message = %msg, "message dropped: message system not running");
            self.release_message(msg);
            return;
        };

        let coalesced = matches!(
            msg.kind(),
            MessageKind::UniqueAsync | MessageKind::UniqueShuntAsync
        );
        if coalesced {
            if let Some(key) = msg.name() {
                if dispatcher.unique(key) {
                    self.release_message(msg);
                    return;
                }
            }
        }

        self.hit_message_statistics();
        if let Err(msg) = dispatcher.put(msg).await {
            self.message_counter.fetch_sub(1, Ordering::SeqCst);
            if coalesced {
                if let Some(key) = msg.name() {
                    dispatcher.anti_unique(key);
                }
            }
            self.release_message(msg);
        }
    }

    // --- execution ---------------------------------------------------------

    /// Executes one message on its dispatcher worker.
    pub(crate) async fn dispatch_message(self: Arc<Self>, dispatcher: Dispatcher, msg: Message) {
        let watchdog = self.arm_watchdog(&msg);
        let started = Instant::now();

        if msg.kind().is_async() {
            self.dispatch_async(dispatcher, msg, watchdog, started).await;
            return;
        }

        let mut msg = msg;
        let outcome: Result<(), Box<dyn std::any::Any + Send>> = match msg.kind() {
            MessageKind::Packet => {
                let conn = msg.conn.clone();
                let packet = msg.packet.take();
                match (conn, packet) {
                    (Some(conn), Some(mut packet)) => {
                        catch_unwind(AssertUnwindSafe(|| {
                            let consumed = self.events().emit_connection_packet_preprocess(
                                &self, &conn, &mut packet,
                            );
                            if !consumed {
                                self.events()
                                    .emit_connection_receive_packet(&self, &conn, &packet);
                            }
                        }))
                    }
                    _ => Ok(()),
                }
            }
            MessageKind::System
            | MessageKind::Shunt
            | MessageKind::Ticker
            | MessageKind::ShuntTicker => match msg.ordinary.take() {
                Some(handler) => catch_unwind(AssertUnwindSafe(handler)),
                None => Ok(()),
            },
            MessageKind::AsyncCallback
            | MessageKind::ShuntAsyncCallback
            | MessageKind::UniqueAsyncCallback
            | MessageKind::UniqueShuntAsyncCallback => {
                let err = msg.err.take();
                match msg.callback.take() {
                    Some(callback) => catch_unwind(AssertUnwindSafe(move || callback(err))),
                    None => Ok(()),
                }
            }
            MessageKind::Error => {
                let err = msg.err.take();
                match msg.action {
                    ErrorAction::Shutdown => {
                        // Run the teardown outside this worker: shutdown
                        // waits for the in-flight counter, which includes
                        // the message being executed right now.
                        let server = Arc::clone(&self);
                        tokio::spawn(async move {
                            server.shutdown_internal(err).await;
                        });
                        Ok(())
                    }
                    ErrorAction::None => {
                        let err = err
                            .unwrap_or_else(|| anyhow::anyhow!("error message without error"));
                        if let Some(watchdog) = watchdog {
                            watchdog.abort();
                        }
                        error!(error = %err, "fatal error message");
                        panic!("fatal error message: {err}");
                    }
                }
            }
            // Async kinds were routed above.
            _ => Ok(()),
        };

        if let Err(payload) = outcome {
            let err = recover_transform(payload);
            let stack = Backtrace::force_capture();
            error!(
                message_type = msg.kind().name(),
                info = %msg,
                error = %err,
                stack = %stack,
                "message handler panicked"
            );
            self.events().emit_message_error(&self, &msg, &err);
        }
        // A unique callback always releases its key, panic or not.
        if msg.kind().is_unique_callback() {
            if let Some(key) = msg.name() {
                dispatcher.anti_unique(key);
            }
        }
        if let Some(watchdog) = watchdog {
            watchdog.abort();
        }
        self.low(&msg, started, LOW_EXEC_SYNC);
        self.message_counter.fetch_sub(1, Ordering::SeqCst);
        self.release_message(msg);
    }

    /// Runs the blocking caller in the async pool, then re-dispatches the
    /// matching callback message onto the originating shunt so the callback
    /// observes the shunt's serial context.
    async fn dispatch_async(
        self: Arc<Self>,
        dispatcher: Dispatcher,
        mut msg: Message,
        watchdog: Option<JoinHandle<()>>,
        started: Instant,
    ) {
        let kind = msg.kind();
        let key = msg.name().map(str::to_string);
        let conn = msg.conn.clone();
        let coalesced = matches!(
            kind,
            MessageKind::UniqueAsync | MessageKind::UniqueShuntAsync
        );

        if self.async_pool.is_none() {
            let err = anyhow::anyhow!("async messages are disabled on this server");
            error!(message_type = kind.name(), error = %err, "async message dropped");
            self.events().emit_message_error(&self, &msg, &err);
            if coalesced {
                if let Some(key) = &key {
                    dispatcher.anti_unique(key);
                }
            }
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
            self.message_counter.fetch_sub(1, Ordering::SeqCst);
            self.release_message(msg);
            return;
        }

        // Keep the shunt alive until the callback has resolved.
        dispatcher.wait_add(1);
        let server = Arc::clone(&self);
        let task = async move {
            let caller = msg.caller.take();
            let joined =
                tokio::task::spawn_blocking(move || caller.and_then(|c| c().err())).await;
            let outcome = match joined {
                Ok(caller_err) => Ok(caller_err),
                Err(join_err) if join_err.is_panic() => {
                    Err(recover_transform(join_err.into_panic()))
                }
                Err(join_err) => Err(anyhow::anyhow!("async caller aborted: {join_err}")),
            };

            match outcome {
                Err(err) => {
                    // The callback never runs after a caller panic; release
                    // the key here so it is not leaked.
                    if coalesced {
                        if let Some(key) = &key {
                            dispatcher.anti_unique(key);
                        }
                    }
                    let stack = Backtrace::force_capture();
                    error!(
                        message_type = kind.name(),
                        error = %err,
                        stack = %stack,
                        "async caller panicked"
                    );
                    server.events().emit_message_error(&server, &msg, &err);
                    dispatcher.wait_add(-1);
                }
                Ok(caller_err) => {
                    let user_callback = msg.callback.take();
                    let guard = WaitGuard(dispatcher.clone());
                    let callback: AsyncCallback = Box::new(move |err| {
                        let _guard = guard;
                        if let Some(callback) = user_callback {
                            callback(err);
                        }
                    });
                    // The callback re-enters the dispatcher the caller came
                    // from, not whatever shunt the connection is on now.
                    match kind {
                        MessageKind::Async => {
                            let msg = server
                                .message_pool()
                                .get()
                                .cast_to_async_callback(caller_err, callback);
                            server.push_message_to(&dispatcher, msg).await;
                        }
                        MessageKind::UniqueAsync => {
                            if let Some(key) = key.clone() {
                                let msg = server
                                    .message_pool()
                                    .get()
                                    .cast_to_unique_async_callback(key, caller_err, callback);
                                server.push_message_to(&dispatcher, msg).await;
                            }
                        }
                        MessageKind::ShuntAsync => {
                            if let Some(conn) = conn.clone() {
                                let msg = server
                                    .message_pool()
                                    .get()
                                    .cast_to_shunt_async_callback(conn, caller_err, callback);
                                server.push_message_to(&dispatcher, msg).await;
                            }
                        }
                        MessageKind::UniqueShuntAsync => {
                            if let (Some(conn), Some(key)) = (conn.clone(), key.clone()) {
                                let msg = server
                                    .message_pool()
                                    .get()
                                    .cast_to_unique_shunt_async_callback(
                                        conn, key, caller_err, callback,
                                    );
                                server.push_message_to(&dispatcher, msg).await;
                            }
                        }
                        _ => {}
                    }
                }
            }

            server.low(&msg, started, LOW_EXEC_ASYNC);
            if let Some(watchdog) = watchdog {
                watchdog.abort();
            }
            server.message_counter.fetch_sub(1, Ordering::SeqCst);
            server.release_message(msg);
        };

        if let Some(pool) = &self.async_pool {
            pool.submit(task).await;
        }
    }

    /// Arms the one-shot deadlock watchdog for a message. Diagnostic only:
    /// firing warns and raises `DeadlockDetect`, it never cancels the
    /// handler.
    fn arm_watchdog(self: &Arc<Self>, msg: &Message) -> Option<JoinHandle<()>> {
        let window = self.config().deadlock_detect?;
        let server = Arc::clone(self);
        let kind = msg.kind();
        let summary = msg.to_string();
        Some(tokio::spawn(async move {
            tokio::time::sleep(window).await;
            warn!(
                message_type = kind.name(),
                info = %summary,
                "suspected deadlock"
            );
            server.events().emit_deadlock_detect(&server, kind, &summary);
        }))
    }

    /// Logs and raises `MessageLowExec` when a message ran over its budget.
    fn low(&self, msg: &Message, started: Instant, expect: Duration) {
        let cost = started.elapsed();
        if cost <= expect {
            return;
        }
        let shunt = msg
            .conn()
            .map(|conn| self.get_conn_curr_shunt(conn))
            .unwrap_or_default();
        warn!(
            message_type = msg.kind().name(),
            cost = ?cost,
            info = %msg,
            marks = ?msg.marks(),
            %shunt,
            "slow message execution"
        );
        self.events().emit_message_low_exec(self, msg, cost);
    }
}
