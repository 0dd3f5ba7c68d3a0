//! Registered event hooks for the server lifecycle, connections and
//! message execution.
//!
//! Each event holds a list of callbacks invoked in registration order. A
//! panic inside one callback is recovered and logged without aborting the
//! rest of the list — hooks observe the system, they never take it down.
//!
//! Two hooks are special: `MessageExecBefore` can veto a message (every
//! registered callback must allow it) and `ConnectionWritePacketBefore` can
//! transform the outbound packet.

use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use tracing::error;

use crate::connection::{Conn, Packet};
use crate::message::{Message, MessageKind};
use crate::server::Server;
use crate::utils::recover_transform;

type Hook<F> = RwLock<Vec<F>>;

type LifecycleFn = Box<dyn Fn(&Server) + Send + Sync>;
type ExecBeforeFn = Box<dyn Fn(&Server, &Message) -> bool + Send + Sync>;
type MessageErrorFn = Box<dyn Fn(&Server, &Message, &anyhow::Error) + Send + Sync>;
type LowExecFn = Box<dyn Fn(&Server, &Message, Duration) + Send + Sync>;
type ConnFn = Box<dyn Fn(&Server, &Arc<Conn>) + Send + Sync>;
type ConnClosedFn = Box<dyn Fn(&Server, &Arc<Conn>, Option<&anyhow::Error>) + Send + Sync>;
type PreprocessFn = Box<dyn Fn(&Server, &Arc<Conn>, &mut Packet) -> bool + Send + Sync>;
type ReceivePacketFn = Box<dyn Fn(&Server, &Arc<Conn>, &Packet) + Send + Sync>;
type WriteBeforeFn = Box<dyn Fn(&Server, &Arc<Conn>, Packet) -> Packet + Send + Sync>;
type ShuntFn = Box<dyn Fn(&Server, &str) + Send + Sync>;
type DeadlockFn = Box<dyn Fn(&Server, MessageKind, &str) + Send + Sync>;

/// The hook table. Obtained through [`Server::events`].
#[derive(Default)]
pub struct Events {
    start_before: Hook<LifecycleFn>,
    start_finish: Hook<LifecycleFn>,
    stop: Hook<LifecycleFn>,
    message_ready: Hook<LifecycleFn>,
    message_exec_before: Hook<ExecBeforeFn>,
    message_error: Hook<MessageErrorFn>,
    message_low_exec: Hook<LowExecFn>,
    connection_opened: Hook<ConnFn>,
    connection_opened_after: Hook<ConnFn>,
    connection_closed: Hook<ConnClosedFn>,
    connection_packet_preprocess: Hook<PreprocessFn>,
    connection_receive_packet: Hook<ReceivePacketFn>,
    connection_write_packet_before: Hook<WriteBeforeFn>,
    shunt_channel_created: Hook<ShuntFn>,
    shunt_channel_closed: Hook<ShuntFn>,
    deadlock_detect: Hook<DeadlockFn>,
}

fn push<F>(hook: &Hook<F>, f: F) {
    if let Ok(mut handlers) = hook.write() {
        handlers.push(f);
    }
}

fn guarded<R>(label: &str, f: impl FnOnce() -> R) -> Option<R> {
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(value) => Some(value),
        Err(payload) => {
            let err = recover_transform(payload);
            error!(hook = label, %err, "event hook panicked");
            None
        }
    }
}

impl Events {
    /// Fires before the network adapter starts listening.
    pub fn on_start_before(&self, f: impl Fn(&Server) + Send + Sync + 'static) {
        push(&self.start_before, Box::new(f));
    }

    /// Fires once startup has completed and traffic may flow.
    pub fn on_start_finish(&self, f: impl Fn(&Server) + Send + Sync + 'static) {
        push(&self.start_finish, Box::new(f));
    }

    /// Fires exactly once during graceful shutdown, after in-flight messages
    /// have drained.
    pub fn on_stop(&self, f: impl Fn(&Server) + Send + Sync + 'static) {
        push(&self.stop, Box::new(f));
    }

    /// Fires when the message system (pool + system dispatcher) is ready.
    pub fn on_message_ready(&self, f: impl Fn(&Server) + Send + Sync + 'static) {
        push(&self.message_ready, Box::new(f));
    }

    /// Vetoable: return `false` to drop the message before routing.
    pub fn on_message_exec_before(
        &self,
        f: impl Fn(&Server, &Message) -> bool + Send + Sync + 'static,
    ) {
        push(&self.message_exec_before, Box::new(f));
    }

    /// Fires when a message handler panicked or an async caller failed.
    pub fn on_message_error(
        &self,
        f: impl Fn(&Server, &Message, &anyhow::Error) + Send + Sync + 'static,
    ) {
        push(&self.message_error, Box::new(f));
    }

    /// Fires when a message ran longer than the low-exec threshold.
    pub fn on_message_low_exec(
        &self,
        f: impl Fn(&Server, &Message, Duration) + Send + Sync + 'static,
    ) {
        push(&self.message_low_exec, Box::new(f));
    }

    /// Fires when a transport accepted a new connection.
    pub fn on_connection_opened(&self, f: impl Fn(&Server, &Arc<Conn>) + Send + Sync + 'static) {
        push(&self.connection_opened, Box::new(f));
    }

    /// Fires after `ConnectionOpened` handlers have run.
    pub fn on_connection_opened_after(
        &self,
        f: impl Fn(&Server, &Arc<Conn>) + Send + Sync + 'static,
    ) {
        push(&self.connection_opened_after, Box::new(f));
    }

    /// Fires when a connection closed; carries the terminating error if any.
    pub fn on_connection_closed(
        &self,
        f: impl Fn(&Server, &Arc<Conn>, Option<&anyhow::Error>) + Send + Sync + 'static,
    ) {
        push(&self.connection_closed, Box::new(f));
    }

    /// Vetoable, rewriting: return `true` to consume the packet before the
    /// regular receive hook; the packet may be rewritten in place.
    pub fn on_connection_packet_preprocess(
        &self,
        f: impl Fn(&Server, &Arc<Conn>, &mut Packet) -> bool + Send + Sync + 'static,
    ) {
        push(&self.connection_packet_preprocess, Box::new(f));
    }

    /// Fires for every inbound packet that was not consumed by preprocess.
    pub fn on_connection_receive_packet(
        &self,
        f: impl Fn(&Server, &Arc<Conn>, &Packet) + Send + Sync + 'static,
    ) {
        push(&self.connection_receive_packet, Box::new(f));
    }

    /// Transforming: may rewrite every outbound packet before it is queued.
    pub fn on_connection_write_packet_before(
        &self,
        f: impl Fn(&Server, &Arc<Conn>, Packet) -> Packet + Send + Sync + 'static,
    ) {
        push(&self.connection_write_packet_before, Box::new(f));
    }

    /// Fires when a shunt channel is created.
    pub fn on_shunt_channel_created(&self, f: impl Fn(&Server, &str) + Send + Sync + 'static) {
        push(&self.shunt_channel_created, Box::new(f));
    }

    /// Fires when a shunt channel is torn down.
    pub fn on_shunt_channel_closed(&self, f: impl Fn(&Server, &str) + Send + Sync + 'static) {
        push(&self.shunt_channel_closed, Box::new(f));
    }

    /// Fires when a message exceeded the deadlock-detection window. The
    /// message is still running; this is diagnostic only.
    pub fn on_deadlock_detect(
        &self,
        f: impl Fn(&Server, MessageKind, &str) + Send + Sync + 'static,
    ) {
        push(&self.deadlock_detect, Box::new(f));
    }

    pub(crate) fn emit_start_before(&self, srv: &Server) {
        self.emit_lifecycle(&self.start_before, srv, "StartBefore");
    }

    pub(crate) fn emit_start_finish(&self, srv: &Server) {
        self.emit_lifecycle(&self.start_finish, srv, "StartFinish");
    }

    pub(crate) fn emit_stop(&self, srv: &Server) {
        self.emit_lifecycle(&self.stop, srv, "Stop");
    }

    pub(crate) fn emit_message_ready(&self, srv: &Server) {
        self.emit_lifecycle(&self.message_ready, srv, "MessageReady");
    }

    fn emit_lifecycle(&self, hook: &Hook<LifecycleFn>, srv: &Server, label: &str) {
        if let Ok(handlers) = hook.read() {
            for handler in handlers.iter() {
                guarded(label, || handler(srv));
            }
        }
    }

    /// All handlers must allow the message; a panicking handler counts as
    /// allowing it.
    pub(crate) fn emit_message_exec_before(&self, srv: &Server, msg: &Message) -> bool {
        let Ok(handlers) = self.message_exec_before.read() else {
            return true;
        };
        handlers
            .iter()
            .all(|handler| guarded("MessageExecBefore", || handler(srv, msg)).unwrap_or(true))
    }

    pub(crate) fn emit_message_error(&self, srv: &Server, msg: &Message, err: &anyhow::Error) {
        if let Ok(handlers) = self.message_error.read() {
            for handler in handlers.iter() {
                guarded("MessageError", || handler(srv, msg, err));
            }
        }
    }

    pub(crate) fn emit_message_low_exec(&self, srv: &Server, msg: &Message, cost: Duration) {
        if let Ok(handlers) = self.message_low_exec.read() {
            for handler in handlers.iter() {
                guarded("MessageLowExec", || handler(srv, msg, cost));
            }
        }
    }

    pub(crate) fn emit_connection_opened(&self, srv: &Server, conn: &Arc<Conn>) {
        if let Ok(handlers) = self.connection_opened.read() {
            for handler in handlers.iter() {
                guarded("ConnectionOpened", || handler(srv, conn));
            }
        }
    }

    pub(crate) fn emit_connection_opened_after(&self, srv: &Server, conn: &Arc<Conn>) {
        if let Ok(handlers) = self.connection_opened_after.read() {
            for handler in handlers.iter() {
                guarded("ConnectionOpenedAfter", || handler(srv, conn));
            }
        }
    }

    pub(crate) fn emit_connection_closed(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        err: Option<&anyhow::Error>,
    ) {
        if let Ok(handlers) = self.connection_closed.read() {
            for handler in handlers.iter() {
                guarded("ConnectionClosed", || handler(srv, conn, err));
            }
        }
    }

    /// Returns `true` when some handler consumed the packet. Iteration stops
    /// at the first consumer.
    pub(crate) fn emit_connection_packet_preprocess(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        packet: &mut Packet,
    ) -> bool {
        let Ok(handlers) = self.connection_packet_preprocess.read() else {
            return false;
        };
        for handler in handlers.iter() {
            if guarded("ConnectionPacketPreprocess", || handler(srv, conn, packet))
                .unwrap_or(false)
            {
                return true;
            }
        }
        false
    }

    pub(crate) fn emit_connection_receive_packet(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        packet: &Packet,
    ) {
        if let Ok(handlers) = self.connection_receive_packet.read() {
            for handler in handlers.iter() {
                guarded("ConnectionReceivePacket", || handler(srv, conn, packet));
            }
        }
    }

    /// Folds the packet through every transforming handler. A panicking
    /// handler leaves the packet as the previous handler produced it.
    pub(crate) fn emit_connection_write_packet_before(
        &self,
        srv: &Server,
        conn: &Arc<Conn>,
        packet: Packet,
    ) -> Packet {
        let Ok(handlers) = self.connection_write_packet_before.read() else {
            return packet;
        };
        let mut current = packet;
        for handler in handlers.iter() {
            let snapshot = current.clone();
            current = guarded("ConnectionWritePacketBefore", || handler(srv, conn, snapshot))
                .unwrap_or(current);
        }
        current
    }

    pub(crate) fn emit_shunt_channel_created(&self, srv: &Server, name: &str) {
        if let Ok(handlers) = self.shunt_channel_created.read() {
            for handler in handlers.iter() {
                guarded("ShuntChannelCreated", || handler(srv, name));
            }
        }
    }

    pub(crate) fn emit_shunt_channel_closed(&self, srv: &Server, name: &str) {
        if let Ok(handlers) = self.shunt_channel_closed.read() {
            for handler in handlers.iter() {
                guarded("ShuntChannelClosed", || handler(srv, name));
            }
        }
    }

    pub(crate) fn emit_deadlock_detect(&self, srv: &Server, kind: MessageKind, summary: &str) {
        if let Ok(handlers) = self.deadlock_detect.read() {
            for handler in handlers.iter() {
                guarded("DeadlockDetect", || handler(srv, kind, summary));
            }
        }
    }
}

impl std::fmt::Debug for Events {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Events").finish_non_exhaustive()
    }
}
