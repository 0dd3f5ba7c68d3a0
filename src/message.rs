//! The tagged message record that flows through every dispatcher.
//!
//! Every server-side event — an inbound packet, a ticker fire, a blocking
//! async job, a system task — is represented by one pooled [`Message`]. The
//! record is a flat bag of optional fields rather than a trait object because
//! routing and pool reset both want direct access to each field; a single
//! `match` over [`MessageKind`] decides what runs.
//!
//! Lifecycle: a `push_*` call acquires the record from the message pool, the
//! dispatcher worker executes it, and the router releases it afterwards —
//! except while the record is in flight inside the async pool, where
//! ownership travels with the job so it is never double-released. Records are
//! only returned to the pool while the server is not shutting down.

use std::fmt;
use std::sync::Arc;

use crate::connection::{Conn, Packet};

/// Ordinary handler attached to sync-style messages.
pub type OrdinaryHandler = Box<dyn FnOnce() + Send + 'static>;

/// The blocking phase of an async message; runs in the async pool.
pub type AsyncCaller = Box<dyn FnOnce() -> anyhow::Result<()> + Send + 'static>;

/// The callback phase of an async message; runs on the originating shunt
/// with the caller's error (if any).
pub type AsyncCallback = Box<dyn FnOnce(Option<anyhow::Error>) + Send + 'static>;

/// What to do with the error carried on an `Error` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Log the error and panic the process; operator-visible.
    None,
    /// Initiate a graceful shutdown carrying the error.
    Shutdown,
}

/// The closed set of message kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    /// One ordinary handler, runs on the system shunt.
    System,
    /// One ordinary handler, runs on a named shunt.
    Shunt,
    /// Inbound payload; routed by the connection's current shunt.
    Packet,
    /// Labeled scheduled call on the system shunt.
    Ticker,
    /// Labeled scheduled call on a named shunt.
    ShuntTicker,
    /// Two-phase blocking job resolved on the system shunt.
    Async,
    /// Two-phase blocking job resolved on a named shunt.
    ShuntAsync,
    /// Callback-only form executed on the system shunt.
    AsyncCallback,
    /// Callback-only form executed on a named shunt.
    ShuntAsyncCallback,
    /// Async coalesced by a string key on the system shunt.
    UniqueAsync,
    /// Async coalesced by a string key on a named shunt.
    UniqueShuntAsync,
    /// Callback that releases a unique key on the system shunt.
    UniqueAsyncCallback,
    /// Callback that releases a unique key on a named shunt.
    UniqueShuntAsyncCallback,
    /// Carries an error and an [`ErrorAction`].
    Error,
}

impl MessageKind {
    /// Short stable name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::System => "System",
            MessageKind::Shunt => "Shunt",
            MessageKind::Packet => "Packet",
            MessageKind::Ticker => "Ticker",
            MessageKind::ShuntTicker => "ShuntTicker",
            MessageKind::Async => "Async",
            MessageKind::ShuntAsync => "ShuntAsync",
            MessageKind::AsyncCallback => "AsyncCallback",
            MessageKind::ShuntAsyncCallback => "ShuntAsyncCallback",
            MessageKind::UniqueAsync => "UniqueAsync",
            MessageKind::UniqueShuntAsync => "UniqueShuntAsync",
            MessageKind::UniqueAsyncCallback => "UniqueAsyncCallback",
            MessageKind::UniqueShuntAsyncCallback => "UniqueShuntAsyncCallback",
            MessageKind::Error => "Error",
        }
    }

    /// Kinds that route through the connection's current shunt.
    pub(crate) fn is_shunt_routed(&self) -> bool {
        matches!(
            self,
            MessageKind::Packet
                | MessageKind::Shunt
                | MessageKind::ShuntTicker
                | MessageKind::ShuntAsync
                | MessageKind::ShuntAsyncCallback
                | MessageKind::UniqueShuntAsync
                | MessageKind::UniqueShuntAsyncCallback
        )
    }

    /// Kinds whose blocking phase runs in the async pool.
    pub(crate) fn is_async(&self) -> bool {
        matches!(
            self,
            MessageKind::Async
                | MessageKind::ShuntAsync
                | MessageKind::UniqueAsync
                | MessageKind::UniqueShuntAsync
        )
    }

    /// Kinds that execute a previously captured callback.
    pub(crate) fn is_callback(&self) -> bool {
        matches!(
            self,
            MessageKind::AsyncCallback
                | MessageKind::ShuntAsyncCallback
                | MessageKind::UniqueAsyncCallback
                | MessageKind::UniqueShuntAsyncCallback
        )
    }

    /// Kinds that hold a unique key which must be released after execution.
    pub(crate) fn is_unique_callback(&self) -> bool {
        matches!(
            self,
            MessageKind::UniqueAsyncCallback | MessageKind::UniqueShuntAsyncCallback
        )
    }
}

impl fmt::Display for MessageKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A pooled message record. See the module docs for lifecycle rules.
pub struct Message {
    pub(crate) kind: MessageKind,
    pub(crate) conn: Option<Arc<Conn>>,
    pub(crate) packet: Option<Packet>,
    pub(crate) ordinary: Option<OrdinaryHandler>,
    pub(crate) caller: Option<AsyncCaller>,
    pub(crate) callback: Option<AsyncCallback>,
    pub(crate) err: Option<anyhow::Error>,
    pub(crate) action: ErrorAction,
    pub(crate) name: Option<String>,
    pub(crate) marks: Vec<String>,
}

impl Default for Message {
    fn default() -> Self {
        Self {
            kind: MessageKind::System,
            conn: None,
            packet: None,
            ordinary: None,
            caller: None,
            callback: None,
            err: None,
            action: ErrorAction::None,
            name: None,
            marks: Vec::new(),
        }
    }
}

impl Message {
    /// The message kind tag.
    pub fn kind(&self) -> MessageKind {
        self.kind
    }

    /// The connection this message is bound to, if any.
    pub fn conn(&self) -> Option<&Arc<Conn>> {
        self.conn.as_ref()
    }

    /// Ticker label or unique-coalescing key.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// Log marks attached to this message.
    pub fn marks(&self) -> &[String] {
        &self.marks
    }

    /// Clears every field before the record returns to the pool.
    pub(crate) fn reset(&mut self) {
        self.kind = MessageKind::System;
        self.conn = None;
        self.packet = None;
        self.ordinary = None;
        self.caller = None;
        self.callback = None;
        self.err = None;
        self.action = ErrorAction::None;
        self.name = None;
        self.marks.clear();
    }

    pub(crate) fn cast_to_system(mut self, handler: OrdinaryHandler) -> Self {
        self.kind = MessageKind::System;
        self.ordinary = Some(handler);
        self
    }

    pub(crate) fn cast_to_shunt(mut self, conn: Arc<Conn>, handler: OrdinaryHandler) -> Self {
        self.kind = MessageKind::Shunt;
        self.conn = Some(conn);
        self.ordinary = Some(handler);
        self
    }

    pub(crate) fn cast_to_packet(mut self, conn: Arc<Conn>, packet: Packet) -> Self {
        self.kind = MessageKind::Packet;
        self.conn = Some(conn);
        self.packet = Some(packet);
        self
    }

    pub(crate) fn cast_to_ticker(mut self, name: String, handler: OrdinaryHandler) -> Self {
        self.kind = MessageKind::Ticker;
        self.name = Some(name);
        self.ordinary = Some(handler);
        self
    }

    pub(crate) fn cast_to_shunt_ticker(
        mut self,
        conn: Arc<Conn>,
        name: String,
        handler: OrdinaryHandler,
    ) -> Self {
        self.kind = MessageKind::ShuntTicker;
        self.conn = Some(conn);
        self.name = Some(name);
        self.ordinary = Some(handler);
        self
    }

    pub(crate) fn cast_to_async(
        mut self,
        caller: AsyncCaller,
        callback: Option<AsyncCallback>,
    ) -> Self {
        self.kind = MessageKind::Async;
        self.caller = Some(caller);
        self.callback = callback;
        self
    }

    pub(crate) fn cast_to_shunt_async(
        mut self,
        conn: Arc<Conn>,
        caller: AsyncCaller,
        callback: Option<AsyncCallback>,
    ) -> Self {
        self.kind = MessageKind::ShuntAsync;
        self.conn = Some(conn);
        self.caller = Some(caller);
        self.callback = callback;
        self
    }

    pub(crate) fn cast_to_async_callback(
        mut self,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) -> Self {
        self.kind = MessageKind::AsyncCallback;
        self.err = err;
        self.callback = Some(callback);
        self
    }

    pub(crate) fn cast_to_shunt_async_callback(
        mut self,
        conn: Arc<Conn>,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) -> Self {
        self.kind = MessageKind::ShuntAsyncCallback;
        self.conn = Some(conn);
        self.err = err;
        self.callback = Some(callback);
        self
    }

    pub(crate) fn cast_to_unique_async(
        mut self,
        key: String,
        caller: AsyncCaller,
        callback: Option<AsyncCallback>,
    ) -> Self {
        self.kind = MessageKind::UniqueAsync;
        self.name = Some(key);
        self.caller = Some(caller);
        self.callback = callback;
        self
    }

    pub(crate) fn cast_to_unique_shunt_async(
        mut self,
        conn: Arc<Conn>,
        key: String,
        caller: AsyncCaller,
        callback: Option<AsyncCallback>,
    ) -> Self {
        self.kind = MessageKind::UniqueShuntAsync;
        self.conn = Some(conn);
        self.name = Some(key);
        self.caller = Some(caller);
        self.callback = callback;
        self
    }

    pub(crate) fn cast_to_unique_async_callback(
        mut self,
        key: String,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) -> Self {
        self.kind = MessageKind::UniqueAsyncCallback;
        self.name = Some(key);
        self.err = err;
        self.callback = Some(callback);
        self
    }

    pub(crate) fn cast_to_unique_shunt_async_callback(
        mut self,
        conn: Arc<Conn>,
        key: String,
        err: Option<anyhow::Error>,
        callback: AsyncCallback,
    ) -> Self {
        self.kind = MessageKind::UniqueShuntAsyncCallback;
        self.conn = Some(conn);
        self.name = Some(key);
        self.err = err;
        self.callback = Some(callback);
        self
    }

    pub(crate) fn cast_to_error(mut self, err: anyhow::Error, action: ErrorAction) -> Self {
        self.kind = MessageKind::Error;
        self.err = Some(err);
        self.action = action;
        self
    }
}

impl fmt::Display for Message {
    /// Short per-kind summary used in warning and error logs.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.kind {
            MessageKind::Packet => {
                let size = self.packet.as_ref().map(|p| p.data.len()).unwrap_or(0);
                write!(f, "Packet(conn={}, {} bytes)", self.conn_id(), size)
            }
            MessageKind::Ticker | MessageKind::ShuntTicker => {
                write!(f, "{}({})", self.kind, self.name().unwrap_or("?"))
            }
            MessageKind::UniqueAsync
            | MessageKind::UniqueShuntAsync
            | MessageKind::UniqueAsyncCallback
            | MessageKind::UniqueShuntAsyncCallback => {
                write!(f, "{}(key={})", self.kind, self.name().unwrap_or("?"))
            }
            MessageKind::Error => match &self.err {
                Some(err) => write!(f, "Error({err})"),
                None => write!(f, "Error(?)"),
            },
            _ => f.write_str(self.kind.name()),
        }
    }
}

impl fmt::Debug for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Message({self})")
    }
}

impl Message {
    fn conn_id(&self) -> String {
        self.conn
            .as_ref()
            .map(|c| c.id())
            .unwrap_or_else(|| "-".to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reset_clears_every_field() {
        let mut msg = Message::default().cast_to_ticker("heartbeat".into(), Box::new(|| {}));
        msg.marks.push("m1".into());
        msg.reset();

        assert_eq!(msg.kind(), MessageKind::System);
        assert!(msg.conn.is_none());
        assert!(msg.ordinary.is_none());
        assert!(msg.name.is_none());
        assert!(msg.marks.is_empty());
    }

    #[test]
    fn kind_classification() {
        assert!(MessageKind::UniqueShuntAsync.is_async());
        assert!(MessageKind::UniqueShuntAsync.is_shunt_routed());
        assert!(!MessageKind::UniqueAsync.is_shunt_routed());
        assert!(MessageKind::UniqueShuntAsyncCallback.is_unique_callback());
        assert!(MessageKind::ShuntAsyncCallback.is_callback());
        assert!(!MessageKind::System.is_async());
    }

    #[test]
    fn display_names_routes_by_kind() {
        let msg = Message::default().cast_to_unique_async(
            "refresh".into(),
            Box::new(|| Ok(())),
            None,
        );
        assert_eq!(format!("{msg}"), "UniqueAsync(key=refresh)");
    }
}
