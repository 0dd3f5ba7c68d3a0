//! Structured error types for the server core.
//!
//! The server uses a single [`ServerError`] enum to categorize failures:
//! construction problems surface before any traffic flows, transport errors
//! stay scoped to the connection that raised them, and handler panics are
//! recovered at the dispatcher boundary and never propagate past one message.

use thiserror::Error;

use crate::network::NetworkKind;

/// Errors raised by the server core and its transport adapters.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The server was asked to run while in an invalid state, e.g. `run`
    /// called twice or with an address the selected network cannot parse.
    #[error("server construction incomplete: {0}")]
    Construction(String),

    /// The requested operation is not available for the configured network.
    #[error("network {0} does not support this operation")]
    UnsupportedNetwork(NetworkKind),

    /// Ticker access on a server built without ticker support.
    #[error("server was created without ticker support")]
    TickerUnsupported,

    /// A WebSocket frame kind outside the configured allow-list.
    #[error("websocket frame kind {0} rejected by the allow-list")]
    IllegalFrameKind(i32),

    /// A transport-level read failure; closes the offending connection only.
    #[error("transport read error: {0}")]
    TransportRead(String),

    /// A transport-level write failure; terminates the connection writer.
    #[error("transport write error: {0}")]
    TransportWrite(String),

    /// A panic recovered inside message dispatch, converted to an error.
    #[error("message handler panicked: {0}")]
    HandlerPanic(String),

    /// An error carried on an `Error` message that requested shutdown.
    #[error("shutdown requested: {0}")]
    Shutdown(String),

    /// Network-layer failures: bind, accept, handshake.
    #[error("network error: {0}")]
    Network(String),

    /// Anything else that should not happen.
    #[error("internal error: {0}")]
    Internal(String),
}
