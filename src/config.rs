//! Server configuration.
//!
//! Construction takes a [`ServerConfig`] value; everything has a usable
//! default so `ServerConfig::default()` yields a production-shaped server.
//! Struct-update syntax is the expected way to override individual fields.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::Duration;

use crate::error::ServerError;

/// Default async pool size when none is configured.
pub const DEFAULT_ASYNC_POOL_SIZE: usize = 256;
/// Default per-dispatcher queue capacity.
pub const DEFAULT_DISPATCHER_BUFFER_SIZE: usize = 1024;
/// Default per-connection batch-record pool capacity.
pub const DEFAULT_CONN_WRITE_BUFFER_SIZE: usize = 10 * 1024;
/// Default message-pool capacity.
pub const DEFAULT_MESSAGE_POOL_SIZE: usize = 1024;
/// Default inbound-packet size that triggers a warning log.
pub const DEFAULT_PACKET_WARN_SIZE: usize = 1024 * 1024;

/// Deployment flavor; currently only affects default log verbosity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Local development.
    Dev,
    /// CI / test runs.
    Test,
    /// Production.
    #[default]
    Prod,
}

/// Ticker facility configuration.
#[derive(Debug, Clone)]
pub struct TickerConfig {
    /// Capacity hint for the server ticker table.
    pub size: usize,
    /// Capacity hint for per-connection tickers.
    pub conn_size: usize,
    /// When `true` ticker callers run on the timer task itself instead of
    /// being pushed as Ticker messages; that trades serialization for
    /// punctuality and exposes the caller to concurrency.
    pub autonomy: bool,
}

impl Default for TickerConfig {
    fn default() -> Self {
        Self { size: 64, conn_size: 8, autonomy: false }
    }
}

/// Message statistics configuration: one atomic counter per wall-clock
/// window of `duration`, keeping at most `limit` windows.
#[derive(Debug, Clone)]
pub struct StatisticsConfig {
    /// Window length.
    pub duration: Duration,
    /// Maximum retained windows.
    pub limit: usize,
}

/// Options accepted by [`Server::new`](crate::Server::new).
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Async pool size; `0` selects [`DEFAULT_ASYNC_POOL_SIZE`].
    pub async_pool_size: usize,
    /// Suppresses the async pool entirely; async messages become errors.
    pub disable_async: bool,
    /// Deadlock-detection window; `None` disables the watchdog.
    pub deadlock_detect: Option<Duration>,
    /// WebSocket frame kinds accepted from clients; `None` accepts all.
    pub websocket_frame_allow: Option<HashSet<i32>>,
    /// WebSocket compression level, `-2..=9` inclusive.
    pub websocket_compression: i32,
    /// Whether outbound WebSocket writes request compression.
    pub websocket_write_compression: bool,
    /// Read deadline for WebSocket connections; `None` waits forever.
    pub websocket_read_deadline: Option<Duration>,
    /// TLS certificate path, carried for a fronting terminator.
    pub tls_cert: Option<PathBuf>,
    /// TLS key path, carried for a fronting terminator.
    pub tls_key: Option<PathBuf>,
    /// Ticker facility; `None` makes `Server::ticker` unavailable.
    pub ticker: Option<TickerConfig>,
    /// Message-pool capacity; `0` selects [`DEFAULT_MESSAGE_POOL_SIZE`].
    pub message_pool_size: usize,
    /// Inbound packets over this size log a warning; `0` disables.
    pub packet_warn_size: usize,
    /// Deployment flavor.
    pub run_mode: RunMode,
    /// Per-dispatcher queue capacity.
    pub dispatcher_buffer_size: usize,
    /// Per-connection batch pool capacity.
    pub conn_write_buffer_size: usize,
    /// Message statistics; `None` disables the ring.
    pub statistics: Option<StatisticsConfig>,
    /// Shuts the server down after this lifetime. Test servers only.
    pub limit_life: Option<Duration>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            async_pool_size: 0,
            disable_async: false,
            deadlock_detect: None,
            websocket_frame_allow: None,
            websocket_compression: 0,
            websocket_write_compression: false,
            websocket_read_deadline: None,
            tls_cert: None,
            tls_key: None,
            ticker: None,
            message_pool_size: 0,
            packet_warn_size: DEFAULT_PACKET_WARN_SIZE,
            run_mode: RunMode::default(),
            dispatcher_buffer_size: DEFAULT_DISPATCHER_BUFFER_SIZE,
            conn_write_buffer_size: DEFAULT_CONN_WRITE_BUFFER_SIZE,
            statistics: None,
            limit_life: None,
        }
    }
}

impl ServerConfig {
    /// Normalizes zero-valued fields to their defaults. Called once during
    /// construction.
    pub(crate) fn normalize(mut self) -> Self {
        if self.async_pool_size == 0 {
            self.async_pool_size = DEFAULT_ASYNC_POOL_SIZE;
        }
        if self.message_pool_size == 0 {
            self.message_pool_size = DEFAULT_MESSAGE_POOL_SIZE;
        }
        if self.dispatcher_buffer_size == 0 {
            self.dispatcher_buffer_size = DEFAULT_DISPATCHER_BUFFER_SIZE;
        }
        if self.conn_write_buffer_size == 0 {
            self.conn_write_buffer_size = DEFAULT_CONN_WRITE_BUFFER_SIZE;
        }
        self
    }

    /// Rejects values no server could run with. Checked by
    /// [`Server::run`](crate::Server::run) before anything starts.
    pub(crate) fn validate(&self) -> Result<(), ServerError> {
        // Both endpoints are valid compression levels.
        if !(-2..=9).contains(&self.websocket_compression) {
            return Err(ServerError::Construction(format!(
                "websocket compression level {} is outside -2..=9",
                self.websocket_compression
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_fields_pick_defaults() {
        let config = ServerConfig::default().normalize();
        assert_eq!(config.async_pool_size, DEFAULT_ASYNC_POOL_SIZE);
        assert_eq!(config.message_pool_size, DEFAULT_MESSAGE_POOL_SIZE);
        assert_eq!(config.dispatcher_buffer_size, DEFAULT_DISPATCHER_BUFFER_SIZE);
    }

    #[test]
    fn compression_bounds_are_inclusive() {
        for level in [-2, 0, 9] {
            let config = ServerConfig {
                websocket_compression: level,
                ..Default::default()
            };
            assert!(config.validate().is_ok(), "level {level} must be accepted");
        }
    }

    #[test]
    fn compression_out_of_range_is_rejected() {
        for level in [-3, 10] {
            let config = ServerConfig {
                websocket_compression: level,
                ..Default::default()
            };
            assert!(
                matches!(config.validate(), Err(ServerError::Construction(_))),
                "level {level} must be rejected"
            );
        }
    }
}
