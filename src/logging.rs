//! Logging setup.
//!
//! Structured logging via `tracing` with an environment-aware filter. The
//! default level follows the configured run mode; `RUST_LOG` overrides it.

use anyhow::Result;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::RunMode;

/// Initialize the logging system.
///
/// The base level follows `mode` (`debug` for [`RunMode::Dev`], `info`
/// otherwise) and can be overridden through the `RUST_LOG` environment
/// variable. Calling this twice returns an error from the underlying
/// subscriber registry.
pub fn setup_logging(mode: RunMode) -> Result<()> {
    let level = match mode {
        RunMode::Dev => "debug",
        RunMode::Test | RunMode::Prod => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init: {e}"))
}

/// Initialize logging with JSON output, for log aggregation systems.
pub fn setup_logging_json(mode: RunMode) -> Result<()> {
    let level = match mode {
        RunMode::Dev => "debug",
        RunMode::Test | RunMode::Prod => "info",
    };

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().json().with_target(false))
        .try_init()
        .map_err(|e| anyhow::anyhow!("logging init: {e}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn setup_is_idempotent_enough() {
        // Only the first global init can succeed; the second must fail
        // without panicking.
        let first = setup_logging(RunMode::Test);
        let second = setup_logging(RunMode::Test);
        assert!(first.is_ok() || second.is_err());
    }
}
