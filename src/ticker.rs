//! Named repeating timers delivered through the message system.
//!
//! Each named ticker is a tokio interval task. On every fire the caller is
//! pushed as a Ticker message so it executes serialized with other system
//! work; with `autonomy` enabled the caller instead runs on the timer task
//! itself, which is punctual but concurrent with everything else.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};
use tracing::debug;

use crate::config::TickerConfig;
use crate::server::Server;

/// The server ticker facility. Obtained through
/// [`Server::ticker`](crate::Server::ticker).
pub struct Ticker {
    server: Weak<Server>,
    tasks: Mutex<HashMap<String, JoinHandle<()>>>,
    autonomy: bool,
}

impl Ticker {
    pub(crate) fn new(server: Weak<Server>, config: &TickerConfig) -> Self {
        Self {
            server,
            tasks: Mutex::new(HashMap::with_capacity(config.size)),
            autonomy: config.autonomy,
        }
    }

    /// Schedules `caller` to fire every `interval` under `name`. A ticker
    /// already registered under the same name is replaced.
    pub fn every(
        &self,
        name: impl Into<String>,
        interval: Duration,
        caller: impl Fn() + Send + Sync + 'static,
    ) {
        let name = name.into();
        let server = self.server.clone();
        let autonomy = self.autonomy;
        let caller = Arc::new(caller);
        let label = name.clone();

        let handle = tokio::spawn(async move {
            let mut timer = interval_at(Instant::now() + interval, interval);
            timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                timer.tick().await;
                let Some(server) = server.upgrade() else { return };
                if server.is_shutdown() {
                    return;
                }
                if autonomy {
                    caller();
                } else {
                    let caller = Arc::clone(&caller);
                    server
                        .push_ticker_message(&label, move || caller())
                        .await;
                }
            }
        });

        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(previous) = tasks.insert(name, handle) {
                previous.abort();
            }
        }
    }

    /// Cancels the named ticker if it exists.
    pub fn stop(&self, name: &str) {
        if let Ok(mut tasks) = self.tasks.lock() {
            if let Some(handle) = tasks.remove(name) {
                handle.abort();
            }
        }
    }

    /// Cancels every ticker. Called once at shutdown.
    pub(crate) fn release(&self) {
        if let Ok(mut tasks) = self.tasks.lock() {
            for (name, handle) in tasks.drain() {
                debug!(ticker = %name, "ticker released");
                handle.abort();
            }
        }
    }
}

impl std::fmt::Debug for Ticker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let count = self.tasks.lock().map(|t| t.len()).unwrap_or(0);
        f.debug_struct("Ticker")
            .field("tasks", &count)
            .field("autonomy", &self.autonomy)
            .finish()
    }
}
