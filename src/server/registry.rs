//! Shunt membership: which connection runs on which dispatcher.
//!
//! One reader-writer lock guards three maps: name → dispatcher, name →
//! member connection ids, and connection id → current dispatcher. All
//! mutation happens under the write lock so `use_shunt` is linearizable;
//! lookups take the read lock. The registry stores connection ids only —
//! dispatchers never hold strong references to connections.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use tracing::warn;

use crate::connection::Conn;
use crate::dispatcher::{Dispatcher, SYSTEM_SHUNT};

use super::Server;

pub(super) struct Registry {
    pub(super) dispatchers: HashMap<String, Dispatcher>,
    pub(super) members: HashMap<String, HashSet<String>>,
    pub(super) curr: HashMap<String, Dispatcher>,
}

impl Server {
    /// Attaches `conn` to the named shunt, creating the dispatcher and its
    /// worker on demand.
    ///
    /// If the connection was on another non-system shunt and that shunt has
    /// no remaining members and no outstanding async work, the old
    /// dispatcher is torn down: still-queued items are transferred into the
    /// new dispatcher first, preserving per-connection ordering across the
    /// migration. Re-attaching to the shunt the connection already uses is
    /// a no-op.
    pub fn use_shunt(&self, conn: &Arc<Conn>, name: &str) {
        if name == SYSTEM_SHUNT {
            warn!(conn = %conn.id(), "the system shunt cannot be used by name");
            return;
        }
        let Ok(mut registry) = self.registry.write() else {
            return;
        };

        let dispatcher = match registry.dispatchers.get(name) {
            Some(d) => d.clone(),
            None => {
                let d = Dispatcher::new(self.config().dispatcher_buffer_size, name);
                registry.dispatchers.insert(name.to_string(), d.clone());
                self.spawn_worker(d.clone());
                self.events().emit_shunt_channel_created(self, name);
                d
            }
        };

        let cid = conn.id();
        if let Some(curr) = registry.curr.get(&cid).cloned() {
            if curr.name() == name {
                return;
            }
            let old = curr.name().to_string();
            if let Some(members) = registry.members.get_mut(&old) {
                members.remove(&cid);
            }
            let emptied = registry
                .members
                .get(&old)
                .map(|members| members.is_empty())
                .unwrap_or(true);
            // A memberless dispatcher stays registered while its wait
            // counter is positive: in-flight async work still resolves
            // through it, and a lookup by name must find this instance.
            if old != SYSTEM_SHUNT && emptied && !curr.has_waiters() {
                registry.dispatchers.remove(&old);
                registry.members.remove(&old);
                // FIFO survives the migration: queued items move before the
                // old worker is told to drain out.
                curr.transfer(&dispatcher);
                self.events().emit_shunt_channel_closed(self, &old);
                curr.close();
            }
        }

        registry.curr.insert(cid.clone(), dispatcher);
        registry
            .members
            .entry(name.to_string())
            .or_default()
            .insert(cid);
    }

    /// Detaches `conn` from its current non-system shunt, tearing the shunt
    /// down once its last member leaves and no async work is outstanding.
    pub fn release_shunt(&self, conn: &Arc<Conn>) {
        let cid = conn.id();
        let Ok(mut registry) = self.registry.write() else {
            return;
        };
        let Some(curr) = registry.curr.get(&cid).cloned() else {
            return;
        };
        if curr.name() == SYSTEM_SHUNT {
            return;
        }
        let name = curr.name().to_string();
        if let Some(members) = registry.members.get_mut(&name) {
            members.remove(&cid);
        }
        let emptied = registry
            .members
            .get(&name)
            .map(|members| members.is_empty())
            .unwrap_or(true);
        if emptied && !curr.has_waiters() {
            registry.dispatchers.remove(&name);
            registry.members.remove(&name);
            self.events().emit_shunt_channel_closed(self, &name);
            curr.close();
        }
        registry.curr.remove(&cid);
    }

    /// Whether a shunt with the given name exists.
    pub fn has_shunt(&self, name: &str) -> bool {
        self.registry
            .read()
            .map(|r| r.dispatchers.contains_key(name))
            .unwrap_or(false)
    }

    /// The shunt `conn` currently dispatches on; `"system"` if unbound.
    pub fn get_conn_curr_shunt(&self, conn: &Arc<Conn>) -> String {
        self.registry
            .read()
            .ok()
            .and_then(|r| r.curr.get(&conn.id()).map(|d| d.name().to_string()))
            .unwrap_or_else(|| SYSTEM_SHUNT.to_string())
    }

    /// Number of live named shunts.
    pub fn get_shunt_num(&self) -> usize {
        self.registry.read().map(|r| r.dispatchers.len()).unwrap_or(0)
    }

    /// The dispatcher a message bound to `conn` should run on: the
    /// connection's current shunt, or the system dispatcher when the
    /// connection is absent or unbound.
    pub(crate) fn conn_dispatcher(&self, conn: Option<&Arc<Conn>>) -> Option<Dispatcher> {
        let Some(conn) = conn else {
            return self.system.get().cloned();
        };
        let bound = self
            .registry
            .read()
            .ok()
            .and_then(|r| r.curr.get(&conn.id()).cloned());
        bound.or_else(|| self.system.get().cloned())
    }
}
