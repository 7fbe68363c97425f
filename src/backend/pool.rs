//! Reference-counted sharing of backend connections by address.

use super::conn::BackendConn;
use crate::config::ProxyConfig;
use crate::hashkey;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing::debug;

/// The `parallel` connections one pool keeps for one address.
///
/// A request picks its connection by hashing `(database, seed)`, pinning a
/// client's stream to one connection while fanning clients out.
pub struct SharedBackendConn {
    addr: String,
    conns: Vec<Arc<BackendConn>>,
    // Mutated only under the owning pool's map lock.
    refcount: AtomicUsize,
}

impl SharedBackendConn {
    /// The shared address.
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// Number of connections kept for this address.
    pub fn parallel(&self) -> usize {
        self.conns.len()
    }

    /// The connection pinned to `(database, seed)`.
    pub fn conn(&self, database: u32, seed: u64) -> Arc<BackendConn> {
        let index = hashkey::pool_index(database, seed, self.conns.len());
        self.conns[index].clone()
    }

    /// Like [`conn`](Self::conn), but only while the connection is up.
    pub fn healthy_conn(&self, database: u32, seed: u64) -> Option<Arc<BackendConn>> {
        let conn = self.conn(database, seed);
        if conn.is_healthy() {
            Some(conn)
        } else {
            None
        }
    }

    /// Ping every connection, rate-limited per connection.
    pub fn keep_alive(&self) {
        for conn in &self.conns {
            conn.keep_alive();
        }
    }

    fn close_all(&self) {
        for conn in &self.conns {
            conn.close();
        }
    }
}

/// Interns backend connections by address.
///
/// `retain` hands out reference-counted entries; the reaching-zero
/// `release` closes the connections and removes the entry, so a retain
/// racing the final release either reuses the live entry or creates a
/// fresh one after the close.
pub struct SharedBackendPool {
    config: Arc<ProxyConfig>,
    parallel: usize,
    entries: Mutex<HashMap<String, Arc<SharedBackendConn>>>,
}

impl SharedBackendPool {
    pub fn new(config: Arc<ProxyConfig>, parallel: usize) -> Self {
        Self {
            config,
            parallel: parallel.max(1),
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Share the connections for `addr`, opening them on first use.
    pub fn retain(&self, addr: &str) -> Arc<SharedBackendConn> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get(addr) {
            entry.refcount.fetch_add(1, Ordering::SeqCst);
            return entry.clone();
        }
        debug!(%addr, parallel = self.parallel, "pool opens backend");
        let conns = (0..self.parallel)
            .map(|_| BackendConn::new(addr, &self.config))
            .collect();
        let entry = Arc::new(SharedBackendConn {
            addr: addr.to_string(),
            conns,
            refcount: AtomicUsize::new(1),
        });
        entries.insert(addr.to_string(), entry.clone());
        entry
    }

    /// Drop one reference; the last one closes the connections.
    pub fn release(&self, shared: &Arc<SharedBackendConn>) {
        let mut entries = self.entries.lock();
        if shared.refcount.fetch_sub(1, Ordering::SeqCst) == 1 {
            entries.remove(shared.addr());
            shared.close_all();
            debug!(addr = %shared.addr(), "pool closes backend");
        }
    }

    /// Borrow the entry for `addr` without counting a reference. The
    /// caller must not outlive the current retainers.
    pub fn get(&self, addr: &str) -> Option<Arc<SharedBackendConn>> {
        self.entries.lock().get(addr).cloned()
    }

    /// Ping every connection of every entry.
    pub fn keep_alive(&self) {
        let entries: Vec<_> = self.entries.lock().values().cloned().collect();
        for entry in entries {
            entry.keep_alive();
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}
