//! Routing slots and the dispatch/reconfiguration barrier.
//!
//! A slot arbitrates between concurrent dispatch and topology changes with
//! a barrier of two parts: a blocked flag that parks new requests, and a
//! refcount of requests already routed through the slot. Reconfiguration
//! blocks the slot, waits for the refcount to drain, swaps the bindings
//! under a short write lock, and unblocks. Stalls are confined to the one
//! slot being reconfigured.

use crate::backend::{BackendConn, SharedBackendConn, SharedBackendPool};
use crate::error::{Result, RoutingError};
use crate::forward;
use crate::models::{ForwardKind, GroupId, SlotDescriptor};
use crate::request::{reject, Request};
use parking_lot::{Mutex, RwLock};
use std::fmt;
use std::sync::Arc;
use tokio::sync::Notify;

struct BarrierState {
    blocked: bool,
    refs: usize,
}

/// The slot's drain barrier. The blocked flag and the refcount are checked
/// and moved together under one mutex, so a request is either counted
/// before the drain begins or parked until it ends.
struct Barrier {
    state: Mutex<BarrierState>,
    unblocked: Notify,
    drained: Notify,
}

impl Barrier {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(BarrierState {
                blocked: false,
                refs: 0,
            }),
            unblocked: Notify::new(),
            drained: Notify::new(),
        })
    }

    /// Wait for the barrier to open, then count one in-flight request.
    async fn acquire(barrier: &Arc<Barrier>) -> SlotToken {
        loop {
            let notified = barrier.unblocked.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            {
                let mut state = barrier.state.lock();
                if !state.blocked {
                    state.refs += 1;
                    return SlotToken {
                        barrier: barrier.clone(),
                    };
                }
            }
            notified.await;
        }
    }

    fn block(&self) {
        self.state.lock().blocked = true;
    }

    fn unblock(&self) {
        self.state.lock().blocked = false;
        self.unblocked.notify_waiters();
    }

    fn is_blocked(&self) -> bool {
        self.state.lock().blocked
    }

    async fn wait_drained(&self) {
        loop {
            let notified = self.drained.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            if self.state.lock().refs == 0 {
                return;
            }
            notified.await;
        }
    }

    #[cfg(test)]
    fn refs(&self) -> usize {
        self.state.lock().refs
    }
}

/// One in-flight request's share of its slot's refcount. Dropping the
/// token (when the request resolves) releases the slot.
pub(crate) struct SlotToken {
    barrier: Arc<Barrier>,
}

impl Drop for SlotToken {
    fn drop(&mut self) {
        let mut state = self.barrier.state.lock();
        state.refs -= 1;
        let drained = state.refs == 0;
        drop(state);
        if drained {
            self.barrier.drained.notify_waiters();
        }
    }
}

impl fmt::Debug for SlotToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("SlotToken")
    }
}

struct Binding {
    conn: Arc<SharedBackendConn>,
    group: GroupId,
}

#[derive(Default)]
struct SlotState {
    backend: Option<Binding>,
    migrate: Option<Binding>,
    replica_groups: Vec<Vec<Arc<SharedBackendConn>>>,
    method: ForwardKind,
    switched: bool,
}

struct Route {
    method: ForwardKind,
    target: Arc<BackendConn>,
    probe: Option<Arc<BackendConn>>,
}

/// One routing cell of the fixed slot space.
pub struct Slot {
    id: usize,
    state: RwLock<SlotState>,
    barrier: Arc<Barrier>,
}

impl Slot {
    pub(crate) fn new(id: usize) -> Self {
        Self {
            id,
            state: RwLock::new(SlotState::default()),
            barrier: Barrier::new(),
        }
    }

    /// The slot's id within the slot space.
    pub fn id(&self) -> usize {
        self.id
    }

    /// Route one request through this slot.
    ///
    /// Suspends while the barrier is held. Fails with a routing error when
    /// no backend is bound; the request's completion carries the same
    /// error.
    pub async fn forward(&self, mut request: Request, hkey: &[u8]) -> Result<()> {
        let token = Barrier::acquire(&self.barrier).await;
        request.attach_token(token);

        let route = {
            let state = self.state.read();
            match Self::route(&state, &request) {
                Some(route) => route,
                None => {
                    drop(state);
                    return Err(reject(request, RoutingError::SlotNotReady(self.id).into()));
                }
            }
        };

        match route.method {
            ForwardKind::Sync => {
                if let Some(source) = route.probe.filter(|_| !hkey.is_empty()) {
                    if let Err(e) =
                        forward::probe_migrate(&source, hkey, request.database, request.seed).await
                    {
                        return Err(reject(request, e));
                    }
                }
                route.target.push_back(request);
                Ok(())
            }
            ForwardKind::SemiAsync => {
                match route.probe.filter(|_| !hkey.is_empty()) {
                    Some(source) => forward::probe_then_forward(source, route.target, request, hkey),
                    None => route.target.push_back(request),
                }
                Ok(())
            }
        }
    }

    fn route(state: &SlotState, request: &Request) -> Option<Route> {
        let backend = state.backend.as_ref()?;
        let (database, seed) = (request.database, request.seed);
        let probe = state.migrate.as_ref().map(|m| m.conn.conn(database, seed));
        // Replicas are bypassed while the slot is migrating.
        let target = if probe.is_none() && !request.master_only && !state.replica_groups.is_empty()
        {
            Self::replica_walk(&state.replica_groups, database, seed)
                .unwrap_or_else(|| backend.conn.conn(database, seed))
        } else {
            backend.conn.conn(database, seed)
        };
        Some(Route {
            method: state.method,
            target,
            probe,
        })
    }

    /// Seed-offset round robin over the replica groups, first healthy
    /// member wins.
    fn replica_walk(
        groups: &[Vec<Arc<SharedBackendConn>>],
        database: u32,
        seed: u64,
    ) -> Option<Arc<BackendConn>> {
        for group in groups {
            if group.is_empty() {
                continue;
            }
            let mut index = seed as usize % group.len();
            for _ in 0..group.len() {
                index = (index + 1) % group.len();
                if let Some(conn) = group[index].healthy_conn(database, seed) {
                    return Some(conn);
                }
            }
        }
        None
    }

    /// Hold the barrier and wait for in-flight requests to drain. New
    /// requests park until [`unblock`](Self::unblock).
    pub async fn block_and_wait(&self) {
        self.barrier.block();
        self.barrier.wait_drained().await;
    }

    /// Reopen the barrier and wake parked requests. Only the holder of the
    /// barrier may call this.
    pub fn unblock(&self) {
        self.barrier.unblock();
    }

    /// Whether the barrier is currently held.
    pub fn is_blocked(&self) -> bool {
        self.barrier.is_blocked()
    }

    pub(crate) fn switched(&self) -> bool {
        self.state.read().switched
    }

    /// A copy of the slot's routing state for external inspection.
    pub fn snapshot(&self) -> SlotDescriptor {
        let state = self.state.read();
        SlotDescriptor {
            id: self.id,
            backend_addr: state.backend.as_ref().map(|b| b.conn.addr().to_string()),
            backend_group: state.backend.as_ref().map(|b| b.group).unwrap_or_default(),
            migrate_from: state.migrate.as_ref().map(|m| m.conn.addr().to_string()),
            migrate_from_group: state.migrate.as_ref().map(|m| m.group).unwrap_or_default(),
            replica_groups: state
                .replica_groups
                .iter()
                .map(|group| group.iter().map(|c| c.addr().to_string()).collect())
                .collect(),
            forward_method: state.method,
            locked: self.barrier.is_blocked(),
            switched: state.switched,
        }
    }

    /// The atomic reconfiguration: barrier the slot, release every old
    /// handle, retain the new ones, install the method, and unblock unless
    /// the descriptor requests a persistent lock.
    pub(crate) async fn fill(
        &self,
        descriptor: &SlotDescriptor,
        switched: bool,
        method: Option<ForwardKind>,
        primary: &SharedBackendPool,
        replica: &SharedBackendPool,
        primary_only: bool,
    ) {
        self.block_and_wait().await;
        {
            let mut state = self.state.write();
            if let Some(binding) = state.backend.take() {
                primary.release(&binding.conn);
            }
            if let Some(binding) = state.migrate.take() {
                primary.release(&binding.conn);
            }
            for group in std::mem::take(&mut state.replica_groups) {
                for conn in group {
                    replica.release(&conn);
                }
            }

            state.switched = switched;

            if let Some(addr) = descriptor.backend_addr.as_deref().filter(|a| !a.is_empty()) {
                state.backend = Some(Binding {
                    conn: primary.retain(addr),
                    group: descriptor.backend_group,
                });
            }
            if let Some(from) = descriptor.migrate_from.as_deref().filter(|a| !a.is_empty()) {
                state.migrate = Some(Binding {
                    conn: primary.retain(from),
                    group: descriptor.migrate_from_group,
                });
            }
            if !primary_only {
                for addrs in &descriptor.replica_groups {
                    let group: Vec<_> = addrs
                        .iter()
                        .filter(|a| !a.is_empty())
                        .map(|a| replica.retain(a))
                        .collect();
                    if !group.is_empty() {
                        state.replica_groups.push(group);
                    }
                }
            }
            if let Some(method) = method {
                state.method = method;
            }
        }
        if !descriptor.locked {
            self.unblock();
        }
    }
}
