//! The routing table: 1024 slots, two connection pools, and the control
//! surface the topology coordinator drives.
//!
//! Dispatch and keep-alive run under the read lock; topology mutations are
//! serialized by the admin mutex and touch the router state lock only
//! briefly. The per-slot barrier is the only lock held across a drain, so
//! reconfiguring one slot never stalls the others.

use crate::backend::InfoCache;
use crate::config::ProxyConfig;
use crate::error::{Result, RoutingError};
use crate::hashkey;
use crate::models::{ForwardKind, GroupId, SlotDescriptor, MAX_SLOT_NUM};
use crate::request::{reject, Request};
use crate::slot::Slot;
use crate::backend::SharedBackendPool;
use parking_lot::RwLock;
use std::collections::HashMap;
use tokio::sync::Mutex;
use tracing::{info, warn};

#[derive(Default)]
struct RouterState {
    online: bool,
    closed: bool,
}

/// Entry point for dispatch and topology mutation.
pub struct Router {
    config: std::sync::Arc<ProxyConfig>,
    primary: SharedBackendPool,
    replica: SharedBackendPool,
    slots: Vec<Slot>,
    state: RwLock<RouterState>,
    // Serializes fill, switch and close so at most one reconfiguration
    // drains a slot at a time.
    admin: Mutex<()>,
}

impl Router {
    /// Build a router with empty slots. The external controller pushes the
    /// routing table afterwards.
    pub fn new(config: ProxyConfig) -> Self {
        let config = std::sync::Arc::new(config);
        let primary = SharedBackendPool::new(config.clone(), config.backend_primary_parallel);
        let replica = SharedBackendPool::new(config.clone(), config.backend_replica_parallel);
        let slots = (0..MAX_SLOT_NUM).map(Slot::new).collect();
        Self {
            config,
            primary,
            replica,
            slots,
            state: RwLock::new(RouterState::default()),
            admin: Mutex::new(()),
        }
    }

    /// Mark the router online. No-op once closed.
    pub fn start(&self) {
        let mut state = self.state.write();
        if state.closed {
            return;
        }
        state.online = true;
    }

    /// Close the router and reconfigure every slot to the empty state,
    /// releasing all connection handles.
    pub async fn close(&self) {
        {
            let mut state = self.state.write();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        let _admin = self.admin.lock().await;
        for id in 0..MAX_SLOT_NUM {
            self.refill(&SlotDescriptor::new(id), false, None).await;
        }
        info!("router closed");
    }

    pub fn is_online(&self) -> bool {
        let state = self.state.read();
        state.online && !state.closed
    }

    pub fn is_closed(&self) -> bool {
        self.state.read().closed
    }

    /// Snapshots of every slot.
    pub fn get_slots(&self) -> Vec<SlotDescriptor> {
        self.slots.iter().map(|slot| slot.snapshot()).collect()
    }

    /// Snapshot of one slot, `None` for an invalid id.
    pub fn get_slot(&self, id: usize) -> Option<SlotDescriptor> {
        self.slots.get(id).map(|slot| slot.snapshot())
    }

    /// Whether any slot's last reconfiguration came from a master switch.
    pub fn has_switched(&self) -> bool {
        self.slots.iter().any(|slot| slot.switched())
    }

    /// Ping every pooled connection.
    pub fn keep_alive(&self) -> Result<()> {
        let state = self.state.read();
        if state.closed {
            return Err(RoutingError::ClosedRouter.into());
        }
        self.primary.keep_alive();
        self.replica.keep_alive();
        Ok(())
    }

    /// Reconfigure one slot from a controller descriptor.
    pub async fn fill_slot(&self, descriptor: &SlotDescriptor) -> Result<()> {
        let _admin = self.admin.lock().await;
        if self.is_closed() {
            return Err(RoutingError::ClosedRouter.into());
        }
        if descriptor.id >= MAX_SLOT_NUM {
            return Err(RoutingError::InvalidSlotId(descriptor.id).into());
        }
        self.refill(descriptor, false, Some(descriptor.forward_method))
            .await;
        Ok(())
    }

    /// Reconfigure a batch of slots in order.
    pub async fn fill_slots(&self, descriptors: &[SlotDescriptor]) -> Result<()> {
        for descriptor in descriptors {
            self.fill_slot(descriptor).await?;
        }
        Ok(())
    }

    /// Rebind every slot whose backend or migration group moved to a new
    /// master. Addresses backed by the same run-id are left untouched;
    /// rebound slots keep their forwarding method and are marked switched.
    pub async fn switch_masters(&self, masters: &HashMap<GroupId, String>) -> Result<()> {
        let _admin = self.admin.lock().await;
        if self.is_closed() {
            return Err(RoutingError::ClosedRouter.into());
        }
        let mut cache = InfoCache::new(
            self.config.product_auth.clone(),
            self.config.switch_probe_timeout,
        );
        for id in 0..MAX_SLOT_NUM {
            self.try_switch_master(id, masters, &mut cache).await;
        }
        Ok(())
    }

    async fn try_switch_master(
        &self,
        id: usize,
        masters: &HashMap<GroupId, String>,
        cache: &mut InfoCache,
    ) {
        let mut descriptor = self.slots[id].snapshot();
        let mut switched = false;

        if let Some(addr) = masters.get(&descriptor.backend_group).filter(|a| !a.is_empty()) {
            let current = descriptor.backend_addr.clone().unwrap_or_default();
            if !has_same_run_id(cache, addr, &current).await {
                descriptor.backend_addr = Some(addr.clone());
                switched = true;
            }
        }
        if let Some(addr) = masters
            .get(&descriptor.migrate_from_group)
            .filter(|a| !a.is_empty())
        {
            let current = descriptor.migrate_from.clone().unwrap_or_default();
            if !has_same_run_id(cache, addr, &current).await {
                descriptor.migrate_from = Some(addr.clone());
                switched = true;
            }
        }

        if switched {
            self.refill(&descriptor, true, None).await;
        }
    }

    /// Dispatch by key hash: slot = crc32(hash key) mod the slot space.
    pub async fn dispatch(&self, request: Request) -> Result<()> {
        if self.is_closed() {
            return Err(reject(request, RoutingError::ClosedRouter.into()));
        }
        let hkey = hashkey::hash_key(&request.multi, &request.op).to_vec();
        let id = hashkey::slot_of(&hkey);
        self.slots[id].forward(request, &hkey).await
    }

    /// Dispatch to an externally chosen slot, bypassing key hashing.
    pub async fn dispatch_slot(&self, request: Request, id: usize) -> Result<()> {
        if self.is_closed() {
            return Err(reject(request, RoutingError::ClosedRouter.into()));
        }
        if id >= MAX_SLOT_NUM {
            return Err(reject(request, RoutingError::InvalidSlotId(id).into()));
        }
        self.slots[id].forward(request, b"").await
    }

    /// Push onto any pooled connection for `addr`, primary pool first.
    /// Returns `false` when neither pool holds a live connection; the
    /// request's completion then resolves with a transport error.
    pub fn dispatch_addr(&self, request: Request, addr: &str) -> bool {
        let _state = self.state.read();
        for pool in [&self.primary, &self.replica] {
            if let Some(shared) = pool.get(addr) {
                if let Some(conn) = shared.healthy_conn(request.database, request.seed) {
                    conn.push_back(request);
                    return true;
                }
            }
        }
        false
    }

    async fn refill(
        &self,
        descriptor: &SlotDescriptor,
        switched: bool,
        method: Option<ForwardKind>,
    ) {
        let slot = &self.slots[descriptor.id];
        slot.fill(
            descriptor,
            switched,
            method,
            &self.primary,
            &self.replica,
            self.config.backend_primary_only,
        )
        .await;
        if !self.is_closed() {
            let snapshot = slot.snapshot();
            warn!(
                slot = snapshot.id,
                backend = snapshot.backend_addr.as_deref().unwrap_or(""),
                migrate_from = snapshot.migrate_from.as_deref().unwrap_or(""),
                locked = snapshot.locked,
                switched = snapshot.switched,
                "fill slot"
            );
        }
    }
}

async fn has_same_run_id(cache: &mut InfoCache, addr1: &str, addr2: &str) -> bool {
    if addr1 == addr2 {
        return true;
    }
    let rid1 = cache.run_id(addr1).await;
    let rid2 = cache.run_id(addr2).await;
    matches!((rid1, rid2), (Some(a), Some(b)) if a == b)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{Error, TransportError};
    use crate::resp::RespFrame;
    use crate::testing::MockBackend;
    use std::sync::Arc;
    use std::time::Duration;
    use tokio::time::{sleep, timeout};

    fn command(parts: &[&str]) -> Vec<RespFrame> {
        parts.iter().map(|p| RespFrame::bulk(p.to_string())).collect()
    }

    fn new_request(parts: &[&str]) -> (Request, crate::request::ResponseHandle) {
        Request::new(command(parts), 0, 0)
    }

    #[tokio::test]
    async fn dispatch_routes_by_key_hash() {
        let backend = MockBackend::start().await.unwrap();
        backend.set_reply(b"GET", RespFrame::bulk("bar"));
        let router = Router::new(ProxyConfig::default());
        router.start();
        assert!(router.is_online());

        let id = hashkey::slot_of(b"foo");
        let descriptor = SlotDescriptor::new(id).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let (request, handle) = new_request(&["GET", "foo"]);
        router.dispatch(request).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), RespFrame::bulk("bar"));
        assert_eq!(backend.commands()[0], vec![&b"GET"[..], &b"foo"[..]]);
    }

    #[tokio::test]
    async fn hash_tags_co_locate_keys() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());

        let id = hashkey::slot_of(b"tag");
        let descriptor = SlotDescriptor::new(id).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let (request, handle) = new_request(&["GET", "{tag}.anything"]);
        router.dispatch(request).await.unwrap();
        handle.wait().await.unwrap();
        assert_eq!(backend.command_count(), 1);
    }

    #[tokio::test]
    async fn dispatch_slot_bypasses_hashing() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(42).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let (request, handle) = new_request(&["PING"]);
        router.dispatch_slot(request, 42).await.unwrap();
        assert_eq!(handle.wait().await.unwrap(), RespFrame::simple("PONG"));
    }

    #[tokio::test]
    async fn dispatch_slot_validates_the_id() {
        let router = Router::new(ProxyConfig::default());
        let (request, handle) = new_request(&["PING"]);
        let err = router.dispatch_slot(request, MAX_SLOT_NUM).await.unwrap_err();
        assert_eq!(err, Error::Routing(RoutingError::InvalidSlotId(MAX_SLOT_NUM)));
        assert_eq!(handle.wait().await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn dispatch_addr_prefers_the_primary_pool() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(0).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();
        sleep(Duration::from_millis(50)).await;

        let (request, handle) = new_request(&["PING"]);
        assert!(router.dispatch_addr(request, &backend.addr()));
        assert_eq!(handle.wait().await.unwrap(), RespFrame::simple("PONG"));

        let (request, _handle) = new_request(&["PING"]);
        assert!(!router.dispatch_addr(request, "10.9.9.9:6379"));
    }

    #[tokio::test]
    async fn fill_slot_validates_input() {
        let router = Router::new(ProxyConfig::default());
        let err = router
            .fill_slot(&SlotDescriptor::new(MAX_SLOT_NUM))
            .await
            .unwrap_err();
        assert_eq!(err, Error::Routing(RoutingError::InvalidSlotId(MAX_SLOT_NUM)));
    }

    #[tokio::test]
    async fn refill_drains_before_rebinding() {
        crate::testing::init_tracing();
        let old = MockBackend::start().await.unwrap();
        let new = MockBackend::start().await.unwrap();
        let router = Arc::new(Router::new(ProxyConfig::default()));
        let descriptor = SlotDescriptor::new(5).with_backend(old.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        // Park one request in flight on the old backend.
        old.hold();
        let (request, handle) = new_request(&["GET", "k"]);
        router.dispatch_slot(request, 5).await.unwrap();

        let refill = {
            let router = router.clone();
            let descriptor = SlotDescriptor::new(5).with_backend(new.addr(), 2);
            tokio::spawn(async move { router.fill_slot(&descriptor).await })
        };
        sleep(Duration::from_millis(50)).await;
        assert!(!refill.is_finished());
        assert!(router.get_slot(5).unwrap().locked);

        // Releasing the pending response lets the drain finish.
        old.release();
        assert_eq!(handle.wait().await.unwrap(), RespFrame::simple("OK"));
        timeout(Duration::from_secs(1), refill)
            .await
            .unwrap()
            .unwrap()
            .unwrap();

        // The old handle was the last reference; its entry is gone.
        assert!(router.primary.get(&old.addr()).is_none());
        let snapshot = router.get_slot(5).unwrap();
        assert_eq!(snapshot.backend_addr.as_deref(), Some(&*new.addr()));
        assert!(!snapshot.locked);

        let (request, handle) = new_request(&["GET", "k"]);
        router.dispatch_slot(request, 5).await.unwrap();
        handle.wait().await.unwrap();
        assert_eq!(new.commands().last().unwrap()[0], &b"GET"[..]);
    }

    #[tokio::test]
    async fn shared_backend_survives_one_slot_refill() {
        let shared = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        for id in [1, 2] {
            let descriptor = SlotDescriptor::new(id).with_backend(shared.addr(), 1);
            router.fill_slot(&descriptor).await.unwrap();
        }

        router.fill_slot(&SlotDescriptor::new(1)).await.unwrap();
        // Slot 2 still references the address.
        assert!(router.primary.get(&shared.addr()).is_some());

        router.fill_slot(&SlotDescriptor::new(2)).await.unwrap();
        assert!(router.primary.get(&shared.addr()).is_none());
    }

    #[tokio::test]
    async fn close_empties_every_slot() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        router.start();
        let descriptor = SlotDescriptor::new(7).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        router.close().await;
        assert!(router.is_closed());
        assert!(!router.is_online());
        assert!(router.get_slot(7).unwrap().backend_addr.is_none());
        assert!(router.primary.get(&backend.addr()).is_none());

        let err = router.fill_slot(&SlotDescriptor::new(0)).await.unwrap_err();
        assert_eq!(err, Error::Routing(RoutingError::ClosedRouter));
        assert!(router.keep_alive().is_err());

        let (request, handle) = new_request(&["GET", "k"]);
        let err = router.dispatch(request).await.unwrap_err();
        assert_eq!(err, Error::Routing(RoutingError::ClosedRouter));
        assert_eq!(handle.wait().await.unwrap_err(), err);
    }

    #[tokio::test]
    async fn switch_masters_same_address_is_a_noop() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(3).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let masters = HashMap::from([(1, backend.addr())]);
        router.switch_masters(&masters).await.unwrap();

        assert!(!router.has_switched());
        let snapshot = router.get_slot(3).unwrap();
        assert_eq!(snapshot.backend_addr.as_deref(), Some(&*backend.addr()));
        assert!(!snapshot.switched);
    }

    #[tokio::test]
    async fn switch_masters_same_address_differing_run_id_is_a_noop() {
        let backend = MockBackend::start().await.unwrap();
        backend.set_run_id("rid-before");
        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(3).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        // The backend restarts into a different run id, but the group
        // still maps to the same address string.
        backend.set_run_id("rid-after");
        let masters = HashMap::from([(1, backend.addr())]);
        router.switch_masters(&masters).await.unwrap();

        // Equal addresses short-circuit: no switch, and the run id is
        // never even probed.
        assert!(!router.has_switched());
        let snapshot = router.get_slot(3).unwrap();
        assert_eq!(snapshot.backend_addr.as_deref(), Some(&*backend.addr()));
        assert!(!snapshot.switched);
        assert!(backend
            .commands()
            .iter()
            .all(|command| command[0] != &b"INFO"[..]));
    }

    #[tokio::test]
    async fn switch_masters_same_run_id_is_a_noop() {
        let old = MockBackend::start().await.unwrap();
        old.set_run_id("same-rid");
        let new = MockBackend::start().await.unwrap();
        new.set_run_id("same-rid");

        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(3).with_backend(old.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let masters = HashMap::from([(1, new.addr())]);
        router.switch_masters(&masters).await.unwrap();

        assert!(!router.has_switched());
        assert_eq!(
            router.get_slot(3).unwrap().backend_addr.as_deref(),
            Some(&*old.addr())
        );
    }

    #[tokio::test]
    async fn switch_masters_rebinds_on_differing_run_id() {
        crate::testing::init_tracing();
        let old = MockBackend::start().await.unwrap();
        old.set_run_id("rid-old");
        let new = MockBackend::start().await.unwrap();
        new.set_run_id("rid-new");

        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(3)
            .with_backend(old.addr(), 1)
            .with_forward_method(ForwardKind::SemiAsync);
        router.fill_slot(&descriptor).await.unwrap();

        let masters = HashMap::from([(1, new.addr())]);
        router.switch_masters(&masters).await.unwrap();

        assert!(router.has_switched());
        let snapshot = router.get_slot(3).unwrap();
        assert_eq!(snapshot.backend_addr.as_deref(), Some(&*new.addr()));
        assert!(snapshot.switched);
        // The switch path reuses the installed forwarding method.
        assert_eq!(snapshot.forward_method, ForwardKind::SemiAsync);

        // A controller refill clears the switched flag.
        let descriptor = SlotDescriptor::new(3).with_backend(new.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();
        assert!(!router.has_switched());
    }

    #[tokio::test]
    async fn switch_masters_rebinds_the_migration_source() {
        let backend = MockBackend::start().await.unwrap();
        let old_source = MockBackend::start().await.unwrap();
        old_source.set_run_id("rid-a");
        let new_source = MockBackend::start().await.unwrap();
        new_source.set_run_id("rid-b");

        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(4)
            .with_backend(backend.addr(), 1)
            .with_migrate_from(old_source.addr(), 2);
        router.fill_slot(&descriptor).await.unwrap();

        let masters = HashMap::from([(2, new_source.addr())]);
        router.switch_masters(&masters).await.unwrap();

        let snapshot = router.get_slot(4).unwrap();
        assert_eq!(snapshot.migrate_from.as_deref(), Some(&*new_source.addr()));
        assert!(snapshot.switched);
        // The backend binding is untouched.
        assert_eq!(snapshot.backend_addr.as_deref(), Some(&*backend.addr()));
    }

    #[tokio::test]
    async fn keep_alive_walks_both_pools() {
        let backend = MockBackend::start().await.unwrap();
        let replica = MockBackend::start().await.unwrap();
        let config = ProxyConfig::default().with_keepalive_period(Duration::from_secs(60));
        let router = Router::new(config);
        let descriptor = SlotDescriptor::new(0)
            .with_backend(backend.addr(), 1)
            .with_replica_group(vec![replica.addr()]);
        router.fill_slot(&descriptor).await.unwrap();

        router.keep_alive().unwrap();
        for _ in 0..50 {
            if backend.command_count() > 0 && replica.command_count() > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.commands()[0][0], &b"PING"[..]);
        assert_eq!(replica.commands()[0][0], &b"PING"[..]);
    }

    #[tokio::test]
    async fn abandoned_handle_discards_the_response() {
        let backend = MockBackend::start().await.unwrap();
        let router = Router::new(ProxyConfig::default());
        let descriptor = SlotDescriptor::new(0).with_backend(backend.addr(), 1);
        router.fill_slot(&descriptor).await.unwrap();

        let (request, handle) = new_request(&["GET", "k"]);
        drop(handle);
        router.dispatch_slot(request, 0).await.unwrap();

        // The backend still answers; the resolve is a silent discard.
        for _ in 0..50 {
            if backend.command_count() > 0 {
                break;
            }
            sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(backend.command_count(), 1);
    }

    #[tokio::test]
    async fn unreachable_backend_fails_requests_with_transport_error() {
        let router = Router::new(ProxyConfig::default().with_connect_timeout(Duration::from_millis(200)));
        let descriptor = SlotDescriptor::new(0).with_backend("127.0.0.1:1", 1);
        router.fill_slot(&descriptor).await.unwrap();

        let (request, handle) = new_request(&["GET", "k"]);
        router.dispatch_slot(request, 0).await.unwrap();
        let err = handle.wait().await.unwrap_err();
        assert_eq!(err, Error::Transport(TransportError::ConnectionReset));
    }
}
