//! `Dispatcher`: binds `(client, virtual service)` pairs to backends,
//! grounded on `original_source/ryu_ctrl/Dispatcher.py`.

use crate::scheduler::Scheduler;
use dashmap::DashMap;
use edge_cluster::ServiceManifest;
use edge_core::{Dpid, Ipv4Addr, Service, SocketAddr4};
use edge_manager::{ManagerError, ServiceManager, Switch};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("deploy failed for service {vaddr}: {source}")]
    DeployFailed {
        vaddr: SocketAddr4,
        #[source]
        source: ManagerError,
    },
}

/// How many concurrent deploy/wait worker tasks the dispatcher will run at
/// once, mirroring the bounded `ThreadPoolExecutor` in the original
/// (`SPEC_FULL.md` §5).
const DEFAULT_WORKER_PERMITS: usize = 64;

/// Resolves `addr`'s mac from the switch's learned host table (ARP learning
/// itself is out of scope, per `SPEC_FULL.md` §1). Returns `addr` unchanged,
/// still mac-less, if the host hasn't been learned yet.
fn resolve_backend_mac(switch: &Switch, addr: SocketAddr4) -> SocketAddr4 {
    match switch.hosts.get(&addr.ip) {
        Some(host) => SocketAddr4::with_mac(addr.ip, addr.port, host.mac),
        None => addr,
    }
}

/// Binds `(client, virtual service)` pairs to a concrete backend, consulting
/// flow memory first, then the service manager/scheduler, kicking off a
/// cancel-safe async deploy when no ready instance exists yet.
///
/// The flow-setup callback receives the backend address to rewrite the flow
/// to (mac populated whenever the switch has already learned it); the
/// pipeline installs the forward/return flow-mods and the caller's
/// packet-out from there (`SPEC_FULL.md` §4.8).
pub struct Dispatcher {
    manager: Arc<ServiceManager>,
    memory: Arc<edge_flowmem::FlowMemory>,
    scheduler: Arc<dyn Scheduler>,
    manifest_loader: Arc<dyn Fn(&Service) -> Result<ServiceManifest, ManagerError> + Send + Sync>,
    worker_permits: Arc<Semaphore>,
    client_locations: DashMap<Ipv4Addr, Dpid>,
}

impl Dispatcher {
    pub fn new(
        manager: Arc<ServiceManager>,
        memory: Arc<edge_flowmem::FlowMemory>,
        scheduler: Arc<dyn Scheduler>,
        manifest_loader: impl Fn(&Service) -> Result<ServiceManifest, ManagerError> + Send + Sync + 'static,
    ) -> Self {
        Self::with_worker_permits(manager, memory, scheduler, manifest_loader, DEFAULT_WORKER_PERMITS)
    }

    pub fn with_worker_permits(
        manager: Arc<ServiceManager>,
        memory: Arc<edge_flowmem::FlowMemory>,
        scheduler: Arc<dyn Scheduler>,
        manifest_loader: impl Fn(&Service) -> Result<ServiceManifest, ManagerError> + Send + Sync + 'static,
        worker_permits: usize,
    ) -> Self {
        Self {
            manager,
            memory,
            scheduler,
            manifest_loader: Arc::new(manifest_loader),
            worker_permits: Arc::new(Semaphore::new(worker_permits)),
            client_locations: DashMap::new(),
        }
    }

    /// Entry point described in `SPEC_FULL.md` §4.5. Returns `true` if a
    /// binding was found or is being established (the caller should not fall
    /// back to default forwarding for this packet), `false` if there is no
    /// service/edge candidate at all.
    ///
    /// `on_bound` may run synchronously on the caller's thread (flow-memory
    /// hit, or an already-ready instance) or later on the worker pool (a
    /// fresh deploy/scale-up/wait); it is called at most once.
    pub async fn dispatch<F>(&self, switch: Arc<Switch>, src: SocketAddr4, dst: SocketAddr4, on_bound: F) -> bool
    where
        F: FnOnce(SocketAddr4) + Send + 'static,
    {
        self.record_client_location(src.ip, switch.dpid);

        if let Some(entry) = self.memory.get_fwd(src, dst) {
            on_bound(entry.edge);
            return true;
        }

        if let Some(mac) = dst.mac {
            switch.set_vmac(mac);
        }

        let (service, candidates) = self.manager.avail_servers(dst);
        let Some(service) = service else {
            tracing::warn!(%dst, "dispatch: destination is not a known service, falling back to default forwarding");
            return false;
        };

        let Some((edge, deployed, ready)) = self.scheduler.schedule(switch.dpid, &service, &candidates) else {
            tracing::debug!(vaddr = %service.vaddr, "dispatch: no candidate edge for this service");
            return false;
        };

        if ready > 0 {
            let Some(instance) = edge.v_services.get(&service.vaddr).map(|i| i.clone()) else {
                tracing::warn!(vaddr = %service.vaddr, "scheduler reported a ready instance that vanished");
                return false;
            };
            let Some(eaddr) = instance.eaddr else {
                tracing::warn!(vaddr = %service.vaddr, "ready instance has no resolved address");
                return false;
            };
            let resolved = resolve_backend_mac(&switch, eaddr);
            self.cache_binding(src, dst, resolved);
            on_bound(resolved);
            return true;
        }

        // No ready instance: book the (service, edge) pair on this thread
        // (the event thread) before handing off to the worker pool, so
        // concurrent dispatches for the same pair are ordered correctly.
        let wait_only = !self.manager.book_deployment(service.vaddr, edge.ip);

        let manager = self.manager.clone();
        let memory = self.memory.clone();
        let manifest_loader = self.manifest_loader.clone();
        let permits = self.worker_permits.clone();
        let deploy_service = service.clone();

        tokio::spawn(async move {
            let _permit = permits.acquire_owned().await;
            let loader = manifest_loader.clone();
            let result = manager
                .deploy(deploy_service.clone(), edge.clone(), deployed, wait_only, move |svc| (*loader)(svc))
                .await;

            match result {
                Ok((instance, _timing)) => {
                    let Some(eaddr) = instance.eaddr else {
                        tracing::warn!(vaddr = %deploy_service.vaddr, "deployed instance has no resolved address, dropping binding");
                        return;
                    };
                    let resolved = resolve_backend_mac(&switch, eaddr);
                    if resolved.mac.is_some() {
                        memory.add(src, dst, resolved);
                    } else {
                        tracing::debug!(edge = %resolved, "backend mac unknown, not caching the binding yet");
                    }
                    on_bound(resolved);
                }
                Err(err) => {
                    tracing::error!(
                        error = %DispatchError::DeployFailed { vaddr: deploy_service.vaddr, source: err },
                        "deploy failed, no binding installed for this packet"
                    );
                }
            }
        });

        true
    }

    /// Consults the return-traffic index and, on vMac drift, replaces the
    /// stored entry with one pointing at the currently observed virtual mac
    /// (`SPEC_FULL.md` §4.5, §9 open question (a): this may mask a genuine
    /// client migration and is intentionally not treated as an error).
    pub fn find_service_id(
        &self,
        switch: &Switch,
        backend_addr: SocketAddr4,
        client_ip: Ipv4Addr,
    ) -> Option<Arc<edge_flowmem::FlowEntry>> {
        let entry = self.memory.get_ret(backend_addr, client_ip)?;
        let Some(observed) = switch.vmac() else {
            return Some(entry);
        };
        if entry.dst.mac == Some(observed) {
            return Some(entry);
        }

        tracing::warn!(
            stored = ?entry.dst.mac,
            observed = %observed,
            "vMac drift detected on return traffic, updating stored binding"
        );
        let corrected_dst = SocketAddr4::with_mac(entry.dst.ip, entry.dst.port, observed);
        self.memory.remove(&entry);
        Some(self.memory.add(entry.src, corrected_dst, entry.edge))
    }

    fn cache_binding(&self, src: SocketAddr4, dst: SocketAddr4, edge_addr: SocketAddr4) {
        if edge_addr.mac.is_some() {
            self.memory.add(src, dst, edge_addr);
        } else {
            tracing::debug!(edge = %edge_addr, "backend mac unknown, not caching the binding yet");
        }
    }

    fn record_client_location(&self, client_ip: Ipv4Addr, dpid: Dpid) {
        if let Some(previous) = self.client_locations.insert(client_ip, dpid) {
            if previous != dpid {
                tracing::info!(%client_ip, from = %previous, to = %dpid, "client migrated to a new switch");
            }
        }
    }

    /// Diagnostic snapshot of the client -> dpid location map, supplemented
    /// from `Dispatcher.printClientLocations` in the original (`SPEC_FULL.md`
    /// §4.5).
    pub fn client_locations(&self) -> Vec<(Ipv4Addr, Dpid)> {
        self.client_locations.iter().map(|e| (*e.key(), *e.value())).collect()
    }

    pub fn print_client_locations(&self) {
        for (ip, dpid) in self.client_locations() {
            tracing::info!(%ip, %dpid, "client location");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scheduler::ProximityScheduler;
    use async_trait::async_trait;
    use edge_cluster::{ClusterAdapter, ClusterError};
    use edge_core::{Deployment, MacAddr, RouteTarget, ServiceInstance};
    use edge_flowmem::FlowMemory;
    use edge_manager::Edge;
    use std::time::Duration;

    struct FakeCluster {
        pod_port: u16,
    }

    #[async_trait]
    impl ClusterAdapter for FakeCluster {
        async fn connect(&self) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn deploy(&self, manifest: &ServiceManifest) -> Result<ServiceInstance, ClusterError> {
            let vaddr = SocketAddr4::new("203.0.113.9".parse().unwrap(), manifest.port);
            let mut inst = ServiceInstance::new(Service::new(vaddr, manifest.label.clone()), "10.0.2.1".parse().unwrap());
            inst.pod_addr = Some(SocketAddr4::new("127.0.0.1".parse().unwrap(), self.pod_port));
            Ok(inst)
        }

        async fn scale(&self, _instance: &ServiceInstance, _replicas: u32) -> Result<(), ClusterError> {
            Ok(())
        }

        async fn services(&self, _label: Option<&str>) -> Result<Vec<ServiceInstance>, ClusterError> {
            Ok(Vec::new())
        }

        async fn deployments(&self, _label: Option<&str>) -> Result<Vec<Deployment>, ClusterError> {
            Ok(Vec::new())
        }

        async fn pods(&self, _label: Option<&str>) -> Result<Vec<Ipv4Addr>, ClusterError> {
            Ok(Vec::new())
        }
    }

    fn manifest_loader(svc: &Service) -> Result<ServiceManifest, ManagerError> {
        ServiceManifest::parse(svc.label.clone(), svc.port(), "kind: Deployment\n")
            .map_err(|e| ManagerError::MalformedServiceFilename(e.to_string()))
    }

    async fn open_backend_listener() -> (tokio::net::TcpListener, u16) {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        (listener, port)
    }

    fn build_dispatcher() -> (Arc<ServiceManager>, Arc<FlowMemory>, Dispatcher) {
        let manager = Arc::new(ServiceManager::new(false));
        let memory = Arc::new(FlowMemory::new(Duration::from_secs(60)));
        let scheduler: Arc<dyn Scheduler> = Arc::new(ProximityScheduler::new());
        let dispatcher = Dispatcher::new(manager.clone(), memory.clone(), scheduler, manifest_loader);
        (manager, memory, dispatcher)
    }

    #[tokio::test]
    async fn cold_start_deploys_and_invokes_callback() {
        let (listener, port) = open_backend_listener().await;
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (manager, _memory, dispatcher) = build_dispatcher();

        let vaddr = SocketAddr4::new("203.0.113.9".parse().unwrap(), 80);
        manager.insert_service(Service::new(vaddr, "at.aau.hostinfo"));

        let dpid = Dpid::short(1);
        let edge = Arc::new(Edge::new("10.0.2.1".parse().unwrap(), dpid, RouteTarget::Pod, Vec::new(), None));
        edge.set_cluster(Arc::new(FakeCluster { pod_port: port }));
        let switch = Arc::new(Switch::new(dpid, "10.0.0.1".parse().unwrap(), vec![edge]));
        manager.register_switch(switch.clone());

        let (tx, rx) = tokio::sync::oneshot::channel();
        let src = SocketAddr4::new("10.0.1.5".parse().unwrap(), 41000);
        let bound = dispatcher
            .dispatch(switch, src, vaddr, move |addr| {
                let _ = tx.send(addr);
            })
            .await;
        assert!(bound);

        let addr = tokio::time::timeout(Duration::from_secs(5), rx).await.expect("no timeout").expect("callback ran");
        assert_eq!(addr.ip, "127.0.0.1".parse().unwrap());
        assert_eq!(addr.port, port);
    }

    #[tokio::test]
    async fn concurrent_dispatches_converge_on_the_same_backend() {
        let (listener, port) = open_backend_listener().await;
        tokio::spawn(async move {
            loop {
                if listener.accept().await.is_err() {
                    break;
                }
            }
        });

        let (manager, _memory, dispatcher) = build_dispatcher();
        let dispatcher = Arc::new(dispatcher);

        let vaddr = SocketAddr4::new("203.0.113.9".parse().unwrap(), 80);
        manager.insert_service(Service::new(vaddr, "at.aau.hostinfo"));

        let dpid = Dpid::short(1);
        let edge = Arc::new(Edge::new("10.0.2.1".parse().unwrap(), dpid, RouteTarget::Pod, Vec::new(), None));
        edge.set_cluster(Arc::new(FakeCluster { pod_port: port }));
        let switch = Arc::new(Switch::new(dpid, "10.0.0.1".parse().unwrap(), vec![edge]));
        manager.register_switch(switch.clone());

        let (tx1, rx1) = tokio::sync::oneshot::channel();
        let (tx2, rx2) = tokio::sync::oneshot::channel();

        let src1 = SocketAddr4::new("10.0.1.5".parse().unwrap(), 41000);
        let src2 = SocketAddr4::new("10.0.1.6".parse().unwrap(), 42000);

        let d1 = dispatcher.clone();
        let s1 = switch.clone();
        let h1 = tokio::spawn(async move {
            d1.dispatch(s1, src1, vaddr, move |addr| {
                let _ = tx1.send(addr);
            })
            .await
        });
        let d2 = dispatcher.clone();
        let s2 = switch.clone();
        let h2 = tokio::spawn(async move {
            d2.dispatch(s2, src2, vaddr, move |addr| {
                let _ = tx2.send(addr);
            })
            .await
        });

        assert!(h1.await.unwrap());
        assert!(h2.await.unwrap());

        let addr1 = tokio::time::timeout(Duration::from_secs(5), rx1).await.unwrap().unwrap();
        let addr2 = tokio::time::timeout(Duration::from_secs(5), rx2).await.unwrap().unwrap();
        assert_eq!(addr1, addr2);
    }

    #[tokio::test]
    async fn memory_hit_calls_back_synchronously_without_a_deploy() {
        let (manager, memory, dispatcher) = build_dispatcher();
        let _ = manager;

        let src = SocketAddr4::new("10.0.1.5".parse().unwrap(), 41000);
        let dst = SocketAddr4::new("203.0.113.9".parse().unwrap(), 80);
        let backend = SocketAddr4::with_mac(
            "10.1.2.3".parse().unwrap(),
            8080,
            MacAddr([0x02, 0, 0, 0, 0, 0x09]),
        );
        memory.add(src, dst, backend);

        let switch = Arc::new(Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new()));
        let (tx, rx) = tokio::sync::oneshot::channel();
        let bound = dispatcher
            .dispatch(switch, src, dst, move |addr| {
                let _ = tx.send(addr);
            })
            .await;
        assert!(bound);
        let addr = rx.await.expect("callback ran synchronously");
        assert_eq!(addr, backend);
    }

    #[tokio::test]
    async fn dispatch_returns_false_when_destination_is_not_a_known_service() {
        let (_manager, _memory, dispatcher) = build_dispatcher();
        let switch = Arc::new(Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new()));
        let src = SocketAddr4::new("10.0.1.5".parse().unwrap(), 41000);
        let dst = SocketAddr4::new("8.8.8.8".parse().unwrap(), 53);

        let bound = dispatcher.dispatch(switch, src, dst, |_| {}).await;
        assert!(!bound);
    }

    #[test]
    fn find_service_id_updates_stored_vmac_on_drift() {
        let memory = Arc::new(FlowMemory::new(Duration::from_secs(60)));
        let manager = Arc::new(ServiceManager::new(false));
        let scheduler: Arc<dyn Scheduler> = Arc::new(ProximityScheduler::new());
        let dispatcher = Dispatcher::new(manager, memory.clone(), scheduler, manifest_loader);

        let client_ip: Ipv4Addr = "10.0.1.5".parse().unwrap();
        let edge_addr = SocketAddr4::new("10.1.2.3".parse().unwrap(), 8080);
        let old_mac = MacAddr([2, 0, 0, 0, 0, 1]);
        let new_mac = MacAddr([2, 0, 0, 0, 0, 2]);
        let vdst = SocketAddr4::with_mac("203.0.113.9".parse().unwrap(), 80, old_mac);

        memory.add(SocketAddr4::new(client_ip, 41000), vdst, edge_addr);

        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new());
        switch.set_vmac(new_mac);

        let entry = dispatcher.find_service_id(&switch, edge_addr, client_ip).expect("entry found");
        assert_eq!(entry.dst.mac, Some(new_mac));

        // a second lookup no longer drifts
        let entry2 = dispatcher.find_service_id(&switch, edge_addr, client_ip).expect("entry still found");
        assert_eq!(entry2.dst.mac, Some(new_mac));
    }
}
