//! `ServiceManager`, grounded on `original_source/ryu_ctrl/ServiceManager.py`
//! (and its fuller async description in `SPEC_FULL.md` §4.4: `bookDeployment`,
//! the `waitOnly` spin-wait, `_waitForOpenPort`, `availServers`).

use crate::topology::{Edge, Switch};
use dashmap::{DashMap, DashSet};
use edge_catalog::TinyServiceTrie;
use edge_cluster::{ClusterAdapter, ClusterError};
use edge_core::{Dpid, Ipv4Addr, Service, ServiceInstance, SocketAddr4};
use std::net::SocketAddr as StdSocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error("cluster config glob error: {0}")]
    Glob(#[from] glob::PatternError),
    #[error("malformed cluster config filename '{0}'")]
    MalformedClusterFilename(String),
    #[error("malformed service manifest filename '{0}'")]
    MalformedServiceFilename(String),
    #[error("no edge with ip {0} configured for cluster config")]
    UnknownEdge(Ipv4Addr),
    #[error("deploy failed after {attempts} attempt(s): {source}")]
    DeployFailed {
        attempts: u32,
        #[source]
        source: ClusterError,
    },
    #[error("instance for {vaddr} never became ready (port never opened)")]
    PortNeverOpened { vaddr: SocketAddr4 },
}

const MAX_DEPLOY_RETRIES: u32 = 3;
const WAIT_ONLY_POLL: Duration = Duration::from_millis(10);
const PORT_PROBE_TIMEOUT: Duration = Duration::from_millis(200);
const PORT_PROBE_PAUSE: Duration = Duration::from_millis(10);
const PORT_PROBE_MAX_ITERATIONS: u32 = 3000; // 3000 * 10ms = 30s

/// Outcome of a completed deploy, carried in the `#perfDeploy` structured
/// log line described in `SPEC_FULL.md` §6.
#[derive(Debug, Clone, Copy)]
pub struct DeployTiming {
    pub kind: DeployKind,
    pub total_ms: u64,
    pub wait_ms: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeployKind {
    Deploy,
    ScaleUp,
    Wait,
}

/// Catalog loading, per-edge instance inventory, and the book/deploy/wait
/// coordination protocol that serializes concurrent deploys of the same
/// (service, edge) pair.
pub struct ServiceManager {
    catalog: parking_lot::RwLock<TinyServiceTrie<Service>>,
    switches: DashMap<Dpid, Arc<Switch>>,
    edges_by_ip: DashMap<Ipv4Addr, Arc<Edge>>,
    /// (vaddr, edge ip) pairs with a deploy currently in flight — the single
    /// reservation barrier `bookDeployment` implements.
    in_flight: DashSet<(SocketAddr4, Ipv4Addr)>,
    log_performance: bool,
}

impl ServiceManager {
    pub fn new(log_performance: bool) -> Self {
        Self {
            catalog: parking_lot::RwLock::new(TinyServiceTrie::new()),
            switches: DashMap::new(),
            edges_by_ip: DashMap::new(),
            in_flight: DashSet::new(),
            log_performance,
        }
    }

    pub fn register_switch(&self, switch: Arc<Switch>) {
        for edge in &switch.edges {
            self.edges_by_ip.insert(edge.ip, edge.clone());
        }
        self.switches.insert(switch.dpid, switch);
    }

    pub fn edge(&self, ip: Ipv4Addr) -> Option<Arc<Edge>> {
        self.edges_by_ip.get(&ip).map(|r| r.clone())
    }

    pub fn switch(&self, dpid: Dpid) -> Option<Arc<Switch>> {
        self.switches.get(&dpid).map(|r| r.clone())
    }

    pub fn is_service(&self, addr: SocketAddr4) -> bool {
        self.catalog.read().contains(addr)
    }

    pub fn service(&self, addr: SocketAddr4) -> Option<Service> {
        self.catalog.read().get(addr).cloned()
    }

    /// Directly registers `service` in the catalog, bypassing the
    /// filename/DNS resolution `load_services` performs. Useful for callers
    /// (and tests) that already know the vaddr; `load_services` remains the
    /// filename-driven bulk-loading path used at start-up.
    pub fn insert_service(&self, service: Service) {
        self.catalog.write().set(service.vaddr, service);
    }

    pub fn is_service_ip(&self, ip: Ipv4Addr) -> bool {
        self.catalog.read().contains_ip(ip)
    }

    pub fn unique_prefix(&self, ip: Ipv4Addr) -> (u8, Vec<u8>) {
        self.catalog.read().unique_prefix(ip)
    }

    /// True iff `addr` is a known node (serving-host) address at the edge
    /// with datapath id `dpid`, mirroring `ServiceManager.isOwnedByEdge` in
    /// the original.
    pub fn is_node_addr_at(&self, dpid: Dpid, addr: SocketAddr4) -> bool {
        self.edges_by_ip
            .iter()
            .any(|e| e.dpid() == dpid && e.n_services.contains_key(&addr))
    }

    /// Matches cluster config files `<ip:port>-<type>.<ext>` against
    /// configured edges by ip and attaches the cluster adapter the caller's
    /// `build` closure constructs for that type/api-server/file.
    pub fn load_clusters<F>(&self, cluster_glob: &str, build: F) -> Result<(), ManagerError>
    where
        F: Fn(&str, &str, &std::path::Path) -> Option<Arc<dyn ClusterAdapter>>,
    {
        for entry in glob::glob(cluster_glob)? {
            let Ok(path) = entry else { continue };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((api_server, cluster_type)) = stem.rsplit_once('-') else {
                return Err(ManagerError::MalformedClusterFilename(stem.to_string()));
            };
            let edge_ip_str = api_server.split(':').next().unwrap_or(api_server);
            let edge_ip: Ipv4Addr = edge_ip_str
                .parse()
                .map_err(|_| ManagerError::MalformedClusterFilename(stem.to_string()))?;

            let Some(edge) = self.edges_by_ip.get(&edge_ip) else {
                tracing::warn!(%edge_ip, "cluster config for unconfigured edge, skipping");
                continue;
            };

            if let Some(adapter) = build(cluster_type, api_server, &path) {
                edge.set_cluster(adapter);
            }
        }
        Ok(())
    }

    /// Matches service manifest files `<label>.<port>.<ext>` and inserts a
    /// `Service` for each into the catalog. Does not parse YAML — only the
    /// filename is needed to populate the catalog, matching the original's
    /// performance note that the catalog may hold millions of entries.
    pub fn load_services(&self, services_glob: &str) -> Result<usize, ManagerError> {
        let mut count = 0usize;
        for entry in glob::glob(services_glob)? {
            let Ok(path) = entry else { continue };
            let Some(stem) = path.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            let Some((label, port_str)) = stem.rsplit_once('.') else {
                return Err(ManagerError::MalformedServiceFilename(stem.to_string()));
            };
            let port: u16 = port_str
                .parse()
                .map_err(|_| ManagerError::MalformedServiceFilename(stem.to_string()))?;

            let domain = label.rsplit_once('.').map(|(d, _)| d).unwrap_or(label);
            let vaddr = match resolve_hostname(domain, port) {
                Some(addr) => addr,
                None => {
                    tracing::warn!(label, "could not resolve service hostname, skipping");
                    continue;
                }
            };

            self.catalog.write().set(vaddr, Service::new(vaddr, label));
            count += 1;
        }
        if count > 0 {
            tracing::info!(count, "loaded services into catalog");
        }
        Ok(count)
    }

    /// `bookDeployment`: reserves the (vaddr, edge) pair for a real deploy.
    /// Returns `true` ("book succeeded, you do the real work") the first
    /// time it's called for a pair, `false` ("someone else is already
    /// deploying, wait for them") on every subsequent call until the
    /// deploy completes and [`ServiceManager::release_booking`] is called.
    pub fn book_deployment(&self, vaddr: SocketAddr4, edge_ip: Ipv4Addr) -> bool {
        self.in_flight.insert((vaddr, edge_ip))
    }

    fn release_booking(&self, vaddr: SocketAddr4, edge_ip: Ipv4Addr) {
        self.in_flight.remove(&(vaddr, edge_ip));
    }

    /// Availability vector for `addr`: `(service, [(edge, deployed, ready)])`
    /// across every configured edge, matching `ServiceManager.availServers`.
    pub fn avail_servers(&self, addr: SocketAddr4) -> (Option<Service>, Vec<(Arc<Edge>, u32, u32)>) {
        let service = self.service(addr);
        let mut result = Vec::new();

        for entry in self.edges_by_ip.iter() {
            let edge = entry.value().clone();
            let Some(instance) = edge.v_services.get(&addr) else {
                // No instance registered yet, but the edge is a candidate if
                // its cluster is reachable (i.e. configured at all).
                if edge.cluster().is_some() {
                    result.push((edge, 0, 0));
                }
                continue;
            };
            let deployed = 1;
            let ready = u32::from(instance.is_ready());
            result.push((edge.clone(), deployed, ready));
        }
        (service, result)
    }

    /// Deploys (or scales up, or waits on) a service instance at `edge`.
    ///
    /// `wait_only=true` means another caller already booked the deployment;
    /// this call spin-polls until the other caller populates `eaddr`, then
    /// waits for the port to open. `wait_only=false` performs the actual
    /// deploy/scale-up and retries transient cluster errors up to 3 times.
    pub async fn deploy(
        &self,
        service: Service,
        edge: Arc<Edge>,
        num_deployed: u32,
        wait_only: bool,
        manifest_loader: impl Fn(&Service) -> Result<edge_cluster::ServiceManifest, ManagerError>,
    ) -> Result<(ServiceInstance, DeployTiming), ManagerError> {
        let start = Instant::now();

        if wait_only {
            loop {
                if let Some(instance) = edge.v_services.get(&service.vaddr) {
                    if instance.eaddr.is_some() {
                        break;
                    }
                }
                tokio::time::sleep(WAIT_ONLY_POLL).await;
            }
            let eaddr = edge.v_services.get(&service.vaddr).and_then(|i| i.eaddr);
            let wait_ms = if let Some(addr) = eaddr {
                self.wait_for_open_port(addr).await?
            } else {
                0
            };
            let instance = edge
                .v_services
                .get(&service.vaddr)
                .map(|i| i.clone())
                .expect("instance populated by the booking caller");
            return Ok((
                instance,
                DeployTiming {
                    kind: DeployKind::Wait,
                    total_ms: start.elapsed().as_millis() as u64,
                    wait_ms,
                },
            ));
        }

        let cluster = edge.cluster().ok_or_else(|| ManagerError::UnknownEdge(edge.ip))?;

        let kind = if num_deployed > 0 { DeployKind::ScaleUp } else { DeployKind::Deploy };

        let mut last_err = None;
        let mut instance = None;
        for attempt in 1..=MAX_DEPLOY_RETRIES {
            let result: Result<ServiceInstance, ClusterError> = if num_deployed > 0 {
                match edge.v_services.get(&service.vaddr).map(|i| i.clone()) {
                    Some(existing) => cluster.scale(&existing, 1).await.map(|_| existing),
                    None => Err(ClusterError::not_found("no existing instance to scale")),
                }
            } else {
                let manifest = manifest_loader(&service)?;
                match cluster.deploy(&manifest).await {
                    Ok(mut deployed_instance) => {
                        deployed_instance.resolve_eaddr(edge.target);
                        cluster
                            .scale(&deployed_instance, 1)
                            .await
                            .map(|_| deployed_instance)
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(mut inst) => {
                    inst.resolve_eaddr(edge.target);
                    instance = Some(inst);
                    break;
                }
                Err(e) if e.is_retryable() && attempt < MAX_DEPLOY_RETRIES => {
                    tracing::warn!(attempt, error = %e, "deploy attempt failed, retrying");
                    last_err = Some(e);
                }
                Err(e) => {
                    self.release_booking(service.vaddr, edge.ip);
                    return Err(ManagerError::DeployFailed {
                        attempts: attempt,
                        source: e,
                    });
                }
            }
        }

        let mut instance = match instance {
            Some(i) => i,
            None => {
                self.release_booking(service.vaddr, edge.ip);
                return Err(ManagerError::DeployFailed {
                    attempts: MAX_DEPLOY_RETRIES,
                    source: last_err.unwrap_or_else(|| ClusterError::transient("unknown failure")),
                });
            }
        };

        let wait_ms = match instance.eaddr {
            Some(addr) => match self.wait_for_open_port(addr).await {
                Ok(ms) => ms,
                Err(e) => {
                    self.release_booking(service.vaddr, edge.ip);
                    return Err(e);
                }
            },
            None => 0,
        };

        instance.deployment.ready_replicas = instance.deployment.ready_replicas.max(1);
        edge.v_services.insert(service.vaddr, instance.clone());
        if let Some(eaddr) = instance.eaddr {
            edge.e_services.insert(eaddr, instance.clone());
        }
        if let Some(naddr) = instance.pod_addr.or(instance.cluster_addr) {
            edge.n_services.insert(naddr, instance.clone());
        }
        self.release_booking(service.vaddr, edge.ip);

        let timing = DeployTiming {
            kind,
            total_ms: start.elapsed().as_millis() as u64,
            wait_ms,
        };
        if self.log_performance {
            tracing::info!(
                target: "perf_deploy",
                kind = ?timing.kind,
                total_ms = timing.total_ms,
                wait_ms = timing.wait_ms,
                svc = %service.label,
                "#perfDeploy"
            );
        }
        Ok((instance, timing))
    }

    /// TCP-connects to `addr` in a loop (200ms connect timeout, 10ms pause)
    /// up to 3000 times (30s total), matching `_waitForOpenPort`. Returns 0
    /// if the port was open on the first attempt, else the elapsed ms.
    async fn wait_for_open_port(&self, addr: SocketAddr4) -> Result<u64, ManagerError> {
        let start = Instant::now();
        let std_addr = StdSocketAddr::from((addr.ip.to_std(), addr.port));

        for _ in 0..PORT_PROBE_MAX_ITERATIONS {
            let probe = tokio::time::timeout(PORT_PROBE_TIMEOUT, tokio::net::TcpStream::connect(std_addr)).await;
            if matches!(probe, Ok(Ok(_))) {
                return Ok(start.elapsed().as_millis() as u64);
            }
            tokio::time::sleep(PORT_PROBE_PAUSE).await;
        }
        Err(ManagerError::PortNeverOpened { vaddr: addr })
    }
}

fn resolve_hostname(domain: &str, port: u16) -> Option<SocketAddr4> {
    use std::net::ToSocketAddrs;
    (domain, port)
        .to_socket_addrs()
        .ok()?
        .find_map(|a| match a {
            StdSocketAddr::V4(v4) => Some(SocketAddr4::new(Ipv4Addr::from_std(*v4.ip()), port)),
            StdSocketAddr::V6(_) => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn book_deployment_is_a_one_shot_reservation() {
        let mgr = ServiceManager::new(false);
        let vaddr = SocketAddr4::new("203.0.113.9".parse().unwrap(), 80);
        let edge_ip: Ipv4Addr = "10.0.2.1".parse().unwrap();

        assert!(mgr.book_deployment(vaddr, edge_ip)); // first caller books
        assert!(!mgr.book_deployment(vaddr, edge_ip)); // second caller waits

        mgr.release_booking(vaddr, edge_ip);
        assert!(mgr.book_deployment(vaddr, edge_ip)); // free again after release
    }

    #[test]
    fn unresolvable_hostname_is_skipped_not_fatal() {
        assert!(resolve_hostname("this-domain-should-not-exist.invalid", 80).is_none());
    }
}
