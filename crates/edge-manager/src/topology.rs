//! `Switch`/`Edge` topology, grounded on
//! `original_source/util/EdgeTools.py`.
//!
//! The original's `Switch <-> Edge <-> Cluster` cyclic references are broken
//! as described in `SPEC_FULL.md` §9: an `Edge` is owned by its `Switch`,
//! and `ServiceInstance`/cluster code refer back to an edge by its ip
//! (`edge_ip`) instead of holding a strong reference.

use arc_swap::ArcSwapOption;
use dashmap::DashMap;
use edge_cluster::ClusterAdapter;
use edge_core::{Dpid, Host, Ipv4Addr, MacAddr, RouteTarget, ServiceInstance, SocketAddr4};
use std::sync::Arc;
use std::sync::atomic::{AtomicU16, Ordering};

/// One cluster attachment point behind a switch.
pub struct Edge {
    pub ip: Ipv4Addr,
    pub switch_dpid: Dpid,
    pub target: RouteTarget,
    pub service_cidr: Vec<(Ipv4Addr, Ipv4Addr)>,
    pub scheduler_name: Option<String>,
    /// Set once during start-up by `ServiceManager::load_clusters`; reads
    /// from dispatch/pipeline tasks happen concurrently with that set.
    cluster: ArcSwapOption<dyn ClusterAdapter>,
    /// virtual address -> instance, the table the dispatcher and pipeline
    /// consult for an already-deployed backend.
    pub v_services: DashMap<SocketAddr4, ServiceInstance>,
    /// edge-selected address -> instance, used to recognize return traffic.
    pub e_services: DashMap<SocketAddr4, ServiceInstance>,
    /// node (actual serving host) address -> instance, grounded on
    /// `original_source/util/Service.py::ServiceInstance.nAddr`.
    pub n_services: DashMap<SocketAddr4, ServiceInstance>,
}

impl Edge {
    pub fn new(
        ip: Ipv4Addr,
        switch_dpid: Dpid,
        target: RouteTarget,
        service_cidr: Vec<(Ipv4Addr, Ipv4Addr)>,
        scheduler_name: Option<String>,
    ) -> Self {
        Self {
            ip,
            switch_dpid,
            target,
            service_cidr,
            scheduler_name,
            cluster: ArcSwapOption::const_empty(),
            v_services: DashMap::new(),
            e_services: DashMap::new(),
            n_services: DashMap::new(),
        }
    }

    pub fn dpid(&self) -> Dpid {
        self.switch_dpid
    }

    pub fn cluster(&self) -> Option<Arc<dyn ClusterAdapter>> {
        self.cluster.load_full()
    }

    pub fn set_cluster(&self, adapter: Arc<dyn ClusterAdapter>) {
        self.cluster.store(Some(adapter));
    }

    /// Mirrors `IPAddr.cidrToIPMask`: true iff `ip` falls in one of this
    /// edge's configured service CIDRs.
    pub fn serves_cidr(&self, ip: Ipv4Addr) -> bool {
        self.service_cidr
            .iter()
            .any(|(net, mask)| ip.masked(*mask) == net.masked(*mask))
    }
}

/// A connected OpenFlow switch. `ports`/`mac`/`name` start unset and are
/// filled in exactly once, on the feature reply (`SPEC_FULL.md` §3).
pub struct Switch {
    pub dpid: Dpid,
    pub gateway: Ipv4Addr,
    pub mac: parking_lot::Mutex<Option<MacAddr>>,
    pub vmac: parking_lot::Mutex<Option<MacAddr>>,
    pub mac2port: DashMap<MacAddr, u16>,
    pub hosts: DashMap<Ipv4Addr, Host>,
    pub edges: Vec<Arc<Edge>>,
    feature_reply_received: AtomicU16,
}

impl Switch {
    pub fn new(dpid: Dpid, gateway: Ipv4Addr, edges: Vec<Arc<Edge>>) -> Self {
        Self {
            dpid,
            gateway,
            mac: parking_lot::Mutex::new(None),
            vmac: parking_lot::Mutex::new(None),
            mac2port: DashMap::new(),
            hosts: DashMap::new(),
            edges,
            feature_reply_received: AtomicU16::new(0),
        }
    }

    pub fn port_for(&self, mac: MacAddr) -> Option<u16> {
        self.mac2port.get(&mac).map(|p| *p)
    }

    pub fn set_vmac(&self, mac: MacAddr) {
        *self.vmac.lock() = Some(mac);
    }

    pub fn vmac(&self) -> Option<MacAddr> {
        *self.vmac.lock()
    }

    /// Called exactly once per connection, on the switch-features reply.
    pub fn mark_feature_reply(&self, mac: MacAddr) {
        *self.mac.lock() = Some(mac);
        self.feature_reply_received.store(1, Ordering::Release);
    }

    pub fn is_ready(&self) -> bool {
        self.feature_reply_received.load(Ordering::Acquire) == 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serves_cidr_matches_network() {
        let net: Ipv4Addr = "10.0.1.0".parse().unwrap();
        let mask = Ipv4Addr::cidr_mask(24);
        let edge = Edge::new(
            "10.0.2.1".parse().unwrap(),
            Dpid::short(1),
            RouteTarget::Pod,
            vec![(net, mask)],
            None,
        );

        assert!(edge.serves_cidr("10.0.1.42".parse().unwrap()));
        assert!(!edge.serves_cidr("10.0.2.42".parse().unwrap()));
    }

    #[test]
    fn switch_becomes_ready_only_after_feature_reply() {
        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new());
        assert!(!switch.is_ready());
        switch.mark_feature_reply(MacAddr([2, 0, 0, 0, 0, 1]));
        assert!(switch.is_ready());
    }
}
