use crate::{Ipv4Addr, SocketAddr4};

/// A virtual service: the (ip, port) clients connect to, plus the label used
/// to find its manifest and deployment objects. Mirrors
/// `original_source/util/Service.py::Service`; equality and hashing key on
/// `vaddr` alone (a label never appears twice at the same virtual address).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Service {
    pub vaddr: SocketAddr4,
    pub label: String,
}

impl Service {
    pub fn new(vaddr: SocketAddr4, label: impl Into<String>) -> Self {
        Self {
            vaddr,
            label: label.into(),
        }
    }

    pub fn port(&self) -> u16 {
        self.vaddr.port
    }
}

/// Which address a `ServiceInstance`'s `eaddr` resolves to, selected per-edge
/// by the edge's configured `target` mode (`SPEC_FULL.md` §4.3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RouteTarget {
    /// Route directly to the pod/container IP.
    Pod,
    /// Route to the in-cluster VIP (ClusterIP-style).
    Cluster,
    /// Route to the node/load-balancer exposed address (NodePort-style).
    Exposed,
}

impl RouteTarget {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pod" => Some(Self::Pod),
            "cluster" => Some(Self::Cluster),
            "exposed" => Some(Self::Exposed),
            _ => None,
        }
    }
}

/// Deployment readiness as reported by the cluster back-end.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Deployment {
    pub replicas: u32,
    pub ready_replicas: u32,
}

impl Deployment {
    pub const fn new(replicas: u32, ready_replicas: u32) -> Self {
        Self {
            replicas,
            ready_replicas,
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready_replicas >= 1
    }
}

/// A `Service` bound to a specific edge, grounded on
/// `original_source/util/Service.py::ServiceInstance`. `eaddr` is the address
/// selected for routing per the edge's `RouteTarget`; `public_addr`,
/// `cluster_addr` and `pod_addr` are the three candidate addresses a cluster
/// back-end may report (not all are always known).
#[derive(Debug, Clone)]
pub struct ServiceInstance {
    pub service: Service,
    /// Identifies the owning edge without holding a reference to it
    /// (breaks the Switch<->Edge<->Cluster cycle described in
    /// `SPEC_FULL.md` §9 — the edge's ip is its stable identity, matching
    /// `Edge.__hash__` in the original).
    pub edge_ip: Ipv4Addr,
    pub public_addr: Option<SocketAddr4>,
    pub cluster_addr: Option<SocketAddr4>,
    pub pod_addr: Option<SocketAddr4>,
    pub eaddr: Option<SocketAddr4>,
    pub deployment: Deployment,
}

impl ServiceInstance {
    pub fn new(service: Service, edge_ip: Ipv4Addr) -> Self {
        Self {
            service,
            edge_ip,
            public_addr: None,
            cluster_addr: None,
            pod_addr: None,
            eaddr: None,
            deployment: Deployment::default(),
        }
    }

    /// Resolves `eaddr` from the candidate addresses according to `target`,
    /// matching the pod/cluster/exposed selection in `SPEC_FULL.md` §4.3.
    pub fn resolve_eaddr(&mut self, target: RouteTarget) {
        self.eaddr = match target {
            RouteTarget::Pod => self.pod_addr.or(self.cluster_addr),
            RouteTarget::Cluster => self.cluster_addr.or(self.pod_addr),
            RouteTarget::Exposed => self.public_addr.or(self.cluster_addr),
        };
    }

    pub fn is_ready(&self) -> bool {
        self.deployment.is_ready()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> SocketAddr4 {
        SocketAddr4::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn resolve_eaddr_prefers_target_then_falls_back() {
        let svc = Service::new(addr("203.0.113.9", 80), "at.aau.hostinfo");
        let mut inst = ServiceInstance::new(svc, "10.0.2.1".parse().unwrap());
        inst.cluster_addr = Some(addr("10.96.0.5", 80));
        inst.resolve_eaddr(RouteTarget::Pod);
        assert_eq!(inst.eaddr, Some(addr("10.96.0.5", 80))); // no pod addr yet -> falls back

        inst.pod_addr = Some(addr("10.1.2.3", 8080));
        inst.resolve_eaddr(RouteTarget::Pod);
        assert_eq!(inst.eaddr, Some(addr("10.1.2.3", 8080)));
    }

    #[test]
    fn deployment_readiness() {
        assert!(!Deployment::new(1, 0).is_ready());
        assert!(Deployment::new(1, 1).is_ready());
    }
}
