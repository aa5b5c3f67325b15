//! Assembles [`Switch`]/[`Edge`] topology from a loaded [`RootConfig`],
//! grounded on `original_source/ryu_ctrl/ServiceManager.py::loadConfig`'s
//! `cfg['switches']` parsing.

use crate::error::ControllerError;
use edge_core::{Dpid, Ipv4Addr, RootConfig, RouteTarget};
use edge_manager::{Edge, Switch};
use std::sync::Arc;

fn parse_cidr(ip: &str, cidr: &str) -> Result<(Ipv4Addr, Ipv4Addr), ControllerError> {
    let (net, prefix) = cidr.split_once('/').ok_or_else(|| ControllerError::InvalidServiceCidr {
        ip: ip.to_string(),
        cidr: cidr.to_string(),
    })?;
    let net: Ipv4Addr = net.parse().map_err(|_| ControllerError::InvalidServiceCidr {
        ip: ip.to_string(),
        cidr: cidr.to_string(),
    })?;
    let prefix: u8 = prefix.parse().map_err(|_| ControllerError::InvalidServiceCidr {
        ip: ip.to_string(),
        cidr: cidr.to_string(),
    })?;
    let mask = Ipv4Addr::cidr_mask(prefix);
    Ok((net.masked(mask), mask))
}

/// Builds one [`Switch`] (with its [`Edge`]s) per entry in `cfg.switches`.
/// The map key is the short-form datapath id, matching `DPID(dpid)` parsing
/// `cfg['switches']`'s string keys in the original.
pub fn build_switches(cfg: &RootConfig) -> Result<Vec<Arc<Switch>>, ControllerError> {
    let mut switches = Vec::with_capacity(cfg.switches.len());

    for (dpid_str, spec) in &cfg.switches {
        let short: u8 = dpid_str.parse().map_err(|_| ControllerError::InvalidGateway {
            dpid: dpid_str.clone(),
            gateway: spec.gateway.clone(),
        })?;
        let dpid = Dpid::short(short);

        let gateway: Ipv4Addr = spec.gateway.parse().map_err(|_| ControllerError::InvalidGateway {
            dpid: dpid_str.clone(),
            gateway: spec.gateway.clone(),
        })?;

        let mut edges = Vec::with_capacity(spec.edges.len());
        for edge_spec in &spec.edges {
            let ip: Ipv4Addr = edge_spec.ip.parse().map_err(|_| ControllerError::InvalidEdgeAddress {
                dpid: dpid_str.clone(),
                ip: edge_spec.ip.clone(),
            })?;

            let target = RouteTarget::parse(&edge_spec.target).ok_or_else(|| ControllerError::InvalidRouteTarget {
                ip: edge_spec.ip.clone(),
                target: edge_spec.target.clone(),
            })?;

            let mut service_cidr = Vec::with_capacity(edge_spec.service_cidr.len());
            for cidr in &edge_spec.service_cidr {
                service_cidr.push(parse_cidr(&edge_spec.ip, cidr)?);
            }

            edges.push(Arc::new(Edge::new(ip, dpid, target, service_cidr, edge_spec.scheduler.clone())));
        }

        switches.push(Arc::new(Switch::new(dpid, gateway, edges)));
    }

    Ok(switches)
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::{EdgeSpec, SchedulerSpec, SwitchSpec};
    use std::collections::HashMap;

    fn config() -> RootConfig {
        let mut switches = HashMap::new();
        switches.insert(
            "1".to_string(),
            SwitchSpec {
                gateway: "10.0.0.1".to_string(),
                edges: vec![EdgeSpec {
                    ip: "10.0.2.1".to_string(),
                    target: "cluster".to_string(),
                    service_cidr: vec!["10.0.1.0/24".to_string()],
                    scheduler: None,
                }],
            },
        );
        RootConfig {
            arp_src_mac: "02:00:00:00:00:ff".to_string(),
            flow_idle_timeout: 5,
            cluster_glob: String::new(),
            services_glob: String::new(),
            services_dir: String::new(),
            use_unique_prefix: true,
            use_unique_mask: true,
            log_performance: false,
            scheduler: SchedulerSpec::default(),
            switches,
        }
    }

    #[test]
    fn builds_one_switch_with_its_edges() {
        let switches = build_switches(&config()).expect("build");
        assert_eq!(switches.len(), 1);
        let switch = &switches[0];
        assert_eq!(switch.dpid, Dpid::short(1));
        assert_eq!(switch.gateway, "10.0.0.1".parse().unwrap());
        assert_eq!(switch.edges.len(), 1);
        assert_eq!(switch.edges[0].target, RouteTarget::Cluster);
        assert_eq!(
            switch.edges[0].service_cidr,
            vec![("10.0.1.0".parse().unwrap(), Ipv4Addr::cidr_mask(24))]
        );
    }

    #[test]
    fn rejects_a_malformed_cidr() {
        let mut cfg = config();
        cfg.switches.get_mut("1").unwrap().edges[0].service_cidr = vec!["not-a-cidr".to_string()];
        assert!(build_switches(&cfg).is_err());
    }
}
