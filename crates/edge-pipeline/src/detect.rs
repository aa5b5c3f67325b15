//! Detect table (`T1`), grounded on
//! `original_source/ryu_ctrl/EdgeDetector.py`.

use crate::types::{
    Action, Category, Cookie, FlowMod, Instruction, IpProto, Match, PacketIn, PacketOut, Subcategory, MAX_PRIORITY,
    T1_DETECT, T2_REDIRECT, T3_L2_DEFAULT,
};
use edge_core::Ipv4Addr;
use edge_manager::{ServiceManager, Switch};

const EDGE_CIDR_PRIORITY: u16 = MAX_PRIORITY;
const PRIVATE_NET_PRIORITY: u16 = MAX_PRIORITY - 1;
const FALLTHROUGH_PRIORITY: u16 = 0;
const REACTIVE_EDGE_PRIORITY: u16 = 500;
const REACTIVE_DEFAULT_PRIORITY: u16 = 400;

/// Outcome of processing one packet-in at the detect table: the flow-mod to
/// install, plus either a packet-out (default-traffic path, resolved
/// in-software) or a flag telling the caller to hand the same event to the
/// redirect table immediately (service-traffic path).
pub enum DetectOutcome {
    Edge { flow_mod: FlowMod },
    Default { flow_mod: FlowMod, packet_out: Option<PacketOut> },
}

pub struct DetectTable;

impl DetectTable {
    /// Static rules installed once per switch connection, highest priority
    /// first: edge-cidr source + private-net destination goes to the
    /// redirect table (return traffic from a local backend), any other
    /// private-net destination skips to L2 forwarding, and the fallthrough
    /// sends unmatched traffic to the controller.
    pub fn install_static(switch: &Switch) -> Vec<FlowMod> {
        let mut mods = Vec::new();
        let Some(private_mask) = switch.gateway.private_mask() else {
            mods.push(Self::fallthrough());
            return mods;
        };
        let private_net = switch.gateway.masked(private_mask);

        for edge in &switch.edges {
            for (net, mask) in &edge.service_cidr {
                mods.push(FlowMod {
                    table_id: T1_DETECT,
                    priority: EDGE_CIDR_PRIORITY,
                    cookie: Cookie::new(Category::Detect, Subcategory::Default),
                    idle_timeout: 0,
                    m: Match {
                        ipv4_src: Some((*net, *mask)),
                        ipv4_dst: Some((private_net, private_mask)),
                        ..Default::default()
                    },
                    instructions: vec![Instruction::GotoTable(T2_REDIRECT)],
                    buffer_id: None,
                    notify_removed: false,
                });
            }
        }

        mods.push(FlowMod {
            table_id: T1_DETECT,
            priority: PRIVATE_NET_PRIORITY,
            cookie: Cookie::new(Category::Detect, Subcategory::Default),
            idle_timeout: 0,
            m: Match {
                ipv4_dst: Some((private_net, private_mask)),
                ..Default::default()
            },
            instructions: vec![Instruction::GotoTable(T3_L2_DEFAULT)],
            buffer_id: None,
            notify_removed: false,
        });

        mods.push(Self::fallthrough());
        mods
    }

    fn fallthrough() -> FlowMod {
        FlowMod {
            table_id: T1_DETECT,
            priority: FALLTHROUGH_PRIORITY,
            cookie: Cookie::new(Category::Detect, Subcategory::Default),
            idle_timeout: 0,
            m: Match::default(),
            instructions: vec![Instruction::ApplyActions(vec![Action::ToController])],
            buffer_id: None,
            notify_removed: false,
        }
    }

    /// Reactive path. Splits on whether `pkt.dst()` is a cataloged service:
    /// if so, install a short-lived exact match that sends this (ip, port)
    /// straight to the redirect table; otherwise install the widest
    /// default-traffic rule `uniquePrefix`/`uniqueMask` will allow without
    /// colliding with any catalog entry.
    pub fn handle_packet_in(
        switch: &Switch,
        manager: &ServiceManager,
        pkt: &PacketIn,
        use_unique_prefix: bool,
        use_unique_mask: bool,
        flow_idle_timeout: u16,
    ) -> DetectOutcome {
        let dst = pkt.dst();

        if manager.is_service(dst) {
            let mut m = Match {
                ip_proto: Some(pkt.proto),
                ipv4_dst: Some((dst.ip, Ipv4Addr::cidr_mask(32))),
                ..Default::default()
            };
            set_dst_port(&mut m, pkt.proto, dst.port);

            let flow_mod = FlowMod {
                table_id: T1_DETECT,
                priority: REACTIVE_EDGE_PRIORITY,
                cookie: Cookie::new(Category::Detect, Subcategory::Edge),
                idle_timeout: flow_idle_timeout,
                m,
                instructions: vec![Instruction::GotoTable(T2_REDIRECT)],
                // NO_BUFFER: the redirect table handles this same event in
                // software right away and claims the buffer itself.
                buffer_id: None,
                notify_removed: false,
            };
            return DetectOutcome::Edge { flow_mod };
        }

        let flow_mod = default_traffic_flow_mod(manager, pkt, use_unique_prefix, use_unique_mask, flow_idle_timeout);

        // Flush the triggering packet immediately via a one-off packet-out
        // rather than waiting for the next packet-in to hit the rule just
        // installed (`SPEC_FULL.md` §4.7).
        let packet_out = switch.port_for(pkt.eth_dst).map(|port| PacketOut {
            buffer_id: pkt.buffer_id,
            in_port: pkt.in_port,
            actions: vec![Action::Output(port)],
            data: if pkt.buffer_id.is_none() { Some(pkt.data.clone()) } else { None },
        });

        DetectOutcome::Default { flow_mod, packet_out }
    }
}

fn set_dst_port(m: &mut Match, proto: IpProto, port: u16) {
    match proto {
        IpProto::Tcp => m.tcp_dst = Some(port),
        IpProto::Udp => m.udp_dst = Some(port),
    }
}

/// Builds the sparse/CIDR mask described in `SPEC_FULL.md` §4.1/§4.7: OR
/// together `1 << (32 - p)` for every divergence-point `p` plus the capped
/// unique prefix itself.
pub fn unique_mask(n: u8, prefixes: &[u8]) -> Ipv4Addr {
    let capped = n.min(32);
    let mut bits: u32 = 0;
    for p in prefixes.iter().copied().chain(std::iter::once(capped)) {
        if p == 0 {
            continue;
        }
        bits |= 1u32 << (32 - p as u32);
    }
    Ipv4Addr::new(bits)
}

fn default_traffic_flow_mod(
    manager: &ServiceManager,
    pkt: &PacketIn,
    use_unique_prefix: bool,
    use_unique_mask: bool,
    flow_idle_timeout: u16,
) -> FlowMod {
    let dst = pkt.dst();
    let (n, prefixes) = manager.unique_prefix(dst.ip);

    let mask = if use_unique_mask {
        unique_mask(n, &prefixes)
    } else if use_unique_prefix {
        Ipv4Addr::cidr_mask(n.min(32))
    } else {
        Ipv4Addr::cidr_mask(32)
    };
    let value = dst.ip.masked(mask);

    let mut m = Match {
        ip_proto: Some(pkt.proto),
        ipv4_dst: Some((value, mask)),
        ..Default::default()
    };
    // n > 32 (i.e. 33) means dst.ip is itself a cataloged service IP under a
    // different port: keep the port in the match so a scan of the other
    // ports on that IP cannot hide behind this default rule.
    if n > 32 {
        set_dst_port(&mut m, pkt.proto, dst.port);
    }

    FlowMod {
        table_id: T1_DETECT,
        priority: REACTIVE_DEFAULT_PRIORITY,
        cookie: Cookie::new(Category::Detect, Subcategory::Default),
        idle_timeout: flow_idle_timeout,
        m,
        instructions: vec![Instruction::GotoTable(T3_L2_DEFAULT)],
        buffer_id: None,
        notify_removed: false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edge_core::{Dpid, MacAddr, RouteTarget, SocketAddr4};
    use edge_manager::Edge;
    use std::sync::Arc;

    fn packet_in(dst_ip: &str, dst_port: u16) -> PacketIn {
        PacketIn {
            table_id: T1_DETECT,
            in_port: 1,
            buffer_id: Some(7),
            total_len: 64,
            data: vec![1, 2, 3],
            eth_src: MacAddr([2, 0, 0, 0, 0, 1]),
            eth_dst: MacAddr([2, 0, 0, 0, 0, 2]),
            ipv4_src: "10.0.1.5".parse().unwrap(),
            ipv4_dst: dst_ip.parse().unwrap(),
            proto: IpProto::Tcp,
            src_port: 41000,
            dst_port,
            is_edge: false,
        }
    }

    #[test]
    fn static_rules_are_priority_ordered() {
        let edge = Arc::new(Edge::new(
            "10.0.2.1".parse().unwrap(),
            Dpid::short(1),
            RouteTarget::Pod,
            vec![("10.0.1.0".parse().unwrap(), Ipv4Addr::cidr_mask(24))],
            None,
        ));
        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), vec![edge]);
        let mods = DetectTable::install_static(&switch);

        assert_eq!(mods[0].priority, EDGE_CIDR_PRIORITY);
        assert_eq!(mods[1].priority, PRIVATE_NET_PRIORITY);
        assert_eq!(mods[2].priority, FALLTHROUGH_PRIORITY);
    }

    #[test]
    fn cataloged_destination_goes_to_edge_outcome() {
        let manager = ServiceManager::new(false);
        let vaddr = SocketAddr4::new("203.0.113.9".parse().unwrap(), 80);
        manager.insert_service(edge_core::Service::new(vaddr, "svc.label"));
        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new());

        let pkt = packet_in("203.0.113.9", 80);
        match DetectTable::handle_packet_in(&switch, &manager, &pkt, true, true, 10) {
            DetectOutcome::Edge { flow_mod } => {
                assert_eq!(flow_mod.cookie.subcategory(), Subcategory::Edge);
                assert_eq!(flow_mod.instructions, vec![Instruction::GotoTable(T2_REDIRECT)]);
            }
            DetectOutcome::Default { .. } => panic!("expected an edge outcome"),
        }
    }

    #[test]
    fn non_service_destination_gets_a_default_rule() {
        let manager = ServiceManager::new(false);
        manager.insert_service(edge_core::Service::new(
            SocketAddr4::new("203.0.113.9".parse().unwrap(), 80),
            "svc.label",
        ));
        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new());

        let pkt = packet_in("8.8.8.8", 53);
        match DetectTable::handle_packet_in(&switch, &manager, &pkt, true, true, 10) {
            DetectOutcome::Default { flow_mod, .. } => {
                assert_eq!(flow_mod.cookie.subcategory(), Subcategory::Default);
                assert_eq!(flow_mod.instructions, vec![Instruction::GotoTable(T3_L2_DEFAULT)]);
                assert!(flow_mod.m.tcp_dst.is_none());
            }
            DetectOutcome::Edge { .. } => panic!("expected a default outcome"),
        }
    }

    #[test]
    fn port_scan_on_a_service_ip_keeps_the_port_in_the_match() {
        let manager = ServiceManager::new(false);
        let svc_ip: Ipv4Addr = "10.0.0.1".parse().unwrap();
        manager.insert_service(edge_core::Service::new(SocketAddr4::new(svc_ip, 80), "svc.label"));
        let switch = Switch::new(Dpid::short(1), "10.0.0.1".parse().unwrap(), Vec::new());

        // Same IP, different (unregistered) port: not a service hit, but the
        // IP itself is cataloged under port 80.
        let pkt = packet_in("10.0.0.1", 22);
        match DetectTable::handle_packet_in(&switch, &manager, &pkt, true, true, 10) {
            DetectOutcome::Default { flow_mod, .. } => {
                assert_eq!(flow_mod.m.tcp_dst, Some(22));
            }
            DetectOutcome::Edge { .. } => panic!("expected a default outcome"),
        }
    }

    #[test]
    fn unique_mask_ors_every_divergence_bit_plus_the_capped_prefix() {
        assert_eq!(unique_mask(24, &[8]), Ipv4Addr::octets(1, 0, 1, 0));
        assert_eq!(unique_mask(33, &[]), Ipv4Addr::cidr_mask(32));
    }
}
