//! Redirect table (`T2`), grounded on
//! `original_source/ryu_ctrl/EdgeRedirector.py`.

use crate::types::{
    Action, Category, Cookie, FlowMod, FlowSink, Instruction, IpProto, Match, PacketIn, PacketOut, Subcategory,
    T2_REDIRECT, T3_L2_DEFAULT,
};
use edge_core::{Ipv4Addr, SocketAddr4};
use edge_dispatch::Dispatcher;
use edge_manager::{ServiceManager, Switch};
use std::sync::Arc;

const FORWARD_PRIORITY: u16 = 500;
const RETURN_PRIORITY: u16 = 500;
const DEFAULT_PRIORITY: u16 = 400;

pub struct RedirectTable;

impl RedirectTable {
    /// Watches both the redirect table's own table-miss packet-ins and the
    /// detect table's `isEdge`-tagged events (`of.isEdge` in the original).
    pub async fn handle_packet_in(
        switch: Arc<Switch>,
        dispatcher: Arc<Dispatcher>,
        manager: &ServiceManager,
        sink: Arc<dyn FlowSink>,
        pkt: PacketIn,
        flow_idle_timeout: u16,
    ) {
        let src = pkt.src();
        let dst = pkt.dst();

        if pkt.is_edge || manager.is_service(dst) {
            let switch_cb = switch.clone();
            let sink_cb = sink.clone();
            let proto = pkt.proto;
            let buffer_id = pkt.buffer_id;
            let data = pkt.data.clone();
            let in_port = pkt.in_port;

            let bound = dispatcher
                .dispatch(switch.clone(), src, dst, move |backend| {
                    install_forward_and_return(
                        &switch_cb,
                        sink_cb.as_ref(),
                        src,
                        dst,
                        backend,
                        proto,
                        buffer_id,
                        data,
                        in_port,
                        flow_idle_timeout,
                    );
                })
                .await;

            if bound {
                return;
            }
            tracing::warn!(%dst, "no servers available, falling back to regular forwarding");
        } else if manager.is_node_addr_at(switch.dpid, src) {
            if let Some(entry) = dispatcher.find_service_id(&switch, src, dst.ip) {
                install_return_reactive(&switch, sink.as_ref(), &pkt, entry.as_ref(), flow_idle_timeout);
                return;
            }
            tracing::warn!(%src, %dst, "no flow memory for return traffic, falling back to regular forwarding");
        }

        install_default(&switch, sink.as_ref(), &pkt, flow_idle_timeout);
    }
}

/// Appends a `Set*Dst`/`Set*Src` action for `new_port` only when it differs
/// from `current_port` (mirrors the original's `port if port != X else None`
/// trick: most services route without a port change).
fn push_port_action(actions: &mut Vec<Action>, proto: IpProto, is_src: bool, new_port: u16, current_port: u16) {
    if new_port == current_port {
        return;
    }
    actions.push(match (proto, is_src) {
        (IpProto::Tcp, true) => Action::SetTcpSrc(new_port),
        (IpProto::Tcp, false) => Action::SetTcpDst(new_port),
        (IpProto::Udp, true) => Action::SetUdpSrc(new_port),
        (IpProto::Udp, false) => Action::SetUdpDst(new_port),
    })
}

fn redirect_flow_mod(
    priority: u16,
    subcategory: Subcategory,
    m: Match,
    instructions: Vec<Instruction>,
    idle_timeout: u16,
) -> FlowMod {
    FlowMod {
        table_id: T2_REDIRECT,
        priority,
        cookie: Cookie::new(Category::Redirect, subcategory),
        idle_timeout,
        m,
        instructions,
        buffer_id: None,
        notify_removed: true,
    }
}

fn flush_packet(sink: &dyn FlowSink, dpid: edge_core::Dpid, in_port: u16, buffer_id: Option<u32>, data: Option<Vec<u8>>, actions: Vec<Action>) {
    sink.send_packet_out(
        dpid,
        PacketOut {
            buffer_id,
            in_port,
            actions,
            data,
        },
    );
}

/// Installs both flows for a freshly-bound backend: forward traffic rewritten
/// towards it, and the reverse path rewritten back to the virtual service
/// identity, installed proactively so the first return packet doesn't need
/// its own controller round trip.
#[allow(clippy::too_many_arguments)]
fn install_forward_and_return(
    switch: &Switch,
    sink: &dyn FlowSink,
    src: SocketAddr4,
    dst: SocketAddr4,
    backend: SocketAddr4,
    proto: IpProto,
    buffer_id: Option<u32>,
    data: Vec<u8>,
    in_port: u16,
    flow_idle_timeout: u16,
) {
    let fwd_match = Match {
        ip_proto: Some(proto),
        ipv4_src: Some((src.ip, Ipv4Addr::cidr_mask(32))),
        ipv4_dst: Some((dst.ip, Ipv4Addr::cidr_mask(32))),
        tcp_dst: if proto == IpProto::Tcp { Some(dst.port) } else { None },
        udp_dst: if proto == IpProto::Udp { Some(dst.port) } else { None },
        ..Default::default()
    };

    let mut fwd_actions = Vec::new();
    if let Some(mac) = backend.mac {
        fwd_actions.push(Action::SetEthDst(mac));
    }
    fwd_actions.push(Action::SetIpv4Dst(backend.ip));
    push_port_action(&mut fwd_actions, proto, false, backend.port, dst.port);
    let fwd_out_port = backend.mac.and_then(|mac| switch.port_for(mac));
    if let Some(port) = fwd_out_port {
        fwd_actions.push(Action::Output(port));
    }

    sink.send_flow_mod(
        switch.dpid,
        redirect_flow_mod(
            FORWARD_PRIORITY,
            Subcategory::Edge,
            fwd_match,
            vec![Instruction::ApplyActions(fwd_actions.clone())],
            flow_idle_timeout,
        ),
    );
    flush_packet(sink, switch.dpid, in_port, buffer_id, Some(data).filter(|_| buffer_id.is_none()), fwd_actions);

    // Proactive return flow: no triggering packet exists yet, so no
    // packet-out — just the rule.
    let ret_match = Match {
        ip_proto: Some(proto),
        ipv4_src: Some((backend.ip, Ipv4Addr::cidr_mask(32))),
        ipv4_dst: Some((src.ip, Ipv4Addr::cidr_mask(32))),
        tcp_src: if proto == IpProto::Tcp { Some(backend.port) } else { None },
        udp_src: if proto == IpProto::Udp { Some(backend.port) } else { None },
        ..Default::default()
    };

    let mut ret_actions = Vec::new();
    if let Some(mac) = dst.mac {
        ret_actions.push(Action::SetEthSrc(mac));
    }
    ret_actions.push(Action::SetIpv4Src(dst.ip));
    push_port_action(&mut ret_actions, proto, true, dst.port, backend.port);
    if let Some(mac) = src.mac {
        if let Some(port) = switch.port_for(mac) {
            ret_actions.push(Action::Output(port));
        }
    }

    sink.send_flow_mod(
        switch.dpid,
        redirect_flow_mod(
            RETURN_PRIORITY,
            Subcategory::Edge,
            ret_match,
            vec![Instruction::ApplyActions(ret_actions)],
            flow_idle_timeout,
        ),
    );
}

/// Reactive return-flow install: a return packet arrived before (or instead
/// of) the proactive rule catching it.
fn install_return_reactive(switch: &Switch, sink: &dyn FlowSink, pkt: &PacketIn, entry: &edge_flowmem::FlowEntry, flow_idle_timeout: u16) {
    let backend = pkt.src();
    let client = pkt.dst();

    let ret_match = Match {
        ip_proto: Some(pkt.proto),
        ipv4_src: Some((backend.ip, Ipv4Addr::cidr_mask(32))),
        ipv4_dst: Some((client.ip, Ipv4Addr::cidr_mask(32))),
        tcp_src: if pkt.proto == IpProto::Tcp { Some(backend.port) } else { None },
        udp_src: if pkt.proto == IpProto::Udp { Some(backend.port) } else { None },
        ..Default::default()
    };

    let mut actions = Vec::new();
    if let Some(mac) = entry.dst.mac {
        actions.push(Action::SetEthSrc(mac));
    }
    actions.push(Action::SetIpv4Src(entry.dst.ip));
    push_port_action(&mut actions, pkt.proto, true, entry.dst.port, backend.port);
    let out_port = client.mac.and_then(|mac| switch.port_for(mac));
    if let Some(port) = out_port {
        actions.push(Action::Output(port));
    }

    sink.send_flow_mod(
        switch.dpid,
        redirect_flow_mod(
            RETURN_PRIORITY,
            Subcategory::Edge,
            ret_match,
            vec![Instruction::ApplyActions(actions.clone())],
            flow_idle_timeout,
        ),
    );
    flush_packet(sink, switch.dpid, pkt.in_port, pkt.buffer_id, if pkt.buffer_id.is_none() { Some(pkt.data.clone()) } else { None }, actions);
}

/// Falls through to ordinary L2 forwarding: neither a forward nor a return
/// rule claimed this packet.
fn install_default(switch: &Switch, sink: &dyn FlowSink, pkt: &PacketIn, flow_idle_timeout: u16) {
    let src = pkt.src();
    let dst = pkt.dst();

    let mut m = Match {
        ipv4_src: Some((src.ip, Ipv4Addr::cidr_mask(32))),
        ipv4_dst: Some((dst.ip, Ipv4Addr::cidr_mask(32))),
        ..Default::default()
    };
    // dst.port matters only for traffic leaving to the public internet;
    // private-to-private traffic is matched on IPs alone.
    if !dst.ip.is_private() {
        match pkt.proto {
            IpProto::Tcp => m.tcp_dst = Some(dst.port),
            IpProto::Udp => m.udp_dst = Some(dst.port),
        }
    }

    sink.send_flow_mod(
        switch.dpid,
        redirect_flow_mod(
            DEFAULT_PRIORITY,
            Subcategory::Default,
            m,
            vec![Instruction::GotoTable(T3_L2_DEFAULT)],
            flow_idle_timeout,
        ),
    );

    if let Some(port) = switch.port_for(pkt.eth_dst) {
        flush_packet(
            sink,
            switch.dpid,
            pkt.in_port,
            pkt.buffer_id,
            if pkt.buffer_id.is_none() { Some(pkt.data.clone()) } else { None },
            vec![Action::Output(port)],
        );
    }
}
