//! Default [`FlowSink`]: the OpenFlow wire transport itself is out of scope
//! here (`SPEC_FULL.md` §1), so the controller ships a sink that renders
//! every message it would have sent as a structured `tracing` event. A real
//! deployment swaps this for an adapter over its OpenFlow transport crate.

use edge_core::Dpid;
use edge_pipeline::{FlowMod, FlowSink, PacketOut};

pub struct LoggingFlowSink;

impl FlowSink for LoggingFlowSink {
    fn send_flow_mod(&self, dpid: Dpid, flow_mod: FlowMod) {
        tracing::debug!(
            %dpid,
            table_id = flow_mod.table_id,
            priority = flow_mod.priority,
            cookie = flow_mod.cookie.0,
            idle_timeout = flow_mod.idle_timeout,
            notify_removed = flow_mod.notify_removed,
            "flow_mod"
        );
    }

    fn send_packet_out(&self, dpid: Dpid, packet_out: PacketOut) {
        tracing::debug!(
            %dpid,
            in_port = packet_out.in_port,
            buffered = packet_out.buffer_id.is_some(),
            actions = packet_out.actions.len(),
            "packet_out"
        );
    }

    fn send_barrier(&self, dpid: Dpid) {
        tracing::debug!(%dpid, "barrier_request");
    }
}
