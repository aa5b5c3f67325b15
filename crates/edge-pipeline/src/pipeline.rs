//! Wires the four tables together: static install on switch connect, and
//! packet-in/flow-removed dispatch by table, grounded on the `connect`/
//! `packetIn` methods of `original_source/ryu_ctrl/{EdgeDetector,
//! EdgeRedirector}.py`.

use crate::detect::{DetectOutcome, DetectTable};
use crate::pre_select::PreSelectTable;
use crate::redirect::RedirectTable;
use crate::types::{FlowRemoved, FlowSink, PacketIn, RemovedReason, T1_DETECT, T2_REDIRECT};
use edge_dispatch::Dispatcher;
use edge_manager::{ServiceManager, Switch};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("packet-in arrived at unexpected table {table_id}")]
    UnexpectedTable { table_id: u8 },
}

/// Glues the pipeline's four tables to the dispatcher/service manager and an
/// OpenFlow consumer-contract sink.
pub struct Pipeline {
    manager: Arc<ServiceManager>,
    dispatcher: Arc<Dispatcher>,
    sink: Arc<dyn FlowSink>,
    use_unique_prefix: bool,
    use_unique_mask: bool,
    flow_idle_timeout: u16,
}

impl Pipeline {
    pub fn new(
        manager: Arc<ServiceManager>,
        dispatcher: Arc<Dispatcher>,
        sink: Arc<dyn FlowSink>,
        use_unique_prefix: bool,
        use_unique_mask: bool,
        flow_idle_timeout: u16,
    ) -> Self {
        Self {
            manager,
            dispatcher,
            sink,
            use_unique_prefix,
            use_unique_mask,
            flow_idle_timeout,
        }
    }

    /// Installs every table's static rules for a newly-connected switch.
    pub fn on_connect(&self, switch: &Switch) {
        tracing::info!(dpid = %switch.dpid, "connected");
        for flow_mod in PreSelectTable::install(switch.gateway) {
            self.sink.send_flow_mod(switch.dpid, flow_mod);
        }
        for flow_mod in DetectTable::install_static(switch) {
            self.sink.send_flow_mod(switch.dpid, flow_mod);
        }
        self.sink.send_barrier(switch.dpid);
    }

    /// Dispatches one packet-in to the table that owns it. Detect-table
    /// events that resolve to a cataloged destination are chained straight
    /// into the redirect table, in the same call, matching the original's
    /// `isEdge` same-event hand-off.
    pub async fn on_packet_in(&self, switch: Arc<Switch>, mut pkt: PacketIn) -> Result<(), PipelineError> {
        match pkt.table_id {
            T1_DETECT => {
                match DetectTable::handle_packet_in(
                    &switch,
                    &self.manager,
                    &pkt,
                    self.use_unique_prefix,
                    self.use_unique_mask,
                    self.flow_idle_timeout,
                ) {
                    DetectOutcome::Edge { flow_mod } => {
                        self.sink.send_flow_mod(switch.dpid, flow_mod);
                        pkt.is_edge = true;
                        RedirectTable::handle_packet_in(
                            switch,
                            self.dispatcher.clone(),
                            &self.manager,
                            self.sink.clone(),
                            pkt,
                            self.flow_idle_timeout,
                        )
                        .await;
                    }
                    DetectOutcome::Default { flow_mod, packet_out } => {
                        self.sink.send_flow_mod(switch.dpid, flow_mod);
                        if let Some(packet_out) = packet_out {
                            self.sink.send_packet_out(switch.dpid, packet_out);
                        }
                    }
                }
                Ok(())
            }
            T2_REDIRECT => {
                RedirectTable::handle_packet_in(
                    switch,
                    self.dispatcher.clone(),
                    &self.manager,
                    self.sink.clone(),
                    pkt,
                    self.flow_idle_timeout,
                )
                .await;
                Ok(())
            }
            table_id => Err(PipelineError::UnexpectedTable { table_id }),
        }
    }

    /// Logs flow-removed accounting; no corrective action is taken
    /// regardless of reason (`SPEC_FULL.md` §7, §8 scenario 6).
    pub fn on_flow_removed(&self, removed: FlowRemoved) {
        tracing::info!(
            reason = ?removed.reason,
            table_id = removed.table_id,
            category = ?removed.cookie.category(),
            subcategory = ?removed.cookie.subcategory(),
            duration_sec = removed.duration_sec,
            packet_count = removed.packet_count,
            byte_count = removed.byte_count,
            "flow removed"
        );
        if removed.reason != RemovedReason::IdleTimeout {
            tracing::warn!(reason = ?removed.reason, table_id = removed.table_id, "flow removed for a reason other than idle timeout");
        }
    }
}
