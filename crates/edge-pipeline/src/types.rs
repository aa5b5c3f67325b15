//! The OpenFlow v1.3 consumer-contract types from `SPEC_FULL.md` §6: a thin
//! boundary the pipeline speaks against, not a protocol implementation (the
//! wire encoding itself is out of scope per §1). `edge-controller` wires a
//! real transport to [`FlowSink`]; tests use an in-memory one.

use edge_core::{Dpid, Ipv4Addr, MacAddr, SocketAddr4};

/// Pre-select table: separates inbound (private-source) traffic from
/// everything else so the detect table only ever sees candidate edge
/// traffic.
pub const T0_PRE_SELECT: u8 = 0;
/// Detect table: decides, in dataplane, whether a packet is service traffic.
pub const T1_DETECT: u8 = 1;
/// Redirect table: rewrites service traffic to/from the chosen backend.
pub const T2_REDIRECT: u8 = 2;
/// L2-default table: ordinary MAC-learned forwarding.
pub const T3_L2_DEFAULT: u8 = 3;
/// Used by the L2 learner's destination lookup; out of scope here, kept as a
/// named constant since other tables reference it by number.
pub const T4_L2_LEARN: u8 = 4;

pub const MAX_PRIORITY: u16 = 65535;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IpProto {
    Tcp,
    Udp,
}

/// An OpenFlow match. All fields are wildcarded (`None`) unless set; IP
/// fields carry an arbitrary (not necessarily CIDR-contiguous) bitmask, as
/// OXM ipv4_src/ipv4_dst allow in OpenFlow 1.3.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Match {
    pub in_port: Option<u16>,
    pub ip_proto: Option<IpProto>,
    pub ipv4_src: Option<(Ipv4Addr, Ipv4Addr)>,
    pub ipv4_dst: Option<(Ipv4Addr, Ipv4Addr)>,
    pub tcp_src: Option<u16>,
    pub tcp_dst: Option<u16>,
    pub udp_src: Option<u16>,
    pub udp_dst: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Action {
    SetEthSrc(MacAddr),
    SetEthDst(MacAddr),
    SetIpv4Src(Ipv4Addr),
    SetIpv4Dst(Ipv4Addr),
    SetTcpSrc(u16),
    SetTcpDst(u16),
    SetUdpSrc(u16),
    SetUdpDst(u16),
    Output(u16),
    /// `OFPP_CONTROLLER`, modeled as its own variant rather than a reserved
    /// port number since the wire encoding is out of scope.
    ToController,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    GotoTable(u8),
    ApplyActions(Vec<Action>),
}

/// Which phase of the pipeline produced a flow-mod, used to tag its cookie
/// so flow-removed statistics can be accounted by class (`SPEC_FULL.md`
/// §4.8).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Category {
    Detect,
    Redirect,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Subcategory {
    Edge,
    Default,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cookie(pub u64);

impl Cookie {
    pub const fn new(category: Category, subcategory: Subcategory) -> Self {
        let cat_bit = match category {
            Category::Detect => 0u64,
            Category::Redirect => 1u64,
        };
        let sub_bit = match subcategory {
            Subcategory::Edge => 0u64,
            Subcategory::Default => 1u64,
        };
        Cookie((cat_bit << 1) | sub_bit)
    }

    pub fn category(self) -> Category {
        if self.0 & 0b10 == 0 { Category::Detect } else { Category::Redirect }
    }

    pub fn subcategory(self) -> Subcategory {
        if self.0 & 0b01 == 0 { Subcategory::Edge } else { Subcategory::Default }
    }
}

#[derive(Debug, Clone)]
pub struct FlowMod {
    pub table_id: u8,
    pub priority: u16,
    pub cookie: Cookie,
    pub idle_timeout: u16,
    pub m: Match,
    pub instructions: Vec<Instruction>,
    /// `None` means `NO_BUFFER`: the switch did not buffer the triggering
    /// packet (or there was none), and a separate [`PacketOut`] is needed to
    /// deliver it.
    pub buffer_id: Option<u32>,
    /// Requests a `FlowRemoved` event when this entry expires or is deleted
    /// (only the redirect table's entries do, per `SPEC_FULL.md` §8 scenario
    /// 6 and `original_source/ryu_ctrl/EdgeRedirector.py::redirect`).
    pub notify_removed: bool,
}

#[derive(Debug, Clone)]
pub struct PacketOut {
    pub buffer_id: Option<u32>,
    pub in_port: u16,
    pub actions: Vec<Action>,
    /// Required when `buffer_id` is `None`.
    pub data: Option<Vec<u8>>,
}

/// A packet-in, already parsed down to the L3/L4 fields the pipeline needs
/// (ARP/header parsing itself is out of scope per `SPEC_FULL.md` §1).
#[derive(Debug, Clone)]
pub struct PacketIn {
    pub table_id: u8,
    pub in_port: u16,
    pub buffer_id: Option<u32>,
    pub total_len: u32,
    pub data: Vec<u8>,
    pub eth_src: MacAddr,
    pub eth_dst: MacAddr,
    pub ipv4_src: Ipv4Addr,
    pub ipv4_dst: Ipv4Addr,
    pub proto: IpProto,
    pub src_port: u16,
    pub dst_port: u16,
    /// Set by the detect table when it reactively matches a cataloged
    /// destination, so the redirector processes the same event immediately
    /// instead of waiting for a second packet-in at T2 (`isEdge` in the
    /// original).
    pub is_edge: bool,
}

impl PacketIn {
    pub fn src(&self) -> SocketAddr4 {
        SocketAddr4::with_mac(self.ipv4_src, self.src_port, self.eth_src)
    }

    pub fn dst(&self) -> SocketAddr4 {
        SocketAddr4::with_mac(self.ipv4_dst, self.dst_port, self.eth_dst)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RemovedReason {
    IdleTimeout,
    HardTimeout,
    Delete,
    GroupDelete,
}

#[derive(Debug, Clone, Copy)]
pub struct FlowRemoved {
    pub reason: RemovedReason,
    pub cookie: Cookie,
    pub table_id: u8,
    pub duration_sec: u32,
    pub packet_count: u64,
    pub byte_count: u64,
}

/// Where the pipeline sends the OpenFlow messages it produces. A thin
/// boundary rather than a protocol implementation; `edge-controller` wires a
/// real transport, tests use an in-memory recorder.
pub trait FlowSink: Send + Sync {
    fn send_flow_mod(&self, dpid: Dpid, flow_mod: FlowMod);
    fn send_packet_out(&self, dpid: Dpid, packet_out: PacketOut);
    fn send_barrier(&self, dpid: Dpid);
}
