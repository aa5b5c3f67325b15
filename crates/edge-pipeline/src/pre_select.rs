//! Pre-select table (`T0`), grounded on
//! `original_source/ryu_ctrl/EdgeDetector.py::configurePreSelectTable`.
//!
//! A separate table purely for performance: OpenFlow has no negation match,
//! so keeping "is this even candidate edge traffic" on its own table lets
//! the detect table stay a short inclusion list instead of growing one
//! exclusion rule per proto.

use crate::types::{Category, Cookie, FlowMod, Instruction, Match, Subcategory, IpProto, T0_PRE_SELECT, T1_DETECT, T3_L2_DEFAULT};
use edge_core::Ipv4Addr;

const PRIVATE_NET_PRIORITY: u16 = 1;
const FALLTHROUGH_PRIORITY: u16 = 0;

pub struct PreSelectTable;

impl PreSelectTable {
    /// Static rules installed once per switch connection: IPv4/TCP and
    /// IPv4/UDP traffic whose source sits in the switch's private network
    /// goes to the detect table; everything else skips straight to L2
    /// forwarding.
    pub fn install(gateway: Ipv4Addr) -> Vec<FlowMod> {
        let mut mods = Vec::new();
        let private_mask = gateway.private_mask();

        for proto in [IpProto::Tcp, IpProto::Udp] {
            if let Some(mask) = private_mask {
                let net = gateway.masked(mask);
                mods.push(FlowMod {
                    table_id: T0_PRE_SELECT,
                    priority: PRIVATE_NET_PRIORITY,
                    cookie: Cookie::new(Category::Detect, Subcategory::Default),
                    idle_timeout: 0,
                    m: Match {
                        ip_proto: Some(proto),
                        ipv4_src: Some((net, mask)),
                        ..Default::default()
                    },
                    instructions: vec![Instruction::GotoTable(T1_DETECT)],
                    buffer_id: None,
                    notify_removed: false,
                });
            }

            mods.push(FlowMod {
                table_id: T0_PRE_SELECT,
                priority: FALLTHROUGH_PRIORITY,
                cookie: Cookie::new(Category::Detect, Subcategory::Default),
                idle_timeout: 0,
                m: Match {
                    ip_proto: Some(proto),
                    ..Default::default()
                },
                instructions: vec![Instruction::GotoTable(T3_L2_DEFAULT)],
                buffer_id: None,
                notify_removed: false,
            });
        }
        mods
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn installs_goto_detect_and_fallthrough_per_proto() {
        let mods = PreSelectTable::install("10.0.0.1".parse().unwrap());
        assert_eq!(mods.len(), 4);
        assert!(mods.iter().all(|m| m.table_id == T0_PRE_SELECT));

        let goto_detect = mods
            .iter()
            .filter(|m| m.instructions == vec![Instruction::GotoTable(T1_DETECT)])
            .count();
        assert_eq!(goto_detect, 2);

        let fallthrough = mods
            .iter()
            .filter(|m| m.instructions == vec![Instruction::GotoTable(T3_L2_DEFAULT)] && m.priority == 0)
            .count();
        assert_eq!(fallthrough, 2);
    }

    #[test]
    fn non_private_gateway_skips_the_private_net_rule() {
        let mods = PreSelectTable::install("8.8.8.8".parse().unwrap());
        assert_eq!(mods.len(), 2);
        assert!(mods.iter().all(|m| m.priority == FALLTHROUGH_PRIORITY));
    }
}
