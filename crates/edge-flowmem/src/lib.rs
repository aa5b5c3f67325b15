//! `FlowMemory`: the controller-side client->backend binding cache described
//! in `SPEC_FULL.md` §4.2, grounded on `original_source/util/FlowMemory.py`.
//!
//! The client's port is deliberately left out of both lookup keys so a
//! reconnect from a fresh ephemeral port still lands on the same backend.

use dashmap::DashMap;
use edge_core::{Ipv4Addr, SocketAddr4};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// One (client, virtual-service) -> backend binding, shared between the
/// forward and return indexes so a refresh through either path is visible
/// to both.
#[derive(Debug)]
pub struct FlowEntry {
    pub src: SocketAddr4,
    pub dst: SocketAddr4,
    pub edge: SocketAddr4,
    deadline: parking_lot::Mutex<Instant>,
}

impl FlowEntry {
    fn new(src: SocketAddr4, dst: SocketAddr4, edge: SocketAddr4, idle: Duration) -> Self {
        Self {
            src,
            dst,
            edge,
            deadline: parking_lot::Mutex::new(Instant::now() + idle),
        }
    }

    fn refresh(&self, idle: Duration) {
        *self.deadline.lock() = Instant::now() + idle;
    }

    pub fn is_expired(&self) -> bool {
        Instant::now() > *self.deadline.lock()
    }

    fn fwd_key(&self) -> (Ipv4Addr, SocketAddr4) {
        (self.src.ip, self.dst)
    }

    fn ret_key(&self) -> (SocketAddr4, Ipv4Addr) {
        (self.edge, self.src.ip)
    }
}

/// Bidirectional flow-binding cache with idle expiry.
///
/// `fwd` answers "where did we already send this client's traffic for this
/// virtual service" and `ret` answers "which client does this edge-sourced
/// packet belong to", matching `FlowMemory.getFwd`/`getRet` in the original.
pub struct FlowMemory {
    idle: Duration,
    fwd: DashMap<(Ipv4Addr, SocketAddr4), Arc<FlowEntry>>,
    ret: DashMap<(SocketAddr4, Ipv4Addr), Arc<FlowEntry>>,
}

impl FlowMemory {
    pub fn new(idle_timeout: Duration) -> Self {
        Self {
            idle: idle_timeout,
            fwd: DashMap::new(),
            ret: DashMap::new(),
        }
    }

    /// `idleTimeout` defaults to 10x the OpenFlow flow idle timeout, per
    /// `SPEC_FULL.md` §4.2.
    pub fn with_flow_idle_timeout_secs(flow_idle_timeout_secs: u64) -> Self {
        Self::new(Duration::from_secs(flow_idle_timeout_secs.saturating_mul(10)))
    }

    /// Registers a new binding, refreshing its timeout and inserting it into
    /// both indexes.
    pub fn add(&self, src: SocketAddr4, dst: SocketAddr4, edge: SocketAddr4) -> Arc<FlowEntry> {
        let entry = Arc::new(FlowEntry::new(src, dst, edge, self.idle));
        self.fwd.insert(entry.fwd_key(), entry.clone());
        self.ret.insert(entry.ret_key(), entry.clone());
        entry
    }

    /// Client -> virtual-service lookup. Sweeps expired entries from both
    /// indexes first (matching `getFwd`'s "expire on fwd event only"
    /// comment), then returns a refreshed entry on hit.
    pub fn get_fwd(&self, src: SocketAddr4, dst: SocketAddr4) -> Option<Arc<FlowEntry>> {
        self.expire_old_flows();
        let entry = self.fwd.get(&(src.ip, dst)).map(|r| r.value().clone())?;
        entry.refresh(self.idle);
        Some(entry)
    }

    /// Edge -> client lookup. Does not sweep, matching the original.
    pub fn get_ret(&self, edge: SocketAddr4, src_ip: Ipv4Addr) -> Option<Arc<FlowEntry>> {
        let entry = self.ret.get(&(edge, src_ip)).map(|r| r.value().clone())?;
        entry.refresh(self.idle);
        Some(entry)
    }

    /// Removes `entry` from both indexes. Used by the dispatcher when a vMac
    /// drift forces an entry to be replaced rather than refreshed in place
    /// (`SPEC_FULL.md` §4.5's `findServiceID`).
    pub fn remove(&self, entry: &FlowEntry) {
        self.fwd.remove(&entry.fwd_key());
        self.ret.remove(&entry.ret_key());
    }

    fn expire_old_flows(&self) {
        self.fwd.retain(|_, v| !v.is_expired());
        self.ret.retain(|_, v| !v.is_expired());
    }

    pub fn len(&self) -> usize {
        self.fwd.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fwd.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> SocketAddr4 {
        SocketAddr4::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn add_then_fwd_and_ret_both_hit() {
        let mem = FlowMemory::new(Duration::from_secs(60));
        let src = addr("10.0.1.5", 41000);
        let dst = addr("203.0.113.9", 80);
        let edge = addr("10.0.2.9", 8080);

        mem.add(src, dst, edge);

        let fwd = mem.get_fwd(src, dst).expect("fwd hit");
        assert_eq!(fwd.edge, edge);

        let ret = mem.get_ret(edge, src.ip).expect("ret hit");
        assert_eq!(ret.dst, dst);
    }

    #[test]
    fn client_port_is_not_part_of_the_key() {
        let mem = FlowMemory::new(Duration::from_secs(60));
        let dst = addr("203.0.113.9", 80);
        let edge = addr("10.0.2.9", 8080);

        mem.add(addr("10.0.1.5", 41000), dst, edge);

        // same client IP, different ephemeral port -> still a hit
        let fwd = mem.get_fwd(addr("10.0.1.5", 55123), dst).expect("fwd hit");
        assert_eq!(fwd.edge, edge);
    }

    #[test]
    fn expired_entry_disappears_from_both_indexes() {
        let mem = FlowMemory::new(Duration::from_millis(10));
        let src = addr("10.0.1.5", 41000);
        let dst = addr("203.0.113.9", 80);
        let edge = addr("10.0.2.9", 8080);

        mem.add(src, dst, edge);
        std::thread::sleep(Duration::from_millis(30));

        assert!(mem.get_fwd(src, dst).is_none());
        assert!(mem.get_ret(edge, src.ip).is_none());
    }

    #[test]
    fn fwd_lookup_refreshes_timeout() {
        let mem = FlowMemory::new(Duration::from_millis(50));
        let src = addr("10.0.1.5", 41000);
        let dst = addr("203.0.113.9", 80);
        let edge = addr("10.0.2.9", 8080);

        mem.add(src, dst, edge);
        std::thread::sleep(Duration::from_millis(30));
        assert!(mem.get_fwd(src, dst).is_some()); // refreshes
        std::thread::sleep(Duration::from_millis(30));
        assert!(mem.get_fwd(src, dst).is_some()); // would have expired without the refresh
    }
}
