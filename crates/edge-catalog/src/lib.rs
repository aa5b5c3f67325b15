//! `TinyServiceTrie`: the bitwise service catalog described in
//! `SPEC_FULL.md` §4.1, grounded on `original_source/util/TinyServiceTrie.py`.
//! The original wraps an external `TinyTricia` (not present in the retrieved
//! sources); here the same contract — membership, IP-level containment, and
//! unique-prefix computation for building maximal default-traffic flow
//! matches — is implemented directly over a small arena-backed bit-trie
//! (`trie::BitTrie`).

mod trie;

use edge_core::{Ipv4Addr, SocketAddr4};
use trie::BitTrie;

const KEY_BITS: u8 = 48;
const IP_BITS: u8 = 32;

fn key_of(addr: SocketAddr4) -> u64 {
    ((addr.ip.bits() as u64) << 16) | addr.port as u64
}

/// Bitwise trie over `(ip << 16 | port)` keys, used to answer three
/// questions: is this exact (ip, port) a registered service, is this IP
/// registered under any port, and — for IPs that are not registered — what
/// is the smallest IP prefix that distinguishes them from every registered
/// service IP (used to build the widest safe default-traffic flow match).
pub struct TinyServiceTrie<V> {
    exact: BitTrie<V>,
    ips: BitTrie<()>,
}

impl<V> Default for TinyServiceTrie<V> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V> TinyServiceTrie<V> {
    pub fn new() -> Self {
        Self {
            exact: BitTrie::new(),
            ips: BitTrie::new(),
        }
    }

    /// Registers `addr` with `value`, overwriting any prior value at that
    /// exact (ip, port).
    pub fn set(&mut self, addr: SocketAddr4, value: V) {
        self.exact.insert(key_of(addr), KEY_BITS, value);
        if !self.ips.contains(addr.ip.bits() as u64, IP_BITS) {
            self.ips.insert(addr.ip.bits() as u64, IP_BITS, ());
        }
    }

    pub fn get(&self, addr: SocketAddr4) -> Option<&V> {
        self.exact.get(key_of(addr), KEY_BITS)
    }

    pub fn contains(&self, addr: SocketAddr4) -> bool {
        self.exact.contains(key_of(addr), KEY_BITS)
    }

    /// True iff `ip` matches some registered service's IP, under any port.
    pub fn contains_ip(&self, ip: Ipv4Addr) -> bool {
        self.ips.contains(ip.bits() as u64, IP_BITS)
    }

    /// Returns `(n, prefixes)`: `n` is the smallest number of high bits of
    /// `ip` that distinguish it from every other registered service IP; `33`
    /// means `ip` is itself a registered service IP (under some port).
    /// `prefixes` lists the 1-indexed bit positions, ancestor-to-descendant,
    /// where the IP index forks (both a 0-branch and a 1-branch exist) along
    /// the path to `ip` — the caller ORs `1 << (32 - p)` for every `p` in
    /// `prefixes ∪ {min(n, 32)}` to build a sparse "unique mask" matching the
    /// widest safe set of non-service addresses in one flow rule.
    pub fn unique_prefix(&self, ip: Ipv4Addr) -> (u8, Vec<u8>) {
        if self.contains_ip(ip) {
            return (33, Vec::new());
        }
        let (depth, forks) = self.ips.divergence(ip.bits() as u64, IP_BITS);
        (depth, forks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(ip: &str, port: u16) -> SocketAddr4 {
        SocketAddr4::new(ip.parse().unwrap(), port)
    }

    #[test]
    fn exact_and_ip_membership() {
        let mut trie: TinyServiceTrie<&'static str> = TinyServiceTrie::new();
        trie.set(addr("10.0.0.1", 80), "svc-a");

        assert!(trie.contains(addr("10.0.0.1", 80)));
        assert!(!trie.contains(addr("10.0.0.1", 81)));
        assert!(trie.contains_ip(addr("10.0.0.1", 81).ip));
        assert!(!trie.contains_ip(addr("10.0.0.2", 80).ip));
    }

    #[test]
    fn unique_prefix_worked_examples() {
        let mut trie: TinyServiceTrie<&'static str> = TinyServiceTrie::new();
        trie.set(addr("10.0.0.1", 80), "svc-a");

        assert_eq!(trie.unique_prefix(addr("10.0.0.1", 0).ip).0, 33);

        let (n, _) = trie.unique_prefix(addr("10.0.0.2", 0).ip);
        assert_eq!(n, 32);

        let (n, _) = trie.unique_prefix(addr("192.168.1.1", 0).ip);
        assert_eq!(n, 1);
    }

    #[test]
    fn unique_prefix_distinguishes_within_a_set() {
        let mut trie: TinyServiceTrie<&'static str> = TinyServiceTrie::new();
        trie.set(addr("203.0.113.9", 80), "svc-a");
        trie.set(addr("203.0.113.10", 80), "svc-b");

        // Neither registered IP may leak into the other's unique prefix.
        let (n1, _) = trie.unique_prefix(addr("8.8.8.8", 0).ip);
        assert!(n1 < 33);
        assert!(!trie.contains_ip(addr("8.8.8.8", 0).ip));
    }

    #[test]
    fn insertion_order_does_not_affect_membership() {
        let mut a: TinyServiceTrie<u32> = TinyServiceTrie::new();
        a.set(addr("10.0.0.1", 80), 1);
        a.set(addr("10.0.0.2", 443), 2);

        let mut b: TinyServiceTrie<u32> = TinyServiceTrie::new();
        b.set(addr("10.0.0.2", 443), 2);
        b.set(addr("10.0.0.1", 80), 1);

        for ip in ["10.0.0.1", "10.0.0.2", "10.0.0.3", "192.168.1.1"] {
            let ip: Ipv4Addr = ip.parse().unwrap();
            assert_eq!(a.contains_ip(ip), b.contains_ip(ip));
            assert_eq!(a.unique_prefix(ip), b.unique_prefix(ip));
        }
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #[test]
        fn order_independent_membership(
            ips in proptest::collection::vec(any::<u32>(), 1..12),
            ports in proptest::collection::vec(any::<u16>(), 1..12),
        ) {
            let n = ips.len().min(ports.len());
            let pairs: Vec<(u32, u16)> = ips.into_iter().zip(ports).take(n).collect();

            let build = |order: &[(u32, u16)]| {
                let mut t: TinyServiceTrie<()> = TinyServiceTrie::new();
                for (ip, port) in order {
                    t.set(SocketAddr4::new(Ipv4Addr::new(*ip), *port), ());
                }
                t
            };

            let forward = build(&pairs);
            let mut reversed = pairs.clone();
            reversed.reverse();
            let backward = build(&reversed);

            for (ip, port) in &pairs {
                let a = SocketAddr4::new(Ipv4Addr::new(*ip), *port);
                prop_assert_eq!(forward.contains(a), backward.contains(a));
                prop_assert_eq!(forward.contains_ip(a.ip), backward.contains_ip(a.ip));
            }
        }
    }
}
