//! Addressing primitives, layered configuration, and the shared error enum
//! used by every other `edge-*` crate.

mod addr;
mod config;
mod dpid;
mod error;
mod service;

pub use addr::{Host, MacAddr, SocketAddr4};
pub use config::{Config, ConfigError, EdgeSpec, RootConfig, SchedulerSpec, SwitchSpec};
pub use dpid::Dpid;
pub use error::CoreError;
pub use service::{Deployment, RouteTarget, Service, ServiceInstance};

/// Newtype over a 32-bit IPv4 address, stored host-endian (most significant
/// octet first) to match the bit-arithmetic the service catalog performs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Ipv4Addr(pub u32);

impl Ipv4Addr {
    pub const fn new(bits: u32) -> Self {
        Self(bits)
    }

    pub const fn octets(a: u8, b: u8, c: u8, d: u8) -> Self {
        Self(((a as u32) << 24) | ((b as u32) << 16) | ((c as u32) << 8) | d as u32)
    }

    pub fn from_std(addr: std::net::Ipv4Addr) -> Self {
        Self(u32::from(addr))
    }

    pub fn to_std(self) -> std::net::Ipv4Addr {
        std::net::Ipv4Addr::from(self.0)
    }

    pub fn bits(self) -> u32 {
        self.0
    }

    /// Mirrors `IPAddr.isPrivateIP` in the original controller: delegates to
    /// the standard private-range definition (RFC 1918 plus loopback/
    /// link-local, which `std` already classifies as private for IPv4).
    pub fn is_private(self) -> bool {
        self.to_std().is_private() || self.to_std().is_loopback() || self.to_std().is_link_local()
    }

    /// Returns the mask that matches every address in the same private
    /// network as `self`, or `None` if `self` isn't a recognized private
    /// range (including `0.0.0.0` and `255.255.255.255`).
    ///
    /// Table taken verbatim from the reference controller: it does not use
    /// the real RFC 1918 prefix lengths, only a coarse first-octet check.
    pub fn private_mask(self) -> Option<Ipv4Addr> {
        let o = self.to_std().octets();
        match o[0] {
            192 | 172 | 169 => Some(Ipv4Addr::octets(255, 255, 0, 0)),
            10 => Some(Ipv4Addr::octets(255, 0, 0, 0)),
            _ => None,
        }
    }

    /// Mask for a CIDR prefix length (0..=32).
    pub fn cidr_mask(prefix_len: u8) -> Ipv4Addr {
        if prefix_len == 0 {
            Ipv4Addr(0)
        } else {
            Ipv4Addr(u32::MAX << (32 - prefix_len as u32))
        }
    }

    pub fn masked(self, mask: Ipv4Addr) -> Ipv4Addr {
        Ipv4Addr(self.0 & mask.0)
    }
}

impl std::fmt::Display for Ipv4Addr {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_std())
    }
}

impl std::str::FromStr for Ipv4Addr {
    type Err = std::net::AddrParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.parse::<std::net::Ipv4Addr>().map(Ipv4Addr::from_std)
    }
}
