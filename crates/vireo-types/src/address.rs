//! Network addresses and service flags.

use serde::{Deserialize, Serialize};
use std::net::{IpAddr, SocketAddr};

/// Bitmask of services a node advertises.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize, PartialOrd, Ord,
)]
pub struct ServiceFlags(pub u64);

/// No services.
pub const NODE_NONE: ServiceFlags = ServiceFlags(0);
/// Full node: can serve the complete block chain.
pub const NODE_NETWORK: ServiceFlags = ServiceFlags(1 << 0);
/// Accepts bloom-filtered connections.
pub const NODE_BLOOM: ServiceFlags = ServiceFlags(1 << 2);

impl ServiceFlags {
    /// True if every bit in `other` is set in `self`.
    pub fn includes(&self, other: ServiceFlags) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for ServiceFlags {
    type Output = ServiceFlags;
    fn bitor(self, rhs: ServiceFlags) -> ServiceFlags {
        ServiceFlags(self.0 | rhs.0)
    }
}

impl std::fmt::Display for ServiceFlags {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// A peer address as carried in `addr` messages: socket address, advertised
/// services, and the last-seen timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct NetAddress {
    pub addr: SocketAddr,
    pub services: ServiceFlags,
    /// Unix seconds the address was last known to be good.
    pub time: i64,
}

impl NetAddress {
    pub fn new(addr: SocketAddr, services: ServiceFlags, time: i64) -> Self {
        Self {
            addr,
            services,
            time,
        }
    }

    /// Stable key for known-address filters: ip bytes plus port.
    pub fn key(&self) -> Vec<u8> {
        let mut key = Vec::with_capacity(19);
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                key.push(4);
                key.extend_from_slice(&ip.octets());
            }
            IpAddr::V6(ip) => {
                key.push(6);
                key.extend_from_slice(&ip.octets());
            }
        }
        key.extend_from_slice(&self.addr.port().to_le_bytes());
        key
    }

    /// Whether the address is plausibly reachable from the open internet.
    pub fn is_routable(&self) -> bool {
        match self.addr.ip() {
            IpAddr::V4(ip) => {
                !(ip.is_loopback()
                    || ip.is_private()
                    || ip.is_link_local()
                    || ip.is_broadcast()
                    || ip.is_unspecified())
            }
            IpAddr::V6(ip) => !(ip.is_loopback() || ip.is_unspecified()),
        }
    }

    /// Loopback addresses are never banned.
    pub fn is_local(&self) -> bool {
        self.addr.ip().is_loopback()
    }
}
