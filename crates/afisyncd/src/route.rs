//! Route types and table keys.

use crate::types::{AddressFamily, IpAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A key identifying a route table slot (destination prefix + length).
///
/// Next hop and interface are deliberately not part of the key: a new
/// announcement for the same destination replaces the existing slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RouteKey {
    pub prefix: IpAddress,
    pub prefix_len: u8,
}

impl RouteKey {
    pub fn new(prefix: IpAddress, prefix_len: u8) -> Self {
        Self { prefix, prefix_len }
    }
}

impl fmt::Display for RouteKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)
    }
}

/// A route as announced by a notification source.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RouteEntry {
    /// Destination prefix address
    pub prefix: IpAddress,
    /// Destination prefix length
    pub prefix_len: u8,
    /// Gateway address, absent for directly connected or local routes
    pub next_hop: Option<IpAddress>,
    /// Kernel index of the outgoing interface (0 when unknown)
    pub next_hop_ifindex: u32,
    /// Discard matching packets
    pub blackhole: bool,
}

impl RouteEntry {
    /// Creates a route without a next hop.
    pub fn new(prefix: IpAddress, prefix_len: u8) -> Self {
        Self {
            prefix,
            prefix_len,
            next_hop: None,
            next_hop_ifindex: 0,
            blackhole: false,
        }
    }

    /// Sets the gateway address and outgoing interface.
    pub fn via(mut self, next_hop: IpAddress, ifindex: u32) -> Self {
        self.next_hop = Some(next_hop);
        self.next_hop_ifindex = ifindex;
        self
    }

    /// Sets only the outgoing interface.
    pub fn dev(mut self, ifindex: u32) -> Self {
        self.next_hop_ifindex = ifindex;
        self
    }

    /// Marks the route as a blackhole.
    pub fn blackhole(mut self) -> Self {
        self.blackhole = true;
        self
    }

    pub fn key(&self) -> RouteKey {
        RouteKey::new(self.prefix, self.prefix_len)
    }

    pub fn family(&self) -> AddressFamily {
        self.prefix.family()
    }

    /// The gateway, if one is present and not the unspecified address.
    pub fn resolved_next_hop(&self) -> Option<IpAddress> {
        self.next_hop.filter(|nh| nh.is_set())
    }

    /// Returns true if this route forwards through the given neighbor.
    pub fn depends_on(&self, neighbor_ip: &IpAddress) -> bool {
        self.resolved_next_hop().as_ref() == Some(neighbor_ip)
    }

    /// Destination match bytes and lookup field name for the forwarding plane.
    pub fn match_key(&self) -> (&'static str, Vec<u8>) {
        let field = match self.family() {
            AddressFamily::V4 => "packet.ip4.daddr",
            AddressFamily::V6 => "packet.ipv6.daddr",
        };
        (field, self.prefix.octets())
    }
}

impl fmt::Display for RouteEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.prefix, self.prefix_len)?;
        if self.blackhole {
            f.write_str(" blackhole")?;
        }
        if self.next_hop_ifindex != 0 {
            write!(f, " dev {}", self.next_hop_ifindex)?;
        }
        if let Some(nh) = self.resolved_next_hop() {
            write!(f, " via {}", nh)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    #[test]
    fn test_key_ignores_next_hop() {
        let a = RouteEntry::new(ip("10.0.0.0"), 24).via(ip("192.168.1.1"), 5);
        let b = RouteEntry::new(ip("10.0.0.0"), 24).via(ip("192.168.1.2"), 6);
        assert_eq!(a.key(), b.key());
        assert_ne!(a, b);
    }

    #[test]
    fn test_key_ordering() {
        let short = RouteKey::new(ip("10.0.0.0"), 8);
        let long = RouteKey::new(ip("10.0.0.0"), 24);
        let v6 = RouteKey::new(ip("::"), 0);
        assert!(short < long);
        assert!(long < v6);
    }

    #[test]
    fn test_unspecified_next_hop_is_unset() {
        let route = RouteEntry::new(ip("10.0.0.0"), 24).via(ip("0.0.0.0"), 5);
        assert_eq!(route.resolved_next_hop(), None);
        assert!(!route.depends_on(&ip("0.0.0.0")));
    }

    #[test]
    fn test_match_key_per_family() {
        let v4 = RouteEntry::new(ip("10.1.0.0"), 16);
        assert_eq!(v4.match_key(), ("packet.ip4.daddr", vec![10, 1, 0, 0]));

        let v6 = RouteEntry::new(ip("2001:db8::"), 32);
        let (field, bytes) = v6.match_key();
        assert_eq!(field, "packet.ipv6.daddr");
        assert_eq!(bytes.len(), 16);
    }

    #[test]
    fn test_display() {
        let route = RouteEntry::new(ip("10.0.0.0"), 24).via(ip("192.168.1.1"), 5);
        assert_eq!(route.to_string(), "10.0.0.0/24 dev 5 via 192.168.1.1");

        let bh = RouteEntry::new(ip("0.0.0.0"), 0).blackhole();
        assert_eq!(bh.to_string(), "0.0.0.0/0 blackhole");
    }
}
