//! Neighbor (ARP/ND) entries.

use crate::types::{IpAddress, MacAddress};
use serde::{Deserialize, Serialize};
use std::fmt;

/// A resolved neighbor: IP address, link address and the interface it was
/// learned on. The table key is the IP address alone.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NeighborEntry {
    pub ip: IpAddress,
    pub mac: MacAddress,
    pub ifindex: u32,
}

impl NeighborEntry {
    pub fn new(ip: IpAddress, mac: MacAddress, ifindex: u32) -> Self {
        Self { ip, mac, ifindex }
    }

    /// Table key.
    pub fn key(&self) -> IpAddress {
        self.ip
    }
}

impl fmt::Display for NeighborEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} lladdr {} dev {}", self.ip, self.mac, self.ifindex)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        let n = NeighborEntry::new(
            "192.168.1.1".parse().unwrap(),
            "00:11:22:33:44:55".parse().unwrap(),
            5,
        );
        assert_eq!(n.to_string(), "192.168.1.1 lladdr 00:11:22:33:44:55 dev 5");
        assert_eq!(n.key(), n.ip);
    }
}
