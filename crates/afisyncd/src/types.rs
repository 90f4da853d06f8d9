//! Address value types shared by routes, neighbors and interfaces.

use crate::error::{AfisyncError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::str::FromStr;

/// Length of an Ethernet link address.
pub const ETH_ALEN: usize = 6;

/// A 48-bit Ethernet MAC address.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct MacAddress([u8; ETH_ALEN]);

impl MacAddress {
    /// The zero/null MAC address (00:00:00:00:00:00).
    pub const ZERO: MacAddress = MacAddress([0; ETH_ALEN]);

    /// The broadcast MAC address (ff:ff:ff:ff:ff:ff).
    pub const BROADCAST: MacAddress = MacAddress([0xff; ETH_ALEN]);

    /// Creates a new MAC address from raw bytes.
    pub const fn new(bytes: [u8; ETH_ALEN]) -> Self {
        MacAddress(bytes)
    }

    /// Builds a MAC address from a kernel link-layer attribute.
    ///
    /// Returns `None` unless the slice is exactly six bytes long.
    pub fn from_slice(bytes: &[u8]) -> Option<Self> {
        let arr: [u8; ETH_ALEN] = bytes.try_into().ok()?;
        Some(MacAddress(arr))
    }

    /// Returns the raw bytes of the MAC address.
    pub const fn as_bytes(&self) -> &[u8; ETH_ALEN] {
        &self.0
    }

    /// Returns true if this is the zero address.
    pub fn is_zero(&self) -> bool {
        self.0 == Self::ZERO.0
    }
}

impl fmt::Display for MacAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}",
            self.0[0], self.0[1], self.0[2], self.0[3], self.0[4], self.0[5]
        )
    }
}

impl FromStr for MacAddress {
    type Err = AfisyncError;

    fn from_str(s: &str) -> Result<Self> {
        let separator = if s.contains(':') { ':' } else { '-' };

        let parts: Vec<&str> = s.split(separator).collect();
        if parts.len() != ETH_ALEN {
            return Err(AfisyncError::InvalidAddress(s.to_string()));
        }

        let mut bytes = [0u8; ETH_ALEN];
        for (i, part) in parts.iter().enumerate() {
            bytes[i] = u8::from_str_radix(part, 16)
                .map_err(|_| AfisyncError::InvalidAddress(s.to_string()))?;
        }

        Ok(MacAddress(bytes))
    }
}

impl TryFrom<String> for MacAddress {
    type Error = AfisyncError;

    fn try_from(s: String) -> Result<Self> {
        s.parse()
    }
}

impl From<MacAddress> for String {
    fn from(mac: MacAddress) -> String {
        mac.to_string()
    }
}

impl From<[u8; ETH_ALEN]> for MacAddress {
    fn from(bytes: [u8; ETH_ALEN]) -> Self {
        MacAddress(bytes)
    }
}

/// IP address family.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum AddressFamily {
    V4,
    V6,
}

impl AddressFamily {
    /// Payload width in bytes.
    pub const fn byte_len(&self) -> usize {
        match self {
            AddressFamily::V4 => 4,
            AddressFamily::V6 => 16,
        }
    }

    /// Maximum prefix length for the family.
    pub const fn max_prefix_len(&self) -> u8 {
        match self {
            AddressFamily::V4 => 32,
            AddressFamily::V6 => 128,
        }
    }
}

impl fmt::Display for AddressFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AddressFamily::V4 => f.write_str("ipv4"),
            AddressFamily::V6 => f.write_str("ipv6"),
        }
    }
}

/// An IPv4 or IPv6 address used as a table key.
///
/// Ordering is by family first (v4 before v6), then by the address bytes,
/// which is what `std::net::IpAddr` already provides.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IpAddress(IpAddr);

impl IpAddress {
    /// Builds an address from a family tag and its raw payload.
    ///
    /// The payload must be exactly as wide as the family requires.
    pub fn from_family_bytes(family: AddressFamily, bytes: &[u8]) -> Result<Self> {
        match family {
            AddressFamily::V4 => {
                let arr: [u8; 4] = bytes.try_into().map_err(|_| {
                    AfisyncError::InvalidAddress(format!(
                        "ipv4 payload must be 4 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Self(IpAddr::V4(Ipv4Addr::from(arr))))
            }
            AddressFamily::V6 => {
                let arr: [u8; 16] = bytes.try_into().map_err(|_| {
                    AfisyncError::InvalidAddress(format!(
                        "ipv6 payload must be 16 bytes, got {}",
                        bytes.len()
                    ))
                })?;
                Ok(Self(IpAddr::V6(Ipv6Addr::from(arr))))
            }
        }
    }

    /// The unspecified address of a family.
    pub const fn unspecified(family: AddressFamily) -> Self {
        match family {
            AddressFamily::V4 => Self(IpAddr::V4(Ipv4Addr::UNSPECIFIED)),
            AddressFamily::V6 => Self(IpAddr::V6(Ipv6Addr::UNSPECIFIED)),
        }
    }

    pub const fn inner(&self) -> IpAddr {
        self.0
    }

    pub const fn family(&self) -> AddressFamily {
        match self.0 {
            IpAddr::V4(_) => AddressFamily::V4,
            IpAddr::V6(_) => AddressFamily::V6,
        }
    }

    pub const fn is_ipv6(&self) -> bool {
        matches!(self.0, IpAddr::V6(_))
    }

    /// Raw payload, 4 bytes for v4 and 16 bytes for v6.
    pub fn octets(&self) -> Vec<u8> {
        match self.0 {
            IpAddr::V4(v4) => v4.octets().to_vec(),
            IpAddr::V6(v6) => v6.octets().to_vec(),
        }
    }

    /// False for the all-zero payload of the family.
    pub fn is_set(&self) -> bool {
        !self.0.is_unspecified()
    }

    /// Returns true for link-local addresses (169.254/16, fe80::/10).
    pub fn is_link_local(&self) -> bool {
        match self.0 {
            IpAddr::V4(v4) => v4.is_link_local(),
            IpAddr::V6(v6) => (v6.segments()[0] & 0xffc0) == 0xfe80,
        }
    }

    /// Returns true for addresses that must never be programmed as a real
    /// destination: loopback, multicast, link-local, site-local,
    /// v4-mapped/compatible and reserved ranges.
    ///
    /// The unspecified address is not special; it is the default route.
    pub fn is_special(&self) -> bool {
        match self.0 {
            IpAddr::V4(v4) => is_special_v4(&v4),
            IpAddr::V6(v6) => is_special_v6(&v6),
        }
    }
}

fn is_special_v4(addr: &Ipv4Addr) -> bool {
    let first = addr.octets()[0];
    addr.is_loopback()
        || addr.is_link_local()
        || addr.is_multicast()
        // 240.0.0.0/4 class E, includes limited broadcast
        || first >= 240
}

fn is_special_v6(addr: &Ipv6Addr) -> bool {
    if addr.is_unspecified() {
        return false;
    }
    let segments = addr.segments();
    addr.is_loopback()
        || addr.is_multicast()
        || (segments[0] & 0xffc0) == 0xfe80
        || (segments[0] & 0xffc0) == 0xfec0
        || is_v4_mapped(&segments)
        || is_v4_compat(&segments)
}

/// ::ffff:0:0/96
fn is_v4_mapped(segments: &[u16; 8]) -> bool {
    segments[..5].iter().all(|s| *s == 0) && segments[5] == 0xffff
}

/// ::/96 minus :: and ::1
fn is_v4_compat(segments: &[u16; 8]) -> bool {
    segments[..6].iter().all(|s| *s == 0) && (segments[6] != 0 || segments[7] > 1)
}

impl fmt::Display for IpAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

impl FromStr for IpAddress {
    type Err = AfisyncError;

    fn from_str(s: &str) -> Result<Self> {
        s.parse::<IpAddr>()
            .map(IpAddress)
            .map_err(|_| AfisyncError::InvalidAddress(s.to_string()))
    }
}

impl From<IpAddr> for IpAddress {
    fn from(addr: IpAddr) -> Self {
        IpAddress(addr)
    }
}

impl From<Ipv4Addr> for IpAddress {
    fn from(addr: Ipv4Addr) -> Self {
        IpAddress(IpAddr::V4(addr))
    }
}

impl From<Ipv6Addr> for IpAddress {
    fn from(addr: Ipv6Addr) -> Self {
        IpAddress(IpAddr::V6(addr))
    }
}

impl From<IpAddress> for IpAddr {
    fn from(addr: IpAddress) -> Self {
        addr.0
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
    fn test_mac_display_and_parse() {
        let mac: MacAddress = "aa:bb:cc:dd:ee:ff".parse().unwrap();
        assert_eq!(mac.as_bytes(), &[0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");

        let hyphen: MacAddress = "AA-BB-CC-DD-EE-FF".parse().unwrap();
        assert_eq!(mac, hyphen);
    }

    #[test]
    fn test_mac_from_slice_requires_six_bytes() {
        assert!(MacAddress::from_slice(&[1, 2, 3, 4, 5]).is_none());
        assert!(MacAddress::from_slice(&[1, 2, 3, 4, 5, 6, 7]).is_none());
        assert_eq!(
            MacAddress::from_slice(&[1, 2, 3, 4, 5, 6]),
            Some(MacAddress::new([1, 2, 3, 4, 5, 6]))
        );
    }

    #[test]
    fn test_mac_invalid() {
        assert!("00:11:22:33:44".parse::<MacAddress>().is_err());
        assert!("zz:11:22:33:44:55".parse::<MacAddress>().is_err());
    }

    #[test]
    fn test_ordering_family_first() {
        assert!(ip("255.255.255.254") < ip("::"));
        assert!(ip("10.0.0.1") < ip("10.0.0.2"));
        assert!(ip("2001:db8::1") < ip("2001:db8::2"));
    }

    #[test]
    fn test_from_family_bytes() {
        let v4 = IpAddress::from_family_bytes(AddressFamily::V4, &[10, 0, 0, 1]).unwrap();
        assert_eq!(v4, ip("10.0.0.1"));
        assert!(IpAddress::from_family_bytes(AddressFamily::V4, &[10, 0, 0]).is_err());
        assert!(IpAddress::from_family_bytes(AddressFamily::V6, &[0; 4]).is_err());
        assert_eq!(v4.octets(), vec![10, 0, 0, 1]);
    }

    #[test]
    fn test_is_set() {
        assert!(!ip("0.0.0.0").is_set());
        assert!(!ip("::").is_set());
        assert!(ip("192.168.1.1").is_set());
        assert!(!IpAddress::unspecified(AddressFamily::V6).is_set());
    }

    #[test]
    fn test_special_v4() {
        for s in ["127.0.0.1", "169.254.1.1", "224.0.0.5", "239.1.1.1", "240.0.0.1", "255.255.255.255"] {
            assert!(ip(s).is_special(), "{} should be special", s);
        }
        for s in ["0.0.0.0", "10.0.0.0", "192.168.1.1", "8.8.8.8"] {
            assert!(!ip(s).is_special(), "{} should not be special", s);
        }
    }

    #[test]
    fn test_special_v6() {
        for s in ["::1", "ff02::1", "fe80::1", "fec0::1", "::ffff:10.0.0.1", "::10.0.0.1"] {
            assert!(ip(s).is_special(), "{} should be special", s);
        }
        for s in ["::", "2001:db8::1", "fd00::1"] {
            assert!(!ip(s).is_special(), "{} should not be special", s);
        }
    }

    #[test]
    fn test_link_local() {
        assert!(ip("fe80::1").is_link_local());
        assert!(ip("169.254.0.1").is_link_local());
        assert!(!ip("2001:db8::1").is_link_local());
    }
}
