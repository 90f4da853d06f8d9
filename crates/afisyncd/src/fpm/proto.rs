//! Protobuf payload of FPM frames (`fpm.Message` and the `qpb` helpers it
//! uses), and its conversion into engine events.

use crate::error::{AfisyncError, Result};
use crate::event::SyncEvent;
use crate::route::RouteEntry;
use crate::types::{AddressFamily as Family, IpAddress};
use std::net::Ipv4Addr;

pub mod qpb {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
    #[repr(i32)]
    pub enum AddressFamily {
        UnknownAf = 0,
        Ipv4 = 1,
        Ipv6 = 2,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct L3Prefix {
        #[prost(uint32, tag = "1")]
        pub length: u32,
        #[prost(bytes = "vec", tag = "2")]
        pub bytes: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct IfIdentifier {
        #[prost(int32, optional, tag = "1")]
        pub index: Option<i32>,
        #[prost(string, optional, tag = "2")]
        pub name: Option<String>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Ipv4Address {
        /// Host byte order
        #[prost(fixed32, tag = "1")]
        pub value: u32,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct Ipv6Address {
        #[prost(bytes = "vec", tag = "1")]
        pub bytes: Vec<u8>,
    }

    #[derive(Clone, PartialEq, prost::Message)]
    pub struct L3Address {
        #[prost(message, optional, tag = "1")]
        pub v4: Option<Ipv4Address>,
        #[prost(message, optional, tag = "2")]
        pub v6: Option<Ipv6Address>,
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum MessageType {
    UnknownMsg = 0,
    AddRoute = 1,
    DeleteRoute = 2,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub enum RouteType {
    Unknown = 0,
    Normal = 1,
    Unreachable = 2,
    Blackhole = 3,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct RouteKey {
    #[prost(message, optional, tag = "1")]
    pub prefix: Option<qpb::L3Prefix>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Nexthop {
    #[prost(message, optional, tag = "2")]
    pub if_id: Option<qpb::IfIdentifier>,
    #[prost(message, optional, tag = "3")]
    pub address: Option<qpb::L3Address>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct AddRoute {
    #[prost(uint32, tag = "1")]
    pub vrf_id: u32,
    #[prost(enumeration = "qpb::AddressFamily", tag = "2")]
    pub address_family: i32,
    #[prost(uint32, tag = "3")]
    pub sub_address_family: u32,
    #[prost(uint32, tag = "4")]
    pub protocol: u32,
    #[prost(uint32, tag = "5")]
    pub metric: u32,
    #[prost(message, optional, tag = "6")]
    pub key: Option<RouteKey>,
    #[prost(message, repeated, tag = "7")]
    pub nexthops: Vec<Nexthop>,
    #[prost(enumeration = "RouteType", tag = "8")]
    pub route_type: i32,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct DeleteRoute {
    #[prost(uint32, tag = "1")]
    pub vrf_id: u32,
    #[prost(enumeration = "qpb::AddressFamily", tag = "2")]
    pub address_family: i32,
    #[prost(uint32, tag = "3")]
    pub sub_address_family: u32,
    #[prost(message, optional, tag = "4")]
    pub key: Option<RouteKey>,
}

#[derive(Clone, PartialEq, prost::Message)]
pub struct Message {
    #[prost(enumeration = "MessageType", tag = "1")]
    pub r#type: i32,
    #[prost(message, optional, tag = "2")]
    pub add_route: Option<AddRoute>,
    #[prost(message, optional, tag = "3")]
    pub delete_route: Option<DeleteRoute>,
}

fn family(value: i32) -> Result<Family> {
    match qpb::AddressFamily::try_from(value) {
        Ok(qpb::AddressFamily::Ipv4) => Ok(Family::V4),
        Ok(qpb::AddressFamily::Ipv6) => Ok(Family::V6),
        _ => Err(AfisyncError::Fpm(format!("unknown address family {}", value))),
    }
}

fn prefix(family: Family, key: Option<&RouteKey>) -> Result<(IpAddress, u8)> {
    let prefix = key
        .and_then(|k| k.prefix.as_ref())
        .ok_or_else(|| AfisyncError::Fpm("route without key".to_string()))?;
    let len = u8::try_from(prefix.length)
        .ok()
        .filter(|len| *len <= family.max_prefix_len())
        .ok_or_else(|| AfisyncError::Fpm(format!("bad prefix length {}", prefix.length)))?;

    // Prefix bytes may be truncated to the significant octets
    let mut bytes = vec![0u8; family.byte_len()];
    if prefix.bytes.len() > bytes.len() {
        return Err(AfisyncError::Fpm(format!(
            "prefix of {} bytes for {}",
            prefix.bytes.len(),
            family
        )));
    }
    bytes[..prefix.bytes.len()].copy_from_slice(&prefix.bytes);
    Ok((IpAddress::from_family_bytes(family, &bytes)?, len))
}

fn next_hop_address(address: &qpb::L3Address) -> Result<Option<IpAddress>> {
    if let Some(v4) = &address.v4 {
        return Ok(Some(IpAddress::from(Ipv4Addr::from(v4.value))));
    }
    if let Some(v6) = &address.v6 {
        return IpAddress::from_family_bytes(Family::V6, &v6.bytes).map(Some);
    }
    Ok(None)
}

impl AddRoute {
    /// Builds the route from the first next hop only.
    pub fn to_route(&self) -> Result<RouteEntry> {
        let family = family(self.address_family)?;
        let (prefix, prefix_len) = prefix(family, self.key.as_ref())?;
        let mut route = RouteEntry::new(prefix, prefix_len);

        if self.route_type == RouteType::Blackhole as i32 {
            route.blackhole = true;
        } else if let Some(nexthop) = self.nexthops.first() {
            if let Some(index) = nexthop.if_id.as_ref().and_then(|id| id.index) {
                route.next_hop_ifindex = u32::try_from(index).unwrap_or(0);
            }
            if let Some(address) = &nexthop.address {
                route.next_hop = next_hop_address(address)?;
            }
        }
        Ok(route)
    }
}

impl DeleteRoute {
    pub fn to_route(&self) -> Result<RouteEntry> {
        let family = family(self.address_family)?;
        let (prefix, prefix_len) = prefix(family, self.key.as_ref())?;
        Ok(RouteEntry::new(prefix, prefix_len))
    }
}

/// Decodes one protobuf payload into an event. Messages with neither an add
/// nor a delete yield `None`.
pub fn decode_message(payload: &[u8]) -> Result<Option<SyncEvent>> {
    let msg = <Message as prost::Message>::decode(payload)
        .map_err(|e| AfisyncError::Fpm(format!("protobuf decode: {}", e)))?;

    if let Some(add) = &msg.add_route {
        return add.to_route().map(|r| Some(SyncEvent::RouteAdd(r)));
    }
    if let Some(del) = &msg.delete_route {
        return del.to_route().map(|r| Some(SyncEvent::RouteDelete(r)));
    }
    Ok(None)
}
