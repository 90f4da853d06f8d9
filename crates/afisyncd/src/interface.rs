//! Kernel interface to forwarding-plane port mapping.
//!
//! Each configured port is backed by a tap device on the host. Routes and
//! neighbors learned from the kernel reference the tap's ifindex; the
//! registry turns that into the sandbox port index and the MAC address used
//! as the source of rewritten frames.

use crate::config::InterfaceConfig;
use crate::error::{AfisyncError, Result};
use crate::types::MacAddress;
use std::collections::HashMap;
use tracing::{debug, info};

/// A local interface bound to a forwarding-plane port.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfacePort {
    /// Kernel index of the tap device
    pub ifindex: u32,
    /// Forwarding-plane port index
    pub port_index: u16,
    /// Physical interface name
    pub name: String,
    /// Host tap device name
    pub tap: String,
    /// Link address of the tap device
    pub mac: MacAddress,
}

/// Lookup tables for the configured ports. Populated once at startup.
#[derive(Debug, Default)]
pub struct InterfaceRegistry {
    by_ifindex: HashMap<u32, InterfacePort>,
    by_port: HashMap<u16, u32>,
}

impl InterfaceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a port. Duplicate port indices or ifindexes are rejected.
    pub fn register(&mut self, port: InterfacePort) -> Result<()> {
        if self.by_ifindex.contains_key(&port.ifindex) {
            return Err(AfisyncError::Config(format!(
                "ifindex {} ({}) registered twice",
                port.ifindex, port.tap
            )));
        }
        if self.by_port.contains_key(&port.port_index) {
            return Err(AfisyncError::Config(format!(
                "port {} registered twice",
                port.port_index
            )));
        }

        debug!(
            ifindex = port.ifindex,
            port = port.port_index,
            tap = %port.tap,
            mac = %port.mac,
            "Registered interface"
        );
        self.by_port.insert(port.port_index, port.ifindex);
        self.by_ifindex.insert(port.ifindex, port);
        Ok(())
    }

    pub fn lookup_by_ifindex(&self, ifindex: u32) -> Option<&InterfacePort> {
        self.by_ifindex.get(&ifindex)
    }

    pub fn lookup_by_port(&self, port_index: u16) -> Option<&InterfacePort> {
        self.by_port
            .get(&port_index)
            .and_then(|ifindex| self.by_ifindex.get(ifindex))
    }

    pub fn len(&self) -> usize {
        self.by_ifindex.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_ifindex.is_empty()
    }

    /// Ports ordered by port index.
    pub fn ports(&self) -> Vec<&InterfacePort> {
        let mut ports: Vec<_> = self.by_ifindex.values().collect();
        ports.sort_by_key(|p| p.port_index);
        ports
    }

    /// Builds the registry from configuration, resolving each tap device's
    /// ifindex and link address from the host.
    pub fn from_config(interfaces: &[InterfaceConfig]) -> Result<Self> {
        let mut registry = Self::new();
        for iface in interfaces {
            let ifindex = host::ifindex(&iface.tap)?;
            let mac = host::link_address(&iface.tap)?;
            registry.register(InterfacePort {
                ifindex,
                port_index: iface.port,
                name: iface.name.clone(),
                tap: iface.tap.clone(),
                mac,
            })?;
        }
        info!(count = registry.len(), "Interface registry ready");
        Ok(registry)
    }
}

#[cfg(target_os = "linux")]
mod host {
    use crate::error::{AfisyncError, Result};
    use crate::types::MacAddress;

    pub fn ifindex(name: &str) -> Result<u32> {
        nix::net::if_::if_nametoindex(name)
            .map_err(|e| AfisyncError::InterfaceNotFound(format!("{}: {}", name, e)))
    }

    pub fn link_address(name: &str) -> Result<MacAddress> {
        let addrs = nix::ifaddrs::getifaddrs()
            .map_err(|e| AfisyncError::InterfaceNotFound(format!("{}: {}", name, e)))?;

        addrs
            .filter(|ifa| ifa.interface_name == name)
            .filter_map(|ifa| ifa.address)
            .find_map(|addr| addr.as_link_addr().and_then(|link| link.addr()))
            .map(MacAddress::new)
            .ok_or_else(|| AfisyncError::InterfaceNotFound(format!("{}: no link address", name)))
    }
}

#[cfg(not(target_os = "linux"))]
mod host {
    use crate::error::{AfisyncError, Result};
    use crate::types::MacAddress;

    pub fn ifindex(name: &str) -> Result<u32> {
        Err(AfisyncError::InterfaceNotFound(name.to_string()))
    }

    pub fn link_address(name: &str) -> Result<MacAddress> {
        Err(AfisyncError::InterfaceNotFound(name.to_string()))
    }
}
