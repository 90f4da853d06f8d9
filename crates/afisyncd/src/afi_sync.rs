//! AfiSync - reconciliation of kernel routes and neighbors into the sandbox
//!
//! The engine owns the authoritative record of what the forwarding plane
//! holds. Routes resolve to one of three targets: the discard node
//! (blackhole), the punt port (no gateway) or the encapsulation node of the
//! gateway's neighbor entry. A route whose gateway is not yet resolved stays
//! in the table without forwarding state and is installed as soon as the
//! neighbor shows up.

use crate::error::{AfisyncError, Result};
use crate::event::SyncEvent;
use crate::forwarding::{
    DomainHandle, FieldValue, ForwardingPlane, Fragment, GraphNode, InsertHandle, NodeKind, Token,
};
use crate::interface::{InterfacePort, InterfaceRegistry};
use crate::neighbor::NeighborEntry;
use crate::route::{RouteEntry, RouteKey};
use crate::tokens::{TokenKind, TokenRegistry};
use crate::types::IpAddress;
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::sync::Arc;
use tracing::{debug, info, instrument, warn};

/// Name of the extra sandbox port that delivers packets to the host.
pub const PUNT_PORT_NAME: &str = "punt";

/// Lookup field of the route table node.
const ROUTE_TABLE_FIELD: &str = "packet.lookupkey";

/// Next-hop ids are handed out from here, first id is one above.
const NEXT_HOP_ID_BASE: u32 = 100;

/// What an event did to the tables.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Rejected by policy, nothing changed
    Filtered,
    /// Identical to the stored entry
    Unchanged,
    /// Forwarding state written
    Installed,
    /// Stored, waiting for the next hop to resolve
    Pending,
    /// Entry and its forwarding state removed
    Removed,
    /// Delete for an entry that is not present
    Absent,
}

/// Event counters, reported by `dump()`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SyncCounters {
    pub route_adds: u64,
    pub route_updates: u64,
    pub route_deletes: u64,
    pub routes_filtered: u64,
    pub routes_pending: u64,
    pub neighbor_adds: u64,
    pub neighbor_updates: u64,
    pub neighbor_deletes: u64,
    pub neighbors_filtered: u64,
    pub plane_errors: u64,
}

impl fmt::Display for SyncCounters {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "routes add={} update={} delete={} filtered={} pending={}; \
             neighbors add={} update={} delete={} filtered={}; plane_errors={}",
            self.route_adds,
            self.route_updates,
            self.route_deletes,
            self.routes_filtered,
            self.routes_pending,
            self.neighbor_adds,
            self.neighbor_updates,
            self.neighbor_deletes,
            self.neighbors_filtered,
            self.plane_errors
        )
    }
}

#[derive(Debug, Clone, Copy)]
struct InstalledRoute {
    handle: InsertHandle,
    root: Token,
    target: Token,
}

#[derive(Debug)]
struct RouteSlot {
    route: RouteEntry,
    installed: Option<InstalledRoute>,
}

#[derive(Debug, Clone, Copy)]
struct InstalledNeighbor {
    handle: InsertHandle,
    encap_token: Token,
    next_hop_id: u32,
}

#[derive(Debug)]
struct NeighborSlot {
    neighbor: NeighborEntry,
    installed: InstalledNeighbor,
}

/// Process-wide graph nodes created by `setup()`.
#[derive(Debug, Clone, Copy)]
struct Sandbox {
    domain: DomainHandle,
    route_table: Token,
    punt: Token,
    discard: Token,
}

/// The reconciliation engine.
///
/// Not shared: a single task owns it and feeds it events in arrival order.
pub struct AfiSync {
    plane: Arc<dyn ForwardingPlane>,
    interfaces: Arc<InterfaceRegistry>,
    tokens: Arc<RwLock<TokenRegistry>>,
    sandbox_name: String,
    num_ports: u16,
    sandbox: Option<Sandbox>,
    port_tokens: BTreeMap<u16, Token>,
    route_table: BTreeMap<RouteKey, RouteSlot>,
    neighbor_table: BTreeMap<IpAddress, NeighborSlot>,
    next_hop_id: u32,
    counters: SyncCounters,
}

impl AfiSync {
    pub fn new(
        plane: Arc<dyn ForwardingPlane>,
        interfaces: Arc<InterfaceRegistry>,
        sandbox_name: impl Into<String>,
        num_ports: u16,
    ) -> Self {
        Self {
            plane,
            interfaces,
            tokens: Arc::new(RwLock::new(TokenRegistry::new())),
            sandbox_name: sandbox_name.into(),
            num_ports,
            sandbox: None,
            port_tokens: BTreeMap::new(),
            route_table: BTreeMap::new(),
            neighbor_table: BTreeMap::new(),
            next_hop_id: NEXT_HOP_ID_BASE,
            counters: SyncCounters::default(),
        }
    }

    /// Allocates the sandbox and builds the static part of the graph:
    /// punt port, discard node, route table and the per-port wiring.
    #[instrument(skip(self), fields(sandbox = %self.sandbox_name))]
    pub async fn setup(&mut self) -> Result<()> {
        // One extra port for the punt path
        let total_ports = self.num_ports.checked_add(1).ok_or_else(|| {
            AfisyncError::Config(format!("num-ports {} leaves no room for punt", self.num_ports))
        })?;
        let domain = self
            .plane
            .allocate_domain(&self.sandbox_name, total_ports)
            .await?;

        let punt = self
            .plane
            .resolve_output_port_by_name(domain, PUNT_PORT_NAME)
            .await?;
        self.tokens
            .write()
            .register(punt, TokenKind::Punt, PUNT_PORT_NAME, None);

        let discard = self
            .plane
            .insert_fragment(
                domain,
                Fragment::single(GraphNode::new("discard", NodeKind::Discard)),
            )
            .await?
            .root;
        self.tokens
            .write()
            .register(discard, TokenKind::Discard, "discard", None);

        let table = GraphNode::new(
            "route-table",
            NodeKind::Tree {
                field: ROUTE_TABLE_FIELD.to_string(),
                default: punt,
            },
        )
        .param("rt.app", "NH")
        .param("rt.nhType", "route")
        .param("rt.skipBits", 16i64);
        let route_table = self
            .plane
            .insert_fragment(domain, Fragment::single(table))
            .await?
            .root;
        self.tokens
            .write()
            .register(route_table, TokenKind::RouteTable, "route-table", Some(punt));

        self.sandbox = Some(Sandbox {
            domain,
            route_table,
            punt,
            discard,
        });

        let interfaces = Arc::clone(&self.interfaces);
        for port in interfaces.ports() {
            self.setup_interface(port).await?;
        }

        info!(
            ports = self.port_tokens.len(),
            %punt,
            %discard,
            %route_table,
            "Sandbox ready"
        );
        Ok(())
    }

    /// Resolves a port's output node and feeds its input into the route
    /// table.
    pub async fn setup_interface(&mut self, port: &InterfacePort) -> Result<()> {
        let sandbox = self.sandbox()?;
        let output = self
            .plane
            .resolve_output_port(sandbox.domain, port.port_index)
            .await?;
        self.tokens.write().register(
            output,
            TokenKind::OutputPort,
            format!("port {} ({})", port.port_index, port.name),
            None,
        );
        self.plane
            .set_input_port(sandbox.domain, port.port_index, sandbox.route_table)
            .await?;
        self.port_tokens.insert(port.port_index, output);
        debug!(port = port.port_index, interface = %port.name, %output, "Port wired");
        Ok(())
    }

    /// Dispatches an event to the matching handler.
    pub async fn apply(&mut self, event: SyncEvent) -> Result<Outcome> {
        match event {
            SyncEvent::RouteAdd(route) => self.on_route_add(route).await,
            SyncEvent::RouteDelete(route) => self.on_route_delete(route).await,
            SyncEvent::NeighborAdd(neighbor) => self.on_neighbor_add(neighbor).await,
            SyncEvent::NeighborDelete(neighbor) => self.on_neighbor_delete(neighbor).await,
        }
    }

    /// Returns true if the route may be programmed.
    pub fn filter_route(&self, route: &RouteEntry) -> bool {
        if !Self::prefix_allowed(route) {
            return false;
        }
        if route.blackhole {
            return true;
        }
        self.interfaces
            .lookup_by_ifindex(route.next_hop_ifindex)
            .is_some()
    }

    /// Prefix policy alone. Deletes only need this much: the key lookup
    /// decides whether anything is left to remove.
    fn prefix_allowed(route: &RouteEntry) -> bool {
        !route.prefix.is_special() && !(route.prefix.is_ipv6() && route.prefix.is_link_local())
    }

    /// Returns true if the neighbor may be programmed.
    pub fn filter_neighbor(&self, neighbor: &NeighborEntry) -> bool {
        !neighbor.ip.is_special() && self.interfaces.lookup_by_ifindex(neighbor.ifindex).is_some()
    }

    #[instrument(skip(self), fields(prefix = %route.key()))]
    pub async fn on_route_add(&mut self, route: RouteEntry) -> Result<Outcome> {
        let key = route.key();
        if !self.filter_route(&route) {
            self.counters.routes_filtered += 1;
            let Some(slot) = self.route_table.remove(&key) else {
                debug!(interface = route.next_hop_ifindex, "Route filtered");
                return Ok(Outcome::Filtered);
            };
            // The destination is no longer reachable through a local port
            info!(
                old = %slot.route,
                interface = route.next_hop_ifindex,
                "Route no longer eligible, removing"
            );
            self.counters.route_deletes += 1;
            if let Some(installed) = slot.installed {
                self.uninstall_route(key, installed).await?;
            }
            return Ok(Outcome::Removed);
        }

        let previous = match self.route_table.get_mut(&key) {
            Some(slot) if slot.route == route => {
                debug!("Route unchanged");
                return Ok(Outcome::Unchanged);
            }
            Some(slot) => {
                info!(old = %slot.route, new = %route, "Route update");
                self.counters.route_updates += 1;
                slot.route = route;
                slot.installed.take()
            }
            None => {
                info!(route = %route, "Route add");
                self.counters.route_adds += 1;
                self.route_table.insert(
                    key,
                    RouteSlot {
                        route,
                        installed: None,
                    },
                );
                None
            }
        };

        // Proceed with the new state even if the old fragment lingers
        let removal = match previous {
            Some(installed) => self.uninstall_route(key, installed).await,
            None => Ok(()),
        };

        match self.install_route(key).await {
            Ok(outcome) => removal.map(|()| outcome),
            Err(e) => {
                // Forget the route so that the next announcement retries
                self.route_table.remove(&key);
                Err(e)
            }
        }
    }

    #[instrument(skip(self), fields(prefix = %route.key()))]
    pub async fn on_route_delete(&mut self, route: RouteEntry) -> Result<Outcome> {
        if !Self::prefix_allowed(&route) {
            debug!("Route delete filtered");
            return Ok(Outcome::Filtered);
        }

        let key = route.key();
        let Some(slot) = self.route_table.remove(&key) else {
            debug!("Route delete for unknown prefix");
            return Ok(Outcome::Absent);
        };

        info!(route = %slot.route, "Route delete");
        self.counters.route_deletes += 1;
        if let Some(installed) = slot.installed {
            self.uninstall_route(key, installed).await?;
        }
        Ok(Outcome::Removed)
    }

    #[instrument(skip(self), fields(neighbor = %neighbor.ip))]
    pub async fn on_neighbor_add(&mut self, neighbor: NeighborEntry) -> Result<Outcome> {
        if !self.filter_neighbor(&neighbor) {
            self.counters.neighbors_filtered += 1;
            debug!(interface = neighbor.ifindex, "Neighbor filtered");
            return Ok(Outcome::Filtered);
        }

        if let Some(slot) = self.neighbor_table.get(&neighbor.ip) {
            if slot.neighbor == neighbor {
                debug!("Neighbor unchanged");
                return Ok(Outcome::Unchanged);
            }
        }

        let sandbox = self.sandbox()?;
        let port = self
            .interfaces
            .lookup_by_ifindex(neighbor.ifindex)
            .cloned()
            .ok_or_else(|| AfisyncError::InterfaceNotFound(neighbor.ifindex.to_string()))?;
        let output = *self
            .port_tokens
            .get(&port.port_index)
            .ok_or_else(|| AfisyncError::InterfaceNotFound(port.name.clone()))?;

        let next_hop_id = self.allocate_next_hop_id();
        let encap = GraphNode::new(
            format!("neighbor {}", neighbor.ip),
            NodeKind::Encap {
                encap_type: "ether".to_string(),
                keys: vec![
                    FieldValue::exact("packet.ether.saddr", port.mac.as_bytes().to_vec()),
                    FieldValue::exact("packet.ether.daddr", neighbor.mac.as_bytes().to_vec()),
                ],
            },
        )
        .param("meta.nhid", next_hop_id)
        .next(output);

        let inserted = match self
            .plane
            .insert_fragment(sandbox.domain, Fragment::single(encap))
            .await
        {
            Ok(inserted) => inserted,
            Err(e) => {
                self.counters.plane_errors += 1;
                warn!(interface = %port.name, error = %e, "Neighbor install failed");
                return Err(e);
            }
        };
        self.tokens.write().register(
            inserted.root,
            TokenKind::NeighborEncap,
            neighbor.to_string(),
            Some(output),
        );

        let previous = self.neighbor_table.insert(
            neighbor.ip,
            NeighborSlot {
                neighbor,
                installed: InstalledNeighbor {
                    handle: inserted.handle,
                    encap_token: inserted.root,
                    next_hop_id,
                },
            },
        );
        match &previous {
            Some(old) => {
                self.counters.neighbor_updates += 1;
                info!(
                    old_mac = %old.neighbor.mac,
                    mac = %neighbor.mac,
                    interface = %port.name,
                    encap = %inserted.root,
                    "Neighbor update"
                );
            }
            None => {
                self.counters.neighbor_adds += 1;
                info!(
                    mac = %neighbor.mac,
                    interface = %port.name,
                    encap = %inserted.root,
                    next_hop_id,
                    "Neighbor add"
                );
            }
        }

        // Move dependents onto the new node before the old one goes away
        let dependents = self.reinstall_dependents(neighbor.ip).await;
        let removal = match previous {
            Some(old) => self.uninstall_neighbor(old.neighbor.ip, old.installed).await,
            None => Ok(()),
        };
        dependents?;
        removal?;
        Ok(Outcome::Installed)
    }

    #[instrument(skip(self), fields(neighbor = %neighbor.ip))]
    pub async fn on_neighbor_delete(&mut self, neighbor: NeighborEntry) -> Result<Outcome> {
        if !self.filter_neighbor(&neighbor) {
            debug!(interface = neighbor.ifindex, "Neighbor delete filtered");
            return Ok(Outcome::Filtered);
        }

        let Some(slot) = self.neighbor_table.remove(&neighbor.ip) else {
            debug!("Neighbor delete for unknown address");
            return Ok(Outcome::Absent);
        };

        info!(mac = %slot.neighbor.mac, "Neighbor delete");
        self.counters.neighbor_deletes += 1;

        let mut first_error = None;
        for key in self.dependent_routes(&neighbor.ip) {
            let installed = self
                .route_table
                .get_mut(&key)
                .and_then(|slot| slot.installed.take());
            if let Some(installed) = installed {
                debug!(prefix = %key, "Route withdrawn, next hop gone");
                if let Err(e) = self.uninstall_route(key, installed).await {
                    first_error.get_or_insert(e);
                }
            }
        }

        if let Err(e) = self.uninstall_neighbor(neighbor.ip, slot.installed).await {
            first_error.get_or_insert(e);
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(Outcome::Removed),
        }
    }

    /// Human readable snapshot of the tables, tokens and counters.
    pub fn dump(&self) -> String {
        let mut out = String::new();
        let _ = writeln!(out, "sandbox {} ({} ports + punt)", self.sandbox_name, self.num_ports);
        if let Some(sandbox) = &self.sandbox {
            let _ = writeln!(
                out,
                "  route-table {} punt {} discard {}",
                sandbox.route_table, sandbox.punt, sandbox.discard
            );
        }

        let _ = writeln!(out, "routes ({}):", self.route_table.len());
        for slot in self.route_table.values() {
            match &slot.installed {
                Some(inst) => {
                    let _ = writeln!(
                        out,
                        "  {} -> {} [{} {}]",
                        slot.route, inst.target, inst.handle, inst.root
                    );
                }
                None => {
                    let _ = writeln!(out, "  {} [pending]", slot.route);
                }
            }
        }

        let _ = writeln!(out, "neighbors ({}):", self.neighbor_table.len());
        for slot in self.neighbor_table.values() {
            let _ = writeln!(
                out,
                "  {} encap {} nhid {} [{}]",
                slot.neighbor,
                slot.installed.encap_token,
                slot.installed.next_hop_id,
                slot.installed.handle
            );
        }

        let tokens = self.tokens.read();
        let _ = writeln!(out, "tokens ({}):", tokens.len());
        for line in tokens.lines() {
            let _ = writeln!(out, "  {}", line);
        }

        let _ = writeln!(out, "counters: {}", self.counters);
        out
    }

    pub fn counters(&self) -> SyncCounters {
        self.counters
    }

    /// Shared handle on the token side table.
    pub fn tokens(&self) -> Arc<RwLock<TokenRegistry>> {
        Arc::clone(&self.tokens)
    }

    pub fn route(&self, key: &RouteKey) -> Option<&RouteEntry> {
        self.route_table.get(key).map(|slot| &slot.route)
    }

    /// Forwarding target of an installed route.
    pub fn route_target(&self, key: &RouteKey) -> Option<Token> {
        self.route_table
            .get(key)
            .and_then(|slot| slot.installed)
            .map(|inst| inst.target)
    }

    /// Returns true if the route is stored but has no forwarding state.
    pub fn is_route_pending(&self, key: &RouteKey) -> bool {
        self.route_table
            .get(key)
            .is_some_and(|slot| slot.installed.is_none())
    }

    pub fn route_count(&self) -> usize {
        self.route_table.len()
    }

    pub fn installed_route_count(&self) -> usize {
        self.route_table
            .values()
            .filter(|slot| slot.installed.is_some())
            .count()
    }

    pub fn neighbor(&self, ip: &IpAddress) -> Option<&NeighborEntry> {
        self.neighbor_table.get(ip).map(|slot| &slot.neighbor)
    }

    pub fn neighbor_encap(&self, ip: &IpAddress) -> Option<Token> {
        self.neighbor_table
            .get(ip)
            .map(|slot| slot.installed.encap_token)
    }

    pub fn neighbor_count(&self) -> usize {
        self.neighbor_table.len()
    }

    pub fn punt_token(&self) -> Option<Token> {
        self.sandbox.map(|s| s.punt)
    }

    pub fn discard_token(&self) -> Option<Token> {
        self.sandbox.map(|s| s.discard)
    }

    pub fn route_table_token(&self) -> Option<Token> {
        self.sandbox.map(|s| s.route_table)
    }

    pub fn port_token(&self, port_index: u16) -> Option<Token> {
        self.port_tokens.get(&port_index).copied()
    }

    fn sandbox(&self) -> Result<Sandbox> {
        self.sandbox
            .ok_or_else(|| AfisyncError::ForwardingPlane("sandbox not set up".to_string()))
    }

    fn allocate_next_hop_id(&mut self) -> u32 {
        self.next_hop_id += 1;
        self.next_hop_id
    }

    fn dependent_routes(&self, ip: &IpAddress) -> Vec<RouteKey> {
        self.route_table
            .iter()
            .filter(|(_, slot)| slot.route.depends_on(ip))
            .map(|(key, _)| *key)
            .collect()
    }

    fn resolve_target(&self, sandbox: &Sandbox, route: &RouteEntry) -> Result<Token> {
        if route.blackhole {
            return Ok(sandbox.discard);
        }
        match route.resolved_next_hop() {
            None => Ok(sandbox.punt),
            Some(next_hop) => self
                .neighbor_table
                .get(&next_hop)
                .map(|slot| slot.installed.encap_token)
                .ok_or(AfisyncError::NextHopUnresolved(next_hop)),
        }
    }

    /// Writes forwarding state for a stored route that has none. Leaves the
    /// slot untouched on failure.
    async fn install_route(&mut self, key: RouteKey) -> Result<Outcome> {
        let sandbox = self.sandbox()?;
        let Some(route) = self.route_table.get(&key).map(|slot| slot.route.clone()) else {
            return Ok(Outcome::Absent);
        };

        let target = match self.resolve_target(&sandbox, &route) {
            Ok(target) => target,
            Err(e) if e.is_pending() => {
                self.counters.routes_pending += 1;
                info!(prefix = %key, error = %e, "Route pending");
                return Ok(Outcome::Pending);
            }
            Err(e) => return Err(e),
        };

        let (field, value) = route.match_key();
        let entry = GraphNode::new(
            format!("route {}", key),
            NodeKind::Entry {
                parent: sandbox.route_table,
                key: FieldValue::prefix(field, value, route.prefix_len),
            },
        )
        .param("route.string", route.to_string())
        .param("route.hwFlush", 0i64)
        .next(target);

        let inserted = match self
            .plane
            .insert_fragment(sandbox.domain, Fragment::single(entry))
            .await
        {
            Ok(inserted) => inserted,
            Err(e) => {
                self.counters.plane_errors += 1;
                warn!(
                    prefix = %key,
                    interface = route.next_hop_ifindex,
                    error = %e,
                    "Route install failed"
                );
                return Err(e);
            }
        };

        self.tokens.write().register(
            inserted.root,
            TokenKind::RouteEntry,
            route.to_string(),
            Some(target),
        );
        if let Some(slot) = self.route_table.get_mut(&key) {
            slot.installed = Some(InstalledRoute {
                handle: inserted.handle,
                root: inserted.root,
                target,
            });
        }
        info!(prefix = %key, %target, handle = %inserted.handle, "Route installed");
        Ok(Outcome::Installed)
    }

    /// Removes a route fragment. A handle the plane no longer knows is
    /// logged and treated as removed.
    async fn uninstall_route(&mut self, key: RouteKey, installed: InstalledRoute) -> Result<()> {
        self.tokens.write().unregister(installed.root);
        let sandbox = self.sandbox()?;
        match self
            .plane
            .remove_fragment(sandbox.domain, installed.handle)
            .await
        {
            Ok(()) => {
                info!(prefix = %key, handle = %installed.handle, "Route uninstalled");
                Ok(())
            }
            Err(AfisyncError::FragmentNotFound(handle)) => {
                warn!(prefix = %key, handle, "Route fragment already gone");
                Ok(())
            }
            Err(e) => {
                self.counters.plane_errors += 1;
                warn!(prefix = %key, error = %e, "Route uninstall failed");
                Err(e)
            }
        }
    }

    async fn uninstall_neighbor(
        &mut self,
        ip: IpAddress,
        installed: InstalledNeighbor,
    ) -> Result<()> {
        self.tokens.write().unregister(installed.encap_token);
        let sandbox = self.sandbox()?;
        match self
            .plane
            .remove_fragment(sandbox.domain, installed.handle)
            .await
        {
            Ok(()) => {
                info!(neighbor = %ip, encap = %installed.encap_token, "Neighbor uninstalled");
                Ok(())
            }
            Err(AfisyncError::FragmentNotFound(handle)) => {
                warn!(neighbor = %ip, handle, "Neighbor fragment already gone");
                Ok(())
            }
            Err(e) => {
                self.counters.plane_errors += 1;
                warn!(neighbor = %ip, error = %e, "Neighbor uninstall failed");
                Err(e)
            }
        }
    }

    /// Re-points every route whose gateway is `ip` at the neighbor's current
    /// encapsulation node. Routes that fail to install stay pending.
    async fn reinstall_dependents(&mut self, ip: IpAddress) -> Result<usize> {
        let mut first_error = None;
        let mut installed = 0;

        for key in self.dependent_routes(&ip) {
            let previous = self
                .route_table
                .get_mut(&key)
                .and_then(|slot| slot.installed.take());
            if let Some(previous) = previous {
                if let Err(e) = self.uninstall_route(key, previous).await {
                    first_error.get_or_insert(e);
                }
            }
            match self.install_route(key).await {
                Ok(Outcome::Installed) => installed += 1,
                Ok(_) => {}
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }

        if installed > 0 {
            info!(neighbor = %ip, routes = installed, "Dependent routes reinstalled");
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(installed),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{MemoryForwardingPlane, ParamValue, PlaneCall};
    use crate::types::MacAddress;
    use pretty_assertions::assert_eq;

    const PORT0_IFINDEX: u32 = 10;
    const PORT1_IFINDEX: u32 = 11;

    fn ip(s: &str) -> IpAddress {
        s.parse().unwrap()
    }

    fn mac(s: &str) -> MacAddress {
        s.parse().unwrap()
    }

    fn registry() -> InterfaceRegistry {
        let mut registry = InterfaceRegistry::new();
        for (ifindex, port_index) in [(PORT0_IFINDEX, 0), (PORT1_IFINDEX, 1)] {
            registry
                .register(InterfacePort {
                    ifindex,
                    port_index,
                    name: format!("eth{}", port_index + 1),
                    tap: format!("tap{}", port_index),
                    mac: MacAddress::new([0x02, 0, 0, 0, 0, port_index as u8 + 1]),
                })
                .unwrap();
        }
        registry
    }

    async fn engine() -> (AfiSync, Arc<MemoryForwardingPlane>) {
        let plane = Arc::new(MemoryForwardingPlane::new());
        let mut sync = AfiSync::new(plane.clone(), Arc::new(registry()), "green", 2);
        sync.setup().await.unwrap();
        plane.take_calls();
        (sync, plane)
    }

    fn route_via(prefix: &str, len: u8, gw: &str) -> RouteEntry {
        RouteEntry::new(ip(prefix), len).via(ip(gw), PORT0_IFINDEX)
    }

    fn neighbor(addr: &str, lladdr: &str) -> NeighborEntry {
        NeighborEntry::new(ip(addr), mac(lladdr), PORT0_IFINDEX)
    }

    fn removed_handles(calls: &[PlaneCall]) -> Vec<InsertHandle> {
        calls
            .iter()
            .filter_map(|c| match c {
                PlaneCall::Remove { handle } => Some(*handle),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_setup_builds_static_graph() {
        let plane = Arc::new(MemoryForwardingPlane::new());
        let mut sync = AfiSync::new(plane.clone(), Arc::new(registry()), "green", 2);
        sync.setup().await.unwrap();

        let calls = plane.calls();
        assert_eq!(
            calls[0],
            PlaneCall::AllocateDomain {
                name: "green".to_string(),
                num_ports: 3
            }
        );
        assert_eq!(
            calls[1],
            PlaneCall::ResolveOutputPortByName {
                name: "punt".to_string()
            }
        );

        let PlaneCall::Insert { fragment, .. } = &calls[2] else {
            panic!("expected discard insert, got {:?}", calls[2]);
        };
        assert_eq!(fragment.nodes[0].kind, NodeKind::Discard);

        let PlaneCall::Insert { fragment, root, .. } = &calls[3] else {
            panic!("expected route table insert, got {:?}", calls[3]);
        };
        let table = &fragment.nodes[0];
        assert_eq!(
            table.kind,
            NodeKind::Tree {
                field: "packet.lookupkey".to_string(),
                default: sync.punt_token().unwrap(),
            }
        );
        assert_eq!(table.params["rt.app"], ParamValue::Str("NH".to_string()));
        assert_eq!(table.params["rt.nhType"], ParamValue::Str("route".to_string()));
        assert_eq!(table.params["rt.skipBits"], ParamValue::Int(16));
        assert_eq!(Some(*root), sync.route_table_token());

        for port in 0..2u16 {
            assert_eq!(plane.input_port(port), sync.route_table_token());
            assert!(sync.port_token(port).is_some());
        }

        let tokens = sync.tokens();
        let tokens = tokens.read();
        assert_eq!(tokens.count(TokenKind::OutputPort), 2);
        assert_eq!(tokens.count(TokenKind::Punt), 1);
        assert_eq!(tokens.count(TokenKind::Discard), 1);
        assert_eq!(tokens.count(TokenKind::RouteTable), 1);
    }

    #[tokio::test]
    async fn test_setup_refused_is_fatal() {
        let plane = Arc::new(MemoryForwardingPlane::new());
        plane.refuse_domain();
        let mut sync = AfiSync::new(plane, Arc::new(registry()), "green", 2);
        assert!(sync.setup().await.is_err());
        assert!(sync.punt_token().is_none());
    }

    #[tokio::test]
    async fn test_events_before_setup_fail() {
        let plane = Arc::new(MemoryForwardingPlane::new());
        let mut sync = AfiSync::new(plane, Arc::new(registry()), "green", 2);
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        assert!(sync.on_route_add(route).await.is_err());
        assert_eq!(sync.route_count(), 0);
    }

    #[tokio::test]
    async fn test_connected_route_targets_punt() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        let key = route.key();

        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Installed);
        assert_eq!(sync.route_target(&key), sync.punt_token());

        let calls = plane.calls();
        assert_eq!(calls.len(), 1);
        let PlaneCall::Insert { fragment, .. } = &calls[0] else {
            panic!("expected insert");
        };
        let node = &fragment.nodes[0];
        assert_eq!(
            node.kind,
            NodeKind::Entry {
                parent: sync.route_table_token().unwrap(),
                key: FieldValue::prefix("packet.ip4.daddr", vec![10, 0, 0, 0], 24),
            }
        );
        assert_eq!(node.next, sync.punt_token());
        assert_eq!(node.params["route.hwFlush"], ParamValue::Int(0));
        assert_eq!(
            node.params["route.string"],
            ParamValue::Str("10.0.0.0/24 dev 10".to_string())
        );
    }

    #[tokio::test]
    async fn test_ipv6_route_uses_16_byte_key() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("2001:db8::"), 32).dev(PORT1_IFINDEX);
        sync.on_route_add(route).await.unwrap();

        let PlaneCall::Insert { fragment, .. } = &plane.calls()[0] else {
            panic!("expected insert");
        };
        let NodeKind::Entry { key, .. } = &fragment.nodes[0].kind else {
            panic!("expected entry node");
        };
        assert_eq!(key.field, "packet.ipv6.daddr");
        assert_eq!(key.value.len(), 16);
        assert_eq!(key.prefix_len, Some(32));
    }

    #[tokio::test]
    async fn test_route_add_is_idempotent() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);

        sync.on_route_add(route.clone()).await.unwrap();
        let after_first = plane.calls().len();
        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Unchanged);
        assert_eq!(plane.calls().len(), after_first);
        assert_eq!(sync.route_count(), 1);
    }

    #[tokio::test]
    async fn test_route_update_replaces_slot() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();

        let first = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        let key = first.key();
        sync.on_route_add(first).await.unwrap();
        plane.take_calls();

        let second = route_via("10.0.0.0", 24, "192.168.1.1");
        assert_eq!(sync.on_route_add(second.clone()).await.unwrap(), Outcome::Installed);

        let calls = plane.calls();
        assert!(matches!(calls[0], PlaneCall::Remove { .. }));
        assert!(matches!(calls[1], PlaneCall::Insert { .. }));
        assert_eq!(sync.route_count(), 1);
        assert_eq!(sync.route(&key), Some(&second));
        assert_eq!(
            sync.route_target(&key),
            sync.neighbor_encap(&ip("192.168.1.1"))
        );
        assert_eq!(sync.counters().route_updates, 1);
    }

    #[tokio::test]
    async fn test_special_prefixes_are_filtered() {
        let (mut sync, plane) = engine().await;
        for prefix in ["127.0.0.0", "224.0.0.0", "169.254.0.0", "fe80::", "ff02::"] {
            let route = RouteEntry::new(ip(prefix), 8).dev(PORT0_IFINDEX);
            assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Filtered);
        }
        assert!(plane.calls().is_empty());
        assert_eq!(sync.route_count(), 0);
        assert_eq!(sync.counters().routes_filtered, 5);
    }

    #[tokio::test]
    async fn test_unknown_interface_is_filtered() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(99);
        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Filtered);

        let n = NeighborEntry::new(ip("192.168.1.1"), mac("00:11:22:33:44:55"), 99);
        assert_eq!(sync.on_neighbor_add(n).await.unwrap(), Outcome::Filtered);
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_blackhole_bypasses_interface_check() {
        let (mut sync, _plane) = engine().await;
        let route = RouteEntry::new(ip("10.9.0.0"), 16).dev(99).blackhole();
        let key = route.key();

        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Installed);
        assert_eq!(sync.route_target(&key), sync.discard_token());
    }

    #[tokio::test]
    async fn test_default_route_is_installable() {
        let (mut sync, _plane) = engine().await;
        let route = RouteEntry::new(ip("0.0.0.0"), 0).dev(PORT0_IFINDEX);
        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Installed);
    }

    #[tokio::test]
    async fn test_route_waits_for_neighbor() {
        let (mut sync, plane) = engine().await;
        let route = route_via("10.0.0.0", 24, "192.168.1.1");
        let key = route.key();

        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Pending);
        assert!(sync.is_route_pending(&key));
        assert!(plane.calls().is_empty());

        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        assert!(!sync.is_route_pending(&key));
        assert_eq!(
            sync.route_target(&key),
            sync.neighbor_encap(&ip("192.168.1.1"))
        );
    }

    #[tokio::test]
    async fn test_neighbor_encap_fragment() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();

        let PlaneCall::Insert { fragment, .. } = &plane.calls()[0] else {
            panic!("expected insert");
        };
        let node = &fragment.nodes[0];
        assert_eq!(
            node.kind,
            NodeKind::Encap {
                encap_type: "ether".to_string(),
                keys: vec![
                    FieldValue::exact("packet.ether.saddr", vec![0x02, 0, 0, 0, 0, 1]),
                    FieldValue::exact("packet.ether.daddr", vec![0, 0x11, 0x22, 0x33, 0x44, 0x55]),
                ],
            }
        );
        assert_eq!(node.params["meta.nhid"], ParamValue::Int(101));
        assert_eq!(node.next, sync.port_token(0));

        sync.on_neighbor_add(neighbor("192.168.1.2", "00:11:22:33:44:66"))
            .await
            .unwrap();
        let PlaneCall::Insert { fragment, .. } = &plane.calls()[1] else {
            panic!("expected insert");
        };
        assert_eq!(fragment.nodes[0].params["meta.nhid"], ParamValue::Int(102));
    }

    #[tokio::test]
    async fn test_neighbor_update_moves_routes() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        let old_encap = sync.neighbor_encap(&ip("192.168.1.1")).unwrap();
        sync.on_route_add(route_via("10.0.0.0", 24, "192.168.1.1"))
            .await
            .unwrap();
        sync.on_route_add(route_via("10.1.0.0", 16, "192.168.1.1"))
            .await
            .unwrap();
        plane.take_calls();

        let outcome = sync
            .on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:77"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Installed);

        let new_encap = sync.neighbor_encap(&ip("192.168.1.1")).unwrap();
        assert_ne!(old_encap, new_encap);
        assert_eq!(plane.references_to(old_encap), 0);
        assert_eq!(plane.references_to(new_encap), 2);

        // New encap first, old encap removed last
        let calls = plane.calls();
        assert!(matches!(calls.first(), Some(PlaneCall::Insert { .. })));
        assert!(matches!(calls.last(), Some(PlaneCall::Remove { .. })));
        assert_eq!(sync.counters().neighbor_updates, 1);
        assert_eq!(sync.neighbor_count(), 1);
    }

    #[tokio::test]
    async fn test_neighbor_delete_withdraws_routes_first() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        for prefix in ["10.0.0.0", "10.1.0.0", "10.2.0.0"] {
            sync.on_route_add(route_via(prefix, 16, "192.168.1.1"))
                .await
                .unwrap();
        }
        let encap = sync.neighbor_encap(&ip("192.168.1.1")).unwrap();
        let calls = plane.take_calls();
        let inserted: Vec<InsertHandle> = calls
            .iter()
            .filter_map(|c| match c {
                PlaneCall::Insert { handle, .. } => Some(*handle),
                _ => None,
            })
            .collect();
        let (neighbor_handle, route_handles) = (inserted[0], &inserted[1..]);
        assert_eq!(route_handles.len(), 3);

        let outcome = sync
            .on_neighbor_delete(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        assert_eq!(outcome, Outcome::Removed);

        // Three route entries first, then the neighbor fragment
        let calls = plane.calls();
        let handles = removed_handles(&calls);
        assert_eq!(calls.len(), 4);
        assert_eq!(handles.len(), 4);
        let mut withdrawn = handles[..3].to_vec();
        withdrawn.sort();
        let mut expected = route_handles.to_vec();
        expected.sort();
        assert_eq!(withdrawn, expected);
        assert_eq!(handles[3], neighbor_handle);
        assert_eq!(plane.references_to(encap), 0);
        assert_eq!(sync.route_count(), 3);
        assert_eq!(sync.installed_route_count(), 0);
        assert!(sync.neighbor(&ip("192.168.1.1")).is_none());
    }

    #[tokio::test]
    async fn test_route_delete() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        sync.on_route_add(route.clone()).await.unwrap();
        let live = plane.live_count();

        assert_eq!(sync.on_route_delete(route.clone()).await.unwrap(), Outcome::Removed);
        assert_eq!(plane.live_count(), live - 1);
        assert_eq!(sync.route_count(), 0);

        assert_eq!(sync.on_route_delete(route).await.unwrap(), Outcome::Absent);
    }

    #[tokio::test]
    async fn test_pending_route_delete_touches_nothing() {
        let (mut sync, plane) = engine().await;
        let route = route_via("10.0.0.0", 24, "192.168.1.1");
        sync.on_route_add(route.clone()).await.unwrap();

        assert_eq!(sync.on_route_delete(route).await.unwrap(), Outcome::Removed);
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_filtered_delete_is_noop() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("127.0.0.0"), 8).dev(PORT0_IFINDEX);
        assert_eq!(sync.on_route_delete(route).await.unwrap(), Outcome::Filtered);
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_failed_insert_is_not_recorded() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        let key = route.key();

        plane.fail_next_insert();
        assert!(sync.on_route_add(route.clone()).await.is_err());
        assert!(sync.route(&key).is_none());
        assert_eq!(sync.counters().plane_errors, 1);

        // A re-announcement retries
        assert_eq!(sync.on_route_add(route).await.unwrap(), Outcome::Installed);
    }

    #[tokio::test]
    async fn test_failed_neighbor_insert_keeps_old_state() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        let encap = sync.neighbor_encap(&ip("192.168.1.1"));

        plane.fail_next_insert();
        assert!(
            sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:77"))
                .await
                .is_err()
        );
        assert_eq!(sync.neighbor_encap(&ip("192.168.1.1")), encap);
        assert_eq!(
            sync.neighbor(&ip("192.168.1.1")).unwrap().mac,
            mac("00:11:22:33:44:55")
        );
    }

    #[tokio::test]
    async fn test_uninstall_failure_still_clears_slot() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        sync.on_route_add(route.clone()).await.unwrap();

        plane.fail_next_remove();
        assert!(sync.on_route_delete(route).await.is_err());
        assert_eq!(sync.route_count(), 0);
    }

    #[tokio::test]
    async fn test_update_reports_failed_old_removal() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT0_IFINDEX);
        sync.on_route_add(route.clone()).await.unwrap();

        plane.fail_next_remove();
        let moved = RouteEntry::new(ip("10.0.0.0"), 24).dev(PORT1_IFINDEX);
        assert!(sync.on_route_add(moved.clone()).await.is_err());

        // The new state is still in place
        assert_eq!(sync.route(&moved.key()), Some(&moved));
        assert_eq!(sync.route_target(&moved.key()), sync.punt_token());
        assert_eq!(sync.installed_route_count(), 1);
    }

    #[tokio::test]
    async fn test_neighbor_update_reports_failed_old_removal() {
        let (mut sync, plane) = engine().await;
        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();

        plane.fail_next_remove();
        assert!(
            sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:77"))
                .await
                .is_err()
        );
        assert_eq!(
            sync.neighbor(&ip("192.168.1.1")).unwrap().mac,
            mac("00:11:22:33:44:77")
        );
    }

    #[tokio::test]
    async fn test_route_moved_to_unknown_interface_is_removed() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.50.0.0"), 16).dev(PORT0_IFINDEX);
        assert_eq!(sync.on_route_add(route.clone()).await.unwrap(), Outcome::Installed);
        let live = plane.live_count();

        let moved = RouteEntry::new(ip("10.50.0.0"), 16).dev(99);
        assert_eq!(sync.on_route_add(moved.clone()).await.unwrap(), Outcome::Removed);
        assert!(sync.route(&route.key()).is_none());
        assert_eq!(plane.live_count(), live - 1);

        // Nothing left to withdraw on a second ineligible announcement
        assert_eq!(sync.on_route_add(moved).await.unwrap(), Outcome::Filtered);
    }

    #[tokio::test]
    async fn test_delete_without_interface_removes_route() {
        let (mut sync, plane) = engine().await;
        let route = RouteEntry::new(ip("10.43.0.0"), 16).dev(PORT0_IFINDEX);
        sync.on_route_add(route).await.unwrap();
        let live = plane.live_count();

        // Deletes may carry only the prefix
        let delete = RouteEntry::new(ip("10.43.0.0"), 16);
        assert_eq!(sync.on_route_delete(delete.clone()).await.unwrap(), Outcome::Removed);
        assert_eq!(sync.route_count(), 0);
        assert_eq!(plane.live_count(), live - 1);
        assert_eq!(sync.on_route_delete(delete).await.unwrap(), Outcome::Absent);
    }

    #[tokio::test]
    async fn test_setup_rejects_port_count_overflow() {
        let plane = Arc::new(MemoryForwardingPlane::new());
        let mut sync = AfiSync::new(plane.clone(), Arc::new(registry()), "green", u16::MAX);
        assert!(matches!(sync.setup().await, Err(AfisyncError::Config(_))));
        assert!(plane.calls().is_empty());
    }

    #[tokio::test]
    async fn test_apply_dispatch() {
        let (mut sync, _plane) = engine().await;
        let n = neighbor("192.168.1.1", "00:11:22:33:44:55");
        let route = route_via("10.0.0.0", 24, "192.168.1.1");

        assert_eq!(
            sync.apply(SyncEvent::RouteAdd(route.clone())).await.unwrap(),
            Outcome::Pending
        );
        assert_eq!(
            sync.apply(SyncEvent::NeighborAdd(n)).await.unwrap(),
            Outcome::Installed
        );
        assert_eq!(
            sync.apply(SyncEvent::RouteDelete(route)).await.unwrap(),
            Outcome::Removed
        );
        assert_eq!(
            sync.apply(SyncEvent::NeighborDelete(n)).await.unwrap(),
            Outcome::Removed
        );
    }

    #[tokio::test]
    async fn test_token_registry_tracks_live_nodes() {
        let (mut sync, _plane) = engine().await;
        let base = sync.tokens().read().len();

        sync.on_neighbor_add(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        let route = route_via("10.0.0.0", 24, "192.168.1.1");
        sync.on_route_add(route.clone()).await.unwrap();
        assert_eq!(sync.tokens().read().len(), base + 2);

        sync.on_route_delete(route).await.unwrap();
        sync.on_neighbor_delete(neighbor("192.168.1.1", "00:11:22:33:44:55"))
            .await
            .unwrap();
        assert_eq!(sync.tokens().read().len(), base);
    }

    #[tokio::test]
    async fn test_dump() {
        let (mut sync, _plane) = engine().await;
        sync.on_route_add(route_via("10.0.0.0", 24, "192.168.1.1"))
            .await
            .unwrap();
        sync.on_neighbor_add(neighbor("192.168.1.2", "00:11:22:33:44:55"))
            .await
            .unwrap();

        let dump = sync.dump();
        assert!(dump.contains("sandbox green (2 ports + punt)"));
        assert!(dump.contains("10.0.0.0/24 dev 10 via 192.168.1.1 [pending]"));
        assert!(dump.contains("192.168.1.2 lladdr 00:11:22:33:44:55 dev 10"));
        assert!(dump.contains("nhid 101"));
        assert!(dump.contains("routes add=1"));
    }
}
