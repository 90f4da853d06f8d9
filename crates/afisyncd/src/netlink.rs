//! Kernel subscription feed
//!
//! Opens a NETLINK_ROUTE socket, dumps the current neighbor (and optionally
//! route) tables and then streams change notifications as `SyncEvent`s.
//! The message conversion is shared with the FPM feed, which carries the
//! same route messages inside its frames.

use crate::error::Result;
use crate::event::{EngineCommand, SyncEvent};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// What to dump and subscribe to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetlinkOptions {
    /// SO_RCVBUF for the socket
    pub buffer_size: usize,
    /// Also follow routes and local addresses (false when FPM delivers routes)
    pub routes: bool,
}

/// Table requested by a startup dump.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DumpKind {
    Neighbors,
    Routes,
    Addresses,
}

impl NetlinkOptions {
    /// Dumps to run at startup, in order.
    pub fn dumps(&self) -> Vec<DumpKind> {
        if self.routes {
            vec![DumpKind::Neighbors, DumpKind::Routes, DumpKind::Addresses]
        } else {
            vec![DumpKind::Neighbors]
        }
    }
}

/// Forwards kernel notifications to the reconciliation task until the
/// socket fails or the receiver goes away.
pub async fn run(mut socket: AsyncNetlinkSocket, tx: mpsc::Sender<EngineCommand>) -> Result<()> {
    info!("Netlink feed running");
    loop {
        let events = socket.recv_events().await?;
        for event in events {
            if tx.send(EngineCommand::Event(event)).await.is_err() {
                debug!("Event channel closed, netlink feed stopping");
                return Ok(());
            }
        }
    }
}

/// Logs and drops a batch that could not be decoded.
fn log_malformed(offset: usize, len: usize, error: &dyn std::fmt::Display) {
    warn!(offset, len, error = %error, "Dropping malformed netlink message");
}

#[cfg(target_os = "linux")]
mod linux {
    use super::{DumpKind, NetlinkOptions, log_malformed};
    use crate::error::{AfisyncError, Result};
    use crate::event::SyncEvent;
    use crate::neighbor::NeighborEntry;
    use crate::route::RouteEntry;
    use crate::types::{IpAddress, MacAddress};
    use netlink_packet_core::{NLM_F_DUMP, NLM_F_REQUEST, NetlinkHeader, NetlinkMessage, NetlinkPayload};
    use netlink_packet_route::address::{AddressAttribute, AddressMessage};
    use netlink_packet_route::neighbour::{NeighbourAddress, NeighbourAttribute, NeighbourMessage};
    use netlink_packet_route::route::{
        RouteAddress, RouteAttribute, RouteHeader, RouteMessage, RouteType,
    };
    use netlink_packet_route::{AddressFamily, RouteNetlinkMessage};
    use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
    use tokio::io::unix::AsyncFd;
    use tracing::{debug, info, instrument, trace, warn};

    const RTMGRP_NEIGH: u32 = 0x4;
    const RTMGRP_IPV4_IFADDR: u32 = 0x10;
    const RTMGRP_IPV4_ROUTE: u32 = 0x40;
    const RTMGRP_IPV6_IFADDR: u32 = 0x100;
    const RTMGRP_IPV6_ROUTE: u32 = 0x400;

    /// Size of one receive buffer
    const RECV_BUFFER_LEN: usize = 65536;

    /// Outcome of decoding one receive buffer.
    #[derive(Debug, Default)]
    pub(crate) struct Batch {
        pub events: Vec<SyncEvent>,
        /// An NLMSG_DONE or error terminated a dump
        pub done: bool,
    }

    /// Decodes every netlink message in `buf`, skipping the ones that carry
    /// nothing of interest. Decoding stops at the first malformed message.
    pub fn parse_buffer(buf: &[u8]) -> Vec<SyncEvent> {
        parse_batch(buf).events
    }

    pub(crate) fn parse_batch(buf: &[u8]) -> Batch {
        let mut batch = Batch::default();
        let mut offset = 0;

        while offset < buf.len() {
            let msg = match NetlinkMessage::<RouteNetlinkMessage>::deserialize(&buf[offset..]) {
                Ok(msg) => msg,
                Err(e) => {
                    log_malformed(offset, buf.len(), &e);
                    break;
                }
            };

            let length = msg.header.length as usize;
            if length == 0 {
                break;
            }
            // Align to 4 bytes (netlink alignment requirement)
            offset = (offset + length + 3) & !3;

            match &msg.payload {
                NetlinkPayload::Done(_) => batch.done = true,
                NetlinkPayload::Error(err) => {
                    warn!(error = ?err, "Netlink error message");
                    batch.done = true;
                }
                NetlinkPayload::InnerMessage(inner) => {
                    if let Some(event) = convert_message(inner) {
                        batch.events.push(event);
                    }
                }
                _ => {}
            }
        }

        trace!(count = batch.events.len(), "Decoded netlink buffer");
        batch
    }

    /// Converts one rtnetlink message into an engine event.
    pub fn convert_message(msg: &RouteNetlinkMessage) -> Option<SyncEvent> {
        match msg {
            RouteNetlinkMessage::NewRoute(r) => route_from_message(r).map(SyncEvent::RouteAdd),
            RouteNetlinkMessage::DelRoute(r) => route_from_message(r).map(SyncEvent::RouteDelete),
            RouteNetlinkMessage::NewNeighbour(n) => neighbor_event(n, true),
            RouteNetlinkMessage::DelNeighbour(n) => neighbor_event(n, false),
            RouteNetlinkMessage::NewAddress(a) => host_route(a).map(SyncEvent::RouteAdd),
            RouteNetlinkMessage::DelAddress(a) => host_route(a).map(SyncEvent::RouteDelete),
            _ => None,
        }
    }

    fn route_address(addr: &RouteAddress) -> Option<IpAddress> {
        match addr {
            RouteAddress::Inet(v4) => Some(IpAddress::from(*v4)),
            RouteAddress::Inet6(v6) => Some(IpAddress::from(*v6)),
            _ => None,
        }
    }

    fn route_from_message(msg: &RouteMessage) -> Option<RouteEntry> {
        if !matches!(
            msg.header.address_family,
            AddressFamily::Inet | AddressFamily::Inet6
        ) {
            return None;
        }
        if !matches!(
            msg.header.kind,
            RouteType::Unicast | RouteType::Unspec | RouteType::BlackHole
        ) {
            trace!(kind = ?msg.header.kind, "Ignoring route type");
            return None;
        }

        let mut table = u32::from(msg.header.table);
        let mut destination = None;
        let mut gateway = None;
        let mut oif = 0;
        for attr in &msg.attributes {
            match attr {
                RouteAttribute::Destination(addr) => destination = route_address(addr),
                RouteAttribute::Gateway(addr) => gateway = route_address(addr),
                RouteAttribute::Oif(index) => oif = *index,
                RouteAttribute::Table(t) => table = *t,
                _ => {}
            }
        }

        let accepted_table = [
            RouteHeader::RT_TABLE_UNSPEC,
            RouteHeader::RT_TABLE_MAIN,
            libc::RT_TABLE_LOCAL,
        ]
        .into_iter()
        .any(|t| u32::from(t) == table);
        if !accepted_table {
            trace!(table, "Ignoring route from foreign table");
            return None;
        }

        let Some(prefix) = destination else {
            trace!("Ignoring route without destination");
            return None;
        };

        Some(RouteEntry {
            prefix,
            prefix_len: msg.header.destination_prefix_length,
            next_hop: gateway,
            next_hop_ifindex: oif,
            blackhole: msg.header.kind == RouteType::BlackHole,
        })
    }

    /// NEWNEIGH with a link address is an add; anything else is a delete.
    fn neighbor_event(msg: &NeighbourMessage, is_new: bool) -> Option<SyncEvent> {
        if !matches!(msg.header.family, AddressFamily::Inet | AddressFamily::Inet6) {
            return None;
        }

        let mut ip = None;
        let mut mac = None;
        for attr in &msg.attributes {
            match attr {
                NeighbourAttribute::Destination(NeighbourAddress::Inet(v4)) => {
                    ip = Some(IpAddress::from(*v4));
                }
                NeighbourAttribute::Destination(NeighbourAddress::Inet6(v6)) => {
                    ip = Some(IpAddress::from(*v6));
                }
                NeighbourAttribute::LinkLocalAddress(bytes) => {
                    mac = MacAddress::from_slice(bytes);
                }
                _ => {}
            }
        }

        let ip = ip?;
        let ifindex = msg.header.ifindex;
        match (is_new, mac) {
            (true, Some(mac)) => Some(SyncEvent::NeighborAdd(NeighborEntry::new(ip, mac, ifindex))),
            (_, mac) => Some(SyncEvent::NeighborDelete(NeighborEntry::new(
                ip,
                mac.unwrap_or(MacAddress::ZERO),
                ifindex,
            ))),
        }
    }

    /// A local address becomes a host route punted to the host.
    fn host_route(msg: &AddressMessage) -> Option<RouteEntry> {
        let mut local = None;
        let mut address = None;
        for attr in &msg.attributes {
            match attr {
                AddressAttribute::Local(ip) => local = Some(IpAddress::from(*ip)),
                AddressAttribute::Address(ip) => address = Some(IpAddress::from(*ip)),
                _ => {}
            }
        }

        let ip = local.or(address)?;
        let prefix_len = ip.family().max_prefix_len();
        Some(RouteEntry::new(ip, prefix_len).dev(msg.header.index))
    }

    /// Blocking NETLINK_ROUTE socket used for dumps.
    pub struct NetlinkSocket {
        socket: Socket,
        buffer: Vec<u8>,
        seq: u32,
    }

    impl NetlinkSocket {
        /// Creates the socket and joins the multicast groups for `options`.
        #[instrument]
        pub fn new(options: NetlinkOptions) -> Result<Self> {
            let mut socket = Socket::new(NETLINK_ROUTE)
                .map_err(|e| AfisyncError::Netlink(format!("Failed to create socket: {}", e)))?;

            let mut groups = RTMGRP_NEIGH;
            if options.routes {
                groups |= RTMGRP_IPV4_ROUTE
                    | RTMGRP_IPV6_ROUTE
                    | RTMGRP_IPV4_IFADDR
                    | RTMGRP_IPV6_IFADDR;
            }
            socket
                .bind(&SocketAddr::new(0, groups))
                .map_err(|e| AfisyncError::Netlink(format!("Failed to bind socket: {}", e)))?;
            debug!(groups = format_args!("{:#x}", groups), "Netlink socket bound");

            let nl = Self {
                socket,
                buffer: Vec::with_capacity(RECV_BUFFER_LEN),
                seq: 0,
            };
            nl.tune_socket(options.buffer_size);
            Ok(nl)
        }

        fn tune_socket(&self, buffer_size: usize) {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let size = libc::c_int::try_from(buffer_size).unwrap_or(libc::c_int::MAX);
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_SOCKET,
                    libc::SO_RCVBUF,
                    &size as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!(size = buffer_size, "Failed to set SO_RCVBUF, using default buffer size");
                } else {
                    debug!(size = buffer_size, "Set socket receive buffer");
                }

                let enable: libc::c_int = 1;
                let ret = libc::setsockopt(
                    fd,
                    libc::SOL_NETLINK,
                    libc::NETLINK_NO_ENOBUFS,
                    &enable as *const _ as *const libc::c_void,
                    std::mem::size_of::<libc::c_int>() as libc::socklen_t,
                );
                if ret < 0 {
                    warn!("Failed to set NETLINK_NO_ENOBUFS");
                }
            }
        }

        fn set_nonblocking(&self) -> Result<()> {
            let fd = self.socket.as_raw_fd();
            unsafe {
                let flags = libc::fcntl(fd, libc::F_GETFL);
                if flags < 0 {
                    return Err(AfisyncError::Netlink("Failed to get socket flags".into()));
                }
                if libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) < 0 {
                    return Err(AfisyncError::Netlink(
                        "Failed to set non-blocking mode".into(),
                    ));
                }
            }
            Ok(())
        }

        pub fn as_raw_fd(&self) -> i32 {
            self.socket.as_raw_fd()
        }

        fn send_dump_request(&mut self, payload: RouteNetlinkMessage) -> Result<()> {
            self.seq += 1;
            let mut header = NetlinkHeader::default();
            header.flags = NLM_F_REQUEST | NLM_F_DUMP;
            header.sequence_number = self.seq;

            let mut packet = NetlinkMessage::new(header, NetlinkPayload::InnerMessage(payload));
            packet.finalize();
            let mut buf = vec![0u8; packet.buffer_len()];
            packet.serialize(&mut buf);

            self.socket.send(&buf, 0).map_err(|e| {
                AfisyncError::Netlink(format!("Failed to send dump request: {}", e))
            })?;
            Ok(())
        }

        /// Dumps one table for both address families and returns the
        /// resulting events in kernel order.
        #[instrument(skip(self))]
        pub fn dump(&mut self, kind: DumpKind) -> Result<Vec<SyncEvent>> {
            let mut events = Vec::new();
            for family in [AddressFamily::Inet, AddressFamily::Inet6] {
                let payload = match kind {
                    DumpKind::Neighbors => {
                        let mut msg = NeighbourMessage::default();
                        msg.header.family = family;
                        RouteNetlinkMessage::GetNeighbour(msg)
                    }
                    DumpKind::Routes => {
                        let mut msg = RouteMessage::default();
                        msg.header.address_family = family;
                        RouteNetlinkMessage::GetRoute(msg)
                    }
                    DumpKind::Addresses => {
                        let mut msg = AddressMessage::default();
                        msg.header.family = family;
                        RouteNetlinkMessage::GetAddress(msg)
                    }
                };
                self.send_dump_request(payload)?;

                loop {
                    let len = self.recv(0).map_err(|e| {
                        AfisyncError::Netlink(format!("Failed to receive dump: {}", e))
                    })?;
                    if len == 0 {
                        break;
                    }
                    let batch = parse_batch(&self.buffer[..len]);
                    events.extend(batch.events);
                    if batch.done {
                        break;
                    }
                }
            }
            info!(?kind, count = events.len(), "Dump complete");
            Ok(events)
        }

        fn recv(&mut self, flags: libc::c_int) -> std::io::Result<usize> {
            self.buffer.clear();
            self.socket.recv(&mut self.buffer, flags)
        }
    }

    /// Async wrapper streaming notifications through tokio's reactor.
    pub struct AsyncNetlinkSocket {
        inner: AsyncFd<OwnedFd>,
        socket: NetlinkSocket,
    }

    impl AsyncNetlinkSocket {
        /// Takes over a socket once its startup dumps are done.
        pub fn from_socket(socket: NetlinkSocket) -> Result<Self> {
            socket.set_nonblocking()?;

            // dup the fd so the Socket keeps ownership of the original
            let owned_fd = unsafe {
                let new_fd = libc::dup(socket.as_raw_fd());
                if new_fd < 0 {
                    return Err(AfisyncError::Netlink("Failed to dup fd".into()));
                }
                OwnedFd::from_raw_fd(new_fd)
            };
            let inner = AsyncFd::new(owned_fd)
                .map_err(|e| AfisyncError::Netlink(format!("Failed to create AsyncFd: {}", e)))?;

            Ok(Self { inner, socket })
        }

        /// Waits for the next datagram and returns its events (possibly none).
        pub async fn recv_events(&mut self) -> Result<Vec<SyncEvent>> {
            loop {
                let mut guard = self.inner.readable().await.map_err(|e| {
                    AfisyncError::Netlink(format!("AsyncFd readable error: {}", e))
                })?;

                match guard.try_io(|_| self.socket.recv(libc::MSG_DONTWAIT)) {
                    Ok(Ok(len)) => return Ok(parse_buffer(&self.socket.buffer[..len])),
                    Ok(Err(e)) => {
                        return Err(AfisyncError::Netlink(format!("Receive error: {}", e)));
                    }
                    Err(_would_block) => continue,
                }
            }
        }
    }

}

#[cfg(target_os = "linux")]
pub use linux::*;

/// Stand-ins for platforms without rtnetlink
#[cfg(not(target_os = "linux"))]
mod mock {
    use super::{DumpKind, NetlinkOptions};
    use crate::error::{AfisyncError, Result};
    use crate::event::SyncEvent;

    pub fn parse_buffer(buf: &[u8]) -> Vec<SyncEvent> {
        super::log_malformed(0, buf.len(), &"netlink is not supported on this platform");
        Vec::new()
    }

    pub struct NetlinkSocket;

    impl NetlinkSocket {
        pub fn new(_options: NetlinkOptions) -> Result<Self> {
            Err(AfisyncError::Netlink(
                "netlink is not supported on this platform".into(),
            ))
        }

        pub fn dump(&mut self, _kind: DumpKind) -> Result<Vec<SyncEvent>> {
            Ok(Vec::new())
        }
    }

    pub struct AsyncNetlinkSocket;

    impl AsyncNetlinkSocket {
        pub fn from_socket(_socket: NetlinkSocket) -> Result<Self> {
            Ok(Self)
        }

        pub async fn recv_events(&mut self) -> Result<Vec<SyncEvent>> {
            std::future::pending().await
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub use mock::*;
