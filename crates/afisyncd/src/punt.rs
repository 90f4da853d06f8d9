//! Punt relay: packets the forwarding plane sends to the host.
//!
//! Each UDP datagram starts with a hostpath header naming the sandbox port
//! the packet belongs to; the rest is the Ethernet frame, written as-is to
//! that port's sink (the tap device).

use crate::error::{AfisyncError, Result};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

pub const HOSTPATH_VERSION: u8 = 1;
pub const HOSTPATH_HEADER_LEN: usize = 4;

/// Largest datagram accepted from the forwarding plane.
const MAX_DATAGRAM_LEN: usize = 9216 + HOSTPATH_HEADER_LEN;

/// `version: u8`, `reserved: u8`, `port_index: u16` in network order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HostpathHeader {
    pub port_index: u16,
}

impl HostpathHeader {
    /// Splits a datagram into its header and payload.
    pub fn parse(datagram: &[u8]) -> Result<(Self, &[u8])> {
        if datagram.len() < HOSTPATH_HEADER_LEN {
            return Err(AfisyncError::InvalidAddress(format!(
                "hostpath datagram of {} bytes",
                datagram.len()
            )));
        }
        if datagram[0] != HOSTPATH_VERSION {
            return Err(AfisyncError::InvalidAddress(format!(
                "hostpath version {}",
                datagram[0]
            )));
        }
        let port_index = u16::from_be_bytes([datagram[2], datagram[3]]);
        Ok((Self { port_index }, &datagram[HOSTPATH_HEADER_LEN..]))
    }

    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        let mut out = Vec::with_capacity(HOSTPATH_HEADER_LEN + payload.len());
        out.push(HOSTPATH_VERSION);
        out.push(0);
        out.extend_from_slice(&self.port_index.to_be_bytes());
        out.extend_from_slice(payload);
        out
    }
}

/// Destination for punted frames of one port.
#[cfg_attr(test, mockall::automock)]
pub trait PuntSink: Send + Sync {
    fn write_packet(&self, packet: &[u8]) -> std::io::Result<usize>;
}

/// Port index to sink map. Entries are only ever added.
#[derive(Default)]
pub struct PortSinkMap {
    sinks: RwLock<HashMap<u16, Arc<dyn PuntSink>>>,
}

impl PortSinkMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&self, port_index: u16, sink: Arc<dyn PuntSink>) -> Result<()> {
        let mut sinks = self.sinks.write();
        if sinks.contains_key(&port_index) {
            return Err(AfisyncError::Config(format!(
                "punt sink for port {} already registered",
                port_index
            )));
        }
        sinks.insert(port_index, sink);
        Ok(())
    }

    pub fn get(&self, port_index: u16) -> Option<Arc<dyn PuntSink>> {
        self.sinks.read().get(&port_index).cloned()
    }

    pub fn len(&self) -> usize {
        self.sinks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.read().is_empty()
    }

    /// Writes one hostpath datagram to its port's sink.
    pub fn deliver(&self, datagram: &[u8]) -> Result<usize> {
        let (header, payload) = HostpathHeader::parse(datagram)?;
        let sink = self.get(header.port_index).ok_or_else(|| {
            AfisyncError::InterfaceNotFound(format!("punt port {}", header.port_index))
        })?;
        Ok(sink.write_packet(payload)?)
    }
}

/// Receives hostpath datagrams and hands them to the port sinks.
pub struct PuntRelay {
    socket: UdpSocket,
    sinks: Arc<PortSinkMap>,
}

impl PuntRelay {
    pub async fn bind(addr: SocketAddr, sinks: Arc<PortSinkMap>) -> Result<Self> {
        let socket = UdpSocket::bind(addr).await?;
        info!(%addr, ports = sinks.len(), "Punt relay listening");
        Ok(Self { socket, sinks })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.socket.local_addr()?)
    }

    pub async fn run(self) -> Result<()> {
        let mut buf = vec![0u8; MAX_DATAGRAM_LEN];
        loop {
            let (len, from) = self.socket.recv_from(&mut buf).await?;
            match self.sinks.deliver(&buf[..len]) {
                Ok(written) => debug!(%from, written, "Punted packet"),
                Err(e) => warn!(%from, len, error = %e, "Dropping punted packet"),
            }
        }
    }
}
