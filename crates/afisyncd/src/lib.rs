//! Route and Neighbor Synchronization Daemon for an AFI forwarding sandbox
//!
//! afisyncd mirrors the kernel's unicast routes and neighbors into a
//! software forwarding plane driven through its Advanced Forwarding
//! Interface. Routes arrive either from a netlink subscription or from an
//! FPM feed; neighbors always come from netlink.
//!
//! # Architecture
//!
//! ```text
//! +-----------------+     +---------------------+     +------------------+
//! |  Linux Kernel   |     |      afisyncd       |     | Forwarding plane |
//! |                 |     |                     |     |                  |
//! |  RTM_*NEIGH     |---->| netlink  --+        |     |  route table     |
//! |  RTM_*ROUTE     |     |            v        |     |  neighbor encaps |
//! |  RTM_*ADDR      |     |   mpsc -> AfiSync --+---->|  discard / punt  |
//! |                 |     |            ^        |     |                  |
//! |  FPM client ----+---->| fpm -------+        |     |                  |
//! |                 |     |                     |     |                  |
//! |  tap devices <--+-----| punt relay <--------+-----|  hostpath (UDP)  |
//! +-----------------+     +---------------------+     +------------------+
//! ```

pub mod afi_sync;
pub mod config;
pub mod error;
pub mod event;
pub mod forwarding;
pub mod fpm;
pub mod interface;
pub mod neighbor;
pub mod netlink;
pub mod punt;
pub mod route;
pub mod tap;
pub mod tokens;
pub mod types;

pub use afi_sync::{AfiSync, Outcome, SyncCounters};
pub use config::{AfisyncConfig, InterfaceConfig};
pub use error::{AfisyncError, Result};
pub use event::{EngineCommand, SyncEvent};
pub use forwarding::{ForwardingPlane, MemoryForwardingPlane, RpcForwardingPlane, Token};
pub use fpm::{FpmCodec, FpmFrame, FpmServer};
pub use interface::{InterfacePort, InterfaceRegistry};
pub use neighbor::NeighborEntry;
pub use netlink::{AsyncNetlinkSocket, DumpKind, NetlinkOptions, NetlinkSocket};
pub use punt::{HostpathHeader, PortSinkMap, PuntRelay, PuntSink};
pub use route::{RouteEntry, RouteKey};
pub use tap::TapDevice;
pub use types::{AddressFamily, IpAddress, MacAddress};
