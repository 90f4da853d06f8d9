//! Normalized change events handed from the notification sources to the
//! reconciliation task.

use crate::neighbor::NeighborEntry;
use crate::route::RouteEntry;
use std::fmt;

/// A route or neighbor change, independent of which feed produced it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncEvent {
    RouteAdd(RouteEntry),
    RouteDelete(RouteEntry),
    NeighborAdd(NeighborEntry),
    NeighborDelete(NeighborEntry),
}

impl fmt::Display for SyncEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SyncEvent::RouteAdd(r) => write!(f, "route add {}", r),
            SyncEvent::RouteDelete(r) => write!(f, "route del {}", r),
            SyncEvent::NeighborAdd(n) => write!(f, "neigh add {}", n),
            SyncEvent::NeighborDelete(n) => write!(f, "neigh del {}", n),
        }
    }
}

/// Work items for the reconciliation task.
#[derive(Debug, Clone)]
pub enum EngineCommand {
    Event(SyncEvent),
    /// Log a snapshot of the engine state
    Dump,
}

impl From<SyncEvent> for EngineCommand {
    fn from(event: SyncEvent) -> Self {
        EngineCommand::Event(event)
    }
}
