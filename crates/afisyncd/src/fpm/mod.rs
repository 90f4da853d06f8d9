//! Framed route feed (FPM).
//!
//! A routing daemon connects over TCP and streams frames, each carrying
//! either a raw netlink route message or a protobuf `fpm.Message`.

pub mod codec;
pub mod proto;
pub mod server;

pub use codec::{FpmCodec, FpmFrame};
pub use server::{FpmServer, frame_events};

/// Default listen port.
pub const FPM_DEFAULT_PORT: u16 = 2620;
