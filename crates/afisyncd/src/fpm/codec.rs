//! FPM frame codec.
//!
//! Wire format: `version: u8 = 1`, `msg_type: u8`, `length: u16` (network
//! order, header included), then `length - 4` payload bytes.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::io;
use tokio_util::codec::{Decoder, Encoder};

pub const FPM_PROTO_VERSION: u8 = 1;
pub const FPM_HEADER_LEN: usize = 4;
pub const FPM_MAX_MSG_LEN: usize = 4096;

pub const FPM_MSG_TYPE_NETLINK: u8 = 1;
pub const FPM_MSG_TYPE_PROTOBUF: u8 = 2;

/// One decoded frame.
///
/// Malformed input is reported as a frame rather than a decode error so the
/// connection survives it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FpmFrame {
    Netlink(Bytes),
    Protobuf(Bytes),
    Unknown { msg_type: u8, len: usize },
    Invalid { reason: String },
}

#[derive(Debug, Default, Clone, Copy)]
pub struct FpmCodec;

impl FpmCodec {
    pub fn new() -> Self {
        Self
    }
}

impl Decoder for FpmCodec {
    type Item = FpmFrame;
    type Error = io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<FpmFrame>, io::Error> {
        if src.len() < FPM_HEADER_LEN {
            return Ok(None);
        }

        let version = src[0];
        let msg_type = src[1];
        let len = usize::from(u16::from_be_bytes([src[2], src[3]]));

        if !(FPM_HEADER_LEN..=FPM_MAX_MSG_LEN).contains(&len) {
            // No usable length, skip just the header
            src.advance(FPM_HEADER_LEN);
            return Ok(Some(FpmFrame::Invalid {
                reason: format!("bad length {}", len),
            }));
        }

        if src.len() < len {
            src.reserve(len - src.len());
            return Ok(None);
        }

        let mut frame = src.split_to(len);
        if version != FPM_PROTO_VERSION {
            return Ok(Some(FpmFrame::Invalid {
                reason: format!("unsupported version {}", version),
            }));
        }

        frame.advance(FPM_HEADER_LEN);
        let payload = frame.freeze();
        Ok(Some(match msg_type {
            FPM_MSG_TYPE_NETLINK => FpmFrame::Netlink(payload),
            FPM_MSG_TYPE_PROTOBUF => FpmFrame::Protobuf(payload),
            other => FpmFrame::Unknown {
                msg_type: other,
                len,
            },
        }))
    }
}

impl Encoder<FpmFrame> for FpmCodec {
    type Error = io::Error;

    fn encode(&mut self, frame: FpmFrame, dst: &mut BytesMut) -> Result<(), io::Error> {
        let (msg_type, payload) = match frame {
            FpmFrame::Netlink(p) => (FPM_MSG_TYPE_NETLINK, p),
            FpmFrame::Protobuf(p) => (FPM_MSG_TYPE_PROTOBUF, p),
            other => {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    format!("cannot encode {:?}", other),
                ));
            }
        };

        let len = payload.len() + FPM_HEADER_LEN;
        if len > FPM_MAX_MSG_LEN {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("frame of {} bytes exceeds {}", len, FPM_MAX_MSG_LEN),
            ));
        }

        dst.reserve(len);
        dst.put_u8(FPM_PROTO_VERSION);
        dst.put_u8(msg_type);
        dst.put_u16(len as u16);
        dst.put_slice(&payload);
        Ok(())
    }
}
