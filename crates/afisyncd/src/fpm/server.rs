//! FPM listener and per-connection frame handling.

use super::codec::{FpmCodec, FpmFrame};
use super::proto;
use crate::error::{AfisyncError, Result};
use crate::event::{EngineCommand, SyncEvent};
use crate::netlink;
use futures::StreamExt;
use std::net::SocketAddr;
use tokio::io::AsyncRead;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::codec::FramedRead;
use tracing::{debug, info, warn};

/// Turns a frame into events, logging and dropping anything unusable.
pub fn frame_events(frame: FpmFrame) -> Vec<SyncEvent> {
    match frame {
        FpmFrame::Netlink(payload) => netlink::parse_buffer(&payload),
        FpmFrame::Protobuf(payload) => match proto::decode_message(&payload) {
            Ok(event) => event.into_iter().collect(),
            Err(e) => {
                warn!(error = %e, "Dropping FPM protobuf message");
                Vec::new()
            }
        },
        FpmFrame::Unknown { msg_type, len } => {
            warn!(msg_type, len, "Dropping FPM frame of unknown type");
            Vec::new()
        }
        FpmFrame::Invalid { reason } => {
            warn!(%reason, "Dropping invalid FPM frame");
            Vec::new()
        }
    }
}

/// Reads frames from one connection until end of stream or a socket error
/// and forwards the events. Returns the number of events forwarded.
pub async fn handle_connection<S>(
    stream: S,
    peer: &str,
    tx: &mpsc::Sender<EngineCommand>,
) -> usize
where
    S: AsyncRead + Unpin,
{
    let mut frames = FramedRead::new(stream, FpmCodec::new());
    let mut forwarded = 0;

    while let Some(next) = frames.next().await {
        let frame = match next {
            Ok(frame) => frame,
            Err(e) => {
                warn!(%peer, error = %e, "FPM connection error");
                break;
            }
        };
        for event in frame_events(frame) {
            if tx.send(EngineCommand::Event(event)).await.is_err() {
                debug!(%peer, "Event channel closed");
                return forwarded;
            }
            forwarded += 1;
        }
    }

    info!(%peer, events = forwarded, "FPM connection closed");
    forwarded
}

pub struct FpmServer {
    listener: TcpListener,
}

impl FpmServer {
    /// Binds the listener. Failure is fatal at startup.
    pub async fn bind(addr: SocketAddr) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| AfisyncError::Fpm(format!("failed to bind {}: {}", addr, e)))?;
        info!(%addr, "FPM listener started");
        Ok(Self { listener })
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Accepts connections forever, one task per connection.
    pub async fn run(self, tx: mpsc::Sender<EngineCommand>) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    warn!(error = %e, "Failed to accept FPM connection");
                    continue;
                }
            };
            info!(%peer, "FPM client connected");

            let tx = tx.clone();
            tokio::spawn(async move {
                handle_connection(stream, &peer.to_string(), &tx).await;
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fpm::codec::{FPM_MSG_TYPE_PROTOBUF, FPM_PROTO_VERSION};
    use bytes::Bytes;

    #[test]
    fn test_bad_frames_yield_nothing() {
        assert!(frame_events(FpmFrame::Unknown { msg_type: 9, len: 8 }).is_empty());
        assert!(
            frame_events(FpmFrame::Invalid {
                reason: "bad".to_string()
            })
            .is_empty()
        );
        assert!(frame_events(FpmFrame::Protobuf(Bytes::from_static(&[0xff, 0xff]))).is_empty());
    }

    #[tokio::test]
    async fn test_connection_survives_garbage() {
        // Empty protobuf message: decodes but carries no route
        let empty = [FPM_PROTO_VERSION, FPM_MSG_TYPE_PROTOBUF, 0, 4];
        let garbage = [FPM_PROTO_VERSION, FPM_MSG_TYPE_PROTOBUF, 0, 6, 0xff, 0xff];
        let stream = tokio_test::io::Builder::new()
            .read(&garbage)
            .read(&empty)
            .build();

        let (tx, mut rx) = mpsc::channel(4);
        assert_eq!(handle_connection(stream, "mock", &tx).await, 0);
        drop(tx);
        assert!(rx.recv().await.is_none());
    }
}
