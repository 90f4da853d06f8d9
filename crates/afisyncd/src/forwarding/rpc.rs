//! JSON-lines control channel to a remote forwarding-plane server.
//!
//! One request per line, one reply per line. Requests are serialized behind
//! an async mutex so at most one is in flight; replies must echo the id.

use super::{DomainHandle, ForwardingPlane, Fragment, InsertHandle, Inserted, Token};
use crate::error::{AfisyncError, Result};
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use std::net::SocketAddr;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::codec::{Framed, LinesCodec};
use tracing::{debug, info, instrument};

/// Upper bound for one reply line.
const MAX_LINE_LENGTH: usize = 1024 * 1024;

#[derive(Debug, Serialize)]
struct Request<'a> {
    id: u64,
    method: &'a str,
    params: Value,
}

#[derive(Debug, Deserialize)]
struct Reply {
    id: u64,
    #[serde(default)]
    result: Option<Value>,
    #[serde(default)]
    error: Option<ReplyError>,
}

#[derive(Debug, Deserialize)]
struct ReplyError {
    #[serde(default)]
    code: String,
    message: String,
}

/// Object-safe byte stream so tests can drive the client over an in-memory
/// pipe.
trait Transport: AsyncRead + AsyncWrite + Send + Unpin {}
impl<T: AsyncRead + AsyncWrite + Send + Unpin> Transport for T {}

struct Channel {
    framed: Framed<Box<dyn Transport>, LinesCodec>,
    next_id: u64,
}

pub struct RpcForwardingPlane {
    channel: Mutex<Channel>,
}

impl RpcForwardingPlane {
    /// Connects to the forwarding-plane server.
    #[instrument]
    pub async fn connect(addr: SocketAddr) -> Result<Self> {
        let stream = TcpStream::connect(addr).await.map_err(|e| {
            AfisyncError::ForwardingPlane(format!("connect to {} failed: {}", addr, e))
        })?;
        stream.set_nodelay(true)?;
        info!(%addr, "Connected to forwarding plane");
        Ok(Self::from_stream(stream))
    }

    /// Wraps an already established byte stream.
    pub fn from_stream<S>(stream: S) -> Self
    where
        S: AsyncRead + AsyncWrite + Send + Unpin + 'static,
    {
        let boxed: Box<dyn Transport> = Box::new(stream);
        Self {
            channel: Mutex::new(Channel {
                framed: Framed::new(boxed, LinesCodec::new_with_max_length(MAX_LINE_LENGTH)),
                next_id: 0,
            }),
        }
    }

    /// Sends one request and waits for its reply. The outer error covers
    /// transport and framing failures, the inner one an error reply.
    async fn exchange(
        &self,
        method: &str,
        params: Value,
    ) -> Result<std::result::Result<Value, ReplyError>> {
        let mut channel = self.channel.lock().await;
        channel.next_id += 1;
        let id = channel.next_id;

        let line = serde_json::to_string(&Request { id, method, params })?;
        debug!(id, method, "Forwarding plane request");
        channel
            .framed
            .send(line)
            .await
            .map_err(|e| AfisyncError::ForwardingPlane(format!("send {}: {}", method, e)))?;

        let reply = match channel.framed.next().await {
            Some(Ok(line)) => serde_json::from_str::<Reply>(&line)?,
            Some(Err(e)) => {
                return Err(AfisyncError::ForwardingPlane(format!(
                    "receive {}: {}",
                    method, e
                )));
            }
            None => {
                return Err(AfisyncError::ForwardingPlane(
                    "connection closed by server".to_string(),
                ));
            }
        };

        if reply.id != id {
            return Err(AfisyncError::ForwardingPlane(format!(
                "reply id {} does not match request {}",
                reply.id, id
            )));
        }
        match reply.error {
            Some(err) => Ok(Err(err)),
            None => Ok(Ok(reply.result.unwrap_or(Value::Null))),
        }
    }

    async fn call<T: DeserializeOwned>(&self, method: &str, params: Value) -> Result<T> {
        match self.exchange(method, params).await? {
            Ok(result) => Ok(serde_json::from_value(result)?),
            Err(err) => Err(AfisyncError::ForwardingPlane(format!(
                "{} failed ({}): {}",
                method, err.code, err.message
            ))),
        }
    }
}

#[derive(Deserialize)]
struct TokenReply {
    token: Token,
}

#[derive(Deserialize)]
struct DomainReply {
    domain: DomainHandle,
}

#[async_trait]
impl ForwardingPlane for RpcForwardingPlane {
    async fn allocate_domain(&self, name: &str, num_ports: u16) -> Result<DomainHandle> {
        let reply: DomainReply = self
            .call(
                "allocate_domain",
                json!({ "name": name, "num_ports": num_ports }),
            )
            .await?;
        Ok(reply.domain)
    }

    async fn resolve_output_port(&self, domain: DomainHandle, port_index: u16) -> Result<Token> {
        let reply: TokenReply = self
            .call(
                "resolve_output_port",
                json!({ "domain": domain, "port": port_index }),
            )
            .await?;
        Ok(reply.token)
    }

    async fn resolve_output_port_by_name(
        &self,
        domain: DomainHandle,
        name: &str,
    ) -> Result<Token> {
        let reply: TokenReply = self
            .call(
                "resolve_output_port_by_name",
                json!({ "domain": domain, "name": name }),
            )
            .await?;
        Ok(reply.token)
    }

    async fn set_input_port(
        &self,
        domain: DomainHandle,
        port_index: u16,
        next: Token,
    ) -> Result<()> {
        let _: Value = self
            .call(
                "set_input_port",
                json!({ "domain": domain, "port": port_index, "next": next }),
            )
            .await?;
        Ok(())
    }

    async fn insert_fragment(&self, domain: DomainHandle, fragment: Fragment) -> Result<Inserted> {
        self.call(
            "insert_fragment",
            json!({ "domain": domain, "fragment": fragment }),
        )
        .await
    }

    async fn remove_fragment(&self, domain: DomainHandle, handle: InsertHandle) -> Result<()> {
        let reply = self
            .exchange(
                "remove_fragment",
                json!({ "domain": domain, "handle": handle }),
            )
            .await?;
        match reply {
            Ok(_) => Ok(()),
            Err(err) if err.code == "not_found" => Err(AfisyncError::FragmentNotFound(handle.0)),
            Err(err) => Err(AfisyncError::ForwardingPlane(format!(
                "remove_fragment failed ({}): {}",
                err.code, err.message
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forwarding::{GraphNode, NodeKind};
    use pretty_assertions::assert_eq;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};

    /// Answers each request line with the reply produced by `respond`.
    fn serve<F>(server: tokio::io::DuplexStream, respond: F) -> tokio::task::JoinHandle<Vec<Value>>
    where
        F: Fn(&Value) -> Value + Send + 'static,
    {
        tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut lines = BufReader::new(read).lines();
            let mut seen = Vec::new();
            while let Ok(Some(line)) = lines.next_line().await {
                let request: Value = serde_json::from_str(&line).unwrap();
                let mut reply = respond(&request);
                reply["id"] = request["id"].clone();
                let mut out = serde_json::to_string(&reply).unwrap();
                out.push('\n');
                write.write_all(out.as_bytes()).await.unwrap();
                seen.push(request);
            }
            seen
        })
    }

    #[tokio::test]
    async fn test_request_reply() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = serve(server, |req| match req["method"].as_str().unwrap() {
            "allocate_domain" => json!({ "result": { "domain": 7 } }),
            "resolve_output_port_by_name" => json!({ "result": { "token": 40 } }),
            "insert_fragment" => json!({ "result": { "handle": 3, "root": 41 } }),
            _ => json!({ "result": null }),
        });

        let plane = RpcForwardingPlane::from_stream(client);
        let domain = plane.allocate_domain("green", 9).await.unwrap();
        assert_eq!(domain, DomainHandle(7));

        let punt = plane.resolve_output_port_by_name(domain, "punt").await.unwrap();
        assert_eq!(punt, Token(40));

        let inserted = plane
            .insert_fragment(domain, Fragment::single(GraphNode::new("d", NodeKind::Discard)))
            .await
            .unwrap();
        assert_eq!(inserted.handle, InsertHandle(3));
        assert_eq!(inserted.root, Token(41));

        drop(plane);
        let seen = handle.await.unwrap();
        let ids: Vec<u64> = seen.iter().map(|r| r["id"].as_u64().unwrap()).collect();
        assert_eq!(ids, vec![1, 2, 3]);
        assert_eq!(seen[0]["params"]["num_ports"], 9);
        assert_eq!(seen[2]["params"]["fragment"]["nodes"][0]["kind"]["type"], "discard");
    }

    #[tokio::test]
    async fn test_error_replies() {
        let (client, server) = tokio::io::duplex(4096);
        let _handle = serve(server, |req| match req["method"].as_str().unwrap() {
            "remove_fragment" => {
                json!({ "error": { "code": "not_found", "message": "handle 12 not found" } })
            }
            _ => json!({ "error": { "code": "refused", "message": "no capacity" } }),
        });

        let plane = RpcForwardingPlane::from_stream(client);
        let err = plane.allocate_domain("green", 2).await.unwrap_err();
        assert!(matches!(err, AfisyncError::ForwardingPlane(ref m) if m.contains("no capacity")));

        let err = plane
            .remove_fragment(DomainHandle(1), InsertHandle(12))
            .await
            .unwrap_err();
        assert!(matches!(err, AfisyncError::FragmentNotFound(12)));
    }

    #[tokio::test]
    async fn test_closed_connection() {
        let (client, server) = tokio::io::duplex(64);
        drop(server);
        let plane = RpcForwardingPlane::from_stream(client);
        assert!(plane.allocate_domain("green", 1).await.is_err());
    }
}
