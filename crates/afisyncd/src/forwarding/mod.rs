//! Forwarding plane client.
//!
//! The sandbox is programmed as a graph of nodes. Callers insert small graph
//! fragments and get back a handle (for later removal) and the token of the
//! fragment's root node (for referencing it from other fragments).

mod memory;
mod rpc;

pub use memory::{MemoryForwardingPlane, PlaneCall};
pub use rpc::RpcForwardingPlane;

use crate::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Reference to a node in the forwarding-plane graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Token(pub u64);

impl fmt::Display for Token {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "t{}", self.0)
    }
}

/// An allocated sandbox.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DomainHandle(pub u64);

/// Handle of an inserted fragment, used to remove it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InsertHandle(pub u64);

impl fmt::Display for InsertHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "h{}", self.0)
    }
}

/// Result of a successful fragment insert.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Inserted {
    pub handle: InsertHandle,
    pub root: Token,
}

/// Node parameter value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParamValue {
    Int(i64),
    Str(String),
}

impl From<i64> for ParamValue {
    fn from(v: i64) -> Self {
        ParamValue::Int(v)
    }
}

impl From<u32> for ParamValue {
    fn from(v: u32) -> Self {
        ParamValue::Int(i64::from(v))
    }
}

impl From<&str> for ParamValue {
    fn from(v: &str) -> Self {
        ParamValue::Str(v.to_string())
    }
}

impl From<String> for ParamValue {
    fn from(v: String) -> Self {
        ParamValue::Str(v)
    }
}

/// A field match used by entry and encapsulation nodes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldValue {
    pub field: String,
    pub value: Vec<u8>,
    /// Significant bits of `value`; `None` means an exact match
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub prefix_len: Option<u8>,
}

impl FieldValue {
    pub fn exact(field: impl Into<String>, value: impl Into<Vec<u8>>) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            prefix_len: None,
        }
    }

    pub fn prefix(field: impl Into<String>, value: impl Into<Vec<u8>>, prefix_len: u8) -> Self {
        Self {
            field: field.into(),
            value: value.into(),
            prefix_len: Some(prefix_len),
        }
    }
}

/// Node type and its type-specific configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NodeKind {
    /// Longest-prefix lookup table on `field`, `default` on miss
    Tree { field: String, default: Token },
    /// Entry added to an existing table node
    Entry { parent: Token, key: FieldValue },
    /// Header rewrite
    Encap {
        encap_type: String,
        keys: Vec<FieldValue>,
    },
    List { members: Vec<Token> },
    Discard,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphNode {
    pub name: String,
    pub kind: NodeKind,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub params: BTreeMap<String, ParamValue>,
    /// Node to continue with after this one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next: Option<Token>,
}

impl GraphNode {
    pub fn new(name: impl Into<String>, kind: NodeKind) -> Self {
        Self {
            name: name.into(),
            kind,
            params: BTreeMap::new(),
            next: None,
        }
    }

    pub fn param(mut self, key: impl Into<String>, value: impl Into<ParamValue>) -> Self {
        self.params.insert(key.into(), value.into());
        self
    }

    pub fn next(mut self, next: Token) -> Self {
        self.next = Some(next);
        self
    }
}

/// A set of nodes inserted atomically. The first node is the root.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Fragment {
    pub nodes: Vec<GraphNode>,
}

impl Fragment {
    pub fn single(node: GraphNode) -> Self {
        Self { nodes: vec![node] }
    }

    pub fn root(&self) -> Option<&GraphNode> {
        self.nodes.first()
    }
}

/// Control API of a forwarding-plane sandbox.
#[async_trait]
pub trait ForwardingPlane: Send + Sync {
    /// Allocates a sandbox with the given number of standard ports.
    async fn allocate_domain(&self, name: &str, num_ports: u16) -> Result<DomainHandle>;

    /// Token of the output node for a port index.
    async fn resolve_output_port(&self, domain: DomainHandle, port_index: u16) -> Result<Token>;

    /// Token of the output node for a named port.
    async fn resolve_output_port_by_name(&self, domain: DomainHandle, name: &str)
    -> Result<Token>;

    /// Points a port's input at `next`.
    async fn set_input_port(&self, domain: DomainHandle, port_index: u16, next: Token)
    -> Result<()>;

    /// Inserts a fragment atomically.
    async fn insert_fragment(&self, domain: DomainHandle, fragment: Fragment) -> Result<Inserted>;

    /// Removes a previously inserted fragment. Unknown handles yield
    /// `FragmentNotFound`.
    async fn remove_fragment(&self, domain: DomainHandle, handle: InsertHandle) -> Result<()>;
}
