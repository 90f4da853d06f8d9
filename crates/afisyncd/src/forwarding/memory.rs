//! In-process forwarding plane.
//!
//! Hands out tokens and handles, keeps the live fragment set and records
//! every call in order. Backs `--dry-run` and the engine tests.

use super::{
    DomainHandle, ForwardingPlane, Fragment, InsertHandle, Inserted, NodeKind, Token,
};
use crate::error::{AfisyncError, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use tracing::debug;

/// A recorded control call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaneCall {
    AllocateDomain { name: String, num_ports: u16 },
    ResolveOutputPort { port_index: u16 },
    ResolveOutputPortByName { name: String },
    SetInputPort { port_index: u16, next: Token },
    Insert { handle: InsertHandle, root: Token, fragment: Fragment },
    Remove { handle: InsertHandle },
}

#[derive(Debug, Default)]
struct State {
    domain: Option<DomainHandle>,
    num_ports: u16,
    next_token: u64,
    next_handle: u64,
    ports: HashMap<u16, Token>,
    named_ports: HashMap<String, Token>,
    input_ports: HashMap<u16, Token>,
    live: BTreeMap<InsertHandle, (Token, Fragment)>,
    calls: Vec<PlaneCall>,
    fail_next_insert: bool,
    fail_next_remove: bool,
    refuse_domain: bool,
}

impl State {
    fn token(&mut self) -> Token {
        self.next_token += 1;
        Token(self.next_token)
    }

    fn check_domain(&self, domain: DomainHandle) -> Result<()> {
        match self.domain {
            Some(d) if d == domain => Ok(()),
            _ => Err(AfisyncError::ForwardingPlane(format!(
                "unknown domain {}",
                domain.0
            ))),
        }
    }
}

#[derive(Debug, Default)]
pub struct MemoryForwardingPlane {
    state: Mutex<State>,
}

impl MemoryForwardingPlane {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes the next `insert_fragment` fail.
    pub fn fail_next_insert(&self) {
        self.state.lock().fail_next_insert = true;
    }

    /// Makes the next `remove_fragment` fail.
    pub fn fail_next_remove(&self) {
        self.state.lock().fail_next_remove = true;
    }

    /// Makes `allocate_domain` fail.
    pub fn refuse_domain(&self) {
        self.state.lock().refuse_domain = true;
    }

    pub fn calls(&self) -> Vec<PlaneCall> {
        self.state.lock().calls.clone()
    }

    /// Returns the recorded calls and clears the log.
    pub fn take_calls(&self) -> Vec<PlaneCall> {
        std::mem::take(&mut self.state.lock().calls)
    }

    pub fn live_count(&self) -> usize {
        self.state.lock().live.len()
    }

    pub fn is_live(&self, handle: InsertHandle) -> bool {
        self.state.lock().live.contains_key(&handle)
    }

    pub fn fragment(&self, handle: InsertHandle) -> Option<Fragment> {
        self.state.lock().live.get(&handle).map(|(_, f)| f.clone())
    }

    /// Input port wiring set through `set_input_port`.
    pub fn input_port(&self, port_index: u16) -> Option<Token> {
        self.state.lock().input_ports.get(&port_index).copied()
    }

    /// Number of live fragments with a node that points at `token`.
    pub fn references_to(&self, token: Token) -> usize {
        self.state
            .lock()
            .live
            .values()
            .filter(|(_, fragment)| fragment_refers_to(fragment, token))
            .count()
    }
}

fn fragment_refers_to(fragment: &Fragment, token: Token) -> bool {
    fragment.nodes.iter().any(|node| {
        node.next == Some(token)
            || match &node.kind {
                NodeKind::Tree { default, .. } => *default == token,
                NodeKind::List { members } => members.contains(&token),
                NodeKind::Entry { .. } | NodeKind::Encap { .. } | NodeKind::Discard => false,
            }
    })
}

#[async_trait]
impl ForwardingPlane for MemoryForwardingPlane {
    async fn allocate_domain(&self, name: &str, num_ports: u16) -> Result<DomainHandle> {
        let mut state = self.state.lock();
        state.calls.push(PlaneCall::AllocateDomain {
            name: name.to_string(),
            num_ports,
        });
        if state.refuse_domain {
            return Err(AfisyncError::ForwardingPlane(format!(
                "sandbox {} refused",
                name
            )));
        }
        let domain = DomainHandle(1);
        state.domain = Some(domain);
        state.num_ports = num_ports;
        debug!(name, num_ports, "Allocated in-memory sandbox");
        Ok(domain)
    }

    async fn resolve_output_port(&self, domain: DomainHandle, port_index: u16) -> Result<Token> {
        let mut state = self.state.lock();
        state.check_domain(domain)?;
        state.calls.push(PlaneCall::ResolveOutputPort { port_index });
        if port_index >= state.num_ports {
            return Err(AfisyncError::ForwardingPlane(format!(
                "port {} out of range",
                port_index
            )));
        }
        if let Some(token) = state.ports.get(&port_index) {
            return Ok(*token);
        }
        let token = state.token();
        state.ports.insert(port_index, token);
        Ok(token)
    }

    async fn resolve_output_port_by_name(
        &self,
        domain: DomainHandle,
        name: &str,
    ) -> Result<Token> {
        let mut state = self.state.lock();
        state.check_domain(domain)?;
        state.calls.push(PlaneCall::ResolveOutputPortByName {
            name: name.to_string(),
        });
        if let Some(token) = state.named_ports.get(name) {
            return Ok(*token);
        }
        let token = state.token();
        state.named_ports.insert(name.to_string(), token);
        Ok(token)
    }

    async fn set_input_port(
        &self,
        domain: DomainHandle,
        port_index: u16,
        next: Token,
    ) -> Result<()> {
        let mut state = self.state.lock();
        state.check_domain(domain)?;
        state.calls.push(PlaneCall::SetInputPort { port_index, next });
        state.input_ports.insert(port_index, next);
        Ok(())
    }

    async fn insert_fragment(&self, domain: DomainHandle, fragment: Fragment) -> Result<Inserted> {
        let mut state = self.state.lock();
        state.check_domain(domain)?;
        if std::mem::take(&mut state.fail_next_insert) {
            return Err(AfisyncError::ForwardingPlane("insert rejected".to_string()));
        }
        if fragment.nodes.is_empty() {
            return Err(AfisyncError::ForwardingPlane("empty fragment".to_string()));
        }

        state.next_handle += 1;
        let handle = InsertHandle(state.next_handle);
        let root = state.token();
        // Non-root nodes get tokens too, even though only the root is returned
        for _ in 1..fragment.nodes.len() {
            state.token();
        }

        state.calls.push(PlaneCall::Insert {
            handle,
            root,
            fragment: fragment.clone(),
        });
        state.live.insert(handle, (root, fragment));
        Ok(Inserted { handle, root })
    }

    async fn remove_fragment(&self, domain: DomainHandle, handle: InsertHandle) -> Result<()> {
        let mut state = self.state.lock();
        state.check_domain(domain)?;
        state.calls.push(PlaneCall::Remove { handle });
        if std::mem::take(&mut state.fail_next_remove) {
            state.live.remove(&handle);
            return Err(AfisyncError::ForwardingPlane("remove rejected".to_string()));
        }
        match state.live.remove(&handle) {
            Some(_) => Ok(()),
            None => Err(AfisyncError::FragmentNotFound(handle.0)),
        }
    }
}
