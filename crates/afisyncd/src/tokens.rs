//! Side table describing every graph node the engine has created.
//!
//! Purely diagnostic: nothing reads it to make forwarding decisions.

use crate::forwarding::Token;
use std::collections::BTreeMap;
use std::fmt;

/// What a registered token stands for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    RouteTable,
    Discard,
    Punt,
    OutputPort,
    NeighborEncap,
    RouteEntry,
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TokenKind::RouteTable => "route-table",
            TokenKind::Discard => "discard",
            TokenKind::Punt => "punt",
            TokenKind::OutputPort => "output-port",
            TokenKind::NeighborEncap => "neighbor-encap",
            TokenKind::RouteEntry => "route-entry",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenInfo {
    pub kind: TokenKind,
    pub description: String,
    pub next: Option<Token>,
}

#[derive(Debug, Default)]
pub struct TokenRegistry {
    tokens: BTreeMap<Token, TokenInfo>,
}

impl TokenRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Records a token, replacing any previous description.
    pub fn register(
        &mut self,
        token: Token,
        kind: TokenKind,
        description: impl Into<String>,
        next: Option<Token>,
    ) {
        self.tokens.insert(
            token,
            TokenInfo {
                kind,
                description: description.into(),
                next,
            },
        );
    }

    pub fn unregister(&mut self, token: Token) -> Option<TokenInfo> {
        self.tokens.remove(&token)
    }

    pub fn get(&self, token: Token) -> Option<&TokenInfo> {
        self.tokens.get(&token)
    }

    pub fn len(&self) -> usize {
        self.tokens.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tokens.is_empty()
    }

    pub fn count(&self, kind: TokenKind) -> usize {
        self.tokens.values().filter(|info| info.kind == kind).count()
    }

    /// One line per token, ordered by token value.
    pub fn lines(&self) -> Vec<String> {
        self.tokens
            .iter()
            .map(|(token, info)| match info.next {
                Some(next) => format!("{} {} {} -> {}", token, info.kind, info.description, next),
                None => format!("{} {} {}", token, info.kind, info.description),
            })
            .collect()
    }
}
