//! State tokens.
//!
//! A token is an identity handle naming a slot in the graph. It carries no
//! per-registry data: the value lives in the publisher the registry creates
//! for it on first access. Tokens are cheap to clone, and equality is by
//! [`TokenId`].

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::error::StoreError;
use crate::store::Registry;

use super::context::Get;
use super::publisher::Publisher;

/// Values that can live in the graph.
///
/// `PartialEq` lets derived and variable nodes skip propagation when a
/// recomputation lands on the same value.
pub trait StateValue: Clone + PartialEq + Send + Sync + 'static {}

impl<T> StateValue for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Process-unique token identity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TokenId(u64);

impl TokenId {
    /// Generate a new unique token ID.
    pub fn next() -> Self {
        static COUNTER: AtomicU64 = AtomicU64::new(1);
        Self(COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn raw(&self) -> u64 {
        self.0
    }
}

/// Kind of a token, as shown in debug output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TokenKind {
    Container,
    Derived,
    Variable,
    Collection,
    Meta,
    Rule,
    Selection,
    Command,
}

impl TokenKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Container => "container",
            TokenKind::Derived => "derived",
            TokenKind::Variable => "variable",
            TokenKind::Collection => "collection",
            TokenKind::Meta => "meta",
            TokenKind::Rule => "rule",
            TokenKind::Selection => "selection",
            TokenKind::Command => "command",
        }
    }
}

impl fmt::Display for TokenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Identity plus debug naming of a token.
///
/// Renders as `"<name>-<id>"` when a name or stable key was given (the id is
/// the key if present, the numeric token id otherwise) and as
/// `"[<kind> <n>]"` for anonymous tokens. Meta labels wrap their owner:
/// `"meta[count-1]"`, `"meta[container 3]"`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenLabel {
    id: TokenId,
    kind: TokenKind,
    name: Option<Arc<str>>,
    key: Option<Arc<str>>,
    owner: Option<Arc<TokenLabel>>,
}

impl TokenLabel {
    pub fn new(kind: TokenKind) -> Self {
        Self::with_id(TokenId::next(), kind)
    }

    pub(crate) fn with_id(id: TokenId, kind: TokenKind) -> Self {
        Self {
            id,
            kind,
            name: None,
            key: None,
            owner: None,
        }
    }

    /// Label of the meta token paired with `owner`.
    pub(crate) fn meta(id: TokenId, owner: &TokenLabel) -> Self {
        Self {
            owner: Some(Arc::new(owner.clone())),
            ..Self::with_id(id, TokenKind::Meta)
        }
    }

    pub fn id(&self) -> TokenId {
        self.id
    }

    pub fn kind(&self) -> TokenKind {
        self.kind
    }

    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub fn key(&self) -> Option<&str> {
        self.key.as_deref()
    }

    pub(crate) fn set_name(&mut self, name: &str) {
        self.name = Some(Arc::from(name));
    }

    pub(crate) fn set_key(&mut self, key: &str) {
        self.key = Some(Arc::from(key));
    }

    /// The label without its outer brackets.
    fn body(&self) -> String {
        if let Some(owner) = &self.owner {
            return format!("meta[{}]", owner.body());
        }
        match (&self.name, &self.key) {
            (None, None) => format!("{} {}", self.kind, self.id.0),
            (name, key) => {
                let name = name.as_deref().unwrap_or(self.kind.as_str());
                match key {
                    Some(key) => format!("{name}-{key}"),
                    None => format!("{name}-{}", self.id.0),
                }
            }
        }
    }
}

impl fmt::Display for TokenLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.owner.is_none() && self.name.is_none() && self.key.is_none() {
            write!(f, "[{}]", self.body())
        } else {
            f.write_str(&self.body())
        }
    }
}

/// A token the registry can create a publisher for.
pub trait StateToken: Send + Sync + 'static {
    fn label(&self) -> &TokenLabel;

    fn token_id(&self) -> TokenId {
        self.label().id()
    }

    /// Build the publisher backing this token in `registry`.
    ///
    /// Must not run user code; it is called before the publisher is
    /// installed.
    fn create_publisher(&self, registry: &Registry) -> Arc<dyn Publisher>;

    /// Called once after a freshly created publisher was installed.
    fn on_created(&self, _registry: &Registry, _publisher: &Arc<dyn Publisher>) {}
}

/// Something a reactive computation can read through [`Get`].
pub trait Readable: Send + Sync + 'static {
    type Value: StateValue;

    /// Read the current value, recording a dependency when `get` tracks.
    fn read(&self, get: &mut Get<'_>) -> Result<Self::Value, StoreError>;

    /// The token a long-lived subscription should attach to.
    ///
    /// Tokens bind to themselves; a variable binds to whatever it points at
    /// right now.
    fn bind(&self, registry: &Registry) -> Arc<dyn Readable<Value = Self::Value>>;

    /// Debug form used in logs.
    fn describe(&self) -> String;
}
