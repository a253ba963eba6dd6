//! Cascade Core
//!
//! A glitch-free reactive state graph. Application state is declared as
//! tokens; a [`Registry`] creates the per-registry publishers behind them
//! on first use and keeps every reader consistent when values change.
//!
//! It implements:
//!
//! - Writable containers with reducers, write hooks and meta states
//! - Lazily recomputed derivations with dynamic dependency tracking
//! - Retargetable variables and keyed collections
//! - Effects that run once per settled update
//! - Rules, selections and commands for imperative updates
//! - Snapshots of container state to JSON or MessagePack
//!
//! # Architecture
//!
//! - `reactive`: token kinds and the publishers backing them
//! - `graph`: subscriber arena, listener lists, dirty states and the effect
//!   queue
//! - `store`: the registry, store messages and the dispatch engine
//!
//! # Example
//!
//! ```rust
//! use cascade_core::{Container, Derived, Registry};
//!
//! let registry = Registry::new();
//! let count = Container::new(1);
//!
//! let c = count.clone();
//! let doubled = Derived::new(move |get| get.get(&c) * 2);
//!
//! registry.dispatch(count.write(5));
//! assert_eq!(registry.get(&doubled), 10);
//! ```

pub mod config;
pub mod error;
pub mod graph;
pub mod reactive;
pub mod store;

pub use config::RegistryConfig;
pub use error::{BoxError, StoreError, WriteError};
pub use reactive::{
    Collection, CollectionKey, Container, Derived, Effect, Get, HookOutcome, MetaState,
    MetaToken, Readable, Reduced, StateToken, StateValue, Subscription, Variable,
    VariableTarget,
};
pub use store::{
    Command, CommandActions, Registry, Rule, Selection, Snapshot, StateSnapshot, StoreMessage,
    TokenManifest,
};
