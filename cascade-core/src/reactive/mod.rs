//! Reactive Primitives
//!
//! This module implements the token kinds of the state graph and the
//! publisher machinery behind them.
//!
//! # Concepts
//!
//! ## Tokens and publishers
//!
//! A token is an identity handle. It holds no state of its own; the first
//! time a [`Registry`](crate::store::Registry) touches it, the token builds a
//! publisher inside that registry, which owns the value, the listener list
//! and the change stamp.
//!
//! ## Containers
//!
//! A [`Container`] is writable state. Writes go through an optional reducer
//! and an optional hook, and every container carries a [`MetaToken`]
//! reporting whether its latest write is settled, pending or rejected.
//!
//! ## Derived values and variables
//!
//! A [`Derived`] caches a value computed from other tokens and recomputes
//! only when one of the tokens it read actually changed. A [`Variable`]
//! points at another token (or a plain value) and can be re-pointed.
//!
//! ## Collections
//!
//! A [`Collection`] is a keyed family of container-like slots created on
//! demand.
//!
//! ## Effects
//!
//! An [`Effect`] runs user code with settled values whenever the tokens it
//! read change.
//!
//! # Implementation Notes
//!
//! Dependency tracking is explicit: every computation receives a [`Get`]
//! and whatever it reads through it becomes the dependency set for the next
//! cycle. There is no thread-local "current computation".

mod collection;
mod container;
mod context;
mod derived;
mod effect;
mod meta;
mod publisher;
mod token;
mod variable;
mod writer;

pub use collection::{Collection, CollectionKey, CollectionPublisher, SlotKey};
pub use container::{
    Container, ContainerBuilder, ContainerPublisher, HookOutcome, Initializer, Reduced, Reducer,
    Suspended, WriteHook,
};
pub use context::Get;
pub use derived::{Derived, DerivedPublisher};
pub use effect::{Effect, Subscription};
pub use meta::{MetaPublisher, MetaState, MetaToken};
pub use publisher::{Publisher, PublisherCore, PublisherRef};
pub use token::{Readable, StateToken, StateValue, TokenId, TokenKind, TokenLabel};
pub use variable::{Variable, VariablePublisher, VariableTarget};

pub(crate) use effect::EffectNode;
