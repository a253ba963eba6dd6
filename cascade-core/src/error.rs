//! Error types for the store.
//!
//! Most failures in the graph never reach the caller of `dispatch`: a reducer
//! or hook that rejects a write is turned into an `Error` meta state for that
//! token, and a failing derivation keeps its previous value. `StoreError` is
//! what surfaces through the few APIs that do return a `Result` (reads,
//! snapshots, configuration) and what gets logged for the contained cases.

use thiserror::Error;

/// Boxed error returned by fallible derivation generators.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Errors produced by the registry and its token kinds.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The registry was disposed before the operation ran.
    #[error("registry has been disposed")]
    Disposed,

    /// A derivation read itself, directly or through other derivations.
    #[error("cyclic read of {token}")]
    Cycle { token: String },

    /// A publisher was found for a token but it belongs to another token kind.
    #[error("publisher for {token} does not match its token kind")]
    KindMismatch { token: String },

    /// A chain of reducer follow-up messages went deeper than allowed.
    #[error("write cascade from {token} exceeded {limit} nested messages")]
    CascadeTooDeep { token: String, limit: usize },

    /// Effects kept re-triggering each other past the configured bound.
    #[error("settle did not converge after {rounds} rounds")]
    SettleLimit { rounds: usize },

    /// A derivation generator failed; its previous value is kept.
    #[error("derivation {token} failed: {reason}")]
    Derivation { token: String, reason: String },

    /// A snapshot entry could not be captured or restored.
    #[error("snapshot entry {key}: {source}")]
    Snapshot {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Encode(#[from] rmp_serde::encode::Error),

    #[error(transparent)]
    Decode(#[from] rmp_serde::decode::Error),
}

/// Rejection of a single write by a reducer, hook or command.
///
/// Carried into [`MetaState::Error`](crate::reactive::MetaState::Error) for
/// the token that was being written.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}: {reason}")]
pub struct WriteError {
    pub reason: String,
    pub message: String,
}

impl WriteError {
    pub fn new(reason: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_error_display_includes_both_parts() {
        let err = WriteError::new("timeout", "could not save");
        assert_eq!(err.to_string(), "could not save: timeout");
    }

    #[test]
    fn store_error_messages_name_the_token() {
        let err = StoreError::Cycle {
            token: "[derived 4]".into(),
        };
        assert_eq!(err.to_string(), "cyclic read of [derived 4]");

        let err = StoreError::CascadeTooDeep {
            token: "count-1".into(),
            limit: 8,
        };
        assert!(err.to_string().contains("exceeded 8"));
    }
}
