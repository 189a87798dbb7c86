//! Error Types
//!
//! Every fallible engine operation returns [`Result`]. The variants fall into
//! four groups:
//!
//! | Group | Variants |
//! |-------|----------|
//! | Graph construction | `LoopAlreadyResolved` |
//! | Traversal | `LoopNotResolved`, `InstantaneousCycle`, `VertexReleased` |
//! | Firing | `DuplicateFiring`, `NoActiveTransaction` |
//! | Scheduling | `ResortOutsideDrain`, `Hook` |
//!
//! User closures (pull functions, listener handlers) are plain infallible
//! closures. A panic inside one unwinds through the engine; the transaction
//! guards still put the ambient state back to idle on the way out.

use thiserror::Error;

use crate::graph::VertexId;
use crate::transaction::Phase;

/// Errors raised by the engine.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StrandError {
    /// A forward reference was resolved a second time.
    #[error("loop {vertex} was already resolved; a loop can only be looped once")]
    LoopAlreadyResolved { vertex: VertexId },

    /// A forward reference was read before it was resolved.
    #[error("loop {vertex} was read before it was resolved")]
    LoopNotResolved { vertex: VertexId },

    /// A pull rule needed its own value to compute its value.
    #[error("vertex {vertex} depends on its own new value within one transaction")]
    InstantaneousCycle { vertex: VertexId },

    /// A sink without a coalescing function fired twice in one transaction.
    #[error(
        "sink {vertex} fired more than once in one transaction; \
         construct it with a coalescer to combine simultaneous events"
    )]
    DuplicateFiring { vertex: VertexId },

    /// A pull reached a vertex whose storage was already reclaimed.
    #[error("vertex {vertex} was read after it was released")]
    VertexReleased { vertex: VertexId },

    /// A resort was requested while the transaction was not draining.
    #[error("resort requested in the {phase:?} phase; only a draining transaction can resort")]
    ResortOutsideDrain { phase: Phase },

    /// An operation that needs the ambient transaction ran outside of one.
    #[error("no transaction is active on this thread")]
    NoActiveTransaction,

    /// A transaction start hook reported a failure.
    #[error("transaction start hook failed: {0}")]
    Hook(String),
}

/// Result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, StrandError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_name_the_vertex() {
        let id = VertexId::from_parts(3, 1);
        let err = StrandError::LoopAlreadyResolved { vertex: id };
        assert!(err.to_string().contains("v3"));
        assert!(err.to_string().contains("looped once"));
    }

    #[test]
    fn hook_error_carries_message() {
        let err = StrandError::Hook("timer offline".into());
        assert_eq!(
            err.to_string(),
            "transaction start hook failed: timer offline"
        );
    }

    #[test]
    fn resort_error_names_the_phase() {
        let err = StrandError::ResortOutsideDrain { phase: Phase::Open };
        assert!(err.to_string().contains("Open phase"));
    }
}
