//! Vertex Bodies
//!
//! A vertex body holds the per-transaction state of a vertex: its visited
//! flag, its memoized new value and, for cells, the committed old value.
//!
//! # Contract
//!
//! The registry stores bodies as `Rc<dyn VertexBody>` and the transaction
//! drives them through a fixed life cycle:
//!
//! 1. `visit` when the traversal first reaches the vertex (clears the memo)
//! 2. `process` in rank order during the drain (forces the lazy new value)
//! 3. `notify` once the transaction has settled (listeners fire here)
//! 4. `update` to commit and return to idle
//!
//! A transaction that fails before committing calls `abandon` instead of
//! `notify`/`update`, which drops everything staged for it.
//!
//! Bodies never touch the registry from these methods except through the
//! pull rules of value nodes, which only read other bodies.

mod listener;
mod value;

pub(crate) use listener::ListenerNode;
pub(crate) use value::{Coalescer, Held, LazyInit, PullFn, Rule, Upstream, ValueNode};

use crate::error::Result;

/// Type-erased view of a vertex, as seen by the registry and the transaction.
pub(crate) trait VertexBody {
    /// Mark the vertex reachable in the running transaction.
    fn visit(&self);

    fn is_visited(&self) -> bool;

    /// Compute whatever the vertex produces this transaction.
    fn process(&self) -> Result<()>;

    /// Settle the final new value and run external handlers.
    fn notify(&self) -> Result<()>;

    /// Commit and reset the per-transaction state.
    fn update(&self);

    /// Drop everything staged for a transaction that did not commit.
    fn abandon(&self);

    /// State summary for the debug trace.
    fn describe(&self) -> String;
}
