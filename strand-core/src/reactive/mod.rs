//! Reactive Primitives
//!
//! This module is the user-facing surface of the engine: streams, cells and
//! the operations that derive new ones from old ones. Everything here is
//! built from the core's vertex operations (create a vertex with a pull rule,
//! add a dependent edge, fire a sink, listen).
//!
//! # Concepts
//!
//! ## Streams
//!
//! A [`Stream`] carries discrete events: at most one value per transaction.
//! A [`StreamSink`] is fired from outside; every other stream is derived.
//!
//! ## Cells
//!
//! A [`Cell`] carries a value that is always defined. Within a transaction
//! every reader sees the value from before the transaction; updates become
//! visible in the next one. [`Stream::hold`] turns a stream into a cell.
//!
//! ## Loops
//!
//! [`StreamLoop`] and [`CellLoop`] are forward references. They can be used
//! before the stream or cell they stand for exists, and are bound exactly once
//! with `loop_to`.
//!
//! ## Listeners
//!
//! `listen` attaches an external handler and returns a [`Listener`]. The
//! handler runs after the transaction has settled. Dropping the listener
//! unregisters it.
//!
//! # Handles
//!
//! Handles are cheap to clone and hold the vertex alive. They are `!Send`:
//! the graph lives in thread-local state.

mod cell;
mod listener;
mod loops;
mod router;
mod sink;
mod stream;

pub use cell::Cell;
pub use listener::Listener;
pub use loops::{CellLoop, StreamLoop};
pub use router::Router;
pub use sink::{CellSink, StreamSink};
pub use stream::Stream;

use std::rc::Rc;

use tracing::{trace, warn};

use crate::graph::{registry, NodeKind, VertexId};
use crate::transaction;
use crate::vertex::{Held, Rule, ValueNode};

/// Insert a value vertex. `build` receives the new vertex's id.
fn new_value_node<A, F>(kind: NodeKind, build: F) -> Rc<ValueNode<A>>
where
    A: Clone + 'static,
    F: FnOnce(VertexId) -> (Rule<A>, Held<A>),
{
    registry::with_mut(|g| {
        g.insert_with(kind, |id| {
            let (rule, held) = build(id);
            Rc::new(ValueNode::new(id, kind, rule, held))
        })
    })
    .1
}

/// Add a propagation edge between two vertices held by live handles.
fn link(source: VertexId, dependent: VertexId) {
    match registry::with_mut(|g| g.add_dependent(source, dependent)) {
        Ok(change) => {
            if change.reranked {
                trace!(%source, %dependent, "ranks raised");
            }
            if change.inserted {
                transaction::on_edge_added(source);
            }
        }
        Err(err) => warn!(%source, %dependent, %err, "edge not added"),
    }
}

/// Let `holder` keep `target` alive without depending on it.
fn keep_alive(holder: VertexId, target: VertexId) {
    if let Err(err) = registry::with_mut(|g| g.keep_alive(holder, target)) {
        warn!(%holder, %target, %err, "lifetime link not added");
    }
}
