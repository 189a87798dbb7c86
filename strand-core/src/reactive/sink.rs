//! Sinks
//!
//! Sinks are the only vertices fired from outside the graph. A firing stages
//! the value on the vertex and marks it as a root of the ambient transaction
//! (opening one if needed).
//!
//! A send made while the transaction is already past its drain (a listener
//! handler reacting to what it was told, say) can not join it any more. It is
//! posted instead and delivered in a nested transaction after commit.

use std::ops::Deref;
use std::rc::Rc;

use tracing::trace;

use super::{Cell, Stream};
use crate::error::Result;
use crate::graph::Retain;
use crate::transaction::{self, DEFERRED};
use crate::vertex::{Coalescer, Held, Rule, ValueNode};

fn fire<A: Clone + 'static>(node: &Rc<ValueNode<A>>, retain: &Retain, value: A) -> Result<()> {
    transaction::run(|tx| {
        if !tx.accepts_firings() {
            trace!(tx = tx.serial(), vertex = %node.id(), "send deferred");
            let (node, retain) = (node.clone(), retain.clone());
            tx.post(DEFERRED, move || fire(&node, &retain, value));
            return Ok(());
        }
        node.stage(value)?;
        tx.add_root(node.id())
    })
}

/// A stream fired from outside the graph.
pub struct StreamSink<A> {
    stream: Stream<A>,
}

impl<A> Clone for StreamSink<A> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<A: Clone + 'static> StreamSink<A> {
    /// A sink that may fire at most once per transaction.
    pub fn new() -> Self {
        Self {
            stream: Stream::derive(&[], |_| Rule::Sink(None)),
        }
    }

    /// A sink whose repeated firings in one transaction are combined with
    /// `f`, earlier value on the left.
    pub fn with_coalescer<F>(f: F) -> Self
    where
        F: Fn(A, A) -> A + 'static,
    {
        let coalesce: Coalescer<A> = Box::new(f);
        Self {
            stream: Stream::derive(&[], move |_| Rule::Sink(Some(coalesce))),
        }
    }

    /// Fire the sink.
    ///
    /// Fails with `DuplicateFiring` if the sink already fired in this
    /// transaction and has no coalescer.
    pub fn send(&self, value: A) -> Result<()> {
        fire(self.stream.node(), self.stream.retain(), value)
    }
}

impl<A: Clone + 'static> Default for StreamSink<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Deref for StreamSink<A> {
    type Target = Stream<A>;

    fn deref(&self) -> &Stream<A> {
        &self.stream
    }
}

/// A cell set from outside the graph.
pub struct CellSink<A> {
    cell: Cell<A>,
}

impl<A> Clone for CellSink<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: Clone + 'static> CellSink<A> {
    pub fn new(init: A) -> Self {
        Self {
            cell: Cell::derive(&[], move |_| (Rule::Sink(None), Held::Value(init))),
        }
    }

    /// Like [`StreamSink::with_coalescer`], for a cell.
    pub fn with_coalescer<F>(init: A, f: F) -> Self
    where
        F: Fn(A, A) -> A + 'static,
    {
        let coalesce: Coalescer<A> = Box::new(f);
        Self {
            cell: Cell::derive(&[], move |_| (Rule::Sink(Some(coalesce)), Held::Value(init))),
        }
    }

    /// Set the cell. The new value is visible from the next transaction.
    pub fn send(&self, value: A) -> Result<()> {
        fire(self.cell.node(), self.cell.retain(), value)
    }
}

impl<A> Deref for CellSink<A> {
    type Target = Cell<A>;

    fn deref(&self) -> &Cell<A> {
        &self.cell
    }
}
