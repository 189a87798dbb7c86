//! Forward References
//!
//! A loop is a stream or cell that can be used before its definition exists.
//! It starts unresolved. A transaction that reaches it in that state, or a
//! read of a cell loop's value, fails with `LoopNotResolved`. Until then it
//! simply never fires. `loop_to` binds it to its source exactly once, adding
//! the edge that makes the loop a dependent of the source.

use std::ops::Deref;

use tracing::debug;

use super::{Cell, Stream};
use crate::error::Result;
use crate::graph::{registry, VertexId};
use crate::transaction;
use crate::vertex::{Held, LazyInit, PullFn, Rule};

fn bind(source: VertexId, target: VertexId) -> Result<()> {
    let change = registry::with_mut(|g| g.add_dependent(source, target))?;
    if change.inserted {
        transaction::on_edge_added(source);
    }
    debug!(%source, loop_vertex = %target, "loop resolved");
    Ok(())
}

/// A stream that is defined later.
pub struct StreamLoop<A> {
    stream: Stream<A>,
}

impl<A> Clone for StreamLoop<A> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<A: Clone + 'static> StreamLoop<A> {
    pub fn new() -> Self {
        Self {
            stream: Stream::derive(&[], |_| Rule::Unresolved),
        }
    }

    /// Make this loop fire exactly when `source` does.
    ///
    /// Fails with `LoopAlreadyResolved` on a second call.
    pub fn loop_to(&self, source: &Stream<A>) -> Result<()> {
        let src = source.upstream();
        let pull: PullFn<A> = Box::new(move || src.new_value());
        self.stream.node().resolve(pull, None)?;
        bind(source.id(), self.stream.id())
    }

    pub fn is_looped(&self) -> bool {
        self.stream.node().is_resolved()
    }
}

impl<A: Clone + 'static> Default for StreamLoop<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Deref for StreamLoop<A> {
    type Target = Stream<A>;

    fn deref(&self) -> &Stream<A> {
        &self.stream
    }
}

/// A cell that is defined later.
pub struct CellLoop<A> {
    cell: Cell<A>,
}

impl<A> Clone for CellLoop<A> {
    fn clone(&self) -> Self {
        Self {
            cell: self.cell.clone(),
        }
    }
}

impl<A: Clone + 'static> CellLoop<A> {
    pub fn new() -> Self {
        Self {
            cell: Cell::derive(&[], |_| (Rule::Unresolved, Held::Unresolved)),
        }
    }

    /// Make this loop follow `source`, including its current value.
    ///
    /// Fails with `LoopAlreadyResolved` on a second call.
    pub fn loop_to(&self, source: &Cell<A>) -> Result<()> {
        let (src, src_old) = (source.upstream(), source.upstream());
        let pull: PullFn<A> = Box::new(move || src.new_value());
        let init: LazyInit<A> = Box::new(move || src_old.old_value());
        self.cell.node().resolve(pull, Some(init))?;
        bind(source.id(), self.cell.id())
    }

    pub fn is_looped(&self) -> bool {
        self.cell.node().is_resolved()
    }
}

impl<A: Clone + 'static> Default for CellLoop<A> {
    fn default() -> Self {
        Self::new()
    }
}

impl<A> Deref for CellLoop<A> {
    type Target = Cell<A>;

    fn deref(&self) -> &Cell<A> {
        &self.cell
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StrandError;
    use crate::reactive::{CellSink, StreamSink};

    #[test]
    fn unresolved_loops_fail_on_read() {
        let c: CellLoop<i32> = CellLoop::new();
        assert_eq!(
            c.sample(),
            Err(StrandError::LoopNotResolved { vertex: c.id() })
        );
        assert!(!c.is_looped());
    }

    #[test]
    fn looping_twice_fails() {
        let s: StreamSink<i32> = StreamSink::new();
        let l = StreamLoop::new();
        l.loop_to(&s).unwrap();
        assert!(l.is_looped());
        assert_eq!(
            l.loop_to(&s),
            Err(StrandError::LoopAlreadyResolved { vertex: l.id() })
        );
    }

    #[test]
    fn unreached_loop_does_not_block_other_firings() {
        let a = StreamSink::new();
        let l = StreamLoop::new();
        let merged = a.or_else(&l);
        let seen = std::rc::Rc::new(std::cell::RefCell::new(Vec::new()));
        let out = seen.clone();
        let _listener = merged.listen(move |n: &i32| out.borrow_mut().push(*n));

        assert_eq!(a.send(1), Ok(()));
        assert_eq!(*seen.borrow(), vec![1]);

        let b = StreamSink::new();
        l.loop_to(&b).unwrap();
        b.send(2).unwrap();
        assert_eq!(*seen.borrow(), vec![1, 2]);
    }

    #[test]
    fn cell_loop_takes_the_source_value() {
        let src = CellSink::new(3);
        let l = CellLoop::new();
        let doubled = l.map(|n| n * 2);
        l.loop_to(&src).unwrap();

        assert_eq!(doubled.sample().unwrap(), 6);
        src.send(5).unwrap();
        assert_eq!(l.sample().unwrap(), 5);
        assert_eq!(doubled.sample().unwrap(), 10);
    }

    #[test]
    fn stream_loop_forwards_events() {
        let s = StreamSink::new();
        let l = StreamLoop::new();
        let total = l.accum(0, |n: &i32, acc| acc + n).unwrap();
        l.loop_to(&s).unwrap();

        s.send(2).unwrap();
        s.send(3).unwrap();
        assert_eq!(total.sample().unwrap(), 5);
    }
}
