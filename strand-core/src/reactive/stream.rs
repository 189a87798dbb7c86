//! Stream Implementation
//!
//! A Stream is a vertex that carries at most one event value per
//! transaction.
//!
//! # How Streams Work
//!
//! 1. Every derived stream owns a pull rule that reads the new values of its
//!    source streams (and the old values of any cells it samples).
//!
//! 2. When a sink fires, the transaction visits everything reachable from it
//!    and each visited stream runs its rule once, memoizing the result.
//!
//! 3. At commit the memo is dropped; outside a transaction a stream has no
//!    value at all.
//!
//! Because cells are always read through their old value, a snapshot sees
//! the state from before the transaction, which is what makes `accum` and
//! `collect` well defined.

use std::fmt;
use std::rc::Rc;

use tracing::trace;

use super::{keep_alive, link, new_value_node, Cell, CellLoop, Listener, StreamLoop};
use crate::error::Result;
use crate::graph::{registry, NodeKind, Retain, VertexId};
use crate::transaction::with_current;
use crate::vertex::{Held, ListenerNode, PullFn, Rule, Upstream, ValueNode};

/// A stream of discrete events.
///
/// # Example
///
/// ```rust,ignore
/// let clicks = StreamSink::new();
/// let counts = clicks.accum(0, |_, n| n + 1)?;
///
/// clicks.send(())?;
/// assert_eq!(counts.sample()?, 1);
/// ```
pub struct Stream<A> {
    node: Rc<ValueNode<A>>,
    retain: Retain,
}

impl<A> Clone for Stream<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            retain: self.retain.clone(),
        }
    }
}

impl<A: Clone + 'static> Stream<A> {
    pub(crate) fn from_node(node: Rc<ValueNode<A>>) -> Self {
        let retain = Retain::new(node.id());
        Self { node, retain }
    }

    /// Create a stream whose rule is built from its own id, then connect it
    /// to `sources`.
    pub(crate) fn derive<F>(sources: &[VertexId], build: F) -> Self
    where
        F: FnOnce(VertexId) -> Rule<A>,
    {
        let node = new_value_node(NodeKind::Stream, |id| (build(id), Held::Absent));
        let stream = Self::from_node(node);
        for source in sources {
            link(*source, stream.id());
        }
        stream
    }

    fn pull<F>(sources: &[VertexId], pull: F) -> Self
    where
        F: Fn() -> Result<Option<A>> + 'static,
    {
        let pull: PullFn<A> = Box::new(pull);
        Self::derive(sources, move |_| Rule::Pull(pull))
    }

    pub(crate) fn node(&self) -> &Rc<ValueNode<A>> {
        &self.node
    }

    pub(crate) fn retain(&self) -> &Retain {
        &self.retain
    }

    pub(crate) fn upstream(&self) -> Upstream<A> {
        Upstream::new(&self.node)
    }

    /// The vertex backing this stream.
    pub fn id(&self) -> VertexId {
        self.node.id()
    }

    /// A stream that never fires.
    pub fn never() -> Self {
        Self::derive(&[], |_| Rule::Never)
    }

    /// Label the vertex for the debug trace.
    pub fn rename(self, name: impl Into<String>) -> Self {
        registry::with_mut(|g| g.set_name(self.id(), name.into()));
        self
    }

    pub fn name(&self) -> Option<String> {
        registry::with(|g| g.name(self.id()))
    }

    /// Transform each event with `f`.
    pub fn map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + 'static,
        F: Fn(&A) -> B + 'static,
    {
        let src = self.upstream();
        Stream::pull(&[self.id()], move || Ok(src.new_value()?.map(|a| f(&a))))
    }

    /// Replace each event with a constant.
    pub fn map_to<B: Clone + 'static>(&self, value: B) -> Stream<B> {
        self.map(move |_| value.clone())
    }

    /// Keep only the events for which `pred` holds.
    pub fn filter<F>(&self, pred: F) -> Stream<A>
    where
        F: Fn(&A) -> bool + 'static,
    {
        let src = self.upstream();
        Stream::pull(&[self.id()], move || Ok(src.new_value()?.filter(|a| pred(a))))
    }

    /// Transform each event, dropping those mapped to `None`.
    pub fn filter_map<B, F>(&self, f: F) -> Stream<B>
    where
        B: Clone + 'static,
        F: Fn(&A) -> Option<B> + 'static,
    {
        let src = self.upstream();
        Stream::pull(&[self.id()], move || Ok(src.new_value()?.and_then(|a| f(&a))))
    }

    /// Events from either stream. Simultaneous events are combined with `f`,
    /// this stream's event on the left.
    pub fn merge<F>(&self, other: &Stream<A>, f: F) -> Stream<A>
    where
        F: Fn(&A, &A) -> A + 'static,
    {
        let left = self.upstream();
        let right = other.upstream();
        Stream::pull(&[self.id(), other.id()], move || {
            Ok(match (left.new_value()?, right.new_value()?) {
                (Some(l), Some(r)) => Some(f(&l, &r)),
                (l, r) => l.or(r),
            })
        })
    }

    /// Events from either stream; this stream wins when both fire.
    pub fn or_else(&self, other: &Stream<A>) -> Stream<A> {
        self.merge(other, |l, _| l.clone())
    }

    /// Events from the first stream in `streams` that fired.
    pub fn first_of(streams: &[Stream<A>]) -> Stream<A> {
        let ids: Vec<VertexId> = streams.iter().map(Stream::id).collect();
        let sources: Vec<Upstream<A>> = streams.iter().map(Stream::upstream).collect();
        Stream::pull(&ids, move || {
            for source in &sources {
                if let Some(a) = source.new_value()? {
                    return Ok(Some(a));
                }
            }
            Ok(None)
        })
    }

    /// Combine each event with the value `cell` had before the transaction.
    pub fn snapshot<B, C, F>(&self, cell: &Cell<B>, f: F) -> Stream<C>
    where
        B: Clone + 'static,
        C: Clone + 'static,
        F: Fn(&A, &B) -> C + 'static,
    {
        let src = self.upstream();
        let held = cell.upstream();
        let out = Stream::pull(&[self.id()], move || match src.new_value()? {
            Some(a) => Ok(Some(f(&a, &held.old_value()?))),
            None => Ok(None),
        });
        keep_alive(out.id(), cell.id());
        out
    }

    /// The value `cell` had before the transaction, at each event.
    pub fn snapshot1<B: Clone + 'static>(&self, cell: &Cell<B>) -> Stream<B> {
        self.snapshot(cell, |_, b| b.clone())
    }

    /// Combine each event with the values of two cells.
    pub fn snapshot3<B, C, D, F>(&self, b: &Cell<B>, c: &Cell<C>, f: F) -> Stream<D>
    where
        B: Clone + 'static,
        C: Clone + 'static,
        D: Clone + 'static,
        F: Fn(&A, &B, &C) -> D + 'static,
    {
        let src = self.upstream();
        let (cb, cc) = (b.upstream(), c.upstream());
        let out = Stream::pull(&[self.id()], move || match src.new_value()? {
            Some(a) => Ok(Some(f(&a, &cb.old_value()?, &cc.old_value()?))),
            None => Ok(None),
        });
        keep_alive(out.id(), b.id());
        keep_alive(out.id(), c.id());
        out
    }

    /// Combine each event with the values of three cells.
    pub fn snapshot4<B, C, D, E, F>(
        &self,
        b: &Cell<B>,
        c: &Cell<C>,
        d: &Cell<D>,
        f: F,
    ) -> Stream<E>
    where
        B: Clone + 'static,
        C: Clone + 'static,
        D: Clone + 'static,
        E: Clone + 'static,
        F: Fn(&A, &B, &C, &D) -> E + 'static,
    {
        let src = self.upstream();
        let (cb, cc, cd) = (b.upstream(), c.upstream(), d.upstream());
        let out = Stream::pull(&[self.id()], move || match src.new_value()? {
            Some(a) => Ok(Some(f(&a, &cb.old_value()?, &cc.old_value()?, &cd.old_value()?))),
            None => Ok(None),
        });
        for cell in [b.id(), c.id(), d.id()] {
            keep_alive(out.id(), cell);
        }
        out
    }

    /// Pass events only while `cell` is true.
    pub fn gate(&self, cell: &Cell<bool>) -> Stream<A> {
        let src = self.upstream();
        let open = cell.upstream();
        let out = Stream::pull(&[self.id()], move || match src.new_value()? {
            Some(a) if open.old_value()? => Ok(Some(a)),
            _ => Ok(None),
        });
        keep_alive(out.id(), cell.id());
        out
    }

    /// A cell that starts at `init` and takes the value of each event.
    pub fn hold(&self, init: A) -> Cell<A> {
        self.hold_with(Held::Value(init))
    }

    /// Like [`hold`](Self::hold), with the initial value computed on first
    /// read.
    pub fn hold_lazy<F>(&self, init: F) -> Cell<A>
    where
        F: Fn() -> A + 'static,
    {
        self.hold_with(Held::Lazy(Box::new(move || Ok(init()))))
    }

    fn hold_with(&self, held: Held<A>) -> Cell<A> {
        let src = self.upstream();
        let pull: PullFn<A> = Box::new(move || src.new_value());
        Cell::derive(&[self.id()], move |_| (Rule::Pull(pull), held))
    }

    /// Fold events into a cell. `f` gets the event and the previous state.
    pub fn accum<S, F>(&self, init: S, f: F) -> Result<Cell<S>>
    where
        S: Clone + 'static,
        F: Fn(&A, &S) -> S + 'static,
    {
        self.accum_with(Held::Value(init), f)
    }

    /// Like [`accum`](Self::accum), with the initial state computed on first
    /// read.
    pub fn accum_lazy<S, I, F>(&self, init: I, f: F) -> Result<Cell<S>>
    where
        S: Clone + 'static,
        I: Fn() -> S + 'static,
        F: Fn(&A, &S) -> S + 'static,
    {
        self.accum_with(Held::Lazy(Box::new(move || Ok(init()))), f)
    }

    fn accum_with<S, F>(&self, init: Held<S>, f: F) -> Result<Cell<S>>
    where
        S: Clone + 'static,
        F: Fn(&A, &S) -> S + 'static,
    {
        let state = CellLoop::new();
        let out = self.snapshot(&state, f).hold_with(init);
        state.loop_to(&out)?;
        Ok(out)
    }

    /// Run a state machine over the events. `f` gets the event and the
    /// previous state and returns the output event and the next state.
    pub fn collect<B, S, F>(&self, init: S, f: F) -> Result<Stream<B>>
    where
        B: Clone + 'static,
        S: Clone + 'static,
        F: Fn(&A, &S) -> (B, S) + 'static,
    {
        self.collect_with(Held::Value(init), f)
    }

    /// Like [`collect`](Self::collect), with the initial state computed on
    /// first read.
    pub fn collect_lazy<B, S, I, F>(&self, init: I, f: F) -> Result<Stream<B>>
    where
        B: Clone + 'static,
        S: Clone + 'static,
        I: Fn() -> S + 'static,
        F: Fn(&A, &S) -> (B, S) + 'static,
    {
        self.collect_with(Held::Lazy(Box::new(move || Ok(init()))), f)
    }

    fn collect_with<B, S, F>(&self, init: Held<S>, f: F) -> Result<Stream<B>>
    where
        B: Clone + 'static,
        S: Clone + 'static,
        F: Fn(&A, &S) -> (B, S) + 'static,
    {
        let next_state = StreamLoop::new();
        let state = next_state.hold_with(init);
        let stepped = self.snapshot(&state, f);
        let out = stepped.map(|(b, _)| b.clone());
        next_state.loop_to(&stepped.map(|(_, s)| s.clone()))?;
        Ok(out)
    }

    /// Only the next event. The stream detaches from its source at the end of
    /// the transaction that delivered it.
    pub fn once(&self) -> Stream<A> {
        let src = self.upstream();
        let source = self.id();
        Stream::derive(&[source], move |me| {
            // Serial of the transaction that delivered. That transaction may
            // recompute the value; later ones get nothing.
            let delivered = std::cell::Cell::new(None);
            let pull: PullFn<A> = Box::new(move || {
                let Some(a) = src.new_value()? else {
                    return Ok(None);
                };
                with_current(|tx| match delivered.get() {
                    Some(serial) if serial == tx.serial() => Ok(Some(a)),
                    Some(_) => Ok(None),
                    None => {
                        delivered.set(Some(tx.serial()));
                        tx.last(move || {
                            trace!(%source, vertex = %me, "once detached");
                            registry::reclaim(|g| g.remove_dependent(source, me));
                            Ok(())
                        });
                        Ok(Some(a))
                    }
                })
            });
            Rule::Pull(pull)
        })
    }

    /// Call `handler` with every event, after the transaction has settled.
    pub fn listen<F>(&self, handler: F) -> Listener
    where
        F: Fn(&A) + 'static,
    {
        Listener::attach(self.id(), ListenerNode::new(self.upstream(), handler))
    }
}

impl<A> fmt::Debug for Stream<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Stream").field(&self.retain.id()).finish()
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;

    use super::*;
    use crate::reactive::StreamSink;
    use crate::transaction;

    fn collect_into<A: Clone + 'static>(s: &Stream<A>) -> (Rc<RefCell<Vec<A>>>, Listener) {
        let out = Rc::new(RefCell::new(Vec::new()));
        let sink = out.clone();
        let l = s.listen(move |a: &A| sink.borrow_mut().push(a.clone()));
        (out, l)
    }

    #[test]
    fn map_and_filter() {
        let s = StreamSink::new();
        let evens = s.filter(|n: &i32| n % 2 == 0).map(|n| n * 10);
        let (out, _l) = collect_into(&evens);

        for n in 1..=4 {
            s.send(n).unwrap();
        }
        assert_eq!(*out.borrow(), vec![20, 40]);
    }

    #[test]
    fn filter_map_drops_none() {
        let s = StreamSink::new();
        let parsed = s.filter_map(|t: &&str| t.parse::<i32>().ok());
        let (out, _l) = collect_into(&parsed);

        s.send("7").unwrap();
        s.send("x").unwrap();
        s.send("9").unwrap();
        assert_eq!(*out.borrow(), vec![7, 9]);
    }

    #[test]
    fn merge_combines_simultaneous_events() {
        let a = StreamSink::new();
        let b = StreamSink::new();
        let m = a.merge(&b, |l: &i32, r| l * 100 + r);
        let (out, _l) = collect_into(&m);

        a.send(1).unwrap();
        b.send(2).unwrap();
        transaction::run(|_| {
            a.send(3)?;
            b.send(4)
        })
        .unwrap();
        assert_eq!(*out.borrow(), vec![1, 2, 304]);
    }

    #[test]
    fn or_else_prefers_the_left() {
        let a = StreamSink::new();
        let b = StreamSink::new();
        let (out, _l) = collect_into(&a.or_else(&b));
        transaction::run(|_| {
            a.send('l')?;
            b.send('r')
        })
        .unwrap();
        assert_eq!(*out.borrow(), vec!['l']);
    }

    #[test]
    fn first_of_takes_the_earliest_listed() {
        let sinks: Vec<StreamSink<u8>> = (0..3).map(|_| StreamSink::new()).collect();
        let streams: Vec<Stream<u8>> = sinks.iter().map(|s| (**s).clone()).collect();
        let (out, _l) = collect_into(&Stream::first_of(&streams));

        transaction::run(|_| {
            sinks[2].send(2)?;
            sinks[1].send(1)
        })
        .unwrap();
        sinks[2].send(22).unwrap();
        assert_eq!(*out.borrow(), vec![1, 22]);
    }

    #[test]
    fn never_never_fires() {
        let n: Stream<i32> = Stream::never();
        let (out, _l) = collect_into(&n);
        transaction::run(|_| Ok(())).unwrap();
        assert!(out.borrow().is_empty());
    }

    #[test]
    fn gate_follows_the_cell() {
        let s = StreamSink::new();
        let open = crate::reactive::CellSink::new(false);
        let (out, _l) = collect_into(&s.gate(&open));

        s.send(1).unwrap();
        open.send(true).unwrap();
        s.send(2).unwrap();
        assert_eq!(*out.borrow(), vec![2]);
    }

    #[test]
    fn once_delivers_a_single_event() {
        let s = StreamSink::new();
        let first = s.once();
        let (out, _l) = collect_into(&first);

        s.send(1).unwrap();
        s.send(2).unwrap();
        assert_eq!(*out.borrow(), vec![1]);
        // Detached from the sink after the first delivery.
        assert!(!registry::with(|g| g.node(s.id()).unwrap().dependents.contains(&first.id())));
    }

    #[test]
    fn collect_threads_state() {
        let s = StreamSink::new();
        let running = s
            .collect(0, |n: &i32, total: &i32| (total + n, total + n))
            .unwrap();
        let (out, _l) = collect_into(&running);

        s.send(5).unwrap();
        s.send(2).unwrap();
        s.send(10).unwrap();
        assert_eq!(*out.borrow(), vec![5, 7, 17]);
    }

    #[test]
    fn lazy_state_is_computed_on_first_use() {
        let s = StreamSink::new();
        let calls = Rc::new(std::cell::Cell::new(0));
        let (c1, c2) = (calls.clone(), calls.clone());
        let total = s
            .accum_lazy(
                move || {
                    c1.set(c1.get() + 1);
                    100
                },
                |n: &i32, acc| acc + n,
            )
            .unwrap();
        let running = s
            .collect_lazy(
                move || {
                    c2.set(c2.get() + 1);
                    10
                },
                |n: &i32, st: &i32| (st * n, st + 1),
            )
            .unwrap();
        let (out, _l) = collect_into(&running);
        assert_eq!(calls.get(), 0);

        s.send(2).unwrap();
        s.send(3).unwrap();
        assert_eq!(calls.get(), 2);
        assert_eq!(total.sample().unwrap(), 105);
        assert_eq!(*out.borrow(), vec![20, 33]);
    }

    #[test]
    fn snapshot4_reads_three_cells() {
        let s = StreamSink::new();
        let (b, c, d) = (
            crate::reactive::CellSink::new(1),
            crate::reactive::CellSink::new("x"),
            crate::reactive::CellSink::new(2.5),
        );
        let joined = s.snapshot4(&b, &c, &d, |a: &char, b, c, d| format!("{a}{b}{c}{d}"));
        let (out, _l) = collect_into(&joined);

        transaction::run(|_| {
            b.send(7)?;
            s.send('q')
        })
        .unwrap();
        s.send('r').unwrap();
        assert_eq!(*out.borrow(), vec!["q1x2.5", "r7x2.5"]);
    }

    #[test]
    fn rename_labels_the_vertex() {
        let s = StreamSink::<i32>::new();
        let named = s.map(|n| *n).rename("doubled");
        assert_eq!(named.name().as_deref(), Some("doubled"));
        assert!(registry::with(|g| g.describe(named.id())).contains("doubled"));
    }
}
