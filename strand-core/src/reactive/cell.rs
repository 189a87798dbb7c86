//! Cell Implementation
//!
//! A Cell is a vertex whose value is always defined.
//!
//! # How Cells Work
//!
//! 1. The committed ("old") value is what [`Cell::sample`], snapshots and
//!    lifted functions read. It does not change while a transaction runs.
//!
//! 2. When a cell's source fires, the cell computes a new value for the
//!    transaction. Listeners see that new value.
//!
//! 3. At commit the new value becomes the old value. A transaction in which
//!    nothing reached the cell leaves it untouched.

use std::fmt;
use std::rc::Rc;

use super::{link, new_value_node, Listener, Stream};
use crate::error::Result;
use crate::graph::{registry, NodeKind, Retain, VertexId};
use crate::vertex::{Held, ListenerNode, PullFn, Rule, Upstream, ValueNode};

/// A time-varying value.
///
/// # Example
///
/// ```rust,ignore
/// let celsius = CellSink::new(20.0);
/// let fahrenheit = celsius.map(|c| c * 9.0 / 5.0 + 32.0);
///
/// celsius.send(100.0)?;
/// assert_eq!(fahrenheit.sample()?, 212.0);
/// ```
pub struct Cell<A> {
    node: Rc<ValueNode<A>>,
    retain: Retain,
}

impl<A> Clone for Cell<A> {
    fn clone(&self) -> Self {
        Self {
            node: self.node.clone(),
            retain: self.retain.clone(),
        }
    }
}

impl<A: Clone + 'static> Cell<A> {
    pub(crate) fn from_node(node: Rc<ValueNode<A>>) -> Self {
        let retain = Retain::new(node.id());
        Self { node, retain }
    }

    pub(crate) fn derive<F>(sources: &[VertexId], build: F) -> Self
    where
        F: FnOnce(VertexId) -> (Rule<A>, Held<A>),
    {
        let cell = Self::from_node(new_value_node(NodeKind::Cell, build));
        for source in sources {
            link(*source, cell.id());
        }
        cell
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

    /// A cell that always holds `value`.
    pub fn new(value: A) -> Self {
        Self::derive(&[], move |_| (Rule::Never, Held::Value(value)))
    }

    /// The vertex backing this cell.
    pub fn id(&self) -> VertexId {
        self.node.id()
    }

    /// Label the vertex for the debug trace.
    pub fn rename(self, name: impl Into<String>) -> Self {
        registry::with_mut(|g| g.set_name(self.id(), name.into()));
        self
    }

    pub fn name(&self) -> Option<String> {
        registry::with(|g| g.name(self.id()))
    }

    /// The committed value.
    ///
    /// Inside a transaction this is the value from before the transaction,
    /// even if the cell is being updated by it.
    pub fn sample(&self) -> Result<A> {
        self.node.old_value()
    }

    /// A cell that always holds `f` of this cell's value.
    pub fn map<B, F>(&self, f: F) -> Cell<B>
    where
        B: Clone + 'static,
        F: Fn(&A) -> B + 'static,
    {
        let f = Rc::new(f);
        let (src, src_old) = (self.upstream(), self.upstream());
        let init = f.clone();
        Cell::derive(&[self.id()], move |_| {
            let pull: PullFn<B> = Box::new(move || Ok(src.new_value()?.map(|a| f(&a))));
            let held = Held::Lazy(Box::new(move || Ok(init(&src_old.old_value()?))));
            (Rule::Pull(pull), held)
        })
    }

    /// A cell that always holds `f` of both cells' values.
    pub fn lift<B, C, F>(&self, other: &Cell<B>, f: F) -> Cell<C>
    where
        B: Clone + 'static,
        C: Clone + 'static,
        F: Fn(&A, &B) -> C + 'static,
    {
        let f = Rc::new(f);
        let init = f.clone();
        let (a, b) = (self.upstream(), other.upstream());
        let (a_old, b_old) = (a.clone(), b.clone());
        Cell::derive(&[self.id(), other.id()], move |_| {
            let pull: PullFn<C> = Box::new(move || {
                let fired_a = a.new_value()?.is_some();
                let fired_b = b.new_value()?.is_some();
                if !fired_a && !fired_b {
                    return Ok(None);
                }
                Ok(Some(f(&a.latest()?, &b.latest()?)))
            });
            let held = Held::Lazy(Box::new(move || {
                Ok(init(&a_old.old_value()?, &b_old.old_value()?))
            }));
            (Rule::Pull(pull), held)
        })
    }

    /// A stream of the cell's changes, firing with each new value.
    pub fn updates(&self) -> Stream<A> {
        let src = self.upstream();
        Stream::derive(&[self.id()], move |_| Rule::Pull(Box::new(move || src.new_value())))
    }

    /// Call `handler` with the current value now, and with every new value
    /// after each transaction that changes it.
    pub fn listen<F>(&self, handler: F) -> Result<Listener>
    where
        F: Fn(&A) + 'static,
    {
        handler(&self.sample()?);
        Ok(Listener::attach(
            self.id(),
            ListenerNode::new(self.upstream(), handler),
        ))
    }
}

impl<A> fmt::Debug for Cell<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Cell").field(&self.retain.id()).finish()
    }
}
