//! Stream and Cell Value Slots
//!
//! A [`ValueNode`] carries the values of one stream or cell vertex:
//!
//! - the *new value*, which exists only inside a transaction and only when
//!   the vertex was reached from a firing root. It is computed on first read
//!   by the vertex's [`Rule`] and memoized until commit.
//! - the *old value* (cells only), which is what every reader sees for the
//!   whole transaction. It changes only at commit, to the new value if there
//!   was one.
//!
//! # Rules
//!
//! A rule is the derivation-specific way of producing the new value. Sinks
//! are fired from outside; pull rules read the new values of source streams
//! and the old values of source cells through [`Upstream`] handles; loops
//! start unresolved and are bound to a pull rule exactly once.
//!
//! Upstream handles are weak. The registry owns every body, and a dependent
//! keeps its sources registered, so an upgrade only fails if that invariant
//! was broken.

use std::cell::{Cell, RefCell};
use std::fmt;
use std::rc::{Rc, Weak};

use super::VertexBody;
use crate::error::{Result, StrandError};
use crate::graph::{NodeKind, VertexId};

/// Computes a vertex's new value from its sources.
pub(crate) type PullFn<A> = Box<dyn Fn() -> Result<Option<A>>>;

/// Combines two firings of a sink within one transaction.
pub(crate) type Coalescer<A> = Box<dyn Fn(A, A) -> A>;

/// Computes a cell's initial old value on first read.
pub(crate) type LazyInit<A> = Box<dyn Fn() -> Result<A>>;

/// How a vertex produces its new value.
pub(crate) enum Rule<A> {
    /// Fired from outside; an optional coalescer merges repeated firings.
    Sink(Option<Coalescer<A>>),
    /// Derived from sources.
    Pull(PullFn<A>),
    /// A loop that has not been bound to its source yet.
    Unresolved,
    /// Never produces a value.
    Never,
}

/// The committed value of a cell.
pub(crate) enum Held<A> {
    /// Streams keep no old value.
    Absent,
    Value(A),
    /// Computed on first read, then stored.
    Lazy(LazyInit<A>),
    /// A lazy value is being computed.
    Computing,
    /// A cell loop that has not been bound yet.
    Unresolved,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eval {
    Idle,
    Running,
    Done,
}

/// Value slots of a stream or cell vertex.
pub(crate) struct ValueNode<A> {
    id: VertexId,
    kind: NodeKind,
    visited: Cell<bool>,
    eval: Cell<Eval>,
    evaluations: Cell<u64>,
    memo: RefCell<Option<A>>,
    /// Staged by a sink; survives memo resets until commit or abandon.
    fired: RefCell<Option<A>>,
    rule: RefCell<Rule<A>>,
    held: RefCell<Held<A>>,
}

impl<A: Clone + 'static> ValueNode<A> {
    pub(crate) fn new(id: VertexId, kind: NodeKind, rule: Rule<A>, held: Held<A>) -> Self {
        Self {
            id,
            kind,
            visited: Cell::new(false),
            eval: Cell::new(Eval::Idle),
            evaluations: Cell::new(0),
            memo: RefCell::new(None),
            fired: RefCell::new(None),
            rule: RefCell::new(rule),
            held: RefCell::new(held),
        }
    }

    pub(crate) fn id(&self) -> VertexId {
        self.id
    }

    /// The value produced this transaction, if any.
    ///
    /// The rule runs at most once per transaction; later reads return the
    /// memo. A vertex that was not reached from a root has no new value,
    /// even if it is a loop that is still unresolved.
    pub(crate) fn new_value(&self) -> Result<Option<A>> {
        if let Some(a) = self.fired.borrow().as_ref() {
            return Ok(Some(a.clone()));
        }
        if !self.visited.get() {
            return Ok(None);
        }
        match self.eval.get() {
            Eval::Done => return Ok(self.memo.borrow().clone()),
            Eval::Running => return Err(StrandError::InstantaneousCycle { vertex: self.id }),
            Eval::Idle => {}
        }

        self.eval.set(Eval::Running);
        match self.pull() {
            Ok(value) => {
                *self.memo.borrow_mut() = value.clone();
                self.eval.set(Eval::Done);
                self.evaluations.set(self.evaluations.get() + 1);
                Ok(value)
            }
            Err(err) => {
                self.eval.set(Eval::Idle);
                Err(err)
            }
        }
    }

    fn pull(&self) -> Result<Option<A>> {
        let rule = self.rule.borrow();
        match &*rule {
            Rule::Sink(_) | Rule::Never => Ok(None),
            Rule::Pull(f) => f(),
            Rule::Unresolved => Err(StrandError::LoopNotResolved { vertex: self.id }),
        }
    }

    /// The committed value. Constant for the whole transaction.
    pub(crate) fn old_value(&self) -> Result<A> {
        match &*self.held.borrow() {
            Held::Value(a) => return Ok(a.clone()),
            Held::Lazy(_) => {}
            Held::Computing => return Err(StrandError::InstantaneousCycle { vertex: self.id }),
            Held::Unresolved => return Err(StrandError::LoopNotResolved { vertex: self.id }),
            // Streams keep no old value.
            Held::Absent => return Err(StrandError::VertexReleased { vertex: self.id }),
        }

        let init = match std::mem::replace(&mut *self.held.borrow_mut(), Held::Computing) {
            Held::Lazy(init) => init,
            other => {
                *self.held.borrow_mut() = other;
                return Err(StrandError::InstantaneousCycle { vertex: self.id });
            }
        };
        match init() {
            Ok(a) => {
                *self.held.borrow_mut() = Held::Value(a.clone());
                Ok(a)
            }
            Err(err) => {
                *self.held.borrow_mut() = Held::Lazy(init);
                Err(err)
            }
        }
    }

    /// Stage a firing of a sink for the running transaction.
    pub(crate) fn stage(&self, value: A) -> Result<()> {
        let previous = self.fired.borrow_mut().take();
        let next = match previous {
            None => value,
            Some(prev) => {
                let rule = self.rule.borrow();
                match &*rule {
                    Rule::Sink(Some(coalesce)) => coalesce(prev, value),
                    _ => {
                        *self.fired.borrow_mut() = Some(prev);
                        return Err(StrandError::DuplicateFiring { vertex: self.id });
                    }
                }
            }
        };
        *self.fired.borrow_mut() = Some(next);
        Ok(())
    }

    /// Bind an unresolved loop. Cell loops also get their old value source.
    pub(crate) fn resolve(&self, pull: PullFn<A>, init: Option<LazyInit<A>>) -> Result<()> {
        // A rule that is borrowed is being evaluated, so it is not a loop
        // waiting for its source.
        let mut rule = self
            .rule
            .try_borrow_mut()
            .map_err(|_| StrandError::LoopAlreadyResolved { vertex: self.id })?;
        if !matches!(*rule, Rule::Unresolved) {
            return Err(StrandError::LoopAlreadyResolved { vertex: self.id });
        }
        *rule = Rule::Pull(pull);
        if let Some(init) = init {
            *self.held.borrow_mut() = Held::Lazy(init);
        }
        Ok(())
    }

    pub(crate) fn is_resolved(&self) -> bool {
        !matches!(*self.rule.borrow(), Rule::Unresolved)
    }

    fn reset(&self) {
        *self.memo.borrow_mut() = None;
        self.eval.set(Eval::Idle);
    }
}

impl<A: Clone + 'static> VertexBody for ValueNode<A> {
    fn visit(&self) {
        self.reset();
        self.visited.set(true);
    }

    fn is_visited(&self) -> bool {
        self.visited.get()
    }

    fn process(&self) -> Result<()> {
        self.new_value().map(|_| ())
    }

    fn notify(&self) -> Result<()> {
        // Cells settle their new value before anything is committed, because
        // their rule may read sources that commit first.
        if self.kind == NodeKind::Cell {
            self.new_value()?;
        }
        Ok(())
    }

    fn update(&self) {
        let fired = self.fired.borrow_mut().take();
        let new = fired.or_else(|| {
            if self.eval.get() == Eval::Done {
                self.memo.borrow_mut().take()
            } else {
                None
            }
        });
        if let (NodeKind::Cell, Some(a)) = (self.kind, new) {
            *self.held.borrow_mut() = Held::Value(a);
        }
        self.reset();
        self.visited.set(false);
    }

    fn abandon(&self) {
        *self.fired.borrow_mut() = None;
        self.reset();
        self.visited.set(false);
    }

    fn describe(&self) -> String {
        let held = match &*self.held.borrow() {
            Held::Absent => "-",
            Held::Value(_) => "value",
            Held::Lazy(_) => "lazy",
            Held::Computing => "computing",
            Held::Unresolved => "unresolved",
        };
        format!(
            "visited={} eval={:?} memo={} fired={} old={} evals={}",
            self.visited.get(),
            self.eval.get(),
            self.memo.borrow().is_some(),
            self.fired.borrow().is_some(),
            held,
            self.evaluations.get()
        )
    }
}

impl<A> fmt::Debug for ValueNode<A> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValueNode")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("visited", &self.visited.get())
            .finish()
    }
}

/// Weak read access to a source vertex, held by the rules of its dependents.
pub(crate) struct Upstream<A> {
    id: VertexId,
    node: Weak<ValueNode<A>>,
}

impl<A> Clone for Upstream<A> {
    fn clone(&self) -> Self {
        Self {
            id: self.id,
            node: self.node.clone(),
        }
    }
}

impl<A: Clone + 'static> Upstream<A> {
    pub(crate) fn new(node: &Rc<ValueNode<A>>) -> Self {
        Self {
            id: node.id(),
            node: Rc::downgrade(node),
        }
    }

    fn get(&self) -> Result<Rc<ValueNode<A>>> {
        self.node
            .upgrade()
            .ok_or(StrandError::VertexReleased { vertex: self.id })
    }

    pub(crate) fn new_value(&self) -> Result<Option<A>> {
        self.get()?.new_value()
    }

    pub(crate) fn old_value(&self) -> Result<A> {
        self.get()?.old_value()
    }

    /// The new value if the source fired, otherwise its old value.
    pub(crate) fn latest(&self) -> Result<A> {
        let node = self.get()?;
        match node.new_value()? {
            Some(a) => Ok(a),
            None => node.old_value(),
        }
    }
}
