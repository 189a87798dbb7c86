//! Transactions
//!
//! A transaction is the unit of propagation: every firing inside one
//! [`run`] call is processed together, and every observer sees one
//! consistent set of values.
//!
//! # Closing a transaction
//!
//! 1. **Drain.** Roots (fired sinks) are expanded into everything reachable
//!    from them by a depth-first traversal. Each reached vertex is marked
//!    visited and queued for a visit at its rank. The queue is drained lowest
//!    rank first, one batch per rank, one bundle per vertex. When the queue
//!    is empty the queued `sample` callbacks run, and the loop repeats until
//!    roots, queue and samples are all empty.
//! 2. **Resort.** If an action adds an edge out of a vertex this transaction
//!    already reached, or asks for it with [`Transaction::request_resort`],
//!    the traversal is redone from every vertex still waiting, the current
//!    vertex and the mutated sources. Finished vertices keep their values.
//!    A root fired after the drain started (from a sample or a prioritized
//!    action) is different: the vertices it reaches are recomputed, even
//!    those already processed, so their values include the new firing.
//! 3. **Last.** `last` callbacks run once, in registration order. Work they
//!    schedule is deferred to the post phase.
//! 4. **Commit.** Every reached vertex is notified (cells settle, listeners
//!    fire) and then updated (cells commit, memos clear).
//! 5. **Post.** `post` callbacks run in index order. Index 0 runs outside any
//!    transaction; other indices each get a fresh nested transaction.
//!
//! An error in drain or last abandons the transaction: staged firings and
//! memos are dropped and nothing is committed. Errors always leave the
//! ambient transaction pointer restored.

mod context;
mod queue;

pub use context::{current, is_active, on_start, run};
pub(crate) use context::{on_edge_added, with_current};

use std::cell::{Cell, RefCell};
use std::collections::{BTreeMap, HashSet, VecDeque};
use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;
use tracing::{debug, trace, warn};

use self::queue::{Action, ActionQueue, Bundle};
use crate::config;
use crate::error::{Result, StrandError};
use crate::graph::registry;
use crate::graph::scheduler;
use crate::graph::{Rank, VertexId};
use crate::vertex::VertexBody;

/// Post index for work pushed out of the last and commit phases. It runs
/// after every other post, in its own nested transaction.
pub const DEFERRED: usize = usize::MAX;

/// A callback scheduled on a transaction.
pub type Callback = Box<dyn FnOnce() -> Result<()>>;

thread_local! {
    static NEXT_SERIAL: Cell<u64> = const { Cell::new(0) };
}

/// Where a transaction is in its life cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Phase {
    /// The body of `run` is executing.
    Open,
    Draining,
    Last,
    Commit,
    Post,
    Closed,
}

struct Inner {
    serial: u64,
    phase: Cell<Phase>,
    finished: Cell<bool>,
    resort_requested: Cell<bool>,
    resorts: Cell<u32>,
    roots: RefCell<IndexSet<VertexId>>,
    /// Vertices to traverse from again after a resort.
    revisits: RefCell<IndexSet<VertexId>>,
    /// Sources that gained an edge while the drain was running.
    mutated: RefCell<Vec<VertexId>>,
    touched: RefCell<IndexSet<VertexId>>,
    processed: RefCell<HashSet<VertexId>>,
    queue: RefCell<ActionQueue>,
    samples: RefCell<VecDeque<Callback>>,
    lasts: RefCell<VecDeque<Callback>>,
    posts: RefCell<BTreeMap<usize, Vec<Callback>>>,
}

/// Handle to a transaction.
#[derive(Clone)]
pub struct Transaction {
    inner: Rc<Inner>,
}

impl Transaction {
    pub(crate) fn new() -> Self {
        let epoch = registry::with_mut(|g| {
            g.begin_deferral();
            g.rank_epoch()
        });
        let serial = NEXT_SERIAL.with(|n| {
            let serial = n.get();
            n.set(serial + 1);
            serial
        });
        debug!(tx = serial, "transaction start");

        Self {
            inner: Rc::new(Inner {
                serial,
                phase: Cell::new(Phase::Open),
                finished: Cell::new(false),
                resort_requested: Cell::new(false),
                resorts: Cell::new(0),
                roots: RefCell::new(IndexSet::new()),
                revisits: RefCell::new(IndexSet::new()),
                mutated: RefCell::new(Vec::new()),
                touched: RefCell::new(IndexSet::new()),
                processed: RefCell::new(HashSet::new()),
                queue: RefCell::new(ActionQueue::new(epoch)),
                samples: RefCell::new(VecDeque::new()),
                lasts: RefCell::new(VecDeque::new()),
                posts: RefCell::new(BTreeMap::new()),
            }),
        }
    }

    /// Run `f` in the ambient transaction, opening one if needed.
    pub fn run<R>(f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
        context::run(f)
    }

    /// Sequence number of this transaction on its thread.
    pub fn serial(&self) -> u64 {
        self.inner.serial
    }

    pub fn phase(&self) -> Phase {
        self.inner.phase.get()
    }

    pub(crate) fn is_finished(&self) -> bool {
        self.inner.finished.get()
    }

    /// Whether sinks may still fire into this transaction.
    pub(crate) fn accepts_firings(&self) -> bool {
        matches!(self.phase(), Phase::Open | Phase::Draining)
    }

    /// Mark a vertex as fired. It and everything reachable from it is visited
    /// when the transaction drains.
    pub fn add_root(&self, vertex: VertexId) -> Result<()> {
        if !registry::with(|g| g.contains(vertex)) {
            return Err(StrandError::VertexReleased { vertex });
        }
        if self.accepts_firings() {
            self.inner.roots.borrow_mut().insert(vertex);
        } else {
            self.defer(move |tx| tx.add_root(vertex));
        }
        Ok(())
    }

    /// Schedule `action` at the rank of `vertex`.
    pub fn prioritized<F>(&self, vertex: VertexId, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        let rank = registry::with(|g| g.rank(vertex))
            .ok_or(StrandError::VertexReleased { vertex })?;
        if self.accepts_firings() {
            self.inner
                .queue
                .borrow_mut()
                .push_action(vertex, rank, Box::new(action));
        } else {
            self.defer(move |tx| tx.prioritized(vertex, action));
        }
        Ok(())
    }

    /// Run `callback` once the prioritized queue is empty. It may schedule
    /// more prioritized work or samples.
    pub fn sample<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        if self.accepts_firings() {
            self.inner.samples.borrow_mut().push_back(Box::new(callback));
        } else {
            self.defer(move |tx| {
                tx.sample(callback);
                Ok(())
            });
        }
    }

    /// Run `callback` once after the drain reaches its fixed point.
    pub fn last<F>(&self, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        if self.phase() <= Phase::Last {
            self.inner.lasts.borrow_mut().push_back(Box::new(callback));
        } else {
            self.defer(move |tx| {
                tx.last(callback);
                Ok(())
            });
        }
    }

    /// Run `callback` after commit. Callbacks run in ascending `index` order
    /// and in registration order within an index.
    pub fn post<F>(&self, index: usize, callback: F)
    where
        F: FnOnce() -> Result<()> + 'static,
    {
        if self.is_finished() {
            warn!(tx = self.serial(), index, "post on a closed transaction dropped");
            return;
        }
        self.inner
            .posts
            .borrow_mut()
            .entry(index)
            .or_default()
            .push(Box::new(callback));
    }

    /// Push work scheduled too late for this transaction into a nested one.
    fn defer<F>(&self, f: F)
    where
        F: FnOnce(&Transaction) -> Result<()> + 'static,
    {
        trace!(tx = self.serial(), phase = ?self.phase(), "deferred to post");
        self.post(DEFERRED, move || with_current(f));
    }

    /// Ask the drain to redo its traversal before the next batch.
    pub fn request_resort(&self) -> Result<()> {
        if self.phase() != Phase::Draining {
            return Err(StrandError::ResortOutsideDrain { phase: self.phase() });
        }
        self.inner.resort_requested.set(true);
        Ok(())
    }

    /// Run cycle collection when the outermost transaction ends.
    pub fn request_cycle_collection(&self) {
        registry::with_mut(|g| g.request_collection());
    }

    /// An edge out of `source` was added.
    pub(crate) fn note_new_edge(&self, source: VertexId) {
        if self.phase() == Phase::Draining && self.inner.touched.borrow().contains(&source) {
            self.inner.mutated.borrow_mut().push(source);
            self.inner.resort_requested.set(true);
        }
    }

    pub(crate) fn close(&self) -> Result<()> {
        let settled = self.drain().and_then(|()| self.run_lasts());
        if let Err(err) = settled {
            warn!(tx = self.serial(), %err, "transaction abandoned");
            self.abandon();
            return Err(err);
        }
        let result = self.commit().and_then(|()| self.run_posts());
        self.finish();
        result
    }

    fn drain(&self) -> Result<()> {
        self.inner.phase.set(Phase::Draining);
        loop {
            if self.inner.resort_requested.replace(false) {
                self.resort(None);
            }
            if !self.inner.roots.borrow().is_empty() || !self.inner.revisits.borrow().is_empty() {
                self.traverse();
                continue;
            }

            let batch = self.next_batch();
            if !batch.is_empty() {
                self.run_batch(batch)?;
                continue;
            }

            let samples: Vec<Callback> = self.inner.samples.borrow_mut().drain(..).collect();
            if samples.is_empty() && !self.inner.resort_requested.get() {
                break;
            }
            for sample in samples {
                sample()?;
            }
        }
        trace!(
            tx = self.serial(),
            touched = self.inner.touched.borrow().len(),
            resorts = self.inner.resorts.get(),
            "drained"
        );
        Ok(())
    }

    /// Expand the roots into every reachable vertex and queue their visits.
    ///
    /// A processed vertex is skipped unless a fired root reaches it; then its
    /// memo is reset and it is queued again.
    fn traverse(&self) {
        let roots: Vec<VertexId> = self.inner.roots.borrow_mut().drain(..).collect();
        let revisits: Vec<VertexId> = self.inner.revisits.borrow_mut().drain(..).collect();
        let (reached, stale) = registry::with(|g| {
            let stale: HashSet<VertexId> = scheduler::topological_order(g, &roots)
                .into_iter()
                .collect();
            let start: Vec<VertexId> = roots.iter().chain(revisits.iter()).copied().collect();
            let reached: Vec<(VertexId, Rank, Rc<dyn VertexBody>)> =
                scheduler::topological_order(g, &start)
                    .into_iter()
                    .filter_map(|id| g.node(id).map(|n| (id, n.rank, n.body.clone())))
                    .collect();
            (reached, stale)
        });

        if config::debug_enabled() {
            let described: Vec<String> =
                registry::with(|g| reached.iter().map(|(id, _, _)| g.describe(*id)).collect());
            debug!(tx = self.serial(), ?roots, ?revisits, order = ?described, "traversal");
        } else {
            trace!(tx = self.serial(), ?roots, reached = reached.len(), "traversal");
        }

        let mut processed = self.inner.processed.borrow_mut();
        let mut touched = self.inner.touched.borrow_mut();
        let mut queue = self.inner.queue.borrow_mut();
        for (id, rank, body) in reached {
            if processed.contains(&id) {
                if !stale.contains(&id) {
                    continue;
                }
                debug!(tx = self.serial(), vertex = %id, "re-processing");
                processed.remove(&id);
                touched.insert(id);
                body.visit();
            } else if touched.insert(id) {
                body.visit();
            }
            queue.push_visit(id, rank);
        }
    }

    fn next_batch(&self) -> Vec<Bundle> {
        let epoch = registry::with(|g| g.rank_epoch());
        let mut queue = self.inner.queue.borrow_mut();
        if queue.is_stale(epoch) {
            trace!(tx = self.serial(), queued = queue.len(), "re-keying action queue");
            registry::with(|g| queue.rerank(epoch, |id| g.rank(id).unwrap_or(Rank::SOURCE)));
        }
        queue.pop_batch()
    }

    fn run_batch(&self, batch: Vec<Bundle>) -> Result<()> {
        let mut bundles = batch.into_iter();
        while let Some(bundle) = bundles.next() {
            let vertex = bundle.vertex;
            let mut actions = bundle.actions.into_iter();
            while let Some(action) = actions.next() {
                match action {
                    Action::Visit => self.process(vertex)?,
                    Action::Run(f) => {
                        trace!(tx = self.serial(), %vertex, "action");
                        f()?;
                    }
                }

                if self.inner.resort_requested.replace(false) {
                    let unfinished = Bundle {
                        vertex,
                        actions: actions.collect(),
                    };
                    self.requeue(std::iter::once(unfinished).chain(bundles));
                    self.resort(Some(vertex));
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    fn process(&self, vertex: VertexId) -> Result<()> {
        let Some(body) = registry::with(|g| g.body(vertex)) else {
            return Ok(());
        };
        if config::debug_enabled() {
            debug!(
                tx = self.serial(),
                vertex = %registry::with(|g| g.describe(vertex)),
                "process"
            );
        }
        body.process()?;
        self.inner.processed.borrow_mut().insert(vertex);
        Ok(())
    }

    fn requeue(&self, bundles: impl Iterator<Item = Bundle>) {
        let mut queue = self.inner.queue.borrow_mut();
        for bundle in bundles {
            let rank = registry::with(|g| g.rank(bundle.vertex)).unwrap_or(Rank::SOURCE);
            queue.requeue(bundle, rank);
        }
    }

    fn resort(&self, current: Option<VertexId>) {
        self.inner.resorts.set(self.inner.resorts.get() + 1);
        let waiting = self.inner.queue.borrow().queued_vertices();
        let mutated: Vec<VertexId> = self.inner.mutated.borrow_mut().drain(..).collect();

        let mut revisits = self.inner.revisits.borrow_mut();
        revisits.extend(waiting);
        revisits.extend(current);
        revisits.extend(mutated);
        debug!(
            tx = self.serial(),
            resort = self.inner.resorts.get(),
            roots = revisits.len(),
            "resort"
        );
    }

    fn run_lasts(&self) -> Result<()> {
        self.inner.phase.set(Phase::Last);
        loop {
            let next = self.inner.lasts.borrow_mut().pop_front();
            let Some(last) = next else { break };
            last()?;
        }
        Ok(())
    }

    /// Notify every reached vertex, then update all of them.
    ///
    /// A failing notify skips the remaining notifies; the updates still run
    /// so no vertex is left mid-transaction.
    fn commit(&self) -> Result<()> {
        self.inner.phase.set(Phase::Commit);
        let touched: Vec<VertexId> = self.inner.touched.borrow().iter().copied().collect();
        let bodies: Vec<Rc<dyn VertexBody>> =
            registry::with(|g| touched.iter().filter_map(|id| g.body(*id)).collect());

        let notified = bodies
            .iter()
            .filter(|body| body.is_visited())
            .try_for_each(|body| body.notify());
        for body in &bodies {
            body.update();
        }
        self.inner.touched.borrow_mut().clear();
        self.inner.processed.borrow_mut().clear();
        debug!(tx = self.serial(), vertices = bodies.len(), "committed");
        notified
    }

    fn run_posts(&self) -> Result<()> {
        self.inner.phase.set(Phase::Post);
        loop {
            let next = self.inner.posts.borrow_mut().pop_first();
            let Some((index, callbacks)) = next else { break };
            trace!(tx = self.serial(), index, count = callbacks.len(), "post");
            for callback in callbacks {
                if index == 0 {
                    context::run_detached(callback)?;
                } else {
                    context::run_nested(callback)?;
                }
            }
        }
        Ok(())
    }

    /// Drop everything staged for this transaction and close it.
    pub(crate) fn abandon(&self) {
        if self.is_finished() {
            return;
        }
        let ids: Vec<VertexId> = {
            let touched = self.inner.touched.borrow();
            let roots = self.inner.roots.borrow();
            touched.iter().chain(roots.iter()).copied().collect()
        };
        let bodies: Vec<Rc<dyn VertexBody>> =
            registry::with(|g| ids.iter().filter_map(|id| g.body(*id)).collect());
        for body in &bodies {
            body.abandon();
        }
        debug!(tx = self.serial(), vertices = bodies.len(), "abandoned");
        self.finish();
    }

    fn finish(&self) {
        if self.inner.finished.replace(true) {
            return;
        }
        self.inner.phase.set(Phase::Closed);

        // User closures are dropped after every borrow is released.
        let actions = self.inner.queue.borrow_mut().clear();
        let samples = std::mem::take(&mut *self.inner.samples.borrow_mut());
        let lasts = std::mem::take(&mut *self.inner.lasts.borrow_mut());
        let posts = std::mem::take(&mut *self.inner.posts.borrow_mut());
        self.inner.roots.borrow_mut().clear();
        self.inner.revisits.borrow_mut().clear();
        self.inner.touched.borrow_mut().clear();
        self.inner.processed.borrow_mut().clear();
        self.inner.mutated.borrow_mut().clear();
        drop((actions, samples, lasts, posts));

        registry::reclaim(|g| g.end_deferral());
        debug!(tx = self.serial(), "transaction end");
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("serial", &self.inner.serial)
            .field("phase", &self.inner.phase.get())
            .field("roots", &self.inner.roots.borrow().len())
            .field("queued", &self.inner.queue.borrow().len())
            .finish()
    }
}
