//! Vertex Registry
//!
//! The registry is the arena that owns every vertex. Slots are reused through
//! a free list; ids carry a generation so a stale id reads as "gone" instead of
//! aliasing a newer vertex.
//!
//! # Edges and lifetimes
//!
//! `add_dependent`/`remove_dependent` are the only way propagation edges
//! change, and each one pairs with exactly one lifetime acquire/release on the
//! source. A vertex is freed once neither a user handle (`external`) nor
//! another vertex (`structural`) holds it. Freeing cascades into whatever the
//! freed vertex kept alive.
//!
//! While a transaction is open, frees are deferred: the vertex stays in its
//! slot with a zero count and is swept when the outermost transaction ends.
//!
//! # Borrowing
//!
//! The registry sits in a thread-local `RefCell`. No user code ever runs while
//! it is borrowed: freed bodies are handed back to the caller as [`Reclaimed`]
//! and dropped after the borrow ends, because dropping a body drops user
//! closures whose captures may reach back into the graph.

use std::cell::RefCell;
use std::collections::HashSet;
use std::rc::Rc;

use serde::Serialize;
use tracing::{debug, trace};

use super::node::{Node, NodeKind, Rank, VertexId};
use crate::error::{Result, StrandError};
use crate::vertex::VertexBody;

thread_local! {
    static GRAPH: RefCell<Graph> = RefCell::new(Graph::new());
}

/// Bodies of freed vertices, dropped once the registry borrow is released.
#[must_use = "reclaimed bodies must be dropped outside the registry borrow"]
pub(crate) struct Reclaimed(Vec<Rc<dyn VertexBody>>);

impl Reclaimed {
    fn none() -> Self {
        Self(Vec::new())
    }

    pub(crate) fn from_bodies(bodies: Vec<Rc<dyn VertexBody>>) -> Self {
        Self(bodies)
    }

    pub(crate) fn len(&self) -> usize {
        self.0.len()
    }
}

/// Counters describing the registry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct GraphStats {
    /// Vertices currently in the registry.
    pub live_vertices: usize,
    /// Listener vertices currently in the registry.
    pub live_listeners: usize,
    /// Vertices freed since the thread started.
    pub released_total: u64,
    /// Cycle collections run since the thread started.
    pub cycle_collections: u64,
}

/// Result of inserting a propagation edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct EdgeChange {
    /// The edge was new (and a lifetime acquire happened).
    pub(crate) inserted: bool,
    /// Ranks downstream of the dependent were raised.
    pub(crate) reranked: bool,
}

struct Slot {
    generation: u32,
    node: Option<Node>,
}

/// The vertex arena.
pub(crate) struct Graph {
    slots: Vec<Slot>,
    free_list: Vec<u32>,
    /// Open transactions; frees wait while this is non-zero.
    deferral: u32,
    pending_release: Vec<VertexId>,
    collection_requested: bool,
    rank_epoch: u64,
    released_total: u64,
    cycle_collections: u64,
}

impl Graph {
    fn new() -> Self {
        Self {
            slots: Vec::new(),
            free_list: Vec::new(),
            deferral: 0,
            pending_release: Vec::new(),
            collection_requested: false,
            rank_epoch: 0,
            released_total: 0,
            cycle_collections: 0,
        }
    }

    /// Insert a vertex whose body needs to know its own id.
    pub(crate) fn insert_with<T, F>(&mut self, kind: NodeKind, build: F) -> (VertexId, Rc<T>)
    where
        T: VertexBody + 'static,
        F: FnOnce(VertexId) -> Rc<T>,
    {
        let id = match self.free_list.pop() {
            Some(index) => {
                let slot = &mut self.slots[index as usize];
                slot.generation = slot.generation.wrapping_add(1);
                VertexId::from_parts(index, slot.generation)
            }
            None => {
                let index = self.slots.len() as u32;
                self.slots.push(Slot {
                    generation: 0,
                    node: None,
                });
                VertexId::from_parts(index, 0)
            }
        };

        let body = build(id);
        let erased: Rc<dyn VertexBody> = body.clone();
        self.slots[id.index() as usize].node = Some(Node::new(id, kind, erased));
        trace!(vertex = %id, ?kind, "vertex created");
        (id, body)
    }

    pub(crate) fn node(&self, id: VertexId) -> Option<&Node> {
        self.slots
            .get(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_ref())
    }

    pub(crate) fn node_mut(&mut self, id: VertexId) -> Option<&mut Node> {
        self.slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())
            .and_then(|slot| slot.node.as_mut())
    }

    fn live(&self, id: VertexId) -> Result<&Node> {
        self.node(id).ok_or(StrandError::VertexReleased { vertex: id })
    }

    fn live_mut(&mut self, id: VertexId) -> Result<&mut Node> {
        self.node_mut(id).ok_or(StrandError::VertexReleased { vertex: id })
    }

    pub(crate) fn contains(&self, id: VertexId) -> bool {
        self.node(id).is_some()
    }

    pub(crate) fn rank(&self, id: VertexId) -> Option<Rank> {
        self.node(id).map(|n| n.rank)
    }

    pub(crate) fn body(&self, id: VertexId) -> Option<Rc<dyn VertexBody>> {
        self.node(id).map(|n| n.body.clone())
    }

    pub(crate) fn rank_epoch(&self) -> u64 {
        self.rank_epoch
    }

    pub(crate) fn set_name(&mut self, id: VertexId, name: String) {
        if let Some(node) = self.node_mut(id) {
            node.name = Some(name);
        }
    }

    pub(crate) fn name(&self, id: VertexId) -> Option<String> {
        self.node(id).and_then(|n| n.name.clone())
    }

    pub(crate) fn describe(&self, id: VertexId) -> String {
        self.node(id)
            .map(Node::describe)
            .unwrap_or_else(|| format!("{id} (released)"))
    }

    /// Add a propagation edge: `dependent` is visited whenever `source` is.
    ///
    /// Idempotent. A new edge acquires `source` on behalf of `dependent` and
    /// raises ranks downstream of `dependent` until they sit above `source`.
    pub(crate) fn add_dependent(
        &mut self,
        source: VertexId,
        dependent: VertexId,
    ) -> Result<EdgeChange> {
        self.live(dependent)?;
        let src = self.live_mut(source)?;
        let limit = src.rank;
        let inserted = src.dependents.insert(dependent);
        if inserted {
            src.structural += 1;
            self.live_mut(dependent)?.keeps.push(source);
        }
        let reranked = self.ensure_bigger_than(dependent, limit);
        Ok(EdgeChange { inserted, reranked })
    }

    /// Remove a propagation edge and release the hold it carried.
    pub(crate) fn remove_dependent(&mut self, source: VertexId, dependent: VertexId) -> Reclaimed {
        let removed = self
            .node_mut(source)
            .map(|src| src.dependents.shift_remove(&dependent))
            .unwrap_or(false);
        if !removed {
            return Reclaimed::none();
        }
        if let Some(dep) = self.node_mut(dependent) {
            dep.forget_kept(source);
        }
        self.release_structural(source)
    }

    /// Lifetime-only link: `holder` keeps `target` alive without becoming one
    /// of its dependents.
    pub(crate) fn keep_alive(&mut self, holder: VertexId, target: VertexId) -> Result<()> {
        self.live(holder)?;
        self.live_mut(target)?.structural += 1;
        self.live_mut(holder)?.keeps.push(target);
        Ok(())
    }

    pub(crate) fn acquire_external(&mut self, id: VertexId) {
        if let Some(node) = self.node_mut(id) {
            node.external += 1;
        }
    }

    pub(crate) fn release_external(&mut self, id: VertexId) -> Reclaimed {
        match self.node_mut(id) {
            Some(node) => {
                node.external = node.external.saturating_sub(1);
                self.maybe_free(id)
            }
            None => Reclaimed::none(),
        }
    }

    fn release_structural(&mut self, id: VertexId) -> Reclaimed {
        match self.node_mut(id) {
            Some(node) => {
                node.structural = node.structural.saturating_sub(1);
                self.maybe_free(id)
            }
            None => Reclaimed::none(),
        }
    }

    fn maybe_free(&mut self, id: VertexId) -> Reclaimed {
        let unreferenced = self.node(id).map(Node::is_unreferenced).unwrap_or(false);
        if !unreferenced {
            return Reclaimed::none();
        }
        if self.deferral > 0 {
            self.pending_release.push(id);
            return Reclaimed::none();
        }
        let mut out = Vec::new();
        self.free_cascade(vec![id], &mut out);
        Reclaimed(out)
    }

    /// Free every vertex in `work`, then whatever their release leaves
    /// unreferenced.
    pub(crate) fn free_cascade(&mut self, mut work: Vec<VertexId>, out: &mut Vec<Rc<dyn VertexBody>>) {
        while let Some(id) = work.pop() {
            let Some(node) = self.take(id) else { continue };
            self.released_total += 1;
            trace!(vertex = %id, kind = ?node.kind(), "vertex released");

            for kept in node.keeps.iter().copied() {
                if let Some(target) = self.node_mut(kept) {
                    target.dependents.shift_remove(&id);
                    target.structural = target.structural.saturating_sub(1);
                    if target.is_unreferenced() {
                        work.push(kept);
                    }
                }
            }
            out.push(node.body);
        }
    }

    fn take(&mut self, id: VertexId) -> Option<Node> {
        let slot = self
            .slots
            .get_mut(id.index() as usize)
            .filter(|slot| slot.generation == id.generation())?;
        let node = slot.node.take()?;
        self.free_list.push(id.index());
        Some(node)
    }

    /// Raise `start` above `limit`, and its dependents above it in turn.
    ///
    /// A vertex already above the limit, or already raised during this call,
    /// stops the walk, so dependency loops terminate.
    fn ensure_bigger_than(&mut self, start: VertexId, limit: Rank) -> bool {
        let mut raised = HashSet::new();
        let mut work = vec![(start, limit)];
        while let Some((id, limit)) = work.pop() {
            let Some(node) = self.node_mut(id) else { continue };
            if node.rank > limit || !raised.insert(id) {
                continue;
            }
            node.rank = limit.next();
            let rank = node.rank;
            work.extend(node.dependents.iter().map(|d| (*d, rank)));
        }
        let changed = !raised.is_empty();
        if changed {
            self.rank_epoch += 1;
        }
        changed
    }

    pub(crate) fn begin_deferral(&mut self) {
        self.deferral += 1;
    }

    /// Close one deferral level. At the outermost level, sweep pending frees
    /// and run a requested cycle collection.
    pub(crate) fn end_deferral(&mut self) -> Reclaimed {
        self.deferral = self.deferral.saturating_sub(1);
        if self.deferral > 0 {
            return Reclaimed::none();
        }

        let pending: Vec<VertexId> = std::mem::take(&mut self.pending_release)
            .into_iter()
            .filter(|id| self.node(*id).map(Node::is_unreferenced).unwrap_or(false))
            .collect();
        let mut out = Vec::new();
        if !pending.is_empty() {
            debug!(count = pending.len(), "sweeping deferred releases");
            self.free_cascade(pending, &mut out);
        }
        if std::mem::take(&mut self.collection_requested) {
            out.extend(self.collect_cycles().0);
        }
        Reclaimed(out)
    }

    pub(crate) fn is_deferring(&self) -> bool {
        self.deferral > 0
    }

    pub(crate) fn request_collection(&mut self) {
        self.collection_requested = true;
    }

    pub(crate) fn note_collection(&mut self) {
        self.cycle_collections += 1;
    }

    /// Iterate the live vertices.
    pub(crate) fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.slots.iter().filter_map(|slot| slot.node.as_ref())
    }

    pub(crate) fn stats(&self) -> GraphStats {
        GraphStats {
            live_vertices: self.nodes().count(),
            live_listeners: self
                .nodes()
                .filter(|n| n.kind() == NodeKind::Listener)
                .count(),
            released_total: self.released_total,
            cycle_collections: self.cycle_collections,
        }
    }
}

/// Borrow the registry.
pub(crate) fn with<R>(f: impl FnOnce(&Graph) -> R) -> R {
    GRAPH.with(|g| f(&g.borrow()))
}

/// Borrow the registry mutably.
pub(crate) fn with_mut<R>(f: impl FnOnce(&mut Graph) -> R) -> R {
    GRAPH.with(|g| f(&mut g.borrow_mut()))
}

/// Run a registry operation that may free vertices, dropping the freed
/// bodies after the borrow ends. Quietly does nothing once the thread-local
/// registry has been torn down.
pub(crate) fn reclaim(f: impl FnOnce(&mut Graph) -> Reclaimed) {
    if let Ok(reclaimed) = GRAPH.try_with(|g| f(&mut g.borrow_mut())) {
        if reclaimed.len() > 0 {
            trace!(freed = reclaimed.len(), "dropping reclaimed bodies");
        }
        drop(reclaimed);
    }
}

/// Snapshot of the registry counters for this thread.
pub fn stats() -> GraphStats {
    with(Graph::stats)
}

/// Number of live listener registrations on this thread.
pub fn total_registrations() -> usize {
    with(|g| g.stats().live_listeners)
}
