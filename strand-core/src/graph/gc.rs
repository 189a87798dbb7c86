//! Lifetime Manager
//!
//! Reference counting frees a vertex as soon as nothing holds it, but it can
//! not reclaim a group of vertices that only hold each other (a resolved loop
//! whose handles were all dropped). Cycle collection handles those:
//!
//! 1. Mark every vertex held by a user handle (`external > 0`).
//! 2. Follow each marked vertex's trace list (`keeps`) and mark what it
//!    keeps alive, transitively.
//! 3. Every unmarked vertex is garbage. Free it, which removes it from the
//!    dependent sets of what it kept alive and releases those holds.
//!
//! Collection only runs when no transaction is open. A request made inside a
//! transaction is carried out when the outermost transaction ends.

use std::collections::HashSet;

use tracing::debug;

use super::node::VertexId;
use super::registry::{self, Graph, Reclaimed};

impl Graph {
    /// Mark from the externally held vertices and free everything unmarked.
    pub(crate) fn collect_cycles(&mut self) -> Reclaimed {
        let mut marked: HashSet<VertexId> = HashSet::new();
        let mut worklist: Vec<VertexId> = self
            .nodes()
            .filter(|n| n.external > 0)
            .map(|n| n.id())
            .collect();

        while let Some(id) = worklist.pop() {
            // Mark first so shared vertices and cycles are walked once.
            if !marked.insert(id) {
                continue;
            }
            if let Some(node) = self.node(id) {
                worklist.extend(node.keeps.iter().copied());
            }
        }

        let garbage: Vec<VertexId> = self
            .nodes()
            .map(|n| n.id())
            .filter(|id| !marked.contains(id))
            .collect();

        self.note_collection();
        debug!(
            marked = marked.len(),
            garbage = garbage.len(),
            "cycle collection"
        );

        let mut out = Vec::new();
        self.free_cascade(garbage, &mut out);
        Reclaimed::from_bodies(out)
    }
}

/// Reclaim vertices that only keep each other alive.
///
/// Runs immediately when no transaction is open on this thread; otherwise it
/// is scheduled for the end of the outermost transaction.
pub fn collect_cycles() {
    registry::reclaim(|g| {
        if g.is_deferring() {
            g.request_collection();
            Reclaimed::from_bodies(Vec::new())
        } else {
            g.collect_cycles()
        }
    });
}

/// An external hold on a vertex.
///
/// Every user-facing handle owns one. Creating or cloning it acquires the
/// vertex; dropping it releases the vertex, which frees it once nothing else
/// holds it.
pub(crate) struct Retain {
    id: VertexId,
}

impl Retain {
    pub(crate) fn new(id: VertexId) -> Self {
        registry::with_mut(|g| g.acquire_external(id));
        Self { id }
    }

    pub(crate) fn id(&self) -> VertexId {
        self.id
    }
}

impl Clone for Retain {
    fn clone(&self) -> Self {
        Self::new(self.id)
    }
}

impl Drop for Retain {
    fn drop(&mut self) {
        registry::reclaim(|g| g.release_external(self.id));
    }
}
