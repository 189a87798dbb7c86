//! Graph Nodes
//!
//! This module defines the bookkeeping record the registry keeps for every
//! vertex: its identity, rank, dependent set and lifetime counters. The typed
//! value slots live in [`crate::vertex`]; the registry only sees them through
//! the type-erased [`VertexBody`] handle.

use std::fmt;
use std::rc::Rc;

use indexmap::IndexSet;
use smallvec::SmallVec;

use crate::vertex::VertexBody;

/// Identifier of a vertex in the registry.
///
/// The index names an arena slot; the generation changes every time the slot
/// is reused, so an id that outlived its vertex never aliases a newer one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct VertexId {
    index: u32,
    generation: u32,
}

impl VertexId {
    pub(crate) fn from_parts(index: u32, generation: u32) -> Self {
        Self { index, generation }
    }

    /// The arena slot backing this id.
    pub fn index(&self) -> u32 {
        self.index
    }

    pub(crate) fn generation(&self) -> u32 {
        self.generation
    }
}

impl fmt::Display for VertexId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "v{}", self.index)
    }
}

/// Scheduling priority of a vertex.
///
/// A vertex always ranks above every vertex it depends on, so ascending rank
/// order is a valid topological order of the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub struct Rank(u64);

impl Rank {
    /// Rank of a vertex with no sources.
    pub const SOURCE: Rank = Rank(0);

    /// The smallest rank strictly above this one.
    pub fn next(self) -> Rank {
        Rank(self.0 + 1)
    }

    /// Raw rank value.
    pub fn raw(self) -> u64 {
        self.0
    }
}

/// The kind of vertex in the dependency graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NodeKind {
    /// An event vertex. Holds at most one new value per transaction.
    Stream,

    /// A continuous vertex. Adds an old value that only changes at commit.
    Cell,

    /// A terminal vertex that hands values to an external handler.
    /// Listeners have no dependents of their own.
    Listener,
}

/// A vertex record in the registry.
pub(crate) struct Node {
    /// Identity of this vertex.
    id: VertexId,

    /// What kind of vertex this is.
    kind: NodeKind,

    /// Scheduling priority.
    pub(crate) rank: Rank,

    /// Optional label for the debug trace.
    pub(crate) name: Option<String>,

    /// Vertices to visit when this vertex may produce a value.
    pub(crate) dependents: IndexSet<VertexId>,

    /// Vertices this vertex keeps alive: its sources plus any lifetime-only
    /// links. This is the trace list walked by cycle collection.
    pub(crate) keeps: SmallVec<[VertexId; 2]>,

    /// Handles held by user code.
    pub(crate) external: usize,

    /// Holds from other vertices (dependent edges and lifetime-only links).
    pub(crate) structural: usize,

    /// The typed value slots.
    pub(crate) body: Rc<dyn VertexBody>,
}

impl Node {
    pub(crate) fn new(id: VertexId, kind: NodeKind, body: Rc<dyn VertexBody>) -> Self {
        Self {
            id,
            kind,
            rank: Rank::SOURCE,
            name: None,
            dependents: IndexSet::new(),
            keeps: SmallVec::new(),
            external: 0,
            structural: 0,
            body,
        }
    }

    /// Get the vertex's ID.
    pub(crate) fn id(&self) -> VertexId {
        self.id
    }

    /// Get the vertex's kind.
    pub(crate) fn kind(&self) -> NodeKind {
        self.kind
    }

    /// No handle and no other vertex holds this one.
    pub(crate) fn is_unreferenced(&self) -> bool {
        self.external == 0 && self.structural == 0
    }

    /// Remove a single occurrence of `target` from the trace list.
    pub(crate) fn forget_kept(&mut self, target: VertexId) -> bool {
        match self.keeps.iter().position(|k| *k == target) {
            Some(pos) => {
                self.keeps.remove(pos);
                true
            }
            None => false,
        }
    }

    /// One-line summary for the debug trace.
    pub(crate) fn describe(&self) -> String {
        format!(
            "{:?} {} [{}] rank={} {}",
            self.kind,
            self.id,
            self.name.as_deref().unwrap_or("unnamed"),
            self.rank.raw(),
            self.body.describe()
        )
    }
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("rank", &self.rank)
            .field("dependents", &self.dependents)
            .field("keeps", &self.keeps)
            .field("external", &self.external)
            .field("structural", &self.structural)
            .finish()
    }
}
