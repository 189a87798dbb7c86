//! Dependency Graph
//!
//! This module owns the vertices of the reactive network and the edges
//! between them.
//!
//! # Overview
//!
//! Every stream, cell and listener is a vertex in a central registry (an
//! arena indexed by [`VertexId`]). An edge `source -> dependent` means the
//! dependent has to be visited whenever the source may produce a value in the
//! running transaction.
//!
//! - Each vertex has a [`Rank`]; a dependent always ranks above its sources,
//!   which is what the transaction's action queue orders by.
//! - Edges double as lifetime holds: a dependent keeps its sources alive.
//! - Groups of vertices that only keep each other alive are reclaimed by
//!   [`collect_cycles`].
//!
//! # Design Decisions
//!
//! 1. We use a centralized arena rather than `Rc` links between vertices:
//!    - the graph legitimately contains cycles (resolved loops)
//!    - ranks and dependent sets can be walked without touching user values
//!    - freeing is deterministic and observable through [`stats`]
//!
//! 2. Ids carry a generation so a stale id never aliases a reused slot.
//!
//! 3. The registry only sees type-erased bodies; the typed value slots live in
//!    [`crate::vertex`].

mod gc;
mod node;
pub(crate) mod registry;
pub(crate) mod scheduler;

pub(crate) use gc::Retain;
pub use gc::collect_cycles;
pub use node::{NodeKind, Rank, VertexId};
pub use registry::{stats, total_registrations, GraphStats};
