//! Rank-Ordered Action Queue
//!
//! Pending work of a transaction, keyed by the rank of the vertex it belongs
//! to. The drain pops the whole lowest-rank set at once and groups it into
//! one bundle per vertex, so a vertex's actions fire together and a vertex is
//! never processed twice in one batch.
//!
//! Ranks can rise while the queue is non-empty (a loop resolved mid-drain).
//! The queue remembers the registry's rank epoch it was keyed under and is
//! re-keyed when that epoch moves.

use std::collections::{BTreeMap, HashSet};

use crate::error::Result;
use crate::graph::{Rank, VertexId};

/// A user action scheduled against a vertex.
pub(crate) type ActionFn = Box<dyn FnOnce() -> Result<()>>;

pub(crate) enum Action {
    /// Process the vertex itself (force its lazy value).
    Visit,
    Run(ActionFn),
}

/// Everything queued for one vertex within a batch, in registration order.
pub(crate) struct Bundle {
    pub(crate) vertex: VertexId,
    pub(crate) actions: Vec<Action>,
}

pub(crate) struct ActionQueue {
    entries: BTreeMap<(Rank, u64), (VertexId, Action)>,
    queued_visits: HashSet<VertexId>,
    next_seq: u64,
    epoch: u64,
}

impl ActionQueue {
    pub(crate) fn new(epoch: u64) -> Self {
        Self {
            entries: BTreeMap::new(),
            queued_visits: HashSet::new(),
            next_seq: 0,
            epoch,
        }
    }

    /// Queue a visit. A vertex already waiting for its visit is not queued
    /// again.
    pub(crate) fn push_visit(&mut self, vertex: VertexId, rank: Rank) -> bool {
        if !self.queued_visits.insert(vertex) {
            return false;
        }
        self.push(vertex, rank, Action::Visit);
        true
    }

    pub(crate) fn push_action(&mut self, vertex: VertexId, rank: Rank, action: ActionFn) {
        self.push(vertex, rank, Action::Run(action));
    }

    fn push(&mut self, vertex: VertexId, rank: Rank, action: Action) {
        let seq = self.next_seq;
        self.next_seq += 1;
        self.entries.insert((rank, seq), (vertex, action));
    }

    /// Put back a bundle that was popped but not finished.
    pub(crate) fn requeue(&mut self, bundle: Bundle, rank: Rank) {
        for action in bundle.actions {
            match action {
                Action::Visit => {
                    self.push_visit(bundle.vertex, rank);
                }
                Action::Run(f) => self.push_action(bundle.vertex, rank, f),
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_stale(&self, epoch: u64) -> bool {
        self.epoch != epoch
    }

    /// Re-key every entry under the current ranks, keeping registration
    /// order within a rank.
    pub(crate) fn rerank(&mut self, epoch: u64, rank_of: impl Fn(VertexId) -> Rank) {
        let entries = std::mem::take(&mut self.entries);
        self.entries = entries
            .into_iter()
            .map(|((_, seq), (vertex, action))| ((rank_of(vertex), seq), (vertex, action)))
            .collect();
        self.epoch = epoch;
    }

    /// Remove every entry of the lowest rank, grouped by vertex.
    pub(crate) fn pop_batch(&mut self) -> Vec<Bundle> {
        let Some(&(rank, _)) = self.entries.keys().next() else {
            return Vec::new();
        };

        let mut bundles: Vec<Bundle> = Vec::new();
        while let Some(entry) = self.entries.first_entry() {
            if entry.key().0 != rank {
                break;
            }
            let (vertex, action) = entry.remove();
            if matches!(action, Action::Visit) {
                self.queued_visits.remove(&vertex);
            }
            match bundles.iter_mut().find(|b| b.vertex == vertex) {
                Some(bundle) => bundle.actions.push(action),
                None => bundles.push(Bundle {
                    vertex,
                    actions: vec![action],
                }),
            }
        }
        bundles
    }

    /// Vertices still waiting for their visit.
    pub(crate) fn queued_vertices(&self) -> Vec<VertexId> {
        self.queued_visits.iter().copied().collect()
    }

    /// Empty the queue, handing back the actions so the caller can drop them
    /// outside any borrow.
    pub(crate) fn clear(&mut self) -> Vec<Action> {
        self.queued_visits.clear();
        std::mem::take(&mut self.entries)
            .into_values()
            .map(|(_, action)| action)
            .collect()
    }
}
