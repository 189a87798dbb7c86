//! Topological Traversal
//!
//! The traversal determines which vertices a transaction has to visit and in
//! what order. It ensures that sources always come before their dependents.
//!
//! # Algorithm
//!
//! We run a depth-first search from the root set following `dependents`
//! edges:
//!
//! 1. Each vertex is entered at most once per pass (a pass-local seen set),
//!    so a vertex reachable along two paths is still listed once.
//! 2. A vertex is appended to the post-order list after all of its
//!    dependents have been appended.
//! 3. Reading the post-order list back to front yields sources first.
//!
//! The search is iterative so deep chains cannot overflow the stack. Loops in
//! the dependent graph (a stream looped back into itself) terminate through
//! the seen set; detecting that such a loop is instantaneous is left to value
//! evaluation.

use std::collections::HashSet;

use super::node::VertexId;
use super::registry::Graph;

/// Every vertex reachable from `roots`, sources before dependents.
///
/// Roots that are no longer in the registry are skipped.
pub(crate) fn topological_order(graph: &Graph, roots: &[VertexId]) -> Vec<VertexId> {
    let mut seen: HashSet<VertexId> = HashSet::new();
    let mut post_order = Vec::new();
    let mut stack: Vec<(VertexId, usize)> = Vec::new();

    for &root in roots {
        if !graph.contains(root) || !seen.insert(root) {
            continue;
        }
        stack.push((root, 0));

        while let Some(top) = stack.last_mut() {
            let (id, cursor) = *top;
            let child = graph
                .node(id)
                .and_then(|n| n.dependents.get_index(cursor).copied());
            match child {
                Some(child) => {
                    top.1 += 1;
                    if graph.contains(child) && seen.insert(child) {
                        stack.push((child, 0));
                    }
                }
                None => {
                    stack.pop();
                    post_order.push(id);
                }
            }
        }
    }

    post_order.reverse();
    post_order
}
