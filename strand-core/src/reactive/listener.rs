//! Listener Handles

use std::fmt;
use std::rc::Rc;

use super::link;
use crate::graph::{registry, NodeKind, Retain, VertexId};
use crate::vertex::ListenerNode;

/// A registered listener.
///
/// The handler stays registered for as long as this handle lives. Dropping
/// it, or calling [`unlisten`](Self::unlisten), removes the listener vertex
/// and releases the vertices it kept alive.
#[must_use = "dropping a Listener unregisters it"]
pub struct Listener {
    retain: Retain,
}

impl Listener {
    pub(crate) fn attach(source: VertexId, node: ListenerNode) -> Self {
        let (id, _) = registry::with_mut(|g| g.insert_with(NodeKind::Listener, |_| Rc::new(node)));
        let retain = Retain::new(id);
        link(source, id);
        Self { retain }
    }

    pub fn id(&self) -> VertexId {
        self.retain.id()
    }

    /// Unregister the handler.
    pub fn unlisten(self) {}

    /// Whether the listener vertex is still in the registry.
    pub fn is_registered(&self) -> bool {
        registry::with(|g| g.contains(self.id()))
    }
}

impl fmt::Debug for Listener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Listener").field(&self.id()).finish()
    }
}
