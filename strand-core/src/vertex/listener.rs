//! Listener Bodies
//!
//! A listener is a terminal vertex: it has no dependents and no value of its
//! own. When its source was reached in a transaction, `notify` reads the
//! source's final new value and hands it to the external handler.

use std::cell::Cell;

use super::{Upstream, VertexBody};
use crate::error::Result;

pub(crate) struct ListenerNode {
    visited: Cell<bool>,
    delivered: Cell<u64>,
    deliver: Box<dyn Fn() -> Result<bool>>,
}

impl ListenerNode {
    pub(crate) fn new<A, F>(source: Upstream<A>, handler: F) -> Self
    where
        A: Clone + 'static,
        F: Fn(&A) + 'static,
    {
        let deliver = move || match source.new_value()? {
            Some(a) => {
                handler(&a);
                Ok(true)
            }
            None => Ok(false),
        };
        Self {
            visited: Cell::new(false),
            delivered: Cell::new(0),
            deliver: Box::new(deliver),
        }
    }
}

impl VertexBody for ListenerNode {
    fn visit(&self) {
        self.visited.set(true);
    }

    fn is_visited(&self) -> bool {
        self.visited.get()
    }

    fn process(&self) -> Result<()> {
        Ok(())
    }

    fn notify(&self) -> Result<()> {
        if self.visited.get() && (self.deliver)()? {
            self.delivered.set(self.delivered.get() + 1);
        }
        Ok(())
    }

    fn update(&self) {
        self.visited.set(false);
    }

    fn abandon(&self) {
        self.visited.set(false);
    }

    fn describe(&self) -> String {
        format!(
            "visited={} delivered={}",
            self.visited.get(),
            self.delivered.get()
        )
    }
}
