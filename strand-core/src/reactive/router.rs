//! Keyed Fan-out
//!
//! A [`Router`] classifies each event of a stream once, by a selector that
//! returns the keys the event belongs to, and hands out one stream per key.
//! Every keyed stream reads the shared classification instead of running its
//! own predicate.

use std::rc::Rc;

use smallvec::SmallVec;

use super::Stream;

struct Routed<A, K> {
    value: A,
    keys: SmallVec<[K; 4]>,
}

/// Splits one stream into streams selected by key.
pub struct Router<A, K> {
    routed: Stream<Rc<Routed<A, K>>>,
}

impl<A, K> Router<A, K>
where
    A: Clone + 'static,
    K: PartialEq + 'static,
{
    /// Route the events of `source`. `keys` lists the keys each event goes
    /// to; an event may go to none, one or several.
    pub fn new<F, I>(source: &Stream<A>, keys: F) -> Self
    where
        F: Fn(&A) -> I + 'static,
        I: IntoIterator<Item = K>,
    {
        let routed = source.map(move |a| {
            Rc::new(Routed {
                value: a.clone(),
                keys: keys(a).into_iter().collect(),
            })
        });
        Self { routed }
    }

    /// The events routed to `key`.
    pub fn filter_includes(&self, key: K) -> Stream<A> {
        self.routed
            .filter_map(move |r| r.keys.contains(&key).then(|| r.value.clone()))
    }
}
