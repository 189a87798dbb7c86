//! Shared helpers for the integration tests.

use std::cell::RefCell;
use std::rc::Rc;
use std::sync::Once;

use strand_core::{Listener, Stream};
use tracing_subscriber::EnvFilter;

static INIT: Once = Once::new();

/// Install a test-friendly subscriber once per test binary. `RUST_LOG`
/// selects the level, e.g. `RUST_LOG=strand_core=trace`.
pub fn init_tracing() {
    INIT.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(EnvFilter::from_default_env())
            .with_test_writer()
            .try_init();
    });
}

/// Record every event of `stream`.
#[allow(dead_code)]
pub fn record<A: Clone + 'static>(stream: &Stream<A>) -> (Rc<RefCell<Vec<A>>>, Listener) {
    let seen = Rc::new(RefCell::new(Vec::new()));
    let out = seen.clone();
    let listener = stream.listen(move |a: &A| out.borrow_mut().push(a.clone()));
    (seen, listener)
}
