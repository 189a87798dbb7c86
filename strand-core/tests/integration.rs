//! Integration Tests for the Propagation Engine
//!
//! These tests drive the public surface end to end: sinks fire, the
//! transaction propagates, listeners observe the committed result.

mod common;

use std::cell::{Cell as StdCell, RefCell};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::rc::Rc;

use common::{init_tracing, record};
use strand_core::transaction::{self, Phase};
use strand_core::{
    collect_cycles, stats, total_registrations, Cell, CellLoop, CellSink, EngineConfig, Router,
    Stream, StreamLoop, StreamSink, StrandError,
};

/// A stream reachable from several roots is computed once per transaction.
#[test]
fn derived_stream_is_computed_once_per_transaction() {
    init_tracing();
    let a = StreamSink::new();
    let b = StreamSink::new();
    let calls = Rc::new(StdCell::new(0));
    let observed = calls.clone();

    let merged = a.merge(&b, |l: &i32, r| l + r).map(move |n| {
        observed.set(observed.get() + 1);
        *n
    });
    let doubled = merged.map(|n| n * 2);
    let positive = merged.filter(|n| *n > 0);
    let (seen_doubled, _l1) = record(&doubled);
    let (seen_positive, _l2) = record(&positive);

    transaction::run(|_| {
        a.send(1)?;
        b.send(2)
    })
    .unwrap();

    assert_eq!(calls.get(), 1);
    assert_eq!(*seen_doubled.borrow(), vec![6]);
    assert_eq!(*seen_positive.borrow(), vec![3]);
}

/// Snapshots see the value from before the transaction; the next
/// transaction sees the update.
#[test]
fn cell_updates_are_delayed_by_one_transaction() {
    init_tracing();
    let set = StreamSink::new();
    let tick = StreamSink::new();
    let cell = set.hold(0);
    let (seen, _l) = record(&tick.snapshot1(&cell));

    transaction::run(|_| {
        set.send(1)?;
        tick.send(())
    })
    .unwrap();
    tick.send(()).unwrap();

    assert_eq!(*seen.borrow(), vec![0, 1]);
}

/// A diamond produces exactly one consistent value per firing.
#[test]
fn diamond_is_glitch_free() {
    init_tracing();
    let a = StreamSink::new();
    let b = a.map(|n: &i32| n + 1);
    let c = a.map(|n: &i32| n * 10);
    let d = b.merge(&c, |l, r| l * 1000 + r);
    let (seen, _l) = record(&d);

    a.send(1).unwrap();
    a.send(2).unwrap();

    assert_eq!(*seen.borrow(), vec![2010, 3020]);
}

/// Cells in a diamond are lifted from values of the same firing.
#[test]
fn lifted_diamond_never_mixes_firings() {
    init_tracing();
    let a = CellSink::new(1);
    let b = a.map(|n| n + 1);
    let c = a.map(|n| n * 2);
    let d = b.lift(&c, |b, c| (*b, *c));
    let seen = Rc::new(RefCell::new(Vec::new()));
    let out = seen.clone();
    let _l = d.listen(move |pair| out.borrow_mut().push(*pair)).unwrap();

    for n in [5, 7, 7] {
        a.send(n).unwrap();
    }

    assert_eq!(*seen.borrow(), vec![(2, 2), (6, 10), (8, 14), (8, 14)]);
    for (b, c) in seen.borrow().iter() {
        assert_eq!(*c, (b - 1) * 2);
    }
}

/// A forward reference propagates once resolved, and only resolves once.
#[test]
fn loops_resolve_exactly_once() {
    init_tracing();
    let input = StreamSink::new();
    let pending = StreamLoop::new();
    let labelled = pending.map(|n: &i32| format!("#{n}"));
    let (seen, _l) = record(&labelled);

    // Resolved inside the transaction that first uses it.
    transaction::run(|_| {
        pending.loop_to(&input)?;
        input.send(1)
    })
    .unwrap();
    input.send(2).unwrap();

    assert_eq!(*seen.borrow(), vec!["#1".to_string(), "#2".to_string()]);
    assert_eq!(
        pending.loop_to(&input),
        Err(StrandError::LoopAlreadyResolved {
            vertex: pending.id()
        })
    );
}

/// A sink fired from a sample joins the transaction, and vertices already
/// computed from the first firing are recomputed to include it.
#[test]
fn firing_from_a_sample_reaches_processed_vertices() {
    init_tracing();
    let a = StreamSink::new();
    let b = StreamSink::new();
    let merged = a.merge(&b, |l: &i32, r| l + r);
    let (seen, _l1) = record(&merged);
    let (seen_b, _l2) = record(&b);

    let late = b.clone();
    transaction::run(|tx| {
        a.send(1)?;
        tx.sample(move || late.send(2));
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![3]);
    assert_eq!(*seen_b.borrow(), vec![2]);
}

/// The same late firing from a prioritized action, with a `once` downstream
/// that must not lose its event when recomputed.
#[test]
fn firing_from_a_prioritized_action_keeps_once_events() {
    init_tracing();
    let a = StreamSink::new();
    let b = StreamSink::new();
    let first = a.merge(&b, |l: &i32, r| l * 10 + r).once();
    let (seen, _l) = record(&first);

    let late = b.clone();
    transaction::run(|tx| {
        a.send(4)?;
        tx.prioritized(first.id(), move || late.send(2))
    })
    .unwrap();
    a.send(9).unwrap();

    assert_eq!(*seen.borrow(), vec![42]);
}

/// A listener attached from a sample, to a stream that already fired, gets
/// the event in the same transaction.
#[test]
fn listener_added_during_the_drain_sees_the_event() {
    init_tracing();
    let s = StreamSink::new();
    let seen = Rc::new(RefCell::new(Vec::new()));
    let held = Rc::new(RefCell::new(None));

    let (source, out, slot) = (s.clone(), seen.clone(), held.clone());
    transaction::run(|tx| {
        s.send(3)?;
        tx.sample(move || {
            let listener = source
                .map(|n: &i32| n * 10)
                .listen(move |n| out.borrow_mut().push(*n));
            *slot.borrow_mut() = Some(listener);
            Ok(())
        });
        Ok(())
    })
    .unwrap();

    assert_eq!(*seen.borrow(), vec![30]);
    s.send(4).unwrap();
    assert_eq!(*seen.borrow(), vec![30, 40]);
}

/// A loop bound from a prioritized action, after its source was reached,
/// forwards the source's event in the same transaction.
#[test]
fn loop_bound_during_the_drain_forwards_the_event() {
    init_tracing();
    let input = StreamSink::new();
    let pending = StreamLoop::new();
    let (seen, _l) = record(&pending.map(|n: &i32| n + 1));

    let (lp, src) = (pending.clone(), input.clone());
    transaction::run(|tx| {
        input.send(5)?;
        tx.prioritized(input.id(), move || lp.loop_to(&src))
    })
    .unwrap();

    assert!(pending.is_looped());
    assert_eq!(*seen.borrow(), vec![6]);
}

/// A loop that nothing fired through does not fail the transaction, even
/// before it is resolved.
#[test]
fn unreached_loop_is_not_an_error() {
    init_tracing();
    let a = StreamSink::new();
    let pending = StreamLoop::new();
    let (seen, _l) = record(&a.or_else(&pending));

    assert_eq!(a.send(1), Ok(()));
    assert_eq!(*seen.borrow(), vec![1]);
}

/// Reading a loop that was never resolved is reported to the caller.
#[test]
fn unresolved_loop_fails_the_transaction() {
    init_tracing();
    let input = StreamSink::new();
    let pending: CellLoop<i32> = CellLoop::new();
    let (_seen, _l) = record(&input.snapshot1(&pending));

    let err = input.send(()).unwrap_err();
    assert_eq!(err, StrandError::LoopNotResolved { vertex: pending.id() });
    assert!(!transaction::is_active());
}

/// A transaction that reaches nothing leaves every cell untouched.
#[test]
fn empty_transactions_are_inert() {
    init_tracing();
    let unrelated = StreamSink::new();
    let c = CellSink::new(String::from("steady"));
    let upper = c.map(|s| s.to_uppercase());
    let changes = Rc::new(StdCell::new(0));
    let observed = changes.clone();
    let _l = upper.updates().listen(move |_| observed.set(observed.get() + 1));

    transaction::run(|_| Ok(())).unwrap();
    unrelated.send(()).unwrap();

    assert_eq!(c.sample().unwrap(), "steady");
    assert_eq!(upper.sample().unwrap(), "STEADY");
    assert_eq!(changes.get(), 0);
}

/// `accum` builds a loop that only keeps itself alive once the handle is
/// dropped. Cycle collection reclaims it; a held copy survives.
#[test]
fn cycle_collection_reclaims_unheld_loops() {
    init_tracing();
    let clicks = StreamSink::new();
    let kept = clicks.accum(0, |_: &(), n| n + 1).unwrap();
    let dropped = clicks.accum(0, |_: &(), n| n + 1).unwrap();
    clicks.send(()).unwrap();
    assert_eq!(kept.sample().unwrap(), 1);

    let live = stats().live_vertices;
    drop(dropped);
    // Reference counting alone can not free the loop.
    assert_eq!(stats().live_vertices, live);

    let released = stats().released_total;
    transaction::run(|tx| {
        tx.request_cycle_collection();
        Ok(())
    })
    .unwrap();

    // snapshot, hold and loop of the dropped accumulator.
    assert_eq!(stats().released_total - released, 3);
    assert_eq!(stats().live_vertices, live - 3);

    clicks.send(()).unwrap();
    assert_eq!(kept.sample().unwrap(), 2);
}

/// Collection requested outside a transaction runs immediately and leaves
/// held vertices alone.
#[test]
fn collect_cycles_keeps_held_vertices() {
    init_tracing();
    let s = StreamSink::<u8>::new();
    let c: Cell<u8> = s.hold(0);
    let m = c.map(|n| n + 1);
    let before = stats();

    collect_cycles();

    let after = stats();
    assert_eq!(after.live_vertices, before.live_vertices);
    assert_eq!(after.cycle_collections, before.cycle_collections + 1);
    s.send(4).unwrap();
    assert_eq!(m.sample().unwrap(), 5);
}

/// Three filtered labels merged by concatenation.
#[test]
fn end_to_end_filtered_labels() {
    init_tracing();
    let input: StreamSink<Vec<i32>> = StreamSink::new();
    let label = |n: i32, text: &'static str| {
        input
            .filter(move |v: &Vec<i32>| v.contains(&n))
            .map_to(text.to_string())
    };
    let (a, b, c) = (label(1, "a"), label(2, "b"), label(3, "c"));
    let concat = |l: &String, r: &String| format!("{l}{r}");
    let merged = a.merge(&b, concat).merge(&c, concat);

    let (seen, listener) = record(&merged);
    for batch in [vec![1], vec![2], vec![3], vec![1, 2, 3]] {
        input.send(batch).unwrap();
    }

    assert_eq!(*seen.borrow(), vec!["a", "b", "c", "abc"]);
    listener.unlisten();
    assert_eq!(total_registrations(), 0);
}

/// The same scenario through a router, which classifies each event once.
#[test]
fn end_to_end_router() {
    init_tracing();
    let input: StreamSink<Vec<i32>> = StreamSink::new();
    let router = Router::new(&input, |v: &Vec<i32>| v.clone());
    let labels: Vec<Stream<String>> = [(1, "a"), (2, "b"), (3, "c")]
        .into_iter()
        .map(|(key, text)| router.filter_includes(key).map_to(text.to_string()))
        .collect();
    let merged = labels[1..].iter().fold(labels[0].clone(), |acc, s| {
        acc.merge(s, |l, r| format!("{l}{r}"))
    });

    let (seen, listener) = record(&merged);
    for batch in [vec![1], vec![2], vec![3], vec![1, 2, 3]] {
        input.send(batch).unwrap();
    }
    assert_eq!(*seen.borrow(), vec!["a", "b", "c", "abc"]);

    drop(listener);
    assert_eq!(total_registrations(), 0);
}

/// Start hooks run before the body of every outermost transaction.
#[test]
fn start_hooks_prepare_each_transaction() {
    init_tracing();
    let ticks = StreamSink::new();
    let clock = ticks.hold(0u32);
    let hook_sink = ticks.clone();
    let counter = Rc::new(StdCell::new(0u32));
    let next = counter.clone();
    transaction::on_start(move || {
        next.set(next.get() + 1);
        hook_sink.send(next.get()).map_err(|e| e.to_string())
    });

    transaction::run(|_| Ok(())).unwrap();
    transaction::run(|_| transaction::run(|_| Ok(()))).unwrap();

    assert_eq!(counter.get(), 2);
    assert_eq!(clock.sample().unwrap(), 2);
}

/// A panicking handler leaves the engine idle and usable.
#[test]
fn panic_in_a_handler_leaves_the_engine_idle() {
    init_tracing();
    let s = StreamSink::new();
    let total = s.accum(0, |n: &i32, acc| acc + n).unwrap();
    let _bomb = s.filter(|n| *n < 0).listen(|_| panic!("negative"));

    let result = catch_unwind(AssertUnwindSafe(|| s.send(-1)));
    assert!(result.is_err());
    assert!(!transaction::is_active());

    // The aborted firing was never committed.
    s.send(5).unwrap();
    assert_eq!(total.sample().unwrap(), 5);
}

/// An error inside the body abandons the transaction.
#[test]
fn failed_transaction_commits_nothing() {
    init_tracing();
    let s = StreamSink::new();
    let c = s.hold(1);
    let err = transaction::run(|tx| {
        s.send(9)?;
        assert_eq!(tx.phase(), Phase::Open);
        s.send(10)
    })
    .unwrap_err();

    assert!(matches!(err, StrandError::DuplicateFiring { .. }));
    assert_eq!(c.sample().unwrap(), 1);
}

/// Stats and configuration are plain serde values.
#[test]
fn stats_and_config_serialize() {
    init_tracing();
    let s = StreamSink::<i32>::new();
    let _l = s.listen(|_| {});

    let json = serde_json::to_value(stats()).unwrap();
    assert_eq!(json["live_listeners"], 1);
    assert!(json["live_vertices"].as_u64().unwrap() >= 2);

    let config = EngineConfig::from_json(r#"{"debug_trace": true}"#).unwrap();
    assert!(config.debug_trace);
    assert_eq!(EngineConfig::from_json("{}").unwrap(), EngineConfig::default());
}
