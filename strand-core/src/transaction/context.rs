//! Transaction Context
//!
//! The context tracks which transaction is currently running on this thread.
//! Graph operations pick it up implicitly instead of threading a handle
//! through every call.
//!
//! # Implementation
//!
//! A thread-local slot holds the ambient transaction. It is empty outside
//! [`run`], set for the whole outermost call, and swapped by the post phase
//! (cleared for index 0, replaced by a nested transaction otherwise). Every
//! swap is done through a [`Scope`] guard that puts the previous value back
//! when dropped, so the slot is restored even if a callback panics.

use std::cell::{Cell, RefCell};
use std::rc::Rc;

use tracing::{debug, warn};

use super::{Callback, Transaction};
use crate::error::{Result, StrandError};
use crate::graph::VertexId;

type StartHook = dyn Fn() -> std::result::Result<(), String>;

thread_local! {
    static CURRENT: RefCell<Option<Transaction>> = const { RefCell::new(None) };
    static HOOKS: RefCell<Vec<Rc<StartHook>>> = const { RefCell::new(Vec::new()) };
    static IN_HOOKS: Cell<bool> = const { Cell::new(false) };
}

/// Guard that installs a transaction as the ambient one.
///
/// Dropping it restores the previous ambient transaction. A transaction it
/// owns that has not finished by then is abandoned.
struct Scope {
    previous: Option<Transaction>,
    owned: Option<Transaction>,
}

impl Scope {
    fn enter(tx: Transaction) -> Self {
        let previous = CURRENT.with(|c| c.replace(Some(tx.clone())));
        Self {
            previous,
            owned: Some(tx),
        }
    }

    fn detach() -> Self {
        let previous = CURRENT.with(|c| c.take());
        Self {
            previous,
            owned: None,
        }
    }
}

impl Drop for Scope {
    fn drop(&mut self) {
        if let Some(tx) = self.owned.take() {
            if !tx.is_finished() {
                warn!(tx = tx.serial(), "transaction left without closing");
                tx.abandon();
            }
        }
        let previous = self.previous.take();
        let _ = CURRENT.try_with(|c| *c.borrow_mut() = previous);
    }
}

/// Marks the start hooks as running; cleared on drop.
struct HookGuard;

impl HookGuard {
    fn enter() -> Self {
        IN_HOOKS.with(|flag| flag.set(true));
        HookGuard
    }
}

impl Drop for HookGuard {
    fn drop(&mut self) {
        let _ = IN_HOOKS.try_with(|flag| flag.set(false));
    }
}

/// The ambient transaction, if one is running.
pub fn current() -> Option<Transaction> {
    CURRENT.with(|c| c.borrow().clone())
}

/// Whether a transaction is running on this thread.
pub fn is_active() -> bool {
    CURRENT.with(|c| c.borrow().is_some())
}

/// Run `f` against the ambient transaction.
pub(crate) fn with_current<R>(f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
    let tx = current().ok_or(StrandError::NoActiveTransaction)?;
    f(&tx)
}

/// Run `f` inside the ambient transaction.
///
/// If none is running, a new one is opened, the start hooks run, `f` runs,
/// and the transaction is closed before returning. If one is running, `f`
/// simply joins it.
///
/// An error from `f` abandons the new transaction: nothing it staged is
/// committed.
pub fn run<R>(f: impl FnOnce(&Transaction) -> Result<R>) -> Result<R> {
    if let Some(tx) = current() {
        return f(&tx);
    }

    let tx = Transaction::new();
    let _scope = Scope::enter(tx.clone());

    if let Err(message) = run_start_hooks() {
        if let Err(err) = tx.close() {
            warn!(tx = tx.serial(), %err, "close after failed start hook");
        }
        return Err(StrandError::Hook(message));
    }

    match f(&tx) {
        Ok(out) => {
            tx.close()?;
            Ok(out)
        }
        Err(err) => {
            tx.abandon();
            Err(err)
        }
    }
}

/// Register a hook that runs at the start of every outermost transaction,
/// before its body.
///
/// Hooks may open transactions of their own; those join the one being
/// started and do not run the hooks again.
pub fn on_start<F>(hook: F)
where
    F: Fn() -> std::result::Result<(), String> + 'static,
{
    HOOKS.with(|h| h.borrow_mut().push(Rc::new(hook)));
}

fn run_start_hooks() -> std::result::Result<(), String> {
    if IN_HOOKS.with(Cell::get) {
        return Ok(());
    }
    let hooks: Vec<Rc<StartHook>> = HOOKS.with(|h| h.borrow().clone());
    if hooks.is_empty() {
        return Ok(());
    }

    let _guard = HookGuard::enter();
    debug!(count = hooks.len(), "running start hooks");
    for hook in hooks {
        hook()?;
    }
    Ok(())
}

/// Run a post callback with no ambient transaction.
pub(super) fn run_detached(callback: Callback) -> Result<()> {
    let _scope = Scope::detach();
    callback()
}

/// Run a post callback in a fresh transaction, closing it even if the
/// callback fails.
pub(super) fn run_nested(callback: Callback) -> Result<()> {
    let tx = Transaction::new();
    let _scope = Scope::enter(tx.clone());
    let acted = callback();
    let closed = tx.close();
    acted.and(closed)
}

/// Tell the ambient transaction that `source` gained a dependent.
pub(crate) fn on_edge_added(source: VertexId) {
    if let Some(tx) = current() {
        tx.note_new_edge(source);
    }
}
