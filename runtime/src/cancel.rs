// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! User-facing cancellation scopes, layered on the interrupt machinery's
//! discipline: flags are set under a short lock, callbacks run outside it.
//!
//! Each thread keeps a stack of [`CancelScope`]s guarded by that thread's
//! cancel critical section. Cancelling a scope marks it and every scope
//! above it on its stack (its descendants); each newly marked descendant's
//! callback is queued and run after the lock is released. A scope's `pop`
//! waits for its own in-flight callback, so no callback ever outlives its
//! scope.
//!
//! Blocking operations that must react to cancellation promptly use the
//! *scope-owner retry* pattern: they push a scope whose callback unparks
//! the blocked thread, then park in bounded slices and re-check. That is
//! what [`sleep`] and [`SignalGuard`] (the signal-sensitive bracket for
//! blocking calls) do.

use crate::error::Error;
use crate::park::{Parker, UnparkToken};
use crate::state::{self, ThreadState};
use crate::sync::Flag;
use core::cell::UnsafeCell;
use core::fmt;
use core::time::Duration;
use std::sync::Arc;
use std::time::Instant;
use std::vec::Vec;

/// How long a cancellable wait may park before re-checking its condition.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// A nestable cancellation region on one thread's cancel stack.
pub struct CancelScope {
    /// The thread whose stack this scope lives on; its cancel critical
    /// section guards `state`.
    ts: Arc<ThreadState>,
    callback: Box<dyn Fn() + Send + Sync>,
    callback_finished: Flag,
    state: UnsafeCell<ScopeState>,
}

#[derive(Debug)]
struct ScopeState {
    cancelled: bool,
    on_stack: bool,
    callback_activated: bool,
}

// Safety: `state` is only touched under `ts.cancel_crit`; everything else
// is immutable or internally synchronized.
unsafe impl Send for CancelScope {}
// Safety: see above.
unsafe impl Sync for CancelScope {}

/// Collects scopes whose callbacks must run once the cancel critical
/// section has been released.
pub struct CancelQueue {
    list: Vec<Arc<CancelScope>>,
}

// === impl CancelScope ===

impl CancelScope {
    /// A scope bound to the calling thread, with the callback run (on the
    /// cancelling thread) when an enclosing scope is cancelled.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached.
    pub fn new(callback: impl Fn() + Send + Sync + 'static) -> Arc<Self> {
        Arc::new(Self {
            ts: state::current(),
            callback: Box::new(callback),
            callback_finished: Flag::new(),
            state: UnsafeCell::new(ScopeState {
                cancelled: false,
                on_stack: false,
                callback_activated: false,
            }),
        })
    }

    /// Pushes this scope onto its thread's cancel stack. Pushing under an
    /// already-cancelled parent marks the scope and fires its callback
    /// immediately (outside the lock).
    ///
    /// # Panics
    ///
    /// Panics if called from another thread or if the scope is already on
    /// the stack.
    pub fn push(self: &Arc<Self>) {
        state::with_current(|ts| {
            assert_eq!(ts.id(), self.ts.id(), "cancel scope pushed on foreign thread");
        });

        let mut queue = CancelQueue::new();
        self.ts.cancel_crit.with(|| {
            // Safety: we hold the cancel critical section.
            unsafe {
                let scope_state = &mut *self.state.get();
                assert!(!scope_state.on_stack, "cancel scope pushed twice");

                let parent_cancelled = self.ts.with_cancel_stack(|stack| {
                    stack.last().is_some_and(|parent| (*parent.state.get()).cancelled)
                });
                if parent_cancelled {
                    scope_state.cancelled = true;
                    scope_state.callback_activated = true;
                    queue.list.push(Arc::clone(self));
                }

                scope_state.on_stack = true;
                self.ts.with_cancel_stack(|stack| stack.push(Arc::clone(self)));
            }
        });
        queue.finish();
    }

    /// Pops this scope; it must be the innermost one. Waits for any
    /// in-flight callback so that no callback outlives the scope.
    ///
    /// # Panics
    ///
    /// Panics if this is not the calling thread's innermost scope.
    pub fn pop(self: &Arc<Self>) {
        state::with_current(|ts| {
            assert_eq!(ts.id(), self.ts.id(), "cancel scope popped on foreign thread");
        });

        let activated = self.ts.cancel_crit.with(|| {
            // Safety: we hold the cancel critical section.
            unsafe {
                self.ts.with_cancel_stack(|stack| {
                    let top = stack.pop().expect("cancel stack is empty");
                    assert!(Arc::ptr_eq(&top, self), "popping wrong cancel scope");
                });
                let scope_state = &mut *self.state.get();
                scope_state.on_stack = false;
                scope_state.callback_activated
            }
        });

        if activated && !self.callback_finished.is_set() {
            state::suspended(|| self.callback_finished.wait());
        }
    }

    /// Cancels this scope: marks it and every scope above it on its stack,
    /// then runs the newly activated callbacks outside the lock.
    pub fn cancel(self: &Arc<Self>) {
        let mut queue = CancelQueue::new();
        queue.cancel(self);
        queue.finish();
    }

    pub fn is_cancelled(&self) -> bool {
        self.ts.cancel_crit.with(|| {
            // Safety: we hold the cancel critical section.
            unsafe { (*self.state.get()).cancelled }
        })
    }
}

impl fmt::Debug for CancelScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelScope")
            .field("thread", &self.ts.id())
            .finish_non_exhaustive()
    }
}

// === impl CancelQueue ===

impl CancelQueue {
    #[expect(clippy::new_without_default, reason = "queues are short-lived locals")]
    pub fn new() -> Self {
        Self { list: Vec::new() }
    }

    /// Marks `scope` cancelled; its descendants (the scopes above it on
    /// its stack) are marked too and their callbacks queued.
    pub fn cancel(&mut self, scope: &Arc<CancelScope>) {
        scope.ts.cancel_crit.with(|| {
            // Safety: we hold the cancel critical section of the scope's
            // thread, which guards every scope on that stack.
            unsafe {
                let scope_state = &mut *scope.state.get();
                if scope_state.cancelled {
                    return;
                }
                scope_state.cancelled = true;

                if !scope_state.on_stack {
                    return;
                }

                scope.ts.with_cancel_stack(|stack| {
                    let index = stack
                        .iter()
                        .position(|other| Arc::ptr_eq(other, scope))
                        .expect("scope marked on-stack but missing from stack");
                    for descendant in &stack[index + 1..] {
                        let descendant_state = &mut *descendant.state.get();
                        descendant_state.cancelled = true;
                        if !descendant_state.callback_activated {
                            descendant_state.callback_activated = true;
                            self.list.push(Arc::clone(descendant));
                        }
                    }
                });
            }
        });
    }

    /// Runs the queued callbacks and releases their scopes' `pop` waits.
    /// Must be called with the cancel critical section released.
    pub fn finish(mut self) {
        for scope in self.list.drain(..) {
            (scope.callback)();
            scope.callback_finished.set();
            tracing::trace!(thread.id = scope.ts.id(), "cancel callback delivered");
        }
    }
}

impl Drop for CancelQueue {
    fn drop(&mut self) {
        debug_assert!(self.list.is_empty(), "cancel queue dropped without finish");
    }
}

/// Raises `Cancelled` if the calling thread's innermost cancel scope has
/// been cancelled.
///
/// # Errors
///
/// Returns [`Error::cancelled`] when cancelled.
pub fn check_cancelled() -> Result<(), Error> {
    let cancelled = state::with_current(|ts| {
        ts.cancel_crit.with(|| {
            // Safety: we hold the cancel critical section.
            unsafe {
                ts.with_cancel_stack(|stack| {
                    stack.last().map(|scope| (*scope.state.get()).cancelled)
                })
            }
        })
    });
    if cancelled.unwrap_or(false) {
        Err(Error::cancelled())
    } else {
        Ok(())
    }
}

/// Marks a region in which the calling thread may block in a system call
/// and must be woken when cancelled.
///
/// The guard pushes a cancel scope whose callback unparks this thread;
/// the in-flight blocking operation then re-checks its condition (the
/// scope-owner retry). Dropping the guard pops the scope.
pub struct SignalGuard {
    scope: Arc<CancelScope>,
}

/// Enters signal-sensitive mode. See [`SignalGuard`].
///
/// # Panics
///
/// Panics if the calling thread is not attached.
pub fn signal_enter() -> SignalGuard {
    SignalGuard::enter()
}

// === impl SignalGuard ===

impl SignalGuard {
    pub fn enter() -> Self {
        let token: UnparkToken = state::with_current(|ts| ts.parker.unpark_token());
        let scope = CancelScope::new(move || token.unpark());
        scope.push();
        Self { scope }
    }

    /// Whether the region has been cancelled; blocking loops check this
    /// after every wake-up.
    pub fn is_cancelled(&self) -> bool {
        self.scope.is_cancelled()
    }

    /// Checks for cancellation, failing the blocking operation.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] when the region was cancelled.
    pub fn check(&self) -> Result<(), Error> {
        if self.is_cancelled() {
            Err(Error::cancelled())
        } else {
            Ok(())
        }
    }

    /// Parks the calling thread for at most `slice`, with the runtime
    /// suspended. Wakes early when cancelled.
    pub(crate) fn park(&self, slice: Duration) {
        let parker: Parker = state::with_current(|ts| ts.parker.clone());
        state::suspended(|| parker.park_timeout(slice));
    }

    pub fn exit(self) {
        drop(self);
    }
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.scope.pop();
    }
}

impl fmt::Debug for SignalGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SignalGuard")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// Sleeps for `duration`, waking early with `Cancelled` when an enclosing
/// scope is cancelled.
///
/// # Errors
///
/// Returns [`Error::cancelled`] if cancelled before the duration elapsed.
pub fn sleep(duration: Duration) -> Result<(), Error> {
    let guard = signal_enter();
    let deadline = Instant::now() + duration;

    loop {
        guard.check()?;
        let now = Instant::now();
        if now >= deadline {
            return Ok(());
        }
        guard.park((deadline - now).min(PARK_SLICE));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Runtime;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn check_cancelled_sees_innermost() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let scope = CancelScope::new(|| {});
        scope.push();
        assert!(check_cancelled().is_ok());

        scope.cancel();
        assert!(check_cancelled().unwrap_err().is_cancelled());

        scope.pop();
        frame.exit();
    }

    #[test]
    fn cancelling_parent_marks_descendants() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let parent = CancelScope::new(|| {});
        let child = CancelScope::new({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });

        parent.push();
        child.push();

        parent.cancel();
        assert!(parent.is_cancelled());
        assert!(child.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(check_cancelled().unwrap_err().is_cancelled());

        child.pop();
        parent.pop();
        frame.exit();
    }

    #[test]
    fn push_under_cancelled_parent_fires_immediately() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let parent = CancelScope::new(|| {});
        parent.push();
        parent.cancel();

        let child = CancelScope::new({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        child.push();
        assert!(child.is_cancelled());
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        child.pop();
        parent.pop();
        frame.exit();
    }

    #[test]
    fn cancel_is_idempotent() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let fired = Arc::new(AtomicUsize::new(0));
        let parent = CancelScope::new(|| {});
        let child = CancelScope::new({
            let fired = fired.clone();
            move || {
                fired.fetch_add(1, Ordering::SeqCst);
            }
        });
        parent.push();
        child.push();

        parent.cancel();
        parent.cancel();
        child.cancel();
        assert_eq!(fired.load(Ordering::SeqCst), 1);

        child.pop();
        parent.pop();
        frame.exit();
    }

    #[test]
    fn cancelling_popped_scope_only_marks() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let scope = CancelScope::new(|| {});
        scope.push();
        scope.pop();

        scope.cancel();
        assert!(scope.is_cancelled());

        frame.exit();
    }

    #[test]
    fn sleep_without_cancel_completes() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let started = Instant::now();
        sleep(Duration::from_millis(30)).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(25));

        frame.exit();
    }

    #[test]
    fn sleep_is_cancelled_from_another_thread() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let outer = CancelScope::new(|| {});
        outer.push();

        let canceller = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            let outer = Arc::clone(&outer);
            move || {
                let frame = runtime.enter();
                std::thread::sleep(Duration::from_millis(30));
                outer.cancel();
                frame.exit();
            }
        });

        let started = Instant::now();
        let err = sleep(Duration::from_secs(10)).unwrap_err();
        assert!(err.is_cancelled());
        assert!(started.elapsed() < Duration::from_secs(5));

        state::suspended(|| canceller.join().unwrap());
        outer.pop();
        frame.exit();
    }
}
