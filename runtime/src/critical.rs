// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Depth-ordered short locks.
//!
//! A [`Critical`] section is the lock the core uses for a known, fixed
//! amount of code. Sections are ordered by `depth`: while one is held, only
//! sections with a *strictly smaller* depth may be entered. That rules out
//! lock-order inversion between the fixed hierarchies the core relies on,
//! most importantly the weakref teardown order
//! `WEAKREF_REF > WEAKREF_HANDLE > WEAKREF_QUEUE`.
//!
//! Most code needs one section at a time and uses [`CRITICAL_NORMAL`].

use crate::state;
use crate::sync;
use core::cell::Cell;
use core::fmt;
use core::mem;
use core::ptr::NonNull;

/// Depth for the single-section common case.
pub const CRITICAL_NORMAL: isize = 0;

/// Depth used by finalization code paths; entered (as a dummy) around
/// destructors so stop-the-world cannot interleave with object teardown.
pub const CRITICAL_DEALLOC: isize = 100;

/// The cancel-stack lock sits below normal sections so a cancel callback
/// registration can happen while a normal section is held.
pub const CRITICAL_CANCEL: isize = -1;

/// Weakref hierarchy, entered in decreasing order: ref, then handle, then
/// queue.
pub const CRITICAL_WEAKREF_REF: isize = 2;
pub const CRITICAL_WEAKREF_HANDLE: isize = 1;
pub const CRITICAL_WEAKREF_QUEUE: isize = 0;

/// An ordered short lock.
///
/// `enter`/`exit` must be paired in LIFO order per thread; violating the
/// depth order or the pairing is a programming fault and panics.
pub struct Critical {
    lock: sync::Mutex<()>,
    depth: isize,
    /// Dummy sections take part in the ordering and in blocking
    /// stop-the-world, but do no actual locking. They may be entered only
    /// by their owning thread.
    dummy: bool,
    /// The next-outer section of the holding thread. Only the holder reads
    /// or writes this, between `enter` and `exit`.
    prev: Cell<Option<NonNull<Critical>>>,
}

// Safety: `prev` is only touched by the thread currently holding the
// section (or, for dummies, the owning thread), never concurrently.
unsafe impl Send for Critical {}
// Safety: see above.
unsafe impl Sync for Critical {}

// === impl Critical ===

impl Critical {
    pub fn new(depth: isize) -> Self {
        Self {
            lock: sync::Mutex::new(()),
            depth,
            dummy: false,
            prev: Cell::new(None),
        }
    }

    /// A stack-allocatable section that participates in ordering and keeps
    /// stop-the-world at bay without providing any exclusion.
    pub fn new_dummy(depth: isize) -> Self {
        Self {
            lock: sync::Mutex::new(()),
            depth,
            dummy: true,
            prev: Cell::new(None),
        }
    }

    pub fn depth(&self) -> isize {
        self.depth
    }

    /// Acquires the section, suspending the thread state while contended.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is suspended, already holds a section
    /// of equal or smaller depth, or re-enters this section.
    pub fn enter(&self) {
        assert!(!self.dummy, "dummy critical section entered as real");
        let ts = state::current();
        self.check_order(&ts);

        if let Some(guard) = self.lock.try_lock() {
            mem::forget(guard);
        } else {
            // Contended: let stop-the-world and promotion proceed while we
            // spin on the lock.
            state::suspend_ts(&ts);
            mem::forget(self.lock.lock());
            state::resume_ts(&ts);
        }

        debug_assert!(self.prev.get().is_none());
        self.prev.set(ts.critical_top());
        ts.set_critical_top(Some(NonNull::from(self)));
    }

    /// Releases the section.
    ///
    /// # Panics
    ///
    /// Panics if this is not the calling thread's innermost section.
    pub fn exit(&self) {
        let ts = state::current();
        assert!(!ts.is_suspended(), "critical section exited while suspended");
        assert!(
            ts.critical_top() == Some(NonNull::from(self)),
            "exited critical section that is not the innermost one"
        );

        ts.set_critical_top(self.prev.take());

        // Safety: `enter` forgot the guard, so the lock is held by us.
        unsafe { self.lock.force_unlock() }
    }

    /// Runs `f` with the section held.
    pub fn with<R>(&self, f: impl FnOnce() -> R) -> R {
        struct ExitGuard<'a>(&'a Critical);
        impl Drop for ExitGuard<'_> {
            fn drop(&mut self) {
                self.0.exit();
            }
        }

        self.enter();
        let _guard = ExitGuard(self);
        f()
    }

    /// Enters a dummy section: ordering checks and the critical chain only,
    /// no locking.
    pub fn enter_dummy(&self) {
        assert!(self.dummy, "real critical section entered as dummy");
        let ts = state::current();
        self.check_order(&ts);

        debug_assert!(self.prev.get().is_none());
        self.prev.set(ts.critical_top());
        ts.set_critical_top(Some(NonNull::from(self)));
    }

    pub fn exit_dummy(&self) {
        assert!(self.dummy, "real critical section exited as dummy");
        let ts = state::current();
        assert!(
            ts.critical_top() == Some(NonNull::from(self)),
            "exited critical section that is not the innermost one"
        );
        ts.set_critical_top(self.prev.take());
    }

    fn check_order(&self, ts: &state::ThreadState) {
        assert!(
            !ts.is_suspended(),
            "critical section entered while suspended"
        );
        if let Some(top) = ts.critical_top() {
            // Safety: the chain only contains sections currently held by
            // this thread, which outlive their containment in the chain.
            let top = unsafe { top.as_ref() };
            assert!(
                self.depth < top.depth,
                "critical section entered while already in a deeper one \
                 (held depth {}, entering depth {})",
                top.depth,
                self.depth,
            );
        }
    }
}

impl fmt::Debug for Critical {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Critical")
            .field("depth", &self.depth)
            .field("dummy", &self.dummy)
            .field("locked", &self.lock.is_locked())
            .finish()
    }
}
