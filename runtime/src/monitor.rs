// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Monitor spaces: the mutual-exclusion domains mutable objects live in.
//!
//! A [`MonitorSpace`] is a fair FIFO mutex with a waiter queue. A
//! [`Monitor`] is bound to exactly one space at construction and never
//! migrates; all access to its data goes through the space, which is what
//! makes writes in one thread happen-before reads in the next.
//!
//! Values passed into and out of a space through the object-level entry
//! point must be shareable; that gate is what permits objects to move
//! between spaces without data races.

use crate::error::Error;
use crate::object::ObjectRef;
use crate::park::{Parker, UnparkToken};
use crate::shareable::{require_shareable, require_shareable_args};
use crate::state::{self, ThreadState};
use crate::sync;
use core::cell::UnsafeCell;
use core::fmt;
use std::collections::VecDeque;
use std::sync::Arc;

/// A fair FIFO mutual-exclusion domain.
pub struct MonitorSpace {
    inner: sync::Mutex<SpaceInner>,
}

struct SpaceInner {
    /// Thread id of the current holder.
    holder: Option<u64>,
    /// Waiting threads, woken in arrival order; the unlock path hands the
    /// space directly to the first waiter.
    waiters: VecDeque<(u64, UnparkToken)>,
}

// === impl MonitorSpace ===

impl MonitorSpace {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            inner: sync::Mutex::new(SpaceInner {
                holder: None,
                waiters: VecDeque::new(),
            }),
        })
    }

    /// The innermost monitor space of the calling thread, creating one
    /// lazily at the outermost frame if none exists.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached.
    pub fn current() -> Arc<MonitorSpace> {
        state::with_current(|ts| match ts.current_monitor_space() {
            Some(space) => space,
            None => {
                let space = MonitorSpace::new();
                ts.fill_monitor_space(Arc::clone(&space));
                space
            }
        })
    }

    /// Whether the calling thread is inside this space (it is the
    /// innermost frame on the thread's monitor stack).
    pub fn is_current(&self) -> bool {
        state::with_current(|ts| {
            ts.current_monitor_space()
                .is_some_and(|space| core::ptr::eq(&*space, self))
        })
    }

    /// Runs `f` with this space held, blocking until it is free. Waiters
    /// acquire the space in FIFO order.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread holds a critical section or already
    /// holds this space (monitor spaces are not reentrant).
    pub fn enter<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> R {
        let ts = state::current();
        self.lock_enter(&ts);

        let guard = SpaceGuard {
            space: self,
            ts: &ts,
        };
        ts.push_monitor_space(Arc::clone(self));
        let result = f();
        drop(guard);
        result
    }

    /// Like [`enter`](Self::enter), but fails instead of blocking when the
    /// space is held elsewhere.
    ///
    /// # Errors
    ///
    /// Returns a `State` error when the space is currently held.
    pub fn try_enter<R>(self: &Arc<Self>, f: impl FnOnce() -> R) -> Result<R, Error> {
        let ts = state::current();
        assert!(
            ts.critical_top().is_none(),
            "cannot enter a monitor space while in a critical section"
        );

        {
            let mut inner = self.inner.lock();
            if inner.holder.is_some() {
                return Err(Error::state("monitor space is held by another thread"));
            }
            inner.holder = Some(ts.id());
        }

        let guard = SpaceGuard {
            space: self,
            ts: &ts,
        };
        ts.push_monitor_space(Arc::clone(self));
        let result = f();
        drop(guard);
        Ok(result)
    }

    /// The object-level entry point: runs `f(args)` inside the space,
    /// enforcing that the arguments and the returned value are shareable.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if an argument or the return value is not
    /// shareable, or whatever error `f` itself returns.
    pub fn enter_shared(
        self: &Arc<Self>,
        args: &[ObjectRef],
        f: impl FnOnce(&[ObjectRef]) -> Result<ObjectRef, Error>,
    ) -> Result<ObjectRef, Error> {
        require_shareable_args(args, "monitor_space.enter() argument")?;
        let result = self.enter(|| f(args))?;
        require_shareable(&result, "monitor_space.enter() return value")?;
        Ok(result)
    }

    fn lock_enter(&self, ts: &ThreadState) {
        assert!(
            ts.critical_top().is_none(),
            "cannot enter a monitor space while in a critical section"
        );

        let me = ts.id();
        let parker: Parker = ts.parker.clone();

        state::suspend_ts(ts);
        {
            let mut inner = self.inner.lock();
            assert!(
                inner.holder != Some(me),
                "monitor space is not reentrant"
            );
            if inner.holder.is_none() {
                inner.holder = Some(me);
            } else {
                inner.waiters.push_back((me, parker.unpark_token()));
                loop {
                    drop(inner);
                    parker.park();
                    inner = self.inner.lock();
                    if inner.holder == Some(me) {
                        break;
                    }
                }
            }
        }
        state::resume_ts(ts);
    }

    fn lock_exit(&self, ts: &ThreadState) {
        state::suspend_ts(ts);
        {
            let mut inner = self.inner.lock();
            assert_eq!(inner.holder, Some(ts.id()), "monitor space exited by non-holder");
            match inner.waiters.pop_front() {
                Some((next, token)) => {
                    // Hand the space to the first waiter directly; it wakes
                    // up already owning the lock.
                    inner.holder = Some(next);
                    drop(inner);
                    token.unpark();
                }
                None => inner.holder = None,
            }
        }
        state::resume_ts(ts);
    }
}

impl fmt::Debug for MonitorSpace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        f.debug_struct("MonitorSpace")
            .field("holder", &inner.holder)
            .field("waiters", &inner.waiters.len())
            .finish()
    }
}

/// Pops the frame and releases the space, including on unwind.
struct SpaceGuard<'a> {
    space: &'a Arc<MonitorSpace>,
    ts: &'a ThreadState,
}

impl Drop for SpaceGuard<'_> {
    fn drop(&mut self) {
        let popped = self.ts.pop_monitor_space();
        debug_assert!(core::ptr::eq(&*popped, &**self.space));
        self.space.lock_exit(self.ts);
    }
}

/// Data bound to a [`MonitorSpace`] for life; every access happens inside
/// the space.
pub struct Monitor<T> {
    space: Arc<MonitorSpace>,
    data: UnsafeCell<T>,
}

// Safety: `data` is only reachable through the space, which hands it to
// one thread at a time.
unsafe impl<T: Send> Send for Monitor<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Monitor<T> {}

// === impl Monitor ===

impl<T> Monitor<T> {
    /// Creates a fresh space and constructs the data inside it (the
    /// monitor-metaclass behavior: even the constructor runs under the
    /// space).
    pub fn new(init: impl FnOnce() -> T) -> Arc<Monitor<T>> {
        Self::new_in(MonitorSpace::new(), init)
    }

    /// Constructs a monitor bound to an existing space.
    pub fn new_in(space: Arc<MonitorSpace>, init: impl FnOnce() -> T) -> Arc<Monitor<T>> {
        let data = space.enter(|| UnsafeCell::new(init()));
        Arc::new(Monitor { space, data })
    }

    pub fn space(&self) -> &Arc<MonitorSpace> {
        &self.space
    }

    /// Runs `f` on the data with the monitor's space held.
    pub fn with<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        self.space.enter(|| {
            // Safety: we hold the space, which is the exclusive gate to
            // the data.
            f(unsafe { &mut *self.data.get() })
        })
    }

    /// Like [`with`](Self::with) but failing instead of blocking.
    ///
    /// # Errors
    ///
    /// Returns a `State` error when the space is held by another thread.
    pub fn try_with<R>(&self, f: impl FnOnce(&mut T) -> R) -> Result<R, Error> {
        self.space.try_enter(|| {
            // Safety: we hold the space, which is the exclusive gate to
            // the data.
            f(unsafe { &mut *self.data.get() })
        })
    }
}

impl<T> fmt::Debug for Monitor<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Monitor").field("space", &self.space).finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Runtime;
    use std::time::Duration;

    #[test]
    fn enter_is_exclusive_and_nestable_across_spaces() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let a = MonitorSpace::new();
        let b = MonitorSpace::new();

        a.enter(|| {
            assert!(a.is_current());
            b.enter(|| {
                assert!(b.is_current());
                assert!(!a.is_current());
            });
            assert!(a.is_current());
        });

        frame.exit();
    }

    #[test]
    fn current_creates_lazily_and_sticks() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let space = MonitorSpace::current();
        let again = MonitorSpace::current();
        assert!(Arc::ptr_eq(&space, &again));
        assert!(space.is_current());

        frame.exit();
    }

    #[test]
    fn monitor_serializes_access() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let counter = Monitor::new(|| 0_u64);
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let counter = Arc::clone(&counter);
                std::thread::spawn(move || {
                    let frame = runtime.enter();
                    for _ in 0..100 {
                        counter.with(|count| *count += 1);
                    }
                    frame.exit();
                })
            })
            .collect();

        crate::state::suspended(|| {
            for worker in workers {
                worker.join().unwrap();
            }
        });

        assert_eq!(counter.with(|count| *count), 400);
        frame.exit();
    }

    #[test]
    fn get_current_inside_monitor_call_returns_its_space() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let monitor = Monitor::new(|| ());
        let space = Arc::clone(monitor.space());
        monitor.with(|()| {
            assert!(space.is_current());
            let current = MonitorSpace::current();
            assert!(Arc::ptr_eq(&current, &space));
        });

        frame.exit();
    }

    #[test]
    fn try_with_fails_while_held() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let monitor = Monitor::new(|| 1_i32);

        let holder = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            let monitor = Arc::clone(&monitor);
            move || {
                let frame = runtime.enter();
                monitor.with(|_| std::thread::sleep(Duration::from_millis(100)));
                frame.exit();
            }
        });

        // Wait until the worker actually holds the space.
        while monitor.space().inner.lock().holder.is_none() {
            std::thread::yield_now();
        }
        let err = monitor.try_with(|_| ()).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::State);

        crate::state::suspended(|| holder.join().unwrap());
        frame.exit();
    }

    #[test]
    fn enter_shared_gates_arguments_and_result() {
        use crate::object::values;

        let runtime = Runtime::new();
        let frame = runtime.enter();

        let space = MonitorSpace::new();

        let ok = space
            .enter_shared(&[values::int(1)], |args| {
                Ok(values::int(values::as_int(&args[0]).unwrap() + 1))
            })
            .unwrap();
        assert_eq!(values::as_int(&ok), Some(2));

        let unshareable = values::list(vec![]);
        let err = space
            .enter_shared(core::slice::from_ref(&unshareable), |_| Ok(values::unit()))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Type);

        let err = space
            .enter_shared(&[], |_| Ok(values::list(vec![])))
            .unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Type);

        drop(unshareable);
        frame.exit();
    }

    #[test]
    #[should_panic(expected = "not reentrant")]
    fn reentering_a_space_panics() {
        let runtime = Runtime::new();
        let _frame = runtime.enter();

        let space = MonitorSpace::new();
        space.enter(|| {
            let inner = Arc::clone(&space);
            inner.enter(|| {});
        });
    }
}
