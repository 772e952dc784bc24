// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::loom::cell::UnsafeCell;
use crate::loom::sync::atomic::{AtomicBool, Ordering};
use crate::sync::Backoff;
use core::marker::PhantomData;
use core::ops::{Deref, DerefMut};
use core::{fmt, mem};
use molt_util::loom_const_fn;

/// A spinning mutual exclusion primitive for short critical regions.
///
/// Waiting threads spin (with [`Backoff`]) rather than blocking in the OS,
/// so this lock must only guard brief, bounded work: list surgery, state
/// transitions, counter updates. Callers that may wait indefinitely go
/// through [`crate::park`] instead.
///
/// The lock can be statically initialized. Data is only reachable through
/// the RAII [`MutexGuard`].
pub struct Mutex<T> {
    lock: AtomicBool,
    data: UnsafeCell<T>,
}

/// An RAII guard; the lock is released when this falls out of scope.
#[clippy::has_significant_drop]
#[must_use = "if unused the Mutex will immediately unlock"]
pub struct MutexGuard<'a, T> {
    mutex: &'a Mutex<T>,
    marker: PhantomData<&'a mut T>,
}

// Safety: the lock protocol hands out exclusive access to the data, so the
// mutex is Send/Sync whenever moving the data across threads is.
unsafe impl<T: Send> Send for Mutex<T> {}
// Safety: see above.
unsafe impl<T: Send> Sync for Mutex<T> {}

// === impl Mutex ===

impl<T> Mutex<T> {
    loom_const_fn! {
        pub const fn new(val: T) -> Mutex<T> {
            Mutex {
                lock: AtomicBool::new(false),
                data: UnsafeCell::new(val),
            }
        }
    }

    /// Consumes this mutex, returning the underlying data.
    #[inline]
    pub fn into_inner(self) -> T {
        self.data.into_inner()
    }
}

impl<T> Mutex<T> {
    /// Creates a `MutexGuard` without acquiring the lock.
    ///
    /// # Safety
    ///
    /// The calling thread must logically hold the lock, and no other guard
    /// for it may be live (unless forgotten with `mem::forget`).
    #[inline]
    pub unsafe fn make_guard_unchecked(&self) -> MutexGuard<'_, T> {
        MutexGuard {
            mutex: self,
            marker: PhantomData,
        }
    }

    /// Acquires the mutex, spinning until it is available.
    ///
    /// Attempting to lock a mutex on the thread that already holds it will
    /// spin forever.
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T> {
        let mut boff = Backoff::default();
        while self
            .lock
            .compare_exchange(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            while self.is_locked() {
                boff.spin();
            }
        }

        // Safety: the lock is held, as required.
        unsafe { self.make_guard_unchecked() }
    }

    /// Attempts to acquire this lock without spinning.
    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T>> {
        if self
            .lock
            .compare_exchange_weak(false, true, Ordering::Acquire, Ordering::Relaxed)
            .is_ok()
        {
            // Safety: the lock is held, as required.
            Some(unsafe { self.make_guard_unchecked() })
        } else {
            None
        }
    }

    /// Returns a mutable reference to the underlying data without locking;
    /// the exclusive borrow of `self` already guarantees exclusivity.
    #[inline]
    pub fn get_mut(&mut self) -> &mut T {
        // Safety: `&mut self` proves no guard is live.
        self.data.with_mut(|data| unsafe { &mut *data })
    }

    #[inline]
    pub fn is_locked(&self) -> bool {
        self.lock.load(Ordering::Relaxed)
    }

    /// Forcibly unlocks the mutex.
    ///
    /// # Safety
    ///
    /// The current thread must logically own a `MutexGuard` that was
    /// discarded with `mem::forget`. Unlocking a mutex that is not locked
    /// is undefined behavior.
    #[inline]
    pub unsafe fn force_unlock(&self) {
        self.lock.store(false, Ordering::Release);
    }
}

impl<T: Default> Default for Mutex<T> {
    #[inline]
    fn default() -> Mutex<T> {
        Mutex::new(T::default())
    }
}

impl<T> From<T> for Mutex<T> {
    #[inline]
    fn from(t: T) -> Mutex<T> {
        Mutex::new(t)
    }
}

impl<T: fmt::Debug> fmt::Debug for Mutex<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.try_lock() {
            Some(guard) => f.debug_struct("Mutex").field("data", &&*guard).finish(),
            None => f.debug_struct("Mutex").field("data", &"<locked>").finish(),
        }
    }
}

// === impl MutexGuard ===

// Safety: the guard only hands out references derived from the mutex, so it
// is Sync whenever the data is.
unsafe impl<'a, T: Sync + 'a> Sync for MutexGuard<'a, T> {}

impl<'a, T: 'a> MutexGuard<'a, T> {
    /// Returns a reference to the original mutex.
    pub fn mutex(s: &Self) -> &'a Mutex<T> {
        s.mutex
    }

    /// Temporarily releases the lock while running `f`, reacquiring it
    /// before returning. Used by wake paths that must not invoke foreign
    /// code while the lock is held.
    pub fn unlocked<F, U>(s: &mut Self, f: F) -> U
    where
        F: FnOnce() -> U,
    {
        struct Relock<'a, T> {
            mutex: &'a Mutex<T>,
        }
        impl<T> Drop for Relock<'_, T> {
            fn drop(&mut self) {
                mem::forget(self.mutex.lock());
            }
        }

        // Safety: a `MutexGuard` always holds the lock.
        unsafe {
            s.mutex.force_unlock();
        }
        let _relock = Relock { mutex: s.mutex };
        f()
    }
}

impl<'a, T: 'a> Deref for MutexGuard<'a, T> {
    type Target = T;
    #[inline]
    fn deref(&self) -> &T {
        // Safety: a `MutexGuard` always holds the lock.
        self.mutex.data.with(|data| unsafe { &*data })
    }
}

impl<'a, T: 'a> DerefMut for MutexGuard<'a, T> {
    #[inline]
    fn deref_mut(&mut self) -> &mut T {
        // Safety: a `MutexGuard` always holds the lock.
        self.mutex.data.with_mut(|data| unsafe { &mut *data })
    }
}

impl<'a, T: 'a> Drop for MutexGuard<'a, T> {
    #[inline]
    fn drop(&mut self) {
        // Safety: a `MutexGuard` always holds the lock.
        unsafe {
            self.mutex.force_unlock();
        }
    }
}

impl<'a, T: fmt::Debug + 'a> fmt::Debug for MutexGuard<'a, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&**self, f)
    }
}

#[cfg(feature = "lock_api")]
// Safety: lock/unlock forward to the spin lock's own protocol.
unsafe impl lock_api::RawMutex for Mutex<()> {
    #[allow(clippy::declare_interior_mutable_const, reason = "required by the trait")]
    const INIT: Self = Mutex::new(());
    type GuardMarker = lock_api::GuardSend;

    fn lock(&self) {
        let g = Mutex::lock(self);
        mem::forget(g);
    }

    fn try_lock(&self) -> bool {
        let g = Mutex::try_lock(self);
        let ret = g.is_some();
        mem::forget(g);
        ret
    }

    unsafe fn unlock(&self) {
        // Safety: ensured by caller
        unsafe {
            Mutex::force_unlock(self);
        }
    }

    fn is_locked(&self) -> bool {
        Mutex::is_locked(self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::loom;
    use crate::loom::sync::Arc;

    #[derive(Eq, PartialEq, Debug)]
    struct NonCopy(i32);

    #[test]
    fn smoke() {
        let m = Mutex::new(());
        drop(m.lock());
        drop(m.lock());
    }

    #[test]
    fn try_lock() {
        let mutex = Mutex::new(42);

        let a = mutex.try_lock();
        assert_eq!(a.as_ref().map(|r| **r), Some(42));

        // Second lock fails while the first guard is live.
        let b = mutex.try_lock();
        assert!(b.is_none());

        drop(a);
        let c = mutex.try_lock();
        assert_eq!(c.as_ref().map(|r| **r), Some(42));
    }

    #[test]
    fn into_inner() {
        let m = Mutex::new(NonCopy(10));
        assert_eq!(m.into_inner(), NonCopy(10));
    }

    #[test]
    fn get_mut() {
        let mut m = Mutex::new(NonCopy(10));
        *m.get_mut() = NonCopy(20);
        assert_eq!(m.into_inner(), NonCopy(20));
    }

    #[test]
    fn unlocked_releases_and_reacquires() {
        let m = Mutex::new(1);
        let mut guard = m.lock();
        MutexGuard::unlocked(&mut guard, || {
            assert!(!m.is_locked());
        });
        assert!(m.is_locked());
        *guard += 1;
        drop(guard);
        assert_eq!(m.into_inner(), 2);
    }

    #[test]
    fn basic_multi_threaded() {
        use crate::loom::thread;

        fn incr(lock: &Arc<Mutex<i32>>) -> thread::JoinHandle<()> {
            let lock = lock.clone();
            thread::spawn(move || {
                let mut lock = lock.lock();
                *lock += 1;
            })
        }

        loom::model(|| {
            let lock = Arc::new(Mutex::new(0));
            let t1 = incr(&lock);
            let t2 = incr(&lock);

            t1.join().unwrap();
            t2.join().unwrap();

            assert_eq!(*lock.lock(), 2);
        });
    }
}
