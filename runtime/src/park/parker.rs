// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::{Park, StdPark};
use core::time::Duration;
use static_assertions::assert_impl_all;
use std::sync::Arc;

/// A cloneable handle to one thread's parking facility.
///
/// The thread that owns the underlying [`Park`] implementation calls
/// [`park`](Parker::park); any other thread holding an [`UnparkToken`]
/// derived from it can wake it back up.
#[derive(Debug)]
pub(crate) struct Parker<P = StdPark>(Arc<P>);

/// The wake-up half of a [`Parker`], registered with waiter lists
/// (monitor spaces, death queues, cancel scopes) by a thread about to park.
#[derive(Debug, Clone)]
pub(crate) struct UnparkToken<P = StdPark>(Parker<P>);
assert_impl_all!(UnparkToken<StdPark>: Send, Sync);

// === impl Parker ===

impl<P> Clone for Parker<P> {
    fn clone(&self) -> Self {
        Self(Arc::clone(&self.0))
    }
}

impl Parker<StdPark> {
    /// The parker of the calling thread.
    pub(crate) fn current() -> Self {
        Self::new(StdPark::for_current())
    }
}

impl<P: Park> Parker<P> {
    pub(crate) fn new(park_impl: P) -> Self {
        Self(Arc::new(park_impl))
    }

    /// Blocks the calling thread until an [`UnparkToken`] wakes it.
    ///
    /// May wake spuriously; callers re-check their wait condition in a
    /// loop.
    #[inline]
    pub(crate) fn park(&self) {
        self.0.park();
    }

    /// Like [`park`](Self::park), but wakes after `timeout` at the latest.
    #[inline]
    pub(crate) fn park_timeout(&self, timeout: Duration) {
        self.0.park_timeout(timeout);
    }

    /// Convert this `Parker` into an [`UnparkToken`] which can be used to
    /// wake up this thread.
    #[inline]
    pub(crate) fn into_unpark(self) -> UnparkToken<P> {
        UnparkToken(self)
    }

    #[inline]
    pub(crate) fn unpark_token(&self) -> UnparkToken<P> {
        UnparkToken(self.clone())
    }
}

// === impl UnparkToken ===

impl<P: Park> UnparkToken<P> {
    /// Wakes the owning thread. Unparking a thread that is not parked
    /// stores a wake-up permit instead, so the wake cannot be lost.
    #[inline]
    pub(crate) fn unpark(&self) {
        self.0.0.unpark();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::{Arc, mpsc};
    use std::thread;

    #[test]
    fn parking_basically_works() {
        // Thread A parks itself after handing an UnparkToken to thread B
        // through a channel; B uses the token to wake it back up.
        let unparked = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel();

        let a = thread::spawn({
            let unparked = unparked.clone();
            move || {
                let parker = Parker::current();
                tx.send(parker.unpark_token()).unwrap();
                parker.park();
                unparked.store(true, Ordering::Release);
            }
        });

        let b = thread::spawn(move || {
            let unpark = rx.recv().unwrap();
            unpark.unpark();
        });

        a.join().unwrap();
        b.join().unwrap();

        assert!(unparked.load(Ordering::Acquire));
    }

    #[test]
    fn unpark_before_park_is_not_lost() {
        let parker = Parker::current();
        parker.unpark_token().unpark();
        // The stored permit makes this return immediately instead of
        // hanging the test.
        parker.park();
    }

    #[test]
    fn park_timeout_elapses() {
        let parker = Parker::current();
        parker.park_timeout(Duration::from_millis(10));
    }
}
