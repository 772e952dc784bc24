// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use crate::park::{Parker, UnparkToken};
use crate::sync::Mutex;
use std::vec::Vec;

/// A binary semaphore.
///
/// Branch scopes toggle one of these between 0 and 1 on the "any live
/// children" transition: the scope's exit takes the permit and therefore
/// blocks until the last child posts it back.
#[derive(Debug)]
pub(crate) struct Semaphore {
    inner: Mutex<Inner>,
}

#[derive(Debug)]
struct Inner {
    permits: usize,
    waiters: Vec<UnparkToken>,
}

// === impl Semaphore ===

impl Semaphore {
    pub(crate) fn new(permits: usize) -> Self {
        debug_assert!(permits <= 1);
        Self {
            inner: Mutex::new(Inner {
                permits,
                waiters: Vec::new(),
            }),
        }
    }

    /// Takes a permit, blocking until one is available.
    pub(crate) fn wait(&self) {
        let parker = Parker::current();
        loop {
            {
                let mut inner = self.inner.lock();
                if inner.permits > 0 {
                    inner.permits -= 1;
                    return;
                }
                inner.waiters.push(parker.unpark_token());
            }
            parker.park();
        }
    }

    /// Attempts to take a permit without blocking.
    pub(crate) fn try_wait(&self) -> bool {
        let mut inner = self.inner.lock();
        if inner.permits > 0 {
            inner.permits -= 1;
            true
        } else {
            false
        }
    }

    /// Returns a permit, waking one waiter if any are blocked.
    pub(crate) fn post(&self) {
        let token = {
            let mut inner = self.inner.lock();
            debug_assert_eq!(inner.permits, 0, "binary semaphore posted twice");
            inner.permits = 1;
            inner.waiters.pop()
        };
        if let Some(token) = token {
            token.unpark();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn initial_permit_is_taken_without_blocking() {
        let sem = Semaphore::new(1);
        assert!(sem.try_wait());
        assert!(!sem.try_wait());
        sem.post();
        assert!(sem.try_wait());
    }

    #[test]
    fn wait_blocks_until_post() {
        let sem = Arc::new(Semaphore::new(0));
        let waiter = thread::spawn({
            let sem = sem.clone();
            move || sem.wait()
        });

        thread::sleep(Duration::from_millis(20));
        sem.post();
        waiter.join().unwrap();
    }
}
