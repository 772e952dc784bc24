// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Death queues: post-mortem notification without callbacks.
//!
//! `watch(obj, payload)` associates a shareable payload with an object;
//! when the object is finalized the handle moves from the queue's live
//! list to its dead list and `pop` yields the payload. Cancellation is
//! idempotent; a handle belongs to exactly one of {live, dead, cancelled}.

use crate::cancel::SignalGuard;
use crate::critical::{CRITICAL_WEAKREF_HANDLE, CRITICAL_WEAKREF_QUEUE, Critical};
use crate::error::Error;
use crate::object::ObjectRef;
use crate::park::UnparkToken;
use crate::shareable::require_shareable;
use crate::state;
use crate::weakref::{self, WeakCore};
use core::cell::UnsafeCell;
use core::fmt;
use core::time::Duration;
use std::collections::VecDeque;
use std::sync::Arc;
use std::vec::Vec;

/// How long a blocked `pop`/`wait` parks before re-checking.
const PARK_SLICE: Duration = Duration::from_millis(10);

/// Shared state of one handle. All fields are guarded by `crit`; the
/// queue's lists hold strong references to the handle, the handle holds
/// strong references to its payload, weakref and queue.
pub(crate) struct HandleCore {
    crit: Critical,
    state: UnsafeCell<HandleState>,
}

struct HandleState {
    payload: Option<ObjectRef>,
    weakref: Option<Arc<WeakCore>>,
    queue: Option<Arc<QueueCore>>,
}

// Safety: `state` is guarded by `crit`.
unsafe impl Send for HandleCore {}
// Safety: see above.
unsafe impl Sync for HandleCore {}

pub(crate) struct QueueCore {
    crit: Critical,
    live: UnsafeCell<Vec<Arc<HandleCore>>>,
    dead: UnsafeCell<VecDeque<Arc<HandleCore>>>,
    /// Threads blocked in `wait`; every append to the dead list wakes all
    /// of them (wake-ups may be spurious).
    waiters: UnsafeCell<Vec<UnparkToken>>,
}

// Safety: all interior state is guarded by `crit`.
unsafe impl Send for QueueCore {}
// Safety: see above.
unsafe impl Sync for QueueCore {}

/// A queue that yields a payload after its watched object has been
/// finalized.
///
/// Dropping the queue cancels every remaining handle. Share it across
/// threads behind an `Arc`.
pub struct DeathQueue {
    core: Arc<QueueCore>,
}

/// Identifies one `watch` registration, for [`DeathQueue::cancel`].
#[derive(Clone)]
pub struct DeathQueueHandle {
    core: Arc<HandleCore>,
}

// === impl HandleCore ===

impl HandleCore {
    /// Moves this handle from its queue's live list to the dead list and
    /// wakes the queue's waiters. Called by the weakref clearing path.
    ///
    /// The caller holds the weakref's critical section; this enters the
    /// handle's and then the queue's, in decreasing depth order.
    pub(crate) fn pronounce_dead(self: &Arc<Self>, weak: &Arc<WeakCore>) {
        self.crit.with(|| {
            // Safety: guarded by `crit`.
            let state = unsafe { &mut *self.state.get() };
            let queue = state
                .queue
                .clone()
                .expect("handle on a weakref list without a queue");
            queue.crit.with(|| {
                let dropped_weak = state.weakref.take();
                debug_assert!(
                    dropped_weak.as_ref().is_some_and(|w| Arc::ptr_eq(w, weak)),
                    "handle linked to a different weakref"
                );

                // Safety: guarded by the queue's `crit`.
                unsafe {
                    let live = &mut *queue.live.get();
                    if let Some(index) = live.iter().position(|other| Arc::ptr_eq(other, self)) {
                        let handle = live.remove(index);
                        (*queue.dead.get()).push_back(handle);
                    }
                    queue.wake_all_locked();
                }
            });
        });
    }
}

impl fmt::Debug for DeathQueueHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.core.crit.with(|| {
            // Safety: guarded by `crit`.
            let state = unsafe { &*self.core.state.get() };
            match (&state.queue, &state.weakref) {
                (None, _) => "cancelled/processed",
                (Some(_), Some(_)) => "live",
                (Some(_), None) => "dead",
            }
        });
        write!(f, "<deathqueuehandle at {:p}; {state}>", Arc::as_ptr(&self.core))
    }
}

// === impl QueueCore ===

impl QueueCore {
    /// # Safety
    ///
    /// The caller must hold `self.crit`.
    unsafe fn wake_all_locked(&self) {
        // Safety: guarded by `crit`, held by the caller.
        let waiters = unsafe { &mut *self.waiters.get() };
        for token in waiters.drain(..) {
            token.unpark();
        }
    }
}

// === impl DeathQueue ===

impl Default for DeathQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl DeathQueue {
    pub fn new() -> Self {
        Self {
            core: Arc::new(QueueCore {
                crit: Critical::new(CRITICAL_WEAKREF_QUEUE),
                live: UnsafeCell::new(Vec::new()),
                dead: UnsafeCell::new(VecDeque::new()),
                waiters: UnsafeCell::new(Vec::new()),
            }),
        }
    }

    /// Registers interest in `obj`'s death; once it is finalized, `pop`
    /// yields `payload` (unless the handle is cancelled first).
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if the payload is not shareable or the
    /// object's type does not support weak references.
    pub fn watch(&self, obj: &ObjectRef, payload: ObjectRef) -> Result<DeathQueueHandle, Error> {
        require_shareable(&payload, "deathqueue.watch()'s payload argument")?;
        let weak = weakref::new_ref(obj)?;

        let handle = Arc::new(HandleCore {
            crit: Critical::new(CRITICAL_WEAKREF_HANDLE),
            state: UnsafeCell::new(HandleState {
                payload: Some(payload),
                weakref: Some(Arc::clone(weak.core())),
                queue: Some(Arc::clone(&self.core)),
            }),
        });

        // The handle's own section is skipped: nobody else can reach the
        // handle yet.
        weak.core().crit.with(|| {
            assert!(weak.core().referent().is_some());
            self.core.crit.with(|| {
                // Safety: guarded by the weakref's `crit`.
                unsafe { weak.core().link_handle(Arc::clone(&handle)) };
                // Safety: guarded by the queue's `crit`.
                unsafe { (*self.core.live.get()).push(Arc::clone(&handle)) };
            });
        });

        tracing::trace!(handle.addr = ?Arc::as_ptr(&handle), "deathqueue watch");
        Ok(DeathQueueHandle { core: handle })
    }

    /// Idempotently removes `handle` from whichever list holds it.
    /// Cancelling twice, or cancelling an already-popped handle, is a
    /// no-op.
    ///
    /// # Errors
    ///
    /// Returns a `Value` error if the handle belongs to a different queue.
    pub fn cancel(&self, handle: &DeathQueueHandle) -> Result<(), Error> {
        let core = &handle.core;

        // Climb the ordered sections: snapshot the weakref under the
        // handle's section, then re-enter everything in decreasing depth.
        let weak = core.crit.with(|| {
            // Safety: guarded by `crit`.
            unsafe { (*core.state.get()).weakref.clone() }
        });

        let cleanup = {
            let work = || {
                core.crit.with(|| {
                    // Safety: guarded by `crit`.
                    let state = unsafe { &mut *core.state.get() };
                    match &state.queue {
                        None => Ok(None), // already cleared
                        Some(queue) if !Arc::ptr_eq(queue, &self.core) => {
                            Err(Error::value_error(
                                "cancel called on a handle from a different queue",
                            ))
                        }
                        Some(_) => {
                            let cleared = self.core.crit.with(|| {
                                if let Some(weakref) = state.weakref.take() {
                                    // Safety: we hold the weakref's section
                                    // (entered below before `work`).
                                    unsafe { weakref.unlink_handle(core) };
                                    drop(weakref);
                                }
                                let payload = state.payload.take();
                                let queue = state.queue.take().expect("checked above");
                                // Safety: guarded by the queue's `crit`.
                                unsafe {
                                    let live = &mut *queue.live.get();
                                    if let Some(index) =
                                        live.iter().position(|other| Arc::ptr_eq(other, core))
                                    {
                                        live.remove(index);
                                    } else {
                                        let dead = &mut *queue.dead.get();
                                        if let Some(index) =
                                            dead.iter().position(|other| Arc::ptr_eq(other, core))
                                        {
                                            dead.remove(index);
                                        }
                                    }
                                }
                                payload
                            });
                            Ok(cleared)
                        }
                    }
                })
            };
            match &weak {
                // The weakref section must bracket the whole operation when
                // the handle is still live.
                Some(weak) => weak.crit.with(work),
                None => work(),
            }
        }?;

        // Payload released outside every section; its destructor may
        // re-enter the weakref machinery.
        drop(cleanup);
        Ok(())
    }

    /// Removes and returns one dead payload without blocking.
    ///
    /// # Errors
    ///
    /// Returns a `Value` error if no watched object has died.
    pub fn try_pop(&self) -> Result<ObjectRef, Error> {
        self.pop_common()
            .ok_or_else(|| Error::value_error("trypop from empty deathqueue"))
    }

    /// Blocks until a watched object has died, then returns its payload.
    /// Cancellable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the enclosing scope is cancelled
    /// while blocked.
    pub fn pop(&self) -> Result<ObjectRef, Error> {
        loop {
            self.wait()?;
            if let Some(payload) = self.pop_common() {
                return Ok(payload);
            }
        }
    }

    /// Blocks until the dead list is non-empty. Wake-ups may be spurious:
    /// a subsequent [`try_pop`](Self::try_pop) can still fail. Cancellable.
    ///
    /// # Errors
    ///
    /// Returns [`Error::cancelled`] if the enclosing scope is cancelled
    /// while blocked.
    pub fn wait(&self) -> Result<(), Error> {
        let guard = SignalGuard::enter();
        let token = state::with_current(|ts| ts.parker.unpark_token());
        loop {
            let ready = self.core.crit.with(|| {
                // Safety: guarded by `crit`.
                unsafe {
                    if (*self.core.dead.get()).is_empty() {
                        (*self.core.waiters.get()).push(token.clone());
                        false
                    } else {
                        true
                    }
                }
            });
            if ready {
                return Ok(());
            }
            guard.check()?;
            guard.park(PARK_SLICE);
        }
    }

    /// Whether a dead payload is ready (the non-blocking check).
    pub fn is_ready(&self) -> bool {
        self.core.crit.with(|| {
            // Safety: guarded by `crit`.
            unsafe { !(*self.core.dead.get()).is_empty() }
        })
    }

    fn pop_common(&self) -> Option<ObjectRef> {
        loop {
            let handle = self.core.crit.with(|| {
                // Safety: guarded by `crit`.
                unsafe { (*self.core.dead.get()).front().cloned() }
            });
            let handle = handle?;

            // Re-check after the climb: another consumer may have taken
            // this handle between the peek and here.
            let payload = handle.crit.with(|| {
                self.core.crit.with(|| {
                    // Safety: guarded by the handle's `crit`.
                    let state = unsafe { &mut *handle.state.get() };
                    match &state.queue {
                        Some(queue) if Arc::ptr_eq(queue, &self.core) => {
                            debug_assert!(state.weakref.is_none());
                            // Safety: guarded by the queue's `crit`.
                            unsafe {
                                let dead = &mut *self.core.dead.get();
                                if let Some(index) =
                                    dead.iter().position(|other| Arc::ptr_eq(other, &handle))
                                {
                                    dead.remove(index);
                                }
                            }
                            state.queue = None;
                            Some(state.payload.take().expect("dead handle without payload"))
                        }
                        _ => None,
                    }
                })
            });

            match payload {
                Some(payload) => return Some(payload),
                None => continue,
            }
        }
    }

    fn clear(&self) {
        loop {
            let handle = self.core.crit.with(|| {
                // Safety: guarded by `crit`.
                unsafe {
                    (*self.core.live.get())
                        .first()
                        .cloned()
                        .or_else(|| (*self.core.dead.get()).front().cloned())
                }
            });
            match handle {
                Some(handle) => {
                    self.cancel(&DeathQueueHandle { core: handle })
                        .expect("clearing own queue cannot mismatch");
                }
                None => break,
            }
        }
    }
}

impl Drop for DeathQueue {
    fn drop(&mut self) {
        // Clearing cancels handles, which needs a thread state. A queue
        // dropped after its thread detached can only be empty of live
        // work anyway (handles keep the core alive), so skip it.
        if state::attached() {
            self.clear();
        }
    }
}

impl fmt::Debug for DeathQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (live, dead) = self.core.crit.with(|| {
            // Safety: guarded by `crit`.
            unsafe { ((*self.core.live.get()).len(), (*self.core.dead.get()).len()) }
        });
        f.debug_struct("DeathQueue")
            .field("live", &live)
            .field("dead", &dead)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::values;
    use crate::state::Runtime;

    #[test]
    fn watch_then_death_delivers_payload() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let obj = values::list(vec![]);
        let _handle = queue.watch(&obj, values::int(42)).unwrap();

        assert!(!queue.is_ready());
        drop(obj);
        assert!(queue.is_ready());
        assert_eq!(values::as_int(&queue.pop().unwrap()), Some(42));
        assert!(!queue.is_ready());

        frame.exit();
    }

    #[test]
    fn cancel_before_death_suppresses_delivery() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let obj = values::list(vec![]);
        let handle = queue.watch(&obj, values::int(42)).unwrap();

        queue.cancel(&handle).unwrap();
        drop(obj);
        assert!(!queue.is_ready());

        frame.exit();
    }

    #[test]
    fn cancel_is_idempotent() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let obj = values::list(vec![]);
        let handle = queue.watch(&obj, values::int(1)).unwrap();

        queue.cancel(&handle).unwrap();
        queue.cancel(&handle).unwrap();

        drop(obj);
        queue.cancel(&handle).unwrap();

        frame.exit();
    }

    #[test]
    fn cancel_after_pop_is_a_no_op() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let obj = values::list(vec![]);
        let handle = queue.watch(&obj, values::int(1)).unwrap();

        drop(obj);
        queue.pop().unwrap();
        queue.cancel(&handle).unwrap();

        frame.exit();
    }

    #[test]
    fn cancel_against_wrong_queue_is_a_value_error() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let other = DeathQueue::new();
        let obj = values::list(vec![]);
        let handle = queue.watch(&obj, values::int(1)).unwrap();

        let err = other.cancel(&handle).unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Value);

        queue.cancel(&handle).unwrap();
        drop(obj);
        frame.exit();
    }

    #[test]
    fn trypop_on_empty_queue_is_a_value_error() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let err = queue.try_pop().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Value);

        frame.exit();
    }

    #[test]
    fn multiple_watchers_each_deliver() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = DeathQueue::new();
        let obj = values::list(vec![]);
        let _h1 = queue.watch(&obj, values::int(1)).unwrap();
        let _h2 = queue.watch(&obj, values::int(2)).unwrap();

        drop(obj);
        let mut got = vec![
            values::as_int(&queue.pop().unwrap()).unwrap(),
            values::as_int(&queue.pop().unwrap()).unwrap(),
        ];
        got.sort_unstable();
        assert_eq!(got, vec![1, 2]);

        frame.exit();
    }

    #[test]
    fn pop_blocks_until_death_on_another_thread() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let queue = Arc::new(DeathQueue::new());
        let obj = values::list(vec![]);
        let _handle = queue.watch(&obj, values::int(7)).unwrap();

        let killer = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            move || {
                let frame = runtime.enter();
                std::thread::sleep(core::time::Duration::from_millis(30));
                // The last strong reference dies on this thread; the
                // handle moves to the dead list from here.
                drop(obj);
                crate::refcount::flush_async_refcounts();
                frame.exit();
            }
        });

        let payload = queue.pop().unwrap();
        assert_eq!(values::as_int(&payload), Some(7));

        state::suspended(|| killer.join().unwrap());
        frame.exit();
    }

    #[test]
    fn queue_drop_cancels_outstanding_handles() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::list(vec![]);
        {
            let queue = DeathQueue::new();
            let _handle = queue.watch(&obj, values::int(1)).unwrap();
            // Queue dropped here with a live handle.
        }
        // The object's death now notifies nobody; in particular it must
        // not touch freed queue state.
        drop(obj);

        frame.exit();
    }
}
