// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The hybrid refcount engine.
//!
//! Every increment/decrement reads the object's owner word first:
//!
//! - owner == the calling thread: plain unsynchronized count update (the
//!   fast path),
//! - owner == `Async`: the delta is accumulated in the calling thread's
//!   fixed-size hash table and applied later in one atomic add, so shared
//!   objects never contend on their count,
//! - owner == `StaticInit`: the first toucher claims ownership,
//! - owner == some other thread: that owner is *promoted* to `Async`
//!   through a cooperative handshake, then the operation retries.
//!
//! Decrements on the async path never deallocate; an async object dies
//! when a flush observes its count reaching zero.

use crate::object::{self, Header, Owner};
use crate::state::{self, ThreadState};
use core::cell::Cell;
use core::ptr::NonNull;
use std::sync::atomic::Ordering;

/// One slot of a thread's asynchronous refcount table: an object pointer
/// and its accumulated (signed) delta.
pub(crate) struct AsyncRefEntry {
    obj: Cell<*mut Header>,
    diff: Cell<isize>,
}

// === impl AsyncRefEntry ===

impl AsyncRefEntry {
    pub(crate) fn empty() -> Self {
        Self {
            obj: Cell::new(core::ptr::null_mut()),
            diff: Cell::new(0),
        }
    }
}

/// Finds the table slot for `ptr`, flushing whatever collides with it.
///
/// The hash folds three right-shifts of the address into the low bits, the
/// table size being a power of two.
fn table_entry<'ts>(ts: &'ts ThreadState, ptr: NonNull<Header>) -> &'ts AsyncRefEntry {
    let addr = ptr.as_ptr() as usize;
    let index = (addr ^ (addr >> 3) ^ (addr >> 7) ^ (addr >> 17)) & (ts.async_refs.len() - 1);

    let entry = &ts.async_refs[index];
    let current = entry.obj.get();
    if current.is_null() || core::ptr::eq(current, ptr.as_ptr()) {
        return entry;
    }
    flush_entry(entry);
    entry
}

/// Accumulates `delta` for `ptr` in the calling thread's table. A slot
/// whose delta returns to zero is released.
fn accumulate(ts: &ThreadState, ptr: NonNull<Header>, delta: isize) {
    let entry = table_entry(ts, ptr);
    let diff = entry.diff.get() + delta;
    entry.diff.set(diff);
    if diff == 0 {
        entry.obj.set(core::ptr::null_mut());
    } else {
        entry.obj.set(ptr.as_ptr());
    }
}

/// Applies one slot's pending delta to its object with a single atomic
/// add, then releases the slot. A flush that takes the count to zero owns
/// the object's death.
fn flush_entry(entry: &AsyncRefEntry) {
    let obj = entry.obj.get();
    debug_assert!(!obj.is_null());
    let diff = entry.diff.get();
    entry.obj.set(core::ptr::null_mut());
    entry.diff.set(0);

    // Safety: a pending delta keeps its object alive; the entry held
    // references that have not been applied yet.
    let header = unsafe { &*obj };
    #[expect(clippy::cast_sign_loss, reason = "two's complement wrapping add")]
    let new = header
        .refcnt()
        .fetch_add(diff as usize, Ordering::SeqCst)
        .wrapping_add(diff as usize);

    if new == 0 {
        // Safety: the count is zero, so no references remain anywhere once
        // every table has flushed; claiming ownership makes the death
        // race-free against concurrent flushes.
        unsafe { reap_async(molt_util::non_null(obj)) };
    }
}

/// Deallocates an async-owned object whose count just reached zero.
///
/// # Safety
///
/// `ptr` must point to a live object whose refcount is zero.
unsafe fn reap_async(ptr: NonNull<Header>) {
    // Safety: ensured by caller.
    let header = unsafe { ptr.as_ref() };
    let me = state::with_current(|ts| ts.id());

    // Claim the object for this thread; if another flush beat us to it,
    // that flush owns the death.
    if header
        .compare_exchange_owner(Owner::Async, Owner::Thread(me))
        .is_err()
    {
        return;
    }
    if header.refcnt().load(Ordering::SeqCst) != 0 {
        // A racing flush re-raised the count between our add and the
        // claim; hand the object back.
        header.store_owner(Owner::Async);
        return;
    }

    // Represent the phantom final reference so the dealloc protocol (which
    // checks for a count of exactly one) can run unchanged.
    header.refcnt().store(1, Ordering::Relaxed);
    tracing::trace!(obj.addr = ?ptr, "async refcount reached zero");
    // Safety: we own the final reference.
    unsafe { object::dealloc(ptr) };
}

/// Increments the object's strong count.
///
/// # Panics
///
/// Panics if the calling thread is not attached, is suspended, or the
/// object is already deallocated.
pub(crate) fn incref(ptr: NonNull<Header>) {
    state::with_current(|ts| {
        debug_assert!(!ts.is_suspended(), "incref while suspended");
        // Safety: the caller's reference keeps the header alive.
        let header = unsafe { ptr.as_ref() };

        loop {
            match header.load_owner(Ordering::Acquire) {
                Owner::Async => {
                    accumulate(ts, ptr, 1);
                    return;
                }
                Owner::Thread(id) if id == ts.id() => {
                    let count = header.refcnt().load(Ordering::Relaxed);
                    header.refcnt().store(count + 1, Ordering::Relaxed);
                    return;
                }
                Owner::Deleted => panic!("incref on deallocated object"),
                _ => promote(ptr, ts),
            }
        }
    });
}

/// Decrements the object's strong count, deallocating on the owned path
/// when it reaches zero.
///
/// # Panics
///
/// Panics if the calling thread is not attached, is suspended, or the
/// object is already deallocated.
pub(crate) fn decref(ptr: NonNull<Header>) {
    state::with_current(|ts| {
        debug_assert!(!ts.is_suspended(), "decref while suspended");
        // Safety: the caller's reference keeps the header alive.
        let header = unsafe { ptr.as_ref() };

        loop {
            match header.load_owner(Ordering::Acquire) {
                Owner::Async => {
                    // Never deallocates on this path.
                    accumulate(ts, ptr, -1);
                    return;
                }
                Owner::Thread(id) if id == ts.id() => {
                    let count = header.refcnt().load(Ordering::Relaxed);
                    debug_assert!(count > 0, "negative refcount");
                    if count > 1 {
                        header.refcnt().store(count - 1, Ordering::Relaxed);
                    } else {
                        // Safety: we hold the final reference.
                        unsafe { object::dealloc(ptr) };
                    }
                    return;
                }
                Owner::Deleted => panic!("decref on deallocated object"),
                _ => promote(ptr, ts),
            }
        }
    });
}

/// A decrement that is guaranteed not to run the destructor synchronously:
/// the object is forced onto the async path first. Destructor-cleanup code
/// uses this to break recursion.
pub(crate) fn decref_async(ptr: NonNull<Header>) {
    state::with_current(|ts| {
        debug_assert!(!ts.is_suspended(), "decref_async while suspended");
        // Safety: the caller's reference keeps the header alive.
        let header = unsafe { ptr.as_ref() };

        loop {
            match header.load_owner(Ordering::Acquire) {
                Owner::Async => {
                    accumulate(ts, ptr, -1);
                    return;
                }
                Owner::Deleted => panic!("decref_async on deallocated object"),
                _ => promote(ptr, ts),
            }
        }
    });
}

/// Moves the object's owner one step toward `Async`. May fail to make
/// visible progress (another thread can win the race); callers loop.
fn promote(ptr: NonNull<Header>, ts: &ThreadState) {
    // Safety: the caller's reference keeps the header alive.
    let header = unsafe { ptr.as_ref() };

    match header.load_owner(Ordering::Acquire) {
        Owner::StaticInit => {
            // Statically initialized objects are claimed by their first
            // toucher.
            let _ = header.compare_exchange_owner(Owner::StaticInit, Owner::Thread(ts.id()));
        }
        Owner::Async => {}
        Owner::Deleted => panic!("promote on deallocated object"),
        Owner::Thread(id) if id == ts.id() => {
            // Self-promotion (decref_async on an owned object) needs no
            // handshake: nobody else is mutating the count unsynchronized.
            let _ = header.compare_exchange_owner(Owner::Thread(id), Owner::Async);
        }
        Owner::Thread(id) => {
            tracing::trace!(obj.addr = ?ptr, owner.id = id, "promoting refcount owner");
            match ts.runtime().thread_by_id(id) {
                None => {
                    // The owner has detached (flushing its table on the way
                    // out), so nobody mutates the count unsynchronized
                    // anymore.
                    let _ = header.compare_exchange_owner(Owner::Thread(id), Owner::Async);
                }
                Some(owner) => {
                    owner.inspect_count.fetch_add(1, Ordering::SeqCst);
                    state::suspend_ts(ts);

                    let queue_guard = owner.inspect_queue_lock.lock();
                    owner.inspect_flag.store(true, Ordering::SeqCst);
                    let lock_guard = owner.inspect_lock.lock();
                    owner.inspect_flag.store(false, Ordering::SeqCst);
                    drop(queue_guard);

                    // The owner is parked in its tick (or suspended): we
                    // have exclusive access to the owner field. Another
                    // thread may have already changed it, hence the
                    // compare-and-swap.
                    let _ = header.compare_exchange_owner(Owner::Thread(id), Owner::Async);

                    drop(lock_guard);
                    state::resume_ts(ts);
                    owner.inspect_count.fetch_sub(1, Ordering::SeqCst);
                }
            }
        }
    }
}

/// The refcount as seen by the calling thread: exact for the owner, a
/// large sentinel for everyone else.
pub(crate) fn snoop(ptr: NonNull<Header>) -> usize {
    state::with_current(|ts| {
        // Safety: the caller's reference keeps the header alive.
        let header = unsafe { ptr.as_ref() };
        match header.load_owner(Ordering::Acquire) {
            Owner::Thread(id) if id == ts.id() => header.refcnt().load(Ordering::Relaxed),
            _ => 1_000_000,
        }
    })
}

/// Flushes the calling thread's entire asynchronous refcount table,
/// applying each pending delta with one atomic add. Called before detach
/// and at interpreter checkpoints; after every thread has flushed,
/// refcount conservation is strict.
pub fn flush_async_refcounts() {
    state::with_current(|ts| {
        for entry in ts.async_refs.iter() {
            if !entry.obj.get().is_null() {
                flush_entry(entry);
            }
            debug_assert!(entry.obj.get().is_null());
            debug_assert_eq!(entry.diff.get(), 0);
        }
    });
}

pub(crate) use self::flush_async_refcounts as flush_current;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::values;
    use crate::state::Runtime;
    use std::sync::Arc;

    #[test]
    fn cross_thread_drop_promotes_to_async() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::int(11);
        let theirs = obj.clone();

        let worker = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            move || {
                let frame = runtime.enter();
                // First touch from another thread promotes the owner; the
                // decrement lands in this thread's async table and is
                // flushed by the detach below.
                drop(theirs);
                frame.exit();
            }
        });

        // Joining is a blocking call: bracket it with suspend/resume so
        // the worker's promotion handshake can proceed against us.
        crate::state::suspend();
        worker.join().unwrap();
        crate::state::resume();

        // The object is now async-owned; snoop returns the sentinel.
        assert_eq!(obj.refcnt_snoop(), 1_000_000);

        drop(obj);
        flush_async_refcounts();

        frame.exit();
    }

    #[test]
    fn async_object_dies_at_flush() {
        use std::sync::atomic::{AtomicUsize, Ordering};

        struct Probe(Arc<AtomicUsize>);
        impl crate::object::ObjectPayload for Probe {
            const NAME: &'static str = "probe";
            const FLAGS: crate::object::TypeFlags = crate::object::TypeFlags::empty();
        }
        impl Drop for Probe {
            fn drop(&mut self) {
                self.0.fetch_add(1, Ordering::SeqCst);
            }
        }

        let runtime = Runtime::new();
        let frame = runtime.enter();

        let drops = Arc::new(AtomicUsize::new(0));
        let obj = crate::object::ObjectRef::new(Probe(drops.clone()));

        let theirs = obj.clone();
        let worker = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            move || {
                let frame = runtime.enter();
                drop(theirs);
                frame.exit();
            }
        });
        crate::state::suspend();
        worker.join().unwrap();
        crate::state::resume();

        // Our final decrement sits in the async table until flushed.
        drop(obj);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        flush_async_refcounts();
        assert_eq!(drops.load(Ordering::SeqCst), 1);

        frame.exit();
    }

    #[test]
    fn many_threads_conserve_the_count() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::string("contended");
        let workers: Vec<_> = (0..4)
            .map(|_| {
                let runtime = Arc::clone(&runtime);
                let theirs = obj.clone();
                std::thread::spawn(move || {
                    let frame = runtime.enter();
                    for _ in 0..1000 {
                        let extra = theirs.clone();
                        drop(extra);
                    }
                    drop(theirs);
                    frame.exit();
                })
            })
            .collect();

        crate::state::suspend();
        for worker in workers {
            worker.join().unwrap();
        }
        crate::state::resume();

        // All worker tables flushed at detach; only our reference remains,
        // pending our own table.
        drop(obj);
        flush_async_refcounts();

        frame.exit();
    }

    #[test]
    fn static_init_objects_are_claimed_on_first_touch() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = crate::object::ObjectRef::new_static_init(values::Int(5));
        // Unowned until touched; snoop sees the sentinel.
        assert_eq!(obj.refcnt_snoop(), 1_000_000);

        // The first refcount operation claims ownership for this thread.
        let clone = obj.clone();
        assert_eq!(obj.refcnt_snoop(), 2);

        drop(clone);
        drop(obj);
        frame.exit();
    }

    #[cfg(loom)]
    mod loom_tests {
        use super::super::*;
        use crate::loom;
        use crate::object::values;
        use crate::state::Runtime;
        #[test]
        fn concurrent_clones_balance() {
            loom::model(|| {
                let runtime = Runtime::new();
                let frame = runtime.enter();
                let obj = values::int(1);
                let theirs = obj.clone();

                let worker = loom::thread::spawn({
                    let runtime = std::sync::Arc::clone(&runtime);
                    move || {
                        let frame = runtime.enter();
                        drop(theirs);
                        frame.exit();
                    }
                });

                crate::state::suspend();
                worker.join().unwrap();
                crate::state::resume();

                drop(obj);
                flush_async_refcounts();
                frame.exit();
            });
        }
    }
}
