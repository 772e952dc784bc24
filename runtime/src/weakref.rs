// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Weak references and post-mortem notification.
//!
//! Each object has at most one weak reference, installed by
//! compare-and-swap into its header; later requests return the same one.
//! Weakrefs hold no strong reference and carry no callbacks; all
//! post-mortem work happens on [`DeathQueue`] consumers, after the target
//! has been finalized rather than during its destruction.
//!
//! Teardown touches up to three objects (weakref, handle, queue), each
//! with its own critical section. Deadlock is ruled out by the fixed
//! depth order `WEAKREF_REF > WEAKREF_HANDLE > WEAKREF_QUEUE`: multi-object
//! operations enter sections in strictly decreasing depth, snapshotting
//! under a lower section and re-checking after the climb where necessary.

mod binding;
mod queue;

use crate::critical::{CRITICAL_WEAKREF_REF, Critical};
use crate::error::Error;
use crate::object::{Header, ObjectRef};
use crate::refcount;
use core::cell::UnsafeCell;
use core::fmt;
use core::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::vec::Vec;

pub use binding::WeakBinding;
pub(crate) use binding::BindingCore;
pub use queue::{DeathQueue, DeathQueueHandle};
pub(crate) use queue::HandleCore;

/// Shared state of one object's (unique) weak reference.
///
/// `referent`, the handle list and the binding list are guarded by `crit`.
/// The handle/binding lists are back-references: the entries own strong
/// references *to* this core, and every cross-link is cleared on unlink.
pub(crate) struct WeakCore {
    pub(crate) crit: Critical,
    referent: UnsafeCell<Option<NonNull<Header>>>,
    handles: UnsafeCell<Vec<Arc<HandleCore>>>,
    bindings: UnsafeCell<Vec<Arc<BindingCore>>>,
}

// Safety: all interior state is guarded by `crit`.
unsafe impl Send for WeakCore {}
// Safety: see above.
unsafe impl Sync for WeakCore {}

/// A weak reference to a runtime object.
///
/// Holds no strong reference; [`get`](WeakRef::get) returns the object
/// until its final deallocation and `None` afterwards. For any live
/// object there is exactly one `WeakRef` (clones share it).
#[derive(Clone)]
pub struct WeakRef {
    core: Arc<WeakCore>,
}

// === impl WeakCore ===

impl WeakCore {
    pub(crate) fn referent(&self) -> Option<NonNull<Header>> {
        // Safety: guarded by `crit`; see callers.
        unsafe { *self.referent.get() }
    }

    /// Removes `handle` from the back-reference list.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.crit`.
    pub(crate) unsafe fn unlink_handle(&self, handle: &Arc<HandleCore>) {
        // Safety: guarded by `crit`, held by the caller.
        let handles = unsafe { &mut *self.handles.get() };
        if let Some(index) = handles.iter().position(|other| Arc::ptr_eq(other, handle)) {
            handles.remove(index);
        }
    }

    /// Links a handle while the target is still alive.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.crit`.
    pub(crate) unsafe fn link_handle(&self, handle: Arc<HandleCore>) {
        // Safety: guarded by `crit`, held by the caller.
        unsafe { (*self.handles.get()).push(handle) };
    }

    /// # Safety
    ///
    /// The caller must hold `self.crit`.
    pub(crate) unsafe fn link_binding(&self, binding: Arc<BindingCore>) {
        // Safety: guarded by `crit`, held by the caller.
        unsafe { (*self.bindings.get()).push(binding) };
    }

    /// # Safety
    ///
    /// The caller must hold `self.crit`.
    pub(crate) unsafe fn unlink_binding(&self, binding: &Arc<BindingCore>) {
        // Safety: guarded by `crit`, held by the caller.
        let bindings = unsafe { &mut *self.bindings.get() };
        if let Some(index) = bindings.iter().position(|other| Arc::ptr_eq(other, binding)) {
            bindings.remove(index);
        }
    }
}

impl Drop for WeakCore {
    fn drop(&mut self) {
        // The header's slot holds a strong count while the referent is
        // alive, so a still-valid weakref can never be dropped.
        debug_assert!(
            // Safety: `&mut self` proves exclusivity.
            unsafe { (*self.referent.get()).is_none() },
            "still-valid weakref deleted"
        );
    }
}

// === impl WeakRef ===

impl WeakRef {
    /// The referent, or `None` once it has been finalized.
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached.
    pub fn get(&self) -> Option<ObjectRef> {
        self.core.crit.with(|| {
            self.core.referent().map(|ptr| {
                // The critical section keeps the clearing path out, so the
                // header cannot be freed under us; the incref may revive an
                // object that was one decrement from death.
                refcount::incref(ptr);
                // Safety: we just created the strong reference this
                // `ObjectRef` assumes.
                unsafe { ObjectRef::from_header(ptr) }
            })
        })
    }

    /// Whether the two refer to the same (unique) weakref.
    pub fn ptr_eq(&self, other: &WeakRef) -> bool {
        Arc::ptr_eq(&self.core, &other.core)
    }

    pub(crate) fn core(&self) -> &Arc<WeakCore> {
        &self.core
    }
}

impl fmt::Debug for WeakRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let alive = self.core.crit.with(|| self.core.referent().is_some());
        if alive {
            write!(f, "<weakref at {:p}; live>", Arc::as_ptr(&self.core))
        } else {
            write!(f, "<weakref at {:p}; dead>", Arc::as_ptr(&self.core))
        }
    }
}

/// Returns the unique weak reference for `obj`, installing it on first
/// use. The installation is a compare-and-swap into the object header;
/// losers of the race adopt the winner's reference.
///
/// # Errors
///
/// Returns a `Type` error if the object's type does not support weak
/// references.
pub(crate) fn new_ref(obj: &ObjectRef) -> Result<WeakRef, Error> {
    let header = obj.header();
    if !header
        .ty()
        .flags
        .contains(crate::object::TypeFlags::WEAKREFS)
    {
        return Err(Error::type_error(format!(
            "cannot create weak reference to '{}' object",
            header.ty().name
        )));
    }

    let slot = header.weakref_slot();

    // Use the existing ref if there is one.
    let existing = slot.load(Ordering::Acquire);
    if !existing.is_null() {
        // Safety: the slot owns one strong count for as long as the object
        // is alive, which our `obj` reference guarantees.
        unsafe {
            Arc::increment_strong_count(existing);
            return Ok(WeakRef {
                core: Arc::from_raw(existing),
            });
        }
    }

    let fresh = Arc::new(WeakCore {
        crit: Critical::new(CRITICAL_WEAKREF_REF),
        referent: UnsafeCell::new(Some(obj.header_ptr())),
        handles: UnsafeCell::new(Vec::new()),
        bindings: UnsafeCell::new(Vec::new()),
    });

    // One strong count goes into the header slot.
    let raw = Arc::into_raw(Arc::clone(&fresh));
    match slot.compare_exchange(
        core::ptr::null_mut(),
        raw.cast_mut(),
        Ordering::AcqRel,
        Ordering::Acquire,
    ) {
        Ok(_) => Ok(WeakRef { core: fresh }),
        Err(winner) => {
            // Another thread beat us to it; use theirs instead.
            // Safety: `raw` came from `into_raw` above and was never
            // published.
            unsafe {
                drop(Arc::from_raw(raw));
                // Our `fresh` was born with a referent; clear it so the
                // drop assertion holds.
                *fresh.referent.get() = None;
            }
            drop(fresh);
            // Safety: as for the fast path above.
            unsafe {
                Arc::increment_strong_count(winner);
                Ok(WeakRef {
                    core: Arc::from_raw(winner),
                })
            }
        }
    }
}

/// The target-death protocol, run by [`crate::object::dealloc`] when a
/// weakref exists. Returns `true` when the object was resurrected (another
/// thread reached it through the weakref) and deallocation must abort.
///
/// # Safety
///
/// `ptr` must point to a live object whose owner-visible refcount is 1
/// (the caller holds the final reference).
pub(crate) unsafe fn clear_for_dealloc(ptr: NonNull<Header>) -> bool {
    // Safety: ensured by caller.
    let header = unsafe { ptr.as_ref() };
    let slot = header.weakref_slot();

    let raw = slot.load(Ordering::Acquire);
    if raw.is_null() {
        return false;
    }
    // Safety: the slot owns a strong count; we add our own for the
    // duration of the protocol.
    let core = unsafe {
        Arc::increment_strong_count(raw);
        Arc::from_raw(raw.cast_const())
    };

    let resurrected = core.crit.with(|| {
        if core.referent().is_none() {
            // Already cleared by a competing (aborted) teardown.
            return false;
        }
        debug_assert_eq!(core.referent(), Some(ptr));

        if refcount::snoop(ptr) != 1 {
            // Brought back from the brink: a `WeakRef::get` (or a
            // promotion it caused) revived the target.
            return true;
        }

        // The object is dead for real. Clear the referent and the header
        // slot, then move every attached handle to its queue's dead list.
        // Safety: guarded by `crit`.
        unsafe { *core.referent.get() = None };
        slot.store(core::ptr::null_mut(), Ordering::Release);
        // Safety: the slot held one strong count; we just took it over.
        unsafe { drop(Arc::from_raw(raw.cast_const())) };

        loop {
            // Safety: guarded by `crit`.
            let handle = unsafe { (*core.handles.get()).pop() };
            let Some(handle) = handle else { break };
            handle.pronounce_dead(&core);
        }
        false
    });

    if !resurrected {
        clear_bindings(&core);
        tracing::trace!(obj.addr = ?ptr, "weakref cleared");
    }
    resurrected
}

/// Releases every binding's value after the target died. Values are
/// dropped outside the critical section: releasing one may tear down
/// another binding re-entrantly.
fn clear_bindings(core: &Arc<WeakCore>) {
    loop {
        let cleared = core.crit.with(|| {
            // Safety: guarded by `crit`.
            let bindings = unsafe { &mut *core.bindings.get() };
            let binding = bindings.pop()?;
            // Safety: binding state is guarded by the weakref's `crit`.
            let value = unsafe { binding.take_value() };
            Some((binding, value))
        });
        match cleared {
            Some((binding, value)) => {
                drop(value);
                drop(binding);
            }
            None => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::values;
    use crate::state::Runtime;

    #[test]
    fn weakref_is_unique_per_object() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::list(vec![]);
        let a = obj.weakref().unwrap();
        let b = obj.weakref().unwrap();
        assert!(a.ptr_eq(&b));

        drop(obj);
        frame.exit();
    }

    #[test]
    fn get_returns_target_while_alive() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::list(vec![values::int(1)]);
        let weak = obj.weakref().unwrap();

        let strong = weak.get().unwrap();
        assert!(strong.ptr_eq(&obj));
        drop(strong);

        drop(obj);
        assert!(weak.get().is_none());

        frame.exit();
    }

    #[test]
    fn weakref_to_unsupported_type_is_a_type_error() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let int = values::int(1);
        let err = int.weakref().unwrap_err();
        assert_eq!(err.kind(), crate::error::ErrorKind::Type);
        assert!(err.to_string().contains("int"));

        drop(int);
        frame.exit();
    }

    #[test]
    fn clearing_runs_once_per_target() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let obj = values::list(vec![]);
        let weak = obj.weakref().unwrap();
        let also = obj.clone();

        drop(obj);
        // Still alive through the second reference.
        assert!(weak.get().is_some());

        drop(also);
        assert!(weak.get().is_none());

        frame.exit();
    }
}
