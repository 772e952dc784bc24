// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Weak bindings: a weakref extended with a value whose lifetime is bound
//! to the target's.
//!
//! The binding holds a second object's reference that is conceptually
//! owned by the target; when the target dies the binding is cleared and
//! the value released. Dropping the binding early takes the value's
//! ownership back from the target and releases it immediately.

use crate::error::Error;
use crate::object::ObjectRef;
use crate::refcount;
use crate::weakref::{self, WeakCore};
use core::cell::UnsafeCell;
use core::fmt;
use std::sync::Arc;

/// Shared state of one binding. `linked` and `value` are guarded by the
/// *weakref's* critical section: binding teardown always contends with
/// weakref teardown, so they share a lock.
pub(crate) struct BindingCore {
    weakref: Arc<WeakCore>,
    state: UnsafeCell<BindingState>,
}

struct BindingState {
    /// Whether the binding is still on the weakref's list.
    linked: bool,
    value: Option<ObjectRef>,
}

// Safety: `state` is guarded by the weakref's critical section.
unsafe impl Send for BindingCore {}
// Safety: see above.
unsafe impl Sync for BindingCore {}

/// A handle keyed by a weakref but holding a second object's reference,
/// cleared when the target dies.
pub struct WeakBinding {
    core: Arc<BindingCore>,
}

// === impl BindingCore ===

impl BindingCore {
    /// Unlinks and returns the value.
    ///
    /// # Safety
    ///
    /// The caller must hold the weakref's critical section.
    pub(crate) unsafe fn take_value(&self) -> Option<ObjectRef> {
        // Safety: guarded by the weakref's critical section, held by the
        // caller.
        let state = unsafe { &mut *self.state.get() };
        state.linked = false;
        state.value.take()
    }
}

// === impl WeakBinding ===

impl WeakBinding {
    /// Binds `value` to `obj`: the binding yields `(obj, value)` while
    /// `obj` is alive and releases the value at `obj`'s death.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if `obj`'s type does not support weak
    /// references.
    pub fn new(obj: &ObjectRef, value: ObjectRef) -> Result<WeakBinding, Error> {
        let weak = weakref::new_ref(obj)?;
        let core = Arc::new(BindingCore {
            weakref: Arc::clone(weak.core()),
            state: UnsafeCell::new(BindingState {
                linked: false,
                value: None,
            }),
        });

        core.weakref.crit.with(|| {
            assert!(core.weakref.referent().is_some());
            // Safety: guarded by the weakref's critical section.
            unsafe {
                let state = &mut *core.state.get();
                state.linked = true;
                // The target conceptually owns this reference now.
                state.value = Some(value);
                core.weakref.link_binding(Arc::clone(&core));
            }
        });

        Ok(WeakBinding { core })
    }

    /// The target and the bound value, or `None` once the target died.
    pub fn get(&self) -> Option<(ObjectRef, ObjectRef)> {
        let weak = &self.core.weakref;
        weak.crit.with(|| {
            // Safety: guarded by the weakref's critical section.
            let state = unsafe { &*self.core.state.get() };
            if !state.linked {
                return None;
            }
            let target = weak.referent()?;
            refcount::incref(target);
            // Safety: the incref above is the strong reference this
            // `ObjectRef` takes over.
            let target = unsafe { ObjectRef::from_header(target) };
            let value = state.value.clone().expect("linked binding without value");
            Some((target, value))
        })
    }
}

impl Drop for WeakBinding {
    fn drop(&mut self) {
        // Unlinking needs a thread state; a binding dropped after its
        // thread detached was necessarily cleared already (the value is
        // released at target death or by an attached drop).
        if !crate::state::attached() {
            return;
        }
        // An early drop (target still alive) takes the value's ownership
        // back from the target and releases it; after target death the
        // clearing path has already done so.
        let value = self.core.weakref.crit.with(|| {
            // Safety: guarded by the weakref's critical section.
            let state = unsafe { &mut *self.core.state.get() };
            if state.linked {
                state.linked = false;
                // Safety: guarded by the weakref's critical section.
                unsafe { self.core.weakref.unlink_binding(&self.core) };
                state.value.take()
            } else {
                None
            }
        });
        // Released outside the section; the value's destructor may
        // re-enter the weakref machinery.
        drop(value);
    }
}

impl fmt::Debug for WeakBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.get() {
            Some((target, value)) => write!(
                f,
                "<weakbinding from '{}' to '{}'>",
                target.type_name(),
                value.type_name()
            ),
            None => write!(f, "<weakbinding; dead>"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::object::values;
    use crate::state::Runtime;

    #[test]
    fn binding_follows_target_lifetime() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let target = values::list(vec![]);
        let value = values::int(9);
        let binding = WeakBinding::new(&target, value.clone()).unwrap();

        let (got_target, got_value) = binding.get().unwrap();
        assert!(got_target.ptr_eq(&target));
        assert!(got_value.ptr_eq(&value));
        drop((got_target, got_value));

        drop(target);
        assert!(binding.get().is_none());

        // The bound value was released with the target: only ours remains.
        assert_eq!(value.refcnt_snoop(), 1);

        drop(value);
        frame.exit();
    }

    #[test]
    fn early_drop_releases_the_value() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let target = values::list(vec![]);
        let value = values::int(5);
        let binding = WeakBinding::new(&target, value.clone()).unwrap();

        assert_eq!(value.refcnt_snoop(), 2);
        drop(binding);
        assert_eq!(value.refcnt_snoop(), 1);

        // The target's later death must not touch the departed binding.
        drop(target);

        drop(value);
        frame.exit();
    }

    #[test]
    fn binding_value_owned_by_target() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        let target = values::list(vec![]);
        let value = values::int(1);
        let binding = WeakBinding::new(&target, value.clone()).unwrap();

        // One reference from us, one held through the binding.
        assert_eq!(value.refcnt_snoop(), 2);
        drop(target);
        assert_eq!(value.refcnt_snoop(), 1);

        drop(binding);
        drop(value);
        frame.exit();
    }
}
