// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The shareable-object gate.
//!
//! A value is *shareable* when it may cross a thread, monitor-space,
//! branch or shared-dict boundary. For plain Rust values the trait bound is
//! the whole story; for [`ObjectRef`]s the check is dynamic (the type flag
//! plus a per-instance predicate, e.g. a tuple is shareable iff all of its
//! elements are). Violations surface as `Type` errors *at the boundary*,
//! never later.

use crate::error::Error;
use crate::object::ObjectRef;
use std::sync::Arc;

/// Values allowed to cross thread/monitor-space/branch boundaries.
///
/// Implementations for immutable primitives are unconditional; containers
/// and runtime objects refine the answer per value in
/// [`check_shareable`](Shareable::check_shareable).
pub trait Shareable: Send + Sync {
    /// Confirms this particular value is shareable.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error naming the offending type when it is not.
    fn check_shareable(&self) -> Result<(), Error> {
        Ok(())
    }
}

impl Shareable for () {}
impl Shareable for bool {}
impl Shareable for i64 {}
impl Shareable for u64 {}
impl Shareable for usize {}
impl Shareable for &'static str {}
impl Shareable for String {}

impl<T: Shareable + ?Sized> Shareable for Arc<T> {
    fn check_shareable(&self) -> Result<(), Error> {
        (**self).check_shareable()
    }
}

impl<T: Shareable> Shareable for Option<T> {
    fn check_shareable(&self) -> Result<(), Error> {
        match self {
            Some(value) => value.check_shareable(),
            None => Ok(()),
        }
    }
}

impl<A: Shareable, B: Shareable> Shareable for (A, B) {
    fn check_shareable(&self) -> Result<(), Error> {
        self.0.check_shareable()?;
        self.1.check_shareable()
    }
}

// The concurrency primitives themselves are shareable.
impl Shareable for crate::monitor::MonitorSpace {}
impl<T: Send> Shareable for crate::monitor::Monitor<T> {}
impl Shareable for crate::branch::Branch {}
impl Shareable for crate::branch::Collate {}
impl Shareable for crate::interrupt::Interrupt {}
impl Shareable for crate::cancel::CancelScope {}
impl Shareable for crate::weakref::WeakRef {}
impl Shareable for crate::weakref::WeakBinding {}
impl Shareable for crate::weakref::DeathQueue {}
impl Shareable for crate::weakref::DeathQueueHandle {}

impl Shareable for ObjectRef {
    fn check_shareable(&self) -> Result<(), Error> {
        if self.is_shareable() {
            Ok(())
        } else {
            Err(Error::type_error(format!(
                "'{}' object is not shareable",
                self.type_name()
            )))
        }
    }
}

/// Boundary check for a single object, with the boundary's name in the
/// error message.
pub(crate) fn require_shareable(obj: &ObjectRef, what: &str) -> Result<(), Error> {
    if obj.is_shareable() {
        Ok(())
    } else {
        Err(Error::type_error(format!(
            "{what} must be shareable, '{}' object is not",
            obj.type_name()
        )))
    }
}

/// Boundary check for an argument slice.
pub(crate) fn require_shareable_args(args: &[ObjectRef], what: &str) -> Result<(), Error> {
    for arg in args {
        require_shareable(arg, what)?;
    }
    Ok(())
}
