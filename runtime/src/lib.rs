// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Free-threaded runtime core.
//!
//! This crate is the concurrency substrate of an interpreter that runs
//! without a global lock. It is built from a handful of tightly coupled
//! pieces:
//!
//! - a hybrid per-object refcount engine ([`object`], [`refcount`]) where
//!   each object is *owned* by one thread for cheap unsynchronized counting
//!   and is *promoted* to an asynchronous mode on first cross-thread use,
//! - [`MonitorSpace`]/[`Monitor`] mutual-exclusion domains that decide
//!   which thread may touch a mutable object,
//! - cooperative [`Interrupt`] trees and user-facing [`CancelScope`]s that
//!   decide when work must unwind,
//! - [`Branch`]/[`Collate`] structured-concurrency scopes that spawn OS
//!   threads bound to an enclosing scope, and
//! - [`WeakRef`] + [`DeathQueue`] post-mortem notification, which replaces
//!   destruction-time callbacks entirely.
//!
//! Everything enters through a [`Runtime`] and the per-thread state record
//! established by [`Runtime::enter`].

mod cancel;
mod critical;
mod error;
pub mod interrupt;
pub mod loom;
mod monitor;
pub mod object;
mod refcount;
mod shareable;
mod shared_dict;
pub mod state;
pub mod sync;
mod weakref;

pub mod branch;
mod park;

pub use branch::{Branch, Collate};
pub use cancel::{CancelScope, SignalGuard, check_cancelled, signal_enter, sleep};
pub use critical::{
    CRITICAL_CANCEL, CRITICAL_DEALLOC, CRITICAL_NORMAL, CRITICAL_WEAKREF_HANDLE,
    CRITICAL_WEAKREF_QUEUE, CRITICAL_WEAKREF_REF, Critical,
};
pub use error::{Error, ErrorKind};
pub use interrupt::{Interrupt, check_interrupted};
pub use monitor::{Monitor, MonitorSpace};
pub use object::ObjectRef;
pub use object::values;
pub use refcount::flush_async_refcounts;
pub use shareable::Shareable;
pub use shared_dict::SharedDict;
pub use state::{Config, EnterFrame, Runtime, tick};
pub use weakref::{DeathQueue, DeathQueueHandle, WeakBinding, WeakRef};

#[cfg(test)]
mod test_util;
