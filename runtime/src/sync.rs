// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! Low-level synchronization building blocks.
//!
//! The [`Mutex`] here is a spinning short lock. Everything in this runtime
//! that holds a lock holds it briefly (critical sections, waiter-list
//! manipulation); anything that actually needs to *wait* parks its thread
//! through [`crate::park`] instead of spinning.

mod backoff;
mod flag;
mod mutex;
mod semaphore;

pub use backoff::Backoff;
pub(crate) use flag::Flag;
pub use mutex::{Mutex, MutexGuard};
pub(crate) use semaphore::Semaphore;
