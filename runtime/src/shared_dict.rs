// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! A shareable dictionary: a plain hash map composed with a reader/writer
//! locking discipline.
//!
//! Reads normally take the dict's critical section briefly. After a burst
//! of consecutive reads the dict enters *read-only mode* and readers skip
//! locking entirely; the next writer pays for that by stopping the world,
//! clearing the mode, and proceeding under the section again. Keys and
//! values must be shareable, enforced at insertion.

use crate::critical::{CRITICAL_NORMAL, Critical};
use crate::error::Error;
use crate::shareable::Shareable;
use crate::state::{self, Runtime};
use core::cell::UnsafeCell;
use core::fmt;
use core::hash::Hash;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

/// The lock mode a dict operation runs under, threaded through every
/// internal primitive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum LockState {
    Read {
        /// Whether read-only mode let us skip the critical section.
        skipped: bool,
    },
    Write,
    /// The dict is confined to one thread; no locking at all.
    NotShared,
}

/// A hash map whose entries are shareable and which may be read and
/// written from any attached thread.
pub struct SharedDict<K, V> {
    crit: Critical,
    readonly_mode: AtomicBool,
    /// Consecutive lock-taking reads; guarded by `crit`.
    read_count: UnsafeCell<u32>,
    readonly_threshold: u32,
    runtime: Arc<Runtime>,
    /// The ordinary map, reused unchanged; guarded by `crit` plus the
    /// read-only-mode protocol.
    map: UnsafeCell<HashMap<K, V>>,
}

// Safety: the map is only touched under the critical section, except for
// lock-free reads in read-only mode, during which writers stop the world
// first.
unsafe impl<K: Send + Sync, V: Send + Sync> Send for SharedDict<K, V> {}
// Safety: see above.
unsafe impl<K: Send + Sync, V: Send + Sync> Sync for SharedDict<K, V> {}

// === impl SharedDict ===

impl<K, V> SharedDict<K, V>
where
    K: Shareable + Eq + Hash,
    V: Shareable + Clone,
{
    /// An empty dict bound to the calling thread's runtime (whose
    /// configuration supplies the read-only promotion threshold).
    ///
    /// # Panics
    ///
    /// Panics if the calling thread is not attached.
    pub fn new() -> Self {
        let runtime = state::with_current(|ts| ts.runtime());
        let readonly_threshold = runtime.config().shared_dict_readonly_threshold;
        Self {
            crit: Critical::new(CRITICAL_NORMAL),
            readonly_mode: AtomicBool::new(false),
            read_count: UnsafeCell::new(0),
            readonly_threshold,
            runtime,
            map: UnsafeCell::new(HashMap::new()),
        }
    }

    /// Inserts a key/value pair, returning the displaced value if any.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if the key or the value is not shareable.
    pub fn insert(&self, key: K, value: V) -> Result<Option<V>, Error> {
        key.check_shareable()?;
        value.check_shareable()?;

        let mut lock = LockState::Write;
        self.lock_acquire(&mut lock);
        // Safety: write mode holds the critical section with read-only
        // mode cleared.
        let displaced = unsafe { (*self.map.get()).insert(key, value) };
        self.lock_release(lock);
        Ok(displaced)
    }

    pub fn get(&self, key: &K) -> Option<V> {
        let mut lock = LockState::Read { skipped: false };
        self.lock_acquire(&mut lock);
        // Safety: read mode either holds the critical section or runs in
        // read-only mode, in which writers stop the world first.
        let value = unsafe { (*self.map.get()).get(key).cloned() };
        self.lock_release(lock);
        value
    }

    pub fn remove(&self, key: &K) -> Option<V> {
        let mut lock = LockState::Write;
        self.lock_acquire(&mut lock);
        // Safety: write mode holds the critical section with read-only
        // mode cleared.
        let removed = unsafe { (*self.map.get()).remove(key) };
        self.lock_release(lock);
        removed
    }

    pub fn contains_key(&self, key: &K) -> bool {
        let mut lock = LockState::Read { skipped: false };
        self.lock_acquire(&mut lock);
        // Safety: as in `get`.
        let found = unsafe { (*self.map.get()).contains_key(key) };
        self.lock_release(lock);
        found
    }

    pub fn len(&self) -> usize {
        let mut lock = LockState::Read { skipped: false };
        self.lock_acquire(&mut lock);
        // Safety: as in `get`.
        let len = unsafe { (*self.map.get()).len() };
        self.lock_release(lock);
        len
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether the dict is currently in the lock-free read-only mode.
    pub fn is_readonly_mode(&self) -> bool {
        self.readonly_mode.load(Ordering::Acquire)
    }

    /// Insertion for a dict still confined to one thread (the not-shared
    /// lock mode): the exclusive borrow replaces all locking, but the
    /// shareable gate still applies.
    ///
    /// # Errors
    ///
    /// Returns a `Type` error if the key or the value is not shareable.
    pub fn confined_insert(&mut self, key: K, value: V) -> Result<Option<V>, Error> {
        key.check_shareable()?;
        value.check_shareable()?;

        let mut lock = LockState::NotShared;
        self.lock_acquire(&mut lock);
        // Safety: `&mut self` is the whole synchronization story here.
        let displaced = unsafe { (*self.map.get()).insert(key, value) };
        self.lock_release(lock);
        Ok(displaced)
    }

    fn lock_acquire(&self, lock: &mut LockState) {
        match lock {
            LockState::Write => {
                self.crit.enter();
                // A dict that entered read-only mode is reset with the
                // expensive stop-the-world fallback; this is rare.
                while self.readonly_mode.load(Ordering::Acquire) {
                    self.crit.exit();
                    self.runtime.stop_the_world();
                    self.readonly_mode.store(false, Ordering::Release);
                    // Safety: the world is stopped; no reader is mid-read.
                    unsafe { *self.read_count.get() = 0 };
                    self.runtime.start_the_world();
                    self.crit.enter();
                }
                // Safety: guarded by `crit`.
                unsafe { *self.read_count.get() = 0 };
            }
            LockState::Read { skipped } => {
                if self.readonly_mode.load(Ordering::Acquire) {
                    *skipped = true;
                    return;
                }
                self.crit.enter();
                if self.readonly_mode.load(Ordering::Acquire) {
                    *skipped = true;
                    self.crit.exit();
                    return;
                }
                // Safety: guarded by `crit`.
                let count = unsafe {
                    let count = &mut *self.read_count.get();
                    *count += 1;
                    *count
                };
                if count >= self.readonly_threshold {
                    tracing::debug!("shared dict entering read-only mode");
                    self.readonly_mode.store(true, Ordering::Release);
                    self.crit.exit();
                    *skipped = true;
                } else {
                    *skipped = false;
                }
            }
            LockState::NotShared => {}
        }
    }

    fn lock_release(&self, lock: LockState) {
        match lock {
            LockState::Write => self.crit.exit(),
            LockState::Read { skipped } => {
                if !skipped {
                    self.crit.exit();
                }
            }
            LockState::NotShared => {}
        }
    }
}

impl<K, V> Default for SharedDict<K, V>
where
    K: Shareable + Eq + Hash,
    V: Shareable + Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K, V> Shareable for SharedDict<K, V>
where
    K: Shareable + Eq + Hash,
    V: Shareable + Clone,
{
}

impl<K, V> fmt::Debug for SharedDict<K, V>
where
    K: Shareable + Eq + Hash,
    V: Shareable + Clone,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedDict")
            .field("len", &self.len())
            .field("readonly_mode", &self.is_readonly_mode())
            .finish()
    }
}
