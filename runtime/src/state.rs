// Copyright 2025 Molt Contributors
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

//! The runtime, per-thread state records, and the attach/detach, suspend/
//! resume and stop-the-world machinery.
//!
//! Every externally visible call happens on a thread *attached* to a
//! [`Runtime`] via [`Runtime::enter`]. An attached, non-suspended thread
//! holds its own *inspect lock*; releasing that lock (suspension) is what
//! lets other threads promote refcount owners and stop the world. The
//! periodic [`tick`] is the cooperative safepoint where all of that is
//! observed.

use crate::cancel::CancelScope;
use crate::critical::{CRITICAL_CANCEL, Critical};
use crate::error::Error;
use crate::interrupt::Interrupt;
use crate::monitor::MonitorSpace;
use crate::object::{AllocCache, ObjectRef};
use crate::refcount::{self, AsyncRefEntry};
use crate::sync;
use cfg_if::cfg_if;
use core::cell::{Cell, RefCell, UnsafeCell};
use core::fmt;
use core::marker::PhantomData;
use core::mem;
use core::ptr::NonNull;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::vec::Vec;

use crate::park::Parker;
use molt_util::CachePadded;

/// One entry in a thread's monitor-space frame stack.
///
/// Each enter frame contributes a `Base` slot, lazily filled by
/// `MonitorSpace::current`; every `MonitorSpace::enter` pushes an
/// `Entered` frame that only it may pop.
pub(crate) enum MonitorFrame {
    Base(Option<Arc<MonitorSpace>>),
    Entered(Arc<MonitorSpace>),
}

/// Tunables of a [`Runtime`].
#[derive(Debug, Clone)]
pub struct Config {
    /// How many small ticks elapse between periodic safepoints.
    pub check_interval: u32,
    /// Slots in each thread's asynchronous refcount table. Must be a power
    /// of two.
    pub async_table_size: usize,
    /// Consecutive lock-free reads after which a
    /// [`SharedDict`](crate::SharedDict) enters read-only mode.
    pub shared_dict_readonly_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            check_interval: 100,
            async_table_size: 2048,
            shared_dict_readonly_threshold: 10_000,
        }
    }
}

type PendingCall = Box<dyn FnOnce() + Send>;
type SignalCheck = Arc<dyn Fn() -> Result<(), Error> + Send + Sync>;

/// The process-scoped runtime: thread registry, pending calls, and the
/// stop-the-world serialization point.
pub struct Runtime {
    config: Config,
    /// All currently attached thread states. The mutex is this runtime's
    /// analogue of the head lock: registry traversal (promotion target
    /// lookup, async exceptions, stop-the-world) happens under it.
    threads: sync::Mutex<Vec<Arc<ThreadState>>>,
    thread_count: AtomicUsize,
    next_thread_id: AtomicU64,
    pending: sync::Mutex<Vec<PendingCall>>,
    signal_check: sync::Mutex<Option<SignalCheck>>,
    /// Serializes stoppers; held (raw) from `stop_the_world` to
    /// `start_the_world`.
    stopper: sync::Mutex<()>,
    /// The threads whose inspect locks the current stopper holds.
    stopped: sync::Mutex<Vec<Arc<ThreadState>>>,
}

/// Per-thread interpreter state.
///
/// Owned by the thread that created it; the handful of fields other
/// threads may touch (the inspect protocol, the async-exception slot, the
/// cancel stack under its critical section) are individually synchronized.
pub struct ThreadState {
    id: u64,
    runtime: Weak<Runtime>,

    // --- inspect protocol; touched by any thread ---
    /// Number of threads currently inspecting (promoting against) us; the
    /// state record must not be torn down while nonzero. Padded: written
    /// by promoting threads while the owner hammers its own fields.
    pub(crate) inspect_count: CachePadded<AtomicUsize>,
    pub(crate) inspect_flag: CachePadded<AtomicBool>,
    pub(crate) inspect_queue_lock: sync::Mutex<()>,
    /// Held (raw) whenever this thread is attached and not suspended.
    pub(crate) inspect_lock: sync::Mutex<()>,
    suspended: AtomicBool,
    /// Whether the topmost enter frame is "locked" (the thread is running
    /// interpreter code). Exactly one frame per thread is locked at a time.
    running: AtomicBool,

    // --- asynchronous exception slot; touched by any thread ---
    async_exc: sync::Mutex<Option<Error>>,

    // --- cancel stack; guarded by `cancel_crit` ---
    pub(crate) cancel_crit: Critical,
    cancel_stack: UnsafeCell<Vec<Arc<CancelScope>>>,

    // --- everything below is touched only by the owning thread ---
    small_ticks: Cell<u32>,
    large_ticks: Cell<u64>,
    enter_depth: Cell<usize>,
    import_depth: Cell<usize>,
    monitor_stack: UnsafeCell<Vec<MonitorFrame>>,
    interrupt_point: UnsafeCell<Option<Arc<Interrupt>>>,
    critical_top: Cell<Option<NonNull<Critical>>>,
    pub(crate) async_refs: Box<[AsyncRefEntry]>,
    dict: UnsafeCell<HashMap<String, ObjectRef>>,
    pub(crate) alloc_cache: UnsafeCell<AllocCache>,
    /// This thread's parking facility, registered with waiter lists before
    /// blocking.
    pub(crate) parker: Parker,
}

// Safety: the owner-only fields above are never touched from another
// thread; the inspect protocol fields are atomics and spin locks; the
// cancel stack is guarded by `cancel_crit`. The record itself is shared
// across threads (registry, promotion) and must therefore be Send + Sync.
unsafe impl Send for ThreadState {}
// Safety: see above.
unsafe impl Sync for ThreadState {}

cfg_if! {
    if #[cfg(loom)] {
        loom::thread_local! {
            static CURRENT: RefCell<Option<Arc<ThreadState>>> = RefCell::new(None);
        }
    } else {
        std::thread_local! {
            static CURRENT: RefCell<Option<Arc<ThreadState>>> = const { RefCell::new(None) };
        }
    }
}

/// Runs `f` with the calling thread's state.
///
/// # Panics
///
/// Panics if the calling thread is not attached.
pub(crate) fn with_current<R>(f: impl FnOnce(&ThreadState) -> R) -> R {
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let ts = borrowed
            .as_ref()
            .expect("current thread is not attached to a runtime");
        f(ts)
    })
}

/// The calling thread's state.
///
/// # Panics
///
/// Panics if the calling thread is not attached.
pub(crate) fn current() -> Arc<ThreadState> {
    with_current(|ts| {
        // Cheap ref-count bump; callers that need the state across suspend
        // points hold an Arc instead of a TLS borrow.
        with_current_arc(ts)
    })
}

fn with_current_arc(ts: &ThreadState) -> Arc<ThreadState> {
    CURRENT.with(|current| {
        let borrowed = current.borrow();
        let arc = borrowed.as_ref().expect("attach state changed underfoot");
        debug_assert!(core::ptr::eq(&**arc, ts));
        Arc::clone(arc)
    })
}

/// Whether the calling thread is attached to a runtime.
pub fn attached() -> bool {
    CURRENT.with(|current| current.borrow().is_some())
}

/// Runs `f` with the per-thread scratch dictionary.
///
/// # Panics
///
/// Panics if the calling thread is not attached.
pub fn with_thread_dict<R>(f: impl FnOnce(&mut HashMap<String, ObjectRef>) -> R) -> R {
    with_current(|ts| {
        // Safety: the dict is owner-only and `with_current` proves we are
        // the owner.
        f(unsafe { &mut *ts.dict.get() })
    })
}

// === impl Runtime ===

impl Runtime {
    /// A runtime with default [`Config`].
    pub fn new() -> Arc<Self> {
        Self::with_config(Config::default())
    }

    /// # Panics
    ///
    /// Panics if `config.async_table_size` is not a power of two.
    pub fn with_config(config: Config) -> Arc<Self> {
        assert!(
            config.async_table_size.is_power_of_two(),
            "async refcount table size must be a power of two"
        );
        Arc::new(Self {
            config,
            threads: sync::Mutex::new(Vec::new()),
            thread_count: AtomicUsize::new(0),
            next_thread_id: AtomicU64::new(1),
            pending: sync::Mutex::new(Vec::new()),
            signal_check: sync::Mutex::new(None),
            stopper: sync::Mutex::new(()),
            stopped: sync::Mutex::new(Vec::new()),
        })
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Attaches the calling OS thread, creating a [`ThreadState`] if this
    /// is the outermost entry, and returns the frame that must be exited
    /// (or dropped) to detach again. Frames nest.
    ///
    /// # Panics
    ///
    /// Panics if the thread is already attached to a *different* runtime.
    pub fn enter(self: &Arc<Self>) -> EnterFrame {
        let existing = CURRENT.with(|current| current.borrow().clone());

        if let Some(ts) = existing {
            let other = ts.runtime();
            assert!(
                Arc::ptr_eq(&other, self),
                "thread is already attached to a different runtime"
            );

            let prev_running = ts.is_running();
            if prev_running {
                suspend_ts(&ts);
            }
            ts.enter_depth.set(ts.enter_depth.get() + 1);
            // Safety: owner-only field, we are the owner.
            unsafe { (*ts.monitor_stack.get()).push(MonitorFrame::Base(None)) };
            resume_ts(&ts);

            tracing::trace!(thread.id = ts.id, depth = ts.enter_depth.get(), "enter (nested)");
            return EnterFrame {
                runtime: Arc::clone(self),
                root: false,
                prev_running,
                exited: false,
                _not_send: PhantomData,
            };
        }

        let id = self.next_thread_id.fetch_add(1, Ordering::Relaxed);
        let ts = Arc::new(ThreadState::new(id, Arc::downgrade(self), &self.config));

        CURRENT.with(|current| *current.borrow_mut() = Some(Arc::clone(&ts)));
        self.threads.lock().push(Arc::clone(&ts));
        self.thread_count.fetch_add(1, Ordering::SeqCst);

        resume_ts(&ts);

        // The root interrupt node: gives every thread a valid innermost
        // interrupt point so checks never have to special-case the bottom
        // of the stack.
        let root = Interrupt::new_inline(|_queue| {});
        root.push();

        tracing::debug!(thread.id = id, "thread attached");
        EnterFrame {
            runtime: Arc::clone(self),
            root: true,
            prev_running: false,
            exited: false,
            _not_send: PhantomData,
        }
    }

    /// Queues `f` to run at the next periodic tick of whichever attached
    /// thread reaches one first.
    pub fn add_pending_call(&self, f: impl FnOnce() + Send + 'static) {
        self.pending.lock().push(Box::new(f));
    }

    /// Installs the hook run at every periodic tick (the signal check).
    pub fn set_signal_check(&self, f: impl Fn() -> Result<(), Error> + Send + Sync + 'static) {
        *self.signal_check.lock() = Some(Arc::new(f));
    }

    /// Posts an asynchronous error to the thread with the given id (or
    /// clears its slot when `exc` is `None`). The error is delivered out
    /// of that thread's next periodic tick. Returns the number of threads
    /// that matched.
    pub fn set_async_exc(&self, thread_id: u64, exc: Option<Error>) -> usize {
        let threads = self.threads.lock();
        let mut matched = 0;
        for ts in threads.iter() {
            if ts.id == thread_id {
                *ts.async_exc.lock() = exc.clone();
                matched += 1;
            }
        }
        matched
    }

    /// Whether exactly one thread is attached.
    pub fn is_single_threaded(&self) -> bool {
        self.thread_count.load(Ordering::SeqCst) == 1
    }

    pub(crate) fn thread_by_id(&self, id: u64) -> Option<Arc<ThreadState>> {
        self.threads.lock().iter().find(|ts| ts.id == id).cloned()
    }

    /// Stops every other attached thread at a safepoint.
    ///
    /// Acquires each target's inspect lock through the same queue
    /// handshake refcount promotion uses, so targets stop either suspended
    /// or parked in their next [`tick`]. Nested stoppers are serialized.
    /// Must be paired with [`start_the_world`](Self::start_the_world).
    pub fn stop_the_world(&self) {
        let me = current();
        mem::forget(self.stopper.lock());

        let targets: Vec<Arc<ThreadState>> = self
            .threads
            .lock()
            .iter()
            .filter(|ts| ts.id != me.id)
            .cloned()
            .collect();

        tracing::debug!(stopping = targets.len(), "stop the world");

        suspend_ts(&me);
        for ts in &targets {
            ts.inspect_count.fetch_add(1, Ordering::SeqCst);
            let queue_guard = ts.inspect_queue_lock.lock();
            ts.inspect_flag.store(true, Ordering::SeqCst);
            mem::forget(ts.inspect_lock.lock());
            ts.inspect_flag.store(false, Ordering::SeqCst);
            drop(queue_guard);
        }
        resume_ts(&me);

        *self.stopped.lock() = targets;
    }

    /// Restarts the world after [`stop_the_world`](Self::stop_the_world).
    pub fn start_the_world(&self) {
        let targets = mem::take(&mut *self.stopped.lock());
        for ts in targets {
            // Safety: `stop_the_world` forgot the guard for each target's
            // inspect lock, so this thread holds them.
            unsafe { ts.inspect_lock.force_unlock() };
            ts.inspect_count.fetch_sub(1, Ordering::SeqCst);
        }
        // Safety: the stopper lock was forgotten in `stop_the_world`.
        unsafe { self.stopper.force_unlock() };
        tracing::debug!("start the world");
    }

    fn run_pending_calls(&self) {
        loop {
            let call = self.pending.lock().pop();
            match call {
                Some(call) => call(),
                None => break,
            }
        }
    }

    fn detach(&self, ts: &Arc<ThreadState>) {
        let mut threads = self.threads.lock();
        let index = threads
            .iter()
            .position(|other| Arc::ptr_eq(other, ts))
            .expect("detached thread state not in registry");
        threads.remove(index);
        drop(threads);

        self.thread_count.fetch_sub(1, Ordering::SeqCst);
        CURRENT.with(|current| *current.borrow_mut() = None);
        // The Arc in the registry is gone, but promotion may still hold a
        // reference; the record is freed only when the last inspector
        // drops it.
    }
}

impl fmt::Debug for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Runtime")
            .field("config", &self.config)
            .field("thread_count", &self.thread_count.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// === impl ThreadState ===

impl ThreadState {
    fn new(id: u64, runtime: Weak<Runtime>, config: &Config) -> Self {
        let async_refs = (0..config.async_table_size)
            .map(|_| AsyncRefEntry::empty())
            .collect::<Vec<_>>()
            .into_boxed_slice();

        Self {
            id,
            runtime,
            inspect_count: CachePadded(AtomicUsize::new(0)),
            inspect_flag: CachePadded(AtomicBool::new(false)),
            inspect_queue_lock: sync::Mutex::new(()),
            inspect_lock: sync::Mutex::new(()),
            suspended: AtomicBool::new(true),
            running: AtomicBool::new(false),
            async_exc: sync::Mutex::new(None),
            cancel_crit: Critical::new(CRITICAL_CANCEL),
            cancel_stack: UnsafeCell::new(Vec::new()),
            small_ticks: Cell::new(config.check_interval),
            large_ticks: Cell::new(0),
            enter_depth: Cell::new(1),
            import_depth: Cell::new(0),
            monitor_stack: UnsafeCell::new(vec![MonitorFrame::Base(None)]),
            interrupt_point: UnsafeCell::new(None),
            critical_top: Cell::new(None),
            async_refs,
            dict: UnsafeCell::new(HashMap::new()),
            alloc_cache: UnsafeCell::new(AllocCache::new()),
            parker: Parker::current(),
        }
    }

    pub(crate) fn id(&self) -> u64 {
        self.id
    }

    pub(crate) fn runtime(&self) -> Arc<Runtime> {
        self.runtime.upgrade().expect("runtime dropped while in use")
    }

    pub(crate) fn is_suspended(&self) -> bool {
        self.suspended.load(Ordering::Relaxed)
    }

    pub(crate) fn is_running(&self) -> bool {
        self.running.load(Ordering::Relaxed)
    }

    pub(crate) fn critical_top(&self) -> Option<NonNull<Critical>> {
        self.critical_top.get()
    }

    pub(crate) fn set_critical_top(&self, top: Option<NonNull<Critical>>) {
        self.critical_top.set(top);
    }

    pub(crate) fn large_ticks(&self) -> u64 {
        self.large_ticks.get()
    }

    // --- interrupt stack (owner only) ---

    pub(crate) fn interrupt_point(&self) -> Option<Arc<Interrupt>> {
        self.debug_assert_owner();
        // Safety: owner-only field.
        unsafe { (*self.interrupt_point.get()).clone() }
    }

    pub(crate) fn set_interrupt_point(&self, point: Option<Arc<Interrupt>>) {
        self.debug_assert_owner();
        // Safety: owner-only field.
        unsafe { *self.interrupt_point.get() = point };
    }

    // --- monitor space frame stack (owner only) ---

    pub(crate) fn current_monitor_space(&self) -> Option<Arc<MonitorSpace>> {
        self.debug_assert_owner();
        // Safety: owner-only field.
        match unsafe { (*self.monitor_stack.get()).last() } {
            Some(MonitorFrame::Base(space)) => space.clone(),
            Some(MonitorFrame::Entered(space)) => Some(Arc::clone(space)),
            None => panic!("monitor frame stack is empty"),
        }
    }

    /// Fills the innermost base frame's lazily created monitor space slot.
    pub(crate) fn fill_monitor_space(&self, space: Arc<MonitorSpace>) {
        self.debug_assert_owner();
        // Safety: owner-only field.
        let stack = unsafe { &mut *self.monitor_stack.get() };
        match stack.last_mut() {
            Some(MonitorFrame::Base(slot @ None)) => *slot = Some(space),
            _ => panic!("monitor space frame already occupied"),
        }
    }

    pub(crate) fn push_monitor_space(&self, space: Arc<MonitorSpace>) {
        self.debug_assert_owner();
        // Safety: owner-only field.
        unsafe { (*self.monitor_stack.get()).push(MonitorFrame::Entered(space)) };
    }

    pub(crate) fn pop_monitor_space(&self) -> Arc<MonitorSpace> {
        self.debug_assert_owner();
        // Safety: owner-only field.
        let stack = unsafe { &mut *self.monitor_stack.get() };
        match stack.pop() {
            Some(MonitorFrame::Entered(space)) => space,
            Some(MonitorFrame::Base(_)) => panic!("popped a base monitor space frame"),
            None => panic!("monitor frame stack is empty"),
        }
    }

    // --- cancel stack ---

    /// Access the cancel stack.
    ///
    /// # Safety
    ///
    /// The caller must hold `self.cancel_crit`.
    pub(crate) unsafe fn with_cancel_stack<R>(
        &self,
        f: impl FnOnce(&mut Vec<Arc<CancelScope>>) -> R,
    ) -> R {
        // Safety: guarded by `cancel_crit`, which the caller holds.
        f(unsafe { &mut *self.cancel_stack.get() })
    }

    fn debug_assert_owner(&self) {
        #[cfg(debug_assertions)]
        {
            let owner_id = CURRENT.with(|current| current.borrow().as_ref().map(|ts| ts.id));
            debug_assert_eq!(
                owner_id,
                Some(self.id),
                "owner-only thread state field touched from another thread"
            );
        }
    }
}

impl fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ThreadState")
            .field("id", &self.id)
            .field("suspended", &self.is_suspended())
            .field("running", &self.is_running())
            .finish_non_exhaustive()
    }
}

// === suspend / resume ===

/// Releases the calling thread's right to run interpreter code.
///
/// Required around any blocking system call (and done implicitly by the
/// blocking primitives in this crate). While suspended, the thread's
/// inspect lock is free, letting promotion and stop-the-world proceed.
///
/// # Panics
///
/// Panics if the thread is not attached or already suspended.
pub fn suspend() {
    with_current(|ts| suspend_ts(ts));
}

/// Reacquires the right to run interpreter code after [`suspend`].
///
/// # Panics
///
/// Panics if the thread is not attached or not suspended.
pub fn resume() {
    with_current(|ts| resume_ts(ts));
}

pub(crate) fn suspend_ts(ts: &ThreadState) {
    assert!(!ts.is_suspended(), "suspend called while already suspended");
    ts.suspended.store(true, Ordering::Relaxed);
    ts.running.store(false, Ordering::Relaxed);
    // Safety: `resume_ts` forgot the guard, so this thread holds the lock.
    unsafe { ts.inspect_lock.force_unlock() };
}

pub(crate) fn resume_ts(ts: &ThreadState) {
    assert!(ts.is_suspended(), "resume called while running");
    mem::forget(ts.inspect_lock.lock());
    ts.suspended.store(false, Ordering::Relaxed);
    ts.running.store(true, Ordering::Relaxed);
}

/// Runs `f` with the thread state suspended. The bracket every blocking
/// operation in this crate uses.
pub(crate) fn suspended<R>(f: impl FnOnce() -> R) -> R {
    struct ResumeGuard(Arc<ThreadState>);
    impl Drop for ResumeGuard {
        fn drop(&mut self) {
            resume_ts(&self.0);
        }
    }

    let ts = current();
    suspend_ts(&ts);
    let _guard = ResumeGuard(ts);
    f()
}

// === tick ===

/// The periodic safepoint, called by the evaluator at a bounded interval.
///
/// Processes promotion handshakes every call; on every `check_interval`-th
/// call it additionally yields to stop-the-world, drains pending calls,
/// delivers a posted asynchronous error, observes pending cancellation and
/// interruption (this is where compute-bound work that never blocks picks
/// them up), and runs the signal check.
///
/// # Errors
///
/// Returns the delivered asynchronous error, [`Error::cancelled`] when the
/// innermost cancel scope tripped, [`Error::interrupted`] when the
/// innermost interrupt point is marked, or the signal check's error.
pub fn tick() -> Result<(), Error> {
    let ts = current();
    assert!(!ts.is_suspended(), "tick called while suspended");

    if ts.inspect_flag.load(Ordering::Acquire) {
        // A promoting thread wants exclusive access to our owner fields:
        // cycle our inspect lock through the queue lock so it can cut in.
        // Safety: we are attached and running, so we hold the lock.
        unsafe { ts.inspect_lock.force_unlock() };
        let queue_guard = ts.inspect_queue_lock.lock();
        mem::forget(ts.inspect_lock.lock());
        drop(queue_guard);
    }

    let small = ts.small_ticks.get();
    if small > 0 {
        ts.small_ticks.set(small - 1);
        return Ok(());
    }

    // Periodic work. The suspend/resume pair is the stop-the-world yield
    // point.
    suspend_ts(&ts);
    resume_ts(&ts);

    let runtime = ts.runtime();
    runtime.run_pending_calls();

    if let Some(exc) = ts.async_exc.lock().take() {
        return Err(exc);
    }

    // Cancellation is cooperative: the safepoint is where a worker that
    // never blocks observes that its scope or interrupt point tripped.
    crate::cancel::check_cancelled()?;
    crate::interrupt::check_interrupted()?;

    let signal_check = runtime.signal_check.lock().clone();
    if let Some(check) = signal_check {
        check()?;
    }

    ts.large_ticks.set(ts.large_ticks.get() + 1);
    ts.small_ticks.set(runtime.config.check_interval);

    Ok(())
}

// === import bracketing ===

/// Marks the start of an import. Importing is only legal while the runtime
/// is single-threaded.
///
/// # Panics
///
/// Panics if other threads are attached.
pub fn enter_import() {
    with_current(|ts| {
        assert!(
            ts.runtime().is_single_threaded(),
            "importing is not thread-safe"
        );
        ts.import_depth.set(ts.import_depth.get() + 1);
    });
}

/// Marks the end of an import.
pub fn exit_import() {
    with_current(|ts| {
        let depth = ts.import_depth.get();
        assert!(depth > 0, "exit_import without matching enter_import");
        ts.import_depth.set(depth - 1);
    });
}

pub(crate) fn import_depth() -> usize {
    with_current(|ts| ts.import_depth.get())
}

// === impl EnterFrame ===

/// Handle for one [`Runtime::enter`] call. Exiting (or dropping) the
/// outermost frame detaches the thread.
#[must_use = "dropping an EnterFrame detaches immediately"]
pub struct EnterFrame {
    runtime: Arc<Runtime>,
    root: bool,
    prev_running: bool,
    exited: bool,
    _not_send: PhantomData<*mut ()>,
}

impl EnterFrame {
    /// Detaches this frame. Equivalent to dropping, but explicit at call
    /// sites that care about ordering.
    pub fn exit(mut self) {
        self.exit_inner();
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    fn exit_inner(&mut self) {
        if self.exited {
            return;
        }
        self.exited = true;

        let ts = current();
        assert!(!ts.is_suspended(), "exit called while suspended");
        assert!(ts.is_running(), "exit called in an unlocked state");

        if self.root {
            assert_eq!(ts.enter_depth.get(), 1, "exit called with wrong frame");

            let point = ts.interrupt_point().expect("root interrupt node missing");
            point.pop();

            // Safety: we hold `cancel_crit` for the check.
            ts.cancel_crit.with(|| unsafe {
                ts.with_cancel_stack(|stack| {
                    assert!(stack.is_empty(), "thread detached with live cancel scopes");
                });
            });

            // Clear owner-only state while still attached: dropping the
            // dict decrefs, which needs a live thread state.
            // Safety: owner-only field.
            let dict = mem::take(unsafe { &mut *ts.dict.get() });
            drop(dict);

            refcount::flush_current();

            // Safety: owner-only field.
            match unsafe { (*ts.monitor_stack.get()).pop() } {
                Some(MonitorFrame::Base(_)) => {}
                _ => panic!("thread detached inside a monitor space"),
            }
            assert!(
                // Safety: owner-only field.
                unsafe { (*ts.monitor_stack.get()).is_empty() },
                "thread detached inside a monitor space"
            );

            // Safety: owner-only field.
            unsafe { (*ts.alloc_cache.get()).flush() };

            suspend_ts(&ts);
            self.runtime.detach(&ts);
            tracing::debug!(thread.id = ts.id, "thread detached");
        } else {
            suspend_ts(&ts);

            // Safety: owner-only field.
            match unsafe { (*ts.monitor_stack.get()).pop() } {
                Some(MonitorFrame::Base(_)) => {}
                _ => panic!("thread exited an enter frame inside a monitor space"),
            }
            ts.enter_depth.set(ts.enter_depth.get() - 1);

            if self.prev_running {
                resume_ts(&ts);
            }
            tracing::trace!(thread.id = ts.id, depth = ts.enter_depth.get(), "exit (nested)");
        }
    }
}

impl Drop for EnterFrame {
    fn drop(&mut self) {
        if std::thread::panicking() {
            // Unwinding already; the strict state checks in exit would turn
            // the panic into an abort. Leak the attachment instead.
            self.exited = true;
            return;
        }
        self.exit_inner();
    }
}

impl fmt::Debug for EnterFrame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EnterFrame")
            .field("root", &self.root)
            .field("exited", &self.exited)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn enter_exit_roundtrip() {
        let runtime = Runtime::new();
        assert!(!attached());

        let frame = runtime.enter();
        assert!(attached());
        assert!(runtime.is_single_threaded());

        frame.exit();
        assert!(!attached());
    }

    #[test]
    fn nested_enter() {
        let runtime = Runtime::new();
        let outer = runtime.enter();
        let inner = runtime.enter();
        assert!(attached());
        inner.exit();
        assert!(attached());
        outer.exit();
        assert!(!attached());
    }

    #[test]
    fn tick_counts_periods() {
        let runtime = Runtime::with_config(Config {
            check_interval: 2,
            ..Config::default()
        });
        let frame = runtime.enter();

        let before = with_current(|ts| ts.large_ticks());
        for _ in 0..10 {
            tick().unwrap();
        }
        let after = with_current(|ts| ts.large_ticks());
        assert!(after > before);

        frame.exit();
    }

    #[test]
    fn async_exc_is_delivered_at_tick() {
        let runtime = Runtime::with_config(Config {
            check_interval: 0,
            ..Config::default()
        });
        let frame = runtime.enter();

        let id = with_current(|ts| ts.id());
        assert_eq!(runtime.set_async_exc(id, Some(Error::interrupted())), 1);

        let mut delivered = None;
        for _ in 0..4 {
            if let Err(err) = tick() {
                delivered = Some(err);
                break;
            }
        }
        assert!(delivered.unwrap().is_interrupted());

        // The slot is consumed; subsequent ticks succeed.
        tick().unwrap();

        frame.exit();
    }

    #[test]
    fn tick_observes_interrupts_and_cancellation() {
        let runtime = Runtime::with_config(Config {
            check_interval: 0,
            ..Config::default()
        });
        let frame = runtime.enter();

        let node = Interrupt::new_inline(|_| {});
        node.push();
        tick().unwrap();
        node.interrupt();
        assert!(tick().unwrap_err().is_interrupted());
        node.pop();
        tick().unwrap();

        let scope = CancelScope::new(|| {});
        scope.push();
        tick().unwrap();
        scope.cancel();
        assert!(tick().unwrap_err().is_cancelled());
        scope.pop();
        tick().unwrap();

        frame.exit();
    }

    #[test]
    fn pending_calls_run_at_tick() {
        use std::sync::atomic::AtomicBool;

        let runtime = Runtime::with_config(Config {
            check_interval: 0,
            ..Config::default()
        });
        let frame = runtime.enter();

        static RAN: AtomicBool = AtomicBool::new(false);
        runtime.add_pending_call(|| RAN.store(true, Ordering::SeqCst));
        tick().unwrap();
        assert!(RAN.load(Ordering::SeqCst));

        frame.exit();
    }

    #[test]
    fn suspend_resume_toggles() {
        let runtime = Runtime::new();
        let frame = runtime.enter();

        suspend();
        with_current(|ts| assert!(ts.is_suspended()));
        resume();
        with_current(|ts| assert!(!ts.is_suspended()));

        frame.exit();
    }

    #[test]
    fn stop_the_world_blocks_other_threads() {
        use std::sync::atomic::AtomicUsize;
        use std::time::Duration;

        let runtime = Runtime::new();
        let frame = runtime.enter();

        let beats = Arc::new(AtomicUsize::new(0));
        let stop = Arc::new(AtomicBool::new(false));

        let worker = std::thread::spawn({
            let runtime = Arc::clone(&runtime);
            let beats = Arc::clone(&beats);
            let stop = Arc::clone(&stop);
            move || {
                let frame = runtime.enter();
                while !stop.load(Ordering::SeqCst) {
                    tick().unwrap();
                    beats.fetch_add(1, Ordering::SeqCst);
                }
                frame.exit();
            }
        });

        // Wait for the worker to attach and make progress.
        while beats.load(Ordering::SeqCst) == 0 {
            std::thread::yield_now();
        }

        runtime.stop_the_world();
        let frozen = beats.load(Ordering::SeqCst);
        std::thread::sleep(Duration::from_millis(50));
        // Allow one in-flight beat between the last tick and the stop.
        assert!(beats.load(Ordering::SeqCst) <= frozen + 1);
        runtime.start_the_world();

        stop.store(true, Ordering::SeqCst);
        worker.join().unwrap();
        frame.exit();
    }

    #[test]
    #[should_panic(expected = "not thread-safe")]
    fn import_requires_single_thread() {
        let runtime = Runtime::new();
        let _frame = runtime.enter();

        let _worker = {
            let runtime = Arc::clone(&runtime);
            std::thread::spawn(move || {
                let frame = runtime.enter();
                std::thread::sleep(std::time::Duration::from_millis(200));
                frame.exit();
            })
        };

        // Give the worker time to attach.
        while runtime.is_single_threaded() {
            std::thread::yield_now();
        }
        enter_import();
    }
}
